//! Named, versioned atomic scripts and their typed call/reply shapes.
//!
//! Every multi-step read-modify-write sequence against the store lives in
//! exactly one of the scripts below. The Lua text is private to this crate;
//! coordination code only sees [`AtomicScript`], [`ScriptCall`] and
//! [`ScriptReply`].

use crate::{StoreError, StoreResult};
use std::fmt;

/// `SET key token NX PX lease`. Returns 1 when the key was set.
///
/// KEYS[1] - lock key
/// ARGV[1] - owner token
/// ARGV[2] - lease in milliseconds
const LOCK_ACQUIRE: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
	return 1
end
return 0
"#;

/// Deletes the key only when it still stores the caller's token.
///
/// KEYS[1] - lock key
/// ARGV[1] - owner token
const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Extends the lease only when the key still stores the caller's token.
///
/// KEYS[1] - lock key
/// ARGV[1] - owner token
/// ARGV[2] - new lease in milliseconds
const LOCK_RENEW: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// KEYS[1] - lock key
/// ARGV[1] - owner token
const LOCK_OWNED_BY: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return 1
end
return 0
"#;

/// Remaining time to live in milliseconds, -2 when absent, -1 without expiry.
const KEY_TTL: &str = r#"
return redis.call('PTTL', KEYS[1])
"#;

const KEY_DELETE: &str = r#"
return redis.call('DEL', KEYS[1])
"#;

/// Reentrant acquire on a hash of `owner -> hold count`.
/// Returns nil when acquired, otherwise the holder's remaining lease.
///
/// KEYS[1] - lock key
/// ARGV[1] - lease in milliseconds
/// ARGV[2] - owner field
const HASH_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
	redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
	return nil
end
return redis.call('PTTL', KEYS[1])
"#;

/// Decrements the owner's hold count.
/// Returns nil when not held by the owner, 0 while still held, 1 once released.
///
/// KEYS[1] - lock key
/// ARGV[1] - owner field
const HASH_RELEASE: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
	return nil
end
local counter = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if counter > 0 then
	return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// KEYS[1] - lock key
/// ARGV[1] - lease in milliseconds
/// ARGV[2] - owner field
const HASH_RENEW: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
	return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

/// KEYS[1] - lock key
/// ARGV[1] - owner field
const HASH_FIELD_HELD: &str = r#"
return redis.call('HEXISTS', KEYS[1], ARGV[1])
"#;

/// FIFO acquire. Waiters queue in a list with a per-waiter deadline in a
/// sorted set; stale waiters at the head of the queue are purged first.
/// Returns nil when acquired, otherwise a wait hint in milliseconds.
///
/// KEYS[1] - lock key
/// KEYS[2] - waiter queue
/// KEYS[3] - waiter deadlines
/// ARGV[1] - lease in milliseconds
/// ARGV[2] - owner field
/// ARGV[3] - waiter time to live in milliseconds
/// ARGV[4] - current time in milliseconds
const FAIR_ACQUIRE: &str = r#"
local now = tonumber(ARGV[4])
while true do
	local head = redis.call('LINDEX', KEYS[2], 0)
	if head == false then
		break
	end
	local deadline = tonumber(redis.call('ZSCORE', KEYS[3], head))
	if deadline ~= nil and deadline > now then
		break
	end
	redis.call('ZREM', KEYS[3], head)
	redis.call('LPOP', KEYS[2])
end
if redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
	redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
	return nil
end
if redis.call('EXISTS', KEYS[1]) == 0 then
	local head = redis.call('LINDEX', KEYS[2], 0)
	if head == false or head == ARGV[2] then
		if head == ARGV[2] then
			redis.call('LPOP', KEYS[2])
			redis.call('ZREM', KEYS[3], ARGV[2])
		end
		redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
		redis.call('PEXPIRE', KEYS[1], ARGV[1])
		return nil
	end
end
if redis.call('ZSCORE', KEYS[3], ARGV[2]) == false then
	redis.call('RPUSH', KEYS[2], ARGV[2])
end
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), ARGV[2])
redis.call('PEXPIRE', KEYS[2], ARGV[3])
redis.call('PEXPIRE', KEYS[3], ARGV[3])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
	return 0
end
return ttl
"#;

/// Removes a waiter that gave up.
///
/// KEYS[1] - waiter queue
/// KEYS[2] - waiter deadlines
/// ARGV[1] - owner field
const FAIR_CANCEL: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
return redis.call('ZREM', KEYS[2], ARGV[1])
"#;

/// Shared acquire. Readers coexist; the writer may also take read holds.
/// The key-wide lease is only ever extended by readers.
///
/// KEYS[1] - read/write lock key
/// ARGV[1] - lease in milliseconds
/// ARGV[2] - reader field
/// ARGV[3] - writer field of the same owner
const READ_ACQUIRE: &str = r#"
local mode = redis.call('HGET', KEYS[1], 'mode')
if mode == false then
	redis.call('HSET', KEYS[1], 'mode', 'read')
	redis.call('HSET', KEYS[1], ARGV[2], 1)
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
	return nil
end
if mode == 'read' or (mode == 'write' and redis.call('HEXISTS', KEYS[1], ARGV[3]) == 1) then
	redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
	if redis.call('PTTL', KEYS[1]) < tonumber(ARGV[1]) then
		redis.call('PEXPIRE', KEYS[1], ARGV[1])
	end
	return nil
end
return redis.call('PTTL', KEYS[1])
"#;

/// Exclusive acquire, reentrant for the same writer.
///
/// KEYS[1] - read/write lock key
/// ARGV[1] - lease in milliseconds
/// ARGV[2] - writer field
const WRITE_ACQUIRE: &str = r#"
local mode = redis.call('HGET', KEYS[1], 'mode')
if mode == false then
	redis.call('HSET', KEYS[1], 'mode', 'write')
	redis.call('HSET', KEYS[1], ARGV[2], 1)
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
	return nil
end
if mode == 'write' and redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
	redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
	return nil
end
return redis.call('PTTL', KEYS[1])
"#;

/// Extends a read hold's lease without shortening the key-wide lease that
/// other readers rely on.
///
/// KEYS[1] - read/write lock key
/// ARGV[1] - lease in milliseconds
/// ARGV[2] - reader field
const READ_RENEW: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[2]) == 0 then
	return 0
end
if redis.call('PTTL', KEYS[1]) < tonumber(ARGV[1]) then
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 1
"#;

/// Releases one read or write hold. Returns nil, 0 or 1 like `HASH_RELEASE`.
/// Releasing the last write hold while the writer still has read holds
/// downgrades the lock to read mode.
///
/// KEYS[1] - read/write lock key
/// ARGV[1] - reader or writer field
/// ARGV[2] - mode of the released hold, `read` or `write`
const READ_WRITE_RELEASE: &str = r#"
local mode = redis.call('HGET', KEYS[1], 'mode')
if mode == false or redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
	return nil
end
local counter = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if counter > 0 then
	return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
if redis.call('HLEN', KEYS[1]) == 1 then
	redis.call('DEL', KEYS[1])
elseif mode == 'write' and ARGV[2] == 'write' then
	redis.call('HSET', KEYS[1], 'mode', 'read')
end
return 1
"#;

/// Sliding-window check-and-record on a sorted set of request timestamps.
/// Returns `{allowed, remaining, reset_at_ms}`.
///
/// KEYS[1] - window key
/// ARGV[1] - current time in milliseconds
/// ARGV[2] - window length in milliseconds
/// ARGV[3] - permits per window
/// ARGV[4] - key time to live in seconds
/// ARGV[5] - unique member for this request
const SLIDING_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
	redis.call('ZADD', KEYS[1], now, ARGV[5])
	redis.call('EXPIRE', KEYS[1], ARGV[4])
	local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
	return {1, limit - count - 1, tonumber(oldest[2]) + window}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local reset_at = now + window
if oldest[2] then
	reset_at = tonumber(oldest[2]) + window
end
return {0, 0, reset_at}
"#;

/// Catalogue of atomic scripts understood by every [`AtomicScriptRunner`].
///
/// [`AtomicScriptRunner`]: crate::AtomicScriptRunner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicScript {
	LockAcquire,
	LockRelease,
	LockRenew,
	LockOwnedBy,
	KeyTtl,
	KeyDelete,
	HashAcquire,
	HashRelease,
	HashRenew,
	HashFieldHeld,
	FairAcquire,
	FairCancel,
	ReadAcquire,
	WriteAcquire,
	ReadRenew,
	ReadWriteRelease,
	SlidingWindow,
}

impl AtomicScript {
	pub const ALL: [AtomicScript; 17] = [
		Self::LockAcquire,
		Self::LockRelease,
		Self::LockRenew,
		Self::LockOwnedBy,
		Self::KeyTtl,
		Self::KeyDelete,
		Self::HashAcquire,
		Self::HashRelease,
		Self::HashRenew,
		Self::HashFieldHeld,
		Self::FairAcquire,
		Self::FairCancel,
		Self::ReadAcquire,
		Self::WriteAcquire,
		Self::ReadRenew,
		Self::ReadWriteRelease,
		Self::SlidingWindow,
	];

	/// Stable name used in logs and errors.
	pub fn name(self) -> &'static str {
		match self {
			Self::LockAcquire => "lock.acquire",
			Self::LockRelease => "lock.release",
			Self::LockRenew => "lock.renew",
			Self::LockOwnedBy => "lock.owned_by",
			Self::KeyTtl => "key.ttl",
			Self::KeyDelete => "key.delete",
			Self::HashAcquire => "hash_lock.acquire",
			Self::HashRelease => "hash_lock.release",
			Self::HashRenew => "hash_lock.renew",
			Self::HashFieldHeld => "hash_lock.held",
			Self::FairAcquire => "fair_lock.acquire",
			Self::FairCancel => "fair_lock.cancel",
			Self::ReadAcquire => "rw_lock.read",
			Self::WriteAcquire => "rw_lock.write",
			Self::ReadRenew => "rw_lock.renew_read",
			Self::ReadWriteRelease => "rw_lock.release",
			Self::SlidingWindow => "window.check",
		}
	}

	/// Bumped whenever the script's observable behaviour changes.
	pub fn version(self) -> u32 {
		match self {
			Self::ReadWriteRelease => 2,
			_ => 1,
		}
	}

	pub fn key_count(self) -> usize {
		match self {
			Self::FairAcquire => 3,
			Self::FairCancel => 2,
			_ => 1,
		}
	}

	pub fn arg_count(self) -> usize {
		match self {
			Self::KeyTtl | Self::KeyDelete => 0,
			Self::LockRelease
			| Self::LockOwnedBy
			| Self::HashRelease
			| Self::HashFieldHeld
			| Self::FairCancel => 1,
			Self::LockAcquire | Self::LockRenew | Self::HashAcquire | Self::HashRenew => 2,
			Self::WriteAcquire | Self::ReadRenew | Self::ReadWriteRelease => 2,
			Self::ReadAcquire => 3,
			Self::FairAcquire => 4,
			Self::SlidingWindow => 5,
		}
	}

	#[cfg_attr(not(feature = "redis-backend"), allow(dead_code))]
	pub(crate) fn source(self) -> &'static str {
		match self {
			Self::LockAcquire => LOCK_ACQUIRE,
			Self::LockRelease => LOCK_RELEASE,
			Self::LockRenew => LOCK_RENEW,
			Self::LockOwnedBy => LOCK_OWNED_BY,
			Self::KeyTtl => KEY_TTL,
			Self::KeyDelete => KEY_DELETE,
			Self::HashAcquire => HASH_ACQUIRE,
			Self::HashRelease => HASH_RELEASE,
			Self::HashRenew => HASH_RENEW,
			Self::HashFieldHeld => HASH_FIELD_HELD,
			Self::FairAcquire => FAIR_ACQUIRE,
			Self::FairCancel => FAIR_CANCEL,
			Self::ReadAcquire => READ_ACQUIRE,
			Self::WriteAcquire => WRITE_ACQUIRE,
			Self::ReadRenew => READ_RENEW,
			Self::ReadWriteRelease => READ_WRITE_RELEASE,
			Self::SlidingWindow => SLIDING_WINDOW,
		}
	}
}

impl fmt::Display for AtomicScript {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@v{}", self.name(), self.version())
	}
}

/// A single typed script argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
	Int(i64),
	Text(String),
}

impl From<i64> for ScriptArg {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

impl From<u64> for ScriptArg {
	fn from(value: u64) -> Self {
		Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
	}
}

impl From<u32> for ScriptArg {
	fn from(value: u32) -> Self {
		Self::Int(i64::from(value))
	}
}

impl From<&str> for ScriptArg {
	fn from(value: &str) -> Self {
		Self::Text(value.to_string())
	}
}

impl From<String> for ScriptArg {
	fn from(value: String) -> Self {
		Self::Text(value)
	}
}

impl fmt::Display for ScriptArg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Int(value) => write!(f, "{value}"),
			Self::Text(value) => f.write_str(value),
		}
	}
}

/// A script invocation with its key list and argument list.
///
/// # Examples
///
/// ```
/// use mallcoord_store::{AtomicScript, ScriptCall};
///
/// let call = ScriptCall::new(AtomicScript::LockRelease)
///     .key("lock:order:42")
///     .arg("token-1");
/// assert!(call.validate().is_ok());
/// assert_eq!(call.keys(), ["lock:order:42".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCall {
	script: AtomicScript,
	keys: Vec<String>,
	args: Vec<ScriptArg>,
}

impl ScriptCall {
	pub fn new(script: AtomicScript) -> Self {
		Self {
			script,
			keys: Vec::with_capacity(script.key_count()),
			args: Vec::with_capacity(script.arg_count()),
		}
	}

	pub fn key(mut self, key: impl Into<String>) -> Self {
		self.keys.push(key.into());
		self
	}

	pub fn arg(mut self, arg: impl Into<ScriptArg>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn script(&self) -> AtomicScript {
		self.script
	}

	pub fn keys(&self) -> &[String] {
		&self.keys
	}

	pub fn args(&self) -> &[ScriptArg] {
		&self.args
	}

	/// Checks the key and argument counts against the script declaration.
	///
	/// # Errors
	///
	/// Returns [`StoreError::InvalidCall`] on a mismatch.
	pub fn validate(&self) -> StoreResult<()> {
		let script = self.script;
		if self.keys.len() != script.key_count() {
			return Err(StoreError::InvalidCall {
				script: script.name(),
				message: format!(
					"expected {} keys, got {}",
					script.key_count(),
					self.keys.len()
				),
			});
		}
		if self.args.len() != script.arg_count() {
			return Err(StoreError::InvalidCall {
				script: script.name(),
				message: format!(
					"expected {} arguments, got {}",
					script.arg_count(),
					self.args.len()
				),
			});
		}
		Ok(())
	}

	pub(crate) fn key_at(&self, index: usize) -> &str {
		&self.keys[index]
	}

	/// Reads argument `index` as an integer, accepting numeric text.
	pub(crate) fn int_arg(&self, index: usize) -> StoreResult<i64> {
		match &self.args[index] {
			ScriptArg::Int(value) => Ok(*value),
			ScriptArg::Text(text) => text.parse().map_err(|_| StoreError::InvalidCall {
				script: self.script.name(),
				message: format!("argument {} is not an integer: {text}", index + 1),
			}),
		}
	}

	pub(crate) fn text_arg(&self, index: usize) -> String {
		self.args[index].to_string()
	}
}

/// Typed reply of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
	Nil,
	Int(i64),
	Text(String),
	List(Vec<ScriptReply>),
}

impl ScriptReply {
	fn unexpected(&self, script: AtomicScript) -> StoreError {
		StoreError::UnexpectedReply {
			script: script.name(),
			reply: format!("{self:?}"),
		}
	}

	/// # Errors
	///
	/// Returns [`StoreError::UnexpectedReply`] unless the reply is an integer.
	pub fn into_int(self, script: AtomicScript) -> StoreResult<i64> {
		match self {
			Self::Int(value) => Ok(value),
			Self::Text(ref text) => text.parse().map_err(|_| self.unexpected(script)),
			other => Err(other.unexpected(script)),
		}
	}

	/// Like [`ScriptReply::into_int`] but maps `Nil` to `None`.
	///
	/// # Errors
	///
	/// Returns [`StoreError::UnexpectedReply`] for lists.
	pub fn into_opt_int(self, script: AtomicScript) -> StoreResult<Option<i64>> {
		match self {
			Self::Nil => Ok(None),
			other => other.into_int(script).map(Some),
		}
	}

	/// # Errors
	///
	/// Returns [`StoreError::UnexpectedReply`] unless the reply is a list.
	pub fn into_list(self, script: AtomicScript) -> StoreResult<Vec<ScriptReply>> {
		match self {
			Self::List(items) => Ok(items),
			other => Err(other.unexpected(script)),
		}
	}
}
