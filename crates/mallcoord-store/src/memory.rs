//! In-process emulation of the coordination store.
//!
//! `MemoryScriptRunner` implements every [`AtomicScript`] natively under a
//! single mutex, so each call is atomic exactly like a server-side script.
//! Key expiry follows the injected [`Clock`], which lets tests move time
//! forward instead of sleeping.

use crate::clock::{Clock, SystemClock};
use crate::{AtomicScript, AtomicScriptRunner, ScriptCall, ScriptReply, StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Script calls between two full sweeps of expired keys.
const SWEEP_INTERVAL: u64 = 256;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
	Text(String),
	Hash(BTreeMap<String, String>),
	List(VecDeque<String>),
	SortedSet(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
	value: Value,
	expires_at: Option<u64>,
}

/// Keyspace view pinned to one instant.
struct Keyspace<'a> {
	entries: &'a mut HashMap<String, Entry>,
	now: u64,
}

impl Keyspace<'_> {
	fn entry(&mut self, key: &str) -> Option<&mut Entry> {
		let now = self.now;
		if self
			.entries
			.get(key)
			.and_then(|entry| entry.expires_at)
			.is_some_and(|deadline| deadline <= now)
		{
			self.entries.remove(key);
		}
		self.entries.get_mut(key)
	}

	/// Drops every expired key. Returns how many were removed.
	fn sweep(&mut self) -> usize {
		let now = self.now;
		let before = self.entries.len();
		self.entries
			.retain(|_, entry| entry.expires_at.is_none_or(|deadline| deadline > now));
		before - self.entries.len()
	}

	fn exists(&mut self, key: &str) -> bool {
		self.entry(key).is_some()
	}

	fn del(&mut self, key: &str) -> i64 {
		if self.exists(key) {
			self.entries.remove(key);
			1
		} else {
			0
		}
	}

	fn pttl(&mut self, key: &str) -> i64 {
		let now = self.now;
		match self.entry(key) {
			None => -2,
			Some(Entry {
				expires_at: None, ..
			}) => -1,
			Some(Entry {
				expires_at: Some(deadline),
				..
			}) => i64::try_from(deadline.saturating_sub(now)).unwrap_or(i64::MAX),
		}
	}

	fn pexpire(&mut self, key: &str, millis: i64) -> i64 {
		if millis <= 0 {
			return self.del(key);
		}
		let deadline = self.now.saturating_add(millis.unsigned_abs());
		match self.entry(key) {
			Some(entry) => {
				entry.expires_at = Some(deadline);
				1
			}
			None => 0,
		}
	}

	fn get_text(&mut self, key: &str) -> Result<Option<String>, String> {
		match self.entry(key) {
			None => Ok(None),
			Some(Entry {
				value: Value::Text(text),
				..
			}) => Ok(Some(text.clone())),
			Some(_) => Err(WRONG_TYPE.to_string()),
		}
	}

	fn set_nx(&mut self, key: &str, value: String, ttl_millis: i64) -> bool {
		if self.exists(key) {
			return false;
		}
		self.entries.insert(
			key.to_string(),
			Entry {
				value: Value::Text(value),
				expires_at: Some(self.now.saturating_add(ttl_millis.max(1).unsigned_abs())),
			},
		);
		true
	}

	fn hash(&mut self, key: &str) -> Result<Option<&mut BTreeMap<String, String>>, String> {
		match self.entry(key) {
			None => Ok(None),
			Some(Entry {
				value: Value::Hash(map),
				..
			}) => Ok(Some(map)),
			Some(_) => Err(WRONG_TYPE.to_string()),
		}
	}

	fn hash_or_create(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>, String> {
		if !self.exists(key) {
			self.entries.insert(
				key.to_string(),
				Entry {
					value: Value::Hash(BTreeMap::new()),
					expires_at: None,
				},
			);
		}
		self.hash(key)?.ok_or_else(|| WRONG_TYPE.to_string())
	}

	fn hexists(&mut self, key: &str, field: &str) -> Result<bool, String> {
		Ok(self.hash(key)?.is_some_and(|map| map.contains_key(field)))
	}

	fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, String> {
		Ok(self.hash(key)?.and_then(|map| map.get(field).cloned()))
	}

	fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), String> {
		self.hash_or_create(key)?
			.insert(field.to_string(), value.to_string());
		Ok(())
	}

	fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, String> {
		let map = self.hash_or_create(key)?;
		let current = match map.get(field) {
			Some(raw) => raw
				.parse::<i64>()
				.map_err(|_| "ERR hash value is not an integer".to_string())?,
			None => 0,
		};
		let next = current + delta;
		map.insert(field.to_string(), next.to_string());
		Ok(next)
	}

	fn hdel(&mut self, key: &str, field: &str) -> Result<(), String> {
		let emptied = match self.hash(key)? {
			Some(map) => {
				map.remove(field);
				map.is_empty()
			}
			None => false,
		};
		if emptied {
			self.entries.remove(key);
		}
		Ok(())
	}

	fn hlen(&mut self, key: &str) -> Result<usize, String> {
		Ok(self.hash(key)?.map_or(0, |map| map.len()))
	}

	fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, String> {
		match self.entry(key) {
			None => Ok(None),
			Some(Entry {
				value: Value::List(list),
				..
			}) => Ok(Some(list)),
			Some(_) => Err(WRONG_TYPE.to_string()),
		}
	}

	fn lindex_head(&mut self, key: &str) -> Result<Option<String>, String> {
		Ok(self.list(key)?.and_then(|list| list.front().cloned()))
	}

	fn lpop(&mut self, key: &str) -> Result<(), String> {
		let emptied = match self.list(key)? {
			Some(list) => {
				list.pop_front();
				list.is_empty()
			}
			None => false,
		};
		if emptied {
			self.entries.remove(key);
		}
		Ok(())
	}

	fn rpush(&mut self, key: &str, value: &str) -> Result<(), String> {
		if !self.exists(key) {
			self.entries.insert(
				key.to_string(),
				Entry {
					value: Value::List(VecDeque::new()),
					expires_at: None,
				},
			);
		}
		if let Some(list) = self.list(key)? {
			list.push_back(value.to_string());
		}
		Ok(())
	}

	fn lrem(&mut self, key: &str, value: &str) -> Result<(), String> {
		let emptied = match self.list(key)? {
			Some(list) => {
				list.retain(|item| item != value);
				list.is_empty()
			}
			None => false,
		};
		if emptied {
			self.entries.remove(key);
		}
		Ok(())
	}

	fn zset(&mut self, key: &str) -> Result<Option<&mut Vec<(i64, String)>>, String> {
		match self.entry(key) {
			None => Ok(None),
			Some(Entry {
				value: Value::SortedSet(set),
				..
			}) => Ok(Some(set)),
			Some(_) => Err(WRONG_TYPE.to_string()),
		}
	}

	fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<(), String> {
		if !self.exists(key) {
			self.entries.insert(
				key.to_string(),
				Entry {
					value: Value::SortedSet(Vec::new()),
					expires_at: None,
				},
			);
		}
		if let Some(set) = self.zset(key)? {
			set.retain(|(_, existing)| existing != member);
			set.push((score, member.to_string()));
			set.sort();
		}
		Ok(())
	}

	fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, String> {
		Ok(self.zset(key)?.and_then(|set| {
			set.iter()
				.find(|(_, existing)| existing == member)
				.map(|(score, _)| *score)
		}))
	}

	fn zrem(&mut self, key: &str, member: &str) -> Result<i64, String> {
		let (removed, emptied) = match self.zset(key)? {
			Some(set) => {
				let before = set.len();
				set.retain(|(_, existing)| existing != member);
				(before - set.len(), set.is_empty())
			}
			None => (0, false),
		};
		if emptied {
			self.entries.remove(key);
		}
		Ok(i64::try_from(removed).unwrap_or(i64::MAX))
	}

	/// Removes members with a score at or below `max_score`.
	fn zremrangebyscore(&mut self, key: &str, max_score: i64) -> Result<(), String> {
		let emptied = match self.zset(key)? {
			Some(set) => {
				set.retain(|(score, _)| *score > max_score);
				set.is_empty()
			}
			None => false,
		};
		if emptied {
			self.entries.remove(key);
		}
		Ok(())
	}

	fn zcard(&mut self, key: &str) -> Result<i64, String> {
		Ok(self
			.zset(key)?
			.map_or(0, |set| i64::try_from(set.len()).unwrap_or(i64::MAX)))
	}

	fn zfirst_score(&mut self, key: &str) -> Result<Option<i64>, String> {
		Ok(self
			.zset(key)?
			.and_then(|set| set.first().map(|(score, _)| *score)))
	}
}

fn flag(value: bool) -> ScriptReply {
	ScriptReply::Int(i64::from(value))
}

fn nil_or_ttl(acquired: bool, ttl: i64) -> ScriptReply {
	if acquired {
		ScriptReply::Nil
	} else {
		ScriptReply::Int(ttl)
	}
}

/// Store emulation used by tests and single-process deployments.
///
/// Clones share the same keyspace. Expired keys are dropped when next
/// touched and by a full sweep every few hundred calls, so the keyspace
/// stays bounded by the number of live keys.
///
/// # Examples
///
/// ```
/// use mallcoord_store::{AtomicScript, AtomicScriptRunner, MemoryScriptRunner, ScriptCall, ScriptReply};
///
/// # async fn example() -> mallcoord_store::StoreResult<()> {
/// let runner = MemoryScriptRunner::new();
/// let call = ScriptCall::new(AtomicScript::LockAcquire)
///     .key("lock:order:42")
///     .arg("token-a")
///     .arg(10_000_i64);
/// assert_eq!(runner.run(&call).await?, ScriptReply::Int(1));
/// assert!(runner.contains_key("lock:order:42"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryScriptRunner<C: Clock = SystemClock> {
	entries: Arc<Mutex<HashMap<String, Entry>>>,
	clock: Arc<C>,
	unavailable: Arc<AtomicBool>,
	calls: Arc<AtomicU64>,
}

impl MemoryScriptRunner<SystemClock> {
	pub fn new() -> Self {
		Self::with_clock(Arc::new(SystemClock::new()))
	}
}

impl Default for MemoryScriptRunner<SystemClock> {
	fn default() -> Self {
		Self::new()
	}
}

impl<C: Clock> MemoryScriptRunner<C> {
	/// Create a runner whose key expiry follows a custom clock
	pub fn with_clock(clock: Arc<C>) -> Self {
		Self {
			entries: Arc::new(Mutex::new(HashMap::new())),
			clock,
			unavailable: Arc::new(AtomicBool::new(false)),
			calls: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Simulate an unreachable store; every call fails until reset.
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	/// Whether `key` currently exists (expired keys are absent).
	pub fn contains_key(&self, key: &str) -> bool {
		let mut entries = self.entries.lock();
		Keyspace {
			entries: &mut *entries,
			now: self.clock.now_millis(),
		}
		.exists(key)
	}

	/// Remaining lease of `key` in milliseconds, with `PTTL` conventions.
	pub fn pttl(&self, key: &str) -> i64 {
		let mut entries = self.entries.lock();
		Keyspace {
			entries: &mut *entries,
			now: self.clock.now_millis(),
		}
		.pttl(key)
	}

	/// Drop every expired key now. Returns how many were removed.
	pub fn purge_expired(&self) -> usize {
		let mut entries = self.entries.lock();
		Keyspace {
			entries: &mut *entries,
			now: self.clock.now_millis(),
		}
		.sweep()
	}

	fn execute(&self, call: &ScriptCall) -> Result<ScriptReply, String> {
		let mut entries = self.entries.lock();
		let mut ks = Keyspace {
			entries: &mut *entries,
			now: self.clock.now_millis(),
		};
		if self.calls.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
			ks.sweep();
		}
		let int = |index| call.int_arg(index).map_err(|e| e.to_string());
		let key = call.key_at(0);

		let reply = match call.script() {
			AtomicScript::LockAcquire => flag(ks.set_nx(key, call.text_arg(0), int(1)?)),
			AtomicScript::LockRelease => {
				if ks.get_text(key)?.as_deref() == Some(call.text_arg(0).as_str()) {
					ScriptReply::Int(ks.del(key))
				} else {
					ScriptReply::Int(0)
				}
			}
			AtomicScript::LockRenew => {
				if ks.get_text(key)?.as_deref() == Some(call.text_arg(0).as_str()) {
					ScriptReply::Int(ks.pexpire(key, int(1)?))
				} else {
					ScriptReply::Int(0)
				}
			}
			AtomicScript::LockOwnedBy => {
				flag(ks.get_text(key)?.as_deref() == Some(call.text_arg(0).as_str()))
			}
			AtomicScript::KeyTtl => ScriptReply::Int(ks.pttl(key)),
			AtomicScript::KeyDelete => ScriptReply::Int(ks.del(key)),
			AtomicScript::HashAcquire => {
				let field = call.text_arg(1);
				let acquired = !ks.exists(key) || ks.hexists(key, &field)?;
				if acquired {
					ks.hincrby(key, &field, 1)?;
					ks.pexpire(key, int(0)?);
				}
				nil_or_ttl(acquired, ks.pttl(key))
			}
			AtomicScript::HashRelease => {
				let field = call.text_arg(0);
				if !ks.hexists(key, &field)? {
					ScriptReply::Nil
				} else if ks.hincrby(key, &field, -1)? > 0 {
					ScriptReply::Int(0)
				} else {
					ks.del(key);
					ScriptReply::Int(1)
				}
			}
			AtomicScript::HashRenew => {
				if ks.hexists(key, &call.text_arg(1))? {
					ScriptReply::Int(ks.pexpire(key, int(0)?))
				} else {
					ScriptReply::Int(0)
				}
			}
			AtomicScript::HashFieldHeld => flag(ks.hexists(key, &call.text_arg(0))?),
			AtomicScript::FairAcquire => Self::fair_acquire(&mut ks, call)?,
			AtomicScript::FairCancel => {
				let field = call.text_arg(0);
				ks.lrem(call.key_at(0), &field)?;
				ScriptReply::Int(ks.zrem(call.key_at(1), &field)?)
			}
			AtomicScript::ReadAcquire => {
				let (reader, writer) = (call.text_arg(1), call.text_arg(2));
				let lease = int(0)?;
				match ks.hget(key, "mode")?.as_deref() {
					None => {
						ks.hset(key, "mode", "read")?;
						ks.hset(key, &reader, "1")?;
						ks.pexpire(key, lease);
						ScriptReply::Nil
					}
					Some(mode) if mode == "read" || (mode == "write" && ks.hexists(key, &writer)?) => {
						ks.hincrby(key, &reader, 1)?;
						if ks.pttl(key) < lease {
							ks.pexpire(key, lease);
						}
						ScriptReply::Nil
					}
					Some(_) => ScriptReply::Int(ks.pttl(key)),
				}
			}
			AtomicScript::WriteAcquire => {
				let writer = call.text_arg(1);
				let lease = int(0)?;
				match ks.hget(key, "mode")?.as_deref() {
					None => {
						ks.hset(key, "mode", "write")?;
						ks.hset(key, &writer, "1")?;
						ks.pexpire(key, lease);
						ScriptReply::Nil
					}
					Some("write") if ks.hexists(key, &writer)? => {
						ks.hincrby(key, &writer, 1)?;
						ks.pexpire(key, lease);
						ScriptReply::Nil
					}
					Some(_) => ScriptReply::Int(ks.pttl(key)),
				}
			}
			AtomicScript::ReadRenew => {
				let lease = int(0)?;
				if ks.hexists(key, &call.text_arg(1))? {
					if ks.pttl(key) < lease {
						ks.pexpire(key, lease);
					}
					ScriptReply::Int(1)
				} else {
					ScriptReply::Int(0)
				}
			}
			AtomicScript::ReadWriteRelease => {
				let field = call.text_arg(0);
				let released_mode = call.text_arg(1);
				let mode = ks.hget(key, "mode")?;
				match mode {
					Some(mode) if ks.hexists(key, &field)? => {
						if ks.hincrby(key, &field, -1)? > 0 {
							ScriptReply::Int(0)
						} else {
							ks.hdel(key, &field)?;
							if ks.hlen(key)? == 1 {
								ks.del(key);
							} else if mode == "write" && released_mode == "write" {
								ks.hset(key, "mode", "read")?;
							}
							ScriptReply::Int(1)
						}
					}
					_ => ScriptReply::Nil,
				}
			}
			AtomicScript::SlidingWindow => {
				let (now, window, limit) = (int(0)?, int(1)?, int(2)?);
				let ttl_secs = int(3)?;
				ks.zremrangebyscore(key, now - window)?;
				let count = ks.zcard(key)?;
				if count < limit {
					ks.zadd(key, now, &call.text_arg(4))?;
					ks.pexpire(key, ttl_secs.saturating_mul(1000));
					let oldest = ks.zfirst_score(key)?.unwrap_or(now);
					ScriptReply::List(vec![
						ScriptReply::Int(1),
						ScriptReply::Int(limit - count - 1),
						ScriptReply::Int(oldest + window),
					])
				} else {
					let reset_at = ks
						.zfirst_score(key)?
						.map_or(now + window, |oldest| oldest + window);
					ScriptReply::List(vec![
						ScriptReply::Int(0),
						ScriptReply::Int(0),
						ScriptReply::Int(reset_at),
					])
				}
			}
		};
		Ok(reply)
	}

	fn fair_acquire(ks: &mut Keyspace<'_>, call: &ScriptCall) -> Result<ScriptReply, String> {
		let int = |index| call.int_arg(index).map_err(|e| e.to_string());
		let (lock_key, queue_key, timeout_key) = (call.key_at(0), call.key_at(1), call.key_at(2));
		let lease = int(0)?;
		let field = call.text_arg(1);
		let waiter_ttl = int(2)?;
		let now = int(3)?;

		while let Some(head) = ks.lindex_head(queue_key)? {
			if ks.zscore(timeout_key, &head)?.is_some_and(|deadline| deadline > now) {
				break;
			}
			ks.zrem(timeout_key, &head)?;
			ks.lpop(queue_key)?;
		}

		if ks.hexists(lock_key, &field)? {
			ks.hincrby(lock_key, &field, 1)?;
			ks.pexpire(lock_key, lease);
			return Ok(ScriptReply::Nil);
		}

		if !ks.exists(lock_key) {
			let head = ks.lindex_head(queue_key)?;
			if head.is_none() || head.as_deref() == Some(field.as_str()) {
				if head.is_some() {
					ks.lpop(queue_key)?;
					ks.zrem(timeout_key, &field)?;
				}
				ks.hincrby(lock_key, &field, 1)?;
				ks.pexpire(lock_key, lease);
				return Ok(ScriptReply::Nil);
			}
		}

		if ks.zscore(timeout_key, &field)?.is_none() {
			ks.rpush(queue_key, &field)?;
		}
		ks.zadd(timeout_key, now + waiter_ttl, &field)?;
		ks.pexpire(queue_key, waiter_ttl);
		ks.pexpire(timeout_key, waiter_ttl);
		Ok(ScriptReply::Int(ks.pttl(lock_key).max(0)))
	}
}

#[async_trait]
impl<C: Clock + 'static> AtomicScriptRunner for MemoryScriptRunner<C> {
	async fn run(&self, call: &ScriptCall) -> StoreResult<ScriptReply> {
		call.validate()?;
		let name = call.script().name();
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(StoreError::unavailable(name, "connection refused"));
		}
		self.execute(call)
			.map_err(|message| StoreError::unavailable(name, message))
	}
}
