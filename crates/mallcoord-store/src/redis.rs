//! Redis-backed script runner

use crate::{
	AtomicScript, AtomicScriptRunner, ScriptArg, ScriptCall, ScriptReply, StoreError, StoreResult,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script, Value};
use std::collections::HashMap;

/// Runs atomic scripts on a Redis server.
///
/// Scripts are sent with `EVALSHA`; the client falls back to `EVAL` and
/// caches the script when the server answers `NOSCRIPT`.
///
/// # Examples
///
/// ```no_run
/// use mallcoord_store::RedisScriptRunner;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runner = RedisScriptRunner::new("redis://127.0.0.1:6379/").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisScriptRunner {
	connection: ConnectionManager,
	scripts: HashMap<AtomicScript, Script>,
}

impl RedisScriptRunner {
	/// Connect to Redis and prepare every script.
	///
	/// # Errors
	///
	/// Returns the client error when the URL is malformed or the initial
	/// connection fails.
	pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
		let client = redis::Client::open(redis_url)?;
		let connection = ConnectionManager::new(client).await?;
		tracing::info!("RedisScriptRunner connected");
		Ok(Self::with_connection(connection))
	}

	/// Wrap an existing connection manager.
	pub fn with_connection(connection: ConnectionManager) -> Self {
		let scripts = AtomicScript::ALL
			.into_iter()
			.map(|script| (script, Script::new(script.source())))
			.collect();
		Self {
			connection,
			scripts,
		}
	}
}

fn into_reply(script: AtomicScript, value: Value) -> StoreResult<ScriptReply> {
	match value {
		Value::Nil => Ok(ScriptReply::Nil),
		Value::Int(value) => Ok(ScriptReply::Int(value)),
		Value::Boolean(value) => Ok(ScriptReply::Int(i64::from(value))),
		Value::Okay => Ok(ScriptReply::Text("OK".to_string())),
		Value::SimpleString(text) => Ok(ScriptReply::Text(text)),
		Value::BulkString(bytes) => Ok(ScriptReply::Text(
			String::from_utf8_lossy(&bytes).into_owned(),
		)),
		Value::Array(items) => items
			.into_iter()
			.map(|item| into_reply(script, item))
			.collect::<StoreResult<Vec<_>>>()
			.map(ScriptReply::List),
		other => Err(StoreError::UnexpectedReply {
			script: script.name(),
			reply: format!("{other:?}"),
		}),
	}
}

#[async_trait]
impl AtomicScriptRunner for RedisScriptRunner {
	async fn run(&self, call: &ScriptCall) -> StoreResult<ScriptReply> {
		call.validate()?;
		let script = call.script();
		let source = self
			.scripts
			.get(&script)
			.ok_or_else(|| StoreError::InvalidCall {
				script: script.name(),
				message: "script not registered".to_string(),
			})?;

		let mut invocation = source.prepare_invoke();
		for key in call.keys() {
			invocation.key(key.as_str());
		}
		for arg in call.args() {
			match arg {
				ScriptArg::Int(value) => invocation.arg(*value),
				ScriptArg::Text(value) => invocation.arg(value.as_str()),
			};
		}

		let mut conn = self.connection.clone();
		let value: Value = invocation.invoke_async(&mut conn).await.map_err(|e| {
			tracing::error!(error = %e, script = %script, "Atomic script failed");
			StoreError::unavailable(script.name(), e.to_string())
		})?;
		into_reply(script, value)
	}
}
