use crate::{ScriptCall, ScriptReply, StoreResult};
use async_trait::async_trait;

/// Executes named atomic scripts against the shared store.
///
/// Implementations must run each call as a single atomic unit and must
/// surface connectivity or script failures as
/// [`StoreError::Unavailable`](crate::StoreError::Unavailable) rather than
/// swallowing them.
///
/// # Examples
///
/// ```rust
/// use mallcoord_store::{AtomicScript, AtomicScriptRunner, ScriptCall, ScriptReply, StoreResult};
/// use async_trait::async_trait;
///
/// struct AlwaysOne;
///
/// #[async_trait]
/// impl AtomicScriptRunner for AlwaysOne {
///     async fn run(&self, call: &ScriptCall) -> StoreResult<ScriptReply> {
///         call.validate()?;
///         Ok(ScriptReply::Int(1))
///     }
/// }
/// ```
#[async_trait]
pub trait AtomicScriptRunner: Send + Sync {
	async fn run(&self, call: &ScriptCall) -> StoreResult<ScriptReply>;
}

#[async_trait]
impl<R: AtomicScriptRunner + ?Sized> AtomicScriptRunner for std::sync::Arc<R> {
	async fn run(&self, call: &ScriptCall) -> StoreResult<ScriptReply> {
		(**self).run(call).await
	}
}
