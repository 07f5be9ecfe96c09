//! Background lease renewal for advanced locks acquired without an explicit
//! lease.

use crate::config::{deadline_after, lease_millis};
use mallcoord_store::{AtomicScript, AtomicScriptRunner, ScriptCall};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Consecutive failed renewals after which the lease is left to lapse.
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Registry of renewal tasks, one per `(store key, owner field)`.
#[derive(Clone, Default)]
pub(crate) struct Watchdog {
	tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

fn slot(store_key: &str, field: &str) -> String {
	format!("{store_key}|{field}")
}

impl Watchdog {
	/// Start renewing `field` on `store_key` every third of `lease` with
	/// `script`, which takes the lease and the field as arguments.
	///
	/// A no-op when a live task already covers the slot, which is the case
	/// for reentrant acquisitions. Renewal stops once ownership is lost or
	/// after [`MAX_RENEWAL_FAILURES`] store errors in a row.
	pub(crate) fn start(
		&self,
		runner: Arc<dyn AtomicScriptRunner>,
		script: AtomicScript,
		store_key: &str,
		field: &str,
		lease: Duration,
	) {
		let slot = slot(store_key, field);
		let mut tasks = self.tasks.lock();
		if tasks.get(&slot).is_some_and(|task| !task.is_finished()) {
			return;
		}

		let period = (lease / 3).max(Duration::from_millis(1));
		let call = ScriptCall::new(script)
			.key(store_key)
			.arg(lease_millis(lease))
			.arg(field);
		let key = store_key.to_string();
		tracing::debug!(key = %key, period_ms = period.as_millis() as u64, "Watchdog started");
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(deadline_after(period), period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			let mut failures = 0;
			loop {
				ticker.tick().await;
				match runner
					.run(&call)
					.await
					.and_then(|reply| reply.into_int(script))
				{
					Ok(1) => {
						failures = 0;
						tracing::trace!(key = %key, "Watchdog renewed lease");
					}
					Ok(_) => {
						tracing::warn!(key = %key, "Watchdog lost lock ownership; renewal stopped");
						return;
					}
					Err(e) if failures + 1 >= MAX_RENEWAL_FAILURES => {
						tracing::error!(error = %e, key = %key, "Watchdog giving up after repeated renewal failures; lease will lapse");
						return;
					}
					Err(e) => {
						failures += 1;
						tracing::warn!(error = %e, key = %key, failures, "Watchdog renewal failed; retrying");
					}
				}
			}
		});
		tasks.insert(slot, task);
	}

	pub(crate) fn stop(&self, store_key: &str, field: &str) {
		if let Some(task) = self.tasks.lock().remove(&slot(store_key, field)) {
			task.abort();
			tracing::debug!(key = %store_key, "Watchdog stopped");
		}
	}

	pub(crate) fn is_active(&self, store_key: &str, field: &str) -> bool {
		self.tasks
			.lock()
			.get(&slot(store_key, field))
			.is_some_and(|task| !task.is_finished())
	}

	/// Number of live renewal tasks; finished ones are pruned.
	pub(crate) fn active_count(&self) -> usize {
		let mut tasks = self.tasks.lock();
		tasks.retain(|_, task| !task.is_finished());
		tasks.len()
	}

	pub(crate) fn shutdown(&self) {
		for (_, task) in self.tasks.lock().drain() {
			task.abort();
		}
	}
}
