// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Change notification.
//!
//! Each refresh that changes the cache produces one [`DiffCache`], delivered
//! to every registered [`Notifier`] on its own task so a slow sink never
//! holds up the refresh loop or its siblings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vane_flags_core::DiffCache;

use crate::error::Result;

/// Receives the set of flags changed by a refresh.
#[async_trait]
pub trait Notifier: Send + Sync {
	fn name(&self) -> &str;

	async fn notify(&self, diff: &DiffCache) -> Result<()>;
}

/// Logs every changed flag at `info`.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
	fn name(&self) -> &str {
		"log"
	}

	async fn notify(&self, diff: &DiffCache) -> Result<()> {
		for key in diff.added.keys() {
			info!(flag_key = %key, "Flag added");
		}
		for key in diff.deleted.keys() {
			info!(flag_key = %key, "Flag deleted");
		}
		for (key, change) in &diff.updated {
			if change.before.disable != change.after.disable {
				info!(flag_key = %key, disabled = change.after.disable, "Flag toggled");
			} else {
				info!(flag_key = %key, "Flag updated");
			}
		}
		Ok(())
	}
}

/// Fans a diff out to the registered notifiers.
pub struct NotificationService {
	notifiers: Vec<Arc<dyn Notifier>>,
	in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationService {
	pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
		Self {
			notifiers,
			in_flight: Mutex::new(Vec::new()),
		}
	}

	pub fn len(&self) -> usize {
		self.notifiers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.notifiers.is_empty()
	}

	/// Dispatches `diff` without waiting for delivery. Empty diffs are ignored.
	pub fn notify(&self, diff: DiffCache) {
		if diff.is_empty() || self.notifiers.is_empty() {
			return;
		}

		debug!(
			added = diff.added.len(),
			deleted = diff.deleted.len(),
			updated = diff.updated.len(),
			"Dispatching flag changes"
		);

		let diff = Arc::new(diff);
		let mut in_flight = self.in_flight.lock();
		in_flight.retain(|handle| !handle.is_finished());

		for notifier in &self.notifiers {
			let notifier = Arc::clone(notifier);
			let diff = Arc::clone(&diff);
			in_flight.push(tokio::spawn(async move {
				if let Err(e) = notifier.notify(&diff).await {
					warn!(notifier = %notifier.name(), error = %e, "Notifier failed");
				}
			}));
		}
	}

	/// Waits up to `timeout` for pending deliveries, then aborts the rest.
	pub async fn close(&self, timeout: Duration) {
		let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
		if handles.is_empty() {
			return;
		}

		let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
		if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
			warn!(
				pending = aborts.len(),
				"Timed out waiting for notifiers, aborting"
			);
			for abort in aborts {
				abort.abort();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ClientError;
	use serde_json::json;
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use vane_flags_core::{Flag, Rule, Snapshot};

	struct CountingNotifier {
		calls: AtomicUsize,
		changed: AtomicUsize,
	}

	impl CountingNotifier {
		fn new() -> Self {
			Self {
				calls: AtomicUsize::new(0),
				changed: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl Notifier for CountingNotifier {
		fn name(&self) -> &str {
			"counting"
		}

		async fn notify(&self, diff: &DiffCache) -> Result<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.changed.fetch_add(diff.len(), Ordering::SeqCst);
			Ok(())
		}
	}

	struct FailingNotifier;

	#[async_trait]
	impl Notifier for FailingNotifier {
		fn name(&self) -> &str {
			"failing"
		}

		async fn notify(&self, _diff: &DiffCache) -> Result<()> {
			Err(ClientError::notifier("failing", "sink unavailable"))
		}
	}

	struct SlowNotifier;

	#[async_trait]
	impl Notifier for SlowNotifier {
		fn name(&self) -> &str {
			"slow"
		}

		async fn notify(&self, _diff: &DiffCache) -> Result<()> {
			tokio::time::sleep(Duration::from_secs(3600)).await;
			Ok(())
		}
	}

	fn sample_diff() -> DiffCache {
		let flag = Flag::new()
			.with_variation("on", json!(true))
			.with_default_rule(Rule::fixed("on"));
		let mut flags = HashMap::new();
		flags.insert("banner".to_string(), flag);
		DiffCache::compute(&Snapshot::empty(), &Snapshot::new(flags))
	}

	#[tokio::test]
	async fn test_every_notifier_receives_diff() {
		let a = Arc::new(CountingNotifier::new());
		let b = Arc::new(CountingNotifier::new());
		let service = NotificationService::new(vec![
			a.clone(),
			Arc::new(FailingNotifier),
			b.clone(),
			Arc::new(LogNotifier),
		]);

		service.notify(sample_diff());
		service.close(Duration::from_secs(1)).await;

		assert_eq!(a.calls.load(Ordering::SeqCst), 1);
		assert_eq!(b.calls.load(Ordering::SeqCst), 1);
		assert_eq!(a.changed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_empty_diff_is_not_dispatched() {
		let notifier = Arc::new(CountingNotifier::new());
		let service = NotificationService::new(vec![notifier.clone()]);

		service.notify(DiffCache::default());
		service.close(Duration::from_secs(1)).await;

		assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_close_aborts_slow_notifiers() {
		let service = NotificationService::new(vec![Arc::new(SlowNotifier)]);
		service.notify(sample_diff());

		let started = std::time::Instant::now();
		service.close(Duration::from_millis(50)).await;
		assert!(started.elapsed() < Duration::from_secs(5));
	}
}
