// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background refresh of the flag cache.
//!
//! One synchronous load happens in [`RefreshScheduler::start`], then a spawned
//! task polls the retrievers on a fixed interval. Every refresh, periodic or
//! forced, goes through one async mutex so concurrent requests collapse into
//! the refresh already in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use vane_flags_core::{DiffCache, Snapshot};

use crate::cache::{CacheState, FlagCache};
use crate::error::{ClientError, Result};
use crate::notifier::NotificationService;
use crate::retriever::RetrieverManager;

/// Upper bound of the random delay added to each polling interval, as a
/// fraction of the interval.
const JITTER_FRACTION: u64 = 10;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
	pub polling_interval: Duration,
	pub enable_polling_jitter: bool,
	/// Serve an empty cache instead of failing when the first load fails.
	pub start_with_retriever_error: bool,
	pub shutdown_timeout: Duration,
}

impl Default for RefreshSettings {
	fn default() -> Self {
		Self {
			polling_interval: Duration::from_secs(60),
			enable_polling_jitter: false,
			start_with_retriever_error: true,
			shutdown_timeout: Duration::from_secs(5),
		}
	}
}

impl RefreshSettings {
	fn next_delay(&self) -> Duration {
		if !self.enable_polling_jitter {
			return self.polling_interval;
		}
		let max_jitter = self.polling_interval.as_millis() as u64 / JITTER_FRACTION;
		self.polling_interval + Duration::from_millis(fastrand::u64(0..=max_jitter))
	}
}

struct RefreshInner {
	cache: Arc<FlagCache>,
	retrievers: RetrieverManager,
	notifications: NotificationService,
	refresh_lock: Mutex<()>,
	/// Incremented each time a refresh completes.
	generation: AtomicU64,
	last_succeeded: AtomicBool,
	closed: AtomicBool,
}

impl RefreshInner {
	/// Runs a refresh unless one completes while waiting for the lock, in
	/// which case that refresh's outcome is returned.
	async fn refresh_coalesced(&self) -> bool {
		let observed = self.generation.load(Ordering::SeqCst);
		let _guard = self.refresh_lock.lock().await;

		if self.generation.load(Ordering::SeqCst) != observed {
			debug!("Joined a refresh already in flight");
			return self.last_succeeded.load(Ordering::SeqCst);
		}
		if self.closed.load(Ordering::SeqCst) {
			return false;
		}

		let succeeded = self.refresh_once().await.is_ok();
		self.last_succeeded.store(succeeded, Ordering::SeqCst);
		self.generation.fetch_add(1, Ordering::SeqCst);
		succeeded
	}

	/// One fetch, diff and swap. Returns whether the cache changed.
	async fn refresh_once(&self) -> Result<bool> {
		let previous_state = self.cache.state();
		if previous_state == CacheState::Ready {
			self.cache.set_state(CacheState::Refreshing);
		}

		match self.load().await {
			Ok(changed) => Ok(changed),
			Err(ClientError::ClientShutdown) => Err(ClientError::ClientShutdown),
			Err(e) => {
				error!(error = %e, "Flag refresh failed, keeping previous snapshot");
				if previous_state == CacheState::Ready {
					self.cache.set_state(CacheState::Ready);
				}
				Err(e)
			}
		}
	}

	async fn load(&self) -> Result<bool> {
		let flags = self.retrievers.retrieve_all().await?;
		if self.closed.load(Ordering::SeqCst) {
			debug!("Client closed during refresh, discarding fetched flags");
			return Err(ClientError::ClientShutdown);
		}
		for (key, flag) in &flags {
			if let Err(e) = flag.validate() {
				warn!(flag_key = %key, error = %e, "Invalid flag definition");
			}
		}

		let next = Snapshot::new(flags);
		let current = self.cache.snapshot();
		let diff = DiffCache::compute(&current, &next);
		let recovering = !self.cache.state().is_ready();

		if diff.is_empty() && !recovering {
			self.cache.set_state(CacheState::Ready);
			debug!(flag_count = next.len(), "Flags unchanged");
			return Ok(false);
		}

		let initial = self.cache.state() == CacheState::Loading;
		let flag_count = next.len();
		self.cache.replace(next);
		self.cache.set_state(CacheState::Ready);

		if initial {
			info!(flag_count, "Flags loaded");
		} else {
			info!(
				flag_count,
				added = diff.added.len(),
				deleted = diff.deleted.len(),
				updated = diff.updated.len(),
				"Flag cache updated"
			);
			self.notifications.notify(diff);
		}
		Ok(true)
	}
}

/// Owns the polling task that keeps a [`FlagCache`] current.
pub struct RefreshScheduler {
	inner: Arc<RefreshInner>,
	settings: RefreshSettings,
	shutdown_tx: broadcast::Sender<()>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
	pub fn new(
		cache: Arc<FlagCache>,
		retrievers: RetrieverManager,
		notifications: NotificationService,
		settings: RefreshSettings,
	) -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		Self {
			inner: Arc::new(RefreshInner {
				cache,
				retrievers,
				notifications,
				refresh_lock: Mutex::new(()),
				generation: AtomicU64::new(0),
				last_succeeded: AtomicBool::new(false),
				closed: AtomicBool::new(false),
			}),
			settings,
			shutdown_tx,
			handle: Mutex::new(None),
		}
	}

	pub fn retrievers(&self) -> &RetrieverManager {
		&self.inner.retrievers
	}

	/// Performs the first load and starts polling.
	///
	/// The first load never notifies. When it fails the cache is left empty
	/// in [`CacheState::LoadError`] and polling continues, unless
	/// `start_with_retriever_error` is off, in which case an error is
	/// returned and nothing is spawned.
	#[instrument(skip(self))]
	pub async fn start(&self) -> Result<()> {
		let inner = &self.inner;
		inner.cache.set_state(CacheState::Loading);

		{
			let _guard = inner.refresh_lock.lock().await;
			let outcome = inner.load().await;
			inner.last_succeeded.store(outcome.is_ok(), Ordering::SeqCst);
			inner.generation.fetch_add(1, Ordering::SeqCst);

			if let Err(e) = outcome {
				inner.cache.set_state(CacheState::LoadError);
				if !self.settings.start_with_retriever_error {
					error!(error = %e, "Initial flag load failed");
					return Err(ClientError::InitialLoad(e.to_string()));
				}
				warn!(error = %e, "Initial flag load failed, serving an empty cache");
			}
		}

		let inner = Arc::clone(&self.inner);
		let settings = self.settings.clone();
		let mut shutdown_rx = self.shutdown_tx.subscribe();

		let handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(settings.next_delay()) => {
						inner.refresh_coalesced().await;
					}
					_ = shutdown_rx.recv() => {
						debug!("Stopping flag polling");
						break;
					}
				}
			}
		});
		*self.handle.lock().await = Some(handle);

		info!(
			polling_interval_secs = self.settings.polling_interval.as_secs(),
			jitter = self.settings.enable_polling_jitter,
			"Flag refresh started"
		);
		Ok(())
	}

	/// Refreshes now. Returns true when the refresh it ran or joined
	/// succeeded; always false once closed.
	pub async fn force_refresh(&self) -> bool {
		if self.inner.closed.load(Ordering::SeqCst) {
			return false;
		}
		self.inner.refresh_coalesced().await
	}

	/// Stops polling and releases retrievers and notifiers. The last
	/// snapshot stays readable.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let timeout = self.settings.shutdown_timeout;
		let _ = self.shutdown_tx.send(());

		if let Some(handle) = self.handle.lock().await.take() {
			let abort = handle.abort_handle();
			if tokio::time::timeout(timeout, handle).await.is_err() {
				warn!("Timed out waiting for the polling task, aborting");
				abort.abort();
			}
		}

		match tokio::time::timeout(timeout, self.inner.refresh_lock.lock()).await {
			Ok(_guard) => {}
			Err(_) => warn!("Timed out waiting for an in-flight refresh"),
		}

		self.inner.retrievers.shutdown().await;
		self.inner.notifications.close(timeout).await;
		self.inner.cache.set_state(CacheState::Closed);
		info!("Flag refresh stopped");
	}
}
