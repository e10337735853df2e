// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event buffering and background export.
//!
//! Every exporter gets its own [`ExporterBuffer`] and drain task. Producers
//! append under a short synchronous lock; the drain task hands batches to the
//! sink when the buffer reaches its size threshold or the flush interval
//! elapses. Delivery is at most once: a failed batch is logged and dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vane_flags_core::{EventKind, ExportEvent};

use crate::config::duration_secs;
use crate::error::{ClientError, Result};

/// What to do with a new event when the buffer is at `max_queue_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	#[default]
	DropOldest,
	DropNewest,
}

impl std::str::FromStr for OverflowPolicy {
	type Err = ClientError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"drop_oldest" => Ok(OverflowPolicy::DropOldest),
			"drop_newest" => Ok(OverflowPolicy::DropNewest),
			other => Err(ClientError::invalid_config(
				"overflow_policy",
				format!("unknown policy {other}"),
			)),
		}
	}
}

/// Per-exporter buffering and flush settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterSettings {
	/// Time between timer-driven flushes.
	#[serde(with = "duration_secs")]
	pub flush_interval: Duration,
	/// Buffer size that triggers an immediate flush.
	pub max_event_in_memory: usize,
	/// Hard cap on buffered events.
	pub max_queue_size: usize,
	pub overflow_policy: OverflowPolicy,
	/// Only events of this kind are buffered.
	pub event_kind: EventKind,
}

impl Default for ExporterSettings {
	fn default() -> Self {
		Self {
			flush_interval: Duration::from_secs(60),
			max_event_in_memory: 100_000,
			max_queue_size: 200_000,
			overflow_policy: OverflowPolicy::DropOldest,
			event_kind: EventKind::Feature,
		}
	}
}

impl ExporterSettings {
	pub fn validate(&self) -> Result<()> {
		if self.flush_interval.is_zero() {
			return Err(ClientError::invalid_config(
				"exporter.flush_interval",
				"must be greater than zero",
			));
		}
		if self.max_event_in_memory == 0 {
			return Err(ClientError::invalid_config(
				"exporter.max_event_in_memory",
				"must be greater than zero",
			));
		}
		if self.max_queue_size < self.max_event_in_memory {
			return Err(ClientError::invalid_config(
				"exporter.max_queue_size",
				"must be at least max_event_in_memory",
			));
		}
		Ok(())
	}
}

/// Destination for exported events.
#[async_trait]
pub trait Exporter: Send + Sync {
	fn name(&self) -> &str;

	async fn export(&self, events: &[ExportEvent]) -> Result<()>;

	/// Bulk exporters receive batches; others are flushed after every event.
	fn is_bulk(&self) -> bool {
		true
	}
}

/// Bounded queue feeding one exporter.
pub struct ExporterBuffer {
	settings: ExporterSettings,
	exporter: Arc<dyn Exporter>,
	queue: Mutex<VecDeque<ExportEvent>>,
	shutdown: AtomicBool,
	flush_notify: Notify,
	dropped: AtomicU64,
}

impl ExporterBuffer {
	pub fn new(settings: ExporterSettings, exporter: Arc<dyn Exporter>) -> Self {
		Self {
			settings,
			exporter,
			queue: Mutex::new(VecDeque::new()),
			shutdown: AtomicBool::new(false),
			flush_notify: Notify::new(),
			dropped: AtomicU64::new(0),
		}
	}

	pub fn name(&self) -> &str {
		self.exporter.name()
	}

	fn flush_threshold(&self) -> usize {
		if self.exporter.is_bulk() {
			self.settings.max_event_in_memory
		} else {
			1
		}
	}

	/// Buffers `event` if it matches this exporter's kind. Never waits on the
	/// sink. Returns whether the event was kept.
	pub fn add_event(&self, event: ExportEvent) -> bool {
		if self.shutdown.load(Ordering::SeqCst) || event.kind() != self.settings.event_kind {
			return false;
		}

		let mut queue = self.queue.lock();
		// shutdown() flips the flag under this lock, so anything pushed here
		// is seen by the final flush.
		if self.shutdown.load(Ordering::SeqCst) {
			return false;
		}

		if queue.len() >= self.settings.max_queue_size {
			self.dropped.fetch_add(1, Ordering::Relaxed);
			match self.settings.overflow_policy {
				OverflowPolicy::DropOldest => {
					if let Some(dropped) = queue.pop_front() {
						warn!(
							exporter = %self.exporter.name(),
							event_key = %dropped.key(),
							"Dropped oldest event due to queue overflow"
						);
					}
				}
				OverflowPolicy::DropNewest => {
					warn!(
						exporter = %self.exporter.name(),
						event_key = %event.key(),
						"Dropped new event due to queue overflow"
					);
					return false;
				}
			}
		}

		queue.push_back(event);
		let should_flush = queue.len() >= self.flush_threshold();
		drop(queue);

		if should_flush {
			self.flush_notify.notify_one();
		}
		true
	}

	/// Sends everything buffered. The batch is removed before the sink is
	/// called, so it is dropped if the sink fails.
	pub async fn flush(&self) -> Result<usize> {
		let events: Vec<ExportEvent> = {
			let mut queue = self.queue.lock();
			std::mem::take(&mut *queue).into()
		};

		if events.is_empty() {
			return Ok(0);
		}

		debug!(exporter = %self.exporter.name(), count = events.len(), "Flushing events");
		match self.exporter.export(&events).await {
			Ok(()) => Ok(events.len()),
			Err(e) => {
				self.dropped.fetch_add(events.len() as u64, Ordering::Relaxed);
				error!(
					exporter = %self.exporter.name(),
					count = events.len(),
					error = %e,
					"Failed to export events, batch dropped"
				);
				Err(e)
			}
		}
	}

	pub fn pending_len(&self) -> usize {
		self.queue.lock().len()
	}

	/// Events lost to overflow or failed exports.
	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}

	/// Stops accepting events and wakes the drain task for its final flush.
	pub fn shutdown(&self) {
		{
			let _queue = self.queue.lock();
			self.shutdown.store(true, Ordering::SeqCst);
		}
		self.flush_notify.notify_one();
	}

	pub fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	/// Drain loop. Returns after the final flush that follows [`shutdown`].
	///
	/// [`shutdown`]: ExporterBuffer::shutdown
	pub async fn run(&self) {
		debug!(
			exporter = %self.exporter.name(),
			flush_interval_secs = self.settings.flush_interval.as_secs(),
			max_event_in_memory = self.flush_threshold(),
			"Starting exporter"
		);

		loop {
			tokio::select! {
				_ = tokio::time::sleep(self.settings.flush_interval) => {}
				_ = self.flush_notify.notified() => {}
			}

			// Errors are logged by flush.
			let _ = self.flush().await;

			if self.shutdown.load(Ordering::SeqCst) {
				if self.pending_len() > 0 {
					let _ = self.flush().await;
				}
				break;
			}
		}

		debug!(exporter = %self.exporter.name(), "Exporter stopped");
	}
}

/// The set of exporter buffers and their drain tasks.
pub struct ExportPipeline {
	buffers: Vec<Arc<ExporterBuffer>>,
	handles: Mutex<Vec<JoinHandle<()>>>,
	closed: AtomicBool,
}

impl ExportPipeline {
	/// Spawns one drain task per buffer. Must be called inside a runtime.
	pub fn spawn(buffers: Vec<Arc<ExporterBuffer>>) -> Self {
		let handles = buffers
			.iter()
			.map(|buffer| {
				let buffer = Arc::clone(buffer);
				tokio::spawn(async move { buffer.run().await })
			})
			.collect();

		if !buffers.is_empty() {
			info!(exporter_count = buffers.len(), "Event export started");
		}

		Self {
			buffers,
			handles: Mutex::new(handles),
			closed: AtomicBool::new(false),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.buffers.is_empty()
	}

	pub fn buffers(&self) -> &[Arc<ExporterBuffer>] {
		&self.buffers
	}

	/// Offers `event` to every buffer.
	pub fn add_event(&self, event: ExportEvent) {
		if let Some((last, rest)) = self.buffers.split_last() {
			for buffer in rest {
				buffer.add_event(event.clone());
			}
			last.add_event(event);
		}
	}

	/// Flushes every buffer now.
	pub async fn flush(&self) {
		join_all(self.buffers.iter().map(|buffer| buffer.flush())).await;
	}

	/// Final flush of every buffer, bounded by `timeout`. Tasks still running
	/// afterwards are aborted.
	pub async fn close(&self, timeout: Duration) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		for buffer in &self.buffers {
			buffer.shutdown();
		}

		let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
		let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
		if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
			warn!(
				exporter_count = aborts.len(),
				"Timed out flushing exporters, aborting"
			);
			for abort in aborts {
				abort.abort();
			}
		}
	}
}

/// Writes each event to the log.
#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl Exporter for LogExporter {
	fn name(&self) -> &str {
		"log"
	}

	async fn export(&self, events: &[ExportEvent]) -> Result<()> {
		for event in events {
			match event {
				ExportEvent::Feature(e) => info!(
					kind = "feature",
					flag_key = %e.key,
					user_key = %e.user_key,
					variation = %e.variation,
					value = %e.value,
					default = e.default,
					"Flag evaluated"
				),
				ExportEvent::Tracking(e) => info!(
					kind = "tracking",
					event_key = %e.key,
					user_key = %e.user_key,
					"Event tracked"
				),
			}
		}
		Ok(())
	}

	fn is_bulk(&self) -> bool {
		false
	}
}

/// Keeps exported events in memory.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
	batches: Mutex<Vec<Vec<ExportEvent>>>,
}

impl InMemoryExporter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Every exported event, in export order.
	pub fn events(&self) -> Vec<ExportEvent> {
		self.batches.lock().iter().flatten().cloned().collect()
	}

	pub fn batch_count(&self) -> usize {
		self.batches.lock().len()
	}
}

#[async_trait]
impl Exporter for InMemoryExporter {
	fn name(&self) -> &str {
		"in_memory"
	}

	async fn export(&self, events: &[ExportEvent]) -> Result<()> {
		self.batches.lock().push(events.to_vec());
		Ok(())
	}
}
