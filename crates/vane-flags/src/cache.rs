// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory flag cache.
//!
//! The cache holds an `Arc<Snapshot>`. Readers clone the pointer under a read
//! lock and evaluate against their copy; a refresh builds a whole new snapshot
//! and swaps the pointer under a write lock held for the assignment only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use vane_flags_core::{Flag, Snapshot};

/// Lifecycle of the cache and its refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
	Uninitialized,
	Loading,
	Ready,
	Refreshing,
	/// The first load failed; an empty snapshot is served until a refresh
	/// succeeds.
	LoadError,
	Closed,
}

impl CacheState {
	/// True when the cache holds data from at least one successful load.
	pub fn is_ready(self) -> bool {
		matches!(self, CacheState::Ready | CacheState::Refreshing)
	}
}

#[derive(Debug)]
pub struct FlagCache {
	snapshot: RwLock<Arc<Snapshot>>,
	state: RwLock<CacheState>,
	refreshed_at: RwLock<Option<DateTime<Utc>>>,
}

impl FlagCache {
	pub fn new() -> Self {
		Self {
			snapshot: RwLock::new(Arc::new(Snapshot::empty())),
			state: RwLock::new(CacheState::Uninitialized),
			refreshed_at: RwLock::new(None),
		}
	}

	/// The current snapshot. Later swaps do not affect the returned value.
	pub fn snapshot(&self) -> Arc<Snapshot> {
		Arc::clone(&self.snapshot.read())
	}

	pub fn read(&self, flag_key: &str) -> Option<Arc<Flag>> {
		self.snapshot.read().get(flag_key).cloned()
	}

	/// Installs `snapshot` and returns the one it replaced.
	pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
		let next = Arc::new(snapshot);
		let previous = std::mem::replace(&mut *self.snapshot.write(), next);
		*self.refreshed_at.write() = Some(Utc::now());
		previous
	}

	pub fn state(&self) -> CacheState {
		*self.state.read()
	}

	/// Moves to `state`. [`CacheState::Closed`] is final and never left.
	pub fn set_state(&self, state: CacheState) {
		let mut current = self.state.write();
		if *current != CacheState::Closed {
			*current = state;
		}
	}

	/// Time of the last successful swap.
	pub fn refresh_date(&self) -> Option<DateTime<Utc>> {
		*self.refreshed_at.read()
	}

	pub fn len(&self) -> usize {
		self.snapshot.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.snapshot.read().is_empty()
	}
}

impl Default for FlagCache {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::collections::HashMap;
	use vane_flags_core::Rule;

	fn snapshot_with(key: &str, variation: &str) -> Snapshot {
		let flag = Flag::new()
			.with_variation("a", json!("a"))
			.with_variation("b", json!("b"))
			.with_default_rule(Rule::fixed(variation));
		let mut flags = HashMap::new();
		flags.insert(key.to_string(), flag);
		Snapshot::new(flags)
	}

	#[test]
	fn starts_empty_and_uninitialized() {
		let cache = FlagCache::new();
		assert!(cache.is_empty());
		assert_eq!(cache.state(), CacheState::Uninitialized);
		assert!(cache.refresh_date().is_none());
		assert!(cache.read("anything").is_none());
	}

	#[test]
	fn held_snapshot_survives_swap() {
		let cache = FlagCache::new();
		cache.replace(snapshot_with("theme", "a"));

		let held = cache.snapshot();
		let previous = cache.replace(snapshot_with("theme", "b"));

		assert!(Arc::ptr_eq(&held, &previous));
		let old_rule = held.get("theme").unwrap().default_rule.clone().unwrap();
		assert_eq!(old_rule.variation.as_deref(), Some("a"));

		let new_rule = cache.read("theme").unwrap().default_rule.clone().unwrap();
		assert_eq!(new_rule.variation.as_deref(), Some("b"));
		assert!(cache.refresh_date().is_some());
	}

	#[test]
	fn concurrent_readers_see_whole_snapshots() {
		let cache = Arc::new(FlagCache::new());
		cache.replace(snapshot_with("theme", "a"));

		let readers: Vec<_> = (0..4)
			.map(|_| {
				let cache = Arc::clone(&cache);
				std::thread::spawn(move || {
					for _ in 0..1_000 {
						let snapshot = cache.snapshot();
						assert_eq!(snapshot.len(), 1);
						assert!(snapshot.contains("theme"));
					}
				})
			})
			.collect();

		for i in 0..200 {
			let variation = if i % 2 == 0 { "a" } else { "b" };
			cache.replace(snapshot_with("theme", variation));
		}

		for reader in readers {
			reader.join().unwrap();
		}
	}

	#[test]
	fn closed_state_is_final() {
		let cache = FlagCache::new();
		cache.set_state(CacheState::Ready);
		cache.set_state(CacheState::Closed);

		cache.set_state(CacheState::Ready);
		cache.set_state(CacheState::Refreshing);

		assert_eq!(cache.state(), CacheState::Closed);
	}

	#[test]
	fn ready_states() {
		assert!(CacheState::Ready.is_ready());
		assert!(CacheState::Refreshing.is_ready());
		assert!(!CacheState::LoadError.is_ready());
		assert!(!CacheState::Closed.is_ready());
	}
}
