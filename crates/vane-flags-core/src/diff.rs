// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Structural difference between two snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flag::Flag;
use crate::snapshot::Snapshot;

/// A flag present in both snapshots whose definition changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffUpdated {
	pub before: Flag,
	pub after: Flag,
}

/// Changes between an old and a new snapshot, keyed by flag name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffCache {
	pub added: BTreeMap<String, Flag>,
	pub deleted: BTreeMap<String, Flag>,
	pub updated: BTreeMap<String, DiffUpdated>,
}

impl DiffCache {
	pub fn compute(old: &Snapshot, new: &Snapshot) -> Self {
		let mut diff = DiffCache::default();

		for (key, before) in old.iter() {
			match new.get(key) {
				None => {
					diff.deleted.insert(key.clone(), Flag::clone(before));
				}
				Some(after) if after != before => {
					diff.updated.insert(
						key.clone(),
						DiffUpdated {
							before: Flag::clone(before),
							after: Flag::clone(after),
						},
					);
				}
				Some(_) => {}
			}
		}

		for (key, after) in new.iter() {
			if !old.contains(key) {
				diff.added.insert(key.clone(), Flag::clone(after));
			}
		}

		diff
	}

	pub fn has_diff(&self) -> bool {
		!(self.added.is_empty() && self.deleted.is_empty() && self.updated.is_empty())
	}

	/// Total number of changed flags.
	pub fn len(&self) -> usize {
		self.added.len() + self.deleted.len() + self.updated.len()
	}

	pub fn is_empty(&self) -> bool {
		!self.has_diff()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rule::Rule;
	use serde_json::json;
	use std::collections::HashMap;

	fn flag(default: &str) -> Flag {
		Flag::new()
			.with_variation("on", json!(true))
			.with_variation("off", json!(false))
			.with_default_rule(Rule::fixed(default))
	}

	fn snapshot(entries: &[(&str, Flag)]) -> Snapshot {
		Snapshot::new(
			entries
				.iter()
				.map(|(k, f)| (k.to_string(), f.clone()))
				.collect::<HashMap<_, _>>(),
		)
	}

	#[test]
	fn added_deleted_and_updated() {
		let old = snapshot(&[("A", flag("on")), ("B", flag("on"))]);
		let new = snapshot(&[("B", flag("off")), ("C", flag("on"))]);

		let diff = DiffCache::compute(&old, &new);

		assert_eq!(diff.deleted.keys().collect::<Vec<_>>(), vec!["A"]);
		assert_eq!(diff.added.keys().collect::<Vec<_>>(), vec!["C"]);
		assert_eq!(diff.updated.keys().collect::<Vec<_>>(), vec!["B"]);

		let b = &diff.updated["B"];
		assert_eq!(b.before, flag("on"));
		assert_eq!(b.after, flag("off"));
		assert_eq!(diff.len(), 3);
		assert!(diff.has_diff());
	}

	#[test]
	fn identical_snapshots_have_no_diff() {
		let old = snapshot(&[("A", flag("on")), ("B", flag("off"))]);
		let new = snapshot(&[("A", flag("on")), ("B", flag("off"))]);
		let diff = DiffCache::compute(&old, &new);
		assert!(!diff.has_diff());
		assert!(diff.is_empty());
	}

	#[test]
	fn first_load_is_all_added() {
		let new = snapshot(&[("A", flag("on"))]);
		let diff = DiffCache::compute(&Snapshot::empty(), &new);
		assert_eq!(diff.added.len(), 1);
		assert!(diff.deleted.is_empty());
	}
}
