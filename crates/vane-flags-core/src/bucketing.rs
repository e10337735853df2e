// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Consistent-hash bucketing for percentage splits.
//!
//! A bucketing input (`flag key` followed directly by the bucketing key) is
//! hashed with MurmurHash3 (x86, 32-bit, seed 0) and reduced modulo the split
//! resolution `W`. Weights are percentages scaled by [`PERCENTAGE_MULTIPLIER`]
//! so one-thousandth of a percent is representable; `W` is the sum of the
//! scaled weights.
//!
//! Buckets are laid out in ascending byte-wise order of the variation names.
//! With that order fixed, moving weight from one variation to its neighbour
//! (keeping the total unchanged) only moves users sitting on the shared
//! boundary, and only towards that neighbour. Changing the total changes `W`
//! and therefore reshuffles most users.

use std::collections::BTreeMap;
use std::io::Cursor;

use murmur3::murmur3_32;

use crate::error::{FlagsError, Result};

/// Scale factor applied to percentages before bucketing.
pub const PERCENTAGE_MULTIPLIER: f64 = 1000.0;

/// Resolution of a split whose weights sum to 100.
pub const FULL_RESOLUTION: u32 = 100 * PERCENTAGE_MULTIPLIER as u32;

/// Hashes a string with MurmurHash3 x86_32 (seed 0).
pub fn hash32(input: &str) -> u32 {
	murmur3_32(&mut Cursor::new(input.as_bytes()), 0).unwrap_or(0)
}

/// Position of `bucketing_key` inside `[0, resolution)` for `flag_key`.
pub fn bucket_position(flag_key: &str, bucketing_key: &str, resolution: u32) -> u32 {
	if resolution == 0 {
		return 0;
	}
	let mut input = String::with_capacity(flag_key.len() + bucketing_key.len());
	input.push_str(flag_key);
	input.push_str(bucketing_key);
	hash32(&input) % resolution
}

/// A contiguous sub-range `[start, end)` owned by one variation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
	pub variation: String,
	pub start: u32,
	pub end: u32,
}

impl Bucket {
	pub fn contains(&self, position: u32) -> bool {
		self.start <= position && position < self.end
	}
}

/// Ordered partition of `[0, W)` derived from a weight map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PercentageSplit {
	buckets: Vec<Bucket>,
	resolution: u32,
}

impl PercentageSplit {
	/// Builds the partition. Fails when a weight is negative or not finite,
	/// or when all weights are zero.
	pub fn new(weights: &BTreeMap<String, f64>) -> Result<Self> {
		let mut buckets = Vec::with_capacity(weights.len());
		let mut cursor: u32 = 0;

		// BTreeMap iterates in ascending key order, which is the bucket order.
		for (variation, weight) in weights {
			if !weight.is_finite() || *weight < 0.0 {
				return Err(FlagsError::InvalidConfiguration(format!(
					"invalid weight {weight} for variation {variation}"
				)));
			}
			let width = (weight * PERCENTAGE_MULTIPLIER).round() as u32;
			let end = cursor.checked_add(width).ok_or_else(|| {
				FlagsError::InvalidConfiguration("percentage weights overflow".to_string())
			})?;
			buckets.push(Bucket {
				variation: variation.clone(),
				start: cursor,
				end,
			});
			cursor = end;
		}

		if cursor == 0 {
			return Err(FlagsError::InvalidConfiguration(
				"percentage weights sum to zero".to_string(),
			));
		}

		Ok(Self {
			buckets,
			resolution: cursor,
		})
	}

	/// The split resolution `W`.
	pub fn resolution(&self) -> u32 {
		self.resolution
	}

	pub fn buckets(&self) -> &[Bucket] {
		&self.buckets
	}

	/// Returns the variation owning `position`, if it lies inside `[0, W)`.
	pub fn variation_at(&self, position: u32) -> Option<&str> {
		self
			.buckets
			.iter()
			.find(|b| b.contains(position))
			.map(|b| b.variation.as_str())
	}

	/// Places `bucketing_key` for `flag_key` in this split.
	pub fn assign(&self, flag_key: &str, bucketing_key: &str) -> Result<&str> {
		let position = bucket_position(flag_key, bucketing_key, self.resolution);
		self.variation_at(position).ok_or_else(|| {
			FlagsError::InvalidConfiguration(format!(
				"bucket position {position} outside split of width {}",
				self.resolution
			))
		})
	}
}

/// Maps `(flag_key, bucketing_key, weights)` to a variation name.
pub fn assign(
	flag_key: &str,
	bucketing_key: &str,
	weights: &BTreeMap<String, f64>,
) -> Result<String> {
	let split = PercentageSplit::new(weights)?;
	split.assign(flag_key, bucketing_key).map(str::to_owned)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
		pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
	}

	fn assign_all(flag_key: &str, w: &BTreeMap<String, f64>, users: usize) -> Vec<String> {
		(0..users)
			.map(|i| assign(flag_key, &format!("user-{i}"), w).unwrap())
			.collect()
	}

	#[test]
	fn zero_total_weight_is_rejected() {
		let err = assign("flag", "user", &weights(&[("a", 0.0), ("b", 0.0)])).unwrap_err();
		assert!(matches!(err, FlagsError::InvalidConfiguration(_)));

		let err = assign("flag", "user", &BTreeMap::new()).unwrap_err();
		assert!(matches!(err, FlagsError::InvalidConfiguration(_)));
	}

	#[test]
	fn negative_weight_is_rejected() {
		let err = assign("flag", "user", &weights(&[("a", -10.0), ("b", 110.0)])).unwrap_err();
		assert!(matches!(err, FlagsError::InvalidConfiguration(_)));
	}

	#[test]
	fn buckets_are_sorted_ascending_and_contiguous() {
		let split = PercentageSplit::new(&weights(&[("c", 33.0), ("a", 33.0), ("b", 34.0)])).unwrap();
		let names: Vec<_> = split.buckets().iter().map(|b| b.variation.as_str()).collect();
		assert_eq!(names, vec!["a", "b", "c"]);
		assert_eq!(split.buckets()[0].start, 0);
		assert_eq!(split.buckets()[0].end, 33_000);
		assert_eq!(split.buckets()[1].end, 67_000);
		assert_eq!(split.buckets()[2].end, 100_000);
		assert_eq!(split.resolution(), FULL_RESOLUTION);
	}

	#[test]
	fn fractional_percentages_keep_precision() {
		let split = PercentageSplit::new(&weights(&[("a", 0.5), ("b", 99.5)])).unwrap();
		assert_eq!(split.buckets()[0].end, 500);
		assert_eq!(split.resolution(), 100_000);
	}

	#[test]
	fn full_weight_variation_always_wins() {
		let w = weights(&[("off", 0.0), ("on", 100.0)]);
		for variation in assign_all("flag", &w, 500) {
			assert_eq!(variation, "on");
		}
	}

	#[test]
	fn shrinking_one_variation_only_moves_users_to_its_neighbour() {
		let before = weights(&[("A", 33.0), ("B", 34.0), ("C", 33.0)]);
		let after = weights(&[("A", 33.0), ("B", 57.0), ("C", 10.0)]);

		let a = assign_all("checkout.flow", &before, 10_000);
		let b = assign_all("checkout.flow", &after, 10_000);

		let mut moved = 0;
		for (old, new) in a.iter().zip(b.iter()) {
			if old != new {
				moved += 1;
				assert_eq!((old.as_str(), new.as_str()), ("C", "B"));
			}
		}
		assert!(moved > 0);
	}

	#[test]
	fn growing_a_variation_has_no_reverse_flow() {
		let before = weights(&[("A", 50.0), ("B", 50.0)]);
		let after = weights(&[("A", 70.0), ("B", 30.0)]);

		let a = assign_all("search.ranking", &before, 10_000);
		let b = assign_all("search.ranking", &after, 10_000);

		let b_to_a = a.iter().zip(&b).filter(|(o, n)| *o == "B" && *n == "A").count();
		let a_to_b = a.iter().zip(&b).filter(|(o, n)| *o == "A" && *n == "B").count();

		assert!(b_to_a > 0);
		assert_eq!(a_to_b, 0);
	}

	#[test]
	fn changing_the_total_reshuffles_users() {
		let before = weights(&[("A", 50.0), ("B", 50.0)]);
		let after = weights(&[("A", 60.0), ("B", 50.0)]);

		let a = assign_all("pricing.page", &before, 10_000);
		let b = assign_all("pricing.page", &after, 10_000);

		let changed = a.iter().zip(&b).filter(|(o, n)| o != n).count();
		assert!(
			changed as f64 / 10_000.0 > 0.05,
			"only {changed} users changed variation"
		);
	}

	#[test]
	fn distribution_roughly_matches_weights() {
		let w = weights(&[("A", 20.0), ("B", 80.0)]);
		let results = assign_all("dist.flag", &w, 10_000);
		let a = results.iter().filter(|v| *v == "A").count();
		assert!(a > 1_500 && a < 2_500, "A got {a} users");
	}
}

#[cfg(test)]
mod proptest_tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn assign_is_deterministic(
			flag_key in "[a-z][a-z0-9_.]{2,30}",
			key in "[a-zA-Z0-9-]{1,40}",
			a in 0u32..=100,
		) {
			let mut w = BTreeMap::new();
			w.insert("on".to_string(), a as f64);
			w.insert("off".to_string(), (100 - a) as f64);

			let first = assign(&flag_key, &key, &w).unwrap();
			let second = assign(&flag_key, &key, &w).unwrap();
			prop_assert_eq!(first, second);
		}

		#[test]
		fn split_partitions_the_whole_range(
			raw in prop::collection::vec(0u32..=100, 1..6),
		) {
			let total: u32 = raw.iter().sum();
			prop_assume!(total > 0);

			let w: BTreeMap<String, f64> = raw
				.iter()
				.enumerate()
				.map(|(i, v)| (format!("v{i}"), *v as f64 * 100.0 / total as f64))
				.collect();

			let split = PercentageSplit::new(&w).unwrap();
			let buckets = split.buckets();

			prop_assert_eq!(buckets[0].start, 0);
			for pair in buckets.windows(2) {
				prop_assert_eq!(pair[0].end, pair[1].start);
			}
			prop_assert_eq!(buckets[buckets.len() - 1].end, split.resolution());

			for position in (0..split.resolution()).step_by(97) {
				let owners = buckets.iter().filter(|b| b.contains(position)).count();
				prop_assert_eq!(owners, 1);
			}
		}

		#[test]
		fn assigned_variation_is_one_of_the_weighted_names(
			key in "[a-zA-Z0-9]{1,30}",
		) {
			let mut w = BTreeMap::new();
			w.insert("red".to_string(), 25.0);
			w.insert("green".to_string(), 25.0);
			w.insert("blue".to_string(), 50.0);

			let variation = assign("colour", &key, &w).unwrap();
			prop_assert!(w.contains_key(&variation));
		}
	}
}
