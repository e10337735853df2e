// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Time-based rollout parameters: progressive rollouts and experimentation
//! windows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bucketing::PERCENTAGE_MULTIPLIER;
use crate::error::{FlagsError, Result};

/// One end of a progressive rollout.
///
/// `percentage` is the share of traffic served the END variation at this
/// point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub percentage: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub date: Option<DateTime<Utc>>,
}

impl RolloutStep {
	pub fn new(variation: impl Into<String>, percentage: f64, date: DateTime<Utc>) -> Self {
		Self {
			variation: Some(variation.into()),
			percentage: Some(percentage),
			date: Some(date),
		}
	}

	/// Overwrites the fields set on `update`.
	pub fn merge(&mut self, update: &RolloutStep) {
		if update.variation.is_some() {
			self.variation = update.variation.clone();
		}
		if update.percentage.is_some() {
			self.percentage = update.percentage;
		}
		if update.date.is_some() {
			self.date = update.date;
		}
	}
}

/// Linear migration from the initial variation to the end variation between
/// two dates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressiveRollout {
	#[serde(default)]
	pub initial: RolloutStep,
	#[serde(default)]
	pub end: RolloutStep,
}

impl ProgressiveRollout {
	pub fn new(initial: RolloutStep, end: RolloutStep) -> Self {
		Self { initial, end }
	}

	pub fn merge(&mut self, update: &ProgressiveRollout) {
		self.initial.merge(&update.initial);
		self.end.merge(&update.end);
	}

	pub fn has_finite_percentages(&self) -> bool {
		[self.initial.percentage, self.end.percentage]
			.into_iter()
			.flatten()
			.all(f64::is_finite)
	}

	/// Share (in percent) of traffic served the END variation at `now`.
	///
	/// Before the initial date this is the initial percentage, after the end
	/// date it is the end percentage, and in between it is interpolated
	/// linearly. A missing, zero or out-of-range end percentage means 100.
	pub fn end_share_at(&self, now: DateTime<Utc>) -> Result<f64> {
		let (start, end) = self.dates()?;

		let initial_pct = self.initial.percentage.unwrap_or(0.0).clamp(0.0, 100.0);
		let end_pct = match self.end.percentage {
			Some(p) if p > 0.0 && p <= 100.0 => p,
			_ => 100.0,
		};

		let share = if now < start {
			initial_pct
		} else if now >= end {
			end_pct
		} else {
			let total = (end - start).num_milliseconds() as f64;
			let elapsed = (now - start).num_milliseconds() as f64;
			initial_pct + (end_pct - initial_pct) * (elapsed / total)
		};

		// Truncate to the bucketing precision so both shares scale exactly.
		Ok((share * PERCENTAGE_MULTIPLIER).floor() / PERCENTAGE_MULTIPLIER)
	}

	/// Two-way weight map equivalent to this rollout at `now`.
	pub fn weights_at(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, f64>> {
		let (initial, end) = self.variations()?;
		let end_share = self.end_share_at(now)?;

		let mut weights = BTreeMap::new();
		if initial == end {
			weights.insert(end.to_string(), 100.0);
		} else {
			weights.insert(end.to_string(), end_share);
			weights.insert(initial.to_string(), 100.0 - end_share);
		}
		Ok(weights)
	}

	/// Variation names referenced by this rollout.
	pub fn variations(&self) -> Result<(&str, &str)> {
		match (&self.initial.variation, &self.end.variation) {
			(Some(initial), Some(end)) => Ok((initial.as_str(), end.as_str())),
			_ => Err(FlagsError::InvalidConfiguration(
				"progressive rollout needs an initial and an end variation".to_string(),
			)),
		}
	}

	fn dates(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
		match (self.initial.date, self.end.date) {
			(Some(start), Some(end)) if end > start => Ok((start, end)),
			(Some(_), Some(_)) => Err(FlagsError::InvalidConfiguration(
				"progressive rollout end date must be after its initial date".to_string(),
			)),
			_ => Err(FlagsError::InvalidConfiguration(
				"progressive rollout needs an initial and an end date".to_string(),
			)),
		}
	}
}

/// Window during which an experimentation flag is served.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experimentation {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end: Option<DateTime<Utc>>,
}

impl Experimentation {
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		let started = self.start.map_or(true, |start| now >= start);
		let not_over = self.end.map_or(true, |end| now <= end);
		started && not_over
	}

	pub fn merge(&mut self, update: &Experimentation) {
		if update.start.is_some() {
			self.start = update.start;
		}
		if update.end.is_some() {
			self.end = update.end;
		}
	}
}


#[cfg(test)]
mod proptest_tests {
	use super::*;
	use chrono::{Duration, TimeZone};
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn end_share_is_monotonic_for_growing_rollouts(
			initial in 0u32..=50,
			end in 51u32..=100,
			t1 in 0i64..=864_000,
			t2 in 0i64..=864_000,
		) {
			let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
			let r = ProgressiveRollout::new(
				RolloutStep::new("off", initial as f64, start),
				RolloutStep::new("on", end as f64, start + Duration::days(10)),
			);
			let (early, late) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };

			let a = r.end_share_at(start + Duration::seconds(early)).unwrap();
			let b = r.end_share_at(start + Duration::seconds(late)).unwrap();
			prop_assert!(a <= b);
			prop_assert!(a >= initial as f64 && b <= end as f64);
		}
	}
}
