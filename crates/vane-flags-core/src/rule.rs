// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Targeting rules: attribute predicates plus the outcome they resolve to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bucketing::PercentageSplit;
use crate::context::EvaluationContext;
use crate::error::{FlagsError, Result};
use crate::rollout::ProgressiveRollout;

/// Comparison applied between a context attribute and a rule value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
	Eq,
	Ne,
	In,
	NotIn,
	Contains,
	StartsWith,
	EndsWith,
	Gt,
	Gte,
	Lt,
	Lte,
	Exists,
}

impl Operator {
	/// Evaluates the operator. `actual` is `None` when the attribute is not
	/// present in the context; only `exists` can match in that case.
	pub fn evaluate(&self, actual: Option<&Value>, expected: &Value) -> bool {
		let Some(actual) = actual else {
			return *self == Operator::Exists && expected.as_bool() == Some(false);
		};

		match self {
			Operator::Eq => values_equal(actual, expected),
			Operator::Ne => !values_equal(actual, expected),
			Operator::In => expected
				.as_array()
				.is_some_and(|items| items.iter().any(|item| values_equal(actual, item))),
			Operator::NotIn => !Operator::In.evaluate(Some(actual), expected),
			Operator::Contains => match (actual, expected) {
				(Value::String(a), Value::String(e)) => a.contains(e.as_str()),
				(Value::Array(items), e) => items.iter().any(|item| values_equal(item, e)),
				_ => false,
			},
			Operator::StartsWith => match (actual, expected) {
				(Value::String(a), Value::String(e)) => a.starts_with(e.as_str()),
				_ => false,
			},
			Operator::EndsWith => match (actual, expected) {
				(Value::String(a), Value::String(e)) => a.ends_with(e.as_str()),
				_ => false,
			},
			Operator::Gt => compare(actual, expected).is_some_and(|o| o.is_gt()),
			Operator::Gte => compare(actual, expected).is_some_and(|o| o.is_ge()),
			Operator::Lt => compare(actual, expected).is_some_and(|o| o.is_lt()),
			Operator::Lte => compare(actual, expected).is_some_and(|o| o.is_le()),
			Operator::Exists => expected.as_bool() != Some(false),
		}
	}
}

fn values_equal(a: &Value, b: &Value) -> bool {
	match (a.as_f64(), b.as_f64()) {
		(Some(x), Some(y)) => x == y,
		_ => a == b,
	}
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
	match (a, b) {
		(Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
		(Value::String(x), Value::String(y)) => Some(x.cmp(y)),
		_ => None,
	}
}

/// A single attribute check inside a rule query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
	pub attribute: String,
	pub operator: Operator,
	#[serde(default)]
	pub value: Value,
}

impl Condition {
	pub fn new(attribute: impl Into<String>, operator: Operator, value: Value) -> Self {
		Self {
			attribute: attribute.into(),
			operator,
			value,
		}
	}

	pub fn matches(&self, context: &EvaluationContext) -> bool {
		let actual = context.attribute(&self.attribute);
		self.operator.evaluate(actual.as_ref(), &self.value)
	}
}

/// Outcome of resolving a rule for one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
	pub variation: String,
	/// True when the variation came out of a percentage split or rollout.
	pub bucketed: bool,
}

/// A targeting rule or the default rule of a flag.
///
/// Fields are optional so the same type can describe a partial update in a
/// scheduled rollout step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	/// Conditions combined with AND. Absent or empty matches every context.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub query: Option<Vec<Condition>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub percentage: Option<BTreeMap<String, f64>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub progressive_rollout: Option<ProgressiveRollout>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub disable: Option<bool>,
}

impl Rule {
	pub fn fixed(variation: impl Into<String>) -> Self {
		Self {
			variation: Some(variation.into()),
			..Self::default()
		}
	}

	pub fn split<I, S>(weights: I) -> Self
	where
		I: IntoIterator<Item = (S, f64)>,
		S: Into<String>,
	{
		Self {
			percentage: Some(weights.into_iter().map(|(k, v)| (k.into(), v)).collect()),
			..Self::default()
		}
	}

	pub fn progressive(rollout: ProgressiveRollout) -> Self {
		Self {
			progressive_rollout: Some(rollout),
			..Self::default()
		}
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn with_condition(mut self, condition: Condition) -> Self {
		self.query.get_or_insert_with(Vec::new).push(condition);
		self
	}

	pub fn with_disable(mut self, disable: bool) -> Self {
		self.disable = Some(disable);
		self
	}

	pub fn name(&self) -> &str {
		self.name.as_deref().unwrap_or("")
	}

	pub fn is_disabled(&self) -> bool {
		self.disable.unwrap_or(false)
	}

	fn has_percentage(&self) -> bool {
		self.percentage.as_ref().is_some_and(|p| !p.is_empty())
	}

	/// Whether resolving this rule needs a bucketing key.
	pub fn requires_bucketing(&self) -> bool {
		self.progressive_rollout.is_some() || self.has_percentage()
	}

	/// False when a split weight or rollout percentage is NaN or infinite.
	pub fn has_finite_numbers(&self) -> bool {
		self
			.percentage
			.as_ref()
			.map_or(true, |weights| weights.values().all(|w| w.is_finite()))
			&& self
				.progressive_rollout
				.as_ref()
				.map_or(true, ProgressiveRollout::has_finite_percentages)
	}

	/// Whether different contexts may receive different variations. A split
	/// where one variation holds 100% is not dynamic.
	pub fn is_dynamic(&self) -> bool {
		if self.progressive_rollout.is_some() {
			return true;
		}
		match &self.percentage {
			Some(p) if !p.is_empty() => !p.values().any(|w| *w == 100.0),
			_ => false,
		}
	}

	pub fn matches(&self, context: &EvaluationContext) -> bool {
		match &self.query {
			Some(conditions) => conditions.iter().all(|c| c.matches(context)),
			None => true,
		}
	}

	/// Resolves the rule's outcome. Progressive rollouts take precedence over
	/// percentage splits, which take precedence over a fixed variation.
	pub fn resolve(
		&self,
		flag_key: &str,
		bucketing_key: Option<&str>,
		now: DateTime<Utc>,
	) -> Result<Resolution> {
		if self.requires_bucketing() {
			let key = bucketing_key
				.filter(|k| !k.is_empty())
				.ok_or_else(|| FlagsError::TargetingKeyMissing(flag_key.to_string()))?;

			let weights = match (&self.progressive_rollout, &self.percentage) {
				(Some(rollout), _) => rollout.weights_at(now)?,
				(None, Some(weights)) => weights.clone(),
				(None, None) => BTreeMap::new(),
			};

			let split = PercentageSplit::new(&weights)?;
			let variation = split.assign(flag_key, key)?.to_string();
			return Ok(Resolution {
				variation,
				bucketed: true,
			});
		}

		match &self.variation {
			Some(variation) => Ok(Resolution {
				variation: variation.clone(),
				bucketed: false,
			}),
			None => Err(FlagsError::InvalidConfiguration(format!(
				"rule {:?} of flag {flag_key} has no variation",
				self.name()
			))),
		}
	}

	/// Every variation name this rule can resolve to.
	pub fn referenced_variations(&self) -> Vec<&str> {
		let mut names = Vec::new();
		if let Some(v) = &self.variation {
			names.push(v.as_str());
		}
		if let Some(p) = &self.percentage {
			names.extend(p.keys().map(String::as_str));
		}
		if let Some(r) = &self.progressive_rollout {
			names.extend(r.initial.variation.as_deref());
			names.extend(r.end.variation.as_deref());
		}
		names
	}

	/// Applies a partial update. Percentages are merged per variation and a
	/// negative percentage removes that variation from the split.
	pub fn merge(&mut self, update: &Rule) {
		if update.disable.is_some() {
			self.disable = update.disable;
		}
		if update.query.is_some() {
			self.query = update.query.clone();
		}
		if update.variation.is_some() {
			self.variation = update.variation.clone();
		}
		if let Some(patch) = &update.progressive_rollout {
			self
				.progressive_rollout
				.get_or_insert_with(ProgressiveRollout::default)
				.merge(patch);
		}
		if let Some(patch) = &update.percentage {
			let merged = self.percentage.get_or_insert_with(BTreeMap::new);
			for (name, weight) in patch {
				if *weight < 0.0 {
					merged.remove(name);
				} else {
					merged.insert(name.clone(), *weight);
				}
			}
		}
	}
}

/// Merges scheduled rule updates into `rules` by rule name. Updates that do
/// not name an existing rule are appended.
pub fn merge_rules(rules: &mut Vec<Rule>, updates: &[Rule]) {
	for update in updates {
		let existing = update
			.name
			.as_deref()
			.and_then(|name| rules.iter_mut().find(|r| r.name.as_deref() == Some(name)));

		match existing {
			Some(rule) => rule.merge(update),
			None => rules.push(update.clone()),
		}
	}
}


#[cfg(test)]
mod proptest_tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn equals_is_symmetric(a: i64, b: i64) {
			let (va, vb) = (serde_json::json!(a), serde_json::json!(b));
			prop_assert_eq!(
				Operator::Eq.evaluate(Some(&va), &vb),
				Operator::Eq.evaluate(Some(&vb), &va)
			);
		}

		#[test]
		fn not_equals_is_negation_of_equals(a: i64, b: i64) {
			let (va, vb) = (serde_json::json!(a), serde_json::json!(b));
			let eq = Operator::Eq.evaluate(Some(&va), &vb);
			let ne = Operator::Ne.evaluate(Some(&va), &vb);
			prop_assert_eq!(eq, !ne);
		}

		#[test]
		fn not_in_is_negation_of_in(needle: i64, haystack in prop::collection::vec(1i64..100, 0..5)) {
			let n = serde_json::json!(needle);
			let h = serde_json::json!(haystack);
			prop_assert_eq!(
				Operator::In.evaluate(Some(&n), &h),
				!Operator::NotIn.evaluate(Some(&n), &h)
			);
		}

		#[test]
		fn ordering_operators_agree(a: i32, b: i32) {
			let (va, vb) = (serde_json::json!(a), serde_json::json!(b));
			prop_assert_eq!(Operator::Gt.evaluate(Some(&va), &vb), a > b);
			prop_assert_eq!(Operator::Lte.evaluate(Some(&va), &vb), a <= b);
		}
	}
}
