// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::EvaluationContext;
use crate::error::{FlagsError, Result};
use crate::rollout::Experimentation;
use crate::rule::{merge_rules, Rule};

/// A feature flag as read from a flag source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
	/// Variation name to value. All values are expected to share one JSON type.
	#[serde(default)]
	pub variations: BTreeMap<String, Value>,
	/// Targeting rules, evaluated in declared order.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub targeting: Vec<Rule>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_rule: Option<Rule>,
	/// Context attribute used for bucketing instead of the targeting key.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bucketing_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub experimentation: Option<Experimentation>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub scheduled_rollout: Vec<ScheduledStep>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub track_events: Option<bool>,
	#[serde(default)]
	pub disable: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metadata: BTreeMap<String, Value>,
}

/// A dated patch applied to a flag once the evaluation time reaches `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledStep {
	pub date: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variations: Option<BTreeMap<String, Value>>,
	/// Rules merged into the flag's targeting by name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub targeting: Option<Vec<Rule>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_rule: Option<Rule>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub experimentation: Option<Experimentation>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub track_events: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub disable: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
}

impl ScheduledStep {
	pub fn at(date: DateTime<Utc>) -> Self {
		Self {
			date,
			variations: None,
			targeting: None,
			default_rule: None,
			experimentation: None,
			track_events: None,
			disable: None,
			version: None,
		}
	}

	fn has_finite_numbers(&self) -> bool {
		self.default_rule.as_ref().map_or(true, Rule::has_finite_numbers)
			&& self
				.targeting
				.iter()
				.flatten()
				.all(Rule::has_finite_numbers)
	}

	fn apply_to(&self, flag: &mut Flag) {
		if let Some(updates) = &self.targeting {
			merge_rules(&mut flag.targeting, updates);
		}
		if let Some(patch) = &self.default_rule {
			match flag.default_rule.as_mut() {
				Some(rule) => rule.merge(patch),
				None => flag.default_rule = Some(patch.clone()),
			}
		}
		if let Some(variations) = &self.variations {
			for (name, value) in variations {
				flag.variations.insert(name.clone(), value.clone());
			}
		}
		if let Some(window) = &self.experimentation {
			flag
				.experimentation
				.get_or_insert_with(Experimentation::default)
				.merge(window);
		}
		if self.track_events.is_some() {
			flag.track_events = self.track_events;
		}
		if let Some(disable) = self.disable {
			flag.disable = disable;
		}
		if self.version.is_some() {
			flag.version = self.version.clone();
		}
	}
}

impl Flag {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_variation(mut self, name: impl Into<String>, value: Value) -> Self {
		self.variations.insert(name.into(), value);
		self
	}

	pub fn with_rule(mut self, rule: Rule) -> Self {
		self.targeting.push(rule);
		self
	}

	pub fn with_default_rule(mut self, rule: Rule) -> Self {
		self.default_rule = Some(rule);
		self
	}

	pub fn with_disable(mut self, disable: bool) -> Self {
		self.disable = disable;
		self
	}

	pub fn with_version(mut self, version: impl Into<String>) -> Self {
		self.version = Some(version.into());
		self
	}

	pub fn with_bucketing_key(mut self, attribute: impl Into<String>) -> Self {
		self.bucketing_key = Some(attribute.into());
		self
	}

	pub fn with_track_events(mut self, track: bool) -> Self {
		self.track_events = Some(track);
		self
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
		self.metadata.insert(key.into(), value);
		self
	}

	pub fn with_experimentation(mut self, window: Experimentation) -> Self {
		self.experimentation = Some(window);
		self
	}

	pub fn with_scheduled_step(mut self, step: ScheduledStep) -> Self {
		self.scheduled_rollout.push(step);
		self
	}

	/// Events are tracked unless explicitly turned off.
	pub fn is_track_events(&self) -> bool {
		self.track_events.unwrap_or(true)
	}

	pub fn variation_value(&self, name: &str) -> Option<&Value> {
		self.variations.get(name)
	}

	/// Flags whose outcome changes with time are not cacheable by callers.
	pub fn is_cacheable(&self) -> bool {
		self.scheduled_rollout.is_empty() && self.experimentation.is_none()
	}

	/// False when any percentage, including those in scheduled steps, is NaN
	/// or infinite.
	pub fn has_finite_numbers(&self) -> bool {
		self.default_rule.as_ref().map_or(true, Rule::has_finite_numbers)
			&& self.targeting.iter().all(Rule::has_finite_numbers)
			&& self
				.scheduled_rollout
				.iter()
				.all(ScheduledStep::has_finite_numbers)
	}

	pub fn is_experimentation_active(&self, now: DateTime<Utc>) -> bool {
		self
			.experimentation
			.as_ref()
			.map_or(true, |window| window.is_active(now))
	}

	/// Returns the flag as it applies at `now`: every scheduled step dated at
	/// or before `now` is applied, in declared order, to a copy.
	pub fn apply_scheduled_steps(&self, now: DateTime<Utc>) -> Cow<'_, Flag> {
		if !self.scheduled_rollout.iter().any(|s| s.date <= now) {
			return Cow::Borrowed(self);
		}

		let mut effective = self.clone();
		for step in self.scheduled_rollout.iter().filter(|s| s.date <= now) {
			step.apply_to(&mut effective);
		}
		Cow::Owned(effective)
	}

	/// Reads the bucketing input for `context`.
	///
	/// Without a custom bucketing attribute this is the targeting key. With
	/// one, the attribute must hold a string; a value of another type is
	/// rejected. A missing or empty key is `None`, and only becomes an error
	/// once a path actually buckets.
	pub fn bucketing_key_value(&self, context: &EvaluationContext) -> Result<Option<String>> {
		let attribute = match self.bucketing_key.as_deref() {
			Some(name) if !name.is_empty() => name,
			_ => return Ok(context.key().map(str::to_owned)),
		};

		match context.attribute(attribute) {
			None | Some(Value::Null) => Ok(None),
			Some(Value::String(s)) if s.is_empty() => Ok(None),
			Some(Value::String(s)) => Ok(Some(s)),
			Some(other) => Err(FlagsError::InvalidBucketingKey(format!(
				"attribute {attribute} holds a {} value",
				json_type_name(&other)
			))),
		}
	}

	/// Checks the flag is internally consistent.
	pub fn validate(&self) -> Result<()> {
		if self.variations.is_empty() {
			return Err(FlagsError::InvalidConfiguration(
				"flag has no variations".to_string(),
			));
		}

		let mut expected_type = None;
		for (name, value) in &self.variations {
			if value.is_null() {
				return Err(FlagsError::InvalidConfiguration(format!(
					"variation {name} has a null value"
				)));
			}
			let kind = json_type_name(value);
			match expected_type {
				None => expected_type = Some(kind),
				Some(t) if t != kind => {
					return Err(FlagsError::InvalidConfiguration(
						"all variations must have the same type".to_string(),
					));
				}
				Some(_) => {}
			}
		}

		let default_rule = self.default_rule.as_ref().ok_or_else(|| {
			FlagsError::InvalidConfiguration("flag has no default rule".to_string())
		})?;
		self.validate_rule(default_rule)?;

		let mut names = HashSet::new();
		for rule in &self.targeting {
			self.validate_rule(rule)?;
			if let Some(name) = rule.name.as_deref().filter(|n| !n.is_empty()) {
				if !names.insert(name) {
					return Err(FlagsError::InvalidConfiguration(format!(
						"duplicated rule name: {name}"
					)));
				}
			}
		}

		Ok(())
	}

	fn validate_rule(&self, rule: &Rule) -> Result<()> {
		if rule.variation.is_none() && !rule.requires_bucketing() {
			return Err(FlagsError::InvalidConfiguration(format!(
				"rule {:?} has no variation, percentage or progressive rollout",
				rule.name()
			)));
		}

		if let Some(weights) = &rule.percentage {
			let total: f64 = weights.values().sum();
			if weights.values().any(|w| !w.is_finite() || *w < 0.0) || total <= 0.0 {
				return Err(FlagsError::InvalidConfiguration(format!(
					"rule {:?} has invalid percentages",
					rule.name()
				)));
			}
		}

		for name in rule.referenced_variations() {
			if !self.variations.contains_key(name) {
				return Err(FlagsError::InvalidConfiguration(format!(
					"rule {:?} references unknown variation {name}",
					rule.name()
				)));
			}
		}

		Ok(())
	}
}

/// JSON type name used in type-mismatch messages.
pub fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(n) if n.is_f64() => "float",
		Value::Number(_) => "integer",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
