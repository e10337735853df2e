// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag evaluation: rule walk, default rule, typed conversion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::EvaluationContext;
use crate::error::{ErrorCode, FlagsError};
use crate::flag::{json_type_name, Flag};
use crate::rule::Rule;

/// Variation name reported when the caller's default value was served.
pub const SDK_DEFAULT_VARIATION: &str = "SdkDefault";

/// Metadata key carrying the name of the matched targeting rule.
pub const EVALUATED_RULE_NAME_KEY: &str = "evaluatedRuleName";

/// Why a flag resolved to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
	/// Fixed default rule on a flag without targeting rules.
	Static,
	/// A targeting rule with a fixed outcome matched.
	TargetingMatch,
	/// The outcome came out of a percentage split or progressive rollout.
	Split,
	/// No targeting rule matched and the default rule is fixed.
	Default,
	/// The flag is disabled or its experimentation window is closed.
	Disabled,
	Error,
}

impl EvaluationReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			EvaluationReason::Static => "STATIC",
			EvaluationReason::TargetingMatch => "TARGETING_MATCH",
			EvaluationReason::Split => "SPLIT",
			EvaluationReason::Default => "DEFAULT",
			EvaluationReason::Disabled => "DISABLED",
			EvaluationReason::Error => "ERROR",
		}
	}
}

impl std::fmt::Display for EvaluationReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of evaluating one flag, with the value converted to `T`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails<T> {
	pub flag_key: String,
	pub value: T,
	pub variation: String,
	pub reason: EvaluationReason,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_code: Option<ErrorCode>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub track_events: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metadata: BTreeMap<String, Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rule_index: Option<usize>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rule_name: Option<String>,
	pub cacheable: bool,
}

/// Untyped evaluation outcome.
pub type EvaluationResult = EvaluationDetails<Value>;

impl<T> EvaluationDetails<T> {
	/// True when the caller default was served because of an error.
	pub fn is_error(&self) -> bool {
		self.error_code.is_some()
	}

	/// True when the served value is the caller default.
	pub fn is_sdk_default(&self) -> bool {
		self.variation == SDK_DEFAULT_VARIATION
	}

	fn map_value<U>(self, value: U) -> EvaluationDetails<U> {
		EvaluationDetails {
			flag_key: self.flag_key,
			value,
			variation: self.variation,
			reason: self.reason,
			error_code: self.error_code,
			error_message: self.error_message,
			track_events: self.track_events,
			version: self.version,
			metadata: self.metadata,
			rule_index: self.rule_index,
			rule_name: self.rule_name,
			cacheable: self.cacheable,
		}
	}
}

impl EvaluationResult {
	/// Result carrying the caller default because `error` occurred.
	pub fn from_error(flag_key: &str, sdk_default: Value, error: &FlagsError) -> Self {
		Self {
			flag_key: flag_key.to_string(),
			value: sdk_default,
			variation: SDK_DEFAULT_VARIATION.to_string(),
			reason: EvaluationReason::Error,
			error_code: Some(error.code()),
			error_message: Some(error.to_string()),
			track_events: true,
			version: None,
			metadata: BTreeMap::new(),
			rule_index: None,
			rule_name: None,
			cacheable: false,
		}
	}

	pub fn flag_not_found(flag_key: &str, sdk_default: Value) -> Self {
		Self::from_error(
			flag_key,
			sdk_default,
			&FlagsError::FlagNotFound(flag_key.to_string()),
		)
	}

	/// Converts the value to `T`, serving `sdk_default` with TYPE_MISMATCH
	/// when the JSON type does not fit. Errors already recorded keep the
	/// caller default.
	pub fn into_typed<T: FlagValue>(self, sdk_default: T) -> EvaluationDetails<T> {
		if self.is_error() || self.is_sdk_default() {
			return self.map_value(sdk_default);
		}

		match T::from_value(&self.value) {
			Some(value) => self.map_value(value),
			None => {
				let error = FlagsError::TypeMismatch {
					flag_key: self.flag_key.clone(),
					expected: T::TYPE_NAME,
					actual: json_type_name(&self.value),
				};
				let mut details = self.map_value(sdk_default);
				details.variation = SDK_DEFAULT_VARIATION.to_string();
				details.reason = EvaluationReason::Error;
				details.error_code = Some(error.code());
				details.error_message = Some(error.to_string());
				details.rule_index = None;
				details.rule_name = None;
				details.cacheable = false;
				details
			}
		}
	}
}

impl<T: FlagValue> EvaluationDetails<T> {
	/// Back to an untyped result, e.g. to build a feature event.
	pub fn to_untyped(&self) -> EvaluationResult {
		self.clone().map_value(self.value.clone().into_value())
	}
}

/// Rust types a flag value can be read as.
pub trait FlagValue: Clone + Sized {
	const TYPE_NAME: &'static str;

	fn from_value(value: &Value) -> Option<Self>;

	fn into_value(self) -> Value;
}

impl FlagValue for bool {
	const TYPE_NAME: &'static str = "boolean";

	fn from_value(value: &Value) -> Option<Self> {
		value.as_bool()
	}

	fn into_value(self) -> Value {
		Value::Bool(self)
	}
}

impl FlagValue for i64 {
	const TYPE_NAME: &'static str = "integer";

	/// Floats are truncated toward zero.
	fn from_value(value: &Value) -> Option<Self> {
		value
			.as_i64()
			.or_else(|| value.as_f64().map(|f| f.trunc() as i64))
	}

	fn into_value(self) -> Value {
		Value::from(self)
	}
}

impl FlagValue for f64 {
	const TYPE_NAME: &'static str = "float";

	fn from_value(value: &Value) -> Option<Self> {
		value.as_f64()
	}

	fn into_value(self) -> Value {
		Value::from(self)
	}
}

impl FlagValue for String {
	const TYPE_NAME: &'static str = "string";

	fn from_value(value: &Value) -> Option<Self> {
		value.as_str().map(str::to_owned)
	}

	fn into_value(self) -> Value {
		Value::String(self)
	}
}

impl FlagValue for Vec<Value> {
	const TYPE_NAME: &'static str = "array";

	fn from_value(value: &Value) -> Option<Self> {
		value.as_array().cloned()
	}

	fn into_value(self) -> Value {
		Value::Array(self)
	}
}

impl FlagValue for Map<String, Value> {
	const TYPE_NAME: &'static str = "object";

	fn from_value(value: &Value) -> Option<Self> {
		value.as_object().cloned()
	}

	fn into_value(self) -> Value {
		Value::Object(self)
	}
}

impl FlagValue for Value {
	const TYPE_NAME: &'static str = "any";

	fn from_value(value: &Value) -> Option<Self> {
		Some(value.clone())
	}

	fn into_value(self) -> Value {
		self
	}
}

struct Selection<'a> {
	rule: &'a Rule,
	variation: String,
	reason: EvaluationReason,
	rule_index: Option<usize>,
}

/// Evaluates `flag` for `context`.
///
/// The evaluation order is:
/// 1. Apply scheduled rollout steps due at the evaluation time
/// 2. Disabled flag or closed experimentation window serves the caller default
/// 3. First enabled targeting rule whose query matches
/// 4. Default rule
///
/// A bucketing key is only required on the path that actually buckets.
/// Never panics: every failure is folded into the result.
pub fn evaluate(
	flag_key: &str,
	flag: &Flag,
	context: &EvaluationContext,
	sdk_default: &Value,
	now: DateTime<Utc>,
) -> EvaluationResult {
	let now = context.evaluation_time_or(now);
	let effective = flag.apply_scheduled_steps(now);

	if effective.disable || !effective.is_experimentation_active(now) {
		return EvaluationResult {
			flag_key: flag_key.to_string(),
			value: sdk_default.clone(),
			variation: SDK_DEFAULT_VARIATION.to_string(),
			reason: EvaluationReason::Disabled,
			error_code: None,
			error_message: None,
			track_events: effective.is_track_events(),
			version: effective.version.clone(),
			metadata: effective.metadata.clone(),
			rule_index: None,
			rule_name: None,
			cacheable: flag.is_cacheable(),
		};
	}

	let failed = |error: FlagsError| {
		let mut result = EvaluationResult::from_error(flag_key, sdk_default.clone(), &error);
		result.track_events = effective.is_track_events();
		result.version = effective.version.clone();
		result.metadata = effective.metadata.clone();
		result
	};

	let bucketing_key = match effective.bucketing_key_value(context) {
		Ok(key) => key,
		Err(e) => return failed(e),
	};

	let selection = match select_variation(flag_key, &effective, context, bucketing_key.as_deref(), now)
	{
		Ok(selection) => selection,
		Err(e) => return failed(e),
	};

	let Some(value) = effective.variation_value(&selection.variation) else {
		return failed(FlagsError::InvalidConfiguration(format!(
			"variation {} is not defined",
			selection.variation
		)));
	};

	let rule_name = selection.rule.name.clone().filter(|n| !n.is_empty());
	let mut metadata = effective.metadata.clone();
	if let (Some(name), Some(_)) = (&rule_name, selection.rule_index) {
		metadata.insert(EVALUATED_RULE_NAME_KEY.to_string(), Value::String(name.clone()));
	}

	EvaluationResult {
		flag_key: flag_key.to_string(),
		value: value.clone(),
		variation: selection.variation,
		reason: selection.reason,
		error_code: None,
		error_message: None,
		track_events: effective.is_track_events(),
		version: effective.version.clone(),
		metadata,
		rule_index: selection.rule_index,
		rule_name: rule_name.filter(|_| selection.rule_index.is_some()),
		cacheable: flag.is_cacheable() && selection.rule.progressive_rollout.is_none(),
	}
}

fn select_variation<'a>(
	flag_key: &str,
	flag: &'a Flag,
	context: &EvaluationContext,
	bucketing_key: Option<&str>,
	now: DateTime<Utc>,
) -> Result<Selection<'a>, FlagsError> {
	for (index, rule) in flag.targeting.iter().enumerate() {
		if rule.is_disabled() || !rule.matches(context) {
			continue;
		}
		let resolution = rule.resolve(flag_key, bucketing_key, now)?;
		let reason = if resolution.bucketed && rule.is_dynamic() {
			EvaluationReason::Split
		} else {
			EvaluationReason::TargetingMatch
		};
		return Ok(Selection {
			rule,
			variation: resolution.variation,
			reason,
			rule_index: Some(index),
		});
	}

	let rule = flag
		.default_rule
		.as_ref()
		.ok_or_else(|| FlagsError::InvalidConfiguration("flag has no default rule".to_string()))?;
	let resolution = rule.resolve(flag_key, bucketing_key, now)?;

	let reason = if resolution.bucketed && rule.is_dynamic() {
		EvaluationReason::Split
	} else if flag.targeting.is_empty() {
		EvaluationReason::Static
	} else {
		EvaluationReason::Default
	};

	Ok(Selection {
		rule,
		variation: resolution.variation,
		reason,
		rule_index: None,
	})
}
