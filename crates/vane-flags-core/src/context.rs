// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute name that always resolves to the context's targeting key.
pub const TARGETING_KEY_ATTRIBUTE: &str = "targetingKey";

/// Attribute name used to mark a context as anonymous.
pub const ANONYMOUS_ATTRIBUTE: &str = "anonymous";

/// Caller-supplied context a flag is evaluated against.
///
/// Built once per evaluation with the `with_*` builder methods and never
/// mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
	/// Identity used for percentage bucketing. May be absent for flags that
	/// never bucket.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub targeting_key: Option<String>,
	#[serde(default)]
	pub anonymous: bool,
	#[serde(default)]
	pub attributes: HashMap<String, serde_json::Value>,
	/// Restricts bulk evaluation to these flag keys.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub flag_filter: Option<Vec<String>>,
	/// Overrides the wall clock for rollout and schedule computations.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub evaluation_time: Option<DateTime<Utc>>,
}

impl EvaluationContext {
	pub fn new(targeting_key: impl Into<String>) -> Self {
		Self {
			targeting_key: Some(targeting_key.into()),
			..Self::default()
		}
	}

	/// A context without any targeting key.
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn anonymous_user(targeting_key: impl Into<String>) -> Self {
		Self::new(targeting_key).with_anonymous(true)
	}

	pub fn with_targeting_key(mut self, targeting_key: impl Into<String>) -> Self {
		self.targeting_key = Some(targeting_key.into());
		self
	}

	pub fn with_anonymous(mut self, anonymous: bool) -> Self {
		self.anonymous = anonymous;
		self
	}

	pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
		let name = name.into();
		if !name.is_empty() {
			self.attributes.insert(name, value);
		}
		self
	}

	pub fn with_flag_filter<I, S>(mut self, keys: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.flag_filter = Some(keys.into_iter().map(Into::into).collect());
		self
	}

	pub fn with_evaluation_time(mut self, at: DateTime<Utc>) -> Self {
		self.evaluation_time = Some(at);
		self
	}

	/// Returns the targeting key, treating an empty string as absent.
	pub fn key(&self) -> Option<&str> {
		self.targeting_key.as_deref().filter(|k| !k.is_empty())
	}

	/// True when the context is flagged anonymous, either explicitly or via
	/// the `anonymous` attribute.
	pub fn is_anonymous(&self) -> bool {
		self.anonymous
			|| self
				.attributes
				.get(ANONYMOUS_ATTRIBUTE)
				.and_then(serde_json::Value::as_bool)
				.unwrap_or(false)
	}

	/// `"anonymousUser"` or `"user"`, as carried on feature events.
	pub fn context_kind(&self) -> &'static str {
		if self.is_anonymous() {
			"anonymousUser"
		} else {
			"user"
		}
	}

	/// Resolves an attribute by name. Dotted names walk nested objects and
	/// `targetingKey` resolves to the targeting key.
	pub fn attribute(&self, path: &str) -> Option<serde_json::Value> {
		if path == TARGETING_KEY_ATTRIBUTE {
			return self
				.targeting_key
				.as_ref()
				.map(|k| serde_json::Value::String(k.clone()));
		}

		if let Some(value) = self.attributes.get(path) {
			return Some(value.clone());
		}

		let mut segments = path.split('.');
		let first = segments.next()?;
		let mut current = self.attributes.get(first)?;
		for segment in segments {
			current = current.as_object()?.get(segment)?;
		}
		Some(current.clone())
	}

	/// Whether bulk evaluation should include `flag_key`.
	pub fn includes_flag(&self, flag_key: &str) -> bool {
		match &self.flag_filter {
			Some(keys) if !keys.is_empty() => keys.iter().any(|k| k == flag_key),
			_ => true,
		}
	}

	pub fn evaluation_time_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
		self.evaluation_time.unwrap_or(now)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn empty_targeting_key_is_absent() {
		assert_eq!(EvaluationContext::new("").key(), None);
		assert_eq!(EvaluationContext::empty().key(), None);
		assert_eq!(EvaluationContext::new("user-1").key(), Some("user-1"));
	}

	#[test]
	fn anonymous_from_flag_or_attribute() {
		assert!(EvaluationContext::anonymous_user("a").is_anonymous());
		let ctx = EvaluationContext::new("b").with_attribute("anonymous", json!(true));
		assert!(ctx.is_anonymous());
		assert_eq!(ctx.context_kind(), "anonymousUser");
		assert_eq!(EvaluationContext::new("c").context_kind(), "user");
	}

	#[test]
	fn nested_attribute_lookup() {
		let ctx = EvaluationContext::new("user-1")
			.with_attribute("company", json!({"name": "acme", "plan": {"tier": "gold"}}));

		assert_eq!(ctx.attribute("company.plan.tier"), Some(json!("gold")));
		assert_eq!(ctx.attribute("company.missing"), None);
		assert_eq!(ctx.attribute("targetingKey"), Some(json!("user-1")));
	}

	#[test]
	fn empty_attribute_names_are_ignored() {
		let ctx = EvaluationContext::new("k").with_attribute("", json!(1));
		assert!(ctx.attributes.is_empty());
	}

	#[test]
	fn flag_filter_limits_bulk_evaluation() {
		let ctx = EvaluationContext::new("k").with_flag_filter(["a", "b"]);
		assert!(ctx.includes_flag("a"));
		assert!(!ctx.includes_flag("c"));
		assert!(EvaluationContext::new("k").includes_flag("anything"));
	}
}
