// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::EvaluationContext;
use crate::error::ErrorCode;
use crate::evaluation::{evaluate, EvaluationReason, EvaluationResult};
use crate::flag::Flag;

/// Immutable set of flags as of one refresh.
///
/// A refresh builds a new snapshot and swaps it in; an existing snapshot is
/// never modified, so evaluations holding one see a consistent view.
#[derive(Debug, Clone)]
pub struct Snapshot {
	flags: HashMap<String, Arc<Flag>>,
	created_at: DateTime<Utc>,
}

impl Snapshot {
	pub fn new(flags: HashMap<String, Flag>) -> Self {
		Self {
			flags: flags.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
			created_at: Utc::now(),
		}
	}

	pub fn empty() -> Self {
		Self::new(HashMap::new())
	}

	pub fn get(&self, flag_key: &str) -> Option<&Arc<Flag>> {
		self.flags.get(flag_key)
	}

	pub fn contains(&self, flag_key: &str) -> bool {
		self.flags.contains_key(flag_key)
	}

	pub fn len(&self) -> usize {
		self.flags.len()
	}

	pub fn is_empty(&self) -> bool {
		self.flags.is_empty()
	}

	pub fn created_at(&self) -> DateTime<Utc> {
		self.created_at
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Flag>)> {
		self.flags.iter()
	}

	/// Flag keys in sorted order.
	pub fn keys(&self) -> Vec<&str> {
		let mut keys: Vec<&str> = self.flags.keys().map(String::as_str).collect();
		keys.sort_unstable();
		keys
	}

	/// Deep copy of the flags, for callers that want to inspect the cache.
	pub fn to_flags(&self) -> HashMap<String, Flag> {
		self
			.flags
			.iter()
			.map(|(k, v)| (k.clone(), Flag::clone(v)))
			.collect()
	}

	/// Evaluates one flag, serving `sdk_default` when it does not exist.
	pub fn evaluate(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		sdk_default: &Value,
		now: DateTime<Utc>,
	) -> EvaluationResult {
		match self.get(flag_key) {
			Some(flag) => evaluate(flag_key, flag, context, sdk_default, now),
			None => EvaluationResult::flag_not_found(flag_key, sdk_default.clone()),
		}
	}

	/// Evaluates every flag, honouring the context's flag filter.
	pub fn evaluate_all(&self, context: &EvaluationContext, now: DateTime<Utc>) -> AllFlagsState {
		let mut state = AllFlagsState::default();
		for (key, flag) in &self.flags {
			if !context.includes_flag(key) {
				continue;
			}
			let result = evaluate(key, flag, context, &Value::Null, now);
			state.insert(key.clone(), FlagState::from_result(result, now));
		}
		state
	}
}

impl Default for Snapshot {
	fn default() -> Self {
		Self::empty()
	}
}

/// Per-flag entry of a bulk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
	pub value: Value,
	pub variation: String,
	pub reason: EvaluationReason,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_code: Option<ErrorCode>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub timestamp: i64,
	pub track_events: bool,
	pub failed: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metadata: BTreeMap<String, Value>,
}

impl FlagState {
	pub fn from_result(result: EvaluationResult, at: DateTime<Utc>) -> Self {
		Self {
			failed: result.is_error(),
			value: result.value,
			variation: result.variation,
			reason: result.reason,
			error_code: result.error_code,
			error_message: result.error_message,
			timestamp: at.timestamp(),
			track_events: result.track_events,
			version: result.version,
			metadata: result.metadata,
		}
	}
}

/// Result of evaluating all flags for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllFlagsState {
	pub flags: BTreeMap<String, FlagState>,
	/// False when at least one flag failed to evaluate.
	pub valid: bool,
}

impl Default for AllFlagsState {
	fn default() -> Self {
		Self {
			flags: BTreeMap::new(),
			valid: true,
		}
	}
}

impl AllFlagsState {
	pub fn insert(&mut self, flag_key: String, state: FlagState) {
		if state.failed {
			self.valid = false;
		}
		self.flags.insert(flag_key, state);
	}

	pub fn get(&self, flag_key: &str) -> Option<&FlagState> {
		self.flags.get(flag_key)
	}

	pub fn len(&self) -> usize {
		self.flags.len()
	}

	pub fn is_empty(&self) -> bool {
		self.flags.is_empty()
	}

	/// Flag key to served value.
	pub fn values(&self) -> BTreeMap<String, Value> {
		self
			.flags
			.iter()
			.map(|(k, s)| (k.clone(), s.value.clone()))
			.collect()
	}
}
