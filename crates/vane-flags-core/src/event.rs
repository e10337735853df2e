// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Events produced by evaluations and explicit tracking calls.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::EvaluationContext;
use crate::evaluation::EvaluationResult;

/// Where an evaluation event was produced.
pub const SOURCE_SERVER: &str = "SERVER";

/// Event category, used by exporters to pick what they receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
	#[default]
	Feature,
	Tracking,
}

impl std::fmt::Display for EventKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			EventKind::Feature => f.write_str("feature"),
			EventKind::Tracking => f.write_str("tracking"),
		}
	}
}

/// One flag evaluation as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEvent {
	/// `user` or `anonymousUser`.
	pub context_kind: String,
	pub user_key: String,
	#[serde(with = "chrono::serde::ts_seconds")]
	pub creation_date: DateTime<Utc>,
	pub key: String,
	pub variation: String,
	pub value: Value,
	/// True when evaluation failed and the caller default was served.
	pub default: bool,
	#[serde(default)]
	pub version: String,
	pub source: String,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metadata: BTreeMap<String, Value>,
}

impl FeatureEvent {
	pub fn from_evaluation(context: &EvaluationContext, result: &EvaluationResult) -> Self {
		Self {
			context_kind: context.context_kind().to_string(),
			user_key: context.targeting_key.clone().unwrap_or_default(),
			creation_date: Utc::now(),
			key: result.flag_key.clone(),
			variation: result.variation.clone(),
			value: result.value.clone(),
			default: result.is_error(),
			version: result.version.clone().unwrap_or_default(),
			source: SOURCE_SERVER.to_string(),
			metadata: result.metadata.clone(),
		}
	}

	pub fn with_source(mut self, source: impl Into<String>) -> Self {
		self.source = source.into();
		self
	}
}

/// An application-level event recorded through `track`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
	pub context_kind: String,
	pub user_key: String,
	#[serde(with = "chrono::serde::ts_seconds")]
	pub creation_date: DateTime<Utc>,
	pub key: String,
	#[serde(default)]
	pub evaluation_context: HashMap<String, Value>,
	#[serde(default)]
	pub tracking_event_details: BTreeMap<String, Value>,
}

impl TrackingEvent {
	pub fn new(
		key: impl Into<String>,
		context: &EvaluationContext,
		details: BTreeMap<String, Value>,
	) -> Self {
		let mut evaluation_context = context.attributes.clone();
		if let Some(k) = &context.targeting_key {
			evaluation_context.insert(
				crate::context::TARGETING_KEY_ATTRIBUTE.to_string(),
				Value::String(k.clone()),
			);
		}

		Self {
			context_kind: context.context_kind().to_string(),
			user_key: context.targeting_key.clone().unwrap_or_default(),
			creation_date: Utc::now(),
			key: key.into(),
			evaluation_context,
			tracking_event_details: details,
		}
	}
}

/// Anything an exporter can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExportEvent {
	Feature(FeatureEvent),
	Tracking(TrackingEvent),
}

impl ExportEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			ExportEvent::Feature(_) => EventKind::Feature,
			ExportEvent::Tracking(_) => EventKind::Tracking,
		}
	}

	pub fn key(&self) -> &str {
		match self {
			ExportEvent::Feature(e) => &e.key,
			ExportEvent::Tracking(e) => &e.key,
		}
	}

	pub fn user_key(&self) -> &str {
		match self {
			ExportEvent::Feature(e) => &e.user_key,
			ExportEvent::Tracking(e) => &e.user_key,
		}
	}

	pub fn creation_date(&self) -> DateTime<Utc> {
		match self {
			ExportEvent::Feature(e) => e.creation_date,
			ExportEvent::Tracking(e) => e.creation_date,
		}
	}
}

impl From<FeatureEvent> for ExportEvent {
	fn from(event: FeatureEvent) -> Self {
		ExportEvent::Feature(event)
	}
}

impl From<TrackingEvent> for ExportEvent {
	fn from(event: TrackingEvent) -> Self {
		ExportEvent::Tracking(event)
	}
}
