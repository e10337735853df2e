// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types and evaluation engine for the Vane feature flags system.
//!
//! This crate is pure: it performs no I/O and holds no shared mutable state.
//! The client SDK (`vane-flags`) layers caching, background refresh and event
//! export on top of it.
//!
//! # Overview
//!
//! - Flags with typed variations, ordered targeting rules and a default rule
//! - Percentage splits bucketed with MurmurHash3 for stable assignment
//! - Progressive rollouts, scheduled steps and experimentation windows
//! - Immutable snapshots and structural diffs between them
//! - Feature and tracking events for export
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use serde_json::json;
//! use vane_flags_core::{evaluate, EvaluationContext, EvaluationReason, Flag, Rule};
//!
//! let flag = Flag::new()
//!     .with_variation("on", json!(true))
//!     .with_variation("off", json!(false))
//!     .with_default_rule(Rule::split([("on", 20.0), ("off", 80.0)]));
//!
//! let ctx = EvaluationContext::new("user-123").with_attribute("plan", json!("pro"));
//! let result = evaluate("new-checkout", &flag, &ctx, &json!(false), Utc::now());
//!
//! assert_eq!(result.reason, EvaluationReason::Split);
//! ```

pub mod bucketing;
pub mod context;
pub mod diff;
pub mod error;
pub mod evaluation;
pub mod event;
pub mod flag;
pub mod parse;
pub mod rollout;
pub mod rule;
pub mod snapshot;

pub use bucketing::{assign, hash32, Bucket, PercentageSplit, PERCENTAGE_MULTIPLIER};
pub use context::EvaluationContext;
pub use diff::{DiffCache, DiffUpdated};
pub use error::{ErrorCode, FlagsError, Result};
pub use evaluation::{
	evaluate, EvaluationDetails, EvaluationReason, EvaluationResult, FlagValue,
	EVALUATED_RULE_NAME_KEY, SDK_DEFAULT_VARIATION,
};
pub use event::{EventKind, ExportEvent, FeatureEvent, TrackingEvent};
pub use flag::{Flag, ScheduledStep};
pub use parse::{parse_flags, FlagFormat};
pub use rollout::{Experimentation, ProgressiveRollout, RolloutStep};
pub use rule::{Condition, Operator, Resolution, Rule};
pub use snapshot::{AllFlagsState, FlagState, Snapshot};
