// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature flags Rust SDK for Vane.
//!
//! The client keeps an in-memory copy of the flag set, refreshed in the
//! background from one or more retrievers, and evaluates flags locally
//! without any network round trip.
//!
//! # Features
//!
//! - **Local evaluation**: targeting rules, percentage splits and progressive
//!   rollouts evaluated against a cached snapshot
//! - **Background refresh**: periodic polling with atomic swap, single-flight
//!   forced refresh and change notifications
//! - **Event export**: per-exporter buffers flushed on size or interval
//! - **Offline mode**: serve caller defaults without retrieval or export
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vane_flags::{EvaluationContext, FileRetriever, FlagsClient, LogExporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FlagsClient::builder()
//!         .retriever(Arc::new(FileRetriever::new("flags.yaml")))
//!         .exporter(Arc::new(LogExporter))
//!         .build()
//!         .await?;
//!
//!     let context = EvaluationContext::new("user-123")
//!         .with_attribute("plan", serde_json::json!("enterprise"));
//!
//!     let enabled = client.get_bool("new-checkout", &context, false);
//!     let theme = client.get_string("ui.theme", &context, "light");
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod cache;
mod client;
mod config;
mod error;
mod export;
mod notifier;
mod refresh;
mod retriever;

pub use cache::{CacheState, FlagCache};
pub use client::{FlagsClient, FlagsClientBuilder};
pub use config::{
	duration_secs, load_config, ClientConfig, ClientConfigLayer, ConfigSource, DefaultsSource,
	EnvSource, ExporterConfigLayer, Precedence, TomlSource, MIN_POLLING_INTERVAL,
};
pub use error::{ClientError, Result};
pub use export::{
	ExportPipeline, Exporter, ExporterBuffer, ExporterSettings, InMemoryExporter, LogExporter,
	OverflowPolicy,
};
pub use notifier::{LogNotifier, NotificationService, Notifier};
pub use refresh::{RefreshScheduler, RefreshSettings};
pub use retriever::{
	FileRetriever, InMemoryRetriever, Retriever, RetrieverManager, RetrieverStatus,
};

// Re-export core types for convenience
pub use vane_flags_core::{
	AllFlagsState, DiffCache, DiffUpdated, ErrorCode, EvaluationContext, EvaluationDetails,
	EvaluationReason, EvaluationResult, EventKind, ExportEvent, FeatureEvent, Flag, FlagFormat,
	FlagState, FlagValue, FlagsError, Rule, Snapshot, TrackingEvent,
};
