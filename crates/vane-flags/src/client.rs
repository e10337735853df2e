// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The flags client.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, trace};
use vane_flags_core::{
	AllFlagsState, EvaluationContext, EvaluationDetails, EvaluationReason, EvaluationResult,
	FeatureEvent, Flag, FlagValue, TrackingEvent, SDK_DEFAULT_VARIATION,
};

use crate::cache::{CacheState, FlagCache};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::export::{ExportPipeline, Exporter, ExporterBuffer, ExporterSettings};
use crate::notifier::{NotificationService, Notifier};
use crate::refresh::RefreshScheduler;
use crate::retriever::{RetrieverManager, RetrieverStatus, Retriever};

/// Evaluates flags against a locally cached flag set.
///
/// Cloning is cheap; clones share the cache, the refresh task and the
/// exporters.
#[derive(Clone)]
pub struct FlagsClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	config: ClientConfig,
	/// Attributes merged into every evaluation context.
	enrichment: BTreeMap<String, Value>,
	cache: Arc<FlagCache>,
	/// Absent in offline mode.
	scheduler: Option<RefreshScheduler>,
	export: ExportPipeline,
	closed: AtomicBool,
}

impl FlagsClient {
	pub fn builder() -> FlagsClientBuilder {
		FlagsClientBuilder::new()
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	pub fn is_offline(&self) -> bool {
		self.inner.config.offline
	}

	/// Evaluates `flag_key` and returns the value, or `default` on any error.
	pub fn get<T: FlagValue>(&self, flag_key: &str, context: &EvaluationContext, default: T) -> T {
		self.get_details(flag_key, context, default).value
	}

	/// Evaluates `flag_key` and returns the full outcome.
	pub fn get_details<T: FlagValue>(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: T,
	) -> EvaluationDetails<T> {
		let raw = self.evaluate(flag_key, context, &default.clone().into_value());
		let details = raw.into_typed(default);
		self.record_evaluation(context, &details.to_untyped());
		details
	}

	pub fn get_bool(&self, flag_key: &str, context: &EvaluationContext, default: bool) -> bool {
		self.get(flag_key, context, default)
	}

	pub fn get_bool_details(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: bool,
	) -> EvaluationDetails<bool> {
		self.get_details(flag_key, context, default)
	}

	pub fn get_int(&self, flag_key: &str, context: &EvaluationContext, default: i64) -> i64 {
		self.get(flag_key, context, default)
	}

	pub fn get_int_details(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: i64,
	) -> EvaluationDetails<i64> {
		self.get_details(flag_key, context, default)
	}

	pub fn get_float(&self, flag_key: &str, context: &EvaluationContext, default: f64) -> f64 {
		self.get(flag_key, context, default)
	}

	pub fn get_float_details(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: f64,
	) -> EvaluationDetails<f64> {
		self.get_details(flag_key, context, default)
	}

	pub fn get_string(&self, flag_key: &str, context: &EvaluationContext, default: &str) -> String {
		self.get(flag_key, context, default.to_string())
	}

	pub fn get_string_details(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: &str,
	) -> EvaluationDetails<String> {
		self.get_details(flag_key, context, default.to_string())
	}

	pub fn get_json_array(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: Vec<Value>,
	) -> Vec<Value> {
		self.get(flag_key, context, default)
	}

	pub fn get_json_array_details(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: Vec<Value>,
	) -> EvaluationDetails<Vec<Value>> {
		self.get_details(flag_key, context, default)
	}

	pub fn get_json(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: Map<String, Value>,
	) -> Map<String, Value> {
		self.get(flag_key, context, default)
	}

	pub fn get_json_details(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: Map<String, Value>,
	) -> EvaluationDetails<Map<String, Value>> {
		self.get_details(flag_key, context, default)
	}

	/// Evaluates without any type conversion.
	pub fn raw_variation(
		&self,
		flag_key: &str,
		context: &EvaluationContext,
		default: Value,
	) -> EvaluationResult {
		let result = self.evaluate(flag_key, context, &default);
		self.record_evaluation(context, &result);
		result
	}

	/// Evaluates every cached flag, or those named by the context's flag
	/// filter. Emits no events.
	pub fn get_all(&self, context: &EvaluationContext) -> AllFlagsState {
		if self.is_offline() {
			return AllFlagsState {
				flags: BTreeMap::new(),
				valid: false,
			};
		}
		self
			.inner
			.cache
			.snapshot()
			.evaluate_all(&self.enrich(context), Utc::now())
	}

	/// Records an application event for the tracking exporters.
	pub fn track(
		&self,
		event_key: &str,
		context: &EvaluationContext,
		details: BTreeMap<String, Value>,
	) {
		if self.is_offline() {
			return;
		}
		self
			.inner
			.export
			.add_event(TrackingEvent::new(event_key, context, details).into());
	}

	/// Sends buffered events now.
	pub async fn flush_events(&self) {
		self.inner.export.flush().await;
	}

	/// Refreshes the cache out of cycle. Returns whether the refresh
	/// succeeded; false in offline mode or after close.
	pub async fn force_refresh(&self) -> bool {
		match &self.inner.scheduler {
			Some(scheduler) => scheduler.force_refresh().await,
			None => false,
		}
	}

	/// Time the cache last changed.
	pub fn cache_refresh_date(&self) -> Option<DateTime<Utc>> {
		self.inner.cache.refresh_date()
	}

	pub fn cache_state(&self) -> CacheState {
		self.inner.cache.state()
	}

	/// Copy of every cached flag.
	pub fn flags_from_cache(&self) -> HashMap<String, Flag> {
		self.inner.cache.snapshot().to_flags()
	}

	/// Flag keys present in the cache, sorted.
	pub fn flag_keys(&self) -> Vec<String> {
		self
			.inner
			.cache
			.snapshot()
			.keys()
			.into_iter()
			.map(str::to_string)
			.collect()
	}

	pub fn retriever_statuses(&self) -> Vec<(String, RetrieverStatus)> {
		match &self.inner.scheduler {
			Some(scheduler) => scheduler.retrievers().statuses(),
			None => Vec::new(),
		}
	}

	/// Stops polling and drains the exporters. Evaluations keep serving the
	/// last snapshot.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(scheduler) = &self.inner.scheduler {
			scheduler.close().await;
		}
		self.inner.export.close(self.inner.config.shutdown_timeout).await;
		info!("Flags client closed");
	}

	fn evaluate(&self, flag_key: &str, context: &EvaluationContext, default: &Value) -> EvaluationResult {
		if self.is_offline() {
			return offline_result(flag_key, default.clone());
		}

		let result = self
			.inner
			.cache
			.snapshot()
			.evaluate(flag_key, &self.enrich(context), default, Utc::now());
		trace!(
			flag_key = %flag_key,
			variation = %result.variation,
			reason = %result.reason,
			"Flag evaluated"
		);
		result
	}

	fn enrich<'a>(&self, context: &'a EvaluationContext) -> Cow<'a, EvaluationContext> {
		if self.inner.enrichment.is_empty() {
			return Cow::Borrowed(context);
		}
		let mut enriched = context.clone();
		enriched.attributes.extend(
			self
				.inner
				.enrichment
				.iter()
				.map(|(name, value)| (name.clone(), value.clone())),
		);
		Cow::Owned(enriched)
	}

	fn record_evaluation(&self, context: &EvaluationContext, result: &EvaluationResult) {
		if self.is_offline() || !result.track_events {
			return;
		}
		self
			.inner
			.export
			.add_event(FeatureEvent::from_evaluation(context, result).into());
	}
}

fn offline_result(flag_key: &str, default: Value) -> EvaluationResult {
	EvaluationDetails {
		flag_key: flag_key.to_string(),
		value: default,
		variation: SDK_DEFAULT_VARIATION.to_string(),
		reason: EvaluationReason::Disabled,
		error_code: None,
		error_message: None,
		track_events: false,
		version: None,
		metadata: BTreeMap::new(),
		rule_index: None,
		rule_name: None,
		cacheable: false,
	}
}

/// Builder for [`FlagsClient`].
#[derive(Default)]
pub struct FlagsClientBuilder {
	config: ClientConfig,
	retrievers: Vec<Arc<dyn Retriever>>,
	notifiers: Vec<Arc<dyn Notifier>>,
	exporters: Vec<(Arc<dyn Exporter>, Option<ExporterSettings>)>,
}

impl FlagsClientBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn config(mut self, config: ClientConfig) -> Self {
		self.config = config;
		self
	}

	/// Adds a flag source. Later sources override earlier ones.
	pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
		self.retrievers.push(retriever);
		self
	}

	pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifiers.push(notifier);
		self
	}

	/// Adds an exporter using the configured exporter settings.
	pub fn exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
		self.exporters.push((exporter, None));
		self
	}

	pub fn exporter_with_settings(
		mut self,
		exporter: Arc<dyn Exporter>,
		settings: ExporterSettings,
	) -> Self {
		self.exporters.push((exporter, Some(settings)));
		self
	}

	pub fn offline_mode(mut self, offline: bool) -> Self {
		self.config.offline = offline;
		self
	}

	pub fn polling_interval(mut self, interval: Duration) -> Self {
		self.config.polling_interval = interval;
		self
	}

	pub fn start_with_retriever_error(mut self, enabled: bool) -> Self {
		self.config.start_with_retriever_error = enabled;
		self
	}

	/// Sets the `env` attribute seen by targeting rules.
	pub fn environment(mut self, environment: impl Into<String>) -> Self {
		self.config.environment = Some(environment.into());
		self
	}

	/// Adds an attribute to every evaluation context.
	pub fn evaluation_context_enrichment(mut self, name: impl Into<String>, value: Value) -> Self {
		self
			.config
			.evaluation_context_enrichment
			.insert(name.into(), value);
		self
	}

	/// Validates the configuration, loads the flags once and starts the
	/// background tasks. Must be called inside a Tokio runtime.
	#[instrument(skip(self))]
	pub async fn build(self) -> Result<FlagsClient> {
		let config = self.config;
		config.validate()?;

		for settings in self.exporters.iter().filter_map(|(_, s)| s.as_ref()) {
			settings.validate()?;
		}

		if !config.offline && self.retrievers.is_empty() {
			return Err(ClientError::invalid_config(
				"retrievers",
				"at least one retriever is required",
			));
		}

		let cache = Arc::new(FlagCache::new());

		let scheduler = if config.offline {
			debug!("Offline mode, skipping flag retrieval");
			None
		} else {
			let scheduler = RefreshScheduler::new(
				Arc::clone(&cache),
				RetrieverManager::new(self.retrievers),
				NotificationService::new(self.notifiers),
				config.refresh_settings(),
			);
			if let Err(e) = scheduler.start().await {
				scheduler.close().await;
				return Err(e);
			}
			Some(scheduler)
		};

		let buffers = if config.offline {
			Vec::new()
		} else {
			self
				.exporters
				.into_iter()
				.map(|(exporter, settings)| {
					let settings = settings.unwrap_or_else(|| config.exporter.clone());
					Arc::new(ExporterBuffer::new(settings, exporter))
				})
				.collect()
		};
		let export = ExportPipeline::spawn(buffers);

		info!(
			offline = config.offline,
			flag_count = cache.len(),
			"Flags client started"
		);

		Ok(FlagsClient {
			inner: Arc::new(ClientInner {
				enrichment: config.context_enrichment(),
				config,
				cache,
				scheduler,
				export,
				closed: AtomicBool::new(false),
			}),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::export::InMemoryExporter;
	use crate::retriever::InMemoryRetriever;
	use serde_json::json;
	use vane_flags_core::{ErrorCode, EventKind, ExportEvent, FlagFormat};

	const FLAGS: &str = r#"
new-checkout:
  variations:
    enabled: true
    disabled: false
  targeting:
    - name: beta-testers
      query:
        - attribute: beta
          operator: eq
          value: true
      variation: enabled
  defaultRule:
    variation: disabled
theme:
  variations:
    light: light
    dark: dark
  defaultRule:
    percentage:
      light: 50
      dark: 50
max-items:
  variations:
    small: 10
    large: 100
  defaultRule:
    variation: large
quiet:
  trackEvents: false
  variations:
    on: true
  defaultRule:
    variation: on
"#;

	async fn client_with(exporter: Arc<InMemoryExporter>) -> (FlagsClient, Arc<InMemoryRetriever>) {
		let retriever = Arc::new(InMemoryRetriever::new(FLAGS, FlagFormat::Yaml));
		let client = FlagsClient::builder()
			.retriever(retriever.clone())
			.exporter(exporter)
			.build()
			.await
			.unwrap();
		(client, retriever)
	}

	fn feature_keys(events: &[ExportEvent]) -> Vec<String> {
		events
			.iter()
			.filter(|e| e.kind() == EventKind::Feature)
			.map(|e| e.key().to_string())
			.collect()
	}

	#[tokio::test]
	async fn test_typed_accessors() {
		let (client, _) = client_with(Arc::new(InMemoryExporter::new())).await;
		let ctx = EvaluationContext::new("user-1");
		let beta = EvaluationContext::new("user-2").with_attribute("beta", json!(true));

		assert!(!client.get_bool("new-checkout", &ctx, true));
		assert!(client.get_bool("new-checkout", &beta, false));
		assert_eq!(client.get_int("max-items", &ctx, 0), 100);
		assert_eq!(client.get_float("max-items", &ctx, 0.0), 100.0);

		let theme = client.get_string_details("theme", &ctx, "none");
		assert_eq!(theme.reason, EvaluationReason::Split);
		assert!(theme.value == "light" || theme.value == "dark");

		let details = client.get_bool_details("new-checkout", &beta, false);
		assert_eq!(details.reason, EvaluationReason::TargetingMatch);
		assert_eq!(details.rule_name.as_deref(), Some("beta-testers"));

		client.close().await;
	}

	#[tokio::test]
	async fn test_errors_serve_default() {
		let (client, _) = client_with(Arc::new(InMemoryExporter::new())).await;
		let ctx = EvaluationContext::new("user-1");

		let missing = client.get_bool_details("missing", &ctx, true);
		assert!(missing.value);
		assert_eq!(missing.error_code, Some(ErrorCode::FlagNotFound));

		let mismatch = client.get_string_details("max-items", &ctx, "fallback");
		assert_eq!(mismatch.value, "fallback");
		assert_eq!(mismatch.error_code, Some(ErrorCode::TypeMismatch));

		let anonymous = client.get_string_details("theme", &EvaluationContext::empty(), "fallback");
		assert_eq!(anonymous.value, "fallback");
		assert_eq!(anonymous.error_code, Some(ErrorCode::TargetingKeyMissing));

		client.close().await;
	}

	#[tokio::test]
	async fn test_feature_events_follow_track_events() {
		let exporter = Arc::new(InMemoryExporter::new());
		let (client, _) = client_with(exporter.clone()).await;
		let ctx = EvaluationContext::new("user-1");

		client.get_bool("new-checkout", &ctx, false);
		client.get_bool("quiet", &ctx, false);
		client.get_int("max-items", &ctx, 0);
		client.close().await;

		assert_eq!(feature_keys(&exporter.events()), ["new-checkout", "max-items"]);
	}

	#[tokio::test]
	async fn test_track_reaches_tracking_exporter() {
		let feature = Arc::new(InMemoryExporter::new());
		let tracking = Arc::new(InMemoryExporter::new());
		let client = FlagsClient::builder()
			.retriever(Arc::new(InMemoryRetriever::new(FLAGS, FlagFormat::Yaml)))
			.exporter(feature.clone())
			.exporter_with_settings(
				tracking.clone(),
				ExporterSettings {
					event_kind: EventKind::Tracking,
					..ExporterSettings::default()
				},
			)
			.build()
			.await
			.unwrap();

		let ctx = EvaluationContext::new("user-1");
		let mut details = BTreeMap::new();
		details.insert("amount".to_string(), json!(42));
		client.track("checkout-completed", &ctx, details);
		client.get_bool("new-checkout", &ctx, false);
		client.close().await;

		let tracked = tracking.events();
		assert_eq!(tracked.len(), 1);
		assert_eq!(tracked[0].key(), "checkout-completed");
		assert_eq!(feature_keys(&feature.events()), ["new-checkout"]);
	}

	#[tokio::test]
	async fn test_force_refresh_applies_changes() {
		let (client, retriever) = client_with(Arc::new(InMemoryExporter::new())).await;
		let ctx = EvaluationContext::new("user-1");
		let first_refresh = client.cache_refresh_date();
		assert!(first_refresh.is_some());

		retriever.set_document(
			r#"
new-checkout:
  variations:
    enabled: true
    disabled: false
  defaultRule:
    variation: enabled
"#,
		);
		assert!(client.force_refresh().await);

		assert!(client.get_bool("new-checkout", &ctx, false));
		assert_eq!(client.flag_keys(), ["new-checkout"]);
		assert!(client.cache_refresh_date() >= first_refresh);
		client.close().await;
	}

	#[tokio::test]
	async fn test_get_all_honours_filter() {
		let (client, _) = client_with(Arc::new(InMemoryExporter::new())).await;
		let ctx = EvaluationContext::new("user-1").with_flag_filter(["max-items", "quiet"]);

		let state = client.get_all(&ctx);
		assert!(state.valid);
		assert_eq!(state.len(), 2);
		assert_eq!(state.values()["max-items"], json!(100));
		client.close().await;
	}

	#[tokio::test]
	async fn test_enrichment_and_environment_reach_rules() {
		let flags = r#"
dark-launch:
  variations:
    on: true
    off: false
  targeting:
    - name: staging-only
      query:
        - attribute: env
          operator: eq
          value: staging
        - attribute: region
          operator: eq
          value: eu
      variation: on
  defaultRule:
    variation: off
"#;
		let client = FlagsClient::builder()
			.retriever(Arc::new(InMemoryRetriever::new(flags, FlagFormat::Yaml)))
			.environment("staging")
			.evaluation_context_enrichment("region", json!("eu"))
			.build()
			.await
			.unwrap();
		let ctx = EvaluationContext::new("user-1").with_attribute("region", json!("us"));

		let details = client.get_bool_details("dark-launch", &ctx, false);
		assert!(details.value);
		assert_eq!(details.rule_name.as_deref(), Some("staging-only"));
		assert_eq!(client.get_all(&ctx).values()["dark-launch"], json!(true));
		assert_eq!(ctx.attribute("region"), Some(json!("us")));
		client.close().await;

		let production = FlagsClient::builder()
			.retriever(Arc::new(InMemoryRetriever::new(flags, FlagFormat::Yaml)))
			.environment("production")
			.evaluation_context_enrichment("region", json!("eu"))
			.build()
			.await
			.unwrap();
		assert!(!production.get_bool("dark-launch", &ctx, true));
		production.close().await;
	}

	#[tokio::test]
	async fn test_offline_serves_defaults() {
		let exporter = Arc::new(InMemoryExporter::new());
		let client = FlagsClient::builder()
			.offline_mode(true)
			.exporter(exporter.clone())
			.build()
			.await
			.unwrap();
		let ctx = EvaluationContext::new("user-1");

		let details = client.get_bool_details("new-checkout", &ctx, true);
		assert!(details.value);
		assert_eq!(details.reason, EvaluationReason::Disabled);
		assert!(details.error_code.is_none());
		assert!(!client.get_all(&ctx).valid);
		assert!(!client.force_refresh().await);
		client.track("ignored", &ctx, BTreeMap::new());
		client.close().await;

		assert!(exporter.events().is_empty());
		assert!(client.retriever_statuses().is_empty());
	}

	#[tokio::test]
	async fn test_builder_requires_retriever() {
		let err = FlagsClient::builder().build().await.err().unwrap();
		assert!(matches!(err, ClientError::InvalidConfig { .. }));
	}

	#[tokio::test]
	async fn test_builder_rejects_short_polling_interval() {
		let err = FlagsClient::builder()
			.retriever(Arc::new(InMemoryRetriever::new(FLAGS, FlagFormat::Yaml)))
			.polling_interval(Duration::from_millis(500))
			.build()
			.await
			.err()
			.unwrap();
		assert!(matches!(err, ClientError::InvalidConfig { .. }));
	}

	#[tokio::test]
	async fn test_fail_fast_build() {
		let err = FlagsClient::builder()
			.retriever(Arc::new(InMemoryRetriever::new("{broken", FlagFormat::Json)))
			.start_with_retriever_error(false)
			.build()
			.await
			.err()
			.unwrap();
		assert!(matches!(err, ClientError::InitialLoad(_)));
	}

	#[tokio::test]
	async fn test_fail_open_build_serves_defaults() {
		let client = FlagsClient::builder()
			.retriever(Arc::new(InMemoryRetriever::new("{broken", FlagFormat::Json)))
			.build()
			.await
			.unwrap();

		assert_eq!(client.cache_state(), CacheState::LoadError);
		assert!(client.flags_from_cache().is_empty());
		let ctx = EvaluationContext::new("user-1");
		assert!(client.get_bool("new-checkout", &ctx, true));
		assert_eq!(client.retriever_statuses()[0].1, RetrieverStatus::Ready);
		client.close().await;
	}

	#[tokio::test]
	async fn test_close_keeps_serving_last_snapshot() {
		let (client, _) = client_with(Arc::new(InMemoryExporter::new())).await;
		let clone = client.clone();
		client.close().await;

		assert_eq!(clone.cache_state(), CacheState::Closed);
		let ctx = EvaluationContext::new("user-1");
		assert_eq!(clone.get_int("max-items", &ctx, 0), 100);
		assert!(!clone.force_refresh().await);
	}
}
