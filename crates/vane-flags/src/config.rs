// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.
//!
//! Configuration is assembled from layers of optional values, lowest
//! precedence first: built-in defaults, an optional TOML file, then
//! `VANE_FLAGS_*` environment variables. The merged layer is finalized into a
//! [`ClientConfig`] and validated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use vane_flags_core::EventKind;

use crate::error::{ClientError, Result};
use crate::export::{ExporterSettings, OverflowPolicy};
use crate::refresh::RefreshSettings;

/// Minimum time between two polls of the retrievers.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Serde helper storing a [`Duration`] as whole seconds.
pub mod duration_secs {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let secs = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(secs))
	}
}

/// Final client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
	#[serde(with = "duration_secs")]
	pub polling_interval: Duration,
	/// Adds up to 10% random delay to each polling interval.
	pub enable_polling_jitter: bool,
	/// Start with an empty cache when the first load fails instead of
	/// returning an error.
	pub start_with_retriever_error: bool,
	/// Skip retrieval and export; every evaluation returns the caller default.
	pub offline: bool,
	#[serde(with = "duration_secs")]
	pub shutdown_timeout: Duration,
	/// Exposed to targeting rules as the `env` attribute.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub environment: Option<String>,
	/// Attributes added to every evaluation context, replacing caller
	/// attributes of the same name.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub evaluation_context_enrichment: BTreeMap<String, Value>,
	pub exporter: ExporterSettings,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfigLayer::default().finalize()
	}
}

impl ClientConfig {
	pub fn validate(&self) -> Result<()> {
		if self.polling_interval < MIN_POLLING_INTERVAL {
			return Err(ClientError::invalid_config(
				"polling_interval",
				format!("must be at least {}s", MIN_POLLING_INTERVAL.as_secs()),
			));
		}
		if self.shutdown_timeout.is_zero() {
			return Err(ClientError::invalid_config(
				"shutdown_timeout",
				"must be greater than zero",
			));
		}
		self.exporter.validate()
	}

	/// Parses a TOML document over the defaults.
	pub fn from_toml_str(content: &str) -> Result<Self> {
		let layer: ClientConfigLayer =
			toml::from_str(content).map_err(|e| ClientError::ConfigParse {
				path: PathBuf::from("<inline>"),
				source: e,
			})?;
		let config = layer.finalize();
		config.validate()?;
		Ok(config)
	}

	/// Loads defaults, then `path` if it exists, then the environment.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let mut sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(DefaultsSource)];
		if let Some(path) = path {
			sources.push(Box::new(TomlSource::new(path)));
		}
		sources.push(Box::new(EnvSource::new()));
		load_config(sources)
	}

	/// Attributes merged into each evaluation context: the configured
	/// enrichment plus `env` when an environment is set.
	pub fn context_enrichment(&self) -> BTreeMap<String, Value> {
		let mut enrichment = self.evaluation_context_enrichment.clone();
		if let Some(environment) = self.environment.as_deref().filter(|e| !e.is_empty()) {
			enrichment.insert("env".to_string(), Value::String(environment.to_string()));
		}
		enrichment
	}

	pub fn refresh_settings(&self) -> RefreshSettings {
		RefreshSettings {
			polling_interval: self.polling_interval,
			enable_polling_jitter: self.enable_polling_jitter,
			start_with_retriever_error: self.start_with_retriever_error,
			shutdown_timeout: self.shutdown_timeout,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfigLayer {
	pub polling_interval_secs: Option<u64>,
	pub enable_polling_jitter: Option<bool>,
	pub start_with_retriever_error: Option<bool>,
	pub offline: Option<bool>,
	pub shutdown_timeout_secs: Option<u64>,
	pub environment: Option<String>,
	pub evaluation_context_enrichment: Option<BTreeMap<String, Value>>,
	pub exporter: Option<ExporterConfigLayer>,
}

impl ClientConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.polling_interval_secs.is_some() {
			self.polling_interval_secs = other.polling_interval_secs;
		}
		if other.enable_polling_jitter.is_some() {
			self.enable_polling_jitter = other.enable_polling_jitter;
		}
		if other.start_with_retriever_error.is_some() {
			self.start_with_retriever_error = other.start_with_retriever_error;
		}
		if other.offline.is_some() {
			self.offline = other.offline;
		}
		if other.shutdown_timeout_secs.is_some() {
			self.shutdown_timeout_secs = other.shutdown_timeout_secs;
		}
		if other.environment.is_some() {
			self.environment = other.environment;
		}
		if let Some(enrichment) = other.evaluation_context_enrichment {
			self
				.evaluation_context_enrichment
				.get_or_insert_with(Default::default)
				.extend(enrichment);
		}
		if let Some(exporter) = other.exporter {
			self.exporter.get_or_insert_with(Default::default).merge(exporter);
		}
	}

	pub fn finalize(self) -> ClientConfig {
		ClientConfig {
			polling_interval: Duration::from_secs(self.polling_interval_secs.unwrap_or(60)),
			enable_polling_jitter: self.enable_polling_jitter.unwrap_or(false),
			start_with_retriever_error: self.start_with_retriever_error.unwrap_or(true),
			offline: self.offline.unwrap_or(false),
			shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs.unwrap_or(5)),
			environment: self.environment,
			evaluation_context_enrichment: self.evaluation_context_enrichment.unwrap_or_default(),
			exporter: self.exporter.unwrap_or_default().finalize(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExporterConfigLayer {
	pub flush_interval_secs: Option<u64>,
	pub max_event_in_memory: Option<usize>,
	pub max_queue_size: Option<usize>,
	pub overflow_policy: Option<OverflowPolicy>,
	pub event_kind: Option<EventKind>,
}

impl ExporterConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.flush_interval_secs.is_some() {
			self.flush_interval_secs = other.flush_interval_secs;
		}
		if other.max_event_in_memory.is_some() {
			self.max_event_in_memory = other.max_event_in_memory;
		}
		if other.max_queue_size.is_some() {
			self.max_queue_size = other.max_queue_size;
		}
		if other.overflow_policy.is_some() {
			self.overflow_policy = other.overflow_policy;
		}
		if other.event_kind.is_some() {
			self.event_kind = other.event_kind;
		}
	}

	pub fn finalize(self) -> ExporterSettings {
		let defaults = ExporterSettings::default();
		let max_event_in_memory = self
			.max_event_in_memory
			.unwrap_or(defaults.max_event_in_memory);
		ExporterSettings {
			flush_interval: self
				.flush_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.flush_interval),
			max_event_in_memory,
			max_queue_size: self
				.max_queue_size
				.unwrap_or_else(|| defaults.max_queue_size.max(max_event_in_memory)),
			overflow_policy: self.overflow_policy.unwrap_or(defaults.overflow_policy),
			event_kind: self.event_kind.unwrap_or(defaults.event_kind),
		}
	}
}

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ClientConfigLayer>;
}

/// Merges `sources` in precedence order, then finalizes and validates.
pub fn load_config(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ClientConfig> {
	sources.sort_by_key(|s| s.precedence());

	let mut layer = ClientConfigLayer::default();
	for source in &sources {
		trace!(source = source.name(), "applying config source");
		layer.merge(source.load()?);
	}

	let config = layer.finalize();
	config.validate()?;
	Ok(config)
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ClientConfigLayer> {
		Ok(ClientConfigLayer::default())
	}
}

/// TOML file source. A missing file contributes nothing.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ClientConfigLayer> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ClientConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content =
			std::fs::read_to_string(&self.path).map_err(|e| ClientError::ConfigFileRead {
				path: self.path.clone(),
				source: e,
			})?;

		toml::from_str(&content).map_err(|e| ClientError::ConfigParse {
			path: self.path.clone(),
			source: e,
		})
	}
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable source.
///
/// Convention: VANE_FLAGS_<FIELD> and VANE_FLAGS_EXPORTER_<FIELD>.
/// `VANE_FLAGS_EVALUATION_CONTEXT_ENRICHMENT` holds a JSON object.
pub struct EnvSource {
	lookup: EnvLookup,
}

impl EnvSource {
	pub fn new() -> Self {
		Self::with_lookup(|name| std::env::var(name).ok())
	}

	/// Reads variables through `lookup` instead of the process environment.
	pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
		Self {
			lookup: Box::new(lookup),
		}
	}

	fn var(&self, name: &str) -> Option<String> {
		(self.lookup)(name).filter(|s| !s.is_empty())
	}

	fn bool(&self, name: &str) -> Option<bool> {
		self
			.var(name)
			.map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn number<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
		match self.var(name) {
			Some(v) => v
				.parse()
				.map(Some)
				.map_err(|_| ClientError::invalid_config(name, format!("invalid number '{v}'"))),
			None => Ok(None),
		}
	}

	fn json_object(&self, name: &str) -> Result<Option<BTreeMap<String, Value>>> {
		match self.var(name) {
			Some(v) => serde_json::from_str(&v).map(Some).map_err(|e| {
				ClientError::invalid_config(name, format!("expected a JSON object: {e}"))
			}),
			None => Ok(None),
		}
	}

	fn event_kind(&self, name: &str) -> Result<Option<EventKind>> {
		match self.var(name).as_deref() {
			Some("feature") => Ok(Some(EventKind::Feature)),
			Some("tracking") => Ok(Some(EventKind::Tracking)),
			Some(other) => Err(ClientError::invalid_config(
				name,
				format!("unknown event kind '{other}'"),
			)),
			None => Ok(None),
		}
	}
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ClientConfigLayer> {
		debug!("loading environment variables");
		let exporter = ExporterConfigLayer {
			flush_interval_secs: self.number("VANE_FLAGS_EXPORTER_FLUSH_INTERVAL_SECS")?,
			max_event_in_memory: self.number("VANE_FLAGS_EXPORTER_MAX_EVENT_IN_MEMORY")?,
			max_queue_size: self.number("VANE_FLAGS_EXPORTER_MAX_QUEUE_SIZE")?,
			overflow_policy: self
				.var("VANE_FLAGS_EXPORTER_OVERFLOW_POLICY")
				.map(|v| v.parse())
				.transpose()?,
			event_kind: self.event_kind("VANE_FLAGS_EXPORTER_EVENT_KIND")?,
		};

		Ok(ClientConfigLayer {
			polling_interval_secs: self.number("VANE_FLAGS_POLLING_INTERVAL_SECS")?,
			enable_polling_jitter: self.bool("VANE_FLAGS_ENABLE_POLLING_JITTER"),
			start_with_retriever_error: self.bool("VANE_FLAGS_START_WITH_RETRIEVER_ERROR"),
			offline: self.bool("VANE_FLAGS_OFFLINE"),
			shutdown_timeout_secs: self.number("VANE_FLAGS_SHUTDOWN_TIMEOUT_SECS")?,
			environment: self.var("VANE_FLAGS_ENVIRONMENT"),
			evaluation_context_enrichment: self
				.json_object("VANE_FLAGS_EVALUATION_CONTEXT_ENRICHMENT")?,
			exporter: Some(exporter),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::io::Write;

	fn env(vars: &[(&str, &str)]) -> EnvSource {
		let vars: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		EnvSource::with_lookup(move |name| vars.get(name).cloned())
	}

	#[test]
	fn test_default_values() {
		let config = ClientConfig::default();
		assert_eq!(config.polling_interval, Duration::from_secs(60));
		assert!(config.start_with_retriever_error);
		assert!(!config.enable_polling_jitter);
		assert!(!config.offline);
		assert_eq!(config.exporter.flush_interval, Duration::from_secs(60));
		assert_eq!(config.exporter.max_event_in_memory, 100_000);
		assert_eq!(config.exporter.overflow_policy, OverflowPolicy::DropOldest);
		assert_eq!(config.exporter.event_kind, EventKind::Feature);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_toml_overrides_defaults() {
		let config = ClientConfig::from_toml_str(
			r#"
polling_interval_secs = 5
offline = true

[exporter]
flush_interval_secs = 10
max_event_in_memory = 50
overflow_policy = "drop_newest"
event_kind = "tracking"
"#,
		)
		.unwrap();

		assert_eq!(config.polling_interval, Duration::from_secs(5));
		assert!(config.offline);
		assert_eq!(config.exporter.flush_interval, Duration::from_secs(10));
		assert_eq!(config.exporter.max_event_in_memory, 50);
		assert_eq!(config.exporter.overflow_policy, OverflowPolicy::DropNewest);
		assert_eq!(config.exporter.event_kind, EventKind::Tracking);
	}

	#[test]
	fn test_polling_interval_minimum_enforced() {
		let err = ClientConfig::from_toml_str("polling_interval_secs = 0").unwrap_err();
		assert!(matches!(err, ClientError::InvalidConfig { ref key, .. } if key == "polling_interval"));
	}

	#[test]
	fn test_environment_beats_file() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(file, "polling_interval_secs = 30\nenable_polling_jitter = true").unwrap();

		let config = load_config(vec![
			Box::new(env(&[
				("VANE_FLAGS_POLLING_INTERVAL_SECS", "15"),
				("VANE_FLAGS_EXPORTER_MAX_QUEUE_SIZE", "500000"),
			])),
			Box::new(TomlSource::new(file.path())),
			Box::new(DefaultsSource),
		])
		.unwrap();

		assert_eq!(config.polling_interval, Duration::from_secs(15));
		assert!(config.enable_polling_jitter);
		assert_eq!(config.exporter.max_queue_size, 500_000);
	}

	#[test]
	fn test_missing_file_is_skipped() {
		let dir = tempfile::tempdir().unwrap();
		let layer = TomlSource::new(dir.path().join("absent.toml")).load().unwrap();
		assert_eq!(layer, ClientConfigLayer::default());
	}

	#[test]
	fn test_malformed_file_is_parse_error() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(file, "polling_interval_secs = [").unwrap();
		let err = TomlSource::new(file.path()).load().unwrap_err();
		assert!(matches!(err, ClientError::ConfigParse { .. }));
	}

	#[test]
	fn test_invalid_env_values() {
		let err = env(&[("VANE_FLAGS_POLLING_INTERVAL_SECS", "soon")])
			.load()
			.unwrap_err();
		assert!(matches!(err, ClientError::InvalidConfig { .. }));

		let err = env(&[("VANE_FLAGS_EXPORTER_EVENT_KIND", "metric")])
			.load()
			.unwrap_err();
		assert!(matches!(err, ClientError::InvalidConfig { .. }));
	}

	#[test]
	fn test_env_bools() {
		let layer = env(&[
			("VANE_FLAGS_OFFLINE", "1"),
			("VANE_FLAGS_START_WITH_RETRIEVER_ERROR", "false"),
		])
		.load()
		.unwrap();
		assert_eq!(layer.offline, Some(true));
		assert_eq!(layer.start_with_retriever_error, Some(false));
		assert_eq!(layer.enable_polling_jitter, None);
	}

	#[test]
	fn test_exporter_layers_merge_field_by_field() {
		let mut base = ClientConfigLayer {
			exporter: Some(ExporterConfigLayer {
				flush_interval_secs: Some(10),
				max_event_in_memory: Some(20),
				..Default::default()
			}),
			..Default::default()
		};
		base.merge(ClientConfigLayer {
			exporter: Some(ExporterConfigLayer {
				max_event_in_memory: Some(40),
				..Default::default()
			}),
			..Default::default()
		});

		let exporter = base.finalize().exporter;
		assert_eq!(exporter.flush_interval, Duration::from_secs(10));
		assert_eq!(exporter.max_event_in_memory, 40);
	}

	#[test]
	fn test_context_enrichment_layers() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(
			file,
			"environment = \"staging\"\n\n[evaluation_context_enrichment]\nregion = \"eu\"\ntier = 1"
		)
		.unwrap();

		let config = load_config(vec![
			Box::new(DefaultsSource),
			Box::new(TomlSource::new(file.path())),
			Box::new(env(&[
				("VANE_FLAGS_ENVIRONMENT", "production"),
				("VANE_FLAGS_EVALUATION_CONTEXT_ENRICHMENT", r#"{"tier": 2}"#),
			])),
		])
		.unwrap();

		assert_eq!(config.environment.as_deref(), Some("production"));
		let enrichment = config.context_enrichment();
		assert_eq!(enrichment["region"], serde_json::json!("eu"));
		assert_eq!(enrichment["tier"], serde_json::json!(2));
		assert_eq!(enrichment["env"], serde_json::json!("production"));
	}

	#[test]
	fn test_invalid_enrichment_env() {
		let err = env(&[("VANE_FLAGS_EVALUATION_CONTEXT_ENRICHMENT", "[1, 2]")])
			.load()
			.unwrap_err();
		assert!(matches!(err, ClientError::InvalidConfig { .. }));
	}

	#[test]
	fn test_refresh_settings_follow_config() {
		let config = ClientConfig {
			polling_interval: Duration::from_secs(2),
			enable_polling_jitter: true,
			..ClientConfig::default()
		};
		let settings = config.refresh_settings();
		assert_eq!(settings.polling_interval, Duration::from_secs(2));
		assert!(settings.enable_polling_jitter);
	}

	#[test]
	fn test_config_round_trips_through_toml() {
		let config = ClientConfig::default();
		let text = toml::to_string(&config).unwrap();
		let parsed: ClientConfig = toml::from_str(&text).unwrap();
		assert_eq!(parsed, config);
	}
}
