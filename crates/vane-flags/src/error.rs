// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the flags SDK.

use std::path::PathBuf;

use thiserror::Error;
use vane_flags_core::FlagsError;

/// Flags SDK errors.
#[derive(Debug, Error)]
pub enum ClientError {
	/// Parsing or evaluation error from the core engine.
	#[error(transparent)]
	Flags(#[from] FlagsError),

	/// A retriever failed to initialize or fetch its flag source.
	#[error("retriever {name} failed: {message}")]
	Retriever { name: String, message: String },

	/// A notifier failed to deliver a change set.
	#[error("notifier {name} failed: {message}")]
	Notifier { name: String, message: String },

	/// An exporter sink rejected a batch.
	#[error("exporter {name} failed: {message}")]
	Exporter { name: String, message: String },

	/// The first synchronous load failed and the client is configured to
	/// fail fast.
	#[error("initial flag load failed: {0}")]
	InitialLoad(String),

	/// A configuration value is invalid.
	#[error("invalid configuration value for {key}: {message}")]
	InvalidConfig { key: String, message: String },

	#[error("failed to read config file {path}: {source}")]
	ConfigFileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	ConfigParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,
}

impl ClientError {
	pub fn retriever(name: impl Into<String>, message: impl ToString) -> Self {
		ClientError::Retriever {
			name: name.into(),
			message: message.to_string(),
		}
	}

	pub fn notifier(name: impl Into<String>, message: impl ToString) -> Self {
		ClientError::Notifier {
			name: name.into(),
			message: message.to_string(),
		}
	}

	pub fn exporter(name: impl Into<String>, message: impl ToString) -> Self {
		ClientError::Exporter {
			name: name.into(),
			message: message.to_string(),
		}
	}

	pub fn invalid_config(key: impl Into<String>, message: impl ToString) -> Self {
		ClientError::InvalidConfig {
			key: key.into(),
			message: message.to_string(),
		}
	}
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn core_errors_are_transparent() {
		let err: ClientError = FlagsError::Parse("bad yaml".to_string()).into();
		assert_eq!(err.to_string(), "failed to parse flag source: bad yaml");
	}

	#[test]
	fn helper_constructors() {
		let err = ClientError::retriever("file", "not found");
		assert_eq!(err.to_string(), "retriever file failed: not found");

		let err = ClientError::invalid_config("polling_interval", "must be at least 1s");
		assert!(matches!(err, ClientError::InvalidConfig { .. }));
	}
}
