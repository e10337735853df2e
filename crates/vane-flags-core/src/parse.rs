// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag-source decoding.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlagsError, Result};
use crate::flag::Flag;

/// Encoding of a flag source document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagFormat {
	#[default]
	Yaml,
	Json,
	Toml,
}

impl FlagFormat {
	/// Guesses the format from a file extension, falling back to YAML.
	pub fn from_path(path: &Path) -> Self {
		match path
			.extension()
			.and_then(|e| e.to_str())
			.map(str::to_ascii_lowercase)
			.as_deref()
		{
			Some("json") => FlagFormat::Json,
			Some("toml") => FlagFormat::Toml,
			_ => FlagFormat::Yaml,
		}
	}
}

impl FromStr for FlagFormat {
	type Err = FlagsError;

	fn from_str(s: &str) -> Result<Self> {
		match s.to_ascii_lowercase().as_str() {
			"yaml" | "yml" => Ok(FlagFormat::Yaml),
			"json" => Ok(FlagFormat::Json),
			"toml" => Ok(FlagFormat::Toml),
			other => Err(FlagsError::InvalidConfiguration(format!(
				"unknown flag format: {other}"
			))),
		}
	}
}

impl std::fmt::Display for FlagFormat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FlagFormat::Yaml => f.write_str("yaml"),
			FlagFormat::Json => f.write_str("json"),
			FlagFormat::Toml => f.write_str("toml"),
		}
	}
}

/// Decodes a document mapping flag name to flag. An empty document is an
/// empty flag set.
pub fn parse_flags(bytes: &[u8], format: FlagFormat) -> Result<HashMap<String, Flag>> {
	let text = std::str::from_utf8(bytes)
		.map_err(|e| FlagsError::Parse(format!("flag source is not valid UTF-8: {e}")))?;

	if text.trim().is_empty() {
		return Ok(HashMap::new());
	}

	let flags: HashMap<String, Flag> = match format {
		FlagFormat::Yaml => serde_yaml::from_str(text).map_err(|e| FlagsError::Parse(e.to_string()))?,
		FlagFormat::Json => serde_json::from_str(text).map_err(|e| FlagsError::Parse(e.to_string()))?,
		FlagFormat::Toml => toml::from_str(text).map_err(|e| FlagsError::Parse(e.to_string()))?,
	};

	if let Some(key) = flags
		.iter()
		.find(|(_, flag)| !flag.has_finite_numbers())
		.map(|(key, _)| key)
	{
		return Err(FlagsError::Parse(format!(
			"flag {key} has a percentage that is not a finite number"
		)));
	}
	Ok(flags)
}
