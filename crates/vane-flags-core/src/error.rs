// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types shared by the evaluation engine and the flag parser.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error code attached to an evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	FlagNotFound,
	TypeMismatch,
	TargetingKeyMissing,
	ParseError,
	InvalidConfiguration,
	General,
}

impl ErrorCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCode::FlagNotFound => "FLAG_NOT_FOUND",
			ErrorCode::TypeMismatch => "TYPE_MISMATCH",
			ErrorCode::TargetingKeyMissing => "TARGETING_KEY_MISSING",
			ErrorCode::ParseError => "PARSE_ERROR",
			ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
			ErrorCode::General => "GENERAL",
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors produced while parsing, validating or evaluating flags.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlagsError {
	#[error("flag not found: {0}")]
	FlagNotFound(String),

	#[error("flag {flag_key} resolved to a {actual} value, expected {expected}")]
	TypeMismatch {
		flag_key: String,
		expected: &'static str,
		actual: &'static str,
	},

	#[error("targeting key is missing for flag {0}")]
	TargetingKeyMissing(String),

	#[error("invalid bucketing key: {0}")]
	InvalidBucketingKey(String),

	#[error("failed to parse flag source: {0}")]
	Parse(String),

	#[error("invalid flag configuration: {0}")]
	InvalidConfiguration(String),

	#[error("{0}")]
	General(String),
}

impl FlagsError {
	/// Maps this error onto the evaluation error taxonomy.
	pub fn code(&self) -> ErrorCode {
		match self {
			FlagsError::FlagNotFound(_) => ErrorCode::FlagNotFound,
			FlagsError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
			FlagsError::TargetingKeyMissing(_) | FlagsError::InvalidBucketingKey(_) => {
				ErrorCode::TargetingKeyMissing
			}
			FlagsError::Parse(_) => ErrorCode::ParseError,
			FlagsError::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
			FlagsError::General(_) => ErrorCode::General,
		}
	}
}

pub type Result<T> = std::result::Result<T, FlagsError>;
