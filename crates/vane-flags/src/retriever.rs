// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag sources.
//!
//! A [`Retriever`] returns the raw bytes of a flag document. The
//! [`RetrieverManager`] owns every configured retriever, runs their lifecycle
//! hooks and merges their output in configuration order: a flag defined by a
//! later retriever replaces the same key from an earlier one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use vane_flags_core::{parse_flags, Flag, FlagFormat};

use crate::error::{ClientError, Result};

/// Lifecycle state of a retriever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverStatus {
	NotReady,
	Ready,
	Error,
}

/// Source of a flag document.
#[async_trait]
pub trait Retriever: Send + Sync {
	fn name(&self) -> &str;

	/// Encoding of the bytes returned by [`Retriever::retrieve`].
	fn format(&self) -> FlagFormat {
		FlagFormat::Yaml
	}

	async fn retrieve(&self) -> Result<Vec<u8>>;

	/// Called once before the first load. A failure is retried before the
	/// next refresh.
	async fn init(&self) -> Result<()> {
		Ok(())
	}

	async fn shutdown(&self) -> Result<()> {
		Ok(())
	}

	fn status(&self) -> RetrieverStatus {
		RetrieverStatus::Ready
	}
}

struct ManagedRetriever {
	retriever: Arc<dyn Retriever>,
	initialized: Mutex<Option<bool>>,
}

impl ManagedRetriever {
	fn needs_init(&self) -> bool {
		!matches!(*self.initialized.lock(), Some(true))
	}

	async fn init(&self) {
		let name = self.retriever.name().to_string();
		match self.retriever.init().await {
			Ok(()) => {
				debug!(retriever = %name, "Retriever initialized");
				*self.initialized.lock() = Some(true);
			}
			Err(e) => {
				warn!(retriever = %name, error = %e, "Retriever initialization failed");
				*self.initialized.lock() = Some(false);
			}
		}
	}

	fn status(&self) -> RetrieverStatus {
		match *self.initialized.lock() {
			None => RetrieverStatus::NotReady,
			Some(false) => RetrieverStatus::Error,
			Some(true) => self.retriever.status(),
		}
	}
}

/// Owns the configured retrievers.
pub struct RetrieverManager {
	retrievers: Vec<ManagedRetriever>,
}

impl RetrieverManager {
	pub fn new(retrievers: Vec<Arc<dyn Retriever>>) -> Self {
		Self {
			retrievers: retrievers
				.into_iter()
				.map(|retriever| ManagedRetriever {
					retriever,
					initialized: Mutex::new(None),
				})
				.collect(),
		}
	}

	pub fn len(&self) -> usize {
		self.retrievers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.retrievers.is_empty()
	}

	/// Initializes every retriever that has not been initialized yet.
	pub async fn init(&self) {
		let pending = self.retrievers.iter().filter(|r| r.needs_init());
		join_all(pending.map(ManagedRetriever::init)).await;
	}

	/// Fetches and parses every source concurrently and merges the results.
	/// Any failing source fails the whole refresh.
	pub async fn retrieve_all(&self) -> Result<HashMap<String, Flag>> {
		self.init().await;

		let fetches = self.retrievers.iter().map(|managed| async move {
			let retriever = &managed.retriever;
			let bytes = retriever.retrieve().await?;
			let flags = parse_flags(&bytes, retriever.format())?;
			debug!(
				retriever = %retriever.name(),
				flag_count = flags.len(),
				"Retrieved flags"
			);
			Ok::<_, ClientError>(flags)
		});

		let mut merged = HashMap::new();
		for result in join_all(fetches).await {
			merged.extend(result?);
		}
		Ok(merged)
	}

	pub fn statuses(&self) -> Vec<(String, RetrieverStatus)> {
		self
			.retrievers
			.iter()
			.map(|r| (r.retriever.name().to_string(), r.status()))
			.collect()
	}

	pub async fn shutdown(&self) {
		let shutdowns = self.retrievers.iter().map(|managed| async move {
			if let Err(e) = managed.retriever.shutdown().await {
				warn!(retriever = %managed.retriever.name(), error = %e, "Retriever shutdown failed");
			}
		});
		join_all(shutdowns).await;
		info!(retriever_count = self.retrievers.len(), "Retrievers shut down");
	}
}

/// Serves a document held in memory. Useful for tests and for embedding a
/// fixed flag set.
pub struct InMemoryRetriever {
	name: String,
	format: FlagFormat,
	document: RwLock<Vec<u8>>,
}

impl InMemoryRetriever {
	pub fn new(document: impl Into<Vec<u8>>, format: FlagFormat) -> Self {
		Self {
			name: "in_memory".to_string(),
			format,
			document: RwLock::new(document.into()),
		}
	}

	/// Builds a JSON document from `flags`.
	pub fn from_flags(flags: &HashMap<String, Flag>) -> Result<Self> {
		let retriever = Self::new(Vec::new(), FlagFormat::Json);
		retriever.set_flags(flags)?;
		Ok(retriever)
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	/// Replaces the served document; the next refresh picks it up.
	pub fn set_document(&self, document: impl Into<Vec<u8>>) {
		*self.document.write() = document.into();
	}

	pub fn set_flags(&self, flags: &HashMap<String, Flag>) -> Result<()> {
		let bytes = serde_json::to_vec(flags).map_err(|e| ClientError::retriever(&self.name, e))?;
		self.set_document(bytes);
		Ok(())
	}
}

#[async_trait]
impl Retriever for InMemoryRetriever {
	fn name(&self) -> &str {
		&self.name
	}

	fn format(&self) -> FlagFormat {
		self.format
	}

	async fn retrieve(&self) -> Result<Vec<u8>> {
		Ok(self.document.read().clone())
	}
}

/// Reads a flag document from the local filesystem.
pub struct FileRetriever {
	name: String,
	path: PathBuf,
	format: FlagFormat,
}

impl FileRetriever {
	/// The format is guessed from the file extension.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		let format = FlagFormat::from_path(&path);
		Self {
			name: format!("file:{}", path.display()),
			path,
			format,
		}
	}

	pub fn with_format(mut self, format: FlagFormat) -> Self {
		self.format = format;
		self
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[async_trait]
impl Retriever for FileRetriever {
	fn name(&self) -> &str {
		&self.name
	}

	fn format(&self) -> FlagFormat {
		self.format
	}

	async fn retrieve(&self) -> Result<Vec<u8>> {
		tokio::fs::read(&self.path)
			.await
			.map_err(|e| ClientError::retriever(&self.name, e))
	}
}
