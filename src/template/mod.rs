//! Template engine adapter: a narrow interface (`render`,
//! `resolve_dependencies`) that isolates the rest of Vinegar from the
//! specifics of any one template language. The bundled `engine` module
//! is one implementation; the interface is the capability contract a
//! pluggable replacement would implement.

pub mod engine;

use crate::data_tree::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
	#[error("template not found: {0}")]
	NotFound(PathBuf),
	#[error("{path}:{line}: {message}")]
	RenderError {
		path: PathBuf,
		line: usize,
		message: String,
	},
	#[error("{path}:{line}: template raised: {message}")]
	Raised {
		path: PathBuf,
		line: usize,
		message: String,
	},
	#[error("include cycle detected at {0}")]
	IncludeCycle(PathBuf),
	#[error("io error rendering {path}: {message}")]
	Io { path: PathBuf, message: String },
}

/// The `{id, data, request_info}` scope exposed to templates. `id` is
/// absent (not merely null) when the request path did not identify a
/// system and the handler chose to continue; templates must tolerate
/// its absence.
#[derive(Debug, Clone)]
pub struct TemplateContext {
	pub id: Option<String>,
	pub data: Value,
	pub request_info: Value,
}

impl TemplateContext {
	pub fn new(id: Option<String>, data: Value) -> Self {
		Self {
			id,
			data,
			request_info: Value::empty_map(),
		}
	}

	pub fn with_request_info(mut self, request_info: Value) -> Self {
		self.request_info = request_info;
		self
	}
}

/// `Engine.configure` / `Engine.render` / `Engine.resolve_dependencies`
/// from the spec, expressed as a trait rather than an inheritance
/// hierarchy: the bundled engine and any future pluggable replacement
/// both implement this same contract.
pub trait Engine: Send + Sync {
	fn render(&self, template_path: &Path, context: &TemplateContext) -> Result<Vec<u8>, TemplateError>;

	fn resolve_dependencies(&self, template_path: &Path) -> Result<HashSet<PathBuf>, TemplateError>;
}
