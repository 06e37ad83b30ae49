//! Data sources: the contract every data source implements, and the
//! composite stack that combines them with merge and caching semantics.

pub mod composite;
pub mod sqlite;
pub mod text_file;
pub mod yaml_target;

use crate::data_tree::Value;
use async_trait::async_trait;
use thiserror::Error;

pub use composite::CompositeDataSource;

#[derive(Debug, Error)]
pub enum DataSourceError {
	#[error("{source}: I/O error: {message}")]
	Io { source: String, message: String },
	#[error("{source}: parse error: {message}")]
	Parse { source: String, message: String },
	#[error("{source}: template error: {message}")]
	Template { source: String, message: String },
	#[error("{source}: configuration error: {message}")]
	Config { source: String, message: String },
}

/// The result of a reverse lookup: a source may not support reverse
/// lookup at all ("unsupported", and the composite skips it), may
/// support it but find nothing ("not found"), or may resolve a system id.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
	Found(String),
	NotFound,
	Unsupported,
}

/// A data source contributes a partial data tree for a system id, and may
/// optionally map a `(lookup_key, lookup_value)` pair back to a system id.
#[async_trait]
pub trait DataSource: Send + Sync {
	fn name(&self) -> &str;

	/// Returns this source's contribution for `system_id` plus a
	/// monotonic version. `preceding_data` is the merged result of
	/// strictly earlier sources in the composite's declared order.
	async fn get_data(
		&self,
		system_id: &str,
		preceding_data: &Value,
	) -> Result<(Value, u64), DataSourceError>;

	/// Reverse lookup: map a `(lookup_key, lookup_value)` pair to a
	/// system id. Sources that cannot perform reverse lookup return
	/// `FindResult::Unsupported`.
	async fn find_system(
		&self,
		lookup_key: &str,
		lookup_value: &str,
	) -> Result<FindResult, DataSourceError>;
}
