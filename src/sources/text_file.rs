//! `text_file` data source: one regex-matched line per system record.
//! Parsed records are cached keyed by (path, mtime, size); a stat check
//! on every call triggers a reload when the file has changed.

use super::{DataSource, DataSourceError, FindResult};
use crate::data_tree::Value;
use crate::transforms::TransformChain;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VariableSpec {
	pub source: String,
	pub transform: TransformChain,
	pub key_path: String,
}

pub struct TextFileSource {
	name: String,
	path: PathBuf,
	record_pattern: Regex,
	system_id_source: String,
	system_id_transform: TransformChain,
	variables: Vec<VariableSpec>,
	cache: RwLock<Option<CacheEntry>>,
}

struct CacheEntry {
	mtime: SystemTime,
	size: u64,
	version: u64,
	records: HashMap<String, Value>,
}

struct Record {
	system_id: String,
	data: Value,
}

impl TextFileSource {
	pub fn new(
		name: String,
		path: PathBuf,
		record_pattern: Regex,
		system_id_source: String,
		system_id_transform: TransformChain,
		variables: Vec<VariableSpec>,
	) -> Self {
		Self {
			name,
			path,
			record_pattern,
			system_id_source,
			system_id_transform,
			variables,
			cache: RwLock::new(None),
		}
	}

	fn io_err(&self, message: impl Into<String>) -> DataSourceError {
		DataSourceError::Io {
			source: self.name.clone(),
			message: message.into(),
		}
	}

	fn parse_err(&self, message: impl Into<String>) -> DataSourceError {
		DataSourceError::Parse {
			source: self.name.clone(),
			message: message.into(),
		}
	}

	fn stat(&self) -> Result<(SystemTime, u64), DataSourceError> {
		let meta = std::fs::metadata(&self.path).map_err(|e| self.io_err(e.to_string()))?;
		let mtime = meta.modified().map_err(|e| self.io_err(e.to_string()))?;
		Ok((mtime, meta.len()))
	}

	fn parse_file(&self) -> Result<Vec<Record>, DataSourceError> {
		let contents = std::fs::read_to_string(&self.path).map_err(|e| self.io_err(e.to_string()))?;
		let mut records = Vec::new();
		for (lineno, line) in contents.lines().enumerate() {
			let trimmed = line.trim();
			if trimmed.is_empty() || trimmed.starts_with('#') {
				continue;
			}
			let captures = match self.record_pattern.captures(line) {
				Some(c) => c,
				None => continue,
			};
			let system_id = self.project(&self.system_id_source, &captures, &self.system_id_transform)?;
			let system_id = system_id.as_scalar_string().ok_or_else(|| {
				self.parse_err(format!("line {}: system_id chain produced a non-scalar value", lineno + 1))
			})?;

			let mut data = Value::empty_map();
			for var in &self.variables {
				let value = self.project(&var.source, &captures, &var.transform)?;
				data.set_path(&var.key_path, value);
			}
			records.push(Record { system_id, data });
		}
		Ok(records)
	}

	fn project(
		&self,
		source: &str,
		captures: &regex::Captures,
		transform: &TransformChain,
	) -> Result<Value, DataSourceError> {
		let raw = captures
			.name(source)
			.map(|m| m.as_str().to_string())
			.unwrap_or_else(|| source.to_string());
		transform
			.apply(Value::String(raw))
			.map_err(|e| self.parse_err(e.to_string()))
	}

	fn ensure_loaded(&self) -> Result<(), DataSourceError> {
		let (mtime, size) = self.stat()?;
		{
			let cache = self.cache.read().expect("cache lock poisoned");
			if let Some(entry) = cache.as_ref() {
				if entry.mtime == mtime && entry.size == size {
					return Ok(());
				}
			}
		}
		debug!(source = %self.name, path = %self.path.display(), "reloading text_file source");
		let records = self.parse_file()?;
		let mut map = HashMap::new();
		for record in records {
			map.insert(record.system_id, record.data);
		}
		let mut cache = self.cache.write().expect("cache lock poisoned");
		let version = cache.as_ref().map(|e| e.version + 1).unwrap_or(1);
		*cache = Some(CacheEntry {
			mtime,
			size,
			version,
			records: map,
		});
		Ok(())
	}
}

#[async_trait]
impl DataSource for TextFileSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get_data(&self, system_id: &str, _preceding: &Value) -> Result<(Value, u64), DataSourceError> {
		self.ensure_loaded()?;
		let cache = self.cache.read().expect("cache lock poisoned");
		let entry = cache.as_ref().expect("just loaded");
		let data = entry.records.get(system_id).cloned().unwrap_or_else(Value::empty_map);
		Ok((data, entry.version))
	}

	async fn find_system(&self, lookup_key: &str, lookup_value: &str) -> Result<FindResult, DataSourceError> {
		self.ensure_loaded()?;
		let cache = self.cache.read().expect("cache lock poisoned");
		let entry = cache.as_ref().expect("just loaded");
		for (system_id, data) in &entry.records {
			if let Some(actual) = data.lookup(lookup_key).and_then(|v| v.as_scalar_string()) {
				if actual == lookup_value {
					return Ok(FindResult::Found(system_id.clone()));
				}
			}
		}
		Ok(FindResult::NotFound)
	}
}
