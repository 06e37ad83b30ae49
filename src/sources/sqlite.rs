//! `sqlite` data source: projects rows of the persistent state store into
//! a nested data tree. Deliberately uncached -- every `get_data` call
//! touches the database, so writes made through `sqlite_update` are
//! visible to the very next request.

use super::{DataSource, DataSourceError, FindResult};
use crate::data_tree::Value;
use crate::store::SqliteStore;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub struct SqliteDataSource {
	name: String,
	store: SqliteStore,
	key_prefix: Option<String>,
	find_system_enabled: bool,
}

impl SqliteDataSource {
	pub fn new(name: String, store: SqliteStore, key_prefix: Option<String>, find_system_enabled: bool) -> Self {
		Self {
			name,
			store,
			key_prefix,
			find_system_enabled,
		}
	}

	fn err(&self, e: crate::store::StoreError) -> DataSourceError {
		DataSourceError::Io {
			source: self.name.clone(),
			message: e.to_string(),
		}
	}
}

fn version_of(rows: &[(String, Value)]) -> u64 {
	let mut hasher = DefaultHasher::new();
	for (key, value) in rows {
		key.hash(&mut hasher);
		format!("{:?}", value).hash(&mut hasher);
	}
	hasher.finish()
}

#[async_trait]
impl DataSource for SqliteDataSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get_data(&self, system_id: &str, _preceding: &Value) -> Result<(Value, u64), DataSourceError> {
		let store = self.store.clone();
		let system_id = system_id.to_string();
		let rows = tokio::task::spawn_blocking(move || store.iter_system(&system_id))
			.await
			.expect("blocking task panicked")
			.map_err(|e| self.err(e))?;

		let version = version_of(&rows);
		let mut tree = Value::empty_map();
		for (key, value) in rows {
			let path = match &self.key_prefix {
				Some(prefix) => format!("{}:{}", prefix, key),
				None => key,
			};
			tree.set_path(&path, value);
		}
		Ok((tree, version))
	}

	async fn find_system(&self, lookup_key: &str, lookup_value: &str) -> Result<FindResult, DataSourceError> {
		if !self.find_system_enabled {
			return Ok(FindResult::Unsupported);
		}
		let store = self.store.clone();
		let key = lookup_key.to_string();
		let value = lookup_value.to_string();
		let found = tokio::task::spawn_blocking(move || store.find_by_value(&key, &value))
			.await
			.expect("blocking task panicked")
			.map_err(|e| self.err(e))?;
		Ok(match found {
			Some(id) => FindResult::Found(id),
			None => FindResult::NotFound,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn projects_rows_under_key_prefix() {
		let store = SqliteStore::open_in_memory().unwrap();
		store.set("host1", "mac_addr", &Value::String("02:00:00:00:00:01".into())).unwrap();
		let source = SqliteDataSource::new("sql".into(), store, Some("net".into()), false);
		let (data, _v) = source.get_data("host1", &Value::empty_map()).await.unwrap();
		assert_eq!(
			data.lookup("net:mac_addr"),
			Some(&Value::String("02:00:00:00:00:01".into()))
		);
	}

	#[tokio::test]
	async fn find_system_disabled_by_default() {
		let store = SqliteStore::open_in_memory().unwrap();
		let source = SqliteDataSource::new("sql".into(), store, None, false);
		let result = source.find_system("k", "v").await.unwrap();
		assert_eq!(result, FindResult::Unsupported);
	}

	#[tokio::test]
	async fn find_system_enabled_scans_values() {
		let store = SqliteStore::open_in_memory().unwrap();
		store.set("host1", "ipv4_addr", &Value::String("192.0.2.1".into())).unwrap();
		let source = SqliteDataSource::new("sql".into(), store, None, true);
		let result = source.find_system("ipv4_addr", "192.0.2.1").await.unwrap();
		assert_eq!(result, FindResult::Found("host1".into()));
	}

	#[tokio::test]
	async fn updates_visible_immediately_no_cache() {
		let store = SqliteStore::open_in_memory().unwrap();
		let source = SqliteDataSource::new("sql".into(), store.clone(), None, false);
		let (before, _) = source.get_data("host1", &Value::empty_map()).await.unwrap();
		assert_eq!(before, Value::empty_map());
		store.set("host1", "k", &Value::Int(1)).unwrap();
		let (after, _) = source.get_data("host1", &Value::empty_map()).await.unwrap();
		assert_eq!(after.lookup("k"), Some(&Value::Int(1)));
	}
}
