use super::{DataSource, DataSourceError, FindResult};
use crate::data_tree::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Iterates its sources in declared order. `get_data` merges each
/// source's contribution into a running tree using the running tree as
/// `preceding_data` for the next source; `find_system` returns the first
/// supported, non-absent reverse lookup result.
pub struct CompositeDataSource {
	sources: Vec<Arc<dyn DataSource>>,
	merge_lists: bool,
	cache: RwLock<HashMap<(String, Vec<u64>), Value>>,
}

impl CompositeDataSource {
	pub fn new(sources: Vec<Arc<dyn DataSource>>, merge_lists: bool) -> Self {
		Self {
			sources,
			merge_lists,
			cache: RwLock::new(HashMap::new()),
		}
	}

	/// The merged data tree for `system_id` plus the aggregate version
	/// vector `(v_1, v_2, ...)`. Unchanged component versions yield an
	/// unchanged aggregate, so callers can treat the aggregate as a cache
	/// key.
	pub async fn get_data(&self, system_id: &str) -> Result<(Value, Vec<u64>), DataSourceError> {
		let mut merged = Value::empty_map();
		let mut versions = Vec::with_capacity(self.sources.len());
		for source in &self.sources {
			let (contribution, version) = source.get_data(system_id, &merged).await?;
			merged.merge(&contribution, self.merge_lists);
			versions.push(version);
		}

		{
			let cache = self.cache.read().expect("cache lock poisoned");
			if let Some(cached) = cache.get(&(system_id.to_string(), versions.clone())) {
				trace!(system_id, "composite data-tree cache hit");
				return Ok((cached.clone(), versions));
			}
		}

		let mut cache = self.cache.write().expect("cache lock poisoned");
		cache.insert((system_id.to_string(), versions.clone()), merged.clone());
		Ok((merged, versions))
	}

	pub async fn find_system(
		&self,
		lookup_key: &str,
		lookup_value: &str,
	) -> Result<Option<String>, DataSourceError> {
		for source in &self.sources {
			match source.find_system(lookup_key, lookup_value).await? {
				FindResult::Found(id) => {
					debug!(source = source.name(), lookup_key, "reverse lookup resolved");
					return Ok(Some(id));
				}
				FindResult::NotFound | FindResult::Unsupported => continue,
			}
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;
	use std::sync::atomic::{AtomicU64, Ordering};

	struct Fixed {
		name: String,
		key: String,
		value: Value,
		version: AtomicU64,
		reverse: Option<(String, String, String)>,
	}

	#[async_trait::async_trait]
	impl DataSource for Fixed {
		fn name(&self) -> &str {
			&self.name
		}

		async fn get_data(&self, _id: &str, _preceding: &Value) -> Result<(Value, u64), DataSourceError> {
			let mut m = BTreeMap::new();
			m.insert(self.key.clone(), self.value.clone());
			Ok((Value::Map(m), self.version.load(Ordering::SeqCst)))
		}

		async fn find_system(&self, key: &str, value: &str) -> Result<FindResult, DataSourceError> {
			match &self.reverse {
				Some((k, v, id)) if k == key && v == value => Ok(FindResult::Found(id.clone())),
				Some(_) => Ok(FindResult::NotFound),
				None => Ok(FindResult::Unsupported),
			}
		}
	}

	#[tokio::test]
	async fn later_source_wins_on_merge() {
		let a = Arc::new(Fixed {
			name: "a".into(),
			key: "hostname".into(),
			value: Value::String("myhost".into()),
			version: AtomicU64::new(1),
			reverse: None,
		});
		let b = Arc::new(Fixed {
			name: "b".into(),
			key: "hostname".into(),
			value: Value::String("override".into()),
			version: AtomicU64::new(1),
			reverse: None,
		});
		let composite = CompositeDataSource::new(vec![a, b], false);
		let (data, versions) = composite.get_data("x").await.unwrap();
		assert_eq!(data.lookup("hostname"), Some(&Value::String("override".into())));
		assert_eq!(versions, vec![1, 1]);
	}

	#[tokio::test]
	async fn find_system_skips_unsupported() {
		let a = Arc::new(Fixed {
			name: "a".into(),
			key: "k".into(),
			value: Value::Null,
			version: AtomicU64::new(1),
			reverse: None,
		});
		let b = Arc::new(Fixed {
			name: "b".into(),
			key: "k".into(),
			value: Value::Null,
			version: AtomicU64::new(1),
			reverse: Some(("net:mac_addr".into(), "02:00:00:00:00:01".into(), "myhost".into())),
		});
		let composite = CompositeDataSource::new(vec![a, b], false);
		let found = composite
			.find_system("net:mac_addr", "02:00:00:00:00:01")
			.await
			.unwrap();
		assert_eq!(found, Some("myhost".to_string()));
	}

	#[tokio::test]
	async fn get_data_is_idempotent() {
		let a = Arc::new(Fixed {
			name: "a".into(),
			key: "hostname".into(),
			value: Value::String("myhost".into()),
			version: AtomicU64::new(1),
			reverse: None,
		});
		let composite = CompositeDataSource::new(vec![a], false);
		let first = composite.get_data("x").await.unwrap();
		let second = composite.get_data("x").await.unwrap();
		assert_eq!(first, second);
	}
}
