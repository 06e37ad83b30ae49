//! `yaml_target` data source: a root `top.yaml` maps matcher expressions
//! to template files; matching files are rendered and parsed as YAML,
//! then merged in declaration order.

use super::{DataSource, DataSourceError, FindResult};
use crate::data_tree::Value;
use crate::matcher;
use crate::template::{Engine, TemplateContext};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::debug;

pub struct YamlTargetSource {
	name: String,
	root_dir: PathBuf,
	top_file: PathBuf,
	merge_lists: bool,
	engine: Arc<dyn Engine>,
	cache: RwLock<Option<CacheEntry>>,
}

struct CacheEntry {
	mtime: SystemTime,
	version: u64,
	top: serde_yaml::Mapping,
}

impl YamlTargetSource {
	pub fn new(name: String, root_dir: PathBuf, merge_lists: bool, engine: Arc<dyn Engine>) -> Self {
		let top_file = root_dir.join("top.yaml");
		Self {
			name,
			root_dir,
			top_file,
			merge_lists,
			engine,
			cache: RwLock::new(None),
		}
	}

	fn err(&self, message: impl Into<String>) -> DataSourceError {
		DataSourceError::Parse {
			source: self.name.clone(),
			message: message.into(),
		}
	}

	fn ensure_loaded(&self) -> Result<(), DataSourceError> {
		let meta = std::fs::metadata(&self.top_file).map_err(|e| DataSourceError::Io {
			source: self.name.clone(),
			message: e.to_string(),
		})?;
		let mtime = meta.modified().map_err(|e| DataSourceError::Io {
			source: self.name.clone(),
			message: e.to_string(),
		})?;
		{
			let cache = self.cache.read().expect("cache lock poisoned");
			if let Some(entry) = cache.as_ref() {
				if entry.mtime == mtime {
					return Ok(());
				}
			}
		}
		debug!(source = %self.name, "reloading yaml_target top file");
		let contents = std::fs::read_to_string(&self.top_file).map_err(|e| DataSourceError::Io {
			source: self.name.clone(),
			message: e.to_string(),
		})?;
		let top: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|e| self.err(e.to_string()))?;
		let top = match top {
			serde_yaml::Value::Mapping(m) => m,
			serde_yaml::Value::Null => serde_yaml::Mapping::new(),
			_ => return Err(self.err("top.yaml must be a mapping")),
		};
		let mut cache = self.cache.write().expect("cache lock poisoned");
		let version = cache.as_ref().map(|e| e.version + 1).unwrap_or(1);
		*cache = Some(CacheEntry { mtime, version, top });
		Ok(())
	}

	/// Resolve a declared file name to a path under `root_dir`. Dotted
	/// names map to directory paths; a bare name resolves to
	/// `<name>.yaml` or `<name>/init.yaml`.
	fn resolve_path(&self, file_name: &str) -> Result<PathBuf, DataSourceError> {
		let relative = file_name.strip_prefix("./").unwrap_or(file_name);
		let as_path = relative.replace('.', "/");
		let direct = self.root_dir.join(format!("{}.yaml", as_path));
		if direct.exists() {
			return Ok(direct);
		}
		let init = self.root_dir.join(&as_path).join("init.yaml");
		if init.exists() {
			return Ok(init);
		}
		Err(self.err(format!("no such target file: {}", file_name)))
	}

	fn render_and_parse(
		&self,
		path: &Path,
		system_id: &str,
		preceding: &Value,
	) -> Result<Value, DataSourceError> {
		let context = TemplateContext::new(Some(system_id.to_string()), preceding.clone());
		let rendered = self
			.engine
			.render(path, &context)
			.map_err(|e| DataSourceError::Template {
				source: self.name.clone(),
				message: e.to_string(),
			})?;
		let text = String::from_utf8(rendered).map_err(|e| self.err(e.to_string()))?;
		let parsed: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| self.err(e.to_string()))?;
		Ok(Value::from(parsed))
	}
}

#[async_trait]
impl DataSource for YamlTargetSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get_data(&self, system_id: &str, preceding_data: &Value) -> Result<(Value, u64), DataSourceError> {
		self.ensure_loaded()?;
		let (top, version) = {
			let cache = self.cache.read().expect("cache lock poisoned");
			let entry = cache.as_ref().expect("just loaded");
			(entry.top.clone(), entry.version)
		};

		let mut accumulator = Value::empty_map();
		for (key, files) in top.iter() {
			let expr_str = key
				.as_str()
				.ok_or_else(|| self.err("top.yaml keys must be strings"))?;
			let expr = matcher::parse(expr_str).map_err(|e| self.err(e.to_string()))?;
			if !matcher::eval(&expr, system_id, preceding_data) {
				continue;
			}
			let names: Vec<String> = match files {
				serde_yaml::Value::Sequence(seq) => seq
					.iter()
					.filter_map(|v| v.as_str().map(|s| s.to_string()))
					.collect(),
				serde_yaml::Value::String(s) => vec![s.clone()],
				_ => continue,
			};
			for name in names {
				let path = self.resolve_path(&name)?;
				let parsed = self.render_and_parse(&path, system_id, preceding_data)?;
				accumulator.merge(&parsed, self.merge_lists);
			}
		}
		Ok((accumulator, version))
	}

	async fn find_system(&self, _lookup_key: &str, _lookup_value: &str) -> Result<FindResult, DataSourceError> {
		Ok(FindResult::Unsupported)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::template::engine::DefaultEngine;

	#[tokio::test]
	async fn matches_wildcard_and_merges() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("top.yaml"),
			"'*': [base]\nid \"myhost.example.com\": [override]\n",
		)
		.unwrap();
		std::fs::write(dir.path().join("base.yaml"), "net:\n  hostname: myhost\n").unwrap();
		std::fs::write(dir.path().join("override.yaml"), "net:\n  hostname: override\n").unwrap();

		let engine = Arc::new(DefaultEngine::new());
		let source = YamlTargetSource::new("yt".into(), dir.path().to_path_buf(), false, engine);
		let (data, _v) = source
			.get_data("myhost.example.com", &Value::empty_map())
			.await
			.unwrap();
		assert_eq!(data.lookup("net:hostname"), Some(&Value::String("override".into())));
	}

	#[tokio::test]
	async fn does_not_support_find_system() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("top.yaml"), "'*': []\n").unwrap();
		let engine = Arc::new(DefaultEngine::new());
		let source = YamlTargetSource::new("yt".into(), dir.path().to_path_buf(), false, engine);
		let result = source.find_system("k", "v").await.unwrap();
		assert_eq!(result, FindResult::Unsupported);
	}
}
