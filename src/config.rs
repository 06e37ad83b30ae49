//! Configuration loading: a layered YAML builder, the same shape as the
//! teacher's configuration loader (local file, then system file, then a
//! user-config-dir copy, each optional and later-wins) adapted from JSON
//! to YAML and from this crate's own config shape (`data_sources`,
//! `http`, `tftp`, logging keys).

use std::path::PathBuf;

use config::{Config as ConfigBuilder, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("configuration path is not valid UTF-8: {0}")]
	InvalidPath(PathBuf),
	#[error("failed to build configuration: {0}")]
	Build(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
	#[serde(default)]
	pub data_sources: Vec<DataSourceConfig>,
	#[serde(default)]
	pub data_sources_merge_lists: bool,
	#[serde(default)]
	pub http: Option<ServerSectionConfig>,
	#[serde(default)]
	pub tftp: Option<ServerSectionConfig>,
	#[serde(default)]
	pub logging_config_file: Option<PathBuf>,
	#[serde(default)]
	pub logging_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSectionConfig {
	#[serde(default = "default_bind_address")]
	pub bind_address: String,
	pub bind_port: Option<u16>,
	#[serde(default)]
	pub request_handlers: Vec<RequestHandlerConfig>,
}

fn default_bind_address() -> String {
	"::".to_string()
}

impl ServerSectionConfig {
	pub fn http_port(&self) -> u16 {
		self.bind_port.unwrap_or(80)
	}

	pub fn tftp_port(&self) -> u16 {
		self.bind_port.unwrap_or(69)
	}
}

/// `name` doubles as the source-type discriminator (`text_file`,
/// `yaml_target`, `sqlite`), the same way `name: file` selects a request
/// handler implementation below -- both read straight off the config
/// keys spec.md §6 lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum DataSourceConfig {
	TextFile(TextFileSourceConfig),
	YamlTarget(YamlTargetSourceConfig),
	Sqlite(SqliteSourceConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextFileSourceConfig {
	#[serde(default = "default_source_instance_name")]
	pub instance_name: String,
	pub path: PathBuf,
	pub record_pattern: String,
	pub system_id_source: String,
	#[serde(default)]
	pub system_id_transform: serde_yaml::Value,
	#[serde(default)]
	pub variables: Vec<VariableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableConfig {
	pub key_path: String,
	pub source: String,
	#[serde(default)]
	pub transform: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YamlTargetSourceConfig {
	#[serde(default = "default_source_instance_name")]
	pub instance_name: String,
	pub root_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteSourceConfig {
	#[serde(default = "default_source_instance_name")]
	pub instance_name: String,
	pub db_file: PathBuf,
	#[serde(default)]
	pub key_prefix: Option<String>,
	#[serde(default)]
	pub find_system_enabled: bool,
}

fn default_source_instance_name() -> String {
	"unnamed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum RequestHandlerConfig {
	File(FileHandlerEntryConfig),
	SqliteUpdate(SqliteUpdateHandlerEntryConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileHandlerEntryConfig {
	pub request_path: String,
	pub root_dir: PathBuf,
	#[serde(default)]
	pub lookup_key: Option<String>,
	#[serde(default)]
	pub lookup_value_transform: serde_yaml::Value,
	#[serde(default)]
	pub template: Option<PathBuf>,
	#[serde(default)]
	pub data_source_error_action: DataSourceErrorActionConfig,
	#[serde(default)]
	pub lookup_no_result_action: LookupNoResultActionConfig,
	#[serde(default)]
	pub client_address_key: Option<String>,
	#[serde(default)]
	pub client_address_list: Vec<String>,
	#[serde(default)]
	pub file_suffix: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceErrorActionConfig {
	#[default]
	Fail,
	Warn,
	Continue,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupNoResultActionConfig {
	#[default]
	Fail,
	Continue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteUpdateHandlerEntryConfig {
	pub request_path: String,
	pub db_file: PathBuf,
	pub action: ActionConfig,
	pub key: String,
	#[serde(default)]
	pub value: Option<serde_yaml::Value>,
	#[serde(default)]
	pub client_address_key: Option<String>,
	#[serde(default)]
	pub client_address_list: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionConfig {
	DeleteData,
	SetValue,
	SetJsonValueFromRequestBody,
	SetTextValueFromRequestBody,
}

impl Configuration {
	/// An explicit `--config-file` path is required and exclusive.
	/// Otherwise, layer `./vinegar.yaml`, then `/etc/vinegar/vinegar.yaml`,
	/// then a user-config-dir copy, each optional, later sources
	/// overriding earlier ones.
	pub fn load(path: &Option<PathBuf>) -> Result<Self, ConfigError> {
		if let Some(explicit) = path {
			let name = explicit.to_str().ok_or_else(|| ConfigError::InvalidPath(explicit.clone()))?;
			let builder = ConfigBuilder::builder().add_source(File::new(name, FileFormat::Yaml).required(true));
			let built = builder.build()?;
			return Ok(built.try_deserialize()?);
		}

		let local_path = PathBuf::from("./vinegar.yaml");
		let system_path = PathBuf::from("/etc/vinegar/vinegar.yaml");
		let user_path = dirs::config_dir().map(|dir| dir.join("vinegar").join("vinegar.yaml"));

		let mut builder = ConfigBuilder::builder()
			.add_source(File::new(local_path.to_string_lossy().as_ref(), FileFormat::Yaml).required(false))
			.add_source(File::new(system_path.to_string_lossy().as_ref(), FileFormat::Yaml).required(false));
		if let Some(user_path) = user_path {
			builder = builder.add_source(File::new(user_path.to_string_lossy().as_ref(), FileFormat::Yaml).required(false));
		}
		let built = builder.build()?;
		Ok(built.try_deserialize()?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn loads_minimal_document_with_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "data_sources: []\nhttp:\n  request_handlers: []\n").unwrap();
		let config = Configuration::load(&Some(file.path().to_path_buf())).unwrap();
		assert!(!config.data_sources_merge_lists);
		assert_eq!(config.http.unwrap().http_port(), 80);
	}

	#[test]
	fn parses_data_source_and_handler_variants() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(
			file,
			r#"
data_sources:
  - name: text_file
    instance_name: hosts
    path: /srv/list.txt
    record_pattern: "(?P<mac>\\S+);(?P<ip>\\S+);(?P<host>\\S+)"
    system_id_source: host
http:
  bind_port: 8080
  request_handlers:
    - name: file
      request_path: "/templates/…"
      root_dir: /srv/templates
      lookup_key: ":system_id:"
tftp:
  request_handlers:
    - name: sqlite_update
      request_path: "/reset/"
      db_file: /srv/state.sqlite
      action: delete_data
      key: netboot_enabled
"#
		)
		.unwrap();
		let config = Configuration::load(&Some(file.path().to_path_buf())).unwrap();
		assert_eq!(config.data_sources.len(), 1);
		assert_eq!(config.http.as_ref().unwrap().http_port(), 8080);
		assert_eq!(config.tftp.as_ref().unwrap().tftp_port(), 69);
		match &config.data_sources[0] {
			DataSourceConfig::TextFile(cfg) => assert_eq!(cfg.instance_name, "hosts"),
			_ => panic!("expected a text_file source"),
		}
	}
}
