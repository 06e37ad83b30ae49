//! End-to-end scenarios from the data-source stack down through the
//! request-handler layer, assembling real `TextFileSource`,
//! `YamlTargetSource`, `SqliteDataSource` and `CompositeDataSource`
//! instances the way `server::run` wires them from configuration.

use std::sync::Arc;

use regex::Regex;
use vinegar::data_tree::Value;
use vinegar::handlers::{
	DataSourceErrorAction, FileHandler, FileHandlerConfig, Handler, LookupNoResultAction, Method, Request,
	SqliteUpdateHandler, SqliteUpdateHandlerConfig, Action,
};
use vinegar::sources::composite::CompositeDataSource;
use vinegar::sources::sqlite::SqliteDataSource;
use vinegar::sources::text_file::{TextFileSource, VariableSpec};
use vinegar::sources::yaml_target::YamlTargetSource;
use vinegar::sources::DataSource;
use vinegar::store::SqliteStore;
use vinegar::template::engine::DefaultEngine;
use vinegar::transforms::TransformChain;

fn host_variables() -> Vec<VariableSpec> {
	vec![
		VariableSpec {
			source: "mac".into(),
			transform: TransformChain::default(),
			key_path: "net:mac_addr".into(),
		},
		VariableSpec {
			source: "ip".into(),
			transform: TransformChain::default(),
			key_path: "net:ipv4_addr".into(),
		},
		VariableSpec {
			source: "host".into(),
			transform: TransformChain::default(),
			key_path: "net:hostname".into(),
		},
	]
}

fn suffix_chain() -> TransformChain {
	TransformChain::from_yaml(&serde_yaml::from_str("[{\"string.add_suffix\": \".example.com\"}]").unwrap()).unwrap()
}

fn normalize_mac_chain() -> TransformChain {
	TransformChain::from_yaml(&serde_yaml::from_str("[\"mac_address.normalize\"]").unwrap()).unwrap()
}

/// Scenario 1 (spec.md §8): text-file forward lookup projects named
/// captures into compound-key paths, with the system id derived from a
/// suffixed capture group.
#[tokio::test]
async fn text_file_forward_lookup_scenario() {
	let list = tempfile::NamedTempFile::new().unwrap();
	std::fs::write(list.path(), "02:00:00:00:00:01;192.0.2.1;myhost\n").unwrap();

	let pattern = Regex::new(r"^(?P<mac>[^;]+);(?P<ip>[^;]+);(?P<host>[^;]+)$").unwrap();
	let source = TextFileSource::new(
		"hosts".into(),
		list.path().to_path_buf(),
		pattern,
		"host".into(),
		suffix_chain(),
		host_variables(),
	);

	let (data, _version) = source.get_data("myhost.example.com", &Value::empty_map()).await.unwrap();
	assert_eq!(data.lookup("net:mac_addr"), Some(&Value::String("02:00:00:00:00:01".into())));
	assert_eq!(data.lookup("net:ipv4_addr"), Some(&Value::String("192.0.2.1".into())));
	assert_eq!(data.lookup("net:hostname"), Some(&Value::String("myhost".into())));
}

/// Scenario 2: a `file` handler configured with a hyphenated-MAC request
/// path and a `mac_address.normalize` lookup transform resolves the
/// system through reverse lookup and streams its file.
#[tokio::test]
async fn reverse_lookup_with_normalization_resolves_and_streams() {
	let list = tempfile::NamedTempFile::new().unwrap();
	std::fs::write(list.path(), "02:00:00:00:00:01;192.0.2.1;myhost\n").unwrap();
	let pattern = Regex::new(r"^(?P<mac>[^;]+);(?P<ip>[^;]+);(?P<host>[^;]+)$").unwrap();
	let source = Arc::new(TextFileSource::new(
		"hosts".into(),
		list.path().to_path_buf(),
		pattern,
		"host".into(),
		suffix_chain(),
		host_variables(),
	));
	let composite = Arc::new(CompositeDataSource::new(vec![source], false));

	let templates_dir = tempfile::tempdir().unwrap();
	std::fs::create_dir_all(templates_dir.path().join("myhost.example.com")).unwrap();
	std::fs::write(templates_dir.path().join("myhost.example.com").join("grub.cfg"), b"boot ok").unwrap();

	let engine = Arc::new(DefaultEngine::new());
	let handler = FileHandler::new(
		FileHandlerConfig {
			request_path: "/templates/…".into(),
			root_dir: templates_dir.path().to_path_buf(),
			lookup_key: Some("net:mac_addr".into()),
			lookup_value_transform: normalize_mac_chain(),
			template: None,
			data_source_error_action: DataSourceErrorAction::Fail,
			lookup_no_result_action: LookupNoResultAction::Fail,
			client_address_key: None,
			client_address_list: Vec::new(),
			file_suffix: None,
		},
		composite,
		engine,
	);

	let req = Request {
		method: Method::Get,
		path: "/templates/02-00-00-00-00-01/grub.cfg".to_string(),
		client_address: "198.51.100.9".parse().unwrap(),
		headers: Default::default(),
		body: Vec::new(),
	};
	assert!(handler.can_handle(&req));
	let response = handler.handle(&req).await.unwrap();
	match response.body {
		vinegar::handlers::Body::File { path, .. } => {
			let resolved = path.file_name().unwrap().to_string_lossy().into_owned();
			assert_eq!(resolved, "grub.cfg");
			assert!(path.parent().unwrap().ends_with("myhost.example.com"));
		}
		other => panic!("expected a file body, got {other:?}"),
	}
}

/// Scenario 3: a later `yaml_target` source overrides a `text_file`
/// source's contribution for the same key.
#[tokio::test]
async fn merge_precedence_later_source_wins() {
	let list = tempfile::NamedTempFile::new().unwrap();
	std::fs::write(list.path(), "02:00:00:00:00:01;192.0.2.1;myhost\n").unwrap();
	let pattern = Regex::new(r"^(?P<mac>[^;]+);(?P<ip>[^;]+);(?P<host>[^;]+)$").unwrap();
	let text_file = Arc::new(TextFileSource::new(
		"hosts".into(),
		list.path().to_path_buf(),
		pattern,
		"host".into(),
		suffix_chain(),
		host_variables(),
	));

	let yaml_dir = tempfile::tempdir().unwrap();
	std::fs::write(yaml_dir.path().join("top.yaml"), "'*': [override]\n").unwrap();
	std::fs::write(yaml_dir.path().join("override.yaml"), "net:\n  hostname: override\n").unwrap();
	let engine = Arc::new(DefaultEngine::new());
	let yaml_target = Arc::new(YamlTargetSource::new("targets".into(), yaml_dir.path().to_path_buf(), false, engine));

	let composite = CompositeDataSource::new(vec![text_file, yaml_target], false);
	let (data, _versions) = composite.get_data("myhost.example.com").await.unwrap();
	assert_eq!(data.lookup("net:hostname"), Some(&Value::String("override".into())));
	assert_eq!(data.lookup("net:mac_addr"), Some(&Value::String("02:00:00:00:00:01".into())));
}

/// Scenario 4: `sqlite_update` grants or denies access based on the
/// system's stored `net:ipv4_addr`, unioned with any configured
/// `client_address_list`.
#[tokio::test]
async fn sqlite_update_access_control_scenario() {
	let store = SqliteStore::open_in_memory().unwrap();
	store.set("myhost.example.com", "net:ipv4_addr", &Value::String("192.0.2.1".into())).unwrap();
	store.set("myhost.example.com", "netboot_enabled", &Value::Bool(true)).unwrap();

	let handler = SqliteUpdateHandler::new(
		SqliteUpdateHandlerConfig {
			request_path: "/reset-netboot-enabled/".into(),
			action: Action::DeleteData,
			key: "netboot_enabled".into(),
			value: None,
			client_address_key: Some("net:ipv4_addr".into()),
			client_address_list: Vec::new(),
		},
		store.clone(),
	);

	let allowed = Request {
		method: Method::Post,
		path: "/reset-netboot-enabled/myhost.example.com".to_string(),
		client_address: "192.0.2.1".parse().unwrap(),
		headers: Default::default(),
		body: Vec::new(),
	};
	let response = handler.handle(&allowed).await.unwrap();
	assert_eq!(response.status, 204);
	assert_eq!(store.get("myhost.example.com", "netboot_enabled").unwrap(), None);

	store.set("myhost.example.com", "netboot_enabled", &Value::Bool(true)).unwrap();
	let denied = Request {
		method: Method::Post,
		path: "/reset-netboot-enabled/myhost.example.com".to_string(),
		client_address: "192.0.2.2".parse().unwrap(),
		headers: Default::default(),
		body: Vec::new(),
	};
	let err = handler.handle(&denied).await.unwrap_err();
	assert!(matches!(err, vinegar::handlers::HandlerError::AccessDenied));
	assert_eq!(store.get("myhost.example.com", "netboot_enabled").unwrap(), Some(Value::Bool(true)));
}

/// Scenario 6: an unresolved lookup with `data_source_error_action=warn`
/// and `lookup_no_result_action=continue` renders with `id`/`data`
/// absent instead of failing the request.
#[tokio::test]
async fn template_fallback_renders_local_boot_for_unknown_mac() {
	let dir = tempfile::tempdir().unwrap();
	let template_path = dir.path().join("boot.tmpl");
	std::fs::write(
		&template_path,
		"{% if id %}menu entry '{{ id }}'{% else %}menu entry 'local boot'{% endif %}",
	)
	.unwrap();

	let composite = Arc::new(CompositeDataSource::new(Vec::new(), false));
	let engine = Arc::new(DefaultEngine::new());
	let handler = FileHandler::new(
		FileHandlerConfig {
			request_path: "/boot/…".into(),
			root_dir: dir.path().to_path_buf(),
			lookup_key: Some("net:mac_addr".into()),
			lookup_value_transform: normalize_mac_chain(),
			template: Some(template_path),
			data_source_error_action: DataSourceErrorAction::Warn,
			lookup_no_result_action: LookupNoResultAction::Continue,
			client_address_key: None,
			client_address_list: Vec::new(),
			file_suffix: None,
		},
		composite,
		engine,
	);

	let req = Request {
		method: Method::Get,
		path: "/boot/ff-ff-ff-ff-ff-ff/grub.cfg".to_string(),
		client_address: "198.51.100.9".parse().unwrap(),
		headers: Default::default(),
		body: Vec::new(),
	};
	let response = handler.handle(&req).await.unwrap();
	match response.body {
		vinegar::handlers::Body::Bytes(bytes) => assert_eq!(bytes, b"menu entry 'local boot'"),
		other => panic!("expected rendered bytes, got {other:?}"),
	}
}

/// The `sqlite` data source reflects writes immediately, with no caching
/// layer between `sqlite_update` and a later `get_data` in a composite
/// built on the same backing file.
#[tokio::test]
async fn sqlite_source_composes_with_no_caching() {
	let store = SqliteStore::open_in_memory().unwrap();
	let source = Arc::new(SqliteDataSource::new("state".into(), store.clone(), None, false));
	let composite = CompositeDataSource::new(vec![source], false);

	let (before, _) = composite.get_data("myhost.example.com").await.unwrap();
	assert!(before.lookup("netboot_enabled").is_none());

	store.set("myhost.example.com", "netboot_enabled", &Value::Bool(true)).unwrap();
	let (after, _) = composite.get_data("myhost.example.com").await.unwrap();
	assert_eq!(after.lookup("netboot_enabled"), Some(&Value::Bool(true)));
}
