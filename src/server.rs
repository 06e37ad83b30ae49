//! Server bootstrap: turns a parsed `Configuration` into running HTTP
//! and TFTP servers, wiring data sources into a composite stack and
//! request-handler configs into the handler pipelines each server owns.
//! Shutdown is a `tokio::sync::watch` channel driven by `ctrl_c`, the
//! same shape the rest of this crate uses `tokio::sync` primitives for.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::config::{Configuration, DataSourceConfig, RequestHandlerConfig};
use crate::handlers::{
	DataSourceErrorAction, FileHandler, FileHandlerConfig, Handler, LookupNoResultAction, SqliteUpdateHandler,
	SqliteUpdateHandlerConfig,
};
use crate::net::http::{HttpServer, HttpServerConfig};
use crate::net::tftp::{TftpError, TftpServer, TftpServerConfig};
use crate::sources::composite::CompositeDataSource;
use crate::sources::sqlite::SqliteDataSource;
use crate::sources::text_file::{TextFileSource, VariableSpec};
use crate::sources::yaml_target::YamlTargetSource;
use crate::sources::DataSource;
use crate::store::{SqliteStore, StoreError};
use crate::template::engine::DefaultEngine;
use crate::template::Engine;
use crate::transforms::{ConfigError as TransformConfigError, TransformChain};

#[derive(Debug, Error)]
pub enum BootstrapError {
	#[error("invalid record_pattern regex: {0}")]
	Regex(#[from] regex::Error),
	#[error("transform chain error: {0}")]
	Transform(#[from] TransformConfigError),
	#[error("persistent store error: {0}")]
	Store(#[from] StoreError),
	#[error("invalid bind address {address}: {message}")]
	BindAddress { address: String, message: String },
	#[error("HTTP server error: {0}")]
	Http(#[from] std::io::Error),
	#[error("TFTP server error: {0}")]
	Tftp(#[from] TftpError),
}

impl BootstrapError {
	/// Everything but a live listener's own I/O failure happens while
	/// assembling the component graph, i.e. at startup (exit code 2); a
	/// listener that fails after `run()` has taken over is a runtime
	/// fatal (exit code 3).
	pub fn exit_code(&self) -> i32 {
		match self {
			BootstrapError::Http(_) | BootstrapError::Tftp(_) => 3,
			_ => 2,
		}
	}
}

/// Opens (or reuses, if already opened for the same path) a `SqliteStore`.
/// The `sqlite` data source and any `sqlite_update` handlers pointed at
/// the same file share one connection pool, per spec.md §5's "single
/// point of serialization for mutable state".
struct StoreCache {
	stores: HashMap<PathBuf, SqliteStore>,
}

impl StoreCache {
	fn new() -> Self {
		Self { stores: HashMap::new() }
	}

	fn open(&mut self, path: &Path) -> Result<SqliteStore, BootstrapError> {
		if let Some(store) = self.stores.get(path) {
			return Ok(store.clone());
		}
		let store = SqliteStore::open(path)?;
		self.stores.insert(path.to_path_buf(), store.clone());
		Ok(store)
	}
}

fn build_data_source(
	config: &DataSourceConfig,
	engine: Arc<dyn Engine>,
	merge_lists: bool,
	stores: &mut StoreCache,
) -> Result<Arc<dyn DataSource>, BootstrapError> {
	Ok(match config {
		DataSourceConfig::TextFile(cfg) => {
			let pattern = Regex::new(&cfg.record_pattern)?;
			let system_id_transform = TransformChain::from_yaml(&cfg.system_id_transform)?;
			let mut variables = Vec::with_capacity(cfg.variables.len());
			for var in &cfg.variables {
				variables.push(VariableSpec {
					source: var.source.clone(),
					transform: TransformChain::from_yaml(&var.transform)?,
					key_path: var.key_path.clone(),
				});
			}
			Arc::new(TextFileSource::new(
				cfg.instance_name.clone(),
				cfg.path.clone(),
				pattern,
				cfg.system_id_source.clone(),
				system_id_transform,
				variables,
			))
		}
		DataSourceConfig::YamlTarget(cfg) => Arc::new(YamlTargetSource::new(
			cfg.instance_name.clone(),
			cfg.root_dir.clone(),
			merge_lists,
			engine,
		)),
		DataSourceConfig::Sqlite(cfg) => {
			let store = stores.open(&cfg.db_file)?;
			Arc::new(SqliteDataSource::new(
				cfg.instance_name.clone(),
				store,
				cfg.key_prefix.clone(),
				cfg.find_system_enabled,
			))
		}
	})
}

fn build_handler(
	config: &RequestHandlerConfig,
	composite: Arc<CompositeDataSource>,
	engine: Arc<dyn Engine>,
	stores: &mut StoreCache,
) -> Result<Arc<dyn Handler>, BootstrapError> {
	Ok(match config {
		RequestHandlerConfig::File(cfg) => {
			let lookup_value_transform = TransformChain::from_yaml(&cfg.lookup_value_transform)?;
			let handler = FileHandler::new(
				FileHandlerConfig {
					request_path: cfg.request_path.clone(),
					root_dir: cfg.root_dir.clone(),
					lookup_key: cfg.lookup_key.clone(),
					lookup_value_transform,
					template: cfg.template.clone(),
					data_source_error_action: match cfg.data_source_error_action {
						crate::config::DataSourceErrorActionConfig::Fail => DataSourceErrorAction::Fail,
						crate::config::DataSourceErrorActionConfig::Warn => DataSourceErrorAction::Warn,
						crate::config::DataSourceErrorActionConfig::Continue => DataSourceErrorAction::Continue,
					},
					lookup_no_result_action: match cfg.lookup_no_result_action {
						crate::config::LookupNoResultActionConfig::Fail => LookupNoResultAction::Fail,
						crate::config::LookupNoResultActionConfig::Continue => LookupNoResultAction::Continue,
					},
					client_address_key: cfg.client_address_key.clone(),
					client_address_list: cfg.client_address_list.clone(),
					file_suffix: cfg.file_suffix.clone(),
				},
				composite,
				engine,
			);
			Arc::new(handler)
		}
		RequestHandlerConfig::SqliteUpdate(cfg) => {
			let store = stores.open(&cfg.db_file)?;
			let value = match &cfg.value {
				Some(raw) => Some(crate::data_tree::Value::from(raw.clone())),
				None => None,
			};
			let handler = SqliteUpdateHandler::new(
				SqliteUpdateHandlerConfig {
					request_path: cfg.request_path.clone(),
					action: match cfg.action {
						crate::config::ActionConfig::DeleteData => crate::handlers::Action::DeleteData,
						crate::config::ActionConfig::SetValue => crate::handlers::Action::SetValue,
						crate::config::ActionConfig::SetJsonValueFromRequestBody => {
							crate::handlers::Action::SetJsonValueFromRequestBody
						}
						crate::config::ActionConfig::SetTextValueFromRequestBody => {
							crate::handlers::Action::SetTextValueFromRequestBody
						}
					},
					key: cfg.key.clone(),
					value,
					client_address_key: cfg.client_address_key.clone(),
					client_address_list: cfg.client_address_list.clone(),
				},
				store,
			);
			Arc::new(handler)
		}
	})
}

fn parse_bind_address(address: &str, port: u16) -> Result<SocketAddr, BootstrapError> {
	let candidate = if address.contains(':') && !address.starts_with('[') {
		format!("[{}]:{}", address, port)
	} else {
		format!("{}:{}", address, port)
	};
	candidate.parse().map_err(|e: std::net::AddrParseError| BootstrapError::BindAddress {
		address: address.to_string(),
		message: e.to_string(),
	})
}

pub async fn run(configuration: Configuration) -> Result<(), BootstrapError> {
	let engine: Arc<dyn Engine> = Arc::new(DefaultEngine::new());
	let mut stores = StoreCache::new();

	let mut sources = Vec::with_capacity(configuration.data_sources.len());
	for source_config in &configuration.data_sources {
		sources.push(build_data_source(
			source_config,
			Arc::clone(&engine),
			configuration.data_sources_merge_lists,
			&mut stores,
		)?);
	}
	let composite = Arc::new(CompositeDataSource::new(sources, configuration.data_sources_merge_lists));

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

	let mut tasks = Vec::new();

	if let Some(http_config) = &configuration.http {
		let mut handlers = Vec::with_capacity(http_config.request_handlers.len());
		for handler_config in &http_config.request_handlers {
			handlers.push(build_handler(handler_config, Arc::clone(&composite), Arc::clone(&engine), &mut stores)?);
		}
		let bind_address = parse_bind_address(&http_config.bind_address, http_config.http_port())?;
		let server = HttpServer::new(HttpServerConfig { bind_address }, handlers);
		let rx = shutdown_rx.clone();
		tasks.push(tokio::spawn(async move { server.run(rx).await.map_err(BootstrapError::from) }));
	}

	if let Some(tftp_config) = &configuration.tftp {
		let mut handlers = Vec::with_capacity(tftp_config.request_handlers.len());
		for handler_config in &tftp_config.request_handlers {
			handlers.push(build_handler(handler_config, Arc::clone(&composite), Arc::clone(&engine), &mut stores)?);
		}
		let bind_address = parse_bind_address(&tftp_config.bind_address, tftp_config.tftp_port())?;
		let server = TftpServer::new(TftpServerConfig { bind_address, max_retries: 5 }, handlers);
		let rx = shutdown_rx.clone();
		tasks.push(tokio::spawn(async move { server.run(rx).await.map_err(BootstrapError::from) }));
	}

	if tasks.is_empty() {
		info!("no http or tftp section configured, nothing to run");
		return Ok(());
	}

	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		info!("received shutdown signal");
		let _ = shutdown_tx.send(true);
	});

	for task in tasks {
		task.await.expect("server task panicked")?;
	}
	Ok(())
}
