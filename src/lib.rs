pub mod cli;
pub mod config;
pub mod data_tree;
pub mod handlers;
pub mod matcher;
pub mod net;
pub mod server;
pub mod sources;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod transforms;

use clap::Parser;
use cli::{Cli, Commands};
use config::Configuration;
use thiserror::Error;

pub async fn run() -> Result<(), RunError> {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) => {
			eprintln!("{}", e);
			std::process::exit(1);
		}
	};

	let Commands::Server(args) = cli.command;
	let configuration = Configuration::load(&args.config_file)?;

	telemetry::init(configuration.logging_level.as_deref(), configuration.logging_config_file.as_deref())?;

	server::run(configuration).await?;
	Ok(())
}

#[derive(Debug, Error)]
pub enum RunError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
	#[error("telemetry setup error: {0}")]
	Telemetry(#[from] telemetry::TelemetryError),
	#[error("server error: {0}")]
	Server(#[from] server::BootstrapError),
}

impl RunError {
	/// Exit-code mapping from spec.md §6: 1 configuration error, 2 I/O
	/// error on startup, 3 runtime fatal.
	pub fn exit_code(&self) -> i32 {
		match self {
			RunError::Config(_) => 1,
			RunError::Telemetry(_) => 2,
			RunError::Server(e) => e.exit_code(),
		}
	}
}
