//! Command-line interface: a single `server` subcommand, kept as thin as
//! the teacher's `clap` `Parser`/`Subcommand` derive pattern.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vinegar")]
#[command(about = "PXE/network-boot server rendering per-system installation artifacts", long_about = None)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Start the HTTP and TFTP servers
	Server(ServerArgs),
}

#[derive(Parser, Debug)]
pub struct ServerArgs {
	/// Path to the YAML configuration file
	#[arg(long, value_name = "PATH")]
	pub config_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_server_with_config_file() {
		let cli = Cli::parse_from(["vinegar", "server", "--config-file", "/etc/vinegar/vinegar.yaml"]);
		match cli.command {
			Commands::Server(args) => assert_eq!(args.config_file, Some(PathBuf::from("/etc/vinegar/vinegar.yaml"))),
		}
	}

	#[test]
	fn parses_server_without_config_file() {
		let cli = Cli::parse_from(["vinegar", "server"]);
		match cli.command {
			Commands::Server(args) => assert_eq!(args.config_file, None),
		}
	}
}
