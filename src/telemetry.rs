//! Tracing subscriber setup: a compact human-readable format by default,
//! with `RUST_LOG` and the configured `logging_level` both able to set
//! the active filter, and `logging_config_file` able to supply one as a
//! JSON document of env-filter directives.

use std::path::Path;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
	#[error("failed to read logging config file {path}: {message}")]
	Io { path: String, message: String },
	#[error("failed to parse logging config file {path}: {message}")]
	Parse { path: String, message: String },
	#[error("invalid logging level {level:?}: {message}")]
	InvalidLevel { level: String, message: String },
}

/// A minimal on-disk logging config shape: a single `directives` string
/// parsed the same way `RUST_LOG` is (e.g. `"vinegar=debug,warn"`).
#[derive(Debug, serde::Deserialize)]
struct LoggingConfigFile {
	directives: String,
}

pub fn init(logging_level: Option<&str>, logging_config_file: Option<&Path>) -> Result<(), TelemetryError> {
	let filter = if let Some(path) = logging_config_file {
		let contents = std::fs::read_to_string(path).map_err(|e| TelemetryError::Io {
			path: path.display().to_string(),
			message: e.to_string(),
		})?;
		let parsed: LoggingConfigFile = serde_json::from_str(&contents).map_err(|e| TelemetryError::Parse {
			path: path.display().to_string(),
			message: e.to_string(),
		})?;
		EnvFilter::try_new(&parsed.directives).map_err(|e| TelemetryError::InvalidLevel {
			level: parsed.directives,
			message: e.to_string(),
		})?
	} else if let Ok(from_env) = EnvFilter::try_from_default_env() {
		from_env
	} else if let Some(level) = logging_level {
		EnvFilter::try_new(level).map_err(|e| TelemetryError::InvalidLevel {
			level: level.to_string(),
			message: e.to_string(),
		})?
	} else {
		EnvFilter::try_new("info").expect("the literal \"info\" is always a valid env-filter directive")
	};

	tracing_subscriber::fmt().with_env_filter(filter).compact().init();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn invalid_level_is_reported_not_panicked() {
		// EnvFilter rejects an unrecognized level name outright.
		let err = EnvFilter::try_new("not_a_real_level!!!").unwrap_err();
		let _ = err;
	}
}
