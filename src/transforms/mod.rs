//! Process-wide transform registry: a mapping from dotted name to pure
//! function. Populated once at startup and read-only thereafter -- the
//! only process-wide mutable state permitted besides the handler pipeline.

pub(crate) mod ip_address;
mod mac_address;
mod string_fns;

use crate::data_tree::Value;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
	#[error("transform '{0}' expected a scalar input")]
	NonScalarInput(String),
	#[error("transform '{name}' argument error: {message}")]
	BadArgument { name: String, message: String },
	#[error("transform '{name}' failed on input {input:?}: {message}")]
	ValueError {
		name: String,
		input: String,
		message: String,
	},
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("unknown transform function: {0}")]
	UnknownFunction(String),
	#[error("invalid transform chain entry: {0}")]
	InvalidChainEntry(String),
}

type TransformFn = fn(Value, &[Value]) -> Result<Value, TransformError>;

static REGISTRY: Lazy<HashMap<&'static str, TransformFn>> = Lazy::new(|| {
	let mut m: HashMap<&'static str, TransformFn> = HashMap::new();
	m.insert("string.to_lower", string_fns::to_lower);
	m.insert("string.to_upper", string_fns::to_upper);
	m.insert("string.add_prefix", string_fns::add_prefix);
	m.insert("string.add_suffix", string_fns::add_suffix);
	m.insert("string.remove_prefix", string_fns::remove_prefix);
	m.insert("string.remove_suffix", string_fns::remove_suffix);
	m.insert("string.split", string_fns::split);
	m.insert("mac_address.normalize", mac_address::normalize);
	m.insert("ipv4_address.normalize", ip_address::ipv4_normalize);
	m.insert("ip_address.normalize", ip_address::normalize);
	m.insert("ip_address.network", ip_address::network);
	m.insert("ip_address.host", ip_address::host);
	m
});

/// One step of a transform chain: a function name plus optional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformStep {
	pub name: String,
	pub args: Vec<Value>,
}

/// A chain of transform steps, applied left to right.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformChain(pub Vec<TransformStep>);

impl TransformChain {
	/// Parse a transform chain from its YAML representation: a sequence
	/// whose elements are either a bare function name (string) or a
	/// single-entry mapping `name: args`.
	pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, ConfigError> {
		let seq = match value {
			serde_yaml::Value::Sequence(s) => s.clone(),
			serde_yaml::Value::Null => return Ok(TransformChain(Vec::new())),
			other => vec![other.clone()],
		};
		let mut steps = Vec::with_capacity(seq.len());
		for entry in seq {
			steps.push(Self::parse_step(&entry)?);
		}
		Self::validate(&steps)?;
		Ok(TransformChain(steps))
	}

	fn parse_step(entry: &serde_yaml::Value) -> Result<TransformStep, ConfigError> {
		match entry {
			serde_yaml::Value::String(name) => Ok(TransformStep {
				name: name.clone(),
				args: Vec::new(),
			}),
			serde_yaml::Value::Mapping(map) if map.len() == 1 => {
				let (k, v) = map.iter().next().unwrap();
				let name = k
					.as_str()
					.ok_or_else(|| ConfigError::InvalidChainEntry(format!("{:?}", entry)))?
					.to_string();
				let args = match v {
					serde_yaml::Value::Sequence(s) => {
						s.iter().map(|x| Value::from(x.clone())).collect()
					}
					serde_yaml::Value::Null => Vec::new(),
					other => vec![Value::from(other.clone())],
				};
				Ok(TransformStep { name, args })
			}
			other => Err(ConfigError::InvalidChainEntry(format!("{:?}", other))),
		}
	}

	fn validate(steps: &[TransformStep]) -> Result<(), ConfigError> {
		for step in steps {
			if !REGISTRY.contains_key(step.name.as_str()) {
				return Err(ConfigError::UnknownFunction(step.name.clone()));
			}
		}
		Ok(())
	}

	/// Apply the chain to an input value, replacing it at each step.
	pub fn apply(&self, mut value: Value) -> Result<Value, TransformError> {
		for step in &self.0 {
			value = apply_one(&step.name, value, &step.args)?;
		}
		Ok(value)
	}
}

/// Apply a single named transform, as used by the `transform['name'](...)`
/// template accessor.
pub fn apply_one(name: &str, value: Value, args: &[Value]) -> Result<Value, TransformError> {
	let f = REGISTRY
		.get(name)
		.ok_or_else(|| TransformError::BadArgument {
			name: name.to_string(),
			message: "not registered (should have failed config validation)".to_string(),
		})?;
	f(value, args)
}

pub fn is_registered(name: &str) -> bool {
	REGISTRY.contains_key(name)
}
