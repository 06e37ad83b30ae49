use super::TransformError;
use crate::data_tree::Value;

fn scalar(name: &str, value: Value) -> Result<String, TransformError> {
	value
		.as_scalar_string()
		.ok_or_else(|| TransformError::NonScalarInput(name.to_string()))
}

fn string_arg(name: &str, args: &[Value], index: usize) -> Result<String, TransformError> {
	args.get(index)
		.and_then(|v| v.as_scalar_string())
		.ok_or_else(|| TransformError::BadArgument {
			name: name.to_string(),
			message: format!("expected a string argument at position {}", index),
		})
}

pub fn to_lower(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	Ok(Value::String(scalar("string.to_lower", value)?.to_lowercase()))
}

pub fn to_upper(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	Ok(Value::String(scalar("string.to_upper", value)?.to_uppercase()))
}

pub fn add_prefix(value: Value, args: &[Value]) -> Result<Value, TransformError> {
	let s = scalar("string.add_prefix", value)?;
	let prefix = string_arg("string.add_prefix", args, 0)?;
	Ok(Value::String(format!("{}{}", prefix, s)))
}

pub fn add_suffix(value: Value, args: &[Value]) -> Result<Value, TransformError> {
	let s = scalar("string.add_suffix", value)?;
	let suffix = string_arg("string.add_suffix", args, 0)?;
	Ok(Value::String(format!("{}{}", s, suffix)))
}

pub fn remove_prefix(value: Value, args: &[Value]) -> Result<Value, TransformError> {
	let s = scalar("string.remove_prefix", value)?;
	let prefix = string_arg("string.remove_prefix", args, 0)?;
	Ok(Value::String(
		s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string(),
	))
}

pub fn remove_suffix(value: Value, args: &[Value]) -> Result<Value, TransformError> {
	let s = scalar("string.remove_suffix", value)?;
	let suffix = string_arg("string.remove_suffix", args, 0)?;
	Ok(Value::String(
		s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string(),
	))
}

/// `string.split(sep, maxsplit=-1)`. A negative or absent `maxsplit`
/// means unbounded, matching the Python-inspired default in the spec.
pub fn split(value: Value, args: &[Value]) -> Result<Value, TransformError> {
	let s = scalar("string.split", value)?;
	let sep = string_arg("string.split", args, 0)?;
	let maxsplit = match args.get(1) {
		Some(Value::Int(i)) => *i,
		Some(Value::String(s)) => s.parse::<i64>().unwrap_or(-1),
		_ => -1,
	};
	let parts: Vec<Value> = if maxsplit < 0 {
		s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect()
	} else {
		s.splitn((maxsplit as usize) + 1, sep.as_str())
			.map(|p| Value::String(p.to_string()))
			.collect()
	};
	Ok(Value::Seq(parts))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_respects_maxsplit() {
		let out = split(
			Value::String("a:b:c".into()),
			&[Value::String(":".into()), Value::Int(1)],
		)
		.unwrap();
		assert_eq!(
			out,
			Value::Seq(vec![Value::String("a".into()), Value::String("b:c".into())])
		);
	}

	#[test]
	fn add_suffix_then_prefix() {
		let out = add_suffix(
			Value::String("myhost".into()),
			&[Value::String(".example.com".into())],
		)
		.unwrap();
		assert_eq!(out, Value::String("myhost.example.com".into()));
	}
}
