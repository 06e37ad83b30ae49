use super::TransformError;
use crate::data_tree::Value;

const NAME: &str = "mac_address.normalize";

/// Accepts colon, hyphen, dot-grouped (Cisco-style `aabb.ccdd.eeff`) or
/// bare hex MAC representations and returns the canonical lowercase
/// colon-separated form. Fails for anything that does not decode to
/// exactly 48 bits.
pub fn normalize(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	let s = value
		.as_scalar_string()
		.ok_or_else(|| TransformError::NonScalarInput(NAME.to_string()))?;

	let hex: String = s.chars().filter(|c| *c != ':' && *c != '-' && *c != '.').collect();

	if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
		return Err(TransformError::ValueError {
			name: NAME.to_string(),
			input: s.clone(),
			message: "not a 48-bit MAC address".to_string(),
		});
	}

	let lower = hex.to_lowercase();
	let octets: Vec<&str> = (0..12).step_by(2).map(|i| &lower[i..i + 2]).collect();
	Ok(Value::String(octets.join(":")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_colon_form() {
		let out = normalize(Value::String("02:aB:Cd:EF:01:02".into()), &[]).unwrap();
		assert_eq!(out, Value::String("02:ab:cd:ef:01:02".into()));
	}

	#[test]
	fn accepts_hyphen_form() {
		let out = normalize(Value::String("02-ab-cd-ef-01-02".into()), &[]).unwrap();
		assert_eq!(out, Value::String("02:ab:cd:ef:01:02".into()));
	}

	#[test]
	fn accepts_cisco_dotted_form() {
		let out = normalize(Value::String("02aB.CdEF.0102".into()), &[]).unwrap();
		assert_eq!(out, Value::String("02:ab:cd:ef:01:02".into()));
	}

	#[test]
	fn rejects_wrong_length() {
		assert!(normalize(Value::String("02:ab:cd".into()), &[]).is_err());
	}

	#[test]
	fn idempotent() {
		let once = normalize(Value::String("02-ab-cd-ef-01-02".into()), &[]).unwrap();
		let twice = normalize(once.clone(), &[]).unwrap();
		assert_eq!(once, twice);
	}
}
