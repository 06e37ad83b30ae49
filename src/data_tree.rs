//! The merged key -> value data tree assembled for a system.
//!
//! A `Value` is a small tagged union (scalar / sequence / mapping) rather
//! than a dedicated container type; compound-key lookup is a helper over
//! this representation.

use std::collections::BTreeMap;
use std::fmt;

/// A data tree value. Mappings use a `BTreeMap` so that two trees built
/// from the same key/value pairs compare equal regardless of insertion
/// order, matching the "independent of key order within a source" merge
/// invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Seq(Vec<Value>),
	Map(BTreeMap<String, Value>),
}

impl Value {
	pub fn empty_map() -> Self {
		Value::Map(BTreeMap::new())
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s.as_str()),
			_ => None,
		}
	}

	pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
		match self {
			Value::Map(m) => Some(m),
			_ => None,
		}
	}

	pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
		match self {
			Value::Map(m) => Some(m),
			_ => None,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	/// Render a scalar as a plain string for comparisons and transform input.
	/// Non-scalars have no defined textual form and yield `None`.
	pub fn as_scalar_string(&self) -> Option<String> {
		match self {
			Value::String(s) => Some(s.clone()),
			Value::Int(i) => Some(i.to_string()),
			Value::Float(f) => Some(f.to_string()),
			Value::Bool(b) => Some(b.to_string()),
			Value::Null => None,
			_ => None,
		}
	}

	/// Look up a compound key (`:`-separated path) in this tree. Returns
	/// `None` if any segment is absent -- the "absent" signal, which is
	/// never confused with a present `Value::Null`.
	pub fn lookup(&self, compound_key: &str) -> Option<&Value> {
		if compound_key.is_empty() {
			return Some(self);
		}
		let mut current = self;
		for segment in compound_key.split(':') {
			current = current.lookup_segment(segment)?;
		}
		Some(current)
	}

	fn lookup_segment(&self, segment: &str) -> Option<&Value> {
		match self {
			Value::Map(m) => m.get(segment),
			Value::Seq(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
			_ => None,
		}
	}

	/// Set a value at a compound-key path, creating intermediate maps as
	/// needed. Used by sources that project captures/rows into a nested
	/// tree (text_file variables, sqlite key_prefix projection).
	pub fn set_path(&mut self, compound_key: &str, value: Value) {
		let segments: Vec<&str> = compound_key.split(':').collect();
		self.set_path_segments(&segments, value);
	}

	fn set_path_segments(&mut self, segments: &[&str], value: Value) {
		if segments.is_empty() {
			*self = value;
			return;
		}
		if !matches!(self, Value::Map(_)) {
			*self = Value::empty_map();
		}
		let map = self.as_map_mut().expect("just coerced to map");
		if segments.len() == 1 {
			map.insert(segments[0].to_string(), value);
			return;
		}
		let entry = map
			.entry(segments[0].to_string())
			.or_insert_with(Value::empty_map);
		entry.set_path_segments(&segments[1..], value);
	}

	/// Recursively merge `other` into `self` per the declared merge
	/// semantics: mappings merge recursively, sequences are replaced
	/// unless `merge_lists` is set (append), scalars are last-wins.
	pub fn merge(&mut self, other: &Value, merge_lists: bool) {
		match (self, other) {
			(Value::Map(a), Value::Map(b)) => {
				for (k, v) in b {
					match a.get_mut(k) {
						Some(existing) => existing.merge(v, merge_lists),
						None => {
							a.insert(k.clone(), v.clone());
						}
					}
				}
			}
			(a @ Value::Seq(_), Value::Seq(b)) if merge_lists => {
				if let Value::Seq(existing) = a {
					existing.extend(b.iter().cloned());
				}
			}
			(a, b) => {
				*a = b.clone();
			}
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Value::Null => write!(f, "null"),
			Value::Bool(b) => write!(f, "{}", b),
			Value::Int(i) => write!(f, "{}", i),
			Value::Float(x) => write!(f, "{}", x),
			Value::String(s) => write!(f, "{}", s),
			Value::Seq(_) => write!(f, "<sequence>"),
			Value::Map(_) => write!(f, "<mapping>"),
		}
	}
}

impl From<serde_yaml::Value> for Value {
	fn from(v: serde_yaml::Value) -> Self {
		match v {
			serde_yaml::Value::Null => Value::Null,
			serde_yaml::Value::Bool(b) => Value::Bool(b),
			serde_yaml::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					Value::Int(i)
				} else if let Some(f) = n.as_f64() {
					Value::Float(f)
				} else {
					Value::Null
				}
			}
			serde_yaml::Value::String(s) => Value::String(s),
			serde_yaml::Value::Sequence(items) => {
				Value::Seq(items.into_iter().map(Value::from).collect())
			}
			serde_yaml::Value::Mapping(map) => {
				let mut out = BTreeMap::new();
				for (k, v) in map {
					if let serde_yaml::Value::String(key) = k {
						out.insert(key, Value::from(v));
					}
				}
				Value::Map(out)
			}
			serde_yaml::Value::Tagged(t) => Value::from(t.value),
		}
	}
}

impl From<serde_json::Value> for Value {
	fn from(v: serde_json::Value) -> Self {
		match v {
			serde_json::Value::Null => Value::Null,
			serde_json::Value::Bool(b) => Value::Bool(b),
			serde_json::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					Value::Int(i)
				} else if let Some(f) = n.as_f64() {
					Value::Float(f)
				} else {
					Value::Null
				}
			}
			serde_json::Value::String(s) => Value::String(s),
			serde_json::Value::Array(items) => {
				Value::Seq(items.into_iter().map(Value::from).collect())
			}
			serde_json::Value::Object(map) => {
				let mut out = BTreeMap::new();
				for (k, v) in map {
					out.insert(k, Value::from(v));
				}
				Value::Map(out)
			}
		}
	}
}

impl From<Value> for serde_json::Value {
	fn from(v: Value) -> Self {
		match v {
			Value::Null => serde_json::Value::Null,
			Value::Bool(b) => serde_json::Value::Bool(b),
			Value::Int(i) => serde_json::Value::Number(i.into()),
			Value::Float(f) => serde_json::Number::from_f64(f)
				.map(serde_json::Value::Number)
				.unwrap_or(serde_json::Value::Null),
			Value::String(s) => serde_json::Value::String(s),
			Value::Seq(items) => {
				serde_json::Value::Array(items.into_iter().map(Into::into).collect())
			}
			Value::Map(map) => {
				let mut out = serde_json::Map::new();
				for (k, v) in map {
					out.insert(k, v.into());
				}
				serde_json::Value::Object(out)
			}
		}
	}
}

impl From<Value> for serde_yaml::Value {
	fn from(v: Value) -> Self {
		match v {
			Value::Null => serde_yaml::Value::Null,
			Value::Bool(b) => serde_yaml::Value::Bool(b),
			Value::Int(i) => serde_yaml::Value::Number(i.into()),
			Value::Float(f) => serde_yaml::Value::Number(f.into()),
			Value::String(s) => serde_yaml::Value::String(s),
			Value::Seq(items) => {
				serde_yaml::Value::Sequence(items.into_iter().map(Into::into).collect())
			}
			Value::Map(map) => {
				let mut out = serde_yaml::Mapping::new();
				for (k, v) in map {
					out.insert(serde_yaml::Value::String(k), v.into());
				}
				serde_yaml::Value::Mapping(out)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn map(pairs: &[(&str, Value)]) -> Value {
		let mut m = BTreeMap::new();
		for (k, v) in pairs {
			m.insert(k.to_string(), v.clone());
		}
		Value::Map(m)
	}

	#[test]
	fn compound_key_lookup() {
		let tree = map(&[(
			"net",
			map(&[("mac_addr", Value::String("02:00:00:00:00:01".into()))]),
		)]);
		assert_eq!(
			tree.lookup("net:mac_addr"),
			Some(&Value::String("02:00:00:00:00:01".into()))
		);
		assert_eq!(tree.lookup("net:missing"), None);
	}

	#[test]
	fn sequence_index_lookup() {
		let tree = map(&[(
			"items",
			Value::Seq(vec![Value::Int(1), Value::Int(2)]),
		)]);
		assert_eq!(tree.lookup("items:1"), Some(&Value::Int(2)));
		assert_eq!(tree.lookup("items:5"), None);
	}

	#[test]
	fn absent_differs_from_null() {
		let tree = map(&[("k", Value::Null)]);
		assert_eq!(tree.lookup("k"), Some(&Value::Null));
		assert_eq!(tree.lookup("missing"), None);
	}

	#[test]
	fn set_path_builds_intermediate_maps() {
		let mut tree = Value::empty_map();
		tree.set_path("net:mac_addr", Value::String("x".into()));
		assert_eq!(
			tree.lookup("net:mac_addr"),
			Some(&Value::String("x".into()))
		);
	}

	#[test]
	fn merge_precedence_last_wins() {
		let mut a = map(&[("net", map(&[("hostname", Value::String("myhost".into()))]))]);
		let b = map(&[("net", map(&[("hostname", Value::String("override".into()))]))]);
		a.merge(&b, false);
		assert_eq!(
			a.lookup("net:hostname"),
			Some(&Value::String("override".into()))
		);
	}

	#[test]
	fn merge_sequences_replace_by_default() {
		let mut a = map(&[("xs", Value::Seq(vec![Value::Int(1)]))]);
		let b = map(&[("xs", Value::Seq(vec![Value::Int(2)]))]);
		a.merge(&b, false);
		assert_eq!(a.lookup("xs"), Some(&Value::Seq(vec![Value::Int(2)])));
	}

	#[test]
	fn merge_sequences_append_when_configured() {
		let mut a = map(&[("xs", Value::Seq(vec![Value::Int(1)]))]);
		let b = map(&[("xs", Value::Seq(vec![Value::Int(2)]))]);
		a.merge(&b, true);
		assert_eq!(
			a.lookup("xs"),
			Some(&Value::Seq(vec![Value::Int(1), Value::Int(2)]))
		);
	}
}
