//! Persistent per-system key -> JSON-value store backed by SQLite.
//!
//! Schema: `system_data(system_id TEXT NOT NULL, key TEXT NOT NULL,
//! value TEXT, type TEXT NOT NULL, PRIMARY KEY(system_id,key))`. The
//! database is the single point of serialization for mutable state: it is
//! opened in WAL mode with a generous `busy_timeout`, and every write goes
//! through one connection behind a mutex.

use crate::data_tree::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("sqlite error: {0}")]
	Sqlite(#[from] rusqlite::Error),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("unsupported value type in store: {0}")]
	UnsupportedType(String),
}

const SCHEMA_VERSION: i32 = 1;

#[derive(Clone)]
pub struct SqliteStore {
	conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		let conn = Connection::open(path)?;
		conn.pragma_update(None, "journal_mode", "WAL")?;
		conn.busy_timeout(std::time::Duration::from_secs(5))?;
		conn.execute(
			"CREATE TABLE IF NOT EXISTS system_data (
				system_id TEXT NOT NULL,
				key TEXT NOT NULL,
				value TEXT,
				type TEXT NOT NULL,
				PRIMARY KEY (system_id, key)
			)",
			[],
		)?;
		let user_version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
		if user_version == 0 {
			conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
		}
		Ok(Self {
			conn: Arc::new(Mutex::new(conn)),
		})
	}

	pub fn open_in_memory() -> Result<Self, StoreError> {
		let conn = Connection::open_in_memory()?;
		conn.execute(
			"CREATE TABLE IF NOT EXISTS system_data (
				system_id TEXT NOT NULL,
				key TEXT NOT NULL,
				value TEXT,
				type TEXT NOT NULL,
				PRIMARY KEY (system_id, key)
			)",
			[],
		)?;
		Ok(Self {
			conn: Arc::new(Mutex::new(conn)),
		})
	}

	pub fn get(&self, system_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
		let conn = self.conn.lock().expect("store lock poisoned");
		let row: Option<(String, String)> = conn
			.query_row(
				"SELECT value, type FROM system_data WHERE system_id = ?1 AND key = ?2",
				params![system_id, key],
				|r| Ok((r.get(0)?, r.get(1)?)),
			)
			.optional()?;
		row.map(|(value, ty)| decode(&value, &ty)).transpose()
	}

	pub fn set(&self, system_id: &str, key: &str, value: &Value) -> Result<(), StoreError> {
		let (encoded, ty) = encode(value)?;
		let conn = self.conn.lock().expect("store lock poisoned");
		conn.execute("BEGIN IMMEDIATE", [])?;
		let result = conn.execute(
			"INSERT INTO system_data (system_id, key, value, type) VALUES (?1, ?2, ?3, ?4)
			 ON CONFLICT(system_id, key) DO UPDATE SET value = excluded.value, type = excluded.type",
			params![system_id, key, encoded, ty],
		);
		match result {
			Ok(_) => {
				conn.execute("COMMIT", [])?;
				Ok(())
			}
			Err(e) => {
				let _ = conn.execute("ROLLBACK", []);
				Err(e.into())
			}
		}
	}

	pub fn delete(&self, system_id: &str, key: &str) -> Result<(), StoreError> {
		let conn = self.conn.lock().expect("store lock poisoned");
		conn.execute(
			"DELETE FROM system_data WHERE system_id = ?1 AND key = ?2",
			params![system_id, key],
		)?;
		Ok(())
	}

	pub fn iter_system(&self, system_id: &str) -> Result<Vec<(String, Value)>, StoreError> {
		let conn = self.conn.lock().expect("store lock poisoned");
		let mut stmt = conn.prepare("SELECT key, value, type FROM system_data WHERE system_id = ?1")?;
		let rows = stmt.query_map(params![system_id], |r| {
			let key: String = r.get(0)?;
			let value: String = r.get(1)?;
			let ty: String = r.get(2)?;
			Ok((key, value, ty))
		})?;
		let mut out = Vec::new();
		for row in rows {
			let (key, value, ty) = row?;
			out.push((key, decode(&value, &ty)?));
		}
		Ok(out)
	}

	/// Reverse lookup by exact value match, used by the sqlite data
	/// source when `find_system_enabled` is set.
	pub fn find_by_value(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
		let conn = self.conn.lock().expect("store lock poisoned");
		let result: Option<String> = conn
			.query_row(
				"SELECT system_id FROM system_data WHERE key = ?1 AND value = ?2 LIMIT 1",
				params![key, value],
				|r| r.get(0),
			)
			.optional()?;
		Ok(result)
	}
}

fn encode(value: &Value) -> Result<(String, &'static str), StoreError> {
	Ok(match value {
		Value::Bool(b) => (b.to_string(), "bool"),
		Value::Int(i) => (i.to_string(), "int"),
		Value::Float(f) => (f.to_string(), "float"),
		Value::String(s) => (s.clone(), "string"),
		Value::Null => (String::new(), "json"),
		Value::Seq(_) | Value::Map(_) => {
			let json: serde_json::Value = value.clone().into();
			(serde_json::to_string(&json)?, "json")
		}
	})
}

fn decode(raw: &str, ty: &str) -> Result<Value, StoreError> {
	Ok(match ty {
		"bool" => Value::Bool(raw == "true"),
		"int" => Value::Int(raw.parse().unwrap_or(0)),
		"float" => Value::Float(raw.parse().unwrap_or(0.0)),
		"string" => Value::String(raw.to_string()),
		"json" => {
			if raw.is_empty() {
				Value::Null
			} else {
				let json: serde_json::Value = serde_json::from_str(raw)?;
				Value::from(json)
			}
		}
		other => return Err(StoreError::UnsupportedType(other.to_string())),
	})
}
