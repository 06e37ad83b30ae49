//! System matcher: a small boolean expression language evaluated against
//! a `(system_id, data)` pair, used by YAML-target `top` files and by
//! handler-side access-control lists.
//!
//! Grammar:
//! ```text
//! expr := term (('or'|'and') term)* | 'not' term | '(' expr ')'
//! term := glob | re <pattern> | id <literal> | '@' key <op> <literal> | <literal>
//! op   := '==' | '!=' | '~='
//! ```
//!
//! Case sensitivity is explicit per sub-expression via a `c:` modifier
//! prefix immediately before a term keyword (`c:glob`, `c:id`, `c:@key==`,
//! or a bare `c:` before a literal); terms are case-insensitive by default.

use crate::data_tree::Value;
use crate::transforms::ip_address::subnet_contains;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatcherError {
	#[error("unexpected end of expression")]
	UnexpectedEof,
	#[error("unexpected token: {0}")]
	UnexpectedToken(String),
	#[error("invalid regex pattern: {0}")]
	InvalidRegex(String),
	#[error("unclosed quoted literal")]
	UnclosedLiteral,
}

#[derive(Debug, Clone, PartialEq)]
enum CompareOp {
	Eq,
	Ne,
	RegexMatch,
}

#[derive(Debug, Clone)]
pub enum Expr {
	And(Box<Expr>, Box<Expr>),
	Or(Box<Expr>, Box<Expr>),
	Not(Box<Expr>),
	Glob { pattern: String, case_sensitive: bool },
	Regex { pattern: String, case_sensitive: bool },
	Id { literal: String, case_sensitive: bool },
	DataCompare {
		key: String,
		op: CompareOp,
		literal: String,
		case_sensitive: bool,
	},
}

/// Parse a matcher expression string into an evaluable `Expr`.
pub fn parse(source: &str) -> Result<Expr, MatcherError> {
	let tokens = tokenize(source)?;
	let mut parser = Parser { tokens, pos: 0 };
	let expr = parser.parse_expr()?;
	if parser.pos != parser.tokens.len() {
		return Err(MatcherError::UnexpectedToken(
			parser.tokens[parser.pos].clone(),
		));
	}
	Ok(expr)
}

/// Evaluate a parsed expression against a system id and its data tree.
pub fn eval(expr: &Expr, system_id: &str, data: &Value) -> bool {
	match expr {
		Expr::And(a, b) => eval(a, system_id, data) && eval(b, system_id, data),
		Expr::Or(a, b) => eval(a, system_id, data) || eval(b, system_id, data),
		Expr::Not(a) => !eval(a, system_id, data),
		Expr::Glob { pattern, case_sensitive } => glob_match(pattern, system_id, *case_sensitive),
		Expr::Regex { pattern, case_sensitive } => regex_match(pattern, system_id, *case_sensitive),
		Expr::Id { literal, case_sensitive } => {
			if *case_sensitive {
				literal == system_id
			} else {
				literal.eq_ignore_ascii_case(system_id)
			}
		}
		Expr::DataCompare {
			key,
			op,
			literal,
			case_sensitive,
		} => eval_data_compare(key, op, literal, *case_sensitive, data),
	}
}

fn eval_data_compare(key: &str, op: &CompareOp, literal: &str, case_sensitive: bool, data: &Value) -> bool {
	let actual = match data.lookup(key).and_then(|v| v.as_scalar_string()) {
		Some(s) => s,
		None => return matches!(op, CompareOp::Ne),
	};
	match op {
		CompareOp::RegexMatch => regex_match(literal, &actual, case_sensitive),
		CompareOp::Eq | CompareOp::Ne => {
			let equal = if literal.contains('/') && subnet_contains(literal, &actual) {
				true
			} else if case_sensitive {
				actual == literal
			} else {
				actual.eq_ignore_ascii_case(literal)
			};
			if matches!(op, CompareOp::Eq) {
				equal
			} else {
				!equal
			}
		}
	}
}

fn glob_match(pattern: &str, candidate: &str, case_sensitive: bool) -> bool {
	let glob_pattern = match glob::Pattern::new(pattern) {
		Ok(p) => p,
		Err(_) => return false,
	};
	let opts = glob::MatchOptions {
		case_sensitive,
		require_literal_separator: false,
		require_literal_leading_dot: false,
	};
	glob_pattern.matches_with(candidate, opts)
}

fn regex_match(pattern: &str, candidate: &str, case_sensitive: bool) -> bool {
	let pattern = if case_sensitive {
		pattern.to_string()
	} else {
		format!("(?i){}", pattern)
	};
	match Regex::new(&pattern) {
		Ok(re) => re.is_match(candidate),
		Err(_) => false,
	}
}

// ---- tokenizer ----

fn tokenize(source: &str) -> Result<Vec<String>, MatcherError> {
	let mut tokens = Vec::new();
	let chars: Vec<char> = source.chars().collect();
	let mut i = 0;
	while i < chars.len() {
		let c = chars[i];
		if c.is_whitespace() {
			i += 1;
			continue;
		}
		if c == '(' || c == ')' {
			tokens.push(c.to_string());
			i += 1;
			continue;
		}
		if c == '"' || c == '\'' {
			let quote = c;
			let mut j = i + 1;
			let mut lit = String::new();
			loop {
				if j >= chars.len() {
					return Err(MatcherError::UnclosedLiteral);
				}
				if chars[j] == quote {
					j += 1;
					break;
				}
				lit.push(chars[j]);
				j += 1;
			}
			tokens.push(format!("\"{}", lit));
			i = j;
			continue;
		}
		if c == '@' {
			// consume @key followed directly by an operator
			let mut j = i + 1;
			while j < chars.len() && !"=!~ \t()".contains(chars[j]) {
				j += 1;
			}
			tokens.push(format!("@{}", chars[i + 1..j].iter().collect::<String>()));
			i = j;
			continue;
		}
		if c == '=' || c == '!' || c == '~' {
			if i + 1 < chars.len() && chars[i + 1] == '=' {
				tokens.push(format!("{}{}", c, chars[i + 1]));
				i += 2;
				continue;
			}
		}
		// bare word: read until whitespace or paren
		let mut j = i;
		while j < chars.len() && !chars[j].is_whitespace() && chars[j] != '(' && chars[j] != ')' {
			j += 1;
		}
		tokens.push(chars[i..j].iter().collect());
		i = j;
	}
	Ok(tokens)
}

struct Parser {
	tokens: Vec<String>,
	pos: usize,
}

impl Parser {
	fn peek(&self) -> Option<&str> {
		self.tokens.get(self.pos).map(|s| s.as_str())
	}

	fn next(&mut self) -> Result<String, MatcherError> {
		let t = self
			.tokens
			.get(self.pos)
			.cloned()
			.ok_or(MatcherError::UnexpectedEof)?;
		self.pos += 1;
		Ok(t)
	}

	fn parse_expr(&mut self) -> Result<Expr, MatcherError> {
		let mut left = self.parse_unary()?;
		loop {
			match self.peek() {
				Some(t) if t.eq_ignore_ascii_case("and") => {
					self.pos += 1;
					let right = self.parse_unary()?;
					left = Expr::And(Box::new(left), Box::new(right));
				}
				Some(t) if t.eq_ignore_ascii_case("or") => {
					self.pos += 1;
					let right = self.parse_unary()?;
					left = Expr::Or(Box::new(left), Box::new(right));
				}
				_ => break,
			}
		}
		Ok(left)
	}

	fn parse_unary(&mut self) -> Result<Expr, MatcherError> {
		match self.peek() {
			Some(t) if t.eq_ignore_ascii_case("not") => {
				self.pos += 1;
				Ok(Expr::Not(Box::new(self.parse_unary()?)))
			}
			Some("(") => {
				self.pos += 1;
				let inner = self.parse_expr()?;
				match self.next()? {
					ref t if t == ")" => Ok(inner),
					t => Err(MatcherError::UnexpectedToken(t)),
				}
			}
			_ => self.parse_term(),
		}
	}

	fn parse_term(&mut self) -> Result<Expr, MatcherError> {
		let mut case_sensitive = false;
		let mut tok = self.next()?;
		if let Some(rest) = tok.strip_prefix("c:") {
			case_sensitive = true;
			tok = rest.to_string();
			if tok.is_empty() {
				tok = self.next()?;
			}
		}

		if tok.eq_ignore_ascii_case("glob") {
			let pattern = self.next_literal()?;
			return Ok(Expr::Glob { pattern, case_sensitive });
		}
		if tok.eq_ignore_ascii_case("re") {
			let pattern = self.next_literal()?;
			Regex::new(&pattern).map_err(|e| MatcherError::InvalidRegex(e.to_string()))?;
			return Ok(Expr::Regex { pattern, case_sensitive });
		}
		if tok.eq_ignore_ascii_case("id") {
			let literal = self.next_literal()?;
			return Ok(Expr::Id { literal, case_sensitive });
		}
		if let Some(key) = tok.strip_prefix('@') {
			let op_tok = self.next()?;
			let op = match op_tok.as_str() {
				"==" => CompareOp::Eq,
				"!=" => CompareOp::Ne,
				"~=" => CompareOp::RegexMatch,
				other => return Err(MatcherError::UnexpectedToken(other.to_string())),
			};
			let literal = self.next_literal()?;
			return Ok(Expr::DataCompare {
				key: key.to_string(),
				op,
				literal,
				case_sensitive,
			});
		}

		// bare literal: shell-glob against the system ID
		let pattern = Self::unquote(&tok);
		Ok(Expr::Glob { pattern, case_sensitive })
	}

	fn next_literal(&mut self) -> Result<String, MatcherError> {
		let t = self.next()?;
		Ok(Self::unquote(&t))
	}

	fn unquote(tok: &str) -> String {
		tok.strip_prefix('"').map(|s| s.to_string()).unwrap_or_else(|| tok.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	fn data_with(key: &str, value: &str) -> Value {
		let mut m = BTreeMap::new();
		let mut cur = Value::empty_map();
		cur.set_path(key, Value::String(value.to_string()));
		if let Value::Map(inner) = cur {
			m = inner;
		}
		Value::Map(m)
	}

	#[test]
	fn bare_literal_is_glob_against_id() {
		let e = parse("*.example.com").unwrap();
		assert!(eval(&e, "host.example.com", &Value::empty_map()));
		assert!(!eval(&e, "host.example.org", &Value::empty_map()));
	}

	#[test]
	fn and_or_not_precedence() {
		let e = parse("id \"a\" or id \"b\" and not id \"c\"").unwrap();
		assert!(eval(&e, "a", &Value::empty_map()));
		assert!(eval(&e, "b", &Value::empty_map()));
	}

	#[test]
	fn data_compare_subnet() {
		let e = parse("@net:ipv4_addr == \"192.0.2.0/24\"").unwrap();
		let data = data_with("net:ipv4_addr", "192.0.2.55");
		assert!(eval(&e, "anything", &data));
	}

	#[test]
	fn data_compare_absent_not_equal() {
		let e = parse("@missing:key != \"x\"").unwrap();
		assert!(eval(&e, "id", &Value::empty_map()));
	}

	#[test]
	fn grouping_and_negation() {
		let e = parse("not (id \"a\" or id \"b\")").unwrap();
		assert!(!eval(&e, "a", &Value::empty_map()));
		assert!(eval(&e, "z", &Value::empty_map()));
	}

	#[test]
	fn case_sensitive_modifier() {
		let e = parse("c:id \"Host1\"").unwrap();
		assert!(eval(&e, "Host1", &Value::empty_map()));
		assert!(!eval(&e, "host1", &Value::empty_map()));
	}
}
