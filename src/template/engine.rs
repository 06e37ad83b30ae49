//! Bundled template engine: variable expansion, block control flow,
//! inheritance/inclusion, YAML/JSON filters, and a `transform` accessor
//! over the transform registry. This is the one engine Vinegar ships;
//! it is reached only through the `Engine` trait.

use super::{Engine, TemplateContext, TemplateError};
use crate::data_tree::Value;
use crate::transforms;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub struct DefaultEngine {
	provided_helpers: Vec<String>,
}

impl DefaultEngine {
	pub fn new() -> Self {
		Self {
			provided_helpers: Vec::new(),
		}
	}

	/// Configure the engine with an allow-list of helper functions exposed
	/// inside template context, the language-agnostic analogue of the
	/// original `provide_python_modules`-style option.
	pub fn with_helpers(mut self, helpers: Vec<String>) -> Self {
		self.provided_helpers = helpers;
		self
	}
}

impl Default for DefaultEngine {
	fn default() -> Self {
		Self::new()
	}
}

impl Engine for DefaultEngine {
	fn render(&self, template_path: &Path, context: &TemplateContext) -> Result<Vec<u8>, TemplateError> {
		let mut include_stack = HashSet::new();
		let base_scope = Scope::from_context(context);
		let output = render_file(template_path, &base_scope, &mut include_stack, &self.provided_helpers)?;
		Ok(output.into_bytes())
	}

	fn resolve_dependencies(&self, template_path: &Path) -> Result<HashSet<PathBuf>, TemplateError> {
		let source = read_template(template_path)?;
		let nodes = parse(&source, template_path)?;
		let mut deps = HashSet::new();
		collect_static_deps(&nodes, template_path.parent().unwrap_or(Path::new(".")), &mut deps);
		Ok(deps)
	}
}

fn collect_static_deps(nodes: &[Node], dir: &Path, deps: &mut HashSet<PathBuf>) {
	for node in nodes {
		match node {
			Node::Include(Expr::Literal(Value::String(name))) | Node::Extends(Expr::Literal(Value::String(name))) => {
				deps.insert(dir.join(name));
			}
			Node::If { branches, else_branch } => {
				for (_, body) in branches {
					collect_static_deps(body, dir, deps);
				}
				if let Some(body) = else_branch {
					collect_static_deps(body, dir, deps);
				}
			}
			Node::For { body, .. } | Node::With { body, .. } | Node::Block { body, .. } => {
				collect_static_deps(body, dir, deps);
			}
			_ => {}
		}
	}
}

fn read_template(path: &Path) -> Result<String, TemplateError> {
	std::fs::read_to_string(path).map_err(|e| {
		if e.kind() == std::io::ErrorKind::NotFound {
			TemplateError::NotFound(path.to_path_buf())
		} else {
			TemplateError::Io {
				path: path.to_path_buf(),
				message: e.to_string(),
			}
		}
	})
}

fn render_file(
	path: &Path,
	scope: &Scope,
	include_stack: &mut HashSet<PathBuf>,
	helpers: &[String],
) -> Result<String, TemplateError> {
	let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
	if !include_stack.insert(canonical.clone()) {
		return Err(TemplateError::IncludeCycle(path.to_path_buf()));
	}

	let source = read_template(path)?;
	let nodes = parse(&source, path)?;
	let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

	let result = if let Some(base_name) = extends_target(&nodes) {
		let blocks = collect_blocks(&nodes);
		let base_path = dir.join(&base_name);
		render_with_overrides(&base_path, scope, include_stack, helpers, &blocks)
	} else {
		let mut out = String::new();
		let mut ctl = FlowControl::None;
		exec_nodes(&nodes, scope, &dir, include_stack, helpers, &mut out, &mut ctl)?;
		Ok(out)
	};

	include_stack.remove(&canonical);
	result
}

fn render_with_overrides(
	base_path: &Path,
	scope: &Scope,
	include_stack: &mut HashSet<PathBuf>,
	helpers: &[String],
	overrides: &HashMap<String, Vec<Node>>,
) -> Result<String, TemplateError> {
	let canonical = std::fs::canonicalize(base_path).unwrap_or_else(|_| base_path.to_path_buf());
	if !include_stack.insert(canonical.clone()) {
		return Err(TemplateError::IncludeCycle(base_path.to_path_buf()));
	}
	let source = read_template(base_path)?;
	let nodes = parse(&source, base_path)?;
	let dir = base_path.parent().unwrap_or(Path::new(".")).to_path_buf();
	let mut out = String::new();
	let mut ctl = FlowControl::None;
	exec_nodes_with_overrides(&nodes, scope, &dir, include_stack, helpers, overrides, &mut out, &mut ctl)?;
	include_stack.remove(&canonical);
	Ok(out)
}

fn extends_target(nodes: &[Node]) -> Option<String> {
	for node in nodes {
		if let Node::Extends(Expr::Literal(Value::String(name))) = node {
			return Some(name.clone());
		}
	}
	None
}

fn collect_blocks(nodes: &[Node]) -> HashMap<String, Vec<Node>> {
	let mut out = HashMap::new();
	for node in nodes {
		if let Node::Block { name, body } = node {
			out.insert(name.clone(), body.clone());
		}
	}
	out
}

// ---------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
	Text(String),
	Expr(Expr, usize),
	If {
		branches: Vec<(Expr, Vec<Node>)>,
		else_branch: Option<Vec<Node>>,
	},
	For {
		var: String,
		iterable: Expr,
		body: Vec<Node>,
	},
	With {
		var: String,
		value: Expr,
		body: Vec<Node>,
	},
	Do(Expr, usize),
	Break,
	Continue,
	Include(Expr),
	Extends(Expr),
	Block {
		name: String,
		body: Vec<Node>,
	},
}

#[derive(Debug, Clone)]
enum Expr {
	Literal(Value),
	Path(Vec<String>),
	Index(Box<Expr>, Box<Expr>),
	Call(String, Vec<Expr>),
	TransformCall(Box<Expr>, Vec<Expr>),
	Filter(Box<Expr>, String, Vec<Expr>),
	BinOp(BinOp, Box<Expr>, Box<Expr>),
	Not(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	And,
	Or,
}

// ---------------------------------------------------------------------
// Tokenizing / parsing the surrounding template text into nodes
// ---------------------------------------------------------------------

enum Chunk<'a> {
	Text(&'a str),
	Expr(&'a str, usize),
	Tag(&'a str, usize),
}

fn chunks(source: &str) -> Vec<Chunk<'_>> {
	let mut out = Vec::new();
	let mut rest = source;
	let mut line = 1usize;
	loop {
		let next_expr = rest.find("{{");
		let next_tag = rest.find("{%");
		let next = match (next_expr, next_tag) {
			(Some(e), Some(t)) => Some(e.min(t)),
			(Some(e), None) => Some(e),
			(None, Some(t)) => Some(t),
			(None, None) => None,
		};
		let Some(idx) = next else {
			if !rest.is_empty() {
				out.push(Chunk::Text(rest));
			}
			break;
		};
		if idx > 0 {
			out.push(Chunk::Text(&rest[..idx]));
			line += rest[..idx].matches('\n').count();
		}
		let is_expr = rest[idx..].starts_with("{{");
		let close = if is_expr { "}}" } else { "%}" };
		let after_open = &rest[idx + 2..];
		let Some(close_idx) = after_open.find(close) else {
			out.push(Chunk::Text(&rest[idx..]));
			break;
		};
		let body = &after_open[..close_idx];
		if is_expr {
			out.push(Chunk::Expr(body.trim(), line));
		} else {
			out.push(Chunk::Tag(body.trim(), line));
		}
		line += body.matches('\n').count();
		rest = &after_open[close_idx + 2..];
	}
	out
}

fn parse(source: &str, path: &Path) -> Result<Vec<Node>, TemplateError> {
	let chunks = chunks(source);
	let mut pos = 0usize;
	let (nodes, _) = parse_block(&chunks, &mut pos, &[], path)?;
	Ok(nodes)
}

/// Parse nodes until one of `terminators` tag keywords is seen (not
/// consumed beyond recognizing it); returns the parsed nodes and which
/// terminator ended the block (empty string if end of input).
fn parse_block(
	chunks: &[Chunk],
	pos: &mut usize,
	terminators: &[&str],
	path: &Path,
) -> Result<(Vec<Node>, String), TemplateError> {
	let mut nodes = Vec::new();
	while *pos < chunks.len() {
		match &chunks[*pos] {
			Chunk::Text(t) => {
				nodes.push(Node::Text(t.to_string()));
				*pos += 1;
			}
			Chunk::Expr(body, line) => {
				let expr = parse_expr(body).map_err(|m| render_err(path, *line, m))?;
				nodes.push(Node::Expr(expr, *line));
				*pos += 1;
			}
			Chunk::Tag(body, line) => {
				let keyword = body.split_whitespace().next().unwrap_or("");
				if terminators.contains(&keyword) {
					return Ok((nodes, keyword.to_string()));
				}
				*pos += 1;
				match keyword {
					"if" => {
						let cond_src = body["if".len()..].trim();
						let cond = parse_expr(cond_src).map_err(|m| render_err(path, *line, m))?;
						let mut branches = vec![(cond, Vec::new())];
						let mut else_branch = None;
						loop {
							let (body_nodes, term) = parse_block(chunks, pos, &["elif", "else", "endif"], path)?;
							branches.last_mut().unwrap().1 = body_nodes;
							match term.as_str() {
								"elif" => {
									let (next_body, next_line) = match &chunks[*pos] {
										Chunk::Tag(b, l) => (b.clone(), *l),
										_ => unreachable!(),
									};
									*pos += 1;
									let cond_src = next_body["elif".len()..].trim();
									let cond = parse_expr(cond_src).map_err(|m| render_err(path, next_line, m))?;
									branches.push((cond, Vec::new()));
								}
								"else" => {
									*pos += 1;
									let (else_nodes, _term) = parse_block(chunks, pos, &["endif"], path)?;
									else_branch = Some(else_nodes);
									*pos += 1;
									break;
								}
								"endif" => {
									*pos += 1;
									break;
								}
								_ => break,
							}
						}
						nodes.push(Node::If { branches, else_branch });
					}
					"for" => {
						let rest = body["for".len()..].trim();
						let (var, iter_src) = rest
							.split_once(" in ")
							.ok_or_else(|| render_err(path, *line, "malformed for: expected 'for x in expr'".into()))?;
						let iterable = parse_expr(iter_src.trim()).map_err(|m| render_err(path, *line, m))?;
						let (body_nodes, _term) = parse_block(chunks, pos, &["endfor"], path)?;
						*pos += 1;
						nodes.push(Node::For {
							var: var.trim().to_string(),
							iterable,
							body: body_nodes,
						});
					}
					"with" => {
						let rest = body["with".len()..].trim();
						let (var, val_src) = rest
							.split_once('=')
							.ok_or_else(|| render_err(path, *line, "malformed with: expected 'with x = expr'".into()))?;
						let value = parse_expr(val_src.trim()).map_err(|m| render_err(path, *line, m))?;
						let (body_nodes, _term) = parse_block(chunks, pos, &["endwith"], path)?;
						*pos += 1;
						nodes.push(Node::With {
							var: var.trim().to_string(),
							value,
							body: body_nodes,
						});
					}
					"do" => {
						let expr_src = body["do".len()..].trim();
						let expr = parse_expr(expr_src).map_err(|m| render_err(path, *line, m))?;
						nodes.push(Node::Do(expr, *line));
					}
					"break" => nodes.push(Node::Break),
					"continue" => nodes.push(Node::Continue),
					"include" => {
						let expr_src = body["include".len()..].trim();
						let expr = parse_expr(expr_src).map_err(|m| render_err(path, *line, m))?;
						nodes.push(Node::Include(expr));
					}
					"extends" => {
						let expr_src = body["extends".len()..].trim();
						let expr = parse_expr(expr_src).map_err(|m| render_err(path, *line, m))?;
						nodes.push(Node::Extends(expr));
					}
					"block" => {
						let name = body["block".len()..].trim().to_string();
						let (body_nodes, _term) = parse_block(chunks, pos, &["endblock"], path)?;
						*pos += 1;
						nodes.push(Node::Block { name, body: body_nodes });
					}
					other => {
						return Err(render_err(path, *line, format!("unknown tag '{}'", other)));
					}
				}
			}
		}
	}
	Ok((nodes, String::new()))
}

fn render_err(path: &Path, line: usize, message: String) -> TemplateError {
	TemplateError::RenderError {
		path: path.to_path_buf(),
		line,
		message,
	}
}

// ---------------------------------------------------------------------
// Expression parsing
// ---------------------------------------------------------------------

fn parse_expr(src: &str) -> Result<Expr, String> {
	let tokens = tokenize_expr(src)?;
	let mut p = ExprParser { tokens, pos: 0 };
	let expr = p.parse_or()?;
	if p.pos != p.tokens.len() {
		return Err(format!("unexpected trailing tokens near '{}'", src));
	}
	Ok(expr)
}

fn tokenize_expr(src: &str) -> Result<Vec<String>, String> {
	let mut tokens = Vec::new();
	let chars: Vec<char> = src.chars().collect();
	let mut i = 0;
	while i < chars.len() {
		let c = chars[i];
		if c.is_whitespace() {
			i += 1;
			continue;
		}
		if "()[],|".contains(c) {
			tokens.push(c.to_string());
			i += 1;
			continue;
		}
		if c == '"' || c == '\'' {
			let quote = c;
			let mut j = i + 1;
			let mut lit = String::new();
			while j < chars.len() && chars[j] != quote {
				lit.push(chars[j]);
				j += 1;
			}
			if j >= chars.len() {
				return Err("unterminated string literal".to_string());
			}
			tokens.push(format!("\"{}", lit));
			i = j + 1;
			continue;
		}
		if "=!<>".contains(c) {
			if i + 1 < chars.len() && chars[i + 1] == '=' {
				tokens.push(format!("{}{}", c, chars[i + 1]));
				i += 2;
			} else {
				tokens.push(c.to_string());
				i += 1;
			}
			continue;
		}
		let mut j = i;
		while j < chars.len() && !chars[j].is_whitespace() && !"()[],|=!<>\"'".contains(chars[j]) {
			j += 1;
		}
		tokens.push(chars[i..j].iter().collect());
		i = j;
	}
	Ok(tokens)
}

struct ExprParser {
	tokens: Vec<String>,
	pos: usize,
}

impl ExprParser {
	fn peek(&self) -> Option<&str> {
		self.tokens.get(self.pos).map(|s| s.as_str())
	}

	fn next(&mut self) -> Result<String, String> {
		let t = self.tokens.get(self.pos).cloned().ok_or("unexpected end of expression")?;
		self.pos += 1;
		Ok(t)
	}

	fn parse_or(&mut self) -> Result<Expr, String> {
		let mut left = self.parse_and()?;
		while matches!(self.peek(), Some(t) if t.eq_ignore_ascii_case("or")) {
			self.pos += 1;
			let right = self.parse_and()?;
			left = Expr::BinOp(BinOp::Or, Box::new(left), Box::new(right));
		}
		Ok(left)
	}

	fn parse_and(&mut self) -> Result<Expr, String> {
		let mut left = self.parse_not()?;
		while matches!(self.peek(), Some(t) if t.eq_ignore_ascii_case("and")) {
			self.pos += 1;
			let right = self.parse_not()?;
			left = Expr::BinOp(BinOp::And, Box::new(left), Box::new(right));
		}
		Ok(left)
	}

	fn parse_not(&mut self) -> Result<Expr, String> {
		if matches!(self.peek(), Some(t) if t.eq_ignore_ascii_case("not")) {
			self.pos += 1;
			return Ok(Expr::Not(Box::new(self.parse_not()?)));
		}
		self.parse_compare()
	}

	fn parse_compare(&mut self) -> Result<Expr, String> {
		let left = self.parse_filter()?;
		let op = match self.peek() {
			Some("==") => Some(BinOp::Eq),
			Some("!=") => Some(BinOp::Ne),
			Some("<") => Some(BinOp::Lt),
			Some("<=") => Some(BinOp::Le),
			Some(">") => Some(BinOp::Gt),
			Some(">=") => Some(BinOp::Ge),
			_ => None,
		};
		if let Some(op) = op {
			self.pos += 1;
			let right = self.parse_filter()?;
			return Ok(Expr::BinOp(op, Box::new(left), Box::new(right)));
		}
		Ok(left)
	}

	fn parse_filter(&mut self) -> Result<Expr, String> {
		let mut expr = self.parse_primary_with_postfix()?;
		while matches!(self.peek(), Some("|")) {
			self.pos += 1;
			let name = self.next()?;
			let mut args = Vec::new();
			if matches!(self.peek(), Some("(")) {
				self.pos += 1;
				args = self.parse_args()?;
			}
			expr = Expr::Filter(Box::new(expr), name, args);
		}
		Ok(expr)
	}

	fn parse_args(&mut self) -> Result<Vec<Expr>, String> {
		let mut args = Vec::new();
		if matches!(self.peek(), Some(")")) {
			self.pos += 1;
			return Ok(args);
		}
		loop {
			args.push(self.parse_or()?);
			match self.next()?.as_str() {
				"," => continue,
				")" => break,
				other => return Err(format!("expected ',' or ')', found '{}'", other)),
			}
		}
		Ok(args)
	}

	fn parse_primary_with_postfix(&mut self) -> Result<Expr, String> {
		let mut expr = self.parse_primary()?;
		loop {
			match self.peek() {
				Some("[") => {
					self.pos += 1;
					let index = self.parse_or()?;
					match self.next()?.as_str() {
						"]" => {}
						other => return Err(format!("expected ']', found '{}'", other)),
					}
					if let Expr::Path(ref segs) = expr {
						if segs.len() == 1 && segs[0] == "transform" {
							expr = Expr::TransformCall(Box::new(index), Vec::new());
							continue;
						}
					}
					expr = Expr::Index(Box::new(expr), Box::new(index));
				}
				Some("(") => {
					self.pos += 1;
					let args = self.parse_args()?;
					expr = match expr {
						Expr::Path(segs) if segs.len() == 1 => Expr::Call(segs[0].clone(), args),
						Expr::TransformCall(name, _) => Expr::TransformCall(name, args),
						other => return Err(format!("cannot call expression {:?}", other)),
					};
				}
				_ => break,
			}
		}
		Ok(expr)
	}

	fn parse_primary(&mut self) -> Result<Expr, String> {
		let tok = self.next()?;
		if let Some(rest) = tok.strip_prefix('"') {
			return Ok(Expr::Literal(Value::String(rest.to_string())));
		}
		if tok == "(" {
			let inner = self.parse_or()?;
			match self.next()?.as_str() {
				")" => {}
				other => return Err(format!("expected ')', found '{}'", other)),
			}
			return Ok(inner);
		}
		if tok.eq_ignore_ascii_case("true") {
			return Ok(Expr::Literal(Value::Bool(true)));
		}
		if tok.eq_ignore_ascii_case("false") {
			return Ok(Expr::Literal(Value::Bool(false)));
		}
		if tok.eq_ignore_ascii_case("null") || tok.eq_ignore_ascii_case("none") {
			return Ok(Expr::Literal(Value::Null));
		}
		if let Ok(i) = tok.parse::<i64>() {
			return Ok(Expr::Literal(Value::Int(i)));
		}
		if let Ok(f) = tok.parse::<f64>() {
			return Ok(Expr::Literal(Value::Float(f)));
		}
		// dotted / colon path
		let segments: Vec<String> = tok.split(['.', ':']).map(|s| s.to_string()).collect();
		Ok(Expr::Path(segments))
	}
}

// ---------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------

#[derive(Clone)]
struct Scope {
	vars: HashMap<String, Value>,
}

impl Scope {
	fn from_context(context: &TemplateContext) -> Self {
		let mut vars = HashMap::new();
		if let Some(id) = &context.id {
			vars.insert("id".to_string(), Value::String(id.clone()));
		}
		vars.insert("data".to_string(), context.data.clone());
		vars.insert("request_info".to_string(), context.request_info.clone());
		Self { vars }
	}

	fn child_with(&self, name: &str, value: Value) -> Self {
		let mut vars = self.vars.clone();
		vars.insert(name.to_string(), value);
		Self { vars }
	}
}

enum FlowControl {
	None,
	Break,
	Continue,
}

fn exec_nodes(
	nodes: &[Node],
	scope: &Scope,
	dir: &Path,
	include_stack: &mut HashSet<PathBuf>,
	helpers: &[String],
	out: &mut String,
	ctl: &mut FlowControl,
) -> Result<(), TemplateError> {
	exec_nodes_with_overrides(nodes, scope, dir, include_stack, helpers, &HashMap::new(), out, ctl)
}

fn exec_nodes_with_overrides(
	nodes: &[Node],
	scope: &Scope,
	dir: &Path,
	include_stack: &mut HashSet<PathBuf>,
	helpers: &[String],
	overrides: &HashMap<String, Vec<Node>>,
	out: &mut String,
	ctl: &mut FlowControl,
) -> Result<(), TemplateError> {
	for node in nodes {
		if !matches!(ctl, FlowControl::None) {
			break;
		}
		match node {
			Node::Text(t) => out.push_str(t),
			Node::Expr(expr, line) => {
				let v = eval(expr, scope, dir, *line, helpers)?;
				out.push_str(&value_to_display(&v));
			}
			Node::Do(expr, line) => {
				eval(expr, scope, dir, *line, helpers)?;
			}
			Node::If { branches, else_branch } => {
				let mut matched = false;
				for (cond, body) in branches {
					if truthy(&eval(cond, scope, dir, 0, helpers)?) {
						exec_nodes_with_overrides(body, scope, dir, include_stack, helpers, overrides, out, ctl)?;
						matched = true;
						break;
					}
				}
				if !matched {
					if let Some(body) = else_branch {
						exec_nodes_with_overrides(body, scope, dir, include_stack, helpers, overrides, out, ctl)?;
					}
				}
			}
			Node::For { var, iterable, body } => {
				let value = eval(iterable, scope, dir, 0, helpers)?;
				let items: Vec<Value> = match value {
					Value::Seq(items) => items,
					Value::Map(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
					_ => Vec::new(),
				};
				for item in items {
					let child = scope.child_with(var, item);
					let mut inner_ctl = FlowControl::None;
					exec_nodes_with_overrides(body, &child, dir, include_stack, helpers, overrides, out, &mut inner_ctl)?;
					match inner_ctl {
						FlowControl::Break => break,
						FlowControl::Continue | FlowControl::None => continue,
					}
				}
			}
			Node::With { var, value, body } => {
				let v = eval(value, scope, dir, 0, helpers)?;
				let child = scope.child_with(var, v);
				exec_nodes_with_overrides(body, &child, dir, include_stack, helpers, overrides, out, ctl)?;
			}
			Node::Break => *ctl = FlowControl::Break,
			Node::Continue => *ctl = FlowControl::Continue,
			Node::Include(expr) => {
				let target = eval(expr, scope, dir, 0, helpers)?;
				let name = target
					.as_scalar_string()
					.ok_or_else(|| render_err(dir, 0, "include target must be a string".into()))?;
				let path = dir.join(name);
				let rendered = render_file(&path, scope, include_stack, helpers)?;
				out.push_str(&rendered);
			}
			Node::Extends(_) => { /* handled at render_file level */ }
			Node::Block { name, body } => {
				if let Some(override_body) = overrides.get(name) {
					exec_nodes_with_overrides(override_body, scope, dir, include_stack, helpers, &HashMap::new(), out, ctl)?;
				} else {
					exec_nodes_with_overrides(body, scope, dir, include_stack, helpers, overrides, out, ctl)?;
				}
			}
		}
	}
	Ok(())
}

fn truthy(value: &Value) -> bool {
	match value {
		Value::Null => false,
		Value::Bool(b) => *b,
		Value::Int(i) => *i != 0,
		Value::Float(f) => *f != 0.0,
		Value::String(s) => !s.is_empty(),
		Value::Seq(items) => !items.is_empty(),
		Value::Map(m) => !m.is_empty(),
	}
}

fn value_to_display(value: &Value) -> String {
	match value {
		Value::Null => String::new(),
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn eval(expr: &Expr, scope: &Scope, dir: &Path, line: usize, helpers: &[String]) -> Result<Value, TemplateError> {
	match expr {
		Expr::Literal(v) => Ok(v.clone()),
		Expr::Path(segments) => {
			let first = scope.vars.get(&segments[0]).cloned().unwrap_or(Value::Null);
			if segments.len() == 1 {
				Ok(first)
			} else {
				Ok(first.lookup(&segments[1..].join(":")).cloned().unwrap_or(Value::Null))
			}
		}
		Expr::Index(base, index) => {
			let base_v = eval(base, scope, dir, line, helpers)?;
			let index_v = eval(index, scope, dir, line, helpers)?;
			Ok(match (&base_v, &index_v) {
				(Value::Map(m), Value::String(k)) => m.get(k).cloned().unwrap_or(Value::Null),
				(Value::Seq(s), Value::Int(i)) => {
					if *i >= 0 {
						s.get(*i as usize).cloned().unwrap_or(Value::Null)
					} else {
						Value::Null
					}
				}
				_ => Value::Null,
			})
		}
		Expr::Call(name, args) => {
			let values: Result<Vec<Value>, TemplateError> = args.iter().map(|a| eval(a, scope, dir, line, helpers)).collect();
			let values = values?;
			match name.as_str() {
				"raise" => {
					let message = values
						.first()
						.and_then(|v| v.as_scalar_string())
						.unwrap_or_else(|| "template raised an error".to_string());
					Err(TemplateError::Raised {
						path: dir.to_path_buf(),
						line,
						message,
					})
				}
				"len" => {
					let n = match values.first() {
						Some(Value::Seq(s)) => s.len() as i64,
						Some(Value::Map(m)) => m.len() as i64,
						Some(Value::String(s)) => s.chars().count() as i64,
						_ => 0,
					};
					Ok(Value::Int(n))
				}
				other if helpers.iter().any(|h| h == other) => call_helper(other, &values, dir, line),
				other => Err(render_err(dir, line, format!("unknown function '{}'", other))),
			}
		}
		Expr::TransformCall(name_expr, args) => {
			let name_v = eval(name_expr, scope, dir, line, helpers)?;
			let name = name_v
				.as_scalar_string()
				.ok_or_else(|| render_err(dir, line, "transform name must be a string".into()))?;
			let values: Result<Vec<Value>, TemplateError> = args.iter().map(|a| eval(a, scope, dir, line, helpers)).collect();
			let mut values = values?;
			if values.is_empty() {
				return Err(render_err(dir, line, "transform call requires an input value".into()));
			}
			let input = values.remove(0);
			transforms::apply_one(&name, input, &values).map_err(|e| render_err(dir, line, e.to_string()))
		}
		Expr::Filter(base, name, args) => {
			let base_v = eval(base, scope, dir, line, helpers)?;
			match name.as_str() {
				"to_yaml" => {
					let yaml: serde_yaml::Value = base_v.into();
					let text = serde_yaml::to_string(&yaml).map_err(|e| render_err(dir, line, e.to_string()))?;
					Ok(Value::String(text))
				}
				"to_json" => {
					let json: serde_json::Value = base_v.into();
					let text = serde_json::to_string(&json).map_err(|e| render_err(dir, line, e.to_string()))?;
					Ok(Value::String(text))
				}
				other => {
					// fall back to treating unknown filters as transform names
					let values: Result<Vec<Value>, TemplateError> = args.iter().map(|a| eval(a, scope, dir, line, helpers)).collect();
					transforms::apply_one(other, base_v, &values?).map_err(|e| render_err(dir, line, e.to_string()))
				}
			}
		}
		Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope, dir, line, helpers)?))),
		Expr::BinOp(op, a, b) => {
			if matches!(op, BinOp::And) {
				let left = eval(a, scope, dir, line, helpers)?;
				return if !truthy(&left) {
					Ok(Value::Bool(false))
				} else {
					Ok(Value::Bool(truthy(&eval(b, scope, dir, line, helpers)?)))
				};
			}
			if matches!(op, BinOp::Or) {
				let left = eval(a, scope, dir, line, helpers)?;
				return if truthy(&left) {
					Ok(Value::Bool(true))
				} else {
					Ok(Value::Bool(truthy(&eval(b, scope, dir, line, helpers)?)))
				};
			}
			let left = eval(a, scope, dir, line, helpers)?;
			let right = eval(b, scope, dir, line, helpers)?;
			Ok(Value::Bool(compare(op, &left, &right)))
		}
	}
}

/// Host capabilities a template may call, gated per-engine by the
/// `provided_helpers` allow-list (`DefaultEngine::with_helpers`) -- the
/// language-agnostic analogue of the original `provide_python_modules`
/// option. A name not in this table is a configuration error even if
/// it's on the allow-list; a name not on the allow-list never reaches
/// here at all (the `Expr::Call` arm only dispatches listed names).
fn call_helper(name: &str, values: &[Value], dir: &Path, line: usize) -> Result<Value, TemplateError> {
	match name {
		"env" => {
			let key = values
				.first()
				.and_then(|v| v.as_scalar_string())
				.ok_or_else(|| render_err(dir, line, "env() requires a variable name".into()))?;
			Ok(std::env::var(&key).map(Value::String).unwrap_or(Value::Null))
		}
		"now" => Ok(Value::String(chrono::Utc::now().to_rfc3339())),
		other => Err(render_err(dir, line, format!("helper '{}' is not implemented", other))),
	}
}

fn compare(op: &BinOp, left: &Value, right: &Value) -> bool {
	use std::cmp::Ordering;
	let ord = match (left, right) {
		(Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
		(Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
		(Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
		(Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
		(Value::String(a), Value::String(b)) => Some(a.cmp(b)),
		_ => None,
	};
	match op {
		BinOp::Eq => left == right,
		BinOp::Ne => left != right,
		BinOp::Lt => ord == Some(Ordering::Less),
		BinOp::Le => matches!(ord, Some(Ordering::Less) | Some(Ordering::Equal)),
		BinOp::Gt => ord == Some(Ordering::Greater),
		BinOp::Ge => matches!(ord, Some(Ordering::Greater) | Some(Ordering::Equal)),
		BinOp::And | BinOp::Or => unreachable!("handled before compare()"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn render_str(template: &str, context: &TemplateContext) -> Result<String, TemplateError> {
		render_str_with(template, context, DefaultEngine::new())
	}

	fn render_str_with(template: &str, context: &TemplateContext, engine: DefaultEngine) -> Result<String, TemplateError> {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		write!(f, "{}", template).unwrap();
		let bytes = engine.render(f.path(), context)?;
		Ok(String::from_utf8(bytes).unwrap())
	}

	#[test]
	fn variable_expansion() {
		let ctx = TemplateContext::new(Some("host1".into()), Value::empty_map());
		let out = render_str("hello {{ id }}", &ctx).unwrap();
		assert_eq!(out, "hello host1");
	}

	#[test]
	fn id_absent_renders_empty_without_error() {
		let ctx = TemplateContext::new(None, Value::empty_map());
		let out = render_str("id=[{{ id }}]", &ctx).unwrap();
		assert_eq!(out, "id=[]");
	}

	#[test]
	fn if_else_control_flow() {
		let ctx = TemplateContext::new(Some("host1".into()), Value::empty_map());
		let out = render_str("{% if id %}yes{% else %}no{% endif %}", &ctx).unwrap();
		assert_eq!(out, "yes");
	}

	#[test]
	fn for_loop_over_sequence() {
		let mut data = Value::empty_map();
		data.set_path("items", Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
		let ctx = TemplateContext::new(None, data);
		let out = render_str("{% for x in data.items %}[{{ x }}]{% endfor %}", &ctx).unwrap();
		assert_eq!(out, "[1][2][3]");
	}

	#[test]
	fn transform_accessor() {
		let ctx = TemplateContext::new(None, Value::empty_map());
		let out = render_str("{{ transform['string.to_lower'](\"ABC\") }}", &ctx).unwrap();
		assert_eq!(out, "abc");
	}

	#[test]
	fn raise_reports_location() {
		let ctx = TemplateContext::new(None, Value::empty_map());
		let err = render_str("{% do raise(\"boom\") %}", &ctx).unwrap_err();
		assert!(matches!(err, TemplateError::Raised { .. }));
	}

	#[test]
	fn helper_not_on_allow_list_is_unknown_function() {
		let ctx = TemplateContext::new(None, Value::empty_map());
		let err = render_str("{{ env(\"PATH\") }}", &ctx).unwrap_err();
		match err {
			TemplateError::RenderError { message, .. } => assert!(message.contains("unknown function")),
			other => panic!("expected a render error, got {:?}", other),
		}
	}

	#[test]
	fn allow_listed_helper_is_callable() {
		std::env::set_var("VINEGAR_TEMPLATE_HELPER_TEST", "helper-value");
		let ctx = TemplateContext::new(None, Value::empty_map());
		let engine = DefaultEngine::new().with_helpers(vec!["env".to_string()]);
		let out = render_str_with("{{ env(\"VINEGAR_TEMPLATE_HELPER_TEST\") }}", &ctx, engine).unwrap();
		assert_eq!(out, "helper-value");
	}

	#[test]
	fn to_yaml_filter_round_trips() {
		let mut data = Value::empty_map();
		data.set_path("k", Value::String("v".into()));
		let ctx = TemplateContext::new(None, data);
		let out = render_str("{{ data | to_yaml }}", &ctx).unwrap();
		let parsed: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
		assert_eq!(parsed["k"].as_str(), Some("v"));
	}
}
