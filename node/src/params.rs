//! Per-node namespaced parameter store: get/set/list/delete, dotted
//! subparameter keys, bulk set via pipeline, and a conditional file loader
//! (JSON/YAML) with environment-variable guards.
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use codec::{Value, decode, encode};
use glob::Pattern;
use logger::Logger;
use redis_client::{BrokerClient, Namespace};

use crate::error::{NodeError, NodeResult};

/// A parameter to set, as accepted by [`ParameterStore::set_many`] and
/// produced by [`ParameterStore::load_from_file`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub node_name: String,
    pub name: String,
    pub value: Value,
    pub description: Option<String>,
}

pub struct ParameterStore {
    broker: Arc<BrokerClient>,
    node_name: String,
    logger: Logger,
}

impl ParameterStore {
    pub fn new(broker: Arc<BrokerClient>, node_name: &str, logger: Logger) -> Self {
        ParameterStore {
            broker,
            node_name: node_name.to_string(),
            logger,
        }
    }

    fn node_for<'a>(&'a self, node: Option<&'a str>) -> &'a str {
        node.unwrap_or(&self.node_name)
    }

    fn key(&self, name: &str, node: Option<&str>) -> String {
        format!("{}.{name}", self.node_for(node))
    }

    fn fetch_record(&self, name: &str, node: Option<&str>) -> NodeResult<Option<HashMap<String, Value>>> {
        let key = self.key(name, node);
        match self.broker.get(Namespace::Parameters, &key)? {
            Some(bytes) => {
                let value = decode(&bytes)?;
                Ok(value.as_map().cloned())
            }
            None => Ok(None),
        }
    }

    pub fn get(&self, name: &str, node: Option<&str>) -> NodeResult<Option<Value>> {
        Ok(self
            .fetch_record(name, node)?
            .and_then(|record| record.get("value").cloned()))
    }

    /// As [`get`](Self::get), but raises `PARAMETER_NOT_FOUND` instead of
    /// returning `None`.
    pub fn get_fail_if_not_found(&self, name: &str, node: Option<&str>) -> NodeResult<Value> {
        self.get(name, node)?
            .ok_or_else(|| NodeError::ParameterNotFound(self.key(name, node)))
    }

    pub fn get_description(&self, name: &str, node: Option<&str>) -> NodeResult<Option<String>> {
        Ok(self.fetch_record(name, node)?.and_then(|record| {
            record.get("description").and_then(Value::as_str).map(str::to_string)
        }))
    }

    /// Lists parameters for `node` (defaulting to this node) whose dotted
    /// name matches `glob` (defaulting to `"*"`), keyed by short name.
    pub fn list(&self, node: Option<&str>, glob: Option<&str>) -> NodeResult<HashMap<String, Value>> {
        let node_name = self.node_for(node).to_string();
        let pattern = Pattern::new(glob.unwrap_or("*"))
            .map_err(|e| NodeError::Other(format!("invalid glob pattern: {e}")))?;

        let prefix = format!("{node_name}.");
        let mut result = HashMap::new();
        for key in self.broker.scan(Namespace::Parameters, &format!("{node_name}.*")) {
            let key = key?;
            let Some(short_name) = key.strip_prefix(&prefix) else { continue };
            if !pattern.matches(short_name) {
                continue;
            }
            if let Some(value) = self.get(short_name, Some(&node_name))? {
                result.insert(short_name.to_string(), value);
            }
        }
        Ok(result)
    }

    pub fn set(
        &self,
        name: &str,
        value: Value,
        node: Option<&str>,
        description: Option<&str>,
    ) -> NodeResult<()> {
        let key = self.key(name, node);
        let bytes = encode(&record_value(value, description));
        self.broker.set(Namespace::Parameters, &key, &bytes, None)?;
        Ok(())
    }

    /// Sets every entry in `entries` in one pipelined batch. Best-effort
    /// atomicity only: the broker's pipeline semantics, not a transaction.
    pub fn set_many(&self, entries: Vec<ParamEntry>) -> NodeResult<()> {
        let mut pipeline = self.broker.pipeline();
        for entry in &entries {
            let key = format!("{}.{}", entry.node_name, entry.name);
            let bytes = encode(&record_value(entry.value.clone(), entry.description.as_deref()));
            pipeline = pipeline.set(Namespace::Parameters, &key, &bytes, None);
        }
        pipeline.commit()?;
        Ok(())
    }

    pub fn delete(&self, name: &str, node: Option<&str>) -> NodeResult<()> {
        let key = self.key(name, node);
        self.broker.delete(Namespace::Parameters, &key)?;
        Ok(())
    }

    /// Deletes `names` under `node`, or every parameter under `node` if
    /// `names` is omitted (scan + delete-all).
    pub fn delete_all(&self, names: Option<Vec<String>>, node: Option<&str>) -> NodeResult<()> {
        match names {
            Some(names) => {
                for name in names {
                    self.delete(&name, node)?;
                }
                Ok(())
            }
            None => {
                let node_name = self.node_for(node).to_string();
                let mut keys = Vec::new();
                for key in self.broker.scan(Namespace::Parameters, &format!("{node_name}.*")) {
                    keys.push(key?);
                }
                for key in keys {
                    self.broker.delete(Namespace::Parameters, &key)?;
                }
                Ok(())
            }
        }
    }

    /// Parses a JSON or YAML parameter document and flattens it into a
    /// list of entries, skipping whole top-level subtrees whose
    /// `(condition)` suffix evaluates false.
    pub fn load_from_file(&self, path: &str) -> NodeResult<Vec<ParamEntry>> {
        self.logger.info(&format!("loading parameters from file: {path}"), "params");
        let contents = fs::read_to_string(path)
            .map_err(|e| NodeError::Other(format!("reading parameter file {path}: {e}")))?;

        let doc = if path.ends_with(".json") {
            serde_json::from_str::<serde_json::Value>(&contents)
                .map_err(|e| NodeError::Other(format!("parsing JSON parameter file {path}: {e}")))?
        } else if path.ends_with(".yml") || path.ends_with(".yaml") {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&contents)
                .map_err(|e| NodeError::Other(format!("parsing YAML parameter file {path}: {e}")))?;
            serde_json::to_value(&yaml)
                .map_err(|e| NodeError::Other(format!("normalising YAML parameter file {path}: {e}")))?
        } else {
            return Err(NodeError::Other(format!(
                "unrecognised parameter file extension: {path}"
            )));
        };

        flatten_document(doc)
    }

    /// Composes [`load_from_file`](Self::load_from_file) with
    /// [`set_many`](Self::set_many).
    pub fn set_from_file(&self, path: &str) -> NodeResult<()> {
        let entries = self.load_from_file(path)?;
        self.set_many(entries)
    }
}

fn record_value(value: Value, description: Option<&str>) -> Value {
    let mut record = HashMap::new();
    record.insert("value".to_string(), value);
    record.insert(
        "description".to_string(),
        match description {
            Some(d) => Value::Str(d.to_string()),
            None => Value::Null,
        },
    );
    Value::Map(record)
}

/// Top-level keys become node names (stripping an optional `(condition)`
/// suffix); nested objects contribute dotted subparameter segments; any
/// other JSON value is a leaf parameter.
fn flatten_document(doc: serde_json::Value) -> NodeResult<Vec<ParamEntry>> {
    let mut out = Vec::new();
    let Some(top) = doc.as_object() else {
        return Ok(out);
    };

    for (raw_key, value) in top {
        let (node_name, condition) = split_condition(raw_key);
        if let Some(condition) = condition {
            if !eval_condition(&condition)? {
                continue;
            }
        }
        let mut segments = Vec::new();
        flatten_node(&node_name, value, &mut segments, &mut out);
    }

    Ok(out)
}

fn flatten_node(node_name: &str, value: &serde_json::Value, segments: &mut Vec<String>, out: &mut Vec<ParamEntry>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                segments.push(key.clone());
                flatten_node(node_name, inner, segments, out);
                segments.pop();
            }
        }
        other => {
            out.push(ParamEntry {
                node_name: node_name.to_string(),
                name: segments.join("."),
                value: json_to_value(other),
                description: None,
            });
        }
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Seq(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

/// Splits a top-level document key into its node name and optional
/// trailing `(condition)` clause, e.g. `node1(${X}=="1")` -> (`node1`,
/// `${X}=="1"`).
fn split_condition(key: &str) -> (String, Option<String>) {
    if let Some(start) = key.find('(') {
        if key.ends_with(')') {
            let name = key[..start].to_string();
            let condition = key[start + 1..key.len() - 1].to_string();
            return (name, Some(condition));
        }
    }
    (key.to_string(), None)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    EnvRef(String),
    Literal(String),
    And,
    Or,
    Eq,
    Ne,
}

/// Tokenizes a condition clause: `${VAR}`, quoted string literals, and the
/// `==`, `!=`, `&&`, `||` operators, matching spec §9's restricted grammar.
fn tokenize(condition: &str) -> NodeResult<Vec<Token>> {
    let chars: Vec<char> = condition.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '$' && chars.get(i + 1) == Some(&'{') {
            let end = chars[i..]
                .iter()
                .position(|&ch| ch == '}')
                .map(|p| i + p)
                .ok_or_else(|| NodeError::Other(format!("unterminated ${{..}} in condition: {condition}")))?;
            let name: String = chars[i + 2..end].iter().collect();
            tokens.push(Token::EnvRef(name));
            i = end + 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let end = chars[i + 1..]
                .iter()
                .position(|&ch| ch == quote)
                .map(|p| i + 1 + p)
                .ok_or_else(|| NodeError::Other(format!("unterminated string literal in condition: {condition}")))?;
            let literal: String = chars[i + 1..end].iter().collect();
            tokens.push(Token::Literal(literal));
            i = end + 1;
            continue;
        }
        if chars[i..].starts_with(&['&', '&']) {
            tokens.push(Token::And);
            i += 2;
            continue;
        }
        if chars[i..].starts_with(&['|', '|']) {
            tokens.push(Token::Or);
            i += 2;
            continue;
        }
        if chars[i..].starts_with(&['=', '=']) {
            tokens.push(Token::Eq);
            i += 2;
            continue;
        }
        if chars[i..].starts_with(&['!', '=']) {
            tokens.push(Token::Ne);
            i += 2;
            continue;
        }
        return Err(NodeError::Other(format!(
            "unexpected character '{c}' in condition: {condition}"
        )));
    }

    Ok(tokens)
}

/// Evaluates a condition clause. Grammar (left-to-right, no operator
/// precedence beyond left association, per spec §9):
///   expr       := comparison (("&&" | "||") comparison)*
///   comparison := primary ("==" | "!=") primary
///   primary    := env-ref | string-literal
fn eval_condition(condition: &str) -> NodeResult<bool> {
    let tokens = tokenize(condition)?;
    let mut parser = ConditionParser { tokens, pos: 0 };
    let result = parser.parse_expr(condition)?;
    if parser.pos != parser.tokens.len() {
        return Err(NodeError::Other(format!("trailing tokens in condition: {condition}")));
    }
    Ok(result)
}

struct ConditionParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ConditionParser {
    fn parse_primary(&mut self, condition: &str) -> NodeResult<String> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| NodeError::Other(format!("unexpected end of condition: {condition}")))?
            .clone();
        self.pos += 1;
        match token {
            Token::EnvRef(name) => Ok(std::env::var(&name).unwrap_or_default()),
            Token::Literal(text) => Ok(text),
            other => Err(NodeError::Other(format!(
                "expected a value but found {other:?} in condition: {condition}"
            ))),
        }
    }

    fn parse_comparison(&mut self, condition: &str) -> NodeResult<bool> {
        let lhs = self.parse_primary(condition)?;
        let op = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| NodeError::Other(format!("expected == or != in condition: {condition}")))?;
        self.pos += 1;
        let rhs = self.parse_primary(condition)?;
        match op {
            Token::Eq => Ok(lhs == rhs),
            Token::Ne => Ok(lhs != rhs),
            other => Err(NodeError::Other(format!(
                "expected == or != but found {other:?} in condition: {condition}"
            ))),
        }
    }

    fn parse_expr(&mut self, condition: &str) -> NodeResult<bool> {
        let mut result = self.parse_comparison(condition)?;
        while let Some(op) = self.tokens.get(self.pos).cloned() {
            match op {
                Token::And => {
                    self.pos += 1;
                    let rhs = self.parse_comparison(condition)?;
                    result = result && rhs;
                }
                Token::Or => {
                    self.pos += 1;
                    let rhs = self.parse_comparison(condition)?;
                    result = result || rhs;
                }
                _ => break,
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_condition_suffix() {
        assert_eq!(
            split_condition("node1(${X}==\"123\")"),
            ("node1".to_string(), Some("${X}==\"123\"".to_string()))
        );
        assert_eq!(split_condition("node2"), ("node2".to_string(), None));
    }

    #[test]
    fn evaluates_equality_against_env() {
        unsafe {
            std::env::set_var("NV_TEST_PARAMS_COND", "123");
        }
        assert!(eval_condition("${NV_TEST_PARAMS_COND}==\"123\"").unwrap());
        assert!(!eval_condition("${NV_TEST_PARAMS_COND}!=\"123\"").unwrap());
        unsafe {
            std::env::remove_var("NV_TEST_PARAMS_COND");
        }
    }

    #[test]
    fn unset_env_ref_defaults_to_empty_string() {
        unsafe {
            std::env::remove_var("NV_TEST_PARAMS_UNSET");
        }
        assert!(eval_condition("${NV_TEST_PARAMS_UNSET}==\"\"").unwrap());
    }

    #[test]
    fn evaluates_left_to_right_with_and_or() {
        unsafe {
            std::env::set_var("NV_TEST_PARAMS_A", "1");
            std::env::set_var("NV_TEST_PARAMS_B", "2");
        }
        assert!(
            eval_condition("${NV_TEST_PARAMS_A}==\"1\"&&${NV_TEST_PARAMS_B}==\"2\"").unwrap()
        );
        assert!(
            !eval_condition("${NV_TEST_PARAMS_A}==\"9\"||${NV_TEST_PARAMS_B}==\"9\"").unwrap()
        );
        unsafe {
            std::env::remove_var("NV_TEST_PARAMS_A");
            std::env::remove_var("NV_TEST_PARAMS_B");
        }
    }

    #[test]
    fn flattens_nested_maps_into_dotted_names() {
        let doc: serde_json::Value = serde_json::from_str(
            r#"{
                "node1": {
                    "param1": "value1",
                    "subparam": {
                        "subparam1": "value2"
                    }
                }
            }"#,
        )
        .unwrap();

        let entries = flatten_document(doc).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.node_name == "node1" && e.name == "param1"));
        assert!(
            entries
                .iter()
                .any(|e| e.node_name == "node1" && e.name == "subparam.subparam1")
        );
    }

    #[test]
    fn conditional_subtree_is_skipped_when_false() {
        unsafe {
            std::env::set_var("NV_TEST_PARAMS_GUARD", "");
        }
        let doc: serde_json::Value = serde_json::from_str(
            r#"{
                "node1(${NV_TEST_PARAMS_GUARD}==\"123\")": { "param": "value" }
            }"#,
        )
        .unwrap();
        let entries = flatten_document(doc).unwrap();
        assert!(entries.is_empty());
        unsafe {
            std::env::remove_var("NV_TEST_PARAMS_GUARD");
        }
    }
}
