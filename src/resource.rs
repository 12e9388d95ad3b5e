//! Typed resource declarations and input references.
//!
//! A [`ResourceSpec`] is what the graph builder consumes. Inputs are plain
//! JSON; strings may carry `${Name.output}` references to another
//! resource's outputs, and an object of the form `{"$json": value}` is
//! resolved and then serialised into a JSON string. User-supplied text is
//! wrapped as `{"$literal": "..."}` so it is never scanned for references.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::PlanError;
use crate::planner::ReplacePolicy;

/// Provider outputs of a resource.
pub type Outputs = Map<String, Value>;

/// Key marking an object to be serialised as a JSON string after resolution.
pub const JSON_STRING_KEY: &str = "$json";

/// Key marking a string that is passed through verbatim.
pub const LITERAL_KEY: &str = "$literal";

/// A typed declaration of a single cloud resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Logical name, unique within a program.
    pub name: String,

    /// Provider resource type, e.g. `aws:rds:Instance`.
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Declared input properties.
    #[serde(default = "empty_inputs")]
    pub inputs: Value,

    /// Explicit dependency edges.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Extra fields that force replacement when changed.
    #[serde(default)]
    pub replace_on: Vec<String>,

    /// Replacement ordering override.
    #[serde(default)]
    pub replace_policy: Option<ReplacePolicy>,
}

fn empty_inputs() -> Value {
    Value::Object(Map::new())
}

/// A `${Name.output}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Referenced logical name.
    pub resource: String,
    /// Output key (`id` is the external id).
    pub output: String,
}

/// A piece of a string after splitting out references.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Ref(Reference),
}

impl ResourceSpec {
    /// Creates a declaration with the given inputs and no edges.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>, inputs: Value) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            inputs,
            depends_on: Vec::new(),
            replace_on: Vec::new(),
            replace_policy: None,
        }
    }

    /// Adds an explicit dependency edge.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
        self
    }

    /// Overrides the replacement policy.
    #[must_use]
    pub const fn with_replace_policy(mut self, policy: ReplacePolicy) -> Self {
        self.replace_policy = Some(policy);
        self
    }

    /// Marks extra identity-defining fields.
    #[must_use]
    pub fn with_replace_on(mut self, fields: &[&str]) -> Self {
        self.replace_on.extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// All dependencies: explicit edges first, then referenced names in
    /// order of first appearance.
    ///
    /// # Errors
    ///
    /// Returns an error if an input string holds a malformed reference.
    pub fn dependencies(&self) -> Result<Vec<String>, PlanError> {
        let mut deps = self.depends_on.clone();
        let mut refs = Vec::new();
        collect_references(&self.name, &self.inputs, &mut refs)?;
        for reference in refs {
            if !deps.contains(&reference.resource) {
                deps.push(reference.resource);
            }
        }
        Ok(deps)
    }

    /// Top-level input fields mapped to the resources they reference.
    ///
    /// # Errors
    ///
    /// Returns an error if an input string holds a malformed reference.
    pub fn referencing_fields(&self) -> Result<BTreeMap<String, BTreeSet<String>>, PlanError> {
        let mut fields = BTreeMap::new();
        if let Value::Object(map) = &self.inputs {
            for (field, value) in map {
                let mut refs = Vec::new();
                collect_references(&self.name, value, &mut refs)?;
                if !refs.is_empty() {
                    fields.insert(field.clone(), refs.into_iter().map(|r| r.resource).collect());
                }
            }
        }
        Ok(fields)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

/// Builds the `${Name.output}` text for a reference.
#[must_use]
pub fn reference(resource: &str, output: &str) -> String {
    format!("${{{resource}.{output}}}")
}

/// Wraps a value so it is serialised into a JSON string after resolution.
#[must_use]
pub fn json_string(value: Value) -> Value {
    let mut map = Map::new();
    map.insert(JSON_STRING_KEY.to_string(), value);
    Value::Object(map)
}

/// Wraps user-supplied text so `${` inside it is never read as a reference.
#[must_use]
pub fn literal(text: impl Into<String>) -> Value {
    let mut map = Map::new();
    map.insert(LITERAL_KEY.to_string(), Value::String(text.into()));
    Value::Object(map)
}

/// Wraps every string in `value` that contains `${` with [`literal`].
/// Other strings are left as they are.
#[must_use]
pub fn escape_literals(value: Value) -> Value {
    match value {
        Value::String(s) if s.contains("${") => literal(s),
        Value::Array(items) => Value::Array(items.into_iter().map(escape_literals).collect()),
        Value::Object(map) if literal_text(&map).is_none() => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, escape_literals(item)))
                .collect(),
        ),
        other => other,
    }
}

/// The text of a plain string or of a [`literal`].
#[must_use]
pub fn as_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) => literal_text(map).and_then(Value::as_str),
        _ => None,
    }
}

/// The text of a `{"$literal": "..."}` object.
fn literal_text(map: &Map<String, Value>) -> Option<&Value> {
    if map.len() == 1 { map.get(LITERAL_KEY) } else { None }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Splits a string into text and reference segments.
fn split_segments<'a>(owner: &str, text: &'a str) -> Result<Vec<Segment<'a>>, PlanError> {
    let malformed = |r: &str| PlanError::MalformedReference {
        resource: owner.to_string(),
        reference: r.to_string(),
    };

    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| malformed(&rest[start..]))?;
        let body = &after[..end];

        let (resource, output) = body.split_once('.').ok_or_else(|| malformed(body))?;
        let valid = !resource.is_empty()
            && !output.is_empty()
            && resource.starts_with(|c: char| c.is_ascii_alphabetic())
            && resource.chars().all(is_ident_char)
            && output.chars().all(is_ident_char);
        if !valid {
            return Err(malformed(body));
        }

        segments.push(Segment::Ref(Reference {
            resource: resource.to_string(),
            output: output.to_string(),
        }));
        rest = &after[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

/// Collects every reference inside `value`, in order of appearance.
fn collect_references(owner: &str, value: &Value, out: &mut Vec<Reference>) -> Result<(), PlanError> {
    match value {
        Value::String(s) => {
            for segment in split_segments(owner, s)? {
                if let Segment::Ref(r) = segment {
                    if !out.contains(&r) {
                        out.push(r);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(owner, item, out)?;
            }
        }
        Value::Object(map) if literal_text(map).is_some() => {}
        Value::Object(map) => {
            for item in map.values() {
                collect_references(owner, item, out)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Returns every reference inside `value`.
///
/// # Errors
///
/// Returns an error if a string holds a malformed reference.
pub fn references(owner: &str, value: &Value) -> Result<Vec<Reference>, PlanError> {
    let mut refs = Vec::new();
    collect_references(owner, value, &mut refs)?;
    Ok(refs)
}

/// Substitutes references in `value` using `lookup`.
///
/// # Errors
///
/// Returns `UnresolvedReference` if `lookup` has no value for a reference,
/// or `MalformedReference` for a malformed one.
pub fn resolve_inputs<F>(owner: &str, value: &Value, lookup: &F) -> Result<Value, PlanError>
where
    F: Fn(&Reference) -> Option<Value>,
{
    match value {
        Value::String(s) => resolve_string(owner, s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_inputs(owner, item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            if let Some(text) = literal_text(map) {
                return Ok(text.clone());
            }
            if map.len() == 1 {
                if let Some(inner) = map.get(JSON_STRING_KEY) {
                    let resolved = resolve_inputs(owner, inner, lookup)?;
                    return Ok(Value::String(resolved.to_string()));
                }
            }
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), resolve_inputs(owner, item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

fn resolve_string<F>(owner: &str, text: &str, lookup: &F) -> Result<Value, PlanError>
where
    F: Fn(&Reference) -> Option<Value>,
{
    let segments = split_segments(owner, text)?;
    let fetch = |r: &Reference| {
        lookup(r).ok_or_else(|| PlanError::UnresolvedReference {
            resource: owner.to_string(),
            reference: r.to_string(),
        })
    };

    if let [Segment::Ref(r)] = segments.as_slice() {
        return fetch(r);
    }

    let mut out = String::with_capacity(text.len());
    for segment in &segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Ref(r) => match fetch(r)? {
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            },
        }
    }
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(r: &Reference) -> Option<Value> {
        match (r.resource.as_str(), r.output.as_str()) {
            ("Db", "endpoint") => Some(json!("db.example.com:3306")),
            ("Db", "port") => Some(json!(3306)),
            ("Secret", "id") => Some(json!("secret-1")),
            _ => None,
        }
    }

    #[test]
    fn test_whole_string_reference_keeps_type() {
        let resolved = resolve_inputs("X", &json!({"port": "${Db.port}"}), &lookup).expect("resolve");
        assert_eq!(resolved, json!({"port": 3306}));
    }

    #[test]
    fn test_embedded_reference_is_textual() {
        let resolved =
            resolve_inputs("X", &json!("mysql://${Db.endpoint}/app?p=${Db.port}"), &lookup).expect("resolve");
        assert_eq!(resolved, json!("mysql://db.example.com:3306/app?p=3306"));
    }

    #[test]
    fn test_json_string_marker() {
        let value = json_string(json!({"secret": "${Secret.id}", "n": 1}));
        let resolved = resolve_inputs("X", &value, &lookup).expect("resolve");
        let text = resolved.as_str().expect("string");
        let parsed: Value = serde_json::from_str(text).expect("json");
        assert_eq!(parsed, json!({"secret": "secret-1", "n": 1}));
    }

    #[test]
    fn test_unresolved_reference() {
        let err = resolve_inputs("X", &json!("${Db.missing}"), &lookup).expect_err("should fail");
        assert!(matches!(err, PlanError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_malformed_references() {
        for bad in ["${Db}", "${Db.port", "${.port}", "${1Db.port}"] {
            let err = references("X", &json!(bad)).expect_err(bad);
            assert!(matches!(err, PlanError::MalformedReference { .. }), "{bad}");
        }
    }

    #[test]
    fn test_dependencies_merge_edges_and_references() {
        let spec = ResourceSpec::new(
            "Proxy",
            "aws:rds:Proxy",
            json!({"role": "${Role.arn}", "auth": [{"secret": "${Secret.arn}"}], "again": "${Role.name}"}),
        )
        .depends_on("Lookup")
        .depends_on("Role");

        assert_eq!(
            spec.dependencies().expect("deps"),
            vec!["Lookup", "Role", "Secret"]
        );

        let fields = spec.referencing_fields().expect("fields");
        assert_eq!(fields.len(), 3);
        assert!(fields["auth"].contains("Secret"));
    }

    #[test]
    fn test_literal_is_not_a_reference() {
        let value = json!({
            "password": literal("pa${ss"),
            "payload": json_string(json!({"password": literal("${Db.endpoint}"), "id": "${Secret.id}"})),
        });
        assert_eq!(references("X", &value).expect("refs"), vec![Reference {
            resource: String::from("Secret"),
            output: String::from("id"),
        }]);

        let resolved = resolve_inputs("X", &value, &lookup).expect("resolve");
        assert_eq!(resolved["password"], json!("pa${ss"));
        let payload: Value =
            serde_json::from_str(resolved["payload"].as_str().expect("string")).expect("json");
        assert_eq!(payload, json!({"password": "${Db.endpoint}", "id": "secret-1"}));
    }

    #[test]
    fn test_escape_literals_wraps_only_dollar_braces() {
        let escaped = escape_literals(json!({"a": "plain", "b": ["x${y", 3], "c": literal("${z")}));
        assert_eq!(escaped["a"], json!("plain"));
        assert_eq!(escaped["b"][0], literal("x${y"));
        assert_eq!(escaped["c"], literal("${z"));
        assert!(references("X", &escaped).expect("refs").is_empty());
        assert_eq!(as_text(&escaped["b"][0]), Some("x${y"));
        assert_eq!(as_text(&escaped["a"]), Some("plain"));
    }

    #[test]
    fn test_reference_display() {
        assert_eq!(reference("Db", "endpoint"), "${Db.endpoint}");
        let r = Reference {
            resource: String::from("Db"),
            output: String::from("id"),
        };
        assert_eq!(r.to_string(), "${Db.id}");
    }
}
