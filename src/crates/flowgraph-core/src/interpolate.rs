//! `{{...}}` template interpolation.
//!
//! The template token grammar, eager and fail-closed:
//!
//! ```text
//! token   = '{{' ws? ident ( '.' segment | '[' uint ']' )* ws? '}}'
//! ident   = [A-Za-z_][A-Za-z0-9_]*
//! segment = ident
//! ```
//!
//! Anything that does not match is a literal. Resolution roots, in order:
//!
//! 1. `inputs` - the workflow-level input tree (`{{inputs.user.email}}`)
//! 2. a node ID followed by `.output` - that node's stored output
//!    (`{{fetch.output.items[0].id}}`)
//! 3. otherwise - a variable name, walked by the remaining segments
//!
//! A leaf whose *entire* string is one token becomes the referenced value
//! with its type preserved; tokens embedded in surrounding text are
//! string-coerced (scalars via display, composites as compact JSON).

use crate::context::{ContextSnapshot, OutputLookup};
use crate::error::{EngineError, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// One path step inside a template reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed `{{...}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub root: String,
    pub segments: Vec<Segment>,
}

impl TemplateRef {
    /// Whether this reference reads a node output, and which node.
    pub fn output_node(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(first)) if first == "output" && self.root != "inputs" => {
                Some(&self.root)
            }
            _ => None,
        }
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("template regex"))
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse the inside of a `{{...}}` token.
pub fn parse_reference(inner: &str) -> Result<TemplateRef> {
    let fail = |message: &str| EngineError::InterpolationFailed {
        template: format!("{{{{{inner}}}}}"),
        message: message.to_string(),
    };

    let body = inner.trim();
    if body.is_empty() {
        return Err(fail("empty reference"));
    }

    let mut rest = body;
    let root_end = rest
        .find(|c: char| c == '.' || c == '[')
        .unwrap_or(rest.len());
    let root = &rest[..root_end];
    if !is_ident(root) {
        return Err(fail("root must be an identifier"));
    }
    rest = &rest[root_end..];

    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('.') {
            let end = stripped
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(stripped.len());
            let key = &stripped[..end];
            if !is_ident(key) {
                return Err(fail("path segment must be an identifier"));
            }
            segments.push(Segment::Key(key.to_string()));
            rest = &stripped[end..];
        } else if let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']').ok_or_else(|| fail("unterminated index"))?;
            let digits = &stripped[..close];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(fail("index must be an unsigned integer"));
            }
            let index: usize = digits
                .parse()
                .map_err(|_| fail("index out of range"))?;
            segments.push(Segment::Index(index));
            rest = &stripped[close + 1..];
        } else {
            return Err(fail("unexpected character in path"));
        }
    }

    Ok(TemplateRef {
        root: root.to_string(),
        segments,
    })
}

fn walk<'a>(mut value: &'a Value, segments: &[Segment], full: &str) -> Result<&'a Value> {
    for segment in segments {
        value = match segment {
            Segment::Key(key) => value.get(key.as_str()),
            Segment::Index(index) => value.get(index),
        }
        .ok_or_else(|| EngineError::VariableNotFound {
            name: full.to_string(),
        })?;
    }
    Ok(value)
}

/// Resolve one parsed reference against a snapshot.
pub fn resolve(reference: &TemplateRef, snapshot: &ContextSnapshot) -> Result<Value> {
    let full = display_reference(reference);

    if reference.root == "inputs" {
        return walk(snapshot.inputs(), &reference.segments, &full).cloned();
    }

    match snapshot.lookup_output(&reference.root) {
        OutputLookup::Found(output) => {
            match reference.segments.first() {
                Some(Segment::Key(first)) if first == "output" => {
                    walk(output, &reference.segments[1..], &full).cloned()
                }
                _ => Err(EngineError::InterpolationFailed {
                    template: format!("{{{{{full}}}}}"),
                    message: "node references must go through '.output'".to_string(),
                }),
            }
        }
        OutputLookup::Pruned => Err(EngineError::OutputPruned {
            node_id: reference.root.clone(),
        }),
        OutputLookup::Missing => {
            let value = snapshot
                .get_variable(&reference.root)
                .ok_or_else(|| EngineError::VariableNotFound {
                    name: reference.root.clone(),
                })?;
            walk(value, &reference.segments, &full).cloned()
        }
    }
}

fn display_reference(reference: &TemplateRef) -> String {
    let mut out = reference.root.clone();
    for segment in &reference.segments {
        match segment {
            Segment::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Segment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

fn coerce_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => composite.to_string(),
    }
}

/// Interpolate one string leaf.
///
/// Returns the referenced value type-preserved when the whole string is a
/// single token, otherwise a string with every token substituted.
pub fn interpolate_string(text: &str, snapshot: &ContextSnapshot) -> Result<Value> {
    let re = token_regex();

    if let Some(captures) = re.captures(text) {
        let full_match = captures.get(0).expect("match group");
        if full_match.start() == 0 && full_match.end() == text.len() {
            let reference = parse_reference(&captures[1])?;
            return resolve(&reference, snapshot);
        }
    } else {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for captures in re.captures_iter(text) {
        let token = captures.get(0).expect("match group");
        out.push_str(&text[cursor..token.start()]);
        let reference = parse_reference(&captures[1])?;
        let value = resolve(&reference, snapshot)?;
        out.push_str(&coerce_to_text(&value));
        cursor = token.end();
    }
    out.push_str(&text[cursor..]);
    Ok(Value::String(out))
}

/// Interpolate every string leaf of a value tree.
pub fn interpolate_value(value: &Value, snapshot: &ContextSnapshot) -> Result<Value> {
    match value {
        Value::String(text) => interpolate_string(text, snapshot),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, snapshot)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate_value(item, snapshot)?);
            }
            Ok(Value::Object(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

/// Scan a config tree for template references.
///
/// Returns parsed references plus the raw text of every malformed token, so
/// the builder can fail closed at build time instead of at dispatch.
pub fn collect_template_refs(config: &Value) -> (Vec<TemplateRef>, Vec<String>) {
    let mut refs = Vec::new();
    let mut malformed = Vec::new();
    scan(config, &mut refs, &mut malformed);
    (refs, malformed)
}

fn scan(value: &Value, refs: &mut Vec<TemplateRef>, malformed: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for captures in token_regex().captures_iter(text) {
                match parse_reference(&captures[1]) {
                    Ok(reference) => refs.push(reference),
                    Err(_) => malformed.push(captures[0].to_string()),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                scan(item, refs, malformed);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                scan(item, refs, malformed);
            }
        }
        _ => {}
    }
}
