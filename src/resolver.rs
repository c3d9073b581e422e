//! Reference Resolver.
//!
//! Expands `<block.field["key"].sub>`-style placeholders embedded inside
//! strings (or nested inside mappings/sequences) against the execution
//! context. A pure function over `&ExecutionContext` - it never mutates it.

use crate::engine::context::ExecutionContext;
use crate::model::normalize_name;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn candidate_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^<>]*>").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedReference {
    root: String,
    segments: Vec<String>,
}

/// Manually scans the body of a `<...>` candidate (without the angle
/// brackets) against the reference grammar, rather than relying on a single
/// regex capture group - this is the only way to handle bracket keys that
/// themselves contain dots, spaces, or punctuation.
fn parse_reference_body(body: &str) -> Option<ParsedReference> {
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    fn is_name_start(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }
    fn is_name_continue(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    if i >= chars.len() || !is_name_start(chars[i]) {
        return None;
    }
    let start = i;
    i += 1;
    while i < chars.len() && is_name_continue(chars[i]) {
        i += 1;
    }
    let root: String = chars[start..i].iter().collect();

    let mut segments = Vec::new();
    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                if i >= chars.len() || !is_name_start(chars[i]) {
                    return None;
                }
                let seg_start = i;
                i += 1;
                while i < chars.len() && is_name_continue(chars[i]) {
                    i += 1;
                }
                segments.push(chars[seg_start..i].iter().collect());
            }
            '[' => {
                i += 1;
                let quote = match chars.get(i) {
                    Some('"') => '"',
                    Some('\'') => '\'',
                    _ => return None,
                };
                i += 1;
                let key_start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return None;
                }
                let key: String = chars[key_start..i].iter().collect();
                if key.is_empty() {
                    return None;
                }
                i += 1; // closing quote
                if chars.get(i) != Some(&']') {
                    return None;
                }
                i += 1;
                segments.push(key);
            }
            _ => return None,
        }
    }

    Some(ParsedReference { root, segments })
}

struct Match {
    full_text: String,
    reference: ParsedReference,
    start: usize,
    end: usize,
}

fn find_references(s: &str) -> Vec<Match> {
    let mut matches = Vec::new();
    for m in candidate_pattern().find_iter(s) {
        let body = &m.as_str()[1..m.as_str().len() - 1];
        if let Some(reference) = parse_reference_body(body) {
            matches.push(Match {
                full_text: m.as_str().to_string(),
                reference,
                start: m.start(),
                end: m.end(),
            });
        }
    }
    matches
}

fn lookup_root(name: &str, ctx: &ExecutionContext) -> Value {
    match name {
        "start" => Value::Object(ctx.inputs.clone()),
        "variable" => Value::Object(ctx.workflow_variables.clone()),
        _ => {
            let normalized = normalize_name(name);
            ctx.block_outputs
                .get(&normalized)
                .or_else(|| ctx.block_outputs.get(name))
                .cloned()
                .unwrap_or(Value::Null)
        }
    }
}

fn walk_segments(mut current: Value, segments: &[String]) -> Value {
    for segment in segments {
        current = match &current {
            Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
            Value::Array(arr) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| arr.get(idx).cloned())
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    current
}

fn resolve_reference(reference: &ParsedReference, ctx: &ExecutionContext) -> Value {
    let root_value = lookup_root(&reference.root, ctx);
    walk_segments(root_value, &reference.segments)
}

/// Stringifies a resolved value for embedding inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).unwrap_or_default(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
    }
}

fn resolve_string(s: &str, ctx: &ExecutionContext) -> Value {
    let matches = find_references(s);
    if matches.is_empty() {
        return Value::String(s.to_string());
    }

    let trimmed = s.trim();
    if matches.len() == 1 && matches[0].full_text == trimmed {
        return resolve_reference(&matches[0].reference, ctx);
    }

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;
    for m in &matches {
        result.push_str(&s[last_end..m.start]);
        let resolved = resolve_reference(&m.reference, ctx);
        result.push_str(&stringify(&resolved));
        last_end = m.end;
    }
    result.push_str(&s[last_end..]);
    Value::String(result)
}

/// Renders a resolved value the way the function handler's reference
/// substitution does: as a literal the restricted interpreter's expression
/// grammar can parse back, not as display text. Distinct from [`stringify`]:
/// a string value becomes a quoted, escaped literal rather than its bare
/// contents, and numbers/bools/null use the same spellings the evaluator's
/// grammar accepts (`True`/`False`/`None`).
pub fn literal_render(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).unwrap_or_default(),
        Value::String(s) => {
            let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
            format!("'{escaped}'")
        }
    }
}

/// Substitutes every `<path>` reference inside `code` with a [`literal_render`]
/// of its resolved value, for the function handler's "resolve-then-execute"
/// contract (§4.3.5). Unlike [`resolve`], this never returns a raw `Value` -
/// the whole point is to produce a program text the restricted interpreter
/// can parse.
pub fn resolve_code_literals(code: &str, ctx: &ExecutionContext) -> String {
    let matches = find_references(code);
    if matches.is_empty() {
        return code.to_string();
    }
    let mut result = String::with_capacity(code.len());
    let mut last_end = 0;
    for m in &matches {
        result.push_str(&code[last_end..m.start]);
        let resolved = resolve_reference(&m.reference, ctx);
        result.push_str(&literal_render(&resolved));
        last_end = m.end;
    }
    result.push_str(&code[last_end..]);
    result
}

/// Recursively resolves every embedded reference inside `value`.
pub fn resolve(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, ctx)).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, ctx));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_block_output(name: &str, output: Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Map::new(), Map::new());
        ctx.store_output(name, &normalize_name(name), output);
        ctx
    }

    #[test]
    fn whole_string_reference_returns_raw_value() {
        let ctx = ctx_with_block_output("x", json!({"y": 42}));
        let resolved = resolve(&json!("<x.y>"), &ctx);
        assert_eq!(resolved, json!(42));
    }

    #[test]
    fn embedded_reference_is_stringified() {
        let ctx = ctx_with_block_output("x", json!({"y": 42}));
        let resolved = resolve(&json!("value is <x.y> exactly"), &ctx);
        assert_eq!(resolved, json!("value is 42 exactly"));
    }

    #[test]
    fn bracket_key_with_spaces_resolves() {
        let ctx = ctx_with_block_output("x", json!({"my key": "hi"}));
        let resolved = resolve(&json!("<x[\"my key\"]>"), &ctx);
        assert_eq!(resolved, json!("hi"));
    }

    #[test]
    fn missing_reference_resolves_to_null() {
        let ctx = ExecutionContext::new(Map::new(), Map::new());
        let resolved = resolve(&json!("<missing.field>"), &ctx);
        assert_eq!(resolved, Value::Null);
    }

    #[test]
    fn embedded_null_stringifies_as_literal_null() {
        let ctx = ExecutionContext::new(Map::new(), Map::new());
        let resolved = resolve(&json!("got <missing.field> back"), &ctx);
        assert_eq!(resolved, json!("got null back"));
    }

    #[test]
    fn start_and_variable_roots() {
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(5));
        let mut vars = Map::new();
        vars.insert("count".to_string(), json!(3));
        let ctx = ExecutionContext::new(inputs, vars);
        assert_eq!(resolve(&json!("<start.x>"), &ctx), json!(5));
        assert_eq!(resolve(&json!("<variable.count>"), &ctx), json!(3));
    }

    #[test]
    fn sequence_index_with_bounds_check() {
        let ctx = ctx_with_block_output("x", json!({"items": [10, 20, 30]}));
        assert_eq!(resolve(&json!("<x.items[\"1\"]>"), &ctx), json!(20));
        assert_eq!(resolve(&json!("<x.items[\"9\"]>"), &ctx), Value::Null);
    }
}
