//! Variable templating for package manifests.
//!
//! Manifests embed `{{ .Dotted.Path }}` expressions in image references,
//! environment values, file contents, hook scripts, and post-install notes.
//! The namespace is a JSON object built up in layers: the manager binds
//! context-level variables, the package engine binds package/path variables,
//! and individual steps bind step-local extras.
//!
//! Conditions on install steps use a small expression form: a dotted path
//! (truthiness), `not <path>`, or `eq`/`ne` with two operands. A missing
//! path renders falsy in conditions but is an error in `render`, where a
//! silently empty expansion would corrupt the produced artifact.

use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Immutable template namespace with rendering and condition evaluation.
///
/// `with_vars` returns a new engine layering extra variables over the
/// current ones (top-level keys replace), so callers can fork a namespace
/// for a package or step without mutating the parent.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    vars: Map<String, Value>,
}

impl TemplateEngine {
    /// Creates an engine with the given base variables.
    ///
    /// Non-object values are treated as an empty namespace.
    #[must_use]
    pub fn new(base: Value) -> Self {
        Self {
            vars: into_map(base),
        }
    }

    /// Returns a new engine with `extra` layered over the current variables.
    #[must_use]
    pub fn with_vars(&self, extra: Value) -> Self {
        let mut vars = self.vars.clone();
        for (k, v) in into_map(extra) {
            vars.insert(k, v);
        }
        Self { vars }
    }

    /// Renders a template body, substituting `{{ .Path }}` expressions.
    pub fn render(&self, body: &str, extra: Option<&Value>) -> Result<String> {
        let mut out = String::with_capacity(body.len());
        let mut rest = body;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                Error::Template(format!("unclosed expression in template: {body:?}"))
            })?;
            let expr = after[..end].trim();
            let value = self.lookup_expr(expr, extra)?.ok_or_else(|| {
                Error::Template(format!("unknown template variable: {expr}"))
            })?;
            out.push_str(&scalar_to_string(&value, expr)?);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Evaluates an install step condition.
    ///
    /// Supported forms: `.Path`, `not .Path`, `eq <a> <b>`, `ne <a> <b>`,
    /// where operands are dotted paths or literals.
    pub fn evaluate_condition(&self, condition: &str, extra: Option<&Value>) -> Result<bool> {
        let tokens: Vec<&str> = condition.split_whitespace().collect();
        match tokens.as_slice() {
            [path] => Ok(truthy(self.lookup_operand(path, extra)?.as_ref())),
            ["not", path] => Ok(!truthy(self.lookup_operand(path, extra)?.as_ref())),
            [op @ ("eq" | "ne"), a, b] => {
                let lhs = self.lookup_operand(a, extra)?;
                let rhs = self.lookup_operand(b, extra)?;
                let equal = match (lhs, rhs) {
                    (Some(l), Some(r)) => values_equal(&l, &r),
                    _ => false,
                };
                Ok(if *op == "eq" { equal } else { !equal })
            }
            _ => Err(Error::Template(format!(
                "unsupported condition expression: {condition:?}"
            ))),
        }
    }

    /// Resolves an expression that must be a dotted path.
    fn lookup_expr(&self, expr: &str, extra: Option<&Value>) -> Result<Option<Value>> {
        if !expr.starts_with('.') {
            return Err(Error::Template(format!(
                "expected variable path, got: {expr:?}"
            )));
        }
        Ok(self.lookup_path(expr, extra))
    }

    /// Resolves a condition operand: a dotted path or a literal.
    fn lookup_operand(&self, operand: &str, extra: Option<&Value>) -> Result<Option<Value>> {
        if operand.starts_with('.') {
            return Ok(self.lookup_path(operand, extra));
        }
        // Literal operand
        let value = if operand == "true" {
            Value::Bool(true)
        } else if operand == "false" {
            Value::Bool(false)
        } else if let Some(stripped) = operand
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
        {
            Value::String(stripped.to_string())
        } else if let Ok(n) = operand.parse::<i64>() {
            Value::Number(n.into())
        } else {
            Value::String(operand.to_string())
        };
        Ok(Some(value))
    }

    /// Walks a `.A.B.C` path through extra vars first, then base vars.
    fn lookup_path(&self, path: &str, extra: Option<&Value>) -> Option<Value> {
        let segments: Vec<&str> = path
            .trim_start_matches('.')
            .split('.')
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            return None;
        }
        if let Some(extra) = extra
            && let Some(found) = walk(extra, &segments)
        {
            return Some(found.clone());
        }
        let root = self.vars.get(segments[0])?;
        walk(root, &segments[1..]).cloned()
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn walk<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut cur = root;
    for segment in segments {
        cur = cur.as_object()?.get(*segment)?;
    }
    Some(cur)
}

fn scalar_to_string(value: &Value, expr: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(Error::Template(format!(
            "template variable {expr} is not a scalar"
        ))),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    // Allow comparing a number against its string form, which comes up when
    // manifests compare template vars against bare literals.
    if lhs == rhs {
        return true;
    }
    match (lhs, rhs) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s == &n.to_string()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(json!({
            "Package": {
                "Name": "pkgA-1.0.3-default",
                "ShortName": "pkgA",
                "Options": { "metrics": true, "tracing": false },
            },
            "Context": { "Network": "preprod", "NetworkMagic": 1 },
        }))
    }

    #[test]
    fn test_render_paths() {
        let engine = engine();
        let out = engine
            .render("image-{{ .Package.ShortName }}:{{ .Context.NetworkMagic }}", None)
            .unwrap();
        assert_eq!(out, "image-pkgA:1");
    }

    #[test]
    fn test_render_unknown_path_fails() {
        let engine = engine();
        assert!(engine.render("{{ .Nope.Missing }}", None).is_err());
    }

    #[test]
    fn test_render_extra_vars_take_precedence() {
        let engine = engine();
        let extra = json!({ "Container": { "Name": "pkgA-1.0.3-default-node" } });
        let out = engine
            .render("{{ .Container.Name }}", Some(&extra))
            .unwrap();
        assert_eq!(out, "pkgA-1.0.3-default-node");
    }

    #[test]
    fn test_with_vars_layers() {
        let engine = engine().with_vars(json!({ "Context": { "Network": "preview" } }));
        let out = engine.render("{{ .Context.Network }}", None).unwrap();
        assert_eq!(out, "preview");
    }

    #[test]
    fn test_condition_truthiness() {
        let engine = engine();
        assert!(engine
            .evaluate_condition(".Package.Options.metrics", None)
            .unwrap());
        assert!(!engine
            .evaluate_condition(".Package.Options.tracing", None)
            .unwrap());
        // Missing paths are falsy, not an error
        assert!(!engine.evaluate_condition(".Package.Options.nope", None).unwrap());
        assert!(engine
            .evaluate_condition("not .Package.Options.tracing", None)
            .unwrap());
    }

    #[test]
    fn test_condition_eq() {
        let engine = engine();
        assert!(engine
            .evaluate_condition("eq .Context.Network preprod", None)
            .unwrap());
        assert!(engine
            .evaluate_condition("ne .Context.Network mainnet", None)
            .unwrap());
        assert!(engine
            .evaluate_condition("eq .Context.NetworkMagic 1", None)
            .unwrap());
    }

    #[test]
    fn test_condition_unsupported_form_fails() {
        let engine = engine();
        assert!(engine.evaluate_condition("lt .A .B 3 4", None).is_err());
    }
}
