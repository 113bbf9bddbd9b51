//! Argument validation against a tool's JSON schema.
//!
//! Covers the subset of JSON Schema that tool definitions use in practice:
//! `type` (single or list), `properties`, `required`, `default`, `enum`,
//! `items`, `additionalProperties: false`, `minimum`/`maximum` and
//! `minLength`/`maxLength`. Validation also normalizes: defaults are filled
//! in and values are coerced between string, number and boolean when the
//! conversion is lossless (models often send `"5"` for `5`).

use serde_json::{Map, Number, Value};

/// All problems found in one argument set.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub issues: Vec<String>,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.issues.join("; "))
    }
}

impl std::error::Error for ValidationFailure {}

/// Validate `args` against `schema`, returning normalized arguments.
///
/// `null` arguments are treated as an empty object. A bare string is parsed
/// as JSON first, since some providers double-encode arguments.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<Value, ValidationFailure> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                return Err(ValidationFailure {
                    issues: vec!["arguments must be a JSON object".to_string()],
                })
            }
        },
        other => other.clone(),
    };

    let mut issues = Vec::new();
    let normalized = check(&args, schema, "$", &mut issues);
    if issues.is_empty() {
        Ok(normalized)
    } else {
        Err(ValidationFailure { issues })
    }
}

fn check(value: &Value, schema: &Value, path: &str, issues: &mut Vec<String>) -> Value {
    let Some(schema_obj) = schema.as_object() else {
        // `true`, `{}` or anything non-object accepts everything.
        return value.clone();
    };

    let types = allowed_types(schema_obj);
    let mut value = value.clone();

    if !types.is_empty() && !types.iter().any(|t| matches_type(&value, t)) {
        match types.iter().find_map(|t| coerce(&value, t)) {
            Some(coerced) => value = coerced,
            None => {
                issues.push(format!(
                    "{}: expected {}, got {}",
                    path,
                    types.join(" or "),
                    type_name(&value)
                ));
                return value;
            }
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|v| v.as_array()) {
        if !allowed.contains(&value) {
            let options: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
            issues.push(format!(
                "{}: {} is not one of [{}]",
                path,
                value,
                options.join(", ")
            ));
        }
    }

    match &mut value {
        Value::Object(obj) => check_object(obj, schema_obj, path, issues),
        Value::Array(items) => {
            if let Some(item_schema) = schema_obj.get("items") {
                for (i, item) in items.iter_mut().enumerate() {
                    *item = check(item, item_schema, &format!("{}[{}]", path, i), issues);
                }
            }
        }
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(0.0);
            if let Some(min) = schema_obj.get("minimum").and_then(|v| v.as_f64()) {
                if n < min {
                    issues.push(format!("{}: {} is below minimum {}", path, n, min));
                }
            }
            if let Some(max) = schema_obj.get("maximum").and_then(|v| v.as_f64()) {
                if n > max {
                    issues.push(format!("{}: {} is above maximum {}", path, n, max));
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema_obj.get("minLength").and_then(|v| v.as_u64()) {
                if len < min {
                    issues.push(format!("{}: shorter than {} characters", path, min));
                }
            }
            if let Some(max) = schema_obj.get("maxLength").and_then(|v| v.as_u64()) {
                if len > max {
                    issues.push(format!("{}: longer than {} characters", path, max));
                }
            }
        }
        _ => {}
    }

    value
}

fn check_object(
    obj: &mut Map<String, Value>,
    schema: &Map<String, Value>,
    path: &str,
    issues: &mut Vec<String>,
) {
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(|v| v.as_object())
        .unwrap_or(&empty);

    for (name, prop_schema) in properties {
        if !obj.contains_key(name) {
            if let Some(default) = prop_schema.get("default") {
                obj.insert(name.clone(), default.clone());
            }
        }
    }

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !obj.contains_key(name) {
                issues.push(format!("{}: missing required field '{}'", path, name));
            }
        }
    }

    let forbid_extra = schema.get("additionalProperties") == Some(&Value::Bool(false));
    let keys: Vec<String> = obj.keys().cloned().collect();
    for key in keys {
        let child_path = format!("{}.{}", path, key);
        match properties.get(&key) {
            Some(prop_schema) => {
                if let Some(child) = obj.get(&key) {
                    let normalized = check(child, prop_schema, &child_path, issues);
                    obj.insert(key, normalized);
                }
            }
            None if forbid_extra => {
                issues.push(format!("{}: unexpected field", child_path));
            }
            None => {}
        }
    }
}

fn allowed_types(schema: &Map<String, Value>) -> Vec<String> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn matches_type(value: &Value, ty: &str) -> bool {
    match ty {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

/// Lossless conversion of `value` into `ty`, if one exists.
fn coerce(value: &Value, ty: &str) -> Option<Value> {
    match (ty, value) {
        ("integer", Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        ("integer", Value::Number(n)) => {
            let f = n.as_f64()?;
            (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then(|| Value::from(f as i64))
        }
        ("number", Value::String(s)) => {
            let f = s.trim().parse::<f64>().ok()?;
            Number::from_f64(f).map(Value::Number)
        }
        ("boolean", Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
        ("string", Value::Bool(b)) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
