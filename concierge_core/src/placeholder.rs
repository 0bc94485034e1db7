//! Typed and literal placeholder substitution.
//!
//! Shell arguments, URLs, path/query params, and headers use *literal* mode:
//! `<hostname>` and `<param>` are replaced with the plain string form of the
//! value. JSON payload bodies in `json_only` mode use *typed* placeholders
//! (`<string_name>`, `<number_name>`, ...) so that a substituted value can
//! never alter the surrounding JSON structure — each substitution always
//! emits exactly one well-formed JSON token.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::error::ConciergeError;

/// Renders a literal-mode template: `<hostname>` then each `<key>` in `params`.
///
/// Mirrors the source behavior of only ever touching string inputs; a
/// non-string `value` passed through this function is returned unchanged.
pub fn literal_expand(template: &Value, hostname: &str, params: &HashMap<String, Value>) -> Value {
    let Value::String(s) = template else {
        return template.clone();
    };

    let mut out = s.replace("<hostname>", hostname);
    for (key, value) in params {
        let needle = format!("<{key}>");
        if out.contains(&needle) {
            out = out.replace(&needle, &value_to_literal(value));
        }
    }
    Value::String(out)
}

/// Same as [`literal_expand`] but operating directly on a `&str`, for callers
/// (URL, shell argv, header values) that never deal in `serde_json::Value`.
pub fn literal_expand_str(template: &str, hostname: &str, params: &HashMap<String, Value>) -> String {
    match literal_expand(&Value::String(template.to_string()), hostname, params) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn value_to_literal(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Matches `<type_name>` where `type` is one of the five recognized tags.
fn placeholder_regex() -> Regex {
    Regex::new(r"<(string|number|boolean|json|array)_([A-Za-z0-9_]+)>").expect("static regex")
}

/// Expands typed placeholders inside a JSON payload template and validates
/// that the result parses as JSON (Invariant 3, §8 of the design document).
///
/// Each `<T_name>` is replaced in turn by a single JSON token built from
/// `params[name]`, interpreted according to `T`. Unknown `T` prefixes (the
/// regex itself only matches the five recognized ones) are left untouched,
/// and any `<name>` placeholder with no matching parameter is left in place
/// — which, per Invariant 3, causes the final JSON parse to fail.
pub fn json_expand(
    template: &str,
    hostname: &str,
    params: &HashMap<String, Value>,
) -> Result<String, ConciergeError> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let kind = &caps[1];
        let name = &caps[2];
        let key = format!("{kind}_{name}");

        if name == "hostname" && kind == "string" {
            out.push_str(&serde_json::to_string(hostname).expect("string always serializes"));
            continue;
        }

        let Some(value) = params.get(name) else {
            // No matching parameter: leave the placeholder verbatim. The
            // final JSON parse below will reject it.
            out.push_str(whole.as_str());
            continue;
        };

        let token = render_typed_token(kind, &key, value)?;
        out.push_str(&token);
    }
    out.push_str(&template[last..]);

    serde_json::from_str::<Value>(&out).map_err(|e| ConciergeError::ResultNotJson(e.to_string()))?;
    Ok(out)
}

fn render_typed_token(kind: &str, key: &str, value: &Value) -> Result<String, ConciergeError> {
    match kind {
        "string" => Ok(serde_json::to_string(&value_to_string(value, key)?).expect("string serializes")),
        "number" => render_number(key, value),
        "boolean" => render_boolean(key, value),
        "json" => render_json_object(key, value),
        "array" => render_json_array(key, value),
        other => Err(ConciergeError::PlaceholderInvalid {
            key: key.to_string(),
            reason: format!("unknown placeholder type '{other}'"),
        }),
    }
}

fn value_to_string(value: &Value, key: &str) -> Result<String, ConciergeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConciergeError::PlaceholderInvalid {
            key: key.to_string(),
            reason: format!("{other} cannot be converted to string"),
        }),
    }
}

fn render_number(key: &str, value: &Value) -> Result<String, ConciergeError> {
    let invalid = || ConciergeError::PlaceholderInvalid {
        key: key.to_string(),
        reason: "cannot be converted to number".to_string(),
    };

    match value {
        Value::Bool(_) => Err(invalid()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.contains('.') {
                trimmed.parse::<f64>().map(|f| f.to_string()).map_err(|_| invalid())
            } else {
                trimmed
                    .parse::<i64>()
                    .map(|i| i.to_string())
                    .or_else(|_| trimmed.parse::<f64>().map(|f| f.to_string()))
                    .map_err(|_| invalid())
            }
        }
        _ => Err(invalid()),
    }
}

fn render_boolean(key: &str, value: &Value) -> Result<String, ConciergeError> {
    let invalid = || ConciergeError::PlaceholderInvalid {
        key: key.to_string(),
        reason: "cannot be converted to boolean".to_string(),
    };

    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            if ["true", "1", "yes"].contains(&lower.as_str()) {
                Ok("true".to_string())
            } else if ["false", "0", "no"].contains(&lower.as_str()) {
                Ok("false".to_string())
            } else {
                Err(invalid())
            }
        }
        Value::Number(n) if n.as_i64() == Some(0) => Ok("false".to_string()),
        Value::Number(n) if n.as_i64() == Some(1) => Ok("true".to_string()),
        _ => Err(invalid()),
    }
}

fn render_json_object(key: &str, value: &Value) -> Result<String, ConciergeError> {
    match value {
        Value::Object(_) => Ok(serde_json::to_string(value).expect("object serializes")),
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s).map_err(|_| ConciergeError::PlaceholderInvalid {
                key: key.to_string(),
                reason: format!("'{s}' is not valid JSON"),
            })?;
            if parsed.is_object() {
                Ok(serde_json::to_string(&parsed).expect("object serializes"))
            } else {
                Err(ConciergeError::PlaceholderInvalid {
                    key: key.to_string(),
                    reason: "Must be a JSON object".to_string(),
                })
            }
        }
        _ => Err(ConciergeError::PlaceholderInvalid {
            key: key.to_string(),
            reason: "Must be a JSON object".to_string(),
        }),
    }
}

fn render_json_array(key: &str, value: &Value) -> Result<String, ConciergeError> {
    match value {
        Value::Array(_) => Ok(serde_json::to_string(value).expect("array serializes")),
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s).map_err(|_| ConciergeError::PlaceholderInvalid {
                key: key.to_string(),
                reason: format!("'{s}' is not valid JSON array"),
            })?;
            if parsed.is_array() {
                Ok(serde_json::to_string(&parsed).expect("array serializes"))
            } else {
                Err(ConciergeError::PlaceholderInvalid {
                    key: key.to_string(),
                    reason: "Must be a JSON array".to_string(),
                })
            }
        }
        _ => Err(ConciergeError::PlaceholderInvalid {
            key: key.to_string(),
            reason: "Must be a JSON array".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn string_placeholder_is_escaped() {
        let out = json_expand(
            r#"{"name": <string_name>}"#,
            "host1",
            &params(&[("name", json!("test-service"))]),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["name"], "test-service");
    }

    #[test]
    fn string_placeholder_prevents_injection() {
        let malicious = r#"", "injected": "value"}"#;
        let out = json_expand(
            r#"{"data": <string_data>}"#,
            "host1",
            &params(&[("data", json!(malicious))]),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert!(parsed.get("injected").is_none());
        assert_eq!(parsed["data"], malicious);
    }

    #[test]
    fn number_rejects_boolean() {
        let err = json_expand(
            r#"{"count": <number_count>}"#,
            "host1",
            &params(&[("count", json!(true))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be converted to number"));
    }

    #[test]
    fn number_from_numeric_string() {
        let out = json_expand(
            r#"{"port": <number_port>}"#,
            "host1",
            &params(&[("port", json!("8080"))]),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["port"], 8080);
    }

    #[test]
    fn boolean_from_string_variants() {
        for v in ["true", "True", "TRUE", "1", "yes", "Yes", "YES"] {
            let out = json_expand(
                r#"{"flag": <boolean_flag>}"#,
                "host1",
                &params(&[("flag", json!(v))]),
            )
            .unwrap();
            let parsed: Value = serde_json::from_str(&out).unwrap();
            assert_eq!(parsed["flag"], true);
        }
    }

    #[test]
    fn json_rejects_array() {
        let err = json_expand(
            r#"{"config": <json_config>}"#,
            "host1",
            &params(&[("config", json!([1, 2, 3]))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Must be a JSON object"));
    }

    #[test]
    fn array_from_string() {
        let out = json_expand(
            r#"{"items": <array_items>}"#,
            "host1",
            &params(&[("items", json!(r#"["item1", "item2", 3]"#))]),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["items"], json!(["item1", "item2", 3]));
    }

    #[test]
    fn missing_parameter_fails_final_parse() {
        let err = json_expand(r#"{"key": <string_value>}"#, "host1", &HashMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn case_sensitive_parameter_names() {
        let err = json_expand(
            r#"{"name": <string_Name>}"#,
            "host1",
            &params(&[("name", json!("test"))]),
        );
        assert!(err.is_err());
    }

    #[test]
    fn literal_mode_replaces_hostname_and_params() {
        let template = Value::String("ping -c1 <hostname> --tag <tag>".to_string());
        let out = literal_expand(&template, "h1", &params(&[("tag", json!("prod"))]));
        assert_eq!(out, Value::String("ping -c1 h1 --tag prod".to_string()));
    }

    #[test]
    fn literal_mode_passes_through_non_string() {
        let template = json!(42);
        let out = literal_expand(&template, "h1", &HashMap::new());
        assert_eq!(out, json!(42));
    }
}
