//! JSON path lookup, `{{path}}` templates, and declarative rule checks
//! shared by the system and external workers.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::errors::StepError;
use crate::domain::models::{RuleCheck, ValidationRule};

/// Look up a dotted path (`steps.lookup.items.0.id`). Numeric segments index
/// into arrays. An empty path returns the root.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// If `expr` is exactly one placeholder, the path inside it.
fn sole_placeholder(expr: &str) -> Option<&str> {
    let inner = expr.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render every `{{path}}` placeholder in `template` against `scope`.
///
/// A placeholder naming a missing path is a validation error.
pub fn render_template(template: &str, scope: &Value) -> Result<String, StepError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| StepError::Validation(format!("unterminated placeholder in '{template}'")))?;
        let path = after[..end].trim();
        let value = resolve_path(scope, path)
            .ok_or_else(|| StepError::Validation(format!("template references missing value '{path}'")))?;
        out.push_str(&display_value(value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Evaluate a mapping expression. A lone placeholder yields the referenced
/// value with its JSON type intact; anything else renders as a string.
pub fn evaluate_expression(expr: &str, scope: &Value) -> Result<Value, StepError> {
    match sole_placeholder(expr) {
        Some(path) => resolve_path(scope, path)
            .cloned()
            .ok_or_else(|| StepError::Validation(format!("mapping references missing value '{path}'"))),
        None => render_template(expr, scope).map(Value::String),
    }
}

/// Build an object from `field -> expression` pairs.
pub fn apply_mapping(mapping: &BTreeMap<String, String>, scope: &Value) -> Result<Value, StepError> {
    let mut out = serde_json::Map::with_capacity(mapping.len());
    for (field, expr) in mapping {
        out.insert(field.clone(), evaluate_expression(expr, scope)?);
    }
    Ok(Value::Object(out))
}

/// Render every string leaf of a JSON value as a template.
pub fn render_value(value: &Value, scope: &Value) -> Result<Value, StepError> {
    Ok(match value {
        Value::String(s) => evaluate_expression(s, scope)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_value(v, scope)?)))
                .collect::<Result<_, StepError>>()?,
        ),
        other => other.clone(),
    })
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

/// Check one rule; returns a violation message on failure. Rules other than
/// `required` pass when the field is absent.
fn check_rule(rule: &ValidationRule, root: &Value) -> Option<String> {
    let value = resolve_path(root, &rule.field).filter(|v| !v.is_null());
    let field = &rule.field;

    let Some(value) = value else {
        return matches!(rule.check, RuleCheck::Required).then(|| format!("{field} is required"));
    };

    match &rule.check {
        RuleCheck::Required => match value {
            Value::String(s) if s.trim().is_empty() => Some(format!("{field} is required")),
            _ => None,
        },
        RuleCheck::Type { expected } => {
            (!expected.matches(value)).then(|| format!("{field} must be of type {expected:?}"))
        }
        RuleCheck::Min { value: min } => match value.as_f64() {
            Some(n) if n >= *min => None,
            Some(n) => Some(format!("{field} must be >= {min}, got {n}")),
            None => Some(format!("{field} must be a number")),
        },
        RuleCheck::Max { value: max } => match value.as_f64() {
            Some(n) if n <= *max => None,
            Some(n) => Some(format!("{field} must be <= {max}, got {n}")),
            None => Some(format!("{field} must be a number")),
        },
        RuleCheck::MinLength { value: min } => match length_of(value) {
            Some(len) if len >= *min => None,
            Some(len) => Some(format!("{field} must have length >= {min}, got {len}")),
            None => Some(format!("{field} has no length")),
        },
        RuleCheck::MaxLength { value: max } => match length_of(value) {
            Some(len) if len <= *max => None,
            Some(len) => Some(format!("{field} must have length <= {max}, got {len}")),
            None => Some(format!("{field} has no length")),
        },
        RuleCheck::OneOf { values } => {
            (!values.contains(value)).then(|| format!("{field} must be one of {}", Value::from(values.clone())))
        }
        RuleCheck::Equals { value: expected } => {
            (value != expected).then(|| format!("{field} must equal {expected}"))
        }
    }
}

/// Evaluate all rules, collecting every violation into one validation error.
pub fn validate_rules(rules: &[ValidationRule], root: &Value) -> Result<(), StepError> {
    let violations: Vec<String> = rules.iter().filter_map(|r| check_rule(r, root)).collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Validation(violations.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::JsonType;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "input": {"vendor": "Acme", "amount": 250, "tags": ["a", "b"]},
            "steps": {"lookup": {"items": [{"id": "v-1"}]}}
        })
    }

    #[test]
    fn test_resolve_path() {
        let s = scope();
        assert_eq!(resolve_path(&s, "input.vendor"), Some(&json!("Acme")));
        assert_eq!(resolve_path(&s, "steps.lookup.items.0.id"), Some(&json!("v-1")));
        assert_eq!(resolve_path(&s, "input.missing"), None);
        assert_eq!(resolve_path(&s, "input.tags.9"), None);
        assert_eq!(resolve_path(&s, ""), Some(&s));
    }

    #[test]
    fn test_render_template() {
        let s = scope();
        assert_eq!(
            render_template("Pay {{ input.vendor }} ${{input.amount}}", &s).unwrap(),
            "Pay Acme $250"
        );
        assert!(render_template("{{input.nope}}", &s).is_err());
        assert!(render_template("{{input.vendor", &s).is_err());
        assert_eq!(render_template("no placeholders", &s).unwrap(), "no placeholders");
    }

    #[test]
    fn test_mapping_keeps_types_for_lone_placeholders() {
        let mapping = BTreeMap::from([
            ("amount".to_string(), "{{input.amount}}".to_string()),
            ("label".to_string(), "vendor {{input.vendor}}".to_string()),
            ("tags".to_string(), "{{ input.tags }}".to_string()),
        ]);
        let out = apply_mapping(&mapping, &scope()).unwrap();
        assert_eq!(out, json!({"amount": 250, "label": "vendor Acme", "tags": ["a", "b"]}));
    }

    #[test]
    fn test_render_value_recurses() {
        let body = json!({"name": "{{input.vendor}}", "meta": [{"n": "{{input.amount}}"}], "fixed": 1});
        assert_eq!(
            render_value(&body, &scope()).unwrap(),
            json!({"name": "Acme", "meta": [{"n": 250}], "fixed": 1})
        );
    }

    #[test]
    fn test_validate_rules_collects_violations() {
        let rules = vec![
            ValidationRule {
                field: "input.vendor".into(),
                check: RuleCheck::Required,
            },
            ValidationRule {
                field: "input.amount".into(),
                check: RuleCheck::Max { value: 100.0 },
            },
            ValidationRule {
                field: "input.tags".into(),
                check: RuleCheck::Type {
                    expected: JsonType::Array,
                },
            },
            ValidationRule {
                field: "input.currency".into(),
                check: RuleCheck::Required,
            },
            ValidationRule {
                field: "input.optional".into(),
                check: RuleCheck::MinLength { value: 3 },
            },
        ];

        let err = validate_rules(&rules, &scope()).unwrap_err();
        let StepError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert!(msg.contains("input.amount must be <= 100"));
        assert!(msg.contains("input.currency is required"));
        assert!(!msg.contains("input.optional"));
        assert!(!msg.contains("input.tags"));
    }

    #[test]
    fn test_one_of_and_equals() {
        let root = json!({"status": "approved"});
        let ok = vec![ValidationRule {
            field: "status".into(),
            check: RuleCheck::OneOf {
                values: vec![json!("approved"), json!("pending")],
            },
        }];
        assert!(validate_rules(&ok, &root).is_ok());

        let bad = vec![ValidationRule {
            field: "status".into(),
            check: RuleCheck::Equals { value: json!("rejected") },
        }];
        assert!(validate_rules(&bad, &root).is_err());
    }
}
