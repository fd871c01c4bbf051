//! Playbook and Parameter Validation
//!
//! Everything here runs before the first step executes, so every error
//! raised is a fatal configuration error:
//!
//! - structural checks on the playbook itself
//! - type and validator checks on caller-supplied parameters
//! - credential resolution against the vault
//! - `{{ placeholder }}` substitution into step parameters

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use serde_json::Value;

use super::model::{ParameterType, ParameterValidator, Playbook, PlaybookParameter};
use crate::error::{OrchestratorError, Result};
use crate::execution::credentials::CredentialVault;

/// Parameter values keyed by name.
pub type Parameters = HashMap<String, Value>;

/// Validates the playbook structure.
///
/// Checks that the playbook has steps, every step id is non-empty and
/// unique, and no parameter is declared twice.
pub fn validate_playbook(playbook: &Playbook) -> Result<()> {
    if playbook.steps.is_empty() {
        return Err(OrchestratorError::PlaybookValidation(format!(
            "Playbook '{}' has no steps",
            playbook.name
        )));
    }

    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();
    for step in &playbook.steps {
        if step.id.trim().is_empty() {
            errors.push(format!("Step '{}' has an empty id", step.name));
            continue;
        }
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(format!("Duplicate step id: '{}'", step.id));
        }
        if step.timeout == 0 {
            warn!("Step '{}' has a zero timeout and will always time out", step.id);
        }
    }

    let mut seen_params = HashSet::new();
    for param in &playbook.parameters {
        if !seen_params.insert(param.name.as_str()) {
            errors.push(format!("Duplicate parameter: '{}'", param.name));
        }
    }

    if !errors.is_empty() {
        return Err(OrchestratorError::PlaybookValidation(errors.join("\n")));
    }

    debug!(
        "Playbook '{}' validated: {} steps, {} parameters",
        playbook.name,
        playbook.steps.len(),
        playbook.parameters.len()
    );
    Ok(())
}

/// Validates caller-supplied parameters against the playbook's declarations.
///
/// Every required parameter must be present (or defaulted) and every
/// present value must match its declared type and validator. Parameters the
/// playbook does not declare are accepted and logged.
pub fn validate_parameters(playbook: &Playbook, provided: &Parameters) -> Result<()> {
    for name in provided.keys() {
        if playbook.get_parameter(name).is_none() {
            info!(
                "Parameter '{}' is not declared by playbook '{}'; accepting it",
                name, playbook.name
            );
        }
    }

    for param in &playbook.parameters {
        match effective_value(param, provided) {
            Some(value) => {
                let normalized = coerce_value(param, value)?;
                check_validator(param, &normalized)?;
            }
            None if param.required => {
                return Err(OrchestratorError::MissingParameter {
                    parameter: param.name.clone(),
                });
            }
            None => {}
        }
    }

    Ok(())
}

/// Resolves the final parameter set for an execution.
///
/// Declared parameters take the provided value or the default; those with
/// neither are omitted. Non-empty credential parameters are replaced by the
/// credential looked up in the vault; a missing credential is fatal.
pub async fn preprocess_credential_parameters(
    playbook: &Playbook,
    provided: &Parameters,
    vault: &dyn CredentialVault,
) -> Result<Parameters> {
    let mut resolved: Parameters = provided
        .iter()
        .filter(|(name, _)| playbook.get_parameter(name).is_none())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    for param in &playbook.parameters {
        let Some(value) = effective_value(param, provided) else {
            continue;
        };
        let value = coerce_value(param, value)?;

        if param.param_type == ParameterType::Credential {
            let credential_name = value.as_str().unwrap_or_default().trim().to_string();
            if !credential_name.is_empty() {
                let credential = vault.get_credential(&credential_name).await?.ok_or_else(|| {
                    OrchestratorError::CredentialNotFound {
                        parameter: param.name.clone(),
                        credential: credential_name.clone(),
                    }
                })?;
                debug!(
                    "Resolved credential '{}' for parameter '{}'",
                    credential_name, param.name
                );
                resolved.insert(param.name.clone(), credential.to_parameter_value());
                continue;
            }
        }

        resolved.insert(param.name.clone(), value);
    }

    Ok(resolved)
}

/// Returns the provided value, falling back to the declared default.
fn effective_value<'a>(param: &'a PlaybookParameter, provided: &'a Parameters) -> Option<&'a Value> {
    provided
        .get(&param.name)
        .filter(|v| !v.is_null())
        .or(param.default.as_ref().filter(|v| !v.is_null()))
}

/// Checks a value against the declared type, normalizing string input.
///
/// Values arriving from the command line are strings, so numeric, boolean
/// and list parameters also accept strings that parse to the right kind.
fn coerce_value(param: &PlaybookParameter, value: &Value) -> Result<Value> {
    let invalid = |message: String| OrchestratorError::InvalidParameter {
        parameter: param.name.clone(),
        message,
    };

    match (param.param_type, value) {
        (ParameterType::String | ParameterType::File | ParameterType::Credential, Value::String(_)) => {
            Ok(value.clone())
        }
        (ParameterType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        (ParameterType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(format!("expected integer, got '{}'", s))),
        (ParameterType::Float, Value::Number(_)) => Ok(value.clone()),
        (ParameterType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| invalid(format!("expected number, got '{}'", s))),
        (ParameterType::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (ParameterType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(Value::Bool(true)),
            "false" | "no" | "0" | "off" => Ok(Value::Bool(false)),
            _ => Err(invalid(format!("expected boolean, got '{}'", s))),
        },
        (ParameterType::List, Value::Array(_)) => Ok(value.clone()),
        (ParameterType::List, Value::String(s)) => Ok(Value::Array(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        )),
        (expected, other) => Err(invalid(format!(
            "expected {}, got {}",
            expected,
            json_kind(other)
        ))),
    }
}

fn check_validator(param: &PlaybookParameter, value: &Value) -> Result<()> {
    let Some(validator) = &param.validator else {
        return Ok(());
    };
    let invalid = |message: String| OrchestratorError::InvalidParameter {
        parameter: param.name.clone(),
        message,
    };

    match validator {
        ParameterValidator::NonEmpty => {
            let empty = match value {
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => false,
            };
            if empty {
                return Err(invalid("value must not be empty".to_string()));
            }
        }
        ParameterValidator::Url => {
            let url = value.as_str().unwrap_or_default();
            let rest = url
                .strip_prefix("http://")
                .or_else(|| url.strip_prefix("https://"));
            if rest.map_or(true, str::is_empty) {
                return Err(invalid(format!("'{}' is not an http(s) URL", url)));
            }
        }
        ParameterValidator::Range { min, max } => {
            let number = value
                .as_f64()
                .ok_or_else(|| invalid("range check requires a number".to_string()))?;
            if min.is_some_and(|m| number < m) || max.is_some_and(|m| number > m) {
                return Err(invalid(format!(
                    "{} is outside the allowed range [{}, {}]",
                    number,
                    min.map_or("-inf".to_string(), |m| m.to_string()),
                    max.map_or("inf".to_string(), |m| m.to_string()),
                )));
            }
        }
        ParameterValidator::OneOf(choices) => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !choices.iter().any(|c| *c == text) {
                return Err(invalid(format!(
                    "'{}' is not one of: {}",
                    text,
                    choices.join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Substitutes `{{ name }}` and `{{ name.field }}` placeholders in step parameters.
///
/// A string consisting of a single placeholder takes the referenced value
/// as-is, keeping its JSON type. Placeholders embedded in longer strings are
/// rendered as text. Unresolved placeholders are left untouched.
pub fn substitute_placeholders(
    parameters: &HashMap<String, Value>,
    resolved: &Parameters,
) -> HashMap<String, Value> {
    parameters
        .iter()
        .map(|(key, value)| (key.clone(), substitute_value(value, resolved)))
        .collect()
}

fn substitute_value(value: &Value, resolved: &Parameters) -> Value {
    match value {
        Value::String(s) => substitute_string(s, resolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, resolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(text: &str, resolved: &Parameters) -> Value {
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") {
            if let Some(found) = lookup(inner.trim(), resolved) {
                return found.clone();
            }
        }
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start + 2..].find("}}") else {
            break;
        };
        let expr = rest[start + 2..start + 2 + end].trim();
        output.push_str(&rest[..start]);
        match lookup(expr, resolved) {
            Some(Value::String(s)) => output.push_str(s),
            Some(other) => output.push_str(&other.to_string()),
            None => {
                debug!("Unresolved placeholder '{{{{ {} }}}}'", expr);
                output.push_str(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = &rest[start + 2 + end + 2..];
    }
    output.push_str(rest);
    Value::String(output)
}

fn lookup<'a>(expr: &str, resolved: &'a Parameters) -> Option<&'a Value> {
    let mut parts = expr.split('.');
    let mut current = resolved.get(parts.next()?)?;
    for field in parts {
        current = current.get(field)?;
    }
    Some(current)
}
