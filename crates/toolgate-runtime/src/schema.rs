use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context as _;
use jsonschema::Validator;
use jsonschema::error::{TypeKind, ValidationErrorKind};
use serde_json::Value;

/// One flattened validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub expected: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

/// Pre-registered JSON Schema gate for tool arguments.
///
/// Schemas compile once at tool-registration time; `validate` is a map read
/// plus an engine pass. The engine reports every error (not just the first),
/// tolerates unknown keywords, and never coerces types.
pub struct SchemaValidator {
    validators: RwLock<HashMap<String, Arc<Validator>>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self {
            validators: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool_name: &str, schema: &Value) -> anyhow::Result<()> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .with_context(|| format!("compile schema for tool {tool_name}"))?;
        self.validators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_name.to_string(), Arc::new(validator));
        Ok(())
    }

    pub fn unregister(&self, tool_name: &str) {
        self.validators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_name);
    }

    /// Validate arguments against the tool's schema. Tools with no registered
    /// schema pass.
    pub fn validate(&self, tool_name: &str, args: &Value) -> ValidationOutcome {
        let validator = {
            let guard = self.validators.read().unwrap_or_else(|e| e.into_inner());
            guard.get(tool_name).cloned()
        };
        let Some(validator) = validator else {
            return ValidationOutcome {
                valid: true,
                errors: Vec::new(),
            };
        };

        if validator.is_valid(args) {
            return ValidationOutcome {
                valid: true,
                errors: Vec::new(),
            };
        }

        let errors = validator.iter_errors(args).map(|e| flatten(&e)).collect();
        ValidationOutcome {
            valid: false,
            errors,
        }
    }

    /// All error messages joined with `"; "`, or `Ok` when valid.
    pub fn validate_or_reject(&self, tool_name: &str, args: &Value) -> Result<(), String> {
        let outcome = self.validate(tool_name, args);
        if outcome.valid {
            return Ok(());
        }
        Err(outcome
            .errors
            .iter()
            .map(|i| i.message.clone())
            .collect::<Vec<_>>()
            .join("; "))
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn display_path(raw: &str) -> String {
    if raw.is_empty() {
        "/".to_string()
    } else {
        raw.to_string()
    }
}

fn type_kind_label(kind: &TypeKind) -> String {
    match kind {
        TypeKind::Single(t) => t.to_string(),
        TypeKind::Multiple(types) => {
            let mut labels: Vec<String> = (*types).into_iter().map(|t| t.to_string()).collect();
            labels.sort();
            labels.join(" or ")
        }
    }
}

fn value_label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten(error: &jsonschema::ValidationError<'_>) -> ValidationIssue {
    let path = display_path(&error.instance_path.to_string());
    match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = value_label(property);
            ValidationIssue {
                path,
                message: format!("Missing required property: {name}"),
                expected: Some(name),
            }
        }
        ValidationErrorKind::Type { kind } => {
            let expected = type_kind_label(kind);
            ValidationIssue {
                message: format!("Property {path} must be {expected}"),
                path,
                expected: Some(expected),
            }
        }
        ValidationErrorKind::Enum { options } => {
            let expected = match options.as_array() {
                Some(opts) => opts.iter().map(value_label).collect::<Vec<_>>().join(", "),
                None => options.to_string(),
            };
            ValidationIssue {
                message: format!("Property {path} must be one of: {expected}"),
                path,
                expected: Some(expected),
            }
        }
        ValidationErrorKind::Minimum { limit } => ValidationIssue {
            message: format!("Property {path} must be >= {limit}"),
            path,
            expected: Some(limit.to_string()),
        },
        ValidationErrorKind::Maximum { limit } => ValidationIssue {
            message: format!("Property {path} must be <= {limit}"),
            path,
            expected: Some(limit.to_string()),
        },
        ValidationErrorKind::MinLength { limit } => ValidationIssue {
            message: format!("Property {path} must have at least {limit} characters"),
            path,
            expected: Some(limit.to_string()),
        },
        ValidationErrorKind::MaxLength { limit } => ValidationIssue {
            message: format!("Property {path} must have at most {limit} characters"),
            path,
            expected: Some(limit.to_string()),
        },
        ValidationErrorKind::Pattern { pattern } => ValidationIssue {
            message: format!("Property {path} must match pattern {pattern}"),
            path,
            expected: Some(pattern.clone()),
        },
        ValidationErrorKind::AdditionalProperties { unexpected } => {
            let list = unexpected.join(", ");
            ValidationIssue {
                message: format!("Unexpected additional properties: {list}"),
                path,
                expected: None,
            }
        }
        _ => {
            let engine = error.to_string();
            let message = if engine.is_empty() {
                format!("Validation failed at {path}")
            } else {
                engine
            };
            ValidationIssue {
                path,
                message,
                expected: None,
            }
        }
    }
}
