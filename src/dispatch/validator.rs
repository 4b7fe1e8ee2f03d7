//! Declarative parameter validation for registered routes.
//!
//! Rules are registered per route pattern and applied in declaration order.
//! Validation is additive: fields not covered by any rule pass through
//! unmodified, and a path with no registered rules returns its input
//! unchanged. Coercion is idempotent — validating already-normalised data a
//! second time yields identical output.

use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// The kind of value a parameter rule expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Any value, stringified.
    String,
    /// Whole number; numeric strings are parsed.
    Integer,
    /// Floating-point number; numeric strings are parsed.
    Float,
    /// Boolean; accepts a fixed truthy/falsy token set.
    Boolean,
    /// Must already be a JSON array (no coercion).
    Array,
    /// Must already be a JSON object (no coercion).
    Object,
}

impl ParamKind {
    /// Returns the name used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Stable machine-readable validation failure codes.
///
/// Callers branch on these programmatically; the strings must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    /// A required field is absent and has no default.
    MissingRequiredParameter,
    /// The value could not be coerced to the declared kind.
    InvalidType,
    /// A numeric value violates a declared min/max bound.
    OutOfRange,
    /// The value is not a member of the declared allowed set.
    NotAllowed,
    /// A string value does not match the declared regex.
    PatternMismatch,
}

impl ValidationCode {
    /// Returns the stable wire token for this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingRequiredParameter => "MISSING_REQUIRED_PARAMETER",
            Self::InvalidType => "INVALID_TYPE",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::PatternMismatch => "PATTERN_MISMATCH",
        }
    }
}

/// A typed validation failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Human-readable description naming the offending field.
    pub message: String,
    /// Stable code for programmatic branching.
    pub code: ValidationCode,
}

impl ValidationError {
    fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

/// A single declarative rule for one named parameter.
#[derive(Debug, Clone)]
pub struct ParameterRule {
    /// Field name the rule applies to.
    pub name: String,
    /// Expected value kind.
    pub kind: ParamKind,
    /// Whether the field must be present (or defaulted).
    pub required: bool,
    /// Value substituted when the field is absent.
    pub default: Option<Value>,
    /// Inclusive lower bound for numeric values.
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric values.
    pub max: Option<f64>,
    /// Closed set of permitted values.
    pub allowed_values: Option<Vec<Value>>,
    /// Regex the (string) value must match.
    pub pattern: Option<Regex>,
}

impl ParameterRule {
    /// Creates a rule with only a name and kind; everything else defaults off.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            allowed_values: None,
            pattern: None,
        }
    }

    /// Marks the field as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the default substituted when the field is absent.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Sets the inclusive minimum for numeric values.
    #[must_use]
    pub const fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Sets the inclusive maximum for numeric values.
    #[must_use]
    pub const fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Restricts the value to a closed set.
    #[must_use]
    pub fn allowed(mut self, values: Vec<Value>) -> Self {
        self.allowed_values = Some(values);
        self
    }

    /// Requires string values to match a regex.
    #[must_use]
    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

/// Per-route declarative validator.
///
/// Rule sets are keyed by route pattern and applied in declaration order.
#[derive(Debug, Default)]
pub struct ParameterValidator {
    rules: IndexMap<String, Vec<ParameterRule>>,
}

impl ParameterValidator {
    /// Creates an empty validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the rule set for a route pattern.
    pub fn register_rules(&mut self, path: impl Into<String>, rules: Vec<ParameterRule>) {
        self.rules.insert(path.into(), rules);
    }

    /// Returns the number of registered rule sets.
    #[must_use]
    pub fn rule_set_count(&self) -> usize {
        self.rules.len()
    }

    /// Validates and normalises `data` against the rules registered for `path`.
    ///
    /// Fields without a rule pass through unmodified. A path with no
    /// registered rules returns the input unchanged.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] with a stable code on the first rule
    /// violation, in rule declaration order.
    pub fn validate(
        &self,
        path: &str,
        mut data: Map<String, Value>,
    ) -> Result<Map<String, Value>, ValidationError> {
        let Some(rules) = self.rules.get(path) else {
            return Ok(data);
        };

        for rule in rules {
            match data.get(&rule.name) {
                None => {
                    if rule.required {
                        return Err(ValidationError::new(
                            ValidationCode::MissingRequiredParameter,
                            format!("missing required parameter '{}'", rule.name),
                        ));
                    }
                    if let Some(default) = &rule.default {
                        data.insert(rule.name.clone(), default.clone());
                    }
                    // Absent and optional with no default: leave absent.
                    continue;
                }
                Some(value) => {
                    let coerced = coerce(rule, value)?;
                    check_range(rule, &coerced)?;
                    check_allowed(rule, &coerced)?;
                    check_pattern(rule, &coerced)?;
                    data.insert(rule.name.clone(), coerced);
                }
            }
        }

        Ok(data)
    }
}

/// Coerces `value` to the rule's declared kind.
fn coerce(rule: &ParameterRule, value: &Value) -> Result<Value, ValidationError> {
    let type_error = || {
        ValidationError::new(
            ValidationCode::InvalidType,
            format!("parameter '{}' must be a {}", rule.name, rule.kind.name()),
        )
    };

    match rule.kind {
        ParamKind::String => Ok(Value::String(stringify(value))),
        ParamKind::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => {
                // Float input: accept only exact integral values that fit in
                // an i64 (the cast would otherwise saturate silently).
                const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
                let f = n.as_f64().ok_or_else(type_error)?;
                if f.fract() == 0.0 && f >= -I64_LIMIT && f < I64_LIMIT {
                    #[allow(clippy::cast_possible_truncation)]
                    Ok(Value::Number(Number::from(f as i64)))
                } else {
                    Err(type_error())
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(Number::from(i)))
                .map_err(|_| type_error()),
            _ => Err(type_error()),
        },
        ParamKind::Float => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(type_error),
            _ => Err(type_error()),
        },
        ParamKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(type_error()),
            },
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            _ => Err(type_error()),
        },
        ParamKind::Array => {
            if value.is_array() {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    ValidationCode::InvalidType,
                    format!("parameter '{}' must be an array", rule.name),
                ))
            }
        }
        ParamKind::Object => {
            if value.is_object() {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    ValidationCode::InvalidType,
                    format!("parameter '{}' must be an object", rule.name),
                ))
            }
        }
    }
}

/// Stringifies a JSON value without quoting strings.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn check_range(rule: &ParameterRule, value: &Value) -> Result<(), ValidationError> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };

    if let Some(min) = rule.min {
        if n < min {
            return Err(ValidationError::new(
                ValidationCode::OutOfRange,
                format!("parameter '{}' must be >= {min}", rule.name),
            ));
        }
    }
    if let Some(max) = rule.max {
        if n > max {
            return Err(ValidationError::new(
                ValidationCode::OutOfRange,
                format!("parameter '{}' must be <= {max}", rule.name),
            ));
        }
    }
    Ok(())
}

fn check_allowed(rule: &ParameterRule, value: &Value) -> Result<(), ValidationError> {
    let Some(allowed) = &rule.allowed_values else {
        return Ok(());
    };

    if allowed.contains(value) {
        return Ok(());
    }

    let listing = allowed
        .iter()
        .map(stringify)
        .collect::<Vec<_>>()
        .join(", ");
    Err(ValidationError::new(
        ValidationCode::NotAllowed,
        format!("parameter '{}' must be one of {{{listing}}}", rule.name),
    ))
}

fn check_pattern(rule: &ParameterRule, value: &Value) -> Result<(), ValidationError> {
    let Some(pattern) = &rule.pattern else {
        return Ok(());
    };

    let text = match value {
        Value::String(s) => s.clone(),
        other => stringify(other),
    };

    if pattern.is_match(&text) {
        Ok(())
    } else {
        Err(ValidationError::new(
            ValidationCode::PatternMismatch,
            format!("parameter '{}' does not match required pattern", rule.name),
        ))
    }
}
