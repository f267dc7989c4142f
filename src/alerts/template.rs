//! Message templates for alert rules
//!
//! A template is plain text with `{field}` placeholders looked up in the
//! rule context (falling back to the rule parameters). `{field:.N}` formats
//! a numeric field with `N` decimals and `{{` / `}}` produce literal braces.

use crate::error::RuleError;
use crate::events::Details;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    text: String,
}

impl MessageTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Render against a context, using `params` for fields the context lacks
    ///
    /// # Errors
    ///
    /// `RuleError::MissingField` when a placeholder names a field found in
    /// neither map, `RuleError::InvalidTemplate` for unbalanced braces or a
    /// bad format spec, `RuleError::InvalidField` when a precision is applied
    /// to a non-numeric value.
    pub fn render(&self, context: &Details, params: &Details) -> Result<String, RuleError> {
        let mut out = String::with_capacity(self.text.len());
        let mut chars = self.text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut placeholder = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        placeholder.push(c);
                    }
                    if !closed {
                        return Err(RuleError::InvalidTemplate(format!(
                            "unclosed placeholder in '{}'",
                            self.text
                        )));
                    }
                    out.push_str(&Self::substitute(&placeholder, context, params)?);
                }
                '}' => {
                    return Err(RuleError::InvalidTemplate(format!(
                        "unmatched '}}' in '{}'",
                        self.text
                    )));
                }
                c => out.push(c),
            }
        }

        Ok(out)
    }

    fn substitute(placeholder: &str, context: &Details, params: &Details) -> Result<String, RuleError> {
        let (field, spec) = match placeholder.split_once(':') {
            Some((field, spec)) => (field.trim(), Some(spec.trim())),
            None => (placeholder.trim(), None),
        };
        if field.is_empty() {
            return Err(RuleError::InvalidTemplate(
                "empty placeholder".to_string(),
            ));
        }

        let value = context
            .get(field)
            .or_else(|| params.get(field))
            .ok_or_else(|| RuleError::MissingField(field.to_string()))?;

        match spec {
            None => Ok(display_value(value)),
            Some(spec) => {
                let precision = spec
                    .strip_prefix('.')
                    .and_then(|digits| digits.parse::<usize>().ok())
                    .ok_or_else(|| {
                        RuleError::InvalidTemplate(format!("unsupported format spec '{}'", spec))
                    })?;
                let number = value.as_f64().ok_or_else(|| RuleError::InvalidField {
                    field: field.to_string(),
                    reason: format!("expected a number, got {}", value),
                })?;
                Ok(format!("{:.*}", precision, number))
            }
        }
    }
}

impl From<&str> for MessageTemplate {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
