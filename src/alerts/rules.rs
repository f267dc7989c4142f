//! Alert rules
//!
//! A rule is a side-effect-free predicate over a context map paired with a
//! message template. The engine treats every rule through the [`AlertRule`]
//! trait and never special-cases a concrete rule type.

use crate::alerts::template::MessageTemplate;
use crate::config::StatusConfig;
use crate::error::RuleError;
use crate::events::{Category, Details, Severity};
use chrono::Duration;
use serde_json::Value;

/// Context a rule is evaluated against
pub type RuleContext = Details;

/// Rule id of the built-in inactivity rule
pub const CLIENT_INACTIVE_RULE: &str = "client_inactive";
/// Rule id of the built-in CPU load rule
pub const HIGH_CPU_RULE: &str = "high_cpu";
/// Rule id of the built-in memory load rule
pub const HIGH_MEMORY_RULE: &str = "high_memory";

/// Trait for rules evaluated by the alert engine
pub trait AlertRule: Send + Sync {
    /// Unique id used to enable, disable or remove the rule
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    fn category(&self) -> Category;

    fn severity(&self) -> Severity;

    /// Lifetime of alerts produced by this rule before they auto-resolve
    fn auto_resolve_after(&self) -> Option<Duration> {
        None
    }

    /// Whether the rule fires for this context
    fn evaluate(&self, context: &RuleContext) -> Result<bool, RuleError>;

    /// Alert message for a context the rule fired on
    fn render(&self, context: &RuleContext) -> Result<String, RuleError>;
}

/// Predicate signature used by [`PredicateRule`]: context, then rule parameters
pub type Predicate = Box<dyn Fn(&RuleContext, &Details) -> Result<bool, RuleError> + Send + Sync>;

/// Rule built from an arbitrary predicate closure and a message template
pub struct PredicateRule {
    id: String,
    name: String,
    category: Category,
    severity: Severity,
    params: Details,
    predicate: Predicate,
    template: MessageTemplate,
    auto_resolve_after: Option<Duration>,
}

impl PredicateRule {
    pub fn new<F>(
        id: impl Into<String>,
        name: impl Into<String>,
        category: Category,
        severity: Severity,
        template: impl Into<MessageTemplate>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&RuleContext, &Details) -> Result<bool, RuleError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            severity,
            params: Details::new(),
            predicate: Box::new(predicate),
            template: template.into(),
            auto_resolve_after: None,
        }
    }

    /// Parameters passed to the predicate and available to the template
    pub fn with_params(mut self, params: Details) -> Self {
        self.params = params;
        self
    }

    pub fn with_auto_resolve(mut self, after: Duration) -> Self {
        self.auto_resolve_after = Some(after);
        self
    }
}

impl AlertRule for PredicateRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        self.category.clone()
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn auto_resolve_after(&self) -> Option<Duration> {
        self.auto_resolve_after
    }

    fn evaluate(&self, context: &RuleContext) -> Result<bool, RuleError> {
        (self.predicate)(context, &self.params)
    }

    fn render(&self, context: &RuleContext) -> Result<String, RuleError> {
        self.template.render(context, &self.params)
    }
}

/// Comparison applied by [`ThresholdRule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Above,
    AtLeast,
    Below,
    AtMost,
}

impl Comparison {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::AtLeast => value >= threshold,
            Comparison::Below => value < threshold,
            Comparison::AtMost => value <= threshold,
        }
    }
}

/// Rule that fires when a numeric context field crosses a threshold
///
/// Contexts that do not carry the field are ignored; a field of the wrong
/// type is an evaluation error.
pub struct ThresholdRule {
    id: String,
    name: String,
    category: Category,
    severity: Severity,
    field: String,
    comparison: Comparison,
    threshold: f64,
    template: MessageTemplate,
    auto_resolve_after: Option<Duration>,
}

impl ThresholdRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: Category,
        severity: Severity,
        field: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        template: impl Into<MessageTemplate>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            severity,
            field: field.into(),
            comparison,
            threshold,
            template: template.into(),
            auto_resolve_after: None,
        }
    }

    pub fn with_auto_resolve(mut self, after: Duration) -> Self {
        self.auto_resolve_after = Some(after);
        self
    }

    fn params(&self) -> Details {
        let mut params = Details::new();
        params.insert("threshold".to_string(), Value::from(self.threshold));
        params.insert("field".to_string(), Value::from(self.field.clone()));
        params
    }
}

impl AlertRule for ThresholdRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        self.category.clone()
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn auto_resolve_after(&self) -> Option<Duration> {
        self.auto_resolve_after
    }

    fn evaluate(&self, context: &RuleContext) -> Result<bool, RuleError> {
        match number_field(context, &self.field)? {
            Some(value) => Ok(self.comparison.holds(value, self.threshold)),
            None => Ok(false),
        }
    }

    fn render(&self, context: &RuleContext) -> Result<String, RuleError> {
        self.template.render(context, &self.params())
    }
}

/// Read an optional numeric field from a context
///
/// # Errors
///
/// `RuleError::InvalidField` when the field is present but not a number.
pub fn number_field(context: &RuleContext, field: &str) -> Result<Option<f64>, RuleError> {
    match context.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| RuleError::InvalidField {
                field: field.to_string(),
                reason: format!("expected a number, got {}", value),
            }),
    }
}

/// Built-in rules registered at startup
pub fn default_rules(status: &StatusConfig) -> Vec<Box<dyn AlertRule>> {
    vec![
        Box::new(
            PredicateRule::new(
                CLIENT_INACTIVE_RULE,
                "Client inactive",
                Category::Connection,
                Severity::Medium,
                "Client {client_id} inactive for {idle_seconds}s",
                |context, _params| {
                    Ok(context.get("event").and_then(Value::as_str) == Some("client_inactive"))
                },
            )
            .with_auto_resolve(Duration::minutes(30)),
        ),
        Box::new(
            ThresholdRule::new(
                HIGH_CPU_RULE,
                "High CPU load",
                Category::Resource,
                Severity::High,
                "cpu_percent",
                Comparison::Above,
                status.cpu_alert_percent,
                "CPU load at {cpu_percent:.1}% exceeds {threshold:.1}%",
            )
            .with_auto_resolve(Duration::minutes(10)),
        ),
        Box::new(
            ThresholdRule::new(
                HIGH_MEMORY_RULE,
                "High memory load",
                Category::Resource,
                Severity::High,
                "memory_percent",
                Comparison::Above,
                status.memory_alert_percent,
                "Memory load at {memory_percent:.1}% exceeds {threshold:.1}%",
            )
            .with_auto_resolve(Duration::minutes(10)),
        ),
    ]
}
