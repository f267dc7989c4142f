/// Alert records and lifecycle transitions
pub mod alert;
/// Alert store, rule engine and auto-resolve sweep
pub mod alert_manager;
/// Rule trait and built-in rules
pub mod rules;
/// Message templates for rule-generated alerts
pub mod template;

pub use alert::{Alert, AlertQuery, AlertRequest, AlertStatus, AUTO_RESOLVE_ACTOR};
pub use alert_manager::{AlertCallback, AlertManager};
pub use rules::{
    default_rules, number_field, AlertRule, Comparison, PredicateRule, RuleContext, ThresholdRule,
    CLIENT_INACTIVE_RULE, HIGH_CPU_RULE, HIGH_MEMORY_RULE,
};
pub use template::MessageTemplate;
