//! Alert records and their lifecycle
//!
//! An alert starts OPEN. It may be ACKNOWLEDGED, and from either of those
//! states it ends RESOLVED (by an operator) or AUTO_RESOLVED (deadline
//! passed). Terminal states never change again; the transition methods on
//! [`Alert`] are the only way status moves.

use crate::events::{Category, Details, Severity, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Actor recorded on alerts closed by the auto-resolve sweep
pub const AUTO_RESOLVE_ACTOR: &str = "auto-resolve";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    AutoResolved,
}

impl AlertStatus {
    /// OPEN or ACKNOWLEDGED
    pub fn is_active(self) -> bool {
        matches!(self, AlertStatus::Open | AlertStatus::Acknowledged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: u64,
    pub created_at: Timestamp,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub details: Details,
    pub client_id: Option<String>,
    /// Component or rule that raised the alert
    pub source: String,
    pub status: AlertStatus,
    pub auto_resolve_at: Option<Timestamp>,
    pub acknowledged_at: Option<Timestamp>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<String>,
}

impl Alert {
    pub(crate) fn from_request(id: u64, request: AlertRequest, now: Timestamp) -> Self {
        Self {
            id,
            created_at: now,
            severity: request.severity,
            category: request.category,
            message: request.message,
            details: request.details,
            client_id: request.client_id,
            source: request.source,
            status: AlertStatus::Open,
            // A deadline past the representable range never fires
            auto_resolve_at: request
                .auto_resolve_after
                .and_then(|after| now.checked_add_signed(after)),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// OPEN -> ACKNOWLEDGED; any other starting state is refused
    pub fn acknowledge(&mut self, by: &str, at: Timestamp) -> bool {
        if self.status != AlertStatus::Open {
            return false;
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(at);
        self.acknowledged_by = Some(by.to_string());
        true
    }

    /// OPEN | ACKNOWLEDGED -> RESOLVED
    pub fn resolve(&mut self, by: &str, at: Timestamp) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
        self.resolved_by = Some(by.to_string());
        true
    }

    /// Whether the auto-resolve deadline has passed at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.is_active() && self.auto_resolve_at.is_some_and(|deadline| now >= deadline)
    }

    /// OPEN | ACKNOWLEDGED -> AUTO_RESOLVED once `now` reaches the deadline
    pub fn auto_resolve(&mut self, now: Timestamp) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        self.status = AlertStatus::AutoResolved;
        self.resolved_at = Some(now);
        self.resolved_by = Some(AUTO_RESOLVE_ACTOR.to_string());
        true
    }
}

/// Parameters for creating an alert
///
/// ```
/// use opsmon::alerts::AlertRequest;
/// use opsmon::events::{Category, Severity};
///
/// let request = AlertRequest::new(Severity::High, Category::Usage, "provider failed")
///     .source("usage_monitor")
///     .auto_resolve_after(chrono::Duration::minutes(30));
/// assert_eq!(request.severity, Severity::High);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRequest {
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub details: Details,
    pub client_id: Option<String>,
    pub source: String,
    pub auto_resolve_after: Option<Duration>,
}

impl AlertRequest {
    pub fn new(severity: Severity, category: Category, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            details: Details::new(),
            client_id: None,
            source: "system".to_string(),
            auto_resolve_after: None,
        }
    }

    pub fn details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn auto_resolve_after(mut self, after: Duration) -> Self {
        self.auto_resolve_after = Some(after);
        self
    }
}

/// Filters for listing alerts; every field is optional
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    pub status: Option<AlertStatus>,
    pub client_id: Option<String>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    /// Keep at most this many of the newest matches
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub(crate) fn matches(&self, alert: &Alert) -> bool {
        self.severity.map_or(true, |s| alert.severity == s)
            && self.category.as_ref().map_or(true, |c| &alert.category == c)
            && self.status.map_or(true, |s| alert.status == s)
            && self
                .client_id
                .as_ref()
                .map_or(true, |id| alert.client_id.as_ref() == Some(id))
            && self.since.map_or(true, |since| alert.created_at >= since)
            && self.until.map_or(true, |until| alert.created_at <= until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn open_alert(auto_resolve_after: Option<Duration>) -> Alert {
        let mut request = AlertRequest::new(Severity::Medium, Category::System, "test");
        if let Some(after) = auto_resolve_after {
            request = request.auto_resolve_after(after);
        }
        Alert::from_request(1, request, Utc::now())
    }

    #[test]
    fn test_new_alert_is_open_with_deadline() {
        let alert = open_alert(Some(Duration::minutes(30)));
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(
            alert.auto_resolve_at,
            Some(alert.created_at + Duration::minutes(30))
        );
    }

    #[test]
    fn test_acknowledge_only_from_open() {
        let mut alert = open_alert(None);
        let now = Utc::now();
        assert!(alert.acknowledge("ops", now));
        assert_eq!(alert.acknowledged_at, Some(now));

        assert!(!alert.acknowledge("other", now + Duration::seconds(5)));
        assert_eq!(alert.acknowledged_at, Some(now));
        assert_eq!(alert.acknowledged_by.as_deref(), Some("ops"));
    }

    #[test]
    fn test_resolve_from_acknowledged() {
        let mut alert = open_alert(None);
        let now = Utc::now();
        alert.acknowledge("ops", now);
        assert!(alert.resolve("ops", now));
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert!(!alert.resolve("ops", now));
        assert!(!alert.acknowledge("ops", now));
    }

    #[test]
    fn test_auto_resolve_boundary() {
        let mut alert = open_alert(Some(Duration::minutes(30)));
        let deadline = alert.created_at + Duration::minutes(30);

        assert!(!alert.auto_resolve(deadline - Duration::seconds(1)));
        assert_eq!(alert.status, AlertStatus::Open);

        assert!(alert.auto_resolve(deadline));
        assert_eq!(alert.status, AlertStatus::AutoResolved);
        assert_eq!(alert.resolved_by.as_deref(), Some(AUTO_RESOLVE_ACTOR));
    }

    #[test]
    fn test_alert_without_deadline_never_expires() {
        let mut alert = open_alert(None);
        assert!(!alert.auto_resolve(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_resolved_alert_does_not_auto_resolve() {
        let mut alert = open_alert(Some(Duration::seconds(1)));
        alert.resolve("ops", Utc::now());
        assert!(!alert.auto_resolve(Utc::now() + Duration::hours(1)));
        assert_eq!(alert.status, AlertStatus::Resolved);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&AlertStatus::AutoResolved).unwrap(),
            "\"auto_resolved\""
        );
    }
}
