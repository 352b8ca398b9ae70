//! Audit events for security-relevant actions.
//!
//! Events are emitted on the `audit` tracing target so they can be routed
//! separately from application logs.
//!
//! ```ignore
//! use axum_helpers::audit::{AuditEvent, AuditOutcome};
//!
//! AuditEvent::new("credential.revoke", AuditOutcome::Success)
//!     .with_actor(Some(actor_id.to_string()))
//!     .with_tenant(Some(tenant.clone()))
//!     .with_resource(Some(format!("credential:{}", id)))
//!     .log();
//! ```

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    /// Rejected by authentication or authorization
    Denied,
}

#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Credential that performed the action, if it authenticated
    pub actor: Option<String>,
    pub tenant: Option<String>,
    /// Dotted action name, e.g. "resource.create"
    pub action: String,
    /// Affected object, e.g. "db1/vectors" or "credential:<id>"
    pub resource: Option<String>,
    pub outcome: AuditOutcome,
    pub ip_address: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            actor: None,
            tenant: None,
            action: action.into(),
            resource: None,
            outcome,
            ip_address: None,
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_resource(mut self, resource: Option<String>) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }

    pub fn log(self) {
        tracing::info!(
            target: "audit",
            actor = self.actor,
            tenant = self.tenant,
            action = %self.action,
            resource = self.resource,
            outcome = ?self.outcome,
            ip = self.ip_address,
            details = ?self.details,
            "{}",
            serde_json::to_string(&self).unwrap_or_else(|_| "Failed to serialize audit event".to_string())
        );
    }
}

/// First address of `X-Forwarded-For`, falling back to `X-Real-IP`.
pub fn extract_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(extract_ip_from_headers(&headers).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_extract_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(extract_ip_from_headers(&headers).as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_event_serializes_outcome_lowercase() {
        let event = AuditEvent::new("credential.create", AuditOutcome::Denied)
            .with_tenant(Some("acme".to_string()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["tenant"], "acme");
    }
}
