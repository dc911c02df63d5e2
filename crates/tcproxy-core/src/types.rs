//! Core type definitions for tcproxy

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Temporary credentials issued by the queue for a single task claim.
///
/// Immutable once issued. A reclaim produces a brand-new value that is
/// swapped into the [`crate::CredentialStore`]; fields are never updated
/// in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
    /// JSON-encoded certificate, present for temporary credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: access_token.into(),
            certificate: None,
        }
    }

    pub fn with_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }

    /// Whether these are temporary (certificate-bearing) credentials
    pub fn is_temporary(&self) -> bool {
        self.certificate.is_some()
    }
}

// Access tokens must never end up in logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .field("certificate", &self.certificate.as_ref().map(|_| "<present>"))
            .finish()
    }
}

/// A time-bounded lease on one run of a task.
///
/// Owned exclusively by the reclaimer and replaced wholesale on each
/// successful reclaim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskClaim {
    pub task_id: String,
    pub run_id: u32,
    pub taken_until: DateTime<Utc>,
    pub credentials: Arc<Credentials>,
}

impl TaskClaim {
    pub fn new(
        task_id: impl Into<String>,
        run_id: u32,
        taken_until: DateTime<Utc>,
        credentials: Credentials,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
            taken_until,
            credentials: Arc::new(credentials),
        }
    }

    /// Time left on the lease, or `None` once it has lapsed
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.taken_until - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// A claim counts as live only while `taken_until` is at least one
    /// reclaim interval ahead of `now`.
    pub fn is_live(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let Ok(interval) = ChronoDuration::from_std(interval) else {
            return false;
        };
        match now.checked_add_signed(interval) {
            Some(deadline) => self.taken_until > deadline,
            None => false,
        }
    }

    /// Replace lease and credentials with the result of a reclaim
    pub fn renewed(&self, taken_until: DateTime<Utc>, credentials: Credentials) -> Self {
        Self {
            task_id: self.task_id.clone(),
            run_id: self.run_id,
            taken_until,
            credentials: Arc::new(credentials),
        }
    }
}

impl std::fmt::Display for TaskClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.task_id, self.run_id)
    }
}

/// Terminal condition reported to the task that owns a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "condition")]
pub enum TaskCondition {
    /// The lease lapsed without a successful reclaim
    ClaimLost { message: String },
    /// The queue refused the reclaim permanently (run resolved, cancelled, ...)
    ClaimInvalid { message: String },
}

impl TaskCondition {
    pub fn message(&self) -> &str {
        match self {
            Self::ClaimLost { message } | Self::ClaimInvalid { message } => message,
        }
    }
}

impl std::fmt::Display for TaskCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClaimLost { message } => write!(f, "claim-lost: {}", message),
            Self::ClaimInvalid { message } => write!(f, "claim-invalid: {}", message),
        }
    }
}

impl From<TaskCondition> for crate::TcProxyError {
    fn from(condition: TaskCondition) -> Self {
        match condition {
            TaskCondition::ClaimLost { message } => Self::ClaimLost(message),
            TaskCondition::ClaimInvalid { message } => Self::ClaimInvalid(message),
        }
    }
}

/// Per-task feature toggles from the task payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    #[serde(default)]
    pub taskcluster_proxy: bool,
}

/// The worker-specific part of a task definition.
///
/// `command` is opaque here; executing it is someone else's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    #[serde(default)]
    pub command: Vec<serde_json::Value>,
    /// Maximum run time in seconds
    #[serde(default)]
    pub max_run_time: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub features: FeatureFlags,
}

impl TaskPayload {
    pub fn proxy_enabled(&self) -> bool {
        self.features.taskcluster_proxy
    }
}

/// The subset of a task definition the worker consults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires: DateTime<Utc>,
    pub payload: TaskPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_into_error() {
        let err: crate::TcProxyError = TaskCondition::ClaimLost {
            message: "lease lapsed".to_string(),
        }
        .into();
        assert!(matches!(err, crate::TcProxyError::ClaimLost(ref m) if m == "lease lapsed"));
    }

    fn claim_expiring_in(secs: i64) -> (TaskClaim, DateTime<Utc>) {
        let now = Utc::now();
        let claim = TaskClaim::new(
            "KTBKfEgxR5GdfIIREQIvFQ",
            0,
            now + ChronoDuration::seconds(secs),
            Credentials::new("task-client/1", "token-1"),
        );
        (claim, now)
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = Credentials::new("client", "super-secret").with_certificate("{}");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
        assert!(creds.is_temporary());
    }

    #[test]
    fn test_credentials_wire_format() {
        let json = r#"{"clientId":"task-client/abc","accessToken":"tok","certificate":"{\"version\":1}"}"#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.client_id, "task-client/abc");
        assert_eq!(creds.certificate.as_deref(), Some(r#"{"version":1}"#));

        let permanent: Credentials =
            serde_json::from_str(r#"{"clientId":"c","accessToken":"t"}"#).unwrap();
        assert!(!permanent.is_temporary());
        assert!(!serde_json::to_string(&permanent).unwrap().contains("certificate"));
    }

    #[test]
    fn test_claim_liveness_requires_one_interval() {
        let (claim, now) = claim_expiring_in(10);
        assert!(claim.is_live(now, Duration::from_secs(5)));
        assert!(!claim.is_live(now, Duration::from_secs(10)));
        assert!(!claim.is_live(now, Duration::from_secs(30)));
    }

    #[test]
    fn test_claim_remaining() {
        let (claim, now) = claim_expiring_in(10);
        assert_eq!(claim.remaining(now), Some(Duration::from_secs(10)));

        let (expired, now) = claim_expiring_in(-1);
        assert_eq!(expired.remaining(now), None);
    }

    #[test]
    fn test_renewed_replaces_credentials_wholesale() {
        let (claim, now) = claim_expiring_in(10);
        let old = claim.credentials.clone();
        let renewed = claim.renewed(
            now + ChronoDuration::seconds(20),
            Credentials::new("task-client/2", "token-2"),
        );
        assert_eq!(renewed.task_id, claim.task_id);
        assert_eq!(renewed.run_id, claim.run_id);
        assert_eq!(old.access_token, "token-1");
        assert_eq!(renewed.credentials.access_token, "token-2");
    }

    #[test]
    fn test_payload_feature_flag_defaults_off() {
        let payload: TaskPayload =
            serde_json::from_str(r#"{"command":[["sleep","12"]],"maxRunTime":60}"#).unwrap();
        assert!(!payload.proxy_enabled());
        assert_eq!(payload.max_run_time, 60);

        let payload: TaskPayload =
            serde_json::from_str(r#"{"features":{"taskclusterProxy":true}}"#).unwrap();
        assert!(payload.proxy_enabled());
    }

    #[test]
    fn test_condition_display() {
        let lost = TaskCondition::ClaimLost {
            message: "lease lapsed".to_string(),
        };
        assert_eq!(lost.to_string(), "claim-lost: lease lapsed");
        assert_eq!(lost.message(), "lease lapsed");
    }
}
