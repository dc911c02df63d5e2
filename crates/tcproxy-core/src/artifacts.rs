//! Artifact contract
//!
//! Upload and compression happen elsewhere. This module only states what a
//! finished run must have produced and checks fetched artifacts against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::task_log::LIVE_BACKING_LOG;
use crate::{Result, TaskDefinition, TcProxyError};

/// Expectations for a single artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedArtifact {
    /// Substrings that must appear in the decoded content
    #[serde(default)]
    pub extracts: Vec<String>,
    pub content_type: String,
    pub content_encoding: String,
    pub expires: DateTime<Utc>,
}

/// An artifact as fetched after the run, content already decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub name: String,
    pub content: String,
    pub content_type: String,
    pub content_encoding: String,
    pub expires: DateTime<Utc>,
}

/// One way an artifact failed its expectations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactMismatch {
    Missing {
        name: String,
    },
    MissingExtract {
        name: String,
        extract: String,
    },
    ContentType {
        name: String,
        expected: String,
        actual: String,
    },
    ContentEncoding {
        name: String,
        expected: String,
        actual: String,
    },
    Expires {
        name: String,
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
}

impl std::fmt::Display for ArtifactMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { name } => write!(f, "{}: artifact not found", name),
            Self::MissingExtract { name, extract } => {
                write!(f, "{}: content does not contain {:?}", name, extract)
            }
            Self::ContentType {
                name,
                expected,
                actual,
            } => write!(f, "{}: content type {:?}, expected {:?}", name, actual, expected),
            Self::ContentEncoding {
                name,
                expected,
                actual,
            } => write!(
                f,
                "{}: content encoding {:?}, expected {:?}",
                name, actual, expected
            ),
            Self::Expires {
                name,
                expected,
                actual,
            } => write!(f, "{}: expires {}, expected {}", name, actual, expected),
        }
    }
}

/// Expected artifacts keyed by artifact name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedArtifacts(pub BTreeMap<String, ExpectedArtifact>);

impl ExpectedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, expected: ExpectedArtifact) {
        self.0.insert(name.into(), expected);
    }

    /// The task log contract: gzip-encoded UTF-8 text expiring with the task
    pub fn task_log(task: &TaskDefinition, extracts: &[&str]) -> Self {
        let mut artifacts = Self::new();
        artifacts.insert(
            LIVE_BACKING_LOG,
            ExpectedArtifact {
                extracts: extracts.iter().map(|s| s.to_string()).collect(),
                content_type: "text/plain; charset=utf-8".to_string(),
                content_encoding: "gzip".to_string(),
                expires: task.expires,
            },
        );
        artifacts
    }

    /// Every mismatch between the expectations and what was produced
    pub fn check(&self, records: &[ArtifactRecord]) -> Vec<ArtifactMismatch> {
        let mut mismatches = Vec::new();

        for (name, expected) in &self.0 {
            let Some(record) = records.iter().find(|r| &r.name == name) else {
                mismatches.push(ArtifactMismatch::Missing { name: name.clone() });
                continue;
            };

            for extract in &expected.extracts {
                if !record.content.contains(extract.as_str()) {
                    mismatches.push(ArtifactMismatch::MissingExtract {
                        name: name.clone(),
                        extract: extract.clone(),
                    });
                }
            }
            if record.content_type != expected.content_type {
                mismatches.push(ArtifactMismatch::ContentType {
                    name: name.clone(),
                    expected: expected.content_type.clone(),
                    actual: record.content_type.clone(),
                });
            }
            if record.content_encoding != expected.content_encoding {
                mismatches.push(ArtifactMismatch::ContentEncoding {
                    name: name.clone(),
                    expected: expected.content_encoding.clone(),
                    actual: record.content_encoding.clone(),
                });
            }
            if record.expires != expected.expires {
                mismatches.push(ArtifactMismatch::Expires {
                    name: name.clone(),
                    expected: expected.expires,
                    actual: record.expires,
                });
            }
        }

        mismatches
    }

    /// Like [`check`](Self::check), folded into an error
    pub fn validate(&self, records: &[ArtifactRecord]) -> Result<()> {
        let mismatches = self.check(records);
        if mismatches.is_empty() {
            return Ok(());
        }
        Err(TcProxyError::ArtifactValidation(
            mismatches
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_log::ROTATION_NOTICE;
    use crate::TaskPayload;
    use chrono::TimeZone;

    fn task() -> TaskDefinition {
        TaskDefinition {
            scopes: vec!["queue:get-artifact:SampleArtifacts/_/X.txt".to_string()],
            expires: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            payload: TaskPayload::default(),
        }
    }

    fn log_record(content: &str) -> ArtifactRecord {
        ArtifactRecord {
            name: LIVE_BACKING_LOG.to_string(),
            content: content.to_string(),
            content_type: "text/plain; charset=utf-8".to_string(),
            content_encoding: "gzip".to_string(),
            expires: task().expires,
        }
    }

    #[test]
    fn test_task_log_contract_passes() {
        let expected = ExpectedArtifacts::task_log(&task(), &["test artifact", ROTATION_NOTICE]);
        let record = log_record(&format!("test artifact\n{}\n", ROTATION_NOTICE));
        assert!(expected.validate(&[record]).is_ok());
    }

    #[test]
    fn test_reports_every_mismatch() {
        let expected = ExpectedArtifacts::task_log(&task(), &["test artifact", ROTATION_NOTICE]);
        let mut record = log_record("test artifact");
        record.content_encoding = "identity".to_string();
        record.expires = Utc.with_ymd_and_hms(2029, 1, 1, 0, 0, 0).unwrap();

        let mismatches = expected.check(&[record]);
        assert_eq!(mismatches.len(), 3);
        assert!(mismatches
            .iter()
            .any(|m| matches!(m, ArtifactMismatch::MissingExtract { extract, .. } if extract == ROTATION_NOTICE)));
        assert!(mismatches
            .iter()
            .any(|m| matches!(m, ArtifactMismatch::ContentEncoding { .. })));
        assert!(mismatches.iter().any(|m| matches!(m, ArtifactMismatch::Expires { .. })));
    }

    #[test]
    fn test_missing_artifact() {
        let expected = ExpectedArtifacts::task_log(&task(), &[]);
        let err = expected.validate(&[]).unwrap_err();
        assert!(err.to_string().contains("artifact not found"));
    }
}
