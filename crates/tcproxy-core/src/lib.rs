//! # tcproxy-core
//!
//! Core types for the tcproxy credential-proxying subsystem.
//!
//! A worker runs untrusted task commands that still need to call the queue
//! API. Instead of handing them secrets, the worker keeps short-lived,
//! per-claim credentials in a [`CredentialStore`], refreshes them by
//! reclaiming the task, and lets the task talk to a local proxy that signs
//! requests on its behalf.
//!
//! ## Ownership
//!
//! - The reclaimer is the only writer of the [`CredentialStore`]
//! - The proxy only ever reads snapshots (`Arc<Credentials>`)
//! - Credentials are replaced wholesale, never mutated

pub mod artifacts;
pub mod config;
pub mod credentials;
pub mod env;
mod error;
pub mod fail_open;
pub mod task_log;
mod types;

pub use artifacts::{ArtifactMismatch, ArtifactRecord, ExpectedArtifact, ExpectedArtifacts};
pub use config::{AuthScheme, ProxyConfig, ReclaimConfig, ReclaimMode, WorkerConfig};
pub use credentials::{CredentialSnapshot, CredentialStore};
pub use env::{task_environment, PROXY_URL_ENV};
pub use error::{Result, TcProxyError};
pub use task_log::{TaskLog, LIVE_BACKING_LOG, ROTATION_NOTICE};
pub use types::*;
