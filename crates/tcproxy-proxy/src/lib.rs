//! # tcproxy-proxy
//!
//! A loopback HTTP server the task process talks to instead of the API.
//! Every request is signed with the credentials currently in the
//! [`CredentialStore`](tcproxy_core::CredentialStore) and forwarded to
//! `<root_url>/api/...`; the response is streamed back unchanged.
//!
//! The first request that uses a newer credential generation writes
//! [`ROTATION_NOTICE`](tcproxy_core::ROTATION_NOTICE) to the task log.

pub mod context;
mod server;

pub use context::{upstream_url, ProxyRequestContext};
pub use server::{ProxyHandle, ProxyServer, HEALTH_PATH};
