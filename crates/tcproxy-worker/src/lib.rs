//! # tcproxy-worker
//!
//! Ties the pieces together for one claimed task:
//!
//! 1. the [`Reclaimer`](tcproxy_reclaim::Reclaimer) installs the claim's
//!    credentials and keeps them fresh,
//! 2. the proxy starts only when the payload sets `features.taskclusterProxy`,
//! 3. the task environment is resolved once, with `TASKCLUSTER_PROXY_URL`
//!    pointing at the proxy.
//!
//! Running the task command itself is left to the caller.

mod session;

pub use session::{TaskSession, TASK_LOG_CONTENT_ENCODING, TASK_LOG_CONTENT_TYPE};
