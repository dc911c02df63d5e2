//! Environment handed to the task process
//!
//! Resolved once, when the task command is constructed. The proxy URL is a
//! plain environment variable; the task substitutes it into its own URLs.

use std::collections::BTreeMap;

use crate::{Result, TaskPayload, TcProxyError};

/// Variable carrying the proxy's base URL
pub const PROXY_URL_ENV: &str = "TASKCLUSTER_PROXY_URL";

/// Build the task environment from the payload.
///
/// `proxy_url` must be present exactly when the payload enables the proxy.
/// With the feature off, `TASKCLUSTER_PROXY_URL` is absent even if the
/// payload tried to set it.
pub fn task_environment(
    payload: &TaskPayload,
    task_id: &str,
    run_id: u32,
    proxy_url: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let mut env = payload.env.clone();
    env.insert("TASK_ID".to_string(), task_id.to_string());
    env.insert("RUN_ID".to_string(), run_id.to_string());
    env.remove(PROXY_URL_ENV);

    match (payload.proxy_enabled(), proxy_url) {
        (true, Some(url)) => {
            env.insert(PROXY_URL_ENV.to_string(), url.trim_end_matches('/').to_string());
        }
        (true, None) => {
            return Err(TcProxyError::Proxy(
                "taskclusterProxy is enabled but no proxy is running".to_string(),
            ));
        }
        (false, Some(_)) => {
            return Err(TcProxyError::Proxy(
                "proxy URL supplied for a task without taskclusterProxy".to_string(),
            ));
        }
        (false, None) => {}
    }

    Ok(env)
}
