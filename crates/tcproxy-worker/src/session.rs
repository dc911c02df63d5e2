//! One claimed task: its reclaimer, its proxy and its environment

use std::collections::BTreeMap;
use std::sync::Arc;
use tcproxy_core::{
    task_environment, ArtifactRecord, CredentialStore, Result, TaskClaim, TaskCondition,
    TaskDefinition, TaskLog, WorkerConfig, LIVE_BACKING_LOG,
};
use tcproxy_proxy::{ProxyHandle, ProxyServer};
use tcproxy_queue::Coordinator;
use tcproxy_reclaim::{ReclaimSchedule, ReclaimState, Reclaimer, ReclaimerHandle};
use tracing::{info, warn};

/// Content type the task log is published with
pub const TASK_LOG_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Content encoding the task log is published with
pub const TASK_LOG_CONTENT_ENCODING: &str = "gzip";

/// Everything that lives exactly as long as one task run
pub struct TaskSession {
    task_id: String,
    run_id: u32,
    env: BTreeMap<String, String>,
    store: CredentialStore,
    task_log: TaskLog,
    reclaimer: ReclaimerHandle,
    proxy: Option<ProxyHandle>,
}

impl TaskSession {
    /// Start reclaiming `claim` and, if the payload asks for it, the proxy.
    ///
    /// The credential store holds the claim's credentials before the proxy
    /// accepts its first connection.
    pub async fn start(
        config: &WorkerConfig,
        coordinator: Arc<dyn Coordinator>,
        task: &TaskDefinition,
        claim: TaskClaim,
        task_log: TaskLog,
    ) -> Result<Self> {
        let task_id = claim.task_id.clone();
        let run_id = claim.run_id;
        let store = CredentialStore::new();

        let reclaimer = Reclaimer::new(
            coordinator,
            store.clone(),
            ReclaimSchedule::from_config(&config.reclaim),
            config.reclaim.call_timeout(),
        )
        .with_task_log(task_log.clone())
        .spawn(claim);

        let proxy = if task.payload.proxy_enabled() {
            let started = ProxyServer::start(
                config.proxy.clone(),
                config.root_url.clone(),
                store.clone(),
                task_log.clone(),
            )
            .await;
            match started {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    reclaimer.stop().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let proxy_url = proxy.as_ref().map(ProxyHandle::url);
        let env = match task_environment(&task.payload, &task_id, run_id, proxy_url.as_deref()) {
            Ok(env) => env,
            Err(e) => {
                if let Some(proxy) = proxy {
                    proxy.shutdown().await;
                }
                reclaimer.stop().await;
                return Err(e);
            }
        };

        info!(
            "Started session for {}/{} (proxy: {})",
            task_id,
            run_id,
            proxy_url.as_deref().unwrap_or("disabled")
        );

        Ok(Self {
            task_id,
            run_id,
            env,
            store,
            task_log,
            reclaimer,
            proxy,
        })
    }

    /// Environment for the task process
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Proxy base URL, if the proxy runs for this task
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy.as_ref().map(ProxyHandle::url)
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn task_log(&self) -> &TaskLog {
        &self.task_log
    }

    pub fn reclaim_state(&self) -> ReclaimState {
        self.reclaimer.state()
    }

    /// Resolves if the claim is lost or refused; the task must then be killed
    pub async fn aborted(&self) -> TaskCondition {
        self.reclaimer.aborted().await
    }

    /// The task finished: stop reclaiming and drain the proxy.
    ///
    /// Returns the final reclaimer state; an `Aborted` state means the run
    /// must be reported as failed whatever the task's own exit status was.
    pub async fn finish(self) -> ReclaimState {
        let state = self.reclaimer.stop().await;
        if let Some(proxy) = self.proxy {
            proxy.shutdown().await;
        }

        match state.condition() {
            Some(condition) => warn!(
                "Session for {}/{} ended with {}",
                self.task_id, self.run_id, condition
            ),
            None => info!("Session for {}/{} finished", self.task_id, self.run_id),
        }
        state
    }

    /// The task log as the artifact it is published as
    pub async fn log_artifact(&self, task: &TaskDefinition) -> ArtifactRecord {
        ArtifactRecord {
            name: LIVE_BACKING_LOG.to_string(),
            content: self.task_log.lines().await.join("\n"),
            content_type: TASK_LOG_CONTENT_TYPE.to_string(),
            content_encoding: TASK_LOG_CONTENT_ENCODING.to_string(),
            expires: task.expires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use tcproxy_core::{Credentials, FeatureFlags, ReclaimConfig, TaskPayload, PROXY_URL_ENV};
    use tcproxy_queue::{QueueError, Reclaim};

    struct Refusing;

    #[async_trait]
    impl Coordinator for Refusing {
        async fn reclaim(&self, _claim: &TaskClaim) -> std::result::Result<Reclaim, QueueError> {
            Err(QueueError::from_status(409, "run resolved"))
        }
    }

    fn task(proxy: bool) -> TaskDefinition {
        TaskDefinition {
            scopes: vec![],
            expires: Utc::now() + chrono::Duration::days(1),
            payload: TaskPayload {
                features: FeatureFlags {
                    taskcluster_proxy: proxy,
                },
                ..TaskPayload::default()
            },
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            reclaim: ReclaimConfig::fixed(Duration::from_secs(1)),
            ..WorkerConfig::default()
        }
    }

    fn claim() -> TaskClaim {
        TaskClaim::new(
            "fVb3ku4cRUCxO8TAn4oOKQ",
            1,
            Utc::now() + chrono::Duration::minutes(20),
            Credentials::new("c1", "t1"),
        )
    }

    #[tokio::test]
    async fn test_proxy_disabled_sets_nothing() {
        let session = TaskSession::start(
            &config(),
            Arc::new(Refusing),
            &task(false),
            claim(),
            TaskLog::memory(),
        )
        .await
        .unwrap();

        assert!(session.proxy_url().is_none());
        assert!(!session.env().contains_key(PROXY_URL_ENV));
        assert_eq!(session.env()["RUN_ID"], "1");
        assert_eq!(session.store().generation(), 1);
        session.finish().await;
    }

    #[tokio::test]
    async fn test_proxy_enabled_exports_url() {
        let session = TaskSession::start(
            &config(),
            Arc::new(Refusing),
            &task(true),
            claim(),
            TaskLog::memory(),
        )
        .await
        .unwrap();

        let url = session.proxy_url().unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert_eq!(session.env()[PROXY_URL_ENV], url);
        session.finish().await;
    }

    #[tokio::test]
    async fn test_refused_reclaim_aborts_session() {
        let session = TaskSession::start(
            &config(),
            Arc::new(Refusing),
            &task(false),
            claim(),
            TaskLog::memory(),
        )
        .await
        .unwrap();

        let condition = tokio::time::timeout(Duration::from_secs(3), session.aborted())
            .await
            .unwrap();
        assert!(matches!(condition, TaskCondition::ClaimInvalid { .. }));

        let state = session.finish().await;
        assert!(state.condition().is_some());
    }

    #[tokio::test]
    async fn test_log_artifact_carries_task_expiry() {
        let task = task(false);
        let log = TaskLog::memory();
        log.line("hello").await;
        let session = TaskSession::start(&config(), Arc::new(Refusing), &task, claim(), log)
            .await
            .unwrap();

        let record = session.log_artifact(&task).await;
        assert_eq!(record.name, LIVE_BACKING_LOG);
        assert_eq!(record.expires, task.expires);
        assert!(record.content.contains("hello"));
        session.finish().await;
    }
}
