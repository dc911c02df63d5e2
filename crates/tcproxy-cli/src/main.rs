//! tcproxy CLI - credential proxy and claim reclaimer for task runs
//!
//! Usage:
//!   tcproxy serve --task-id <id> --run-id <n> --taken-until <ts>   Run a session for a claimed task
//!                 [--payload <file>]
//!   tcproxy env --payload <file>                                     Print the task environment
//!   tcproxy sign --method GET --url <url>                            Print an Authorization header
//!   tcproxy config init [path]                                       Write the default config

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcproxy_core::{
    task_environment, AuthScheme, Credentials, FeatureFlags, ReclaimConfig, TaskClaim,
    TaskDefinition, TaskLog, TaskPayload, TcProxyError, WorkerConfig,
};
use tcproxy_queue::{authorization_header, QueueClient};
use tcproxy_worker::TaskSession;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tcproxy")]
#[command(author, version, about = "Credential-injecting proxy and claim reclaimer for task runs")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding .tcproxy/config.toml
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Credentials of the claimed run
#[derive(clap::Args)]
struct CredentialArgs {
    #[arg(long, env = "TASKCLUSTER_CLIENT_ID")]
    client_id: String,

    #[arg(long, env = "TASKCLUSTER_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Certificate of temporary credentials (JSON)
    #[arg(long, env = "TASKCLUSTER_CERTIFICATE", hide_env_values = true)]
    certificate: Option<String>,
}

impl CredentialArgs {
    fn into_credentials(self) -> Credentials {
        let credentials = Credentials::new(self.client_id, self.access_token);
        match self.certificate {
            Some(certificate) => credentials.with_certificate(certificate),
            None => credentials,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Keep a claimed task alive and proxy its API calls until Ctrl+C
    Serve {
        #[arg(long)]
        task_id: String,

        #[arg(long, default_value = "0")]
        run_id: u32,

        /// Current claim expiry (RFC 3339)
        #[arg(long)]
        taken_until: String,

        #[command(flatten)]
        credentials: CredentialArgs,

        /// Task payload JSON; defaults to a payload with the proxy enabled
        #[arg(long, value_name = "FILE")]
        payload: Option<PathBuf>,

        /// Task log file
        #[arg(long, value_name = "FILE", default_value = "live_backing.log")]
        log: PathBuf,

        /// Override root_url from the config
        #[arg(long)]
        root_url: Option<String>,

        /// Reclaim every N seconds instead of shortly before expiry
        #[arg(long, value_name = "SECS")]
        reclaim_interval: Option<u64>,

        /// Override the proxy port (0 picks a free one)
        #[arg(long)]
        port: Option<u16>,

        /// Override the signing scheme (hawk, bearer)
        #[arg(long)]
        auth_scheme: Option<AuthScheme>,
    },

    /// Print the environment a task would receive
    Env {
        /// Task payload JSON
        #[arg(long, value_name = "FILE")]
        payload: PathBuf,

        #[arg(long, default_value = "TASK_ID")]
        task_id: String,

        #[arg(long, default_value = "0")]
        run_id: u32,

        /// Proxy URL to export when the payload enables the proxy
        #[arg(long)]
        proxy_url: Option<String>,
    },

    /// Print the Authorization header for a request
    Sign {
        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long)]
        url: String,

        #[command(flatten)]
        credentials: CredentialArgs,

        #[arg(long, default_value = "hawk")]
        auth_scheme: AuthScheme,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default .tcproxy/config.toml
    Init {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve {
            task_id,
            run_id,
            taken_until,
            credentials,
            payload,
            log,
            root_url,
            reclaim_interval,
            port,
            auth_scheme,
        } => {
            let mut config = WorkerConfig::load_or_default(&cli.root)
                .context("Failed to load configuration")?;
            if let Some(root_url) = root_url {
                config.root_url = root_url;
            }
            if let Some(secs) = reclaim_interval {
                config.reclaim = ReclaimConfig::fixed(std::time::Duration::from_secs(secs));
            }
            if let Some(port) = port {
                config.proxy.port = port;
            }
            if let Some(scheme) = auth_scheme {
                config.proxy.auth_scheme = scheme;
            }
            config.validate()?;

            let claim = TaskClaim::new(
                task_id,
                run_id,
                parse_timestamp(&taken_until)?,
                credentials.into_credentials(),
            );
            cmd_serve(config, claim, payload.as_deref(), &log).await
        }
        Commands::Env {
            payload,
            task_id,
            run_id,
            proxy_url,
        } => cmd_env(&payload, &task_id, run_id, proxy_url.as_deref()),
        Commands::Sign {
            method,
            url,
            credentials,
            auth_scheme,
        } => cmd_sign(&method, &url, credentials.into_credentials(), auth_scheme),
        Commands::Config { action } => match action {
            ConfigCommands::Init { path } => cmd_config_init(&path),
        },
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?;
    Ok(parsed.with_timezone(&Utc))
}

fn read_payload(path: &Path) -> Result<TaskPayload> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse payload JSON")
}

/// The served task; its log artifact expires a day from now
fn load_task(payload: Option<&Path>) -> Result<TaskDefinition> {
    let payload = match payload {
        Some(path) => read_payload(path)?,
        None => TaskPayload {
            features: FeatureFlags {
                taskcluster_proxy: true,
            },
            ..TaskPayload::default()
        },
    };

    Ok(TaskDefinition {
        scopes: vec![],
        expires: Utc::now() + chrono::Duration::days(1),
        payload,
    })
}

async fn cmd_serve(
    config: WorkerConfig,
    claim: TaskClaim,
    payload: Option<&Path>,
    log: &Path,
) -> Result<()> {
    let task = load_task(payload)?;
    let task_log = TaskLog::create(log)
        .await
        .context("Failed to open task log")?;

    let coordinator = QueueClient::with_timeout(
        config.api_base(),
        config.proxy.auth_scheme,
        config.reclaim.call_timeout(),
    )?;

    info!("Serving task {} against {}", claim, config.root_url);
    let session = TaskSession::start(&config, Arc::new(coordinator), &task, claim, task_log)
        .await
        .context("Failed to start task session")?;

    for (key, value) in session.env() {
        println!("{}={}", key, value);
    }

    let aborted = tokio::select! {
        condition = session.aborted() => Some(condition),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, finishing task");
            None
        }
    };

    let state = session.finish().await;
    info!("Final reclaimer state: {:?}", state);

    if let Some(condition) = aborted {
        return Err(TcProxyError::from(condition)).context("Task aborted");
    }
    Ok(())
}

fn cmd_env(payload: &Path, task_id: &str, run_id: u32, proxy_url: Option<&str>) -> Result<()> {
    let payload = read_payload(payload)?;

    // Without a running proxy, only export the URL the caller gave us
    let proxy_url = if payload.proxy_enabled() { proxy_url } else { None };
    if payload.proxy_enabled() && proxy_url.is_none() {
        bail!("Payload enables taskclusterProxy; pass --proxy-url");
    }

    for (key, value) in task_environment(&payload, task_id, run_id, proxy_url)? {
        println!("{}={}", key, value);
    }
    Ok(())
}

fn cmd_sign(method: &str, url: &str, credentials: Credentials, scheme: AuthScheme) -> Result<()> {
    let url = Url::parse(url).with_context(|| format!("Invalid URL '{}'", url))?;
    let header = authorization_header(scheme, &credentials, method, &url)?;
    println!("{}", header);
    Ok(())
}

fn cmd_config_init(path: &Path) -> Result<()> {
    WorkerConfig::write_default(path).context("Failed to write configuration")?;
    println!("Wrote {}", path.join(".tcproxy/config.toml").display());
    Ok(())
}
