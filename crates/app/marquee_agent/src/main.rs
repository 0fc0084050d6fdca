//! Stand-alone POS agent.
//!
//! Runs next to the receipt printer, authenticates against a Marquee server
//! for one theater, listens on the theater's print stream and prints jobs
//! until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use marquee_core::agent::http_backend::HttpAgentBackend;
use marquee_core::agent::printer::{FilePrinter, LogPrinter, PrintSink};
use marquee_core::agent::{AgentCredentials, AgentSupervisor, SupervisorConfig};
use marquee_core::id::TenantId;
use tracing::{error, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "marquee_agent", version, about = "Marquee POS print agent")]
#[command(group(ArgGroup::new("credentials").required(true).args(["username", "grant"])))]
struct Args {
    /// Base URL of the Marquee server.
    #[arg(long, env = "MARQUEE_SERVER_URL", default_value = "http://127.0.0.1:3100/")]
    server_url: Url,

    /// Theater to print for.
    #[arg(long, env = "MARQUEE_TENANT_ID")]
    tenant_id: String,

    /// Display name used in logs.
    #[arg(long, env = "MARQUEE_TENANT_NAME")]
    tenant_name: Option<String>,

    /// Theater user to authenticate as.
    #[arg(long, env = "MARQUEE_USERNAME", requires = "password")]
    username: Option<String>,

    #[arg(long, env = "MARQUEE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "MARQUEE_PIN", hide_env_values = true)]
    pin: Option<String>,

    /// Delegated agent grant instead of username and password.
    #[arg(long, env = "MARQUEE_AGENT_GRANT", hide_env_values = true)]
    grant: Option<String>,

    /// Append jobs to this JSON-lines file instead of logging them.
    #[arg(long, env = "MARQUEE_PRINT_SPOOL")]
    spool: Option<PathBuf>,

    /// Longest reconnect delay, in seconds.
    #[arg(long, default_value_t = 30)]
    max_backoff_secs: u64,
}

impl Args {
    fn credentials(&self) -> Option<AgentCredentials> {
        if let Some(token) = &self.grant {
            return Some(AgentCredentials::Grant {
                token: token.clone(),
            });
        }
        Some(AgentCredentials::Password {
            username: self.username.clone()?,
            password: self.password.clone()?,
            pin: self.pin.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marquee_core=debug".into()),
        )
        .init();

    let args = Args::parse();
    let credentials = args
        .credentials()
        .ok_or("either --grant or --username with --password is required")?;
    let tenant_id = TenantId::new(&args.tenant_id);
    let tenant_name = args
        .tenant_name
        .clone()
        .unwrap_or_else(|| tenant_id.to_string());

    let printer: Arc<dyn PrintSink> = match &args.spool {
        Some(path) => Arc::new(FilePrinter::new(path)),
        None => Arc::new(LogPrinter),
    };

    let backend = HttpAgentBackend::new(args.server_url.clone());
    if let Err(e) = backend.probe().await {
        warn!(server_url = %args.server_url, "server not reachable yet: {e}");
    }

    let config = SupervisorConfig {
        max_backoff: Duration::from_secs(args.max_backoff_secs.max(1)),
        ..SupervisorConfig::default()
    };
    let supervisor = AgentSupervisor::new(Arc::new(backend), printer, config);

    info!(tenant_id = %tenant_id, tenant_name, server_url = %args.server_url, "starting agent");
    let registration = supervisor
        .start(&tenant_id, &tenant_name, credentials)
        .await
        .inspect_err(|e| error!(tenant_id = %tenant_id, "agent failed to start: {e}"))?;
    info!(tenant_id = %tenant_id, state = ?registration.state, "agent started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    supervisor.shutdown().await;
    if let Some(registration) = supervisor.registration(&tenant_id) {
        info!(jobs_printed = registration.jobs_printed, "agent stopped");
    }
    Ok(())
}
