use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use phyto_api::{image_key, AnalysisReport, ApiError, ApiResult, ChatReply, ChatSession, DiagnosisApi, HealthStatus, InProcApi};
use phyto_core::{OpKey, OrchestratorConfig};
use tokio::signal;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "phytoctl", version, about = "Phyto CLI: plant-leaf diagnosis client")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Diagnosis backend base URL (default: simulated backend)
    #[arg(long = "backend", global = true, env = "PHYTO_BACKEND_URL")]
    backend: Option<String>,

    /// Overall timeout per request in milliseconds (default: PHYTO_DEFAULT_TIMEOUT_MS)
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze a leaf image
    Analyze {
        /// Path to the image file (JPEG)
        image: std::path::PathBuf,
        /// Ask the backend for assisted segmentation
        #[arg(long = "assisted", action = ArgAction::SetTrue)]
        assisted: bool,
    },
    /// Send one message to the assistant
    Chat {
        /// Message text
        message: String,
        /// Continue an existing session (needs --turn, the last turn printed)
        #[arg(long = "session", requires = "turn")]
        session: Option<Uuid>,
        /// Last turn of the session; the message goes out as the turn after it
        #[arg(long = "turn", requires = "session")]
        turn: Option<u64>,
        /// Re-send turn --turn instead of starting the next one
        #[arg(long = "retry", action = ArgAction::SetTrue, requires = "session")]
        retry: bool,
    },
    /// Print the effective orchestrator configuration
    Config,
}

fn init_tracing() {
    let env = std::env::var("PHYTO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PHYTO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PHYTO_METRICS_ADDR; expected host:port");
        }
    }
}

/// Run `fut`; on Ctrl-C cancel `key` and still return the (cancelled) result.
async fn with_ctrl_c<T>(api: &dyn DiagnosisApi, key: &OpKey, fut: impl Future<Output = T>) -> T {
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => out,
        _ = signal::ctrl_c() => {
            info!(key = %key, "Ctrl-C received; cancelling request");
            api.cancel(key);
            fut.await
        }
    }
}

fn render_report(report: &AnalysisReport, output: Output) -> Result<String> {
    Ok(match output {
        Output::Json => serde_json::to_string_pretty(report)?,
        Output::Human => {
            let status = match report.status {
                HealthStatus::Healthy => "healthy",
                HealthStatus::Diseased => "diseased",
            };
            let mut lines = vec![format!("status      {}", status), format!("confidence  {}%", report.confidence)];
            if report.status == HealthStatus::Diseased {
                lines.push(format!("disease     {}", report.disease.as_deref().unwrap_or("unknown")));
            }
            if let Some(uri) = &report.segmented_image_uri {
                lines.push(format!("segmented   {}", uri));
            }
            lines.join("\n")
        }
    })
}

fn render_reply(session: &ChatSession, reply: &ChatReply, output: Output) -> Result<String> {
    Ok(match output {
        Output::Json => serde_json::to_string_pretty(&serde_json::json!({
            "session": session.id,
            "turn": session.turn,
            "response": reply.response,
        }))?,
        Output::Human => format!("assistant: {}\n(session {} turn {})", reply.response, session.id, session.turn),
    })
}

fn failure(what: &str, e: ApiError) -> anyhow::Error {
    if e.user_retryable() {
        anyhow!("{} failed: {} (retry with the same command)", what, e)
    } else {
        anyhow!("{} failed: {}", what, e)
    }
}

async fn run_analyze(api: &dyn DiagnosisApi, image: Bytes, assisted: bool, output: Output) -> Result<String> {
    let key = image_key(&image, assisted);
    info!(key = %key, bytes = image.len(), assisted, "analyze invoked");
    let res: ApiResult<AnalysisReport> = with_ctrl_c(api, &key, api.analyze_plant_image(image, assisted)).await;
    let report = res.map_err(|e| failure("analysis", e))?;
    render_report(&report, output)
}

async fn run_chat(api: &dyn DiagnosisApi, mut session: ChatSession, retry_turn: bool, message: &str, output: Output) -> Result<String> {
    let key = if retry_turn { session.current() } else { session.next_turn() };
    info!(key = %key, "chat invoked");
    let res = with_ctrl_c(api, &key, api.chat_with_assistant(key.clone(), message)).await;
    let reply = res.map_err(|e| failure("chat", e))?;
    render_reply(&session, &reply, output)
}

fn render_config(cfg: &OrchestratorConfig, output: Output) -> Result<String> {
    Ok(match output {
        Output::Json => serde_json::to_string_pretty(cfg)?,
        Output::Human => {
            let ms = |d: Duration| d.as_millis();
            let attempt = cfg.attempt_timeout.map(|d| format!("{}ms", ms(d))).unwrap_or_else(|| "timeout / max_attempts".to_string());
            [
                format!("max_attempts       {}", cfg.max_attempts),
                format!("base_delay         {}ms", ms(cfg.base_delay)),
                format!("max_delay          {}ms", ms(cfg.max_delay)),
                format!("default_timeout    {}ms", ms(cfg.default_timeout)),
                format!("attempt_timeout    {}", attempt),
                format!("retention          {}s", cfg.retention.as_secs()),
                format!("retention_cap      {}", cfg.retention_cap),
                format!("max_payload_bytes  {}", cfg.max_payload_bytes),
            ]
            .join("\n")
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut api = InProcApi::from_env(cli.backend.as_deref())?;
    if let Some(ms) = cli.timeout_ms {
        api = api.with_timeout(Duration::from_millis(ms));
    }

    let out = match cli.command {
        Commands::Analyze { image, assisted } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading image {}", image.display()))?;
            run_analyze(&api, Bytes::from(bytes), assisted, cli.output).await
        }
        Commands::Chat { message, session, turn, retry } => {
            let session = match (session, turn) {
                (Some(id), Some(t)) => ChatSession::resume(id, t),
                _ => ChatSession::new(),
            };
            run_chat(&api, session, retry, &message, cli.output).await
        }
        Commands::Config => render_config(&api.config(), cli.output),
    };

    match out {
        Ok(s) => {
            println!("{}", s);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
