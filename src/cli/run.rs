use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Args;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::CliContext;
use worker_bridge::Bridge;
use worker_bridge::config::BridgeConfig;
use worker_bridge::logger::{TelemetryGuard, init_tracing};
use worker_bridge::multiplexer::Multiplexer;
use worker_bridge::worker_channel::jsonrpc::{INVALID_REQUEST, PARSE_ERROR};
use worker_bridge::worker_channel::{Id, Message, Response};

const LOG_FILE: &str = "logs/worker-bridge.log";
const EVENT_FILE: &str = "logs/worker-bridge-events.json";

#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318/v1/logs)
    #[arg(long)]
    pub otel_logs_endpoint: Option<String>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318/v1/metrics)
    #[arg(long)]
    pub otel_events_endpoint: Option<String>,
}

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_logs_endpoint: None,
            otel_events_endpoint: None,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Session every stdin request runs in. A fresh one is created when omitted.
    #[arg(long)]
    pub session: Option<String>,

    #[command(flatten)]
    pub logging: LogArgs,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            session: None,
            logging: LogArgs::default(),
        }
    }
}

/// Install tracing under the root. Stdout stays reserved for JSON-RPC output.
pub fn init_logging(context: &CliContext, args: &LogArgs) -> anyhow::Result<TelemetryGuard> {
    if !context.root.exists() {
        bail!(
            "Root directory `{}` does not exist. Set BRIDGE_ROOT to an existing directory.",
            context.root.display()
        );
    }
    init_tracing(
        context.root.clone(),
        LOG_FILE.to_string(),
        EVENT_FILE.to_string(),
        args.log_level.clone(),
        args.otel_logs_endpoint.clone(),
        args.otel_events_endpoint.clone(),
    )
    .context("could not create logger")
}

/// Load the config, spawn the worker and wait for its handshake.
pub async fn start_bridge(context: &CliContext) -> anyhow::Result<Bridge> {
    let config = BridgeConfig::load(&context.config_manager)
        .await
        .context("loading bridge config")?;
    let bridge = Bridge::start(config).context("starting worker")?;
    bridge
        .wait_until_ready()
        .await
        .context("worker did not complete the initialize handshake")?;
    Ok(bridge)
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let telemetry = init_logging(context, &args.logging)?;
    let bridge = match start_bridge(context).await {
        Ok(bridge) => bridge,
        Err(err) => {
            error!("Failed to start worker bridge: {:#}", err);
            telemetry.shutdown();
            return Err(err);
        }
    };

    let session = bridge.sessions().get_or_create(args.session.as_deref()).id;
    info!(worker = %bridge.worker().name(), session = %session, "worker bridge running");
    eprintln!("worker bridge running (session {session}); press Ctrl-C to exit");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let session: Arc<str> = session.into();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(
                    &line,
                    bridge.multiplexer(),
                    &session,
                    &out_tx,
                    &mut inflight,
                ),
                Ok(None) => {
                    info!("stdin closed, draining in-flight requests");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read stdin");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupted, abandoning in-flight requests");
                inflight.abort_all();
                break;
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }
    while inflight.join_next().await.is_some() {}

    bridge.shutdown();
    drop(out_tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "stdout writer stopped abnormally");
    }
    info!("worker bridge shut down");
    telemetry.shutdown();
    Ok(())
}

fn handle_line(
    line: &str,
    multiplexer: &Multiplexer,
    session: &Arc<str>,
    out: &mpsc::UnboundedSender<String>,
    inflight: &mut JoinSet<()>,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            emit(
                out,
                &Response::fail(
                    Id::Null,
                    PARSE_ERROR,
                    "Parse error",
                    Some(json!({ "details": e.to_string() })),
                ),
            );
            return;
        }
    };
    let fallback_id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<Id>(id.clone()).ok())
        .unwrap_or(Id::Null);

    match Message::from_value(value) {
        Ok(Message::Request(request)) if request.is_notification() => {
            if let Err(e) = multiplexer.notify(request) {
                warn!(error = %e, "notification not forwarded");
            }
        }
        Ok(Message::Request(request)) => {
            let multiplexer = multiplexer.clone();
            let session = Arc::clone(session);
            let out = out.clone();
            inflight.spawn(async move {
                let dispatched = multiplexer.dispatch(request, Some(&*session), None).await;
                emit(&out, &dispatched.response);
            });
        }
        Ok(Message::Response(response)) => {
            warn!(id = %response.id, "ignoring a response written to stdin");
        }
        Err(e) => emit(out, &Response::fail(fallback_id, INVALID_REQUEST, e.to_string(), None)),
    }
}

fn emit(out: &mpsc::UnboundedSender<String>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(line) => {
            if out.send(line).is_err() {
                warn!(id = %response.id, "stdout closed, response dropped");
            }
        }
        Err(e) => error!(error = %e, "could not serialize response"),
    }
}
