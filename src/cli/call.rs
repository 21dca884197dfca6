use anyhow::Context;
use clap::Args;
use serde_json::Value;

use super::CliContext;
use super::run::{LogArgs, init_logging, start_bridge};
use worker_bridge::worker_channel::{Id, Request};

#[derive(Args, Debug)]
pub struct CallArgs {
    /// JSON-RPC method, e.g. `tools/list`
    #[arg(long)]
    pub method: String,

    /// Params as a JSON document
    #[arg(long)]
    pub params: Option<String>,

    /// Request id. Numeric ids are sent as numbers.
    #[arg(long, default_value = "1")]
    pub id: String,

    #[command(flatten)]
    pub logging: LogArgs,
}

pub async fn execute(args: CallArgs, context: &CliContext) -> anyhow::Result<()> {
    let params = args
        .params
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--params is not valid JSON")?;
    let id = match args.id.parse::<i64>() {
        Ok(n) => Id::Number(n),
        Err(_) => Id::String(args.id.clone()),
    };

    let telemetry = init_logging(context, &args.logging)?;
    let bridge = start_bridge(context).await?;

    let dispatched = bridge
        .multiplexer()
        .dispatch(Request::call(id, args.method, params), None, None)
        .await;
    println!("{}", serde_json::to_string_pretty(&dispatched.response)?);

    bridge.shutdown();
    telemetry.shutdown();
    Ok(())
}
