//! Line-oriented bridge: one JSON envelope per line on stdin, every outbound
//! envelope as one JSON line on stdout.
//!
//! ```text
//! cargo run --example stdio_bridge -- [config.json]
//! cargo run --example stdio_bridge -- --schema
//! ```

use std::env;
use std::process;
use std::time::Duration;

use anyhow::Context;
use rtermtel::config::CoreConfig;
use rtermtel::driver::DriverRegistry;
use rtermtel::envelope::envelope_schema;
use rtermtel::router::Router;
use rtermtel::telemetry::telemetry_update_schema;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn print_usage() {
    eprintln!("Usage: cargo run --example stdio_bridge -- [config.json] [--schema]");
}

fn print_schemas() -> anyhow::Result<()> {
    let schemas = serde_json::json!({
        "envelope": envelope_schema(),
        "telemetry_update": telemetry_update_schema(),
    });
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let mut config_path = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--schema" => return print_schemas(),
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            flag if flag.starts_with("--") => {
                eprintln!("Unknown flag: {flag}");
                print_usage();
                process::exit(2);
            }
            path => config_path = Some(path.to_string()),
        }
    }

    let config = match &config_path {
        Some(path) => CoreConfig::from_json_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => CoreConfig::default(),
    };

    let (router, mut outbound) = Router::new(config, DriverRegistry::with_builtin());

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = outbound.recv().await {
            let line = format!("{}\n", envelope.to_json());
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        router.handle_inbound(&line);
    }

    router.shutdown().await;
    drop(router);
    // A worker that is still winding down may hold an emitter.
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    Ok(())
}
