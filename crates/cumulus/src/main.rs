//! CPI executable
//!
//! The orchestration director runs this binary once per request: one JSON
//! frame on stdin, one JSON frame on stdout, exit code 0 no matter what.
//! Failures are reported inside the response frame; stdout carries nothing
//! but the frame, so logging goes to stderr.

use clap::Parser;
use cumulus_arm::transport::ReqwestTransport;
use cumulus_arm::ArmClient;
use cumulus_cpi::{
    CatalogResolver, CpiConfig, CpiResponse, Dispatcher, ErrorFrame, VmOrchestrator,
};
use cumulus_lock::FileBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Parser)]
#[command(name = "cumulus-cpi")]
#[command(about = "Cloud Provider Interface for the Cumulus platform", version)]
struct Cli {
    /// Path to the CPI configuration file
    #[arg(short, long, env = "CUMULUS_CPI_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let response = run(&cli).await;

    match serde_json::to_string(&response) {
        Ok(frame) => println!("{frame}"),
        // Response values are always encodable; this is unreachable in
        // practice but stdout must still carry a frame.
        Err(err) => println!(
            r#"{{"result":null,"error":{{"type":"Unknown","message":"{err}","ok_to_retry":false}},"log":""}}"#
        ),
    }
}

async fn run(cli: &Cli) -> CpiResponse {
    let config = match CpiConfig::load(&cli.config).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(path = %cli.config.display(), error = %err, "Configuration rejected");
            return failure(&err);
        }
    };

    let mut raw = String::new();
    if let Err(err) = tokio::io::stdin().read_to_string(&mut raw).await {
        tracing::error!(error = %err, "Cannot read the request frame");
        return failure(&cumulus_cpi::CpiError::BadRequest(format!(
            "cannot read stdin: {err}"
        )));
    }

    let client = Arc::new(ArmClient::new(Arc::new(ReqwestTransport::new()), config.arm));
    let backend = Arc::new(FileBackend::new(&config.lock_dir));
    let resolver = Arc::new(CatalogResolver::new(config.stemcells));
    let orchestrator = VmOrchestrator::new(client, backend, resolver, config.orchestrator);

    Dispatcher::new(orchestrator).handle_raw(&raw).await
}

fn failure(err: &cumulus_cpi::CpiError) -> CpiResponse {
    CpiResponse {
        result: serde_json::Value::Null,
        error: Some(ErrorFrame {
            kind: err.type_name().to_string(),
            message: err.to_string(),
            ok_to_retry: err.ok_to_retry(),
        }),
        log: String::new(),
    }
}
