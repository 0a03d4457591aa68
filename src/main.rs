use std::path::PathBuf;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod events;
mod hasher;
mod reaper;
mod service;
mod similarity;
mod upload;

use config::ServiceCfg;

/// Compare two uploaded images by content digest and perceptual similarity.
#[derive(Parser, Debug, Default)]
#[command(name = "forgecheck", version)]
struct Cli {
    /// YAML config file; every key is optional.
    #[arg(long, env = "FORGECHECK_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on, e.g. 0.0.0.0:5000.
    #[arg(long, env = "FORGECHECK_BIND")]
    bind: Option<String>,
    #[arg(long, env = "FORGECHECK_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,
    #[arg(long, env = "FORGECHECK_MAX_BODY_BYTES")]
    max_body_bytes: Option<u64>,
    /// Compute the structural similarity index.
    #[arg(long, env = "FORGECHECK_SSIM")]
    ssim: Option<bool>,
    /// Compute keypoint matches.
    #[arg(long, env = "FORGECHECK_KEYPOINTS")]
    keypoints: Option<bool>,
}

/// Defaults, then the config file, then flags/env.
fn resolve_config(cli: Cli) -> Result<ServiceCfg> {
    let mut cfg = match &cli.config {
        Some(path) => ServiceCfg::from_file(path)?,
        None => ServiceCfg::default(),
    };
    if let Some(bind) = cli.bind { cfg.bind = bind; }
    if let Some(dir) = cli.scratch_dir { cfg.scratch_dir = dir; }
    if let Some(n) = cli.max_body_bytes { cfg.max_body_bytes = n; }
    if let Some(on) = cli.ssim { cfg.metrics.ssim = on; }
    if let Some(on) = cli.keypoints { cfg.metrics.keypoints = on; }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forgecheck=info,tower_http=info")),
        )
        .init();

    let cfg = resolve_config(Cli::parse())?;
    api::serve(cfg).await
}
