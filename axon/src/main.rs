//! Host process for the dendrite runtime.

use anyhow::Context;
use clap::Parser;
use dendrite::{BridgeConfig, Error, Runtime, RuntimeConfig};
use std::path::{Path, PathBuf};

/// Exit codes: 0 clean, 1 initialization failure, 2 script error,
/// 3 write-ahead log unavailable.
#[derive(Parser, Debug)]
#[clap(name = "axon", version, about = "Embedder process for the dendrite runtime")]
struct Opt {
    /// Location of the write-ahead log.
    #[clap(long, default_value = "./state.wal")]
    wal_path: PathBuf,

    /// Path to the foreign interpreter; falls back to $RUNTIME_HOME.
    #[clap(long)]
    foreign_runtime: Option<PathBuf>,

    /// Bootstrap script evaluated after initialization.
    #[clap(long)]
    script: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opt = Opt::parse();
    std::process::exit(run(opt));
}

fn run(opt: Opt) -> i32 {
    let runtime_path = opt
        .foreign_runtime
        .or_else(|| std::env::var_os("RUNTIME_HOME").map(PathBuf::from));
    let config = RuntimeConfig {
        wal_path: opt.wal_path,
        bridge: BridgeConfig {
            runtime_path,
            ..BridgeConfig::default()
        },
    };

    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(err @ Error::LogUnavailable(_)) | Err(err @ Error::MalformedRecord(_)) => {
            eprintln!("axon: write-ahead log unavailable: {}", err);
            return 3;
        }
        Err(err) => {
            eprintln!("axon: initialization failed: {}", err);
            return 1;
        }
    };

    if let Some(script) = &opt.script {
        if let Err(err) = run_script(&runtime, script) {
            eprintln!("axon: script failed: {:#}", err);
            return 2;
        }
    }
    0
}

fn run_script(runtime: &Runtime, path: &Path) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read script '{}'", path.display()))?;
    let out = runtime
        .bridge()
        .eval(&source, None)
        .with_context(|| format!("script '{}' raised an error", path.display()))?;
    tracing::info!(result = %format!("{:?}", out), "bootstrap script finished");
    Ok(())
}
