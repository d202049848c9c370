use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "shadowdesk", version, about = "Proxy session orchestrator speaking JSON lines over stdio")]
pub struct Arguments {
    /// App config file (.toml or .json)
    #[arg(short, long, env = "SHADOWDESK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Runtime directory (overrides the config file)
    #[arg(long, env = "SHADOWDESK_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Log filter, e.g. `shadowdesk=debug` (RUST_LOG wins when set)
    #[arg(long)]
    pub log: Option<String>,
}
