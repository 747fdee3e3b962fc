#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use periscope::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "periscope",
    about = "Interactive intercepting proxy with MITM and in-flight rewrites"
)]
struct Cli {
    /// Path to the proxy config file (TOML or JSON; optional)
    #[arg(short, long, default_value = "periscope.toml")]
    config: PathBuf,

    /// Listen address for the proxy (also serves the /api control surface)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
    }))
}
