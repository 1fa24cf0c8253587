//! Fabric worker process - main entry point.
//!
//! Speaks the frame protocol on stdin/stdout and runs deployed source with the
//! script sandbox. Launched by `ProcessSpawner`; not meant to be run by hand.

use clap::Parser;
use fabric_core::worker::{serve_stdio, ScriptSandbox, WorkerRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "fabric-worker", about = "Fabric worker process")]
struct Args {
    /// Node TTL in milliseconds. The worker exits on its own after twice this
    /// long (lifetime plus drain window) in case the coordinator is gone.
    #[arg(long, default_value_t = 0)]
    ttl: u64,

    /// Maximum frame payload size in bytes.
    #[arg(long, env = "FABRIC_MAX_FRAME_BYTES", default_value_t = 5 * 1024 * 1024)]
    max_frame_bytes: u32,

    /// Shell used to run deployed scripts.
    #[arg(long, default_value = "/bin/sh")]
    shell: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    fabric_core::observability::init_worker_tracing();
    tracing::debug!("Worker starting (ttl={}ms, pid={})", args.ttl, std::process::id());

    let runtime = Arc::new(WorkerRuntime::new(Arc::new(ScriptSandbox::new(args.shell))));
    let serve = serve_stdio(runtime, args.max_frame_bytes);

    if args.ttl == 0 {
        serve.await?;
    } else {
        let lifetime = Duration::from_millis(args.ttl.saturating_mul(2));
        tokio::select! {
            result = serve => result?,
            _ = tokio::time::sleep(lifetime) => {
                tracing::warn!("Worker outlived {:?} without being recycled, exiting", lifetime);
            }
        }
    }

    // Blocking stdin reads keep the runtime from shutting down on its own.
    std::process::exit(0);
}
