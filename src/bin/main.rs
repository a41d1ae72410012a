use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use evhost::daemon::run::{serve, Collaborators};
use evhost::kv::MemoryStore;
use evhost::telemetry;
use evhost::vm::UnlinkedFactory;
use evhost::WorkerArgs;

fn main() -> ExitCode {
    // clap exits with code 2 when the controller passes too few arguments.
    let args = WorkerArgs::parse();

    let telemetry = telemetry::init(1);

    if args.breakpad_on.trim() == "true" {
        // The crash handler is wired up by the embedder; record the intent
        // so a missing one is diagnosable from the log.
        tracing::info!(diag_dir = %args.diag_dir.display(), "crash handler requested");
    }

    let collaborators = Collaborators {
        // The script engine links in through `vm::EngineFactory`; without
        // one the worker still serves control traffic.
        engines: Arc::new(UnlinkedFactory),
        kv: Arc::new(MemoryStore::new()),
        telemetry,
    };

    match serve(args, collaborators) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "worker failed");
            ExitCode::FAILURE
        }
    }
}
