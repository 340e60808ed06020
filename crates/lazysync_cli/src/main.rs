//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `lazysync_core` wiring.
//! - Run one offline edit, a reconnect and an online edit against the
//!   loopback remote.
//!
//! Usage: `lazysync_cli [DB_PATH]`. Without a path an in-memory database is used.
//! Set `LAZYSYNC_LOG_DIR` to an absolute directory to capture core logs.

use lazysync_core::db::{open_db, open_db_in_memory};
use lazysync_core::{
    EngineResult, LoopbackRemote, SqliteBlobStore, SyncConfig, SyncOutcome, SystemClock, Task,
    TaskEngine,
};
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    println!("lazysync_core version={}", lazysync_core::core_version());
    if let Ok(log_dir) = std::env::var("LAZYSYNC_LOG_DIR") {
        if let Err(err) = lazysync_core::init_logging(lazysync_core::default_log_level(), &log_dir) {
            eprintln!("lazysync_cli logging_disabled error={err}");
        }
    }
    match run(std::env::args().nth(1)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lazysync_cli error={err}");
            ExitCode::FAILURE
        }
    }
}

fn run(db_path: Option<String>) -> EngineResult<()> {
    let conn = match db_path.as_deref() {
        Some(path) => open_db(path),
        None => open_db_in_memory(),
    }
    .map_err(lazysync_core::RepoError::from)?;
    let store = SqliteBlobStore::try_new(conn)?;
    let clock = Arc::new(SystemClock);
    let remote = LoopbackRemote::<Task>::new(clock.clone());

    let mut engine = TaskEngine::open(
        SyncConfig::new("cli"),
        Box::new(store),
        remote.clone(),
        clock,
        false,
    )?;
    let task = engine.create(Task::new("smoke task"))?;
    engine.toggle_status(task.id)?;
    print_status("offline", &engine);

    let outcome = engine.on_connectivity_changed(true);
    let label = match outcome {
        SyncOutcome::Completed(_) => "synced",
        SyncOutcome::Failed(_) => "sync_failed",
        SyncOutcome::Skipped(_) => "sync_skipped",
    };
    print_status(label, &engine);

    engine.update(task.id, |t| t.title = "smoke task, edited".to_string())?;
    let label = match engine.poll_replay() {
        SyncOutcome::Completed(_) => "replayed",
        SyncOutcome::Failed(_) => "replay_failed",
        SyncOutcome::Skipped(_) => "replay_skipped",
    };
    print_status(label, &engine);
    println!("remote entities={}", remote.entities().len());
    engine.flush()
}

fn print_status(label: &str, engine: &TaskEngine<LoopbackRemote<Task>>) {
    let status = engine.status();
    println!(
        "{label} state={} pending={} failed={} stale={}",
        status.connection_state.as_str(),
        status.pending_count,
        status.failed_count,
        status.local_data_stale
    );
}
