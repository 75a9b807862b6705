use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::db::{DbConfig, DbController};

/// Initialize tracing subscriber controlled by the `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A controller with background compaction disabled: the started flag is
/// set directly so no roll job is ever enqueued. Tests drive rolls by hand
/// via [`roll`].
pub fn manual_controller(dir: &Path) -> DbController {
    init_tracing();
    let controller = DbController::new(DbConfig {
        db_directory: dir.to_path_buf(),
        num_worker_threads: 2,
        ..DbConfig::default()
    })
    .unwrap();
    controller.inner.started.store(true, Ordering::SeqCst);
    controller
}

/// A started controller whose background roll fires every few
/// milliseconds. Used by the concurrency tests.
pub fn background_controller(dir: &Path, gap: Duration) -> DbController {
    init_tracing();
    let controller = DbController::new(DbConfig {
        db_directory: dir.to_path_buf(),
        background_task_min_gap: gap,
        num_worker_threads: 2,
        ..DbConfig::default()
    })
    .unwrap();
    controller.start();
    controller
}

/// Runs one synchronous roll on the caller's thread.
pub fn roll(controller: &DbController) {
    controller.inner.roll_once();
}
