//! Per-batch cluster accounting log.

use crate::core::Batch;
use crate::pipeline::BatchReport;
use crate::scheduler::JobScheduler;
use crate::session::SessionContext;
use crate::utils::{format_elapsed, format_iso8601};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{info, warn};

/// Writes the accounting record of a batch to durable storage.
///
/// The log is an audit trail: failures are logged and otherwise ignored.
/// Returns the log path when it was written.
pub async fn record_accounting(
    scheduler: &dyn JobScheduler,
    session: &SessionContext,
    batch: &Batch,
    report: &BatchReport,
) -> Option<PathBuf> {
    let path = session
        .layout()
        .accounting_log(&session.session_id().to_string(), &batch.start_stamp());

    let mut body = String::new();
    let _ = writeln!(
        body,
        "# session {} batch {}/{} started {} entities {}",
        session.session_id(),
        batch.index,
        batch.total,
        format_iso8601(&batch.started_at),
        batch.entity_count
    );
    for stage in &report.stages {
        let _ = writeln!(
            body,
            "# stage {} job {} tasks {} state {} elapsed {}",
            stage.stage,
            stage.job_id.as_deref().unwrap_or("-"),
            stage.extent,
            stage.terminal_state,
            format_elapsed(stage.elapsed)
        );
    }

    match scheduler.accounting(&report.job_ids()).await {
        Ok(table) => body.push_str(&table),
        Err(e) => {
            warn!(batch = batch.index, error = %e, "Scheduler accounting unavailable");
            let _ = writeln!(body, "# accounting unavailable: {e}");
        }
    }

    let written = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::write(&path, body));
    match written {
        Ok(()) => {
            info!(batch = batch.index, path = %path.display(), "Accounting recorded");
            Some(path)
        }
        Err(e) => {
            warn!(batch = batch.index, path = %path.display(), error = %e, "Cannot write accounting log");
            None
        }
    }
}
