//! Foreground driver for one task: what a polling admin screen does, from a
//! terminal. Each iteration is one `advance` call on a blocking thread; a
//! shutdown signal turns into a cooperative cancel request.

use backup_engine::store::Store;
use backup_engine::task::{StatusKind, TaskId};
use backup_engine::{TaskOrchestrator, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn drive_task<S, F>(
    orchestrator: Arc<TaskOrchestrator<S>>,
    task_id: TaskId,
    poll_interval: Duration,
    shutdown: CancellationToken,
    mut on_status: F,
) -> anyhow::Result<TaskStatus>
where
    S: Store + 'static,
    F: FnMut(&TaskStatus),
{
    let mut cancel_sent = false;

    loop {
        if shutdown.is_cancelled() && !cancel_sent {
            let orch = orchestrator.clone();
            let id = task_id.clone();
            let accepted = tokio::task::spawn_blocking(move || orch.request_cancel(&id)).await??;
            if !accepted {
                tracing::warn!(task_id = %task_id, "Cancel ignored: task already finished");
            }
            cancel_sent = true;
        }

        let orch = orchestrator.clone();
        let id = task_id.clone();
        let status = tokio::task::spawn_blocking(move || orch.advance(&id)).await??;
        on_status(&status);

        if status.status != StatusKind::Running {
            tracing::info!(task_id = %task_id, status = ?status.status, "Task finished");
            return Ok(status);
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.cancelled(), if !cancel_sent => {}
        }
    }
}
