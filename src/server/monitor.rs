//! Time-limit enforcement.
//!
//! The scheduler core never reads the wall clock; this task does, on a
//! fixed tick, and turns elapsed limits into ordinary deletions. It is only
//! spawned when the daemon runs with `abort_on_time_limit`.

use crate::server::{notify, SharedState};
use std::time::{Duration, SystemTime};

const TICK: Duration = Duration::from_secs(30);

pub async fn run(state: SharedState, notify_timeout: Duration) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;
        tick(&state, SystemTime::now(), notify_timeout).await;
    }
}

/// One sweep: delete every running job whose limit has elapsed as of `now`,
/// send its origin a best-effort `timeout`, and deliver whatever start
/// notices the freed resources produced.
async fn tick(state: &SharedState, now: SystemTime, notify_timeout: Duration) {
    let (victims, notices) = {
        let mut scheduler = state.write().await;
        let overdue = scheduler.overdue_jobs(now);
        let mut victims = Vec::with_capacity(overdue.len());
        for job_id in overdue {
            // Still behind the same write lock, so the job cannot have
            // changed since overdue_jobs looked at it.
            if let Some(job) = scheduler.get_job(job_id) {
                victims.push((job_id, job.request.host.clone(), job.request.port));
            }
        }
        for (job_id, _, _) in &victims {
            tracing::warn!("Job {job_id} exceeded its time limit, deleting");
            scheduler.delete_job(*job_id);
        }
        (victims, scheduler.take_notices())
    };

    for (_, host, port) in victims {
        notify::notify(&host, port, "timeout", notify_timeout).await;
    }
    notify::deliver_start_notices(notices, notify_timeout);
}
