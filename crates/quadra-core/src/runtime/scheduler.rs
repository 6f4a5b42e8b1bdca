use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::registry::JobDefinition;
use crate::types::Schedule;

/// Spawn the recurring-dispatch task for one scheduled definition.
///
/// The scheduler only enqueues at each boundary; it does not
/// deduplicate overlapping runs. Handlers whose correctness needs
/// at-most-one-concurrent-execution take a lock themselves.
pub(crate) fn spawn_schedule(
    definition: Arc<JobDefinition>,
    dispatcher: Dispatcher,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_schedule(definition, dispatcher, shutdown))
}

async fn run_schedule(
    definition: Arc<JobDefinition>,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    // Validated at registration, so absence here is a programming error
    // worth a loud log rather than a panic.
    let Some(schedule) = definition.schedule.clone() else {
        warn!(job = %definition.name, "Schedule task spawned for unscheduled definition");
        return;
    };

    info!(job = %definition.name, ?schedule, "Recurring schedule started");
    loop {
        let Some(wait) = time_to_next_boundary(&schedule) else {
            warn!(job = %definition.name, "Schedule has no further boundaries, stopping");
            return;
        };

        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(job = %definition.name, "Recurring schedule stopped");
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            debug!(job = %definition.name, "Recurring schedule stopped");
            return;
        }

        match dispatcher.dispatch(&definition.name, json!({})).await {
            Ok(job_id) => {
                debug!(job = %definition.name, job_id = %job_id, "Scheduled dispatch")
            }
            Err(e) => warn!(job = %definition.name, error = %e, "Scheduled dispatch failed"),
        }
    }
}

/// Time until the next scheduling boundary, or `None` for a cron
/// expression with no upcoming fire time.
fn time_to_next_boundary(schedule: &Schedule) -> Option<Duration> {
    match schedule {
        Schedule::Every(interval) => Some(*interval),
        Schedule::Cron(expr) => {
            // Parse errors cannot happen here; registration validated.
            let parsed = cron::Schedule::from_str(expr).ok()?;
            let next = parsed.upcoming(Utc).next()?;
            let wait = next - Utc::now();
            Some(wait.to_std().unwrap_or(Duration::ZERO))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_boundary() {
        let schedule = Schedule::Every(Duration::from_secs(30));
        assert_eq!(
            time_to_next_boundary(&schedule),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_cron_boundary_is_in_the_future() {
        // Every minute at second zero.
        let schedule = Schedule::Cron("0 * * * * *".to_string());
        let wait = time_to_next_boundary(&schedule).unwrap();
        assert!(wait <= Duration::from_secs(60));
    }
}
