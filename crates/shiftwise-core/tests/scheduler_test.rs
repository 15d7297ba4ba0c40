// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recurring job runner: leader election, permits, backoff and alerts.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use shiftwise_core::{Execution, Persistence};
use shiftwise_core::persistence::SqlitePersistence;
use shiftwise_core::scheduler::{
    AlwaysPrimary, JOB_RUNNER_LEASE, JobBackoff, JobTickOutcome, LeaderElection,
    LeaseLeaderElection, RecurringJob, RecurringJobRunner, RunRetentionJob, StepExpiryJob,
    TickReport,
};
use shiftwise_core::step::StepSpec;
use shiftwise_protocol::{Capacity, ResizeStrategy};

/// Fails the first `failures` runs, then succeeds.
struct FlakyJob {
    failures: u32,
    runs: AtomicU32,
}

impl FlakyJob {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            runs: AtomicU32::new(0),
        })
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecurringJob for FlakyJob {
    fn name(&self) -> &str {
        "flaky"
    }

    fn account_id(&self) -> &str {
        "acc-1"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            anyhow::bail!("provider unavailable");
        }
        Ok(())
    }
}

async fn persistence() -> Arc<SqlitePersistence> {
    Arc::new(SqlitePersistence::in_memory().await.unwrap())
}

/// Permits free up immediately so every tick runs the job.
fn no_wait(max_failures: u32) -> JobBackoff {
    JobBackoff {
        base_lease: Duration::ZERO,
        max_lease: Duration::ZERO,
        max_failures,
    }
}

fn outcomes(report: TickReport) -> Vec<(String, JobTickOutcome)> {
    match report {
        TickReport::Ran(outcomes) => outcomes,
        TickReport::NotPrimary => panic!("expected to be primary"),
    }
}

#[tokio::test]
async fn test_successful_job_runs_every_tick() {
    let persistence = persistence().await;
    let job = FlakyJob::new(0);
    let runner = RecurringJobRunner::new(
        persistence.clone(),
        Arc::new(AlwaysPrimary),
        Duration::from_secs(60),
    )
    .with_job(job.clone());

    for _ in 0..3 {
        let report = outcomes(runner.tick().await.unwrap());
        assert_eq!(
            report,
            vec![("flaky".to_string(), JobTickOutcome::Succeeded)]
        );
    }
    assert_eq!(job.runs(), 3);

    let permit = persistence
        .get_job_permit("flaky", "acc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(permit.failure_count, 0);
    assert!(!permit.disabled);
    assert!(permit.last_error.is_none());
}

#[tokio::test]
async fn test_failure_holds_permit() {
    let persistence = persistence().await;
    let job = FlakyJob::new(1);
    let runner = RecurringJobRunner::new(
        persistence.clone(),
        Arc::new(AlwaysPrimary),
        Duration::from_secs(60),
    )
    .with_job(job.clone());

    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(
        report[0].1,
        JobTickOutcome::Failed {
            failures: 1,
            disabled: false
        }
    );

    // Held for base * 2 after the first failure
    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(report[0].1, JobTickOutcome::PermitHeld);
    assert_eq!(job.runs(), 1);

    let permit = persistence
        .get_job_permit("flaky", "acc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(permit.failure_count, 1);
    assert_eq!(permit.last_error.as_deref(), Some("provider unavailable"));
    assert!(permit.leased_until > chrono::Utc::now() + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn test_repeated_failures_disable_job_and_open_alert() {
    let persistence = persistence().await;
    let job = FlakyJob::new(u32::MAX);
    let runner = RecurringJobRunner::new(
        persistence.clone(),
        Arc::new(AlwaysPrimary),
        Duration::from_secs(60),
    )
    .with_job(job.clone())
    .with_backoff(no_wait(2));

    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(
        report[0].1,
        JobTickOutcome::Failed {
            failures: 1,
            disabled: false
        }
    );
    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(
        report[0].1,
        JobTickOutcome::Failed {
            failures: 2,
            disabled: true
        }
    );
    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(report[0].1, JobTickOutcome::Disabled);
    assert_eq!(job.runs(), 2);

    let alert = persistence
        .get_alert_state("acc-1", "flaky")
        .await
        .unwrap()
        .expect("alert opened");
    assert!(alert.is_open);
    assert!(
        alert
            .message
            .as_deref()
            .unwrap()
            .contains("disabled after 2 failures")
    );
}

#[tokio::test]
async fn test_success_after_failure_resets_and_closes_alert() {
    let persistence = persistence().await;
    let job = FlakyJob::new(2);
    let runner = RecurringJobRunner::new(
        persistence.clone(),
        Arc::new(AlwaysPrimary),
        Duration::from_secs(60),
    )
    .with_job(job.clone())
    .with_backoff(no_wait(5));

    persistence
        .set_alert_state("acc-1", "flaky", true, Some("stale"))
        .await
        .unwrap();

    runner.tick().await.unwrap();
    runner.tick().await.unwrap();
    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(report[0].1, JobTickOutcome::Succeeded);

    let permit = persistence
        .get_job_permit("flaky", "acc-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(permit.failure_count, 0);

    let alert = persistence
        .get_alert_state("acc-1", "flaky")
        .await
        .unwrap()
        .unwrap();
    assert!(!alert.is_open);
}

#[tokio::test]
async fn test_only_the_lease_holder_runs_jobs() {
    let persistence = persistence().await;
    let primary = LeaseLeaderElection::new(
        persistence.clone(),
        JOB_RUNNER_LEASE,
        "instance-a",
        Duration::from_secs(300),
    );
    assert!(primary.is_primary().await.unwrap());
    // Renewal by the holder
    assert!(primary.is_primary().await.unwrap());

    let job = FlakyJob::new(0);
    let standby = RecurringJobRunner::new(
        persistence.clone(),
        Arc::new(LeaseLeaderElection::new(
            persistence.clone(),
            JOB_RUNNER_LEASE,
            "instance-b",
            Duration::from_secs(300),
        )),
        Duration::from_secs(60),
    )
    .with_job(job.clone());

    assert_eq!(standby.tick().await.unwrap(), TickReport::NotPrimary);
    assert_eq!(job.runs(), 0);
}

#[tokio::test]
async fn test_expired_lease_changes_hands() {
    let persistence = persistence().await;
    let a = LeaseLeaderElection::new(persistence.clone(), "lease", "a", Duration::ZERO);
    let b = LeaseLeaderElection::new(persistence.clone(), "lease", "b", Duration::from_secs(300));

    assert!(a.is_primary().await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(b.is_primary().await.unwrap());
    assert!(!a.is_primary().await.unwrap());
}

#[tokio::test]
async fn test_run_retention_collects_only_finished_runs() {
    let mut ctx = TestContext::new().await;
    let setup = || rolling_setup(Capacity::pinned(2), ResizeStrategy::DownsizeOldFirst);

    let live = new_run();
    ctx.complete_setup(&live, setup(), new_group(), Some(old_group(Capacity::pinned(2))))
        .await;
    let finished = new_run();
    let finished_setup = ctx
        .complete_setup(&finished, setup(), new_group(), Some(old_group(Capacity::pinned(2))))
        .await;
    let finished_activity = finished_setup.data.unwrap().activity_id;
    ctx.orchestrator.finish_run(&finished).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Generous retention keeps the finished run's history
    let keep = RunRetentionJob::new(ctx.persistence.clone(), "system", Duration::from_secs(86400));
    keep.run().await.unwrap();
    assert!(
        ctx.persistence
            .get_step_execution(&finished_activity)
            .await
            .unwrap()
            .is_some()
    );

    let purge = RunRetentionJob::new(ctx.persistence.clone(), "system", Duration::ZERO)
        .with_batch_size(1);
    assert_eq!(purge.name(), RunRetentionJob::NAME);
    purge.run().await.unwrap();

    assert!(
        ctx.persistence
            .get_run(&finished.workflow_execution_id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        ctx.persistence
            .get_step_execution(&finished_activity)
            .await
            .unwrap()
            .is_none()
    );
    assert!(ctx.persistence.get_activity(&finished_activity).await.unwrap().is_none());

    // A paused run outlives any retention period
    assert!(
        ctx.orchestrator
            .handoff()
            .setup_record(&live)
            .await
            .unwrap()
            .is_some()
    );
    let rollback = ctx
        .orchestrator
        .execute(&live, StepSpec::rollback("Rollback deploy", deploy_percent(100)))
        .await
        .unwrap();
    assert!(matches!(rollback, Execution::Suspended { .. }));
}

#[tokio::test]
async fn test_step_expiry_job_leaves_steps_within_deadline() {
    let mut ctx = TestContext::new().await;
    let run = new_run();
    ctx.complete_setup(
        &run,
        rolling_setup(Capacity::pinned(2), ResizeStrategy::DownsizeOldFirst),
        new_group(),
        Some(old_group(Capacity::pinned(2))),
    )
    .await;
    ctx.dispatch(&run, StepSpec::forward("Deploy 50%", deploy_percent(50)))
        .await;

    let runner = RecurringJobRunner::new(
        ctx.persistence.clone(),
        Arc::new(AlwaysPrimary),
        Duration::from_secs(60),
    )
    .with_job(Arc::new(StepExpiryJob::new(ctx.orchestrator.clone(), "system")));

    let report = outcomes(runner.tick().await.unwrap());
    assert_eq!(
        report,
        vec![(StepExpiryJob::NAME.to_string(), JobTickOutcome::Succeeded)]
    );
    assert_eq!(ctx.orchestrator.outstanding().await.unwrap(), 1);
}

#[tokio::test]
async fn test_runner_stops_on_shutdown() {
    let persistence = persistence().await;
    let runner = Arc::new(RecurringJobRunner::new(
        persistence,
        Arc::new(AlwaysPrimary),
        Duration::from_secs(3600),
    ));
    let shutdown = runner.shutdown_handle();

    let handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };
    shutdown.notify_one();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner stops")
        .unwrap();
}
