//! Fotiva Background Worker
//!
//! Handles scheduled jobs:
//! - Billing invariant checks (`INVARIANT_CHECK_CRON`, hourly by default)
//! - Worker heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use fotiva_billing::{InvariantCheckSummary, InvariantChecker, PgBillingStore, ViolationSeverity};
use fotiva_shared::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 0 * * * *";

/// Log the outcome of one invariant check run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariant checks passed"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                coupon_codes = ?violation.coupon_codes,
                "{}",
                violation.description
            ),
            ViolationSeverity::High | ViolationSeverity::Medium => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                coupon_codes = ?violation.coupon_codes,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Fotiva Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let checker = Arc::new(InvariantChecker::new(Arc::new(PgBillingStore::new(pool))));
    let schedule = std::env::var("INVARIANT_CHECK_CRON")
        .unwrap_or_else(|_| DEFAULT_INVARIANT_CHECK_CRON.to_string());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!(schedule = %schedule, "Scheduled: Billing invariant checks");

    // Job 2: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Worker heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Fotiva Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
