//! The three-phase concurrent executor: before-chains, then main chains
//! (grouped by host, capped at `workers_per_host`), then after-chains.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;

use crate::concurrency::ConcurrencyTable;
use crate::patch::Chain;
use crate::worker::{self, ProgressFn, WorkerError, WorkerReport, WorkerWarning};

pub const DEFAULT_WORKERS_PER_HOST: usize = 10;

/// Aggregated outcome of a full before→main→after pass.
#[derive(Debug, Clone, Default)]
pub struct GridReport {
    pub total_migrations: usize,
    pub processed_migrations: usize,
    pub num_errors: usize,
    pub errors: Vec<WorkerError>,
    pub warnings: Vec<WorkerWarning>,
    /// Errors from the after-phase specifically, kept distinct from `errors`
    /// so callers can report `after.sql` failures as their own condition
    /// rather than a generic grid failure.
    pub after_errors: Vec<WorkerError>,
}

impl GridReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    fn absorb(&mut self, report: WorkerReport) {
        self.processed_migrations += report.processed();
        if !report.errors.is_empty() {
            self.num_errors += 1;
        }
        self.errors.extend(report.errors);
        self.warnings.extend(report.warnings);
    }
}

/// Runs one three-phase pass. `main_chains` are grouped by host internally;
/// `before_chains`/`after_chains` run one worker each, concurrently.
pub async fn run(
    before_chains: Vec<Chain>,
    main_chains: Vec<Chain>,
    after_chains: Vec<Chain>,
    workers_per_host: usize,
    concurrency: ConcurrencyTable,
    on_progress: Option<ProgressFn>,
) -> GridReport {
    let mut report = GridReport::default();
    report.total_migrations = main_chains.iter().map(Chain::len).sum();

    info!("grid: before phase starting ({} chains)", before_chains.len());
    let before_report = run_phase_fully_parallel(before_chains, concurrency.clone(), on_progress.clone()).await;
    report.absorb(before_report);
    if !report.success() {
        error!("grid: before phase failed, aborting run");
        return report;
    }

    info!("grid: main phase starting ({} chains)", main_chains.len());
    let main_report = run_main_phase(main_chains, workers_per_host, concurrency.clone(), on_progress.clone()).await;
    report.absorb(main_report);

    info!("grid: after phase starting ({} chains)", after_chains.len());
    let after_report = run_phase_fully_parallel(after_chains, concurrency, on_progress).await;
    report.after_errors = after_report.errors.clone();
    report.absorb(after_report);

    report
}

async fn run_phase_fully_parallel(
    chains: Vec<Chain>,
    concurrency: ConcurrencyTable,
    on_progress: Option<ProgressFn>,
) -> WorkerReport {
    let mut handles = Vec::new();
    for chain in chains {
        let queue = Arc::new(Mutex::new(vec![chain]));
        let concurrency = concurrency.clone();
        let on_progress = on_progress.clone();
        handles.push(tokio::spawn(async move { worker::run(queue, concurrency, on_progress).await }));
    }

    let mut combined = WorkerReport::default();
    for handle in handles {
        if let Ok(report) = handle.await {
            combined.succeeded += report.succeeded;
            combined.errors.extend(report.errors);
            combined.warnings.extend(report.warnings);
        }
    }
    combined
}

async fn run_main_phase(
    chains: Vec<Chain>,
    workers_per_host: usize,
    concurrency: ConcurrencyTable,
    on_progress: Option<ProgressFn>,
) -> WorkerReport {
    let mut by_host: HashMap<String, Vec<Chain>> = HashMap::new();
    for chain in chains {
        by_host.entry(chain.dest.host.clone()).or_default().push(chain);
    }

    let mut handles = Vec::new();
    for (host, host_chains) in by_host {
        let worker_count = workers_per_host.min(host_chains.len()).max(1);
        let queue = Arc::new(Mutex::new(host_chains));
        info!("grid: spawning {worker_count} workers for host {host}");
        for _ in 0..worker_count {
            let queue = queue.clone();
            let concurrency = concurrency.clone();
            let on_progress = on_progress.clone();
            handles.push(tokio::spawn(async move { worker::run(queue, concurrency, on_progress).await }));
        }
    }

    let mut combined = WorkerReport::default();
    for handle in handles {
        if let Ok(report) = handle.await {
            combined.succeeded += report.succeeded;
            combined.errors.extend(report.errors);
            combined.warnings.extend(report.warnings);
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::Dest;
    use crate::migration::Variables;
    use crate::patch::{ChainType, Migration};
    use crate::runner::fake::FakeRunner;

    fn chain(host: &str, schema: &str, versions: &[&str], runner: FakeRunner) -> Chain {
        let dest = Dest::new(host, 5432, "u", "p", "d", schema, Arc::new(runner));
        let migrations = versions
            .iter()
            .map(|v| Migration {
                version: v.to_string(),
                sql: format!("SELECT 1; -- {v}"),
                vars: Variables::default(),
                new_versions: Some(vec![v.to_string()]),
            })
            .collect();
        Chain {
            kind: ChainType::Up,
            dest,
            migrations,
        }
    }

    #[tokio::test]
    async fn before_phase_failure_aborts_before_main_runs() {
        let before = vec![chain("h1", "public", &["0.before.all"], FakeRunner::failing_on("before"))];
        let main = vec![chain("h1", "sh0001", &["1.a.sh"], FakeRunner::new())];
        let report = grid_run(before, main, vec![]).await;
        assert!(!report.success());
        assert_eq!(report.processed_migrations, 1); // only the before chain ran
    }

    #[tokio::test]
    async fn main_phase_runs_concurrently_across_hosts() {
        let main = vec![
            chain("h1", "sh0001", &["1.a.sh"], FakeRunner::new()),
            chain("h2", "sh0001", &["1.a.sh"], FakeRunner::new()),
        ];
        let report = grid_run(vec![], main, vec![]).await;
        assert!(report.success());
        assert_eq!(report.total_migrations, 2);
        assert_eq!(report.processed_migrations, 2);
    }

    #[tokio::test]
    async fn after_phase_runs_even_when_main_phase_fails() {
        let main = vec![chain("h1", "sh0001", &["1.a.sh"], FakeRunner::failing_on("1.a"))];
        let after = vec![chain("h1", "public", &["0.after.all"], FakeRunner::new())];
        let report = grid_run(vec![], main, after).await;
        assert!(!report.success());
        // main failed (1 error) but after still executed (1 success)
        assert_eq!(report.processed_migrations, 2);
    }

    async fn grid_run(before: Vec<Chain>, main: Vec<Chain>, after: Vec<Chain>) -> GridReport {
        run(before, main, after, DEFAULT_WORKERS_PER_HOST, ConcurrencyTable::new(), None).await
    }
}
