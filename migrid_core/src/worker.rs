//! Executes a shared queue of [`Chain`]s: pop one, run its migrations in
//! strict order, acquire concurrency tokens before each script.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::concurrency::ConcurrencyTable;
use crate::patch::Chain;

/// One migration that failed, with enough context to report it.
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub host: String,
    pub schema: String,
    pub version: String,
    pub output: String,
}

/// One migration that succeeded but the runner flagged a `WARNING:`.
#[derive(Debug, Clone)]
pub struct WorkerWarning {
    pub host: String,
    pub schema: String,
    pub version: String,
}

/// Accumulated outcome of one Worker's run across however many chains it
/// drained from the shared queue.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub succeeded: usize,
    pub errors: Vec<WorkerError>,
    pub warnings: Vec<WorkerWarning>,
}

impl WorkerReport {
    pub fn processed(&self) -> usize {
        self.succeeded + self.errors.len()
    }

    fn merge(&mut self, other: WorkerReport) {
        self.succeeded += other.succeeded;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// One moment in a migration's lifecycle, for progress rendering.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A migration is about to run; fired once before concurrency tokens
    /// are even requested, so observers see it queue, not just complete.
    Started { host: String, schema: String, version: String },
    /// Fired every 200ms while a migration's script is in flight, so a long
    /// script doesn't look hung.
    Heartbeat { host: String, schema: String, version: String },
    Finished {
        host: String,
        schema: String,
        version: String,
        warning: bool,
        last_line: Option<String>,
    },
    Failed {
        host: String,
        schema: String,
        version: String,
        output: String,
    },
}

/// Callback invoked with each [`ProgressEvent`], for progress rendering.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Drains `queue` until empty, running each chain's migrations in order.
/// A migration failure aborts only its own chain; the worker moves on to
/// the next queued chain.
pub async fn run(
    queue: Arc<Mutex<Vec<Chain>>>,
    concurrency: ConcurrencyTable,
    on_progress: Option<ProgressFn>,
) -> WorkerReport {
    let mut report = WorkerReport::default();

    loop {
        let chain = {
            let mut q = queue.lock().await;
            q.pop()
        };
        let Some(chain) = chain else { break };

        info!("worker starting chain on {} ({} migrations)", chain.dest.host, chain.len());
        let chain_report = run_chain(&chain, &concurrency, on_progress.as_ref()).await;
        report.merge(chain_report);
    }

    report
}

async fn run_chain(chain: &Chain, concurrency: &ConcurrencyTable, on_progress: Option<&ProgressFn>) -> WorkerReport {
    let mut report = WorkerReport::default();

    for migration in &chain.migrations {
        let host = chain.dest.host.clone();
        let schema = chain.dest.schema.clone();
        let version = migration.version.clone();

        if let Some(cb) = on_progress {
            cb(ProgressEvent::Started {
                host: host.clone(),
                schema: schema.clone(),
                version: version.clone(),
            });
        }

        let _tokens = concurrency
            .acquire(
                &chain.dest.host,
                &migration.version,
                migration.vars.run_alone,
                migration.vars.parallelism_global,
                migration.vars.parallelism_per_host,
            )
            .await;

        let heartbeat = on_progress.cloned().map(|cb| {
            let host = host.clone();
            let schema = schema.clone();
            let version = version.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(200));
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    cb(ProgressEvent::Heartbeat {
                        host: host.clone(),
                        schema: schema.clone(),
                        version: version.clone(),
                    });
                }
            })
        });

        let result = chain
            .dest
            .run_file(&migration.sql, migration.new_versions.as_deref(), &migration.vars)
            .await;

        if let Some(handle) = heartbeat {
            handle.abort();
        }

        match result {
            Ok(outcome) => {
                report.succeeded += 1;
                if let Some(cb) = on_progress {
                    cb(ProgressEvent::Finished {
                        host: host.clone(),
                        schema: schema.clone(),
                        version: version.clone(),
                        warning: outcome.warning,
                        last_line: outcome.last_line.clone(),
                    });
                }
                if outcome.warning {
                    warn!("migration {} on {}:{} reported a warning", version, host, schema);
                    report.warnings.push(WorkerWarning {
                        host: host.clone(),
                        schema: schema.clone(),
                        version: version.clone(),
                    });
                }
                if let Some(delay) = migration.vars.delay_ms {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
            Err(err) => {
                error!("migration {} failed on {}: {}", version, host, err);
                if let Some(cb) = on_progress {
                    cb(ProgressEvent::Failed {
                        host: host.clone(),
                        schema: schema.clone(),
                        version: version.clone(),
                        output: err.to_string(),
                    });
                }
                report.errors.push(WorkerError {
                    host,
                    schema,
                    version,
                    output: err.to_string(),
                });
                break;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::Dest;
    use crate::migration::Variables;
    use crate::patch::{ChainType, Migration};
    use crate::runner::fake::FakeRunner;

    fn chain_with(dest: Dest, versions: &[&str]) -> Chain {
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
    async fn worker_runs_chain_migrations_in_order_and_counts_success() {
        let dest = Dest::new("h1", 5432, "u", "p", "d", "sh0001", Arc::new(FakeRunner::new()));
        let chain = chain_with(dest, &["1.a.sh", "2.b.sh"]);
        let queue = Arc::new(Mutex::new(vec![chain]));
        let report = run(queue, ConcurrencyTable::new(), None).await;
        assert_eq!(report.succeeded, 2);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn worker_stops_chain_on_first_error_but_drains_other_chains() {
        let failing = Dest::new("h1", 5432, "u", "p", "d", "sh0001", Arc::new(FakeRunner::failing_on("2.b")));
        let ok = Dest::new("h1", 5432, "u", "p", "d", "sh0002", Arc::new(FakeRunner::new()));
        let chains = vec![chain_with(failing, &["1.a.sh", "2.b.sh", "3.c.sh"]), chain_with(ok, &["1.a.sh"])];
        let queue = Arc::new(Mutex::new(chains));
        let report = run(queue, ConcurrencyTable::new(), None).await;
        assert_eq!(report.succeeded, 2); // 1.a.sh on the failing chain + 1.a.sh on the ok chain
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].version, "2.b.sh");
    }
}
