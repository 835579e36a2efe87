//! Top-level `apply`/`undo` action loop: plans via [`crate::patch`], drives
//! the [`crate::grid`], and manages the digest/rerun-fingerprint protocol.

use log::info;

use crate::dest::{Dest, RerunMode};
use crate::error::{Error, Kind, PartialOutcome};
use crate::grid::{self, GridReport, DEFAULT_WORKERS_PER_HOST};
use crate::patch::{self, Chain, ChainType};
use crate::registry::Registry;
use crate::worker::ProgressFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    Apply,
    Undo(&'a str),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub force: bool,
    pub workers_per_host: Option<usize>,
}

/// What one `Orchestrator::run` invocation decided and did.
#[derive(Debug, Clone)]
pub enum RunResult {
    /// Nothing to do; the code digest was (re)persisted if needed.
    NoOp,
    /// A dry-run summary; nothing was mutated.
    DryRun { planned_migrations: usize },
    /// The grid ran; `has_more_work` signals the caller should iterate
    /// again (only ever set on a successful `apply`).
    Ran { report: GridReport, has_more_work: bool },
}

impl RunResult {
    pub fn success(&self) -> bool {
        match self {
            RunResult::NoOp | RunResult::DryRun { .. } => true,
            RunResult::Ran { report, .. } => report.success(),
        }
    }
}

/// Runs one `apply` or `undo` pass against `hosts` using `registry`.
pub async fn run(
    hosts: &[Dest],
    registry: &Registry,
    action: Action<'_>,
    options: &RunOptions,
    on_progress: Option<ProgressFn>,
) -> Result<RunResult, Error> {
    let undo_target = match action {
        Action::Apply => None,
        Action::Undo(v) => Some(v),
    };

    let chains = patch::plan(hosts, registry, undo_target).await?;
    let host_schemas = migrated_schemas_by_host(hosts, registry).await?;

    let dep_contents: Vec<String> = [registry.before(), registry.after()]
        .into_iter()
        .flatten()
        .map(|f| f.sql().to_string())
        .collect();
    let dep_refs: Vec<&str> = dep_contents.iter().map(String::as_str).collect();

    if chains.is_empty() && !options.force {
        let up_to_date = Dest::check_rerun_fingerprint(&host_schemas, &dep_refs).await;
        if up_to_date {
            info!("orchestrator: nothing to do");
            Dest::save_digests(hosts, &registry.digest(false)).await;
            return Ok(RunResult::NoOp);
        }
    }

    if options.dry_run {
        let planned: usize = chains.iter().map(Chain::len).sum();
        info!("orchestrator: dry run, {planned} migrations planned, no mutation performed");
        return Ok(RunResult::DryRun { planned_migrations: planned });
    }

    if matches!(action, Action::Undo(_)) && !chains.is_empty() {
        info!("orchestrator: writing reset digest before-undo");
        Dest::save_digests(hosts, &crate::digest::reset_label("before-undo")).await;
    }
    Dest::save_rerun_fingerprint(&host_schemas, &dep_refs, RerunMode::Reset).await;

    let (before_chains, after_chains) = before_after_chains(registry, hosts);
    let workers_per_host = options.workers_per_host.unwrap_or(DEFAULT_WORKERS_PER_HOST);
    let report = grid::run(
        before_chains,
        chains,
        after_chains,
        workers_per_host,
        crate::concurrency::ConcurrencyTable::new(),
        on_progress,
    )
    .await;

    if !report.after_errors.is_empty() {
        let dest = report.after_errors[0].host.clone();
        let output = report
            .after_errors
            .iter()
            .map(|e| format!("{}:{} -> {}", e.host, e.schema, e.output))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::new(
            Kind::PostFailure(dest, output),
            Some(PartialOutcome {
                succeeded_migrations: report.processed_migrations,
                errored_migrations: report.errors.len(),
            }),
        ));
    }

    if !report.success() {
        return Ok(RunResult::Ran { report, has_more_work: false });
    }

    Dest::save_rerun_fingerprint(&host_schemas, &dep_refs, RerunMode::UpToDate).await;

    let has_more_work = match action {
        Action::Apply => {
            let remaining = patch::plan(hosts, registry, None).await?;
            if remaining.is_empty() {
                Dest::save_digests(hosts, &registry.digest(false)).await;
                false
            } else {
                true
            }
        }
        Action::Undo(_) => {
            Dest::save_digests(hosts, &crate::digest::reset_label("after-undo")).await;
            false
        }
    };

    Ok(RunResult::Ran { report, has_more_work })
}

/// For every host, the sorted list of its schemas that some registry prefix
/// applies to — the same filter [`crate::patch::plan`] uses, but kept even
/// when there's no pending work, since the rerun fingerprint needs it
/// regardless of whether anything is left to migrate.
async fn migrated_schemas_by_host(hosts: &[Dest], registry: &Registry) -> Result<Vec<(Dest, Vec<String>)>, Error> {
    let mut out = Vec::with_capacity(hosts.len());
    for host in hosts {
        let schemas = host.load_schemas().await?;
        let mut matched = Vec::new();
        for schema in schemas {
            if registry.group_by_schema(&schema)?.is_some() {
                matched.push(schema);
            }
        }
        matched.sort();
        out.push((host.clone(), matched));
    }
    Ok(out)
}

fn before_after_chains(registry: &Registry, hosts: &[Dest]) -> (Vec<Chain>, Vec<Chain>) {
    let mut before = Vec::new();
    let mut after = Vec::new();
    for host in hosts {
        if let Some(file) = registry.before() {
            before.push(Chain {
                kind: ChainType::Dn,
                dest: host.clone(),
                migrations: vec![patch::Migration {
                    version: "before".to_string(),
                    sql: file.sql().to_string(),
                    vars: file.vars().clone(),
                    new_versions: None,
                }],
            });
        }
        if let Some(file) = registry.after() {
            after.push(Chain {
                kind: ChainType::Up,
                dest: host.clone(),
                migrations: vec![patch::Migration {
                    version: "after".to_string(),
                    sql: file.sql().to_string(),
                    vars: file.vars().clone(),
                    new_versions: None,
                }],
            });
        }
    }
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn host(runner: FakeRunner) -> Dest {
        Dest::new("h1", 5432, "u", "p", "d", "", Arc::new(runner))
    }

    #[tokio::test]
    async fn after_phase_failure_surfaces_as_post_failure() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("20240101000000.a.sh.up.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("20240101000000.a.sh.dn.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("after.sql"), "BOOM;").unwrap();
        let registry = Registry::load(dir.path()).unwrap();

        let hosts = vec![host(FakeRunner::failing_on("BOOM"))];
        let err = run(&hosts, &registry, Action::Apply, &RunOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), Kind::PostFailure(_, _)));
    }

    #[tokio::test]
    async fn apply_with_no_matching_schemas_succeeds_trivially() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("20240101000000.a.sh.up.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("20240101000000.a.sh.dn.sql"), "SELECT 1;").unwrap();
        let registry = Registry::load(dir.path()).unwrap();

        let hosts = vec![host(FakeRunner::new())];
        let result = run(&hosts, &registry, Action::Apply, &RunOptions::default(), None)
            .await
            .unwrap();
        assert!(result.success());
    }
}
