//! Drives `migrid_core` for each CLI action: `apply` (default), `undo`,
//! `list`, `chain`. `make` is handled directly by [`crate::generate`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use migrid_core::orchestrator::{self, Action as CoreAction, RunOptions, RunResult};
use migrid_core::worker::{ProgressEvent, ProgressFn};
use migrid_core::{Dest, Registry};

use crate::hostspec;

pub struct Resolved {
    pub registry: Registry,
    pub hosts: Vec<Dest>,
}

pub fn resolve(migdir: &Path, hosts_raw: &str, port: u16, user: &str, pass: &str, db: &str) -> Result<Resolved> {
    let registry = Registry::load(migdir).with_context(|| format!("could not load migrations from {migdir:?}"))?;
    let seeds = hostspec::parse_hosts(hosts_raw, port, user, pass, db)?;
    if seeds.is_empty() {
        anyhow::bail!("no hosts configured; pass --hosts or set [main.hosts] in migrid.toml");
    }
    let hosts = hostspec::to_dests(&seeds);
    Ok(Resolved { registry, hosts })
}

pub async fn handle_apply(resolved: &Resolved, createdb: bool, options: &RunOptions) -> Result<()> {
    if createdb {
        create_missing_databases(&resolved.hosts).await?;
    }

    // hasMoreWork loops drive themselves to completion; cap iterations so a
    // misbehaving Dest can't spin the CLI forever.
    let mut iterations = 0;
    loop {
        let result = orchestrator::run(
            &resolved.hosts,
            &resolved.registry,
            CoreAction::Apply,
            options,
            Some(progress_renderer()),
        )
        .await
        .context("apply failed")?;

        report(&result);
        if !result.success() {
            anyhow::bail!("apply finished with errors");
        }

        iterations += 1;
        match result {
            RunResult::Ran { has_more_work: true, .. } if iterations < 10 => continue,
            _ => break,
        }
    }
    Ok(())
}

pub async fn handle_undo(resolved: &Resolved, version: &str, options: &RunOptions) -> Result<()> {
    let canonical = Registry::extract_version(version).unwrap_or_else(|| version.to_string());
    let result = orchestrator::run(
        &resolved.hosts,
        &resolved.registry,
        CoreAction::Undo(&canonical),
        options,
        Some(progress_renderer()),
    )
    .await
    .context("undo failed")?;
    report(&result);
    if !result.success() {
        anyhow::bail!("undo finished with errors");
    }
    Ok(())
}

pub fn handle_list(resolved: &Resolved, digest: bool) {
    if digest {
        println!("{}", resolved.registry.digest(false));
        return;
    }
    for name in resolved.registry.version_names() {
        println!("{name}");
    }
}

pub fn handle_chain(resolved: &Resolved) {
    println!("{}", resolved.registry.digest(false));
    let names = resolved.registry.version_names();
    let mut prev = "0";
    for name in &names {
        println!("{prev} -> {name}");
        prev = name;
    }
}

/// Prints one line per [`ProgressEvent`] as it arrives. Heartbeats are logged
/// at debug level so a long-running script doesn't flood stdout.
fn progress_renderer() -> ProgressFn {
    Arc::new(|event: ProgressEvent| match event {
        ProgressEvent::Started { host, schema, version } => {
            println!("-> {version} on {host}:{schema}");
        }
        ProgressEvent::Heartbeat { host, schema, version } => {
            log::debug!("{version} on {host}:{schema} still running");
        }
        ProgressEvent::Finished {
            host,
            schema,
            version,
            warning,
            last_line,
        } => {
            let suffix = last_line.map(|l| format!(" ({l})")).unwrap_or_default();
            if warning {
                println!("!! {version} on {host}:{schema} finished with a warning{suffix}");
            } else {
                println!("ok {version} on {host}:{schema}{suffix}");
            }
        }
        ProgressEvent::Failed {
            host,
            schema,
            version,
            output,
        } => {
            println!("xx {version} on {host}:{schema} failed: {output}");
        }
    })
}

async fn create_missing_databases(hosts: &[Dest]) -> Result<()> {
    for host in hosts {
        let bootstrap = host.no_db("postgres");
        info!("ensuring database {} exists on {}", host.database, host.host);
        bootstrap
            .create_db(&host.database, || info!("retrying database creation on {}", bootstrap.host))
            .await
            .with_context(|| format!("could not create database {} on {}", host.database, host.host))?;
    }
    Ok(())
}

fn report(result: &RunResult) {
    match result {
        RunResult::NoOp => println!("nothing to do"),
        RunResult::DryRun { planned_migrations } => println!("dry run: {planned_migrations} migrations planned"),
        RunResult::Ran { report, has_more_work } => {
            println!(
                "ran {}/{} migrations, {} errors, {} warnings{}",
                report.processed_migrations,
                report.total_migrations,
                report.errors.len(),
                report.warnings.len(),
                if *has_more_work { " (more work pending)" } else { "" }
            );
        }
    }
}

