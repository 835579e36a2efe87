//! Entry point for the migrid CLI tool.

mod actions;
mod cli;
mod config;
mod generate;
mod hostspec;

use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Target};
use log::LevelFilter;
use migrid_core::orchestrator::RunOptions;

use cli::{Action, Cli};

fn main() -> Result<()> {
    human_panic::setup_panic!();

    let mut builder = Builder::new();
    builder
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(Some("migrid_core::grid"), LevelFilter::Info)
        .target(Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("could not start tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let file_config = load_config(&cli)?;

    let hosts_raw = cli
        .hosts
        .clone()
        .or_else(|| (!file_config.main.hosts.is_empty()).then(|| file_config.main.hosts.join(",")))
        .context("no hosts configured; pass --hosts or set [main.hosts] in migrid.toml")?;

    let migdir = if cli.migdir == std::path::Path::new("migrations") {
        file_config.main.migdir.clone()
    } else {
        cli.migdir.clone()
    };

    if let Some(Action::Make { spec }) = &cli.action {
        return generate::handle_generate_command(&migdir, spec);
    }

    let resolved = actions::resolve(&migdir, &hosts_raw, cli.port, &cli.user, &cli.pass, &cli.db)?;

    let options = RunOptions {
        dry_run: cli.dry,
        force: cli.force,
        workers_per_host: cli.parallelism.or(file_config.main.workers_per_host),
    };

    match &cli.action {
        None => actions::handle_apply(&resolved, cli.createdb, &options).await?,
        Some(Action::Make { .. }) => unreachable!("handled above"),
        Some(Action::Chain) => actions::handle_chain(&resolved),
        Some(Action::List { digest }) => actions::handle_list(&resolved, *digest),
        Some(Action::Undo { version }) => actions::handle_undo(&resolved, version, &options).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<config::Config> {
    if let Some(env_var) = &cli.env_var {
        config::Config::from_env_var(env_var)
    } else {
        config::Config::from_file_location(&cli.config)
    }
}
