//! Defines the CLI surface: `apply` (default), `undo`, `make`, `chain`, `list`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "migrid", version, about = "Applies ordered SQL migrations across a sharded database fleet")]
pub struct Cli {
    #[command(subcommand)]
    pub action: Option<Action>,

    /// Directory holding the migration files.
    #[arg(long, global = true, default_value = "migrations")]
    pub migdir: PathBuf,

    /// Comma/semicolon-separated list of host specs or DSNs.
    #[arg(long, global = true)]
    pub hosts: Option<String>,

    #[arg(long, global = true, default_value_t = 5432)]
    pub port: u16,

    #[arg(long, global = true, default_value = "postgres")]
    pub user: String,

    #[arg(long, global = true, default_value = "")]
    pub pass: String,

    #[arg(long, global = true, default_value = "postgres")]
    pub db: String,

    /// Create each target database first if it does not exist yet.
    #[arg(long, global = true)]
    pub createdb: bool,

    /// Default `workers_per_host`; overrides the config file value.
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    /// Plan and print, without running or mutating anything.
    #[arg(long, global = true)]
    pub dry: bool,

    /// Run even if the fast path would otherwise report nothing to do.
    #[arg(long, global = true)]
    pub force: bool,

    /// Path to `migrid.toml`. Overridden per-field by the flags above.
    #[arg(long, global = true, default_value = "migrid.toml")]
    pub config: PathBuf,

    /// Read configuration from this environment variable instead of a file.
    #[arg(long, global = true)]
    pub env_var: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Scaffolds a new `<ts>.<title>.<prefix>.{up,dn}.sql` pair.
    Make {
        /// `<title>@<prefix>`, e.g. `add_cars@sh`.
        spec: String,
    },
    /// Prints the chain file contents for the current registry.
    Chain,
    /// Lists version names, or the code digest with `--digest`.
    List {
        #[arg(long)]
        digest: bool,
    },
    /// Undoes a single applied version (must be each schema's latest).
    Undo {
        version: String,
    },
}
