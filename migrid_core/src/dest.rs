//! `Dest`: one (host, port, user, password, database, schema) endpoint, and
//! the transactional contract for applying one migration script against it.

use std::sync::Arc;

use log::warn;

use crate::digest;
use crate::error::{Error, Kind, WrapEngineError};
use crate::runner::{RunnerTarget, SqlRunner};
use crate::wrap::{self, WrapOutcome};

const DISCARD_SUITE: &str = "DISCARD SEQUENCES; DISCARD TEMP; DISCARD PLANS; \
    SELECT pg_advisory_unlock_all(); UNLISTEN *; DEALLOCATE ALL; CLOSE ALL;";

/// An immutable, cheaply-cloned connection endpoint.
#[derive(Clone)]
pub struct Dest {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schema: String,
    runner: Arc<dyn SqlRunner>,
}

impl std::fmt::Debug for Dest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}

impl Dest {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        schema: impl Into<String>,
        runner: Arc<dyn SqlRunner>,
    ) -> Dest {
        Dest {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            schema: schema.into(),
            runner,
        }
    }

    /// A bootstrap Dest pointed at no particular schema, used only to create
    /// the target database.
    pub fn no_db(&self, bootstrap_database: &str) -> Dest {
        Dest {
            database: bootstrap_database.to_string(),
            schema: String::new(),
            ..self.clone()
        }
    }

    /// Derives a per-schema Dest from a host-level seed.
    pub fn with_schema(&self, schema: impl Into<String>) -> Dest {
        Dest {
            schema: schema.into(),
            ..self.clone()
        }
    }

    pub fn target(&self) -> RunnerTarget {
        RunnerTarget {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            schema: if self.schema.is_empty() { None } else { Some(self.schema.clone()) },
        }
    }

    fn label(&self) -> String {
        format!("{}:{}/{}/{}", self.host, self.port, self.database, self.schema)
    }

    /// Runs one migration script as a single atomic unit: open a
    /// transaction, execute the script, (re)create `mig_versions_const()`
    /// with `new_versions` (when present), run the discard suite, commit.
    ///
    /// A file validated as [`WrapOutcome::Alone`] is surrounded by its own
    /// `COMMIT; ...; BEGIN;` sandwich instead, since it cannot run inside a
    /// transaction at all.
    pub async fn run_file(
        &self,
        sql: &str,
        new_versions: Option<&[String]>,
        vars: &crate::migration::Variables,
    ) -> Result<RunOutcome, Error> {
        let outcome = wrap::validate(sql, vars).map_err(|errors| {
            Error::new(Kind::WrapValidation(self.label().into(), errors.join("; ")), None)
        })?;

        let version_stmt = new_versions.map(|versions| {
            let json = serde_json::to_string(versions).expect("version names are always valid JSON strings");
            format!(
                "CREATE OR REPLACE FUNCTION mig_versions_const() RETURNS jsonb AS $$ SELECT '{json}'::jsonb $$ LANGUAGE sql IMMUTABLE;"
            )
        });

        let script = match outcome {
            WrapOutcome::Untouched | WrapOutcome::Mixed => {
                let mut parts = vec!["BEGIN;".to_string(), "SET statement_timeout = 0;".to_string(), sql.to_string()];
                if let Some(stmt) = &version_stmt {
                    parts.push(stmt.clone());
                }
                parts.push(DISCARD_SUITE.to_string());
                parts.push("COMMIT;".to_string());
                parts.join("\n")
            }
            WrapOutcome::Alone { .. } => {
                // wrap_statements already ends with `BEGIN;`, reopening the
                // transaction the version update and DISCARD run inside.
                let mut parts = wrap::wrap_statements(&outcome, sql);
                if let Some(stmt) = &version_stmt {
                    parts.push(stmt.clone());
                    parts.push(DISCARD_SUITE.to_string());
                    parts.push("COMMIT;".to_string());
                }
                parts.join("\n")
            }
        };

        let result = self
            .runner
            .run_script(&self.target(), &script)
            .await
            .engine_err(&self.label(), None)?;

        if !result.success() {
            return Err(Error::new(
                Kind::MigrationFailure {
                    dest: self.label(),
                    version: String::new(),
                    output: result.stderr.clone(),
                },
                None,
            ));
        }

        Ok(RunOutcome {
            warning: result.warning(),
            last_line: result.last_output_line().map(str::to_string),
        })
    }

    /// Schema names suitable as shards: excludes system schemas and any
    /// name containing an underscore.
    pub async fn load_schemas(&self) -> Result<Vec<String>, Error> {
        let query = "SELECT schema_name FROM information_schema.schemata \
            WHERE schema_name NOT IN ('pg_catalog','information_schema','pg_toast') \
            AND schema_name NOT LIKE 'pg_%';";
        let result = self
            .runner
            .run_query(&self.target(), query)
            .await
            .engine_err(&self.label(), None)?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains('_'))
            .map(str::to_string)
            .collect())
    }

    /// Asks each schema's `mig_versions_const()`, batched in groups of
    /// ≤1000 via `UNION ALL`. A schema missing the function reports an
    /// empty version list.
    pub async fn load_versions_by_schema(
        &self,
        schemas: &[String],
    ) -> Result<std::collections::HashMap<String, Vec<String>>, Error> {
        let mut out = std::collections::HashMap::new();
        for batch in schemas.chunks(1000) {
            let union_query = batch
                .iter()
                .map(|s| format!("SELECT '{s}' AS schema_name, {s}.mig_versions_const() AS versions"))
                .collect::<Vec<_>>()
                .join(" UNION ALL ");
            let result = self
                .runner
                .run_query(&self.target(), &union_query)
                .await
                .engine_err(&self.label(), None)?;
            for line in result.stdout.lines() {
                if let Some((schema, json)) = line.split_once('\t') {
                    let versions: Vec<String> = serde_json::from_str(json.trim()).unwrap_or_default();
                    out.insert(schema.trim().to_string(), versions);
                } else {
                    out.entry(batch[0].clone()).or_insert_with(Vec::new);
                }
            }
        }
        for schema in schemas {
            out.entry(schema.clone()).or_insert_with(Vec::new);
        }
        Ok(out)
    }

    /// Probes for `database`'s existence on this connection and creates it
    /// if absent, retrying every second on connectivity errors until it
    /// succeeds or a non-connectivity error surfaces.
    ///
    /// `database` is taken explicitly rather than read off `self.database`,
    /// since callers run this against a bootstrap connection (see
    /// [`Self::no_db`]) whose own `database` field names the bootstrap
    /// database, not the one being created.
    pub async fn create_db(&self, database: &str, mut on_retry: impl FnMut()) -> Result<(), Error> {
        loop {
            let probe = self
                .runner
                .run_query(&self.target(), &format!("SELECT 1 FROM pg_database WHERE datname = '{database}';"))
                .await;
            match probe {
                Ok(result) if result.success() && !result.stdout.trim().is_empty() => return Ok(()),
                Ok(result) if result.success() => {
                    let create = self
                        .runner
                        .run_query(&self.target(), &format!("CREATE DATABASE {database};"))
                        .await
                        .engine_err(&self.label(), None)?;
                    if create.success() {
                        return Ok(());
                    }
                    return Err(Error::new(
                        Kind::MigrationFailure {
                            dest: self.label(),
                            version: "createdb".into(),
                            output: create.stderr,
                        },
                        None,
                    ));
                }
                _ => {
                    on_retry();
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn read_const(&self, function: &str) -> Option<String> {
        let result = self
            .runner
            .run_query(&self.target(), &format!("SELECT {function}();"))
            .await
            .ok()?;
        if result.success() {
            Some(result.stdout.trim().to_string())
        } else {
            None
        }
    }

    async fn write_const(&self, function: &str, return_type: &str, value: &str) -> bool {
        let sql = format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS {return_type} AS $$ SELECT '{value}'::{return_type} $$ LANGUAGE sql IMMUTABLE;"
        );
        self.runner
            .run_query(&self.target(), &sql)
            .await
            .map(|r| r.success())
            .unwrap_or(false)
    }

    /// Reads `mig_digest_const()` from every Dest; at least one must
    /// succeed, else [`Kind::DigestBlackout`].
    pub async fn load_digests(dests: &[Dest]) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        for dest in dests {
            if let Some(v) = dest.read_const("mig_digest_const").await {
                out.push(v);
            } else {
                warn!("failed to read mig_digest_const() from {}", dest.label());
            }
        }
        if out.is_empty() {
            return Err(Error::new(Kind::DigestBlackout(dests.len()), None));
        }
        Ok(out)
    }

    /// (Re)creates `mig_digest_const()` on every Dest. Partial failures are
    /// tolerated; best-digest selection at read time recovers the view.
    pub async fn save_digests(dests: &[Dest], value: &str) {
        for dest in dests {
            if !dest.write_const("mig_digest_const", "text", value).await {
                warn!("failed to write mig_digest_const() on {}", dest.label());
            }
        }
    }

    /// Builds the rerun fingerprint: comma-joined `(schema names migrated on
    /// this Dest's host, then "hash=<hex>")` over the dependency files'
    /// contents. `schemas` should already be sorted for a stable fingerprint.
    pub fn build_rerun_fingerprint(&self, schemas: &[String], dep_contents: &[&str]) -> String {
        let joined: String = dep_contents.concat();
        format!("{},hash={}", schemas.join(","), digest::hash_content(&joined))
    }

    pub async fn save_rerun_fingerprint(dests: &[(Dest, Vec<String>)], deps: &[&str], mode: RerunMode) {
        for (dest, schemas) in dests {
            let value = match mode {
                RerunMode::Reset => String::new(),
                RerunMode::UpToDate => dest.build_rerun_fingerprint(schemas, deps),
            };
            if !dest.write_const("mig_rerun_fingerprint_const", "text", &value).await {
                warn!("failed to write mig_rerun_fingerprint_const() on {}", dest.label());
            }
        }
    }

    /// True iff every Dest holds a non-empty fingerprint equal to the
    /// currently-built one.
    pub async fn check_rerun_fingerprint(dests: &[(Dest, Vec<String>)], deps: &[&str]) -> bool {
        for (dest, schemas) in dests {
            let expected = dest.build_rerun_fingerprint(schemas, deps);
            match dest.read_const("mig_rerun_fingerprint_const").await {
                Some(v) if v == expected && !v.is_empty() => continue,
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerunMode {
    Reset,
    UpToDate,
}

/// What came out of a successful [`Dest::run_file`].
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub warning: bool,
    pub last_line: Option<String>,
}
