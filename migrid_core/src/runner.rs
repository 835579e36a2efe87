//! The abstract script/query execution capability a [`crate::dest::Dest`]
//! drives, plus one concrete implementation over a `psql` subprocess so the
//! crate ships a runnable binary without pulling in a native DB driver.

use async_trait::async_trait;

/// The result of running one script or query against a target.
#[derive(Debug, Clone, Default)]
pub struct ExitResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True if stderr carries a `WARNING:` line despite a zero exit code.
    pub fn warning(&self) -> bool {
        self.stderr.contains("WARNING:")
    }

    /// The last non-empty line of stdout, for progress-callback streaming.
    pub fn last_output_line(&self) -> Option<&str> {
        self.stdout.lines().rev().find(|l| !l.trim().is_empty())
    }
}

/// A single connection target: where to run a script or query, and under
/// which role/search-path.
#[derive(Debug, Clone)]
pub struct RunnerTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schema: Option<String>,
}

/// Abstract executor. `migrid_core` never speaks a wire protocol directly;
/// it hands scripts and queries to a `SqlRunner` implementation.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    async fn run_script(&self, target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult>;
    async fn run_query(&self, target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult>;
}

pub mod process {
    use super::{ExitResult, RunnerTarget, SqlRunner};
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;

    /// Shells out to the `psql` client binary for every script/query,
    /// feeding SQL on stdin and capturing stdout/stderr. The concrete
    /// client-invocation details (binary name, connection flags, password
    /// env var) live entirely in this module so the rest of the engine
    /// never depends on a specific database client.
    #[derive(Debug, Clone)]
    pub struct ProcessSqlRunner {
        psql_path: String,
    }

    impl Default for ProcessSqlRunner {
        fn default() -> Self {
            ProcessSqlRunner {
                psql_path: "psql".to_string(),
            }
        }
    }

    impl ProcessSqlRunner {
        pub fn with_binary(psql_path: impl Into<String>) -> Self {
            ProcessSqlRunner {
                psql_path: psql_path.into(),
            }
        }

        async fn run(&self, target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult> {
            let mut cmd = Command::new(&self.psql_path);
            cmd.arg("-v")
                .arg("ON_ERROR_STOP=1")
                .arg("-h")
                .arg(&target.host)
                .arg("-p")
                .arg(target.port.to_string())
                .arg("-U")
                .arg(&target.user)
                .arg("-d")
                .arg(&target.database)
                .arg("--no-psqlrc")
                .arg("-q")
                .env("PGPASSWORD", &target.password)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());

            let mut child = cmd.spawn()?;

            let script = match &target.schema {
                Some(schema) => format!("SET search_path TO {schema};\n{sql}"),
                None => sql.to_string(),
            };

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(script.as_bytes()).await?;
            }

            let output = child.wait_with_output().await?;
            Ok(ExitResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    #[async_trait]
    impl SqlRunner for ProcessSqlRunner {
        async fn run_script(&self, target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult> {
            self.run(target, sql).await
        }

        async fn run_query(&self, target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult> {
            self.run(target, sql).await
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::{ExitResult, RunnerTarget, SqlRunner};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every invocation and plays back canned results keyed by a
    /// substring of the script, for deterministic concurrency tests.
    #[derive(Default)]
    pub struct FakeRunner {
        pub calls: Mutex<Vec<String>>,
        pub fail_on_contains: Option<String>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            FakeRunner::default()
        }

        pub fn failing_on(needle: impl Into<String>) -> Self {
            FakeRunner {
                calls: Mutex::new(Vec::new()),
                fail_on_contains: Some(needle.into()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SqlRunner for FakeRunner {
        async fn run_script(&self, _target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult> {
            self.calls.lock().unwrap().push(sql.to_string());
            let failed = self
                .fail_on_contains
                .as_ref()
                .is_some_and(|needle| sql.contains(needle.as_str()));
            Ok(ExitResult {
                exit_code: if failed { 1 } else { 0 },
                stdout: String::new(),
                stderr: if failed { "ERROR: boom".to_string() } else { String::new() },
            })
        }

        async fn run_query(&self, target: &RunnerTarget, sql: &str) -> std::io::Result<ExitResult> {
            self.run_script(target, sql).await
        }
    }

    #[tokio::test]
    async fn fake_runner_records_calls_and_fails_on_needle() {
        let target = RunnerTarget {
            host: "h".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            database: "d".into(),
            schema: Some("sh0001".into()),
        };
        let runner = FakeRunner::failing_on("BOOM");
        let ok = runner.run_script(&target, "SELECT 1;").await.unwrap();
        assert!(ok.success());
        let bad = runner.run_script(&target, "BOOM;").await.unwrap();
        assert!(!bad.success());
        assert_eq!(runner.call_count(), 2);
    }
}
