//! The three concurrency primitives a [`crate::worker::Worker`] acquires
//! before running one script: a fleet-wide RW-lock for `$run_alone`
//! exclusivity, and two named semaphore tables (global-per-version,
//! per-host-per-version).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore};

/// Large enough that an "unlimited" semaphore never saturates in practice.
const UNBOUNDED: usize = usize::MAX / 2;

/// Holds the permits/guard acquired for one migration, released in reverse
/// order when dropped.
pub struct Tokens {
    _host_version: OwnedSemaphorePermit,
    _global_version: OwnedSemaphorePermit,
    _rw: RwToken,
}

enum RwToken {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Process-global concurrency state shared across every Worker in a Grid run.
#[derive(Clone)]
pub struct ConcurrencyTable {
    run_alone: Arc<RwLock<()>>,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Default for ConcurrencyTable {
    fn default() -> Self {
        ConcurrencyTable {
            run_alone: Arc::new(RwLock::new(())),
            semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl ConcurrencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn semaphore_for(&self, key: String, capacity: Option<usize>) -> Arc<Semaphore> {
        let mut table = self.semaphores.lock().await;
        table
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(capacity.unwrap_or(UNBOUNDED))))
            .clone()
    }

    /// Acquires, in order, the RW-lock (writer iff `run_alone`), the global
    /// semaphore keyed by `version`, then the per-host semaphore keyed by
    /// `host:version`. Releasing happens automatically, in reverse order,
    /// when the returned [`Tokens`] drops.
    pub async fn acquire(
        &self,
        host: &str,
        version: &str,
        run_alone: bool,
        parallelism_global: Option<usize>,
        parallelism_per_host: Option<usize>,
    ) -> Tokens {
        let rw = if run_alone {
            RwToken::Write(self.run_alone.clone().write_owned().await)
        } else {
            RwToken::Read(self.run_alone.clone().read_owned().await)
        };

        let global_sem = self.semaphore_for(format!("v:{version}"), parallelism_global).await;
        let global_permit = global_sem.acquire_owned().await.expect("semaphore never closed");

        let host_key = format!("h:{host}:{version}");
        let host_sem = self.semaphore_for(host_key, parallelism_per_host).await;
        let host_permit = host_sem.acquire_owned().await.expect("semaphore never closed");

        Tokens {
            _host_version: host_permit,
            _global_version: global_permit,
            _rw: rw,
        }
    }
}
