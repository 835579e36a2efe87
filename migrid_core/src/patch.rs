//! Diffs on-disk [`crate::registry::Registry`] state against each schema's
//! persisted version list to produce the [`Chain`]s a [`crate::grid::Grid`]
//! will execute.

use crate::dest::Dest;
use crate::error::{Error, Kind};
use crate::migration::MigrationEntry;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Up,
    Dn,
}

/// One migration queued for execution: the file to run and the exact
/// version list to persist afterward (`None` for before/after scripts).
#[derive(Clone)]
pub struct Migration {
    pub version: String,
    pub sql: String,
    pub vars: crate::migration::Variables,
    pub new_versions: Option<Vec<String>>,
}

/// An ordered queue of migrations against one Dest.
#[derive(Clone)]
pub struct Chain {
    pub kind: ChainType,
    pub dest: Dest,
    pub migrations: Vec<Migration>,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Computes the Chains to run for an `apply` (undo = `None`) or `undo`
/// action, across every host.
pub async fn plan(hosts: &[Dest], registry: &Registry, undo: Option<&str>) -> Result<Vec<Chain>, Error> {
    let mut chains = Vec::new();

    for host in hosts {
        let schemas = host.load_schemas().await?;
        let mut candidates = Vec::new();
        for schema in &schemas {
            if let Some(entries) = registry.group_by_schema(schema)? {
                candidates.push((schema.clone(), entries));
            }
        }
        if candidates.is_empty() {
            continue;
        }

        let schema_names: Vec<String> = candidates.iter().map(|(s, _)| s.clone()).collect();
        let persisted_by_schema = host.load_versions_by_schema(&schema_names).await?;

        for (schema, entries) in candidates {
            let persisted = persisted_by_schema.get(&schema).cloned().unwrap_or_default();
            let dest = host.with_schema(schema.clone());

            let chain = match undo {
                None => build_up_chain(&schema, &dest, entries, &persisted)?,
                Some(target) => build_dn_chain(&schema, &dest, entries, &persisted, target)?,
            };
            if let Some(chain) = chain {
                if !chain.is_empty() {
                    chains.push(chain);
                }
            }
        }
    }

    chains.sort_by(|a, b| {
        (a.dest.host.as_str(), a.dest.database.as_str(), a.dest.schema.as_str()).cmp(&(
            b.dest.host.as_str(),
            b.dest.database.as_str(),
            b.dest.schema.as_str(),
        ))
    });

    Ok(chains)
}

fn build_up_chain(
    schema: &str,
    dest: &Dest,
    entries: &[MigrationEntry],
    persisted: &[String],
) -> Result<Option<Chain>, Error> {
    for (i, persisted_name) in persisted.iter().enumerate() {
        match entries.get(i) {
            Some(entry) if entry.name() == persisted_name => {}
            Some(entry) => {
                return Err(Error::new(
                    Kind::TimelineViolation {
                        schema: schema.to_string(),
                        persisted: persisted_name.clone(),
                        proposed: entry.name().to_string(),
                    },
                    None,
                ));
            }
            None => {
                return Err(Error::new(
                    Kind::MissingOnDisk {
                        schema: schema.to_string(),
                        version: persisted_name.clone(),
                    },
                    None,
                ));
            }
        }
    }

    let start = persisted.len();
    let mut migrations = Vec::new();
    let mut running = persisted.to_vec();
    for entry in &entries[start.min(entries.len())..] {
        running.push(entry.name().to_string());
        migrations.push(Migration {
            version: entry.name().to_string(),
            sql: entry.up().sql().to_string(),
            vars: entry.up().vars().clone(),
            new_versions: Some(running.clone()),
        });
    }

    Ok(Some(Chain {
        kind: ChainType::Up,
        dest: dest.clone(),
        migrations,
    }))
}

fn build_dn_chain(
    schema: &str,
    dest: &Dest,
    entries: &[MigrationEntry],
    persisted: &[String],
    undo_target: &str,
) -> Result<Option<Chain>, Error> {
    let Some(last) = persisted.last() else {
        return Ok(None);
    };

    if last == undo_target {
        let entry = entries
            .iter()
            .find(|e| e.name() == undo_target)
            .ok_or_else(|| {
                Error::new(
                    Kind::MissingOnDisk {
                        schema: schema.to_string(),
                        version: undo_target.to_string(),
                    },
                    None,
                )
            })?;
        let new_versions: Vec<String> = persisted[..persisted.len() - 1].to_vec();
        return Ok(Some(Chain {
            kind: ChainType::Dn,
            dest: dest.clone(),
            migrations: vec![Migration {
                version: entry.name().to_string(),
                sql: entry.dn().sql().to_string(),
                vars: entry.dn().vars().clone(),
                new_versions: Some(new_versions),
            }],
        }));
    }

    if persisted[..persisted.len() - 1].iter().any(|v| v == undo_target) {
        return Err(Error::new(
            Kind::UndoNotLatest {
                schema: schema.to_string(),
                target: undo_target.to_string(),
            },
            None,
        ));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationEntry, MigrationFile, Variables};
    use crate::runner::fake::FakeRunner;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn entry(name: &str, prefix: &str) -> MigrationEntry {
        let up = MigrationFile::from_parts(PathBuf::from(format!("{name}.up.sql")), "SELECT 1;".into(), Variables::default());
        let dn = MigrationFile::from_parts(PathBuf::from(format!("{name}.dn.sql")), "SELECT 1;".into(), Variables::default());
        MigrationEntry::new(name.to_string(), prefix.to_string(), up, dn)
    }

    fn dest() -> Dest {
        Dest::new("h1", 5432, "u", "p", "d", "sh0001", Arc::new(FakeRunner::new()))
    }

    #[test]
    fn up_chain_takes_suffix_after_persisted() {
        let entries = vec![entry("1.a.sh", "sh"), entry("2.b.sh", "sh")];
        let persisted = vec!["1.a.sh".to_string()];
        let chain = build_up_chain("sh0001", &dest(), &entries, &persisted).unwrap().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.migrations[0].version, "2.b.sh");
        assert_eq!(chain.migrations[0].new_versions.as_deref(), Some(&["1.a.sh".to_string(), "2.b.sh".to_string()][..]));
    }

    #[test]
    fn up_chain_detects_timeline_violation() {
        let entries = vec![entry("1.a.sh", "sh"), entry("2.b.sh", "sh")];
        let persisted = vec!["1.a.sh".to_string(), "9.other.sh".to_string()];
        let err = build_up_chain("sh0001", &dest(), &entries, &persisted).unwrap_err();
        assert!(matches!(err.kind(), Kind::TimelineViolation { .. }));
    }

    #[test]
    fn up_chain_detects_missing_on_disk() {
        let entries = vec![entry("1.a.sh", "sh")];
        let persisted = vec!["1.a.sh".to_string(), "2.b.sh".to_string()];
        let err = build_up_chain("sh0001", &dest(), &entries, &persisted).unwrap_err();
        assert!(matches!(err.kind(), Kind::MissingOnDisk { .. }));
    }

    #[test]
    fn dn_chain_on_latest_pops_it() {
        let entries = vec![entry("1.a.sh", "sh"), entry("2.b.sh", "sh")];
        let persisted = vec!["1.a.sh".to_string(), "2.b.sh".to_string()];
        let chain = build_dn_chain("sh0001", &dest(), &entries, &persisted, "2.b.sh").unwrap().unwrap();
        assert_eq!(chain.migrations[0].new_versions.as_deref(), Some(&["1.a.sh".to_string()][..]));
    }

    #[test]
    fn dn_chain_in_middle_is_rejected() {
        let entries = vec![entry("1.a.sh", "sh"), entry("2.b.sh", "sh")];
        let persisted = vec!["1.a.sh".to_string(), "2.b.sh".to_string()];
        let err = build_dn_chain("sh0001", &dest(), &entries, &persisted, "1.a.sh").unwrap_err();
        assert!(matches!(err.kind(), Kind::UndoNotLatest { .. }));
    }

    #[test]
    fn dn_chain_never_applied_is_skipped() {
        let entries = vec![entry("1.a.sh", "sh")];
        let persisted = vec!["1.a.sh".to_string()];
        let chain = build_dn_chain("sh0001", &dest(), &entries, &persisted, "9.never.sh").unwrap();
        assert!(chain.is_none());
    }
}
