use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Kind};

/// Matches a `-- $name=value` directive line, per the on-disk file contract.
fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^--\s*(\$\w+)\s*=([^\r\n]+)$").unwrap())
}

/// The parsed `-- $name=value` directives of one migration file.
///
/// Unknown directive names are rejected at parse time (see [`Variables::parse`]),
/// so by the time a `Variables` exists it is known-good.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Variables {
    pub delay_ms: Option<u64>,
    pub parallelism_global: Option<usize>,
    pub parallelism_per_host: Option<usize>,
    pub run_alone: bool,
}

impl Variables {
    /// True if any of the three concurrency-affecting directives is set;
    /// used by the non-transactional index wrap validator (ties a lone
    /// `CREATE INDEX CONCURRENTLY` to an explicit acknowledgement that it
    /// runs outside the normal transaction).
    pub fn has_concurrency_directive(&self) -> bool {
        self.parallelism_global.is_some() || self.parallelism_per_host.is_some() || self.run_alone
    }

    pub fn parse(path: &Path, sql: &str) -> Result<Variables, Error> {
        let mut vars = Variables::default();
        for caps in directive_re().captures_iter(sql) {
            let name = &caps[1];
            let value = caps[2].trim();
            match name {
                "$delay" => {
                    vars.delay_ms = Some(parse_u64(path, name, value)?);
                }
                "$parallelism_global" => {
                    vars.parallelism_global = Some(parse_usize(path, name, value)?);
                }
                "$parallelism_per_host" => {
                    vars.parallelism_per_host = Some(parse_usize(path, name, value)?);
                }
                "$run_alone" => {
                    vars.run_alone = parse_bool_flag(path, name, value)?;
                }
                other => {
                    return Err(Error::new(
                        Kind::UnknownDirective(other.trim_start_matches('$').to_string(), path.to_path_buf()),
                        None,
                    ));
                }
            }
        }
        Ok(vars)
    }
}

fn parse_u64(path: &Path, name: &str, value: &str) -> Result<u64, Error> {
    value.parse::<u64>().map_err(|_| {
        Error::new(
            Kind::InvalidDirectiveValue(name.trim_start_matches('$').into(), path.to_path_buf(), value.into()),
            None,
        )
    })
}

fn parse_usize(path: &Path, name: &str, value: &str) -> Result<usize, Error> {
    value.parse::<usize>().map_err(|_| {
        Error::new(
            Kind::InvalidDirectiveValue(name.trim_start_matches('$').into(), path.to_path_buf(), value.into()),
            None,
        )
    })
}

fn parse_bool_flag(path: &Path, name: &str, value: &str) -> Result<bool, Error> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(Error::new(
            Kind::InvalidDirectiveValue(name.trim_start_matches('$').into(), path.to_path_buf(), value.into()),
            None,
        )),
    }
}

/// One script on disk: its path, its parsed directives, and its contents.
#[derive(Clone, Debug)]
pub struct MigrationFile {
    path: PathBuf,
    sql: String,
    vars: Variables,
}

impl MigrationFile {
    pub fn load(path: PathBuf) -> Result<MigrationFile, Error> {
        let sql = std::fs::read_to_string(&path).map_err(|e| {
            Error::new(Kind::InvalidMigrationFile(path.clone(), e), None)
        })?;
        let vars = Variables::parse(&path, &sql)?;
        Ok(MigrationFile { path, sql, vars })
    }

    /// Builds a `MigrationFile` from already-known parts, bypassing disk
    /// I/O and directive parsing. Used by tests and by `before`/`after`
    /// synthesis when no such file exists on disk.
    pub fn from_parts(path: PathBuf, sql: String, vars: Variables) -> MigrationFile {
        MigrationFile { path, sql, vars }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn vars(&self) -> &Variables {
        &self.vars
    }
}

/// Matches `<timestamp>.<title>.<prefix>.(up|dn).sql`.
pub(crate) fn entry_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\.([^.]+)\.([^.]+)\.(up|dn)\.sql$").unwrap())
}

/// A pair of up/dn scripts targeting the same schema-name prefix.
#[derive(Clone, Debug)]
pub struct MigrationEntry {
    name: String,
    schema_prefix: String,
    up: MigrationFile,
    dn: MigrationFile,
}

impl MigrationEntry {
    pub(crate) fn new(name: String, schema_prefix: String, up: MigrationFile, dn: MigrationFile) -> MigrationEntry {
        MigrationEntry {
            name,
            schema_prefix,
            up,
            dn,
        }
    }

    /// The canonical version name `<timestamp>.<title>.<prefix>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema_prefix(&self) -> &str {
        &self.schema_prefix
    }

    pub fn up(&self) -> &MigrationFile {
        &self.up
    }

    pub fn dn(&self) -> &MigrationFile {
        &self.dn
    }

    /// The numeric timestamp prefix of [`Self::name`], used to compute the
    /// digest's `<order>` component.
    pub fn order(&self) -> u64 {
        extract_order(&self.name)
    }
}

impl fmt::Display for MigrationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for MigrationEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for MigrationEntry {}

impl PartialOrd for MigrationEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MigrationEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// Extracts the first three dot-separated parts of a version name
/// (`timestamp.title.prefix`), discarding anything past the third dot.
/// Used both to canonicalize undo arguments and to display versions.
pub fn extract_version(name: &str) -> Option<String> {
    let mut parts = name.splitn(4, '.');
    let ts = parts.next()?;
    let title = parts.next()?;
    let prefix = parts.next()?;
    Some(format!("{ts}.{title}.{prefix}"))
}

fn extract_order(name: &str) -> u64 {
    name.split('.').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_version_from_longer_name() {
        assert_eq!(
            extract_version("20240101000000.add_cars.sh.up.sql").as_deref(),
            Some("20240101000000.add_cars.sh")
        );
    }

    #[test]
    fn parses_known_directives() {
        let sql = "-- $delay=500\n-- $run_alone=1\nSELECT 1;";
        let vars = Variables::parse(Path::new("x.sql"), sql).unwrap();
        assert_eq!(vars.delay_ms, Some(500));
        assert!(vars.run_alone);
        assert_eq!(vars.parallelism_global, None);
    }

    #[test]
    fn rejects_unknown_directive() {
        let sql = "-- $bogus=1\nSELECT 1;";
        let err = Variables::parse(Path::new("x.sql"), sql).unwrap_err();
        match err.kind() {
            Kind::UnknownDirective(name, _) => assert_eq!(name, "bogus"),
            _ => panic!("wrong error kind"),
        }
    }

    #[test]
    fn rejects_invalid_run_alone_value() {
        let sql = "-- $run_alone=yes\nSELECT 1;";
        let err = Variables::parse(Path::new("x.sql"), sql).unwrap_err();
        assert!(matches!(err.kind(), Kind::InvalidDirectiveValue(..)));
    }

    #[test]
    fn order_is_numeric_timestamp_prefix() {
        assert_eq!(extract_order("20240101000000.add_cars.sh"), 20240101000000);
        assert_eq!(extract_order("not-a-number.x.y"), 0);
    }
}
