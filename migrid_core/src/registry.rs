use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::digest;
use crate::error::{Error, Kind};
use crate::migration::{entry_file_re, MigrationEntry, MigrationFile};
use crate::wrap;

/// The parsed, immutable view of one migration directory: every entry pair,
/// grouped by schema-name prefix, plus the optional `before.sql`/`after.sql`
/// hooks. Constructed once per run.
#[derive(Debug)]
pub struct Registry {
    entries: Vec<MigrationEntry>,
    /// Prefixes sorted by descending length, so the first match wins.
    prefixes_by_len: Vec<String>,
    by_prefix: HashMap<String, Vec<usize>>,
    before: Option<MigrationFile>,
    after: Option<MigrationFile>,
}

impl Registry {
    /// Scans `dir` for migration files, pairs them up, validates each file's
    /// index-wrapping shape, and groups them by schema prefix.
    pub fn load(dir: &Path) -> Result<Registry, Error> {
        let read_dir = std::fs::read_dir(dir)
            .map_err(|e| Error::new(Kind::InvalidMigrationPath(dir.to_path_buf(), e), None))?;

        let mut ups: HashMap<String, (String, PathBuf)> = HashMap::new();
        let mut dns: HashMap<String, (String, PathBuf)> = HashMap::new();
        let mut before_path = None;
        let mut after_path = None;

        for dirent in read_dir {
            let dirent = dirent.map_err(|e| Error::new(Kind::InvalidMigrationPath(dir.to_path_buf(), e), None))?;
            let path = dirent.path();
            if !path.is_file() {
                continue;
            }
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if file_name == "before.sql" {
                before_path = Some(path);
                continue;
            }
            if file_name == "after.sql" {
                after_path = Some(path);
                continue;
            }
            if !file_name.ends_with(".sql") {
                continue;
            }

            let caps = entry_file_re()
                .captures(&file_name)
                .ok_or_else(|| Error::new(Kind::InvalidName(file_name.clone()), None))?;
            let timestamp = &caps[1];
            let title = &caps[2];
            let prefix = &caps[3];
            let direction = &caps[4];
            let name = format!("{timestamp}.{title}.{prefix}");

            match direction {
                "up" => ups.insert(name, (prefix.to_string(), path)),
                "dn" => dns.insert(name, (prefix.to_string(), path)),
                _ => unreachable!(),
            };
        }

        let mut entries = Vec::with_capacity(ups.len());
        for (name, (prefix, up_path)) in ups {
            let (_, dn_path) = dns
                .remove(&name)
                .ok_or_else(|| Error::new(Kind::MissingPair(name.clone(), "dn"), None))?;
            let up = MigrationFile::load(up_path)?;
            let dn = MigrationFile::load(dn_path)?;
            validate_wrap(&up)?;
            validate_wrap(&dn)?;
            entries.push(MigrationEntry::new(name, prefix, up, dn));
        }
        if let Some((name, _)) = dns.into_iter().next() {
            return Err(Error::new(Kind::MissingPair(name, "up"), None));
        }

        entries.sort();

        let before = before_path.map(MigrationFile::load).transpose()?;
        let after = after_path.map(MigrationFile::load).transpose()?;

        let mut by_prefix: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_prefix.entry(entry.schema_prefix().to_string()).or_default().push(idx);
        }
        for indices in by_prefix.values_mut() {
            indices.sort_by(|&a, &b| entries[a].name().cmp(entries[b].name()));
        }

        let mut prefixes_by_len: Vec<String> = by_prefix.keys().cloned().collect();
        prefixes_by_len.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Registry {
            entries,
            prefixes_by_len,
            by_prefix,
            before,
            after,
        })
    }

    pub fn entries(&self) -> &[MigrationEntry] {
        &self.entries
    }

    pub fn before(&self) -> Option<&MigrationFile> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&MigrationFile> {
        self.after.as_ref()
    }

    /// All ordered version names across every schema prefix.
    pub fn version_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }

    /// The ordered entries applicable to `schema`, per longest-prefix match.
    /// `Ok(None)` means no prefix matches (the schema is skipped).
    pub fn group_by_schema(&self, schema: &str) -> Result<Option<&[MigrationEntry]>, Error> {
        let mut matched: Option<&str> = None;
        for prefix in &self.prefixes_by_len {
            if !schema_name_matches_prefix(schema, prefix) {
                continue;
            }
            match matched {
                None => matched = Some(prefix),
                Some(first) if first.len() > prefix.len() => {
                    // shorter prefix also matches; longer already won, skip
                }
                Some(first) if first != prefix.as_str() => {
                    return Err(Error::new(
                        Kind::PrefixAmbiguity(schema.to_string(), first.to_string(), prefix.to_string()),
                        None,
                    ));
                }
                _ => {}
            }
        }

        Ok(matched.map(|prefix| {
            let indices = &self.by_prefix[prefix];
            // SAFETY-free: build a temporary owned slice view via indices
            let start = indices[0];
            let end = indices[indices.len() - 1] + 1;
            // entries for one prefix are contiguous because we sorted entries
            // globally by name and each prefix's indices were collected in
            // that same order; guard the assumption defensively.
            debug_assert!(indices.iter().copied().eq(start..end));
            &self.entries[start..end]
        }))
    }

    /// `"<order>.<hash>"` over every version name on disk, across all prefixes.
    pub fn digest(&self, short: bool) -> String {
        let mut names = self.version_names();
        names.sort();
        digest::compute(&names, short)
    }

    /// `timestamp.title.prefix` of `name`, discarding anything past the
    /// third dot (used to canonicalize undo arguments).
    pub fn extract_version(name: &str) -> Option<String> {
        crate::migration::extract_version(name)
    }
}

fn validate_wrap(file: &MigrationFile) -> Result<(), Error> {
    wrap::validate(file.sql(), file.vars())
        .map(|_| ())
        .map_err(|errors| Error::new(Kind::WrapValidation(file.path().to_path_buf(), errors.join("; ")), None))
}

/// `schema` begins with `prefix`, and the character right after the prefix
/// (if any) is either absent, a digit, or `prefix` itself already contains a
/// digit. Lets `sh` match `sh0001` without matching `sharding`, while letting
/// an exact match like `public` match itself.
fn schema_name_matches_prefix(schema: &str, prefix: &str) -> bool {
    if !schema.starts_with(prefix) {
        return false;
    }
    let rest = &schema[prefix.len()..];
    match rest.chars().next() {
        None => true,
        Some(c) if c.is_ascii_digit() => true,
        _ => prefix.chars().any(|c| c.is_ascii_digit()),
    }
}
