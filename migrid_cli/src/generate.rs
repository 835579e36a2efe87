use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

/// Scaffolds `<ts>.<title>.<prefix>.{up,dn}.sql`, creating `before.sql`/
/// `after.sql` stubs the first time a migration is generated in `migdir`.
pub fn handle_generate_command(migdir: &Path, spec: &str) -> Result<()> {
    let (title, prefix) = spec
        .split_once('@')
        .with_context(|| format!("migration spec {spec:?} must be <title>@<prefix>"))?;
    let title = sanitize_name(title);
    if prefix.is_empty() {
        anyhow::bail!("migration spec {spec:?} has an empty schema prefix");
    }

    fs::create_dir_all(migdir).with_context(|| format!("failed to create migrations directory at {migdir:?}"))?;

    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let base = format!("{timestamp}.{title}.{prefix}");

    write_stub(&migdir.join(format!("{base}.up.sql")), "-- write your up migration SQL here\n")?;
    write_stub(&migdir.join(format!("{base}.dn.sql")), "-- write your down migration SQL here\n")?;

    let before = migdir.join("before.sql");
    let after = migdir.join("after.sql");
    if !before.exists() {
        write_stub(&before, "-- runs once per host at the start of every non-fast-path run\n")?;
    }
    if !after.exists() {
        write_stub(&after, "-- runs once per host at the end of every non-fast-path run\n")?;
    }

    println!("Created migration: {base}");
    println!("Migration directory: {migdir:?}");
    Ok(())
}

fn sanitize_name(name: &str) -> String {
    let lowercase = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    let mut result = String::with_capacity(lowercase.len());
    let mut last_was_underscore = false;
    for c in lowercase.chars() {
        if c == '_' {
            if !last_was_underscore {
                result.push(c);
            }
            last_was_underscore = true;
        } else {
            result.push(c);
            last_was_underscore = false;
        }
    }
    result.trim_matches('_').to_string()
}

fn write_stub(path: &PathBuf, content: &str) -> Result<()> {
    if path.exists() {
        anyhow::bail!("migration file already exists at {path:?}");
    }
    fs::write(path, content).with_context(|| format!("failed to write migration file at {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names_like_the_teacher_does() {
        assert_eq!(sanitize_name("create_users_table"), "create_users_table");
        assert_eq!(sanitize_name("CreateUsersTable"), "createuserstable");
        assert_eq!(sanitize_name("create-users-table"), "create_users_table");
        assert_eq!(sanitize_name("create users table"), "create_users_table");
        assert_eq!(sanitize_name("create.users.table"), "create_users_table");
        assert_eq!(sanitize_name("_create_users_table_"), "create_users_table");
        assert_eq!(sanitize_name("create__users___table"), "create_users_table");
        assert_eq!(sanitize_name("__Create-Users__Table!@#$%^&*()__"), "create_users_table");
    }

    #[test]
    fn generates_up_dn_pair_and_stubs_before_after_once() {
        let dir = tempfile::tempdir().unwrap();
        handle_generate_command(dir.path(), "add_cars@sh").unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
        assert!(entries.iter().any(|e| e.file_name().to_string_lossy().ends_with(".up.sql")));
        assert!(entries.iter().any(|e| e.file_name().to_string_lossy().ends_with(".dn.sql")));
        assert!(dir.path().join("before.sql").exists());
        assert!(dir.path().join("after.sql").exists());
    }

    #[test]
    fn rejects_spec_without_prefix() {
        let dir = tempfile::tempdir().unwrap();
        assert!(handle_generate_command(dir.path(), "add_cars").is_err());
    }
}
