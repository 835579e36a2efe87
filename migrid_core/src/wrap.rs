//! The non-transactional index wrapping rules (design §4.7).
//!
//! `CREATE INDEX CONCURRENTLY` / `DROP INDEX CONCURRENTLY` cannot run inside
//! a transaction. A migration file built solely around one of these
//! statements ("alone") gets wrapped by the engine with a `COMMIT; ... ;
//! BEGIN;` sandwich so the outer transaction briefly closes for it. A file
//! that sandwiches its own `COMMIT;`/`BEGIN;` around a concurrently-created
//! index amid other statements ("mixed") is left untouched but still has to
//! satisfy the same safety requirements by hand.

use std::sync::OnceLock;

use regex::Regex;

use crate::migration::Variables;

fn line_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--[^\n]*").unwrap())
}

fn block_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").unwrap())
}

fn create_concurrently_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)CREATE\s+(?:UNIQUE\s+)?INDEX\s+CONCURRENTLY\s+(?:IF\s+NOT\s+EXISTS\s+)?("(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_]*)"#,
        )
        .unwrap()
    })
}

fn drop_concurrently_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)DROP\s+INDEX\s+CONCURRENTLY\s+(IF\s+EXISTS\s+)?("(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_]*)"#,
        )
        .unwrap()
    })
}

/// Strip `--` line comments and `/* */` block comments, then trim leading
/// whitespace and empty leading semicolons.
fn normalized_body(sql: &str) -> String {
    let no_block = block_comment_re().replace_all(sql, "");
    let no_line = line_comment_re().replace_all(&no_block, "");
    let mut body = no_line.trim().to_string();
    while let Some(rest) = body.strip_prefix(';') {
        body = rest.trim_start().to_string();
    }
    body
}

/// What the wrap validator concluded about one migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapOutcome {
    /// No `CONCURRENTLY` index statement found; run as a normal transaction.
    Untouched,
    /// The whole file is one `CONCURRENTLY` statement; the engine must wrap it.
    Alone { index_names: Vec<String>, kind: ConcurrentKind },
    /// The file already sandwiches its own `COMMIT;`/`BEGIN;`; run as-is.
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentKind {
    Create,
    Drop,
}

/// Validates one migration file's body against the rules above.
/// Returns the list of violations (non-empty) on failure.
pub fn validate(sql: &str, vars: &Variables) -> Result<WrapOutcome, Vec<String>> {
    let body = normalized_body(sql);

    if let Some(creates) = collect_matches(&body, create_concurrently_re()) {
        return validate_create(&body, vars, creates);
    }

    if let Some(drops) = collect_matches(&body, drop_concurrently_re()) {
        return validate_drop(&body, vars, drops);
    }

    Ok(WrapOutcome::Untouched)
}

fn collect_matches(body: &str, re: &Regex) -> Option<Vec<String>> {
    let names: Vec<String> = re
        .captures_iter(body)
        .map(|c| c.get(c.len() - 1).unwrap().as_str().to_string())
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// Blanks out the contents of every `'...'` and `"..."` span with ASCII
/// spaces, byte-for-byte, so a `;` inside a string literal or quoted
/// identifier (e.g. `WHERE c='a;b'`) doesn't get mistaken for a statement
/// separator. Doubled quotes (`''`, `""`) are the escape form and stay
/// inside the span. Operates on raw bytes so match offsets computed against
/// the original string stay valid against the masked one; every byte
/// touched is ASCII, so the result is still valid UTF-8.
fn mask_quoted(s: &str) -> String {
    let mut bytes = s.as_bytes().to_vec();
    let mut i = 0;
    while i < bytes.len() {
        let delim = bytes[i];
        if delim == b'\'' || delim == b'"' {
            let start = i;
            i += 1;
            let mut terminated = false;
            loop {
                match bytes.get(i) {
                    None => break,
                    Some(&b) if b == delim => {
                        if bytes.get(i + 1) == Some(&delim) {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        terminated = true;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            let span_end = if terminated { i - 1 } else { i };
            for b in &mut bytes[start + 1..span_end] {
                *b = b' ';
            }
        } else {
            i += 1;
        }
    }
    String::from_utf8(bytes).expect("masking only replaces ASCII bytes with ASCII spaces")
}

fn is_alone(body: &str, stmt_re: &Regex) -> bool {
    let matches: Vec<_> = stmt_re.find_iter(body).collect();
    if matches.len() != 1 {
        return false;
    }
    let m = matches[0];
    let masked = mask_quoted(body);
    let before = masked[..m.start()].trim();
    let mut after = masked[m.end()..].trim();
    after = after.strip_prefix(';').unwrap_or(after).trim();
    // allow a trailing WHERE clause / target list after the matched prefix by
    // requiring only that nothing but the one statement remains
    before.is_empty() && !after.contains(';')
}

fn validate_create(body: &str, vars: &Variables, names: Vec<String>) -> Result<WrapOutcome, Vec<String>> {
    if is_alone(body, create_concurrently_re()) && vars.has_concurrency_directive() {
        return Ok(WrapOutcome::Alone {
            index_names: names,
            kind: ConcurrentKind::Create,
        });
    }

    let mut errors = vec!["(due to having \"CREATE INDEX CONCURRENTLY\")".to_string()];
    if !body.trim_start().to_uppercase().starts_with("COMMIT;") {
        errors.push("migration must start with \"COMMIT;\" when mixed with other statements".to_string());
    }
    if !body.trim_end().to_uppercase().ends_with("BEGIN;") {
        errors.push("migration must end with \"BEGIN;\" to reopen the transaction".to_string());
    }
    if !vars.has_concurrency_directive() {
        errors.push(
            "at least one of $parallelism_per_host, $parallelism_global or $run_alone must be set".to_string(),
        );
    }
    for name in &names {
        let needle = format!("DROP INDEX IF EXISTS {name};");
        if !body.to_uppercase().contains(&needle.to_uppercase()) {
            errors.push(format!("missing required \"{needle}\" before the CREATE"));
        }
    }
    Err(errors)
}

fn validate_drop(body: &str, vars: &Variables, names: Vec<String>) -> Result<WrapOutcome, Vec<String>> {
    let if_exists_re = Regex::new(r"(?is)DROP\s+INDEX\s+CONCURRENTLY\s+IF\s+EXISTS").unwrap();

    if is_alone(body, drop_concurrently_re()) {
        if if_exists_re.is_match(body) {
            return Ok(WrapOutcome::Alone {
                index_names: names,
                kind: ConcurrentKind::Drop,
            });
        }
        return Err(vec![
            "(due to having \"DROP INDEX CONCURRENTLY\")".to_string(),
            "a lone DROP INDEX CONCURRENTLY must use IF EXISTS".to_string(),
        ]);
    }

    let mut errors = vec!["(due to having \"DROP INDEX CONCURRENTLY\")".to_string()];
    if !body.trim_start().to_uppercase().starts_with("COMMIT;") {
        errors.push("migration must start with \"COMMIT;\" when mixed with other statements".to_string());
    }
    if !body.trim_end().to_uppercase().ends_with("BEGIN;") {
        errors.push("migration must end with \"BEGIN;\" to reopen the transaction".to_string());
    }
    if !vars.has_concurrency_directive() {
        errors.push(
            "at least one of $parallelism_per_host, $parallelism_global or $run_alone must be set".to_string(),
        );
    }
    if errors.len() > 1 {
        Err(errors)
    } else {
        Ok(WrapOutcome::Mixed)
    }
}

/// Produces the statement list the engine must run for an [`WrapOutcome::Alone`]
/// migration, surrounding the file with `COMMIT; ...; BEGIN;`.
pub fn wrap_statements(outcome: &WrapOutcome, file_directive: &str) -> Vec<String> {
    match outcome {
        WrapOutcome::Alone {
            index_names,
            kind: ConcurrentKind::Create,
        } => {
            let mut stmts = vec!["COMMIT;".to_string()];
            for name in index_names {
                stmts.push(format!("DROP INDEX CONCURRENTLY IF EXISTS {name};"));
            }
            stmts.push(file_directive.to_string());
            stmts.push("BEGIN;".to_string());
            stmts
        }
        WrapOutcome::Alone {
            kind: ConcurrentKind::Drop,
            ..
        } => vec!["COMMIT;".to_string(), file_directive.to_string(), "BEGIN;".to_string()],
        WrapOutcome::Mixed | WrapOutcome::Untouched => vec![file_directive.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars_with_parallelism() -> Variables {
        Variables {
            parallelism_per_host: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn index_alone_success() {
        let sql = r#"CREATE INDEX CONCURRENTLY IF NOT EXISTS "x""y" ON t(c) WHERE c='a;b';"#;
        let outcome = validate(sql, &vars_with_parallelism()).unwrap();
        match &outcome {
            WrapOutcome::Alone { index_names, kind } => {
                assert_eq!(kind, &ConcurrentKind::Create);
                assert_eq!(index_names, &[r#""x""y""#.to_string()]);
            }
            _ => panic!("expected alone outcome"),
        }
        let wrapped = wrap_statements(&outcome, "\\i file.sql");
        assert_eq!(
            wrapped,
            vec![
                "COMMIT;".to_string(),
                r#"DROP INDEX CONCURRENTLY IF EXISTS "x""y";"#.to_string(),
                "\\i file.sql".to_string(),
                "BEGIN;".to_string(),
            ]
        );
    }

    #[test]
    fn index_mixed_failure() {
        let sql = r#"SELECT 1; CREATE INDEX CONCURRENTLY "abc" ON tbl(col);"#;
        let errors = validate(sql, &Variables::default()).unwrap_err();
        assert_eq!(errors[0], "(due to having \"CREATE INDEX CONCURRENTLY\")");
        assert!(errors.iter().any(|e| e.contains("start with \"COMMIT;\"")));
        assert!(errors
            .iter()
            .any(|e| e.contains("$parallelism_per_host, $parallelism_global or $run_alone")));
        assert!(errors.iter().any(|e| e.contains(r#"DROP INDEX IF EXISTS "abc";"#)));
        assert!(errors.iter().any(|e| e.contains("end with \"BEGIN;\"")));
    }

    #[test]
    fn mixed_sandwich_succeeds_with_drop_and_vars() {
        let sql = r#"COMMIT;
DROP INDEX IF EXISTS "abc";
CREATE INDEX CONCURRENTLY "abc" ON tbl(col);
BEGIN;"#;
        let outcome = validate(sql, &vars_with_parallelism()).unwrap();
        assert_eq!(outcome, WrapOutcome::Mixed);
    }

    #[test]
    fn untouched_without_concurrently() {
        let sql = "CREATE TABLE foo(id int);";
        assert_eq!(validate(sql, &Variables::default()).unwrap(), WrapOutcome::Untouched);
    }

    #[test]
    fn drop_alone_requires_if_exists() {
        let sql = "DROP INDEX CONCURRENTLY abc;";
        let errors = validate(sql, &Variables::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("IF EXISTS")));
    }

    #[test]
    fn drop_alone_with_if_exists_succeeds() {
        let sql = "DROP INDEX CONCURRENTLY IF EXISTS abc;";
        let outcome = validate(sql, &Variables::default()).unwrap();
        assert!(matches!(
            outcome,
            WrapOutcome::Alone {
                kind: ConcurrentKind::Drop,
                ..
            }
        ));
    }
}
