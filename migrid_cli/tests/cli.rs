mod cli {
    use assert_cmd::prelude::*;
    use predicates::str::contains;
    use std::process::Command;

    // `migrid` with no hosts configured should exit with a non-zero code.
    #[test]
    fn cli_no_hosts_fails() {
        Command::cargo_bin("migrid")
            .unwrap()
            .args(["--migdir", "/nonexistent"])
            .assert()
            .failure();
    }

    #[test]
    fn cli_version() {
        Command::cargo_bin("migrid")
            .unwrap()
            .args(["-V"])
            .assert()
            .stdout(contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn make_without_prefix_fails() {
        let dir = tempfile::tempdir().unwrap();
        Command::cargo_bin("migrid")
            .unwrap()
            .args(["--migdir", dir.path().to_str().unwrap(), "make", "add_cars"])
            .assert()
            .failure();
    }

    #[test]
    fn make_scaffolds_up_and_dn_files() {
        let dir = tempfile::tempdir().unwrap();
        Command::cargo_bin("migrid")
            .unwrap()
            .args(["--migdir", dir.path().to_str().unwrap(), "make", "add_cars@sh"])
            .assert()
            .success();

        let has_up = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".up.sql"));
        assert!(has_up);
    }

    #[test]
    fn list_reports_registry_contents() {
        let dir = tempfile::tempdir().unwrap();
        Command::cargo_bin("migrid")
            .unwrap()
            .args(["--migdir", dir.path().to_str().unwrap(), "make", "add_cars@sh"])
            .assert()
            .success();

        Command::cargo_bin("migrid")
            .unwrap()
            .args(["--migdir", dir.path().to_str().unwrap(), "--hosts", "localhost", "list"])
            .assert()
            .success()
            .stdout(contains("add_cars.sh"));
    }
}
