//! CLI surface tests. The build itself is covered by `build_test`; these
//! only exercise argument handling and error reporting.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn missing_source_directory_fails_with_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("bindery")
        .unwrap()
        .arg(dir.path().join("no-such-book"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn directory_without_container_fails_with_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("bindery")
        .unwrap()
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("META-INF/container.xml"));
}

#[test]
fn help_lists_build_flags() {
    Command::cargo_bin("bindery")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--kobo")
                .and(predicate::str::contains("--kindle"))
                .and(predicate::str::contains("--check"))
                .and(predicate::str::contains("--output-dir")),
        );
}
