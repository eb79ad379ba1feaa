//! Configuration diagnostics and file loading.

use std::fs;
use std::path::{Path, PathBuf};

use pullwatch_core::{config, ConfigError};
use rstest::rstest;
use tempfile::TempDir;

const BRANCHES: &str = "[branches]\ndev = develop\nmaster = master\n";
const DIRECTORIES: &str = "[directories]\ndev = /srv/app-dev\nmaster = /srv/app\n";
const GIT: &str = "[git]\nurl = https://example/repo.git\n";

fn origin() -> PathBuf {
    PathBuf::from("/etc/pullwatch.ini")
}

// ---------------------------------------------------------------------------
// 1. Missing sections: one distinct diagnostic each
// ---------------------------------------------------------------------------

#[rstest]
#[case::branches("branches", format!("{DIRECTORIES}{GIT}"))]
#[case::directories("directories", format!("{BRANCHES}{GIT}"))]
#[case::git("git", format!("{BRANCHES}{DIRECTORIES}"))]
fn missing_section_names_the_section(#[case] section: &str, #[case] doc: String) {
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    match &err {
        ConfigError::MissingSection { section: got, path } => {
            assert_eq!(*got, section);
            assert_eq!(path, &origin());
        }
        other => panic!("expected MissingSection, got {other:?}"),
    }
    let msg = err.to_string();
    assert!(
        msg.contains(&format!("no `{section}` section")),
        "diagnostic should name the section, got: {msg}"
    );
    assert!(msg.contains("pullwatch.ini"), "diagnostic should name the file");
}

#[test]
fn branches_is_reported_before_other_sections() {
    let err = config::parse_str("", &origin()).unwrap_err();
    assert!(
        matches!(err, ConfigError::MissingSection { section: "branches", .. }),
        "got: {err}"
    );
}

// ---------------------------------------------------------------------------
// 2. Per-category and remote validation
// ---------------------------------------------------------------------------

#[test]
fn missing_remote_url_is_fatal() {
    let doc = format!("{BRANCHES}{DIRECTORIES}[git]\n");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    assert!(matches!(err, ConfigError::MissingRemoteUrl { .. }), "got: {err}");

    let doc = format!("{BRANCHES}{DIRECTORIES}[git]\nurl =\n");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    assert!(matches!(err, ConfigError::MissingRemoteUrl { .. }), "got: {err}");
}

#[test]
fn category_without_directory_is_fatal() {
    let doc = format!("{BRANCHES}[directories]\ndev = /srv/app-dev\n{GIT}");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    match err {
        ConfigError::MissingDirectory { category, .. } => assert_eq!(category, "master"),
        other => panic!("expected MissingDirectory, got {other:?}"),
    }
}

#[test]
fn empty_branch_name_is_fatal() {
    let doc = format!("[branches]\ndev =\n{DIRECTORIES}{GIT}");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    assert!(matches!(err, ConfigError::EmptyBranch { .. }), "got: {err}");
}

#[test]
fn empty_branches_section_is_fatal() {
    let doc = format!("[branches]\n{DIRECTORIES}{GIT}");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    assert!(matches!(err, ConfigError::MissingBranch { .. }), "got: {err}");
}

#[rstest]
#[case::no_master("[branches]\ndev = develop\n[directories]\ndev = /srv/app-dev\n", "master")]
#[case::no_dev("[branches]\nmaster = master\n[directories]\nmaster = /srv/app\n", "dev")]
#[case::directory_only(
    "[branches]\ndev = develop\n[directories]\ndev = /srv/app-dev\nmaster = /srv/app\n",
    "master"
)]
fn dev_and_master_must_both_be_tracked(#[case] sections: &str, #[case] missing: &str) {
    let doc = format!("{sections}{GIT}");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    match &err {
        ConfigError::MissingBranch { category, .. } => assert_eq!(category, missing),
        other => panic!("expected MissingBranch, got {other:?}"),
    }
    assert!(err.to_string().contains("`branches` section"), "got: {err}");
}

#[rstest]
#[case::branches("branches", format!("[branches]\ndev = develop\ndev = other\nmaster = master\n{DIRECTORIES}"))]
#[case::directories("directories", format!("{BRANCHES}[directories]\ndev = /srv/a\ndev = /srv/b\nmaster = /srv/app\n"))]
fn repeated_category_is_fatal(#[case] section: &str, #[case] sections: String) {
    let doc = format!("{sections}{GIT}");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    match err {
        ConfigError::DuplicateCategory {
            category,
            section: got,
            ..
        } => {
            assert_eq!(category, "dev");
            assert_eq!(got, section);
        }
        other => panic!("expected DuplicateCategory, got {other:?}"),
    }
}

#[rstest]
#[case("interval", "soon")]
#[case("interval", "1e30")]
#[case("git_timeout", "1e300")]
#[case("git_timeout", "-5")]
#[case("reset_before_pull", "maybe")]
fn malformed_agent_values_are_rejected(#[case] key: &str, #[case] value: &str) {
    let doc = format!("{BRANCHES}{DIRECTORIES}{GIT}[agent]\n{key} = {value}\n");
    let err = config::parse_str(&doc, &origin()).unwrap_err();
    match err {
        ConfigError::InvalidValue { key: got, .. } => assert_eq!(got, key),
        other => panic!("expected InvalidValue, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 3. Loading from disk
// ---------------------------------------------------------------------------

fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("pullwatch.ini");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn load_at_reads_document_from_disk() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(dir.path(), &format!("{BRANCHES}{DIRECTORIES}{GIT}"));

    let config = config::load_at(&path).expect("load");
    assert_eq!(config.source, path);
    assert_eq!(config.remote_url, "https://example/repo.git");
    assert_eq!(config.targets.len(), 2);
}

#[test]
fn load_at_missing_file_returns_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let err = config::load_at(&dir.path().join("absent.ini")).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("absent.ini"));
}
