//! CLI regression tests for the `tandem` binary.
//!
//! These tests invoke the binary as a subprocess to catch regressions in
//! flag names, exit codes, and output formats.

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

use tandem_test::TestProject;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A `tandem` command pointed at `project`, with no inherited credentials.
fn tandem(project: &TestProject) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("tandem").expect("tandem binary not built");
    cmd.current_dir(project.root())
        .arg("--config")
        .arg(project.config_path())
        .env_remove("TANDEM_CONFIG")
        .env_remove("TANDEM_VERSION")
        .env_remove("TANDEM_REGISTRY_USER")
        .env_remove("TANDEM_REGISTRY_TOKEN");
    cmd
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().expect("tandem should run");
    let stdout = String::from_utf8(output.stdout).expect("stdout should be valid UTF-8");
    serde_json::from_str(&stdout).expect("--format json output should be valid JSON")
}

// ---------------------------------------------------------------------------
// tandem check / inspect / version
// ---------------------------------------------------------------------------

#[test]
fn check_accepts_valid_project() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .arg("check")
        .assert()
        .success()
        .stdout(contains("OK"));
}

#[test]
fn missing_config_exits_two() {
    let dir = TempDir::new().unwrap();
    #[allow(deprecated)]
    Command::cargo_bin("tandem")
        .unwrap()
        .current_dir(dir.path())
        .env_remove("TANDEM_CONFIG")
        .args(["--config", "does-not-exist.yaml", "check"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_log_format_exits_two() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .args(["--log-format", "xml", "check"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("unknown log format"));
}

#[test]
fn inspect_summarizes_contract() {
    let project = TestProject::new().unwrap();
    let summary = json_stdout(tandem(&project).args(["inspect", "--format", "json"]));
    assert_eq!(summary["summary"]["title"], "Health API");
    assert_eq!(summary["summary"]["operation_count"], 1);
    assert_eq!(summary["sha256"].as_str().map(str::len), Some(64));
}

#[test]
fn inspect_missing_contract_exits_three() {
    let project = TestProject::new().unwrap();
    project.remove_contract().unwrap();
    tandem(&project)
        .arg("inspect")
        .assert()
        .failure()
        .code(3)
        .stderr(contains("E2001"));
}

#[test]
fn version_override_is_printed() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .args(["version", "--version-override", "1.4.2"])
        .assert()
        .success()
        .stdout("1.4.2\n");
}

#[test]
fn version_override_rejects_prerelease() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .args(["version", "--version-override", "1.4.2-rc.1"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn version_without_history_is_base_version() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .env("GIT_CEILING_DIRECTORIES", project.root())
        .arg("version")
        .assert()
        .success()
        .stdout("0.0.1\n");
}

// ---------------------------------------------------------------------------
// tandem generate / build / package
// ---------------------------------------------------------------------------

#[test]
fn missing_contract_exits_three() {
    let project = TestProject::new().unwrap();
    project.remove_contract().unwrap();
    tandem(&project)
        .arg("build")
        .assert()
        .failure()
        .code(3)
        .stderr(contains("error[E2001] load_contract"));
}

#[cfg(unix)]
#[test]
fn generate_server_leaves_client_untouched() {
    let project = TestProject::new().unwrap();
    tandem(&project).arg("generate-server").assert().success();

    let server = project.root().join("build/generated/server");
    assert!(server
        .join("src/main/kotlin/com/example/health/server/api/HealthApi.kt")
        .is_file());
    assert!(!project.root().join("build/generated/client").exists());
}

#[cfg(unix)]
#[test]
fn second_generate_is_up_to_date() {
    let project = TestProject::new().unwrap();
    tandem(&project).arg("generate-client").assert().success();

    let report = json_stdout(tandem(&project).args(["generate-client", "--format", "json"]));
    assert_eq!(report["branches"][0]["target"], "client");
    assert_eq!(report["branches"][0]["up_to_date"], true);

    let forced =
        json_stdout(tandem(&project).args(["generate-client", "--force", "--format", "json"]));
    assert_eq!(forced["branches"][0]["up_to_date"], false);
}

#[cfg(unix)]
#[test]
fn corrupt_contract_fails_without_archives() {
    let project = TestProject::with_contract_fixture("corrupt.yaml").unwrap();
    tandem(&project)
        .args(["package", "--version-override", "1.0.0"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("error[E2010] server generate"))
        .stderr(contains("error[E2010] client generate"));
    assert!(project.archives().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn package_writes_one_archive_per_branch() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .args(["package", "--version-override", "2.0.1"])
        .assert()
        .success()
        .stdout(contains("version 2.0.1"));

    let names: Vec<String> = project
        .archives()
        .unwrap()
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    assert_eq!(
        names,
        vec![
            "health-api-client-2.0.1.tar.gz".to_string(),
            "health-api-server-2.0.1.tar.gz".to_string(),
        ]
    );
}

// ---------------------------------------------------------------------------
// tandem publish
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn publish_without_credentials_reports_e2040() {
    let project = TestProject::new().unwrap();
    tandem(&project)
        .args(["publish", "--version-override", "1.0.0"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("error[E2040] server publish"))
        .stderr(contains("error[E2040] client publish"))
        .stderr(contains("TANDEM_REGISTRY_TOKEN"));

    assert_eq!(project.archives().unwrap().len(), 2);
    assert!(project.registry_files().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn publish_uploads_both_archives() {
    let project = TestProject::new().unwrap();
    let report = json_stdout(
        tandem(&project)
            .env("TANDEM_REGISTRY_USER", "ci")
            .env("TANDEM_REGISTRY_TOKEN", "secret")
            .args(["publish", "--version-override", "1.2.3", "--format", "json"]),
    );

    assert_eq!(report["version"], "1.2.3");
    for branch in report["branches"].as_array().unwrap() {
        assert_eq!(branch["state"], "published");
        let publisher = branch["receipt"]["published_by"].as_str().unwrap();
        assert!(publisher.starts_with("tandem "), "unexpected publisher {}", publisher);
    }

    let uploaded: Vec<_> = project
        .registry_files()
        .unwrap()
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(".tar.gz"))
        .collect();
    assert_eq!(uploaded.len(), 2);
    assert!(project
        .registry_dir()
        .join("com/example/health/health-api-server/1.2.3/health-api-server-1.2.3.tar.gz.sha256")
        .is_file());

    for archive in project.archives().unwrap() {
        let receipt = receipt_for(&archive);
        assert!(receipt.is_file(), "missing receipt for {}", archive.display());
    }
}

#[cfg(unix)]
#[test]
fn publish_reads_credentials_from_properties_file() {
    let project = TestProject::new().unwrap();
    project.write_credentials("release-bot", "t0ken").unwrap();
    tandem(&project)
        .args(["publish", "--version-override", "0.9.0"])
        .assert()
        .success()
        .stdout(contains("published"));
}

fn receipt_for(archive: &std::path::Path) -> std::path::PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".published.json");
    name.into()
}
