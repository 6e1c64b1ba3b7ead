use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn depchain() -> Result<Command, Box<dyn std::error::Error>> {
    Ok(Command::cargo_bin("depchain")?)
}

/// Windows/System32 under `root`, enough to be picked up as an installation
fn fake_windows_root(root: &Path) -> std::io::Result<()> {
    let sys_dir = root.join("Windows").join("System32");
    fs::create_dir_all(&sys_dir)?;
    fs::write(sys_dir.join("kernel32.dll"), b"MZ")
}

#[test]
fn a_mode_is_required() -> TestResult {
    depchain()?
        .arg("app.exe")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
    Ok(())
}

#[test]
fn modes_are_exclusive() -> TestResult {
    depchain()?
        .args(["--imports", "--exports", "app.exe"])
        .assert()
        .failure()
        .code(2);
    Ok(())
}

#[test]
fn file_modes_need_a_file() -> TestResult {
    depchain()?
        .arg("--imports")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("<FILE>"));
    Ok(())
}

#[test]
fn missing_input_is_fatal() -> TestResult {
    let d = tempfile::tempdir()?;
    depchain()?
        .arg("--chain")
        .arg(d.path().join("nothere.exe"))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Could not find file"));
    Ok(())
}

#[test]
fn non_pe_input_is_fatal() -> TestResult {
    let d = tempfile::tempdir()?;
    let notes = d.path().join("notes.exe");
    fs::write(&notes, "just some text")?;
    depchain()?
        .arg("--imports")
        .arg(&notes)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("as a PE"));
    Ok(())
}

#[test]
fn modules_listing_has_no_json_output() -> TestResult {
    // rejected before the (missing) file is looked at
    depchain()?
        .args(["--modules", "--json", "nothere.exe"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--modules does not support JSON output"))
        .stderr(predicate::str::contains("Could not find file").not());
    Ok(())
}

#[test]
fn known_dlls_of_a_mounted_installation() -> TestResult {
    let d = tempfile::tempdir()?;
    fake_windows_root(d.path())?;
    depchain()?
        .arg("--knowndll")
        .arg("--windows-root")
        .arg(d.path())
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[-] 64-bit KnownDlls :"))
        .stdout(predicate::str::contains("kernel32.dll"))
        .stdout(predicate::str::contains("[-] 32-bit KnownDlls :"));

    let output = depchain()?
        .args(["--knowndll", "--json", "--windows-root"])
        .arg(d.path())
        .output()?;
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert!(doc["x64"].as_array().map(|a| !a.is_empty()).unwrap_or(false));
    Ok(())
}

#[test]
fn invalid_windows_root_is_reported() -> TestResult {
    let d = tempfile::tempdir()?;
    depchain()?
        .arg("--knowndll")
        .arg("--windows-root")
        .arg(d.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid --windows-root"));
    Ok(())
}

#[test]
fn api_sets_of_a_file_without_schema() -> TestResult {
    let d = tempfile::tempdir()?;
    let notes = d.path().join("apisetschema.dll");
    fs::write(&notes, "not a PE")?;
    depchain()?
        .arg("--apisetsdll")
        .arg(&notes)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Could not read the API set schema"));
    Ok(())
}
