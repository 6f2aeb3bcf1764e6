use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use dehaze_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "DEHAZE_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "DEHAZE_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

fn crash_reports(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect();
    paths.sort();
    paths
}

/// Runs only when spawned by the tests below.
#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir"));

    let first = install_panic_hook(Some(&data_dir));
    assert!(matches!(first, PanicHookInstallPlan::Installed { .. }));
    let second = install_panic_hook(Some(&data_dir));
    assert!(matches!(second, PanicHookInstallPlan::AlreadyInstalled { .. }));

    match mode.as_str() {
        "write_success" => panic!("inference worker fell over"),
        "write_failure" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash directory");
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with a file");
            panic!("crash directory is gone");
        }
        other => panic!("unknown child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_report() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let reports = crash_reports(&crash_dir(data_dir.path()));
    let newest = reports.last().expect("expected a crash report");
    let contents = fs::read_to_string(newest).expect("read crash report");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("version="));
    assert!(contents.contains("payload=inference worker fell over"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("panicked while panicking"));
}

#[test]
fn crash_hook_with_unwritable_dir_warns_without_repanicking() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("crash directory is gone"));
    assert!(stderr.contains("Warning: failed to write crash report under"));
    assert!(!stderr.contains("panicked while panicking"));
}
