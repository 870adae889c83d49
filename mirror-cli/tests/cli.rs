use std::fs;
use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CREDENTIAL_VARS: &[&str] = &[
    "FTRACK_SERVER",
    "FTRACK_API_USER",
    "FTRACK_API_KEY",
    "UNDARK_FTRACK_API_URL",
    "UNDARK_FTRACK_API_USER",
    "UNDARK_FTRACK_API_KEY",
];

/// A `trackmirror` invocation isolated to `home` with no inherited credentials.
fn trackmirror(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("trackmirror").expect("binary");
    cmd.env("HOME", home).current_dir(home);
    for var in CREDENTIAL_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(home: &Path, yaml: &str) {
    let root = home.join(".trackmirror");
    fs::create_dir_all(&root).expect("config dir");
    fs::write(root.join("config.yaml"), yaml).expect("config");
}

#[test]
fn check_config_resolves_both_servers() {
    let home = TempDir::new().expect("home");
    write_config(
        home.path(),
        "servers:\n  undark:\n    url: https://undark.example.com/\n    api_user: sync-bot\n",
    );
    fs::write(
        home.path().join(".trackmirror/.env"),
        "UNDARK_FTRACK_API_KEY=undark-key\n",
    )
    .expect("env file");

    trackmirror(home.path())
        .env("FTRACK_SERVER", "https://pbv.example.com")
        .env("FTRACK_API_USER", "pipeline")
        .env("FTRACK_API_KEY", "pbv-key")
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("https://undark.example.com as sync-bot"))
        .stdout(predicate::str::contains("https://pbv.example.com as pipeline"))
        .stdout(predicate::str::contains("undark-key").not());
}

#[test]
fn check_config_names_the_missing_variable() {
    let home = TempDir::new().expect("home");

    trackmirror(home.path())
        .env("FTRACK_SERVER", "https://pbv.example.com")
        .env("FTRACK_API_USER", "pipeline")
        .env("FTRACK_API_KEY", "pbv-key")
        .arg("check-config")
        .assert()
        .failure()
        .stdout(predicate::str::contains("UNDARK_FTRACK_API_URL"))
        .stderr(predicate::str::contains("1 server(s) are not fully configured"));
}

#[test]
fn check_config_rejects_malformed_yaml() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), "sync: [not, a, map\n");

    trackmirror(home.path())
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}

#[test]
fn status_and_stop_without_daemon() {
    let home = TempDir::new().expect("home");

    trackmirror(home.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": false"));

    trackmirror(home.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon is not running"));
}

struct DaemonProcess {
    child: Child,
}

impl DaemonProcess {
    fn start(home: &Path) -> Self {
        let binary = assert_cmd::cargo::cargo_bin("trackmirror");
        let child = StdCommand::new(binary)
            .env("HOME", home)
            .current_dir(home)
            .args(["run", "--memory"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn memory_daemon_reports_status_and_stops() {
    let home = TempDir::new().expect("home");
    let mut daemon = DaemonProcess::start(home.path());

    let socket = home.path().join(".trackmirror/run/daemon.sock");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "daemon socket never appeared");
        sleep(Duration::from_millis(50));
    }

    trackmirror(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("running"))
        .stdout(predicate::str::contains("memory backend"))
        .stdout(predicate::str::contains("suppressed"));

    trackmirror(home.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon stop requested"));

    assert!(daemon.wait_for_exit(Duration::from_secs(10)), "daemon did not exit");
    assert!(!socket.exists());
}
