//! Integration tests for the clusterbus CLI.
//!
//! The later tests run real primary and worker processes and stop them with
//! signals.

use assert_cmd::Command;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use predicates::prelude::*;
use std::io::{BufRead, BufReader};
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::time::Duration;

/// Get a command for the clusterbus binary.
fn clusterbus() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("clusterbus").unwrap()
}

#[test]
fn test_help() {
    clusterbus()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::is_match(r"(?m)^\s+worker\s").unwrap().not());
}

#[test]
fn test_serve_help() {
    clusterbus()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--standalone"));
}

#[test]
fn test_zero_workers_rejected() {
    clusterbus()
        .args(["serve", "--workers", "0"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_worker_requires_id() {
    clusterbus().arg("worker").assert().failure();
}

/// A running `clusterbus` whose stderr is streamed line by line.
struct Running {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl Running {
    fn start(args: &[&str]) -> Self {
        let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("clusterbus"))
            .args(args)
            .env("CLUSTERBUS_LOG_FORMAT", "compact")
            .env_remove("RUST_LOG")
            .env_remove("CLUSTERBUS_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().unwrap();
        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { child, lines }
    }

    /// Block until a log line contains `needle`.
    fn wait_for(&self, needle: &str) {
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
            match self.lines.recv_timeout(left) {
                Ok(line) if line.contains(needle) => return,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        panic!("never saw {:?}", needle);
    }

    fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.child.id() as i32), signal).unwrap();
    }

    fn wait(mut self) -> i32 {
        let deadline = std::time::Instant::now() + Duration::from_secs(40);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code().unwrap_or(-1);
            }
            if std::time::Instant::now() > deadline {
                let _ = self.child.kill();
                panic!("clusterbus did not exit");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[test]
fn test_cluster_boots_and_stops_on_sigterm() {
    let running = Running::start(&["serve", "--workers", "2"]);
    running.wait_for("Server initialized successfully with 2 Workers");
    running.signal(Signal::SIGTERM);
    assert_eq!(running.wait(), 0);
}

#[test]
fn test_standalone_stops_on_sigint() {
    let running = Running::start(&["serve", "--standalone"]);
    running.wait_for("standalone mode");
    running.signal(Signal::SIGINT);
    assert_eq!(running.wait(), 0);
}
