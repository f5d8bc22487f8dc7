//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// A throwaway repository with its own gate store, driven through `vgate`.
pub struct GateFixture {
    _dir: TempDir,
    pub repo: PathBuf,
}

pub fn fixture() -> GateFixture {
    let dir = tempfile::tempdir().expect("create temp dir");
    let repo = dir.path().join("repo");
    fs::create_dir_all(&repo).expect("create repo");
    GateFixture { _dir: dir, repo }
}

impl GateFixture {
    pub fn store(&self) -> PathBuf {
        self.repo.join(".vgate")
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.repo.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write fixture file");
    }

    /// Run `vgate` with a pinned period and no interactive prompts.
    pub fn vgate(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("run vgate")
    }

    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_vgate"));
        cmd.arg("--repo")
            .arg(&self.repo)
            .args(args)
            .env_remove("VGATE_STORE")
            .env_remove("VGATE_LOG")
            .env("VGATE_PERIOD", "W1")
            .env("VGATE_NONINTERACTIVE", "1");
        cmd
    }

    /// Run and parse stdout as JSON, asserting the exit code.
    pub fn vgate_json(&self, args: &[&str], expected_code: i32) -> Value {
        let output = self.vgate(args);
        assert_exit(&output, expected_code);
        serde_json::from_slice(&output.stdout).expect("parse vgate json")
    }

    /// Run and return trimmed stdout, asserting success.
    pub fn vgate_ok(&self, args: &[&str]) -> String {
        let output = self.vgate(args);
        assert_exit(&output, 0);
        stdout(&output)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.repo.join(rel)
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn assert_exit(output: &Output, expected: i32) {
    assert_eq!(
        output.status.code(),
        Some(expected),
        "unexpected exit code\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}
