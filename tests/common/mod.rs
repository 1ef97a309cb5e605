//! Shared fixtures for the integration tests.
//!
//! A [`Workspace`] is a temp dir holding a fake artifact, a suite script
//! whose behaviour is picked by the suite's first extra argument, and a
//! config file with sub-second timings.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use emu_harness::HarnessConfig;
use tempfile::TempDir;

/// Suite runner. `$1` is `--port=<agent port>`, `$2` the behaviour.
const SUITE_SCRIPT: &str = r#"#!/bin/sh
port="$1"
mode="$2"
echo "suite starting $port mode=$mode"
case "$mode" in
  pass)
    echo "TEST-PASS | test_a.html"
    echo "TEST-PASS | test_b.html"
    exit 0
    ;;
  warn)
    echo "TEST-PASS | test_a.html"
    echo "TEST-UNEXPECTED-FAIL | test_b.html | expected 1, got 2"
    exit 10
    ;;
  warn-many)
    i=0
    while [ $i -lt 10 ]; do
      echo "TEST-PASS | test_$i.html"
      i=$((i+1))
    done
    for t in x y z; do
      echo "TEST-UNEXPECTED-FAIL | test_$t.html | assertion failed"
    done
    exit 10
    ;;
  hang)
    echo "TEST-PASS | test_a.html"
    sleep 30
    ;;
  quiet)
    echo "nothing to report"
    exit 0
    ;;
  env)
    echo "TEST-PASS | upload=$MOZ_UPLOAD_DIR"
    exit 0
    ;;
  rerun)
    if [ -f "rerun-$port.flag" ]; then
      echo "TEST-PASS | second attempt"
      exit 0
    fi
    touch "rerun-$port.flag"
    echo "RERUN-REQUESTED"
    exit 0
    ;;
  always-rerun)
    echo "RERUN-REQUESTED"
    exit 0
    ;;
esac
echo "unknown mode $mode"
exit 2
"#;

/// One suite in the generated config.
pub struct SuiteDef {
    pub name: &'static str,
    pub mode: &'static str,
    pub extra: &'static str,
}

pub fn suite(name: &'static str, mode: &'static str) -> SuiteDef {
    SuiteDef { name, mode, extra: "" }
}

pub fn suite_with(name: &'static str, mode: &'static str, extra: &'static str) -> SuiteDef {
    SuiteDef { name, mode, extra }
}

/// Ports for one device; agent 1 is what suites talk to.
#[derive(Debug, Clone, Copy)]
pub struct DevicePorts {
    pub console: u16,
    pub agent1: u16,
}

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let suites = dir.path().join("suites");
        fs::create_dir_all(&suites).unwrap();
        fs::write(suites.join("suite.sh"), SUITE_SCRIPT).unwrap();
        fs::write(dir.path().join("app.apk"), b"apk").unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.path().join("upload")
    }

    pub fn remove_artifact(&self) {
        fs::remove_file(self.path().join("app.apk")).unwrap();
    }

    /// Config text for `suites` on devices with the given ports.
    /// `emulator` is the `[emulator]` table body.
    pub fn config_text(&self, suites: &[SuiteDef], devices: &[DevicePorts], emulator: &str) -> String {
        let mut text = String::new();
        let names: Vec<String> = suites.iter().map(|s| format!("\"{}\"", s.name)).collect();
        text.push_str(&format!("test_suites = [{}]\n\n", names.join(", ")));

        text.push_str(&format!(
            "[paths]\nwork_dir = \"{}\"\nupload_dir = \"upload\"\ninstaller_path = \"app.apk\"\npackage_name = \"org.example.app\"\n\n",
            self.path().display()
        ));
        text.push_str(&format!("[emulator]\n{}\n\n", emulator));

        for (i, ports) in devices.iter().enumerate() {
            let n = i as u16;
            text.push_str(&format!(
                "[[device]]\nname = \"emu-{}\"\nconsole_port = {}\nagent_port1 = {}\nagent_port2 = {}\nhttp_port = {}\nssl_port = {}\n\n",
                i + 1,
                ports.console,
                ports.agent1,
                20100 + n,
                18800 + n,
                14400 + n,
            ));
        }

        text.push_str(
            "[category.shell]\ntest_dir = \"suites\"\nrun_script = \"suite.sh\"\ninterpreter = [\"sh\"]\noptions = [\"--port={device_port}\"]\n\n",
        );
        for s in suites {
            text.push_str(&format!(
                "[suite.{}]\ncategory = \"shell\"\nextra_args = [\"{}\"]\n{}\n\n",
                s.name, s.mode, s.extra
            ));
        }

        text.push_str(
            "[timing]\n\
             redirect_attempts = 2\n\
             redirect_first_delay_secs = 0.1\n\
             redirect_delay_secs = 0.1\n\
             agent_attempts = 1\n\
             agent_delay_secs = 0.1\n\
             startup_attempts = 3\n\
             startup_delay_secs = 0.1\n\
             poll_interval_secs = 0.1\n\
             heartbeat_interval_secs = 0.3\n\
             terminate_grace_secs = 1.0\n\
             connect_timeout_secs = 1.0\n\
             read_timeout_secs = 1.0\n\
             install_timeout_secs = 5.0\n\
             suite_timeout_secs = 20.0\n\
             suite_idle_timeout_secs = 0.0\n",
        );
        text
    }

    pub fn config(&self, suites: &[SuiteDef], devices: &[DevicePorts], emulator: &str) -> HarnessConfig {
        let text = self.config_text(suites, devices, emulator);
        HarnessConfig::parse(&text).unwrap_or_else(|e| panic!("bad test config: {}\n{}", e, text))
    }
}

/// Device ports that are never bound, for backends that do not connect.
pub fn unbound_ports(count: usize) -> Vec<DevicePorts> {
    (0..count as u16)
        .map(|i| DevicePorts {
            console: 15554 + 2 * i,
            agent1: 20201 + i,
        })
        .collect()
}

/// `[emulator]` body for the recording backend (commands are never run).
pub const RECORDING_EMULATOR: &str = "command = [\"unused\"]\ninstall_command = [\"unused\"]";
