// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Shared test fixtures, mostly a fake procfs tree on disk

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use rstest::fixture;
use tempfile::TempDir;

use crate::proc::ProcFs;

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new("envlinkfs=trace"))
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

/// A directory laid out like `/proc`, but only containing
/// the processes and files that a test creates
pub struct FakeProc {
    tmpdir: TempDir,
}

#[fixture]
pub fn fake_proc() -> FakeProc {
    init_logging();
    FakeProc {
        tmpdir: tempfile::Builder::new()
            .prefix("envlinkfs-proc-")
            .tempdir()
            .expect("failed to create fake procfs dir"),
    }
}

/// A status record in the same shape as the kernel writes them
pub fn status_text(voluntary: u64, nonvoluntary: u64, ppid: u32) -> String {
    format!(
        "Name:\tbash\nState:\tS (sleeping)\nTgid:\t4242\nPid:\t4242\nPPid:\t{ppid}\n\
         TracerPid:\t0\nvoluntary_ctxt_switches:\t{voluntary}\n\
         nonvoluntary_ctxt_switches:\t{nonvoluntary}\n"
    )
}

/// Build an environment block from name/value pairs
pub fn environ_block(vars: &[(&str, &str)]) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in vars {
        block.extend_from_slice(name.as_bytes());
        block.push(b'=');
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }
    block
}

impl FakeProc {
    pub fn proc(&self) -> ProcFs {
        ProcFs::new(self.tmpdir.path())
    }

    pub fn path(&self) -> PathBuf {
        self.tmpdir.path().to_owned()
    }

    fn process_dir(&self, pid: u32) -> PathBuf {
        let dir = self.tmpdir.path().join(pid.to_string());
        std::fs::create_dir_all(&dir).expect("failed to create fake process dir");
        dir
    }

    pub fn write_status(&self, pid: u32, content: &str) {
        std::fs::write(self.process_dir(pid).join("status"), content)
            .expect("failed to write fake status");
    }

    /// Write the environment of a process, stamping it with `generation`
    /// seconds past the epoch so that tests control change detection.
    pub fn write_environ(&self, pid: u32, block: &[u8], generation: u64) {
        let path = self.process_dir(pid).join("environ");
        std::fs::write(&path, block).expect("failed to write fake environ");
        let file = std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("failed to reopen fake environ");
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(generation))
            .expect("failed to set fake environ mtime");
    }

    pub fn remove_process(&self, pid: u32) {
        std::fs::remove_dir_all(self.tmpdir.path().join(pid.to_string()))
            .expect("failed to remove fake process dir");
    }
}
