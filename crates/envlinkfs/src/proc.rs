// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Access to the per-process files of a linux-style procfs

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./proc_test.rs"]
mod proc_test;

pub const PROC_DIR: &str = "/proc";

/// Marks one generation of a process environment file.
///
/// Two stamps compare equal only if the file was not replaced
/// in between the two observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeStamp(SystemTime);

impl ChangeStamp {
    pub fn new(modified: SystemTime) -> Self {
        Self(modified)
    }
}

/// The fields of a process status record that are used
/// to decide which process environment to serve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub voluntary_ctxt_switches: Option<u64>,
    pub nonvoluntary_ctxt_switches: Option<u64>,
    pub ppid: Option<u32>,
}

impl ProcStatus {
    /// Parse the text of a status record.
    ///
    /// Each line is expected to be in the form `Key:<whitespace>value`.
    /// Lines that do not look like this, and fields that are not needed
    /// or do not parse as numbers, are ignored and left empty.
    pub fn parse(content: &str) -> Self {
        let mut status = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "voluntary_ctxt_switches" => status.voluntary_ctxt_switches = value.parse().ok(),
                "nonvoluntary_ctxt_switches" => {
                    status.nonvoluntary_ctxt_switches = value.parse().ok()
                }
                "PPid" => status.ppid = value.parse().ok(),
                _ => {}
            }
        }
        status
    }
}

/// A procfs mount, usually found at `/proc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(PROC_DIR)
    }
}

impl ProcFs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("status")
    }

    pub fn environ_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("environ")
    }

    /// Read and parse the status record of a process.
    pub fn read_status(&self, pid: u32) -> Result<ProcStatus> {
        let path = self.status_path(pid);
        let content =
            std::fs::read_to_string(&path).map_err(|err| Error::proc_read(path, err))?;
        Ok(ProcStatus::parse(&content))
    }

    /// Read the raw environment block of a process.
    pub fn read_environ(&self, pid: u32) -> Result<Vec<u8>> {
        let path = self.environ_path(pid);
        std::fs::read(&path).map_err(|err| Error::proc_read(path, err))
    }

    /// Observe the current generation of a process environment file.
    ///
    /// Returns `Ok(None)` when the file does not exist, which
    /// usually means that the process has exited.
    pub fn environ_stamp(&self, pid: u32) -> Result<Option<ChangeStamp>> {
        let path = self.environ_path(pid);
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                return match err.raw_os_error() {
                    Some(libc::ENOENT) | Some(libc::ENOTDIR) | Some(libc::ESRCH) => Ok(None),
                    _ => Err(Error::proc_read(path, err)),
                };
            }
        };
        let modified = meta
            .modified()
            .map_err(|err| Error::proc_read(path, err))?;
        Ok(Some(ChangeStamp::new(modified)))
    }
}
