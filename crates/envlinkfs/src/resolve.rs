// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Deciding which process's environment answers a request

use crate::proc::{ProcFs, ProcStatus};

#[cfg(test)]
#[path = "./resolve_test.rs"]
mod resolve_test;

/// Maps the pid reported by the kernel for a request onto the
/// pid whose environment should be served for it.
pub trait PidResolver: Send + Sync {
    fn resolve(&self, pid: u32) -> u32;
}

impl<F> PidResolver for F
where
    F: Fn(u32) -> u32 + Send + Sync,
{
    fn resolve(&self, pid: u32) -> u32 {
        self(pid)
    }
}

/// Serves the parent's environment to processes that appear to
/// have only just forked.
///
/// Reading the environ file of a process that has forked but
/// not yet gotten past its own environment setup can block
/// indefinitely. Such a process has usually been scheduled off
/// exactly once, voluntarily, and preempted at most once. The
/// parent's environment is the closest thing to what the child
/// will eventually have, though this is not always true and the
/// signature itself can match processes that are not fresh forks.
#[derive(Debug, Clone, Default)]
pub struct ForkedChildHeuristic {
    proc: ProcFs,
}

impl ForkedChildHeuristic {
    pub fn new(proc: ProcFs) -> Self {
        Self { proc }
    }
}

impl PidResolver for ForkedChildHeuristic {
    fn resolve(&self, pid: u32) -> u32 {
        let status = match self.proc.read_status(pid) {
            Ok(status) => status,
            Err(err) => {
                tracing::trace!(%pid, "no status for process: {err}");
                return pid;
            }
        };
        match parent_if_just_forked(&status) {
            Some(parent) => {
                tracing::debug!(%pid, %parent, "process looks freshly forked, using parent");
                parent
            }
            None => pid,
        }
    }
}

/// The parent pid, if the status matches the signature of a
/// process that has just forked.
pub fn parent_if_just_forked(status: &ProcStatus) -> Option<u32> {
    let voluntary = status.voluntary_ctxt_switches?;
    let nonvoluntary = status.nonvoluntary_ctxt_switches?;
    if voluntary != 1 || nonvoluntary > 1 {
        return None;
    }
    // pid 0 is not a process that could have an environment
    status.ppid.filter(|ppid| *ppid != 0)
}
