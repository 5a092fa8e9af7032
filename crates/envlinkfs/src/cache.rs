// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Memoized process environments

use std::sync::Arc;

use dashmap::DashMap;

use crate::environ::{read_environment, ProcessEnvironment};
use crate::proc::{ChangeStamp, ProcFs};
use crate::resolve::{ForkedChildHeuristic, PidResolver};

#[cfg(test)]
#[path = "./cache_test.rs"]
mod cache_test;

struct CacheEntry {
    stamp: ChangeStamp,
    env: Arc<ProcessEnvironment>,
}

/// Remembers the environment of each process that has made
/// a request, until that process's environment file changes.
///
/// Entries are keyed by the resolved pid, so two children that
/// both resolve to the same parent share that parent's entry.
pub struct EnvironmentCache {
    proc: ProcFs,
    resolver: Arc<dyn PidResolver>,
    entries: DashMap<u32, CacheEntry>,
}

impl EnvironmentCache {
    /// A cache over the given procfs, using the fork heuristic
    /// to pick the process to read from.
    pub fn new(proc: ProcFs) -> Self {
        let resolver = Arc::new(ForkedChildHeuristic::new(proc.clone()));
        Self::with_resolver(proc, resolver)
    }

    pub fn with_resolver(proc: ProcFs, resolver: Arc<dyn PidResolver>) -> Self {
        Self {
            proc,
            resolver,
            entries: DashMap::new(),
        }
    }

    /// The environment that should be served to the given caller.
    pub fn get(&self, pid: u32) -> Arc<ProcessEnvironment> {
        let pid = self.resolver.resolve(pid);
        let stamp = match self.proc.environ_stamp(pid) {
            Ok(Some(stamp)) => stamp,
            Ok(None) => {
                if self.entries.remove(&pid).is_some() {
                    tracing::debug!(%pid, "process is gone, dropped cached environment");
                }
                return Default::default();
            }
            Err(err) => {
                tracing::debug!(%pid, "cannot observe environment: {err}");
                return Default::default();
            }
        };

        if let Some(entry) = self.entries.get(&pid) {
            if entry.stamp == stamp {
                return Arc::clone(&entry.env);
            }
        }

        // the read happens outside of any map lock so that a slow
        // process only delays its own callers
        tracing::trace!(%pid, "reading environment");
        let env = Arc::new(read_environment(&self.proc, pid));
        self.entries.insert(
            pid,
            CacheEntry {
                stamp,
                env: Arc::clone(&env),
            },
        );
        env
    }

    /// Drop the entries of all processes that no longer exist.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        // procfs is only checked once no shard lock is held
        let candidates: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.stamp))
            .collect();
        let mut removed = 0;
        for (pid, stamp) in candidates {
            if !matches!(self.proc.environ_stamp(pid), Ok(None)) {
                continue;
            }
            // an entry refreshed in the meantime belongs to a live process
            if self
                .entries
                .remove_if(&pid, |_, entry| entry.stamp == stamp)
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(%removed, "pruned environments of exited processes");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
