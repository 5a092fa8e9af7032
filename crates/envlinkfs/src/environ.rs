// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Parsing of process environment blocks

use indexmap::IndexMap;

use crate::proc::ProcFs;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./environ_test.rs"]
mod environ_test;

/// The environment variables of one process at one point in time.
///
/// Variables keep the order in which they appear in the
/// environment block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnvironment {
    vars: IndexMap<String, String>,
}

impl ProcessEnvironment {
    /// Parse a raw, NUL-separated environment block.
    ///
    /// Empty records are skipped, as are records without any `=`
    /// since they do not name a variable. The whole block must be
    /// valid utf-8, otherwise nothing can be trusted about it.
    pub fn parse(pid: u32, block: &[u8]) -> Result<Self> {
        let mut vars = IndexMap::new();
        for record in block.split(|b| *b == 0).filter(|r| !r.is_empty()) {
            let record = std::str::from_utf8(record)
                .map_err(|source| Error::MalformedEnvironment { pid, source })?;
            let Some((name, value)) = record.split_once('=') else {
                tracing::trace!(%pid, "skipping environment record without '='");
                continue;
            };
            vars.insert(name.to_owned(), value.to_owned());
        }
        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// The variable at the given position in the original order
    pub fn get_index(&self, index: usize) -> Option<(&str, &str)> {
        self.vars
            .get_index(index)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over all variables in their original order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Read the environment of a process.
///
/// A process whose environment cannot be read or understood
/// simply has no variables.
pub fn read_environment(proc: &ProcFs, pid: u32) -> ProcessEnvironment {
    let block = match proc.read_environ(pid) {
        Ok(block) => block,
        Err(err) => {
            tracing::debug!(%pid, "environment unavailable: {err}");
            return ProcessEnvironment::default();
        }
    };
    match ProcessEnvironment::parse(pid, &block) {
        Ok(env) => env,
        Err(err) => {
            tracing::warn!(%pid, "{err}");
            ProcessEnvironment::default()
        }
    }
}
