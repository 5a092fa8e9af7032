// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The path-level view of the filesystem for a single caller

use std::sync::Arc;

use crate::cache::EnvironmentCache;
use crate::environ::ProcessEnvironment;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./filesystem_test.rs"]
mod filesystem_test;

/// The two shapes of path that exist in this filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsPath<'a> {
    Root,
    Var(&'a str),
}

impl<'a> FsPath<'a> {
    /// Split a request path into its shape.
    ///
    /// Anything that is not the root must be exactly one
    /// component below it.
    pub fn parse(path: &'a str) -> Result<Self> {
        match path.strip_prefix('/') {
            Some("") => Ok(Self::Root),
            Some(name) if is_entry_name(name) => Ok(Self::Var(name)),
            _ => Err(Error::NotFound(path.to_owned())),
        }
    }
}

/// True if the name can appear as a single directory entry
pub fn is_entry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// What a path refers to, as seen by one caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Root,
    Link { name: String, target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    fn dir(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: EntryKind::Directory,
        }
    }

    fn link(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: EntryKind::Symlink,
        }
    }
}

/// Whether a link target can be found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Exists,
    /// Known not to exist, the link is hidden from listings
    Absent,
    /// Could not be checked, but may exist
    Indeterminate,
}

impl TargetState {
    pub fn probe(target: &str) -> Self {
        match std::fs::symlink_metadata(target) {
            Ok(_) => Self::Exists,
            Err(err) => match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENAMETOOLONG) => Self::Absent,
                _ => Self::Indeterminate,
            },
        }
    }

    pub fn is_listed(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Answers filesystem requests from the environments
/// of the processes that make them.
#[derive(Clone)]
pub struct EnvLinkFs {
    cache: Arc<EnvironmentCache>,
}

impl EnvLinkFs {
    pub fn new(cache: Arc<EnvironmentCache>) -> Self {
        Self { cache }
    }

    /// Describe the node at `path`.
    ///
    /// Links are reported whether or not their target exists.
    pub fn getattr(&self, pid: u32, path: &str) -> Result<Node> {
        let name = match FsPath::parse(path)? {
            FsPath::Root => return Ok(Node::Root),
            FsPath::Var(name) => name,
        };
        let env = self.cache.get(pid);
        match env.get(name) {
            Some(target) => Ok(Node::Link {
                name: name.to_owned(),
                target: target.to_owned(),
            }),
            None => Err(Error::NotFound(path.to_owned())),
        }
    }

    /// List the entries of the directory at `path`.
    ///
    /// The listing is computed lazily from the caller's current
    /// environment and hides variables whose value does not exist.
    pub fn readdir(&self, pid: u32, path: &str) -> Result<ReadDir> {
        match FsPath::parse(path)? {
            FsPath::Root => Ok(ReadDir::new(self.cache.get(pid))),
            FsPath::Var(_) => Err(Error::NotFound(path.to_owned())),
        }
    }

    /// The target of the link at `path`.
    pub fn readlink(&self, pid: u32, path: &str) -> Result<String> {
        match self.getattr(pid, path)? {
            Node::Link { target, .. } => Ok(target),
            Node::Root => Err(Error::NotFound(path.to_owned())),
        }
    }
}

/// The entries of the root directory for one caller.
pub struct ReadDir {
    env: Arc<ProcessEnvironment>,
    position: usize,
}

impl ReadDir {
    fn new(env: Arc<ProcessEnvironment>) -> Self {
        Self { env, position: 0 }
    }
}

impl Iterator for ReadDir {
    type Item = DirEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let position = self.position;
            self.position += 1;
            let (name, target) = match position {
                0 => return Some(DirEntry::dir(".")),
                1 => return Some(DirEntry::dir("..")),
                n => self.env.get_index(n - 2)?,
            };
            if !is_entry_name(name) {
                continue;
            }
            if TargetState::probe(target).is_listed() {
                return Some(DirEntry::link(name));
            }
        }
    }
}
