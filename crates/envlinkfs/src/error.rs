// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// A result whose error is [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors specific to envlinkfs operations.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// The requested path does not name anything in the caller's view.
    #[error("No such entry: {0}")]
    #[diagnostic(code(envlinkfs::not_found))]
    NotFound(String),

    /// A file in the process information source could not be read.
    #[error("Failed to read {path:?}")]
    #[diagnostic(code(envlinkfs::proc_read))]
    ProcRead {
        /// The file that failed to read
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// An environment block contained bytes that are not valid utf-8.
    #[error("Environment block of process {pid} is not valid utf-8")]
    #[diagnostic(
        code(envlinkfs::malformed_environment),
        help("variables of this process will not be exposed")
    )]
    MalformedEnvironment {
        /// The process whose environment was being read
        pid: u32,
        /// The decoding failure
        #[source]
        source: std::str::Utf8Error,
    },

    /// The layered configuration could not be loaded.
    #[error("Failed to load configuration")]
    #[diagnostic(code(envlinkfs::config))]
    Config(#[from] config::ConfigError),

    /// A request that cannot be served by this filesystem.
    #[error("{0}: errno {1}")]
    #[diagnostic(code(envlinkfs::errno))]
    Errno(String, i32),
}

impl Error {
    /// Wrap an io error with the path that produced it.
    pub fn proc_read<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::ProcRead {
            path: path.into(),
            source,
        }
    }

    /// The errno that best describes this error, if any.
    ///
    /// Used when replying to the kernel, which only understands errnos.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::NotFound(_) => Some(libc::ENOENT),
            Self::ProcRead { source, .. } => source.raw_os_error(),
            Self::MalformedEnvironment { .. } => Some(libc::EIO),
            Self::Errno(_, errno) => Some(*errno),
            Self::Config(_) => None,
        }
    }
}
