// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! A FUSE filesystem that shows the environment of the calling
//! process as symbolic links.
//!
//! Every variable whose value is a path on disk appears in the root
//! of the mount as a link named after the variable. Because the kernel
//! reports which process makes each request, every process sees
//! its own variables through the same mount.

mod error;
pub use error::{Error, Result};

pub mod cache;
pub mod environ;
pub mod filesystem;
#[cfg(test)]
mod fixtures;
#[cfg(unix)]
mod fuse;
pub mod proc;
pub mod resolve;
pub mod settings;

pub use cache::EnvironmentCache;
pub use environ::ProcessEnvironment;
pub use filesystem::EnvLinkFs;
#[cfg(unix)]
pub use fuse::{Config, Session};
pub use settings::{load_settings, Settings};
