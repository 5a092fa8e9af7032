// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigBase, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};

use crate::proc::PROC_DIR;
use crate::Result;

#[cfg(test)]
#[path = "./settings_test.rs"]
mod settings_test;

static SYSTEM_CONFIG: &str = "/etc/envlinkfs.conf";
static ENV_PREFIX: &str = "ENVLINKFS";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Filesystem {
    /// Where the process information pseudo-filesystem is mounted
    pub proc_root: PathBuf,
    /// Permission bits of the root directory
    #[serde(deserialize_with = "deserialize_mode")]
    pub root_mode: u32,
    /// Permission bits reported for every link
    #[serde(deserialize_with = "deserialize_mode")]
    pub link_mode: u32,
    /// How often to forget the environments of exited
    /// processes, zero to only do so when they are accessed
    pub prune_interval_secs: u64,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_DIR),
            root_mode: 0o555,
            link_mode: 0o444,
            prune_interval_secs: 60,
        }
    }
}

impl Filesystem {
    pub fn prune_interval(&self) -> Option<Duration> {
        match self.prune_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub filesystem: Filesystem,
}

impl Settings {
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        let settings = ConfigBase::builder()
            .add_source(File::from_str(conf.as_ref(), FileFormat::Ini))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Load settings from the given config files, in order of
    /// increasing priority, and then the environment.
    ///
    /// Missing files are skipped.
    pub fn load_layers<P: AsRef<Path>>(files: &[P]) -> Result<Self> {
        let mut builder = ConfigBase::builder();
        for file in files {
            builder = builder.add_source(
                File::from(file.as_ref())
                    .format(FileFormat::Ini)
                    .required(false),
            );
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

/// Load the settings from the system and user config files,
/// overridden by any `ENVLINKFS_<SECTION>__<KEY>` variables
pub fn load_settings() -> Result<Settings> {
    let mut files = vec![PathBuf::from(SYSTEM_CONFIG)];
    if let Some(dir) = dirs::config_dir() {
        files.push(dir.join("envlinkfs").join("envlinkfs.conf"));
    }
    Settings::load_layers(&files)
}

/// Accepts permission bits as a number or as an octal string like "0555"
fn deserialize_mode<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Mode {
        Number(u32),
        Text(String),
    }

    match Mode::deserialize(deserializer)? {
        Mode::Number(mode) => Ok(mode),
        Mode::Text(text) => {
            let text = text.trim();
            let parsed = match text.strip_prefix("0o").or_else(|| text.strip_prefix('0')) {
                Some("") => Ok(0),
                Some(octal) => u32::from_str_radix(octal, 8),
                None => text.parse(),
            };
            parsed.map_err(|err| serde::de::Error::custom(format!("invalid mode {text:?}: {err}")))
        }
    }
}
