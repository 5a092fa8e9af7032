// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use envlinkfs::proc::ProcFs;
use envlinkfs::{Config, EnvLinkFs, EnvironmentCache, Session, Settings};
use envlinkfs_cli_common as cli;
use fuser::MountOption;
use nix::unistd::{Gid, Uid};
use tokio::signal::unix::{signal, SignalKind};

#[cfg(test)]
#[path = "./cmd_mount_test.rs"]
mod cmd_mount_test;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}
fn main2() -> i32 {
    let mut opt = CmdMount::parse();
    if opt.debug {
        opt.foreground = true;
        opt.logging.verbose = opt.logging.verbose.max(3);
    }
    // stderr goes to /dev/null once the process moves into the background
    opt.logging.syslog = !opt.foreground;
    if let Err(err) = opt.logging.configure() {
        eprintln!("{err:?}");
        return 1;
    }

    let settings = match envlinkfs::load_settings() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(settings) => settings,
    };
    let result = opt.run(&settings);

    cli::handle_result!(result)
}

/// Mount a filesystem that shows every process the paths
/// held in its own environment variables as symbolic links
#[derive(Debug, Parser)]
#[clap(name = "envlinkfs")]
pub struct CmdMount {
    #[clap(flatten)]
    logging: cli::Logging,

    /// Do not daemonize the filesystem, run it in the foreground instead
    #[clap(long, short)]
    foreground: bool,

    /// Enable debug output, implies --foreground
    #[clap(long, short)]
    debug: bool,

    /// Handle every request on the session thread
    ///
    /// By default each request is handled on its own worker so that
    /// one process whose information is slow to read does not hold
    /// up the requests of any other.
    #[clap(long, short)]
    single_thread: bool,

    /// Options for the mount in the form opt1,opt2=value
    ///
    /// In addition to all existing fuse mount options, the following custom
    /// options are also supported:
    ///
    ///  uid    - the user id that should own all entries in the mount, defaults
    ///           to the effective user id of the caller
    ///  gid    - the group id that should own all entries in the mount, defaults
    ///           to the effective group id of the caller
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// The name of the filesystem, as shown in the mount table
    #[clap(name = "FSNAME")]
    fsname: String,

    /// The location where to mount the filesystem
    #[clap(name = "MOUNTPOINT")]
    mountpoint: std::path::PathBuf,
}

impl CmdMount {
    pub fn run(&mut self, settings: &Settings) -> Result<i32> {
        let opts = mount_config(
            &self.fsname,
            &self.options,
            settings,
            nix::unistd::geteuid(),
            nix::unistd::getegid(),
        )?;
        tracing::debug!("FUSE Config: {opts:#?}");

        let mountpoint = self
            .mountpoint
            .canonicalize()
            .context("Invalid mount point")?;

        let proc = ProcFs::new(&settings.filesystem.proc_root);
        let cache = Arc::new(EnvironmentCache::new(proc));
        let fs = EnvLinkFs::new(Arc::clone(&cache));

        tracing::debug!("Establishing fuse session...");
        let mount_opts = opts.mount_options.iter().cloned().collect::<Vec<_>>();
        let mut session = fuser::Session::new(
            Session::new(fs, opts).threaded(!self.single_thread),
            &mountpoint,
            &mount_opts,
        )
        .context("Failed to create a FUSE session")?;
        let mut unmounter = session.unmount_callable();

        if !self.foreground {
            tracing::debug!("Moving into background...");
            // We cannot daemonize until the session is established above,
            // otherwise initial use of the filesystem may not show any mount
            // at all.
            nix::unistd::daemon(false, false).context("Failed to move into background")?;
        }

        // the runtime threads would not survive the fork above
        let mut builder = if self.single_thread {
            tokio::runtime::Builder::new_current_thread()
        } else {
            tokio::runtime::Builder::new_multi_thread()
        };
        let rt = builder
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        if let Some(interval) = settings.filesystem.prune_interval() {
            rt.spawn(prune_periodically(cache, interval));
        }

        let result = rt.block_on(async move {
            let mut interrupt = signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate = signal(SignalKind::terminate()).context("terminate signal handler")?;

            tracing::info!(mountpoint = %mountpoint.display(), "Starting FUSE filesystem");
            let mut fut = tokio::task::spawn_blocking(move || session.run());
            let received = tokio::select! {
                res = &mut fut => {
                    tracing::info!("Filesystem shutting down");
                    return res.context("FUSE session panicked")?.context("FUSE session failed");
                }
                // we explicitly catch any signal related to interruption
                // and will act by unmounting the filesystem early
                _ = terminate.recv() => "Terminate",
                _ = interrupt.recv() => "Interrupt",
                _ = quit.recv() => "Quit",
            };
            tracing::info!("{received} signal received, filesystem shutting down");
            unmounter.unmount().context("Failed to unmount the filesystem")?;
            fut.await
                .context("FUSE session panicked")?
                .context("FUSE session failed")
        });

        // we generally expect at this point that the command is complete
        // and nothing else should be executing, but the pruning task and any
        // handlers stuck on a slow read would otherwise block forever
        // when the runtime is dropped.
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result?;
        Ok(0)
    }
}

/// Drop the environments of processes that have exited, so that
/// the cache does not grow with every process that ever looked
async fn prune_periodically(cache: Arc<EnvironmentCache>, interval: std::time::Duration) {
    let mut ticks = tokio::time::interval(interval);
    // the first tick completes immediately
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let cache = Arc::clone(&cache);
        match tokio::task::spawn_blocking(move || cache.prune()).await {
            Ok(0) => {}
            Ok(count) => tracing::debug!("pruned {count} exited processes from the cache"),
            Err(err) => tracing::warn!("cache pruning failed: {err}"),
        }
    }
}

/// Build the filesystem configuration from the command line.
///
/// The mount is always read-only, without devices or setuid, and
/// named by `fsname` regardless of any fsname given in the options.
fn mount_config(
    fsname: &str,
    args: &[String],
    settings: &Settings,
    uid: Uid,
    gid: Gid,
) -> Result<Config> {
    let required_opts = vec![MountOption::RO, MountOption::NoDev, MountOption::NoSuid];
    let mut opts = Config {
        root_mode: settings.filesystem.root_mode,
        link_mode: settings.filesystem.link_mode,
        uid,
        gid,
        mount_options: required_opts.into_iter().collect(),
    };

    for option in parse_options_from_args(args) {
        match option {
            MountOption::RW => bail!("rw mode is not supported, the filesystem is read-only"),
            MountOption::FSName(name) => {
                tracing::warn!("ignoring fsname={name}, the filesystem is named {fsname}");
            }
            MountOption::CUSTOM(opt) => match opt.split_once('=') {
                Some(("uid", num)) => {
                    opts.uid = num.parse::<u32>().map(Uid::from_raw).map_err(|err| {
                        anyhow!("Invalid parameter value for uid={num}: {err}")
                    })?
                }
                Some(("gid", num)) => {
                    opts.gid = num.parse::<u32>().map(Gid::from_raw).map_err(|err| {
                        anyhow!("Invalid parameter value for gid={num}: {err}")
                    })?
                }
                _ => {
                    opts.mount_options.insert(MountOption::CUSTOM(opt.clone()));
                }
            },
            _ => {
                opts.mount_options.insert(option);
            }
        }
    }
    opts.mount_options
        .insert(MountOption::FSName(fsname.to_string()));
    Ok(opts)
}

/// Copies from the private [`fuser::MountOption::from_str`]
fn parse_options_from_args(args: &[String]) -> Vec<MountOption> {
    args.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "auto_unmount" => MountOption::AutoUnmount,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "default_permissions" => MountOption::DefaultPermissions,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            "dirsync" => MountOption::DirSync,
            "sync" => MountOption::Sync,
            "async" => MountOption::Async,
            x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
            x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
            x => MountOption::CUSTOM(x.into()),
        })
        .collect()
}
