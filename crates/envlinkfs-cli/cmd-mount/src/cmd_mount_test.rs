// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use clap::Parser;
use envlinkfs::Settings;
use fuser::MountOption;
use nix::unistd::{Gid, Uid};
use rstest::rstest;

use super::{mount_config, parse_options_from_args, CmdMount};

fn args(opts: &[&str]) -> Vec<String> {
    opts.iter().map(|s| s.to_string()).collect()
}

fn config_for(opts: &[&str]) -> anyhow::Result<envlinkfs::Config> {
    mount_config(
        "envfs",
        &args(opts),
        &Settings::default(),
        Uid::from_raw(1000),
        Gid::from_raw(100),
    )
}

#[rstest]
fn test_parse_options() {
    let parsed = parse_options_from_args(&args(&[
        "allow_other",
        "auto_unmount",
        "subtype=env",
        "fsname=other",
        "max_read=4096",
        "",
    ]));
    assert_eq!(
        parsed,
        vec![
            MountOption::AllowOther,
            MountOption::AutoUnmount,
            MountOption::Subtype("env".into()),
            MountOption::FSName("other".into()),
            MountOption::CUSTOM("max_read=4096".into()),
        ]
    );
}

#[rstest]
fn test_mount_config_required_options() {
    let opts = config_for(&[]).unwrap();
    for required in [
        MountOption::RO,
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::FSName("envfs".into()),
    ] {
        assert!(opts.mount_options.contains(&required), "{required:?}");
    }
    assert_eq!(opts.uid, Uid::from_raw(1000));
    assert_eq!(opts.gid, Gid::from_raw(100));
    assert_eq!(opts.root_mode, 0o555);
    assert_eq!(opts.link_mode, 0o444);
}

#[rstest]
fn test_mount_config_rejects_rw() {
    config_for(&["allow_other", "rw"]).expect_err("rw must be rejected");
}

#[rstest]
fn test_mount_config_owner_override() {
    let opts = config_for(&["uid=0", "gid=5"]).unwrap();
    assert_eq!(opts.uid, Uid::from_raw(0));
    assert_eq!(opts.gid, Gid::from_raw(5));
    assert!(
        !opts
            .mount_options
            .iter()
            .any(|o| matches!(o, MountOption::CUSTOM(_))),
        "owner options are not passed on to the mount"
    );
}

#[rstest]
#[case("uid=abc")]
#[case("gid=-1")]
fn test_mount_config_invalid_owner(#[case] opt: &str) {
    config_for(&[opt]).expect_err("owner must be a number");
}

#[rstest]
fn test_mount_config_positional_fsname_wins() {
    let opts = config_for(&["fsname=other"]).unwrap();
    let names: Vec<_> = opts
        .mount_options
        .iter()
        .filter_map(|o| match o {
            MountOption::FSName(name) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["envfs"]);
}

#[rstest]
fn test_mount_config_forwards_unknown_options() {
    let opts = config_for(&["allow_other", "max_read=4096"]).unwrap();
    assert!(opts.mount_options.contains(&MountOption::AllowOther));
    assert!(
        opts.mount_options
            .contains(&MountOption::CUSTOM("max_read=4096".into()))
    );
}

#[rstest]
fn test_command_line() {
    let opt = CmdMount::try_parse_from([
        "envlinkfs",
        "-d",
        "-s",
        "-o",
        "allow_other,uid=0",
        "envfs",
        "/mnt/env",
    ])
    .expect("valid command line");
    assert!(opt.debug);
    assert!(opt.single_thread);
    assert!(!opt.foreground, "debug implies foreground only once running");
    assert_eq!(opt.options, args(&["allow_other", "uid=0"]));
    assert_eq!(opt.fsname, "envfs");
    assert_eq!(opt.mountpoint, std::path::Path::new("/mnt/env"));
}

#[rstest]
fn test_command_line_requires_mountpoint() {
    CmdMount::try_parse_from(["envlinkfs", "envfs"]).expect_err("mountpoint is required");
}
