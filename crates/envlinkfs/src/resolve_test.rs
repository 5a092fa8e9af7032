// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use rstest::rstest;

use super::{parent_if_just_forked, ForkedChildHeuristic, PidResolver};
use crate::fixtures::*;
use crate::proc::ProcStatus;

#[rstest]
#[case(1, 0, Some(50))]
#[case(1, 1, Some(50))]
#[case(0, 0, None)]
#[case(1, 2, None)]
#[case(2, 0, None)]
#[case(2, 1, None)]
#[case(150, 12, None)]
fn test_fork_signature(
    #[case] voluntary: u64,
    #[case] nonvoluntary: u64,
    #[case] expected: Option<u32>,
) {
    let status = ProcStatus {
        voluntary_ctxt_switches: Some(voluntary),
        nonvoluntary_ctxt_switches: Some(nonvoluntary),
        ppid: Some(50),
    };
    assert_eq!(parent_if_just_forked(&status), expected);
}

#[rstest]
#[case::no_voluntary(ProcStatus { voluntary_ctxt_switches: None, nonvoluntary_ctxt_switches: Some(0), ppid: Some(50) })]
#[case::no_nonvoluntary(ProcStatus { voluntary_ctxt_switches: Some(1), nonvoluntary_ctxt_switches: None, ppid: Some(50) })]
#[case::no_parent(ProcStatus { voluntary_ctxt_switches: Some(1), nonvoluntary_ctxt_switches: Some(0), ppid: None })]
#[case::parent_zero(ProcStatus { voluntary_ctxt_switches: Some(1), nonvoluntary_ctxt_switches: Some(0), ppid: Some(0) })]
fn test_fork_signature_missing_fields(#[case] status: ProcStatus) {
    assert_eq!(parent_if_just_forked(&status), None);
}

#[rstest]
fn test_resolve_fresh_fork_uses_parent(fake_proc: FakeProc) {
    fake_proc.write_status(301, &status_text(1, 0, 300));
    let resolver = ForkedChildHeuristic::new(fake_proc.proc());
    assert_eq!(resolver.resolve(301), 300);
}

#[rstest]
fn test_resolve_busy_process_is_unchanged(fake_proc: FakeProc) {
    fake_proc.write_status(301, &status_text(40, 7, 300));
    let resolver = ForkedChildHeuristic::new(fake_proc.proc());
    assert_eq!(resolver.resolve(301), 301);
}

#[rstest]
fn test_resolve_unreadable_status_is_unchanged(fake_proc: FakeProc) {
    let resolver = ForkedChildHeuristic::new(fake_proc.proc());
    assert_eq!(resolver.resolve(999), 999);
}

#[rstest]
fn test_resolve_incomplete_status_is_unchanged(fake_proc: FakeProc) {
    fake_proc.write_status(302, "Name:\tsh\nvoluntary_ctxt_switches:\t1\n");
    let resolver = ForkedChildHeuristic::new(fake_proc.proc());
    assert_eq!(resolver.resolve(302), 302);
}

#[rstest]
fn test_closures_are_resolvers() {
    let resolver = |pid: u32| pid + 1;
    assert_eq!(PidResolver::resolve(&resolver, 1), 2);
}
