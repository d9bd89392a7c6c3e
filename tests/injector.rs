use std::path::Path;

use nix::unistd::Pid;
use test_log::test;

use dylib_injector::injector::staging::STACK_SIZE;
use dylib_injector::injector::trampoline::LOADER_MODE;
use dylib_injector::registers::{Architecture, RegisterSnapshot};
use dylib_injector::task::{FaultReply, ProcessArchitecture, RemoteAddress};
use dylib_injector::{Error, FailureKind, Injector, LoaderHandle};

use crate::common::fake_task::{
    Call, FakeControl, Script, ScriptedFault, LOADER_OPEN, REGION_STRIDE, SENTINEL, THREAD_SETUP,
};

mod common;

const TARGET: Pid = Pid::from_raw(4242);
const PAYLOAD: &str = "/abs/path/lib.so";
const PATH_REGION: RemoteAddress = RemoteAddress(REGION_STRIDE);
const STACK_REGION: RemoteAddress = RemoteAddress(REGION_STRIDE * 2);

fn injector(script: Script, arch: Architecture) -> (Injector<FakeControl>, FakeControl) {
    let control = FakeControl::new(script);
    (Injector::with_architecture(control.clone(), arch), control)
}

/// Every allocated region is released exactly once, and nothing else is released.
fn assert_balanced_cleanup(control: &FakeControl) {
    let (mut allocated, mut released) = control.allocations();
    allocated.sort();
    released.sort();
    assert_eq!(allocated, released);
    assert_eq!(
        control.count(|call| *call == Call::CreateThread),
        control.count(|call| *call == Call::Terminate)
    );
    assert_eq!(control.calls().last(), Some(&Call::ReleaseTask));
}

#[test]
fn clean_injection_returns_loader_handle() {
    let (injector, control) = injector(Script::clean(0x1000), Architecture::X86_64);

    let handle = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap();

    assert_eq!(handle, LoaderHandle(0x1000));
    assert_eq!(control.count(|call| matches!(call, Call::Deallocate(..))), 2);
    assert_eq!(control.count(|call| *call == Call::ReceiveFault), 2);
    assert_eq!(control.count(|call| *call == Call::ReleaseFaultChannel), 1);
    assert_balanced_cleanup(&control);
}

#[test]
fn staged_memory_layout() {
    let (injector, control) = injector(Script::clean(0x1000), Architecture::X86_64);
    injector.inject(TARGET, Path::new(PAYLOAD)).unwrap();

    let calls = control.calls();
    assert!(calls.contains(&Call::Write(PATH_REGION, b"/abs/path/lib.so\0".to_vec())));

    let trailer: Vec<u8> = [SENTINEL.0, 0u64]
        .iter()
        .flat_map(|word| word.to_ne_bytes())
        .collect();
    assert!(calls.contains(&Call::Write(
        STACK_REGION.offset(STACK_SIZE as u64),
        trailer
    )));
    assert!(calls.contains(&Call::Deallocate(STACK_REGION, STACK_SIZE + 16)));
    assert!(calls.contains(&Call::Deallocate(PATH_REGION, PAYLOAD.len() + 1)));
}

#[test]
fn thread_starts_in_setup_routine() {
    let (injector, control) = injector(Script::clean(0x1000), Architecture::X86_64);
    injector.inject(TARGET, Path::new(PAYLOAD)).unwrap();

    let initial = control
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::SetRegisters(RegisterSnapshot::X86_64(regs)) => Some(regs),
            _ => None,
        })
        .unwrap();
    assert_eq!(initial.rip, THREAD_SETUP.0);
    assert_eq!(initial.rdi, STACK_REGION.0);
    assert_eq!(initial.rbx, PATH_REGION.0);
    assert_eq!(initial.rsp, STACK_REGION.0 + STACK_SIZE as u64);

    let set = control.position(|call| matches!(call, Call::SetRegisters(_)));
    let install = control.position(|call| *call == Call::InstallFaultChannel);
    let resume = control.position(|call| *call == Call::Resume);
    assert!(set < install && install < resume);
}

#[test]
fn rendezvous_dispatches_loader_with_staged_path() {
    for arch in [Architecture::X86_64, Architecture::Arm64] {
        let (injector, control) = injector(Script::clean(0x1000), arch);
        assert_eq!(
            injector.inject(TARGET, Path::new(PAYLOAD)).unwrap(),
            LoaderHandle(0x1000)
        );

        let resumed = control.resumed_states();
        assert_eq!(resumed.len(), 1, "{arch:?}");
        match resumed[0] {
            RegisterSnapshot::X86_64(regs) => {
                assert_eq!(regs.rip, LOADER_OPEN.0);
                assert_eq!(regs.rdi, PATH_REGION.0);
                assert_eq!(regs.rsi, LOADER_MODE);
                assert_eq!(regs.rsp, STACK_REGION.0 + STACK_SIZE as u64 + 8);
            }
            RegisterSnapshot::Arm64(regs) => {
                assert_eq!(regs.pc, LOADER_OPEN.0);
                assert_eq!(regs.x[0], PATH_REGION.0);
                assert_eq!(regs.x[1], LOADER_MODE);
                assert_eq!(regs.sp, STACK_REGION.0 + STACK_SIZE as u64);
                assert_eq!(regs.lr, 0);
            }
        }
    }
}

#[test]
fn loader_failure_is_reported() {
    let (injector, control) = injector(Script::clean(0), Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert!(matches!(err, Error::LoaderFailed(pid, _) if pid == TARGET));
    assert_eq!(err.failure_kind(), FailureKind::LoaderFailed);
    assert_eq!(control.count(|call| matches!(call, Call::Deallocate(..))), 2);
    assert_balanced_cleanup(&control);
}

#[test]
fn incompatible_architecture_is_refused_before_any_remote_call() {
    for arch in [ProcessArchitecture::Legacy32, ProcessArchitecture::Translated] {
        let script = Script {
            arch,
            ..Script::clean(0x1000)
        };
        let (injector, control) = injector(script, Architecture::X86_64);

        let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

        assert!(matches!(err, Error::IncompatibleArchitecture(_, reported) if reported == arch));
        assert_eq!(control.calls(), vec![Call::ProcessArchitecture(TARGET)]);
    }
}

#[test]
fn invalid_request_never_reaches_backend() {
    let (injector, control) = injector(Script::clean(0x1000), Architecture::X86_64);

    let err = injector.inject(Pid::from_raw(-1), Path::new("x")).unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::InvalidRequest);
    let err = injector.inject(TARGET, Path::new("relative/lib.so")).unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::InvalidRequest);

    assert!(control.calls().is_empty());
}

#[test]
fn capability_denied_stages_nothing() {
    let script = Script {
        deny_capability: true,
        ..Script::clean(0x1000)
    };
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::CapabilityDenied);
    assert!(!control.calls().iter().any(Call::is_remote_mutation));
}

#[test]
fn staging_failure_unwinds_path_region() {
    let script = Script {
        fail_allocation: Some(1),
        ..Script::clean(0x1000)
    };
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert!(matches!(err, Error::Staging(_)));
    assert_eq!(err.failure_kind(), FailureKind::StagingFailed);
    assert_eq!(
        control.count(|call| matches!(call, Call::Deallocate(..))),
        1
    );
    assert_eq!(control.count(|call| *call == Call::CreateThread), 0);
    assert_balanced_cleanup(&control);
}

#[test]
fn path_write_failure_releases_path_region() {
    let script = Script {
        fail_write: Some(0),
        ..Script::clean(0x1000)
    };
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::StagingFailed);
    assert_eq!(control.count(|call| matches!(call, Call::Allocate(_))), 1);
    assert_eq!(
        control.allocations().1,
        vec![(PATH_REGION, PAYLOAD.len() + 1)]
    );
    assert_eq!(control.count(|call| *call == Call::CreateThread), 0);
    assert_balanced_cleanup(&control);
}

#[test]
fn trailer_write_failure_releases_both_regions() {
    let script = Script {
        fail_write: Some(1),
        ..Script::clean(0x1000)
    };
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::StagingFailed);
    let (_, mut released) = control.allocations();
    released.sort();
    assert_eq!(
        released,
        vec![
            (PATH_REGION, PAYLOAD.len() + 1),
            (STACK_REGION, STACK_SIZE + 16)
        ]
    );
    assert_eq!(control.count(|call| *call == Call::CreateThread), 0);
    assert_balanced_cleanup(&control);
}

#[test]
fn interceptor_failure_terminates_thread_without_running_it() {
    let script = Script {
        fail_install: true,
        ..Script::clean(0x1000)
    };
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::TrampolineFailed);
    assert_eq!(control.count(|call| *call == Call::Resume), 0);
    assert_eq!(control.count(|call| *call == Call::Terminate), 1);
    assert_balanced_cleanup(&control);
}

#[test]
fn unexpected_fault_is_suspended_not_resumed() {
    let script = Script::faults(vec![ScriptedFault::Unexpected { ip: 0x4141_4141 }]);
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    match err {
        Error::Trampoline(inner) => assert!(matches!(
            *inner,
            Error::TrampolineAborted(pid, RemoteAddress(0x4141_4141)) if pid == TARGET
        )),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(control.resumed_states().is_empty());

    let suspend = control.position(|call| *call == Call::Suspend).unwrap();
    let reply = control
        .position(|call| *call == Call::ReplyFault(FaultReply::DoNotResume))
        .unwrap();
    let count = control.position(|call| *call == Call::SuspendCount).unwrap();
    assert!(suspend < reply && reply < count);
    assert_balanced_cleanup(&control);
}

#[test]
fn completion_fault_is_suspended_before_suspend_count_check() {
    let (injector, control) = injector(Script::clean(0x1000), Architecture::Arm64);
    injector.inject(TARGET, Path::new(PAYLOAD)).unwrap();

    let calls = control.calls();
    let second_fault = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| **call == Call::ReceiveFault)
        .nth(1)
        .map(|(index, _)| index)
        .unwrap();
    assert_eq!(
        &calls[second_fault + 1..second_fault + 5],
        &[
            Call::Suspend,
            Call::ReplyFault(FaultReply::DoNotResume),
            Call::SuspendCount,
            Call::GetRegisters,
        ]
    );
}

#[test]
fn thread_that_dies_before_rendezvous_is_cleaned_up() {
    let (injector, control) = injector(Script::faults(vec![]), Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    assert_eq!(err.failure_kind(), FailureKind::TrampolineFailed);
    assert_eq!(control.count(|call| *call == Call::Terminate), 1);
    assert_eq!(control.count(|call| *call == Call::ReleaseFaultChannel), 1);
    assert_balanced_cleanup(&control);
}

#[test]
fn second_sentinel_hit_is_not_dispatched_again() {
    let script = Script::faults(vec![ScriptedFault::Rendezvous, ScriptedFault::Rendezvous]);
    let (injector, control) = injector(script, Architecture::X86_64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    // The loader never returned, so its return register must not be trusted.
    assert_eq!(err.failure_kind(), FailureKind::TrampolineFailed);
    match err {
        Error::Trampoline(inner) => assert!(matches!(
            *inner,
            Error::LoaderCrashed(pid, ip) if pid == TARGET && ip == SENTINEL
        )),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(control.resumed_states().len(), 1);
    assert_eq!(
        control.count(|call| *call == Call::ReplyFault(FaultReply::DoNotResume)),
        1
    );
    assert_balanced_cleanup(&control);
}

#[test]
fn fault_inside_loader_is_not_taken_as_its_result() {
    let script = Script::faults(vec![
        ScriptedFault::Rendezvous,
        ScriptedFault::Unexpected { ip: 0x4242 },
    ]);
    let (injector, control) = injector(script, Architecture::Arm64);

    let err = injector.inject(TARGET, Path::new(PAYLOAD)).unwrap_err();

    match err {
        Error::Trampoline(inner) => assert!(matches!(
            *inner,
            Error::LoaderCrashed(pid, RemoteAddress(0x4242)) if pid == TARGET
        )),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(control.resumed_states().len(), 1);
    assert_eq!(control.count(|call| *call == Call::Terminate), 1);
    assert_balanced_cleanup(&control);
}
