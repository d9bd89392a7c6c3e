//! Loads a dynamic library into a running, unrelated process.
//!
//! The engine ([`injector::Injector`]) acquires a task capability for the target, stages the
//! library path and a synthetic stack in its address space, and starts a raw thread on the
//! runtime's thread-setup routine with a planted sentinel return address. The fault raised when
//! that routine returns into the sentinel is intercepted, the thread is redirected into the
//! dynamic loader, and the loader's result is read back once the thread faults again.
//!
//! Injecting requires a capability most callers do not have, so [`service`] exposes the engine
//! as a request/reply operation for a privileged, idle-exiting helper process.
#![cfg(unix)]

use std::path::PathBuf;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::task::{KernReturn, ProcessArchitecture, RemoteAddress};

pub mod client;
pub mod exception;
pub mod injector;
#[cfg(target_os = "macos")]
pub mod mach;
pub mod registers;
pub mod remote_context;
pub mod service;
pub mod task;

pub use injector::{Injector, LoaderHandle};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid injection request: {0}")]
    InvalidRequest(&'static str),
    #[error("Target pid {0} has an incompatible architecture: {1:?}")]
    IncompatibleArchitecture(Pid, ProcessArchitecture),
    #[error("Error inspecting target pid {1}: `{0}`")]
    ProcessInfo(#[source] std::io::Error, Pid),
    #[error("Task capability for pid {1} denied: {0}")]
    CapabilityDenied(KernReturn, Pid),
    #[error("Error in `{0}` call: {1}")]
    Kernel(&'static str, KernReturn),
    #[error("Runtime symbol `{0}` could not be resolved")]
    MissingSymbol(&'static str),
    #[error("Invalid register state: {0}")]
    InvalidRegisters(&'static str),
    #[error("Malformed fault notification: {0}")]
    MalformedFault(&'static str),
    #[error("Staging payload in target failed: {0}")]
    Staging(#[source] Box<Error>),
    #[error("Driving remote thread failed: {0}")]
    Trampoline(#[source] Box<Error>),
    #[error("Releasing staged memory failed: {0}")]
    Cleanup(#[source] Box<Error>),
    #[error("Remote thread in pid {0} faulted at {1:?} before reaching the loader")]
    TrampolineAborted(Pid, RemoteAddress),
    #[error("Remote thread in pid {0} faulted at {1:?} inside the loader")]
    LoaderCrashed(Pid, RemoteAddress),
    #[error("Loader in pid {0} could not open `{1}`")]
    LoaderFailed(Pid, PathBuf),
    #[error("Service channel error: `{0}`")]
    Channel(#[source] std::io::Error),
    #[error("Malformed service message: `{0}`")]
    Protocol(#[from] serde_json::Error),
    #[error("Injection is not supported on this platform")]
    UnsupportedPlatform,
}

impl Error {
    pub(crate) fn staging(err: Error) -> Error {
        Error::Staging(Box::new(err))
    }

    pub(crate) fn trampoline(err: Error) -> Error {
        Error::Trampoline(Box::new(err))
    }

    pub(crate) fn cleanup(err: Error) -> Error {
        Error::Cleanup(Box::new(err))
    }

    /// Coarse classification of the failure, as reported to service clients.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::InvalidRequest(_) => FailureKind::InvalidRequest,
            Error::IncompatibleArchitecture(..) => FailureKind::IncompatibleArchitecture,
            Error::ProcessInfo(..) | Error::CapabilityDenied(..) => FailureKind::CapabilityDenied,
            Error::Staging(_) | Error::Cleanup(_) => FailureKind::StagingFailed,
            Error::Trampoline(_)
            | Error::TrampolineAborted(..)
            | Error::LoaderCrashed(..)
            | Error::InvalidRegisters(_)
            | Error::MalformedFault(_) => FailureKind::TrampolineFailed,
            Error::LoaderFailed(..) => FailureKind::LoaderFailed,
            Error::Kernel(..)
            | Error::MissingSymbol(_)
            | Error::Channel(_)
            | Error::Protocol(_)
            | Error::UnsupportedPlatform => FailureKind::Internal,
        }
    }
}

/// Failure classes of an injection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidRequest,
    IncompatibleArchitecture,
    CapabilityDenied,
    StagingFailed,
    TrampolineFailed,
    LoaderFailed,
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Injects the library at `payload` into the process with given pid, using the host kernel.
///
/// The caller needs the privilege to obtain task capabilities for `pid`. See [`service`] for
/// injecting on behalf of unprivileged callers.
#[cfg(target_os = "macos")]
pub fn inject_library(pid: Pid, payload: &std::path::Path) -> Result<LoaderHandle> {
    Injector::new(mach::MachControl::new())?.inject(pid, payload)
}
