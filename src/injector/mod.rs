use std::ffi::CString;
use std::fmt::{Debug, Formatter};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::unistd::Pid;
use tracing::{info, info_span, warn};

use crate::injector::staging::StagedPayload;
use crate::registers::Architecture;
use crate::task::{ProcessArchitecture, ProcessControl};
use crate::{Error, Result};

pub mod arm64;
pub mod staging;
pub mod trampoline;
pub mod x86_64;

/// Non-null handle the target's loader returned for the payload.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct LoaderHandle(pub u64);

impl Debug for LoaderHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LoaderHandle")
            .field(&format_args!("0x{:x}", self.0))
            .finish()
    }
}

/// Loads libraries into foreign processes through a [`ProcessControl`] backend.
pub struct Injector<P: ProcessControl> {
    control: P,
    arch: Architecture,
}

impl<P: ProcessControl> Injector<P> {
    /// Creates an injector for targets of the host's own architecture.
    pub fn new(control: P) -> Result<Self> {
        let arch = Architecture::native().ok_or(Error::UnsupportedPlatform)?;
        Ok(Self::with_architecture(control, arch))
    }

    /// Creates an injector that drives remote threads of the given architecture.
    pub fn with_architecture(control: P, arch: Architecture) -> Self {
        Self { control, arch }
    }

    pub fn control(&self) -> &P {
        &self.control
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Loads the library at `payload` into the process with given pid.
    ///
    /// # Implementation
    ///
    /// - Refuse targets whose execution width differs from the engine's.
    /// - Acquire a task capability for the target.
    /// - Stage the payload path and a synthetic stack topped by a sentinel return address.
    /// - Start a suspended thread on the runtime's thread-setup routine and intercept its faults.
    /// - When the routine returns into the sentinel, redirect the thread into the loader.
    /// - When the loader returns and the thread faults again, read its return value.
    /// - Terminate the thread and release everything staged.
    ///
    /// Every region staged is released before returning, on success and on failure.
    pub fn inject(&self, pid: Pid, payload: &Path) -> Result<LoaderHandle> {
        let _log_guard = info_span!("inject", pid = pid.as_raw()).entered();
        let payload_path = validate_request(pid, payload)?;

        match self.control.process_architecture(pid)? {
            ProcessArchitecture::Native => (),
            other => {
                warn!(arch = ?other, "refusing target with incompatible architecture");
                return Err(Error::IncompatibleArchitecture(pid, other));
            }
        }
        let symbols = self.control.runtime_symbols()?;
        let mut task = self.control.task_for_pid(pid)?;
        info!("acquired task capability");

        let staged = StagedPayload::stage(&mut task, &payload_path).map_err(Error::staging)?;
        info!(path = ?staged.path.address, stack = ?staged.stack.address, "staged payload");

        let loader_ret =
            trampoline::run(&mut task, self.arch, &staged, &symbols).map_err(Error::trampoline);
        let cleanup = staged.release(&mut task).map_err(Error::cleanup);
        let loader_ret = loader_ret?;
        cleanup?;

        match loader_ret {
            0 => {
                warn!(payload = %payload.display(), "loader failed to open payload");
                Err(Error::LoaderFailed(pid, payload.to_path_buf()))
            }
            handle => {
                info!(payload = %payload.display(), "injected payload");
                Ok(LoaderHandle(handle))
            }
        }
    }
}

/// Checks the target pid and converts the payload path for the remote loader.
fn validate_request(pid: Pid, payload: &Path) -> Result<CString> {
    if pid.as_raw() <= 0 {
        return Err(Error::InvalidRequest("target pid must be positive"));
    }
    if payload.as_os_str().is_empty() {
        return Err(Error::InvalidRequest("payload path is empty"));
    }
    if !payload.is_absolute() {
        return Err(Error::InvalidRequest("payload path must be absolute"));
    }
    CString::new(payload.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidRequest("payload path contains a NUL byte"))
}
