//! Capability interface over a foreign process.
//!
//! [`ProcessControl`] is implemented once per host kernel and hands out [`TaskControl`]
//! capabilities. Everything that depends on the kernel's calling conventions or message layouts
//! lives behind these two traits, so the injection algorithm itself is kernel-agnostic.

use std::fmt::{Debug, Display, Formatter};

use nix::unistd::Pid;

use crate::registers::{Architecture, RegisterSnapshot};
use crate::Result;

/// Represents an address in a remote process.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct RemoteAddress(pub u64);

impl Debug for RemoteAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RemoteAddress")
            .field(&format_args!("0x{:x}", self.0))
            .finish()
    }
}

impl RemoteAddress {
    pub fn offset(self, bytes: u64) -> RemoteAddress {
        RemoteAddress(self.0 + bytes)
    }
}

/// Kernel name of a thread created inside a remote task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ThreadHandle(pub u32);

/// Receive endpoint that intercepts the faults of one remote thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FaultChannel(pub u32);

/// Execution width of a target process, relative to the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessArchitecture {
    /// Same width and instruction set as the engine.
    Native,
    /// 32-bit process.
    Legacy32,
    /// 64-bit process running under binary translation.
    Translated,
}

/// Addresses of the routines the trampoline calls inside the target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RuntimeSymbols {
    /// Routine that initializes thread-local state for a new native thread.
    pub thread_setup: RemoteAddress,
    /// Dynamic loader's library-open routine.
    pub loader_open: RemoteAddress,
}

/// A status code returned by the kernel.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct KernReturn(pub i32);

impl KernReturn {
    pub const SUCCESS: KernReturn = KernReturn(0);
    pub const INVALID_ADDRESS: KernReturn = KernReturn(1);
    pub const PROTECTION_FAILURE: KernReturn = KernReturn(2);
    pub const NO_SPACE: KernReturn = KernReturn(3);
    pub const INVALID_ARGUMENT: KernReturn = KernReturn(4);
    pub const FAILURE: KernReturn = KernReturn(5);
    pub const RESOURCE_SHORTAGE: KernReturn = KernReturn(6);
    pub const INVALID_NAME: KernReturn = KernReturn(15);
    pub const INVALID_TASK: KernReturn = KernReturn(16);
    pub const INVALID_RIGHT: KernReturn = KernReturn(17);
    pub const INVALID_VALUE: KernReturn = KernReturn(18);
    pub const TERMINATED: KernReturn = KernReturn(37);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            KernReturn::SUCCESS => "KERN_SUCCESS",
            KernReturn::INVALID_ADDRESS => "KERN_INVALID_ADDRESS",
            KernReturn::PROTECTION_FAILURE => "KERN_PROTECTION_FAILURE",
            KernReturn::NO_SPACE => "KERN_NO_SPACE",
            KernReturn::INVALID_ARGUMENT => "KERN_INVALID_ARGUMENT",
            KernReturn::FAILURE => "KERN_FAILURE",
            KernReturn::RESOURCE_SHORTAGE => "KERN_RESOURCE_SHORTAGE",
            KernReturn::INVALID_NAME => "KERN_INVALID_NAME",
            KernReturn::INVALID_TASK => "KERN_INVALID_TASK",
            KernReturn::INVALID_RIGHT => "KERN_INVALID_RIGHT",
            KernReturn::INVALID_VALUE => "KERN_INVALID_VALUE",
            KernReturn::TERMINATED => "KERN_TERMINATED",
            _ => return None,
        })
    }
}

impl Debug for KernReturn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KernReturn({self})")
    }
}

impl Display for KernReturn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:x})", self.0),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}

/// A fault raised by a remote thread, as delivered on its [`FaultChannel`].
#[derive(Clone, Debug)]
pub struct FaultNotification {
    pub thread: ThreadHandle,
    /// Kernel exception type.
    pub exception: i32,
    /// Register state at the fault. `None` if the kernel delivered a state flavor the engine did
    /// not ask for.
    pub state: Option<RegisterSnapshot>,
    /// Kernel name of the right used to answer this notification.
    pub reply_port: u32,
}

/// How a fault notification is answered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FaultReply {
    /// Fault handled: resume the thread with the given register state.
    Resume(RegisterSnapshot),
    /// Fault handled, but the thread must not run again.
    DoNotResume,
}

/// Host-level entry point: inspects processes and grants capabilities over them.
pub trait ProcessControl {
    type Task: TaskControl;

    /// Reports the execution width of the process with given pid.
    fn process_architecture(&self, pid: Pid) -> Result<ProcessArchitecture>;

    /// Obtains a capability for memory and thread control over the process with given pid.
    fn task_for_pid(&self, pid: Pid) -> Result<Self::Task>;

    /// Resolves the runtime routines the trampoline jumps to.
    fn runtime_symbols(&self) -> Result<RuntimeSymbols>;
}

/// Memory and thread control over one foreign task.
///
/// The capability is released when the value is dropped.
pub trait TaskControl {
    /// Pid of the task this capability controls.
    fn pid(&self) -> Pid;

    /// Allocates `size` bytes anywhere in the task's address space.
    fn allocate(&mut self, size: usize) -> Result<RemoteAddress>;

    /// Writes `data` to given address in the task.
    fn write_memory(&mut self, address: RemoteAddress, data: &[u8]) -> Result<()>;

    /// Releases a region previously returned by [`TaskControl::allocate`].
    fn deallocate(&mut self, address: RemoteAddress, size: usize) -> Result<()>;

    /// Creates a new, suspended thread with undefined registers.
    fn create_thread(&mut self) -> Result<ThreadHandle>;

    fn get_registers(&mut self, thread: ThreadHandle, arch: Architecture)
        -> Result<RegisterSnapshot>;

    fn set_registers(&mut self, thread: ThreadHandle, registers: &RegisterSnapshot) -> Result<()>;

    /// Binds a new fault channel to `thread`. Faults deliver register state of type `arch`.
    fn install_fault_channel(
        &mut self,
        thread: ThreadHandle,
        arch: Architecture,
    ) -> Result<FaultChannel>;

    fn resume_thread(&mut self, thread: ThreadHandle) -> Result<()>;

    fn suspend_thread(&mut self, thread: ThreadHandle) -> Result<()>;

    fn suspend_count(&mut self, thread: ThreadHandle) -> Result<u32>;

    fn terminate_thread(&mut self, thread: ThreadHandle) -> Result<()>;

    /// Blocks until a fault notification arrives on `channel`.
    fn receive_fault(
        &mut self,
        channel: FaultChannel,
        arch: Architecture,
    ) -> Result<FaultNotification>;

    /// Answers a notification previously returned by [`TaskControl::receive_fault`].
    fn reply_fault(
        &mut self,
        channel: FaultChannel,
        notification: &FaultNotification,
        reply: FaultReply,
    ) -> Result<()>;

    /// Releases `channel` together with any notification still awaiting an answer.
    fn release_fault_channel(&mut self, channel: FaultChannel) -> Result<()>;
}
