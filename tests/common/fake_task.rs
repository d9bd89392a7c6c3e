use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::unistd::Pid;

use dylib_injector::registers::{Architecture, RegisterSnapshot};
use dylib_injector::task::{
    FaultChannel, FaultNotification, FaultReply, KernReturn, ProcessArchitecture,
    ProcessControl, RemoteAddress, RuntimeSymbols, TaskControl, ThreadHandle,
};
use dylib_injector::{Error, Result};

pub const THREAD_SETUP: RemoteAddress = RemoteAddress(0x7fff_2000_1000);
pub const LOADER_OPEN: RemoteAddress = RemoteAddress(0x7fff_3000_2000);
pub const SENTINEL: RemoteAddress = RemoteAddress(0xabad1dea);
/// First region handed out by [`FakeTask::allocate`]; later ones follow at this stride.
pub const REGION_STRIDE: u64 = 0x10_0000;

const THREAD: ThreadHandle = ThreadHandle(0x1a03);
pub const CHANNEL: FaultChannel = FaultChannel(0x2b03);
const EXC_BAD_ACCESS: i32 = 1;

/// Everything the engine asked the backend to do, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    ProcessArchitecture(Pid),
    RuntimeSymbols,
    TaskForPid(Pid),
    Allocate(usize),
    Write(RemoteAddress, Vec<u8>),
    Deallocate(RemoteAddress, usize),
    CreateThread,
    SetRegisters(RegisterSnapshot),
    GetRegisters,
    InstallFaultChannel,
    Resume,
    Suspend,
    SuspendCount,
    Terminate,
    ReceiveFault,
    ReplyFault(FaultReply),
    ReleaseFaultChannel,
    ReleaseTask,
}

impl Call {
    /// Whether the call touches the target's memory or threads.
    pub fn is_remote_mutation(&self) -> bool {
        !matches!(
            self,
            Call::ProcessArchitecture(_) | Call::RuntimeSymbols | Call::TaskForPid(_)
        )
    }
}

/// A fault the fake remote thread raises.
#[derive(Copy, Clone, Debug)]
pub enum ScriptedFault {
    /// The setup routine returns into the planted sentinel.
    Rendezvous,
    /// The loader returns `return_value` into a null return address.
    Completion { return_value: u64 },
    /// The thread faults at an arbitrary address.
    Unexpected { ip: u64 },
}

#[derive(Clone, Debug)]
pub struct Script {
    pub arch: ProcessArchitecture,
    pub faults: Vec<ScriptedFault>,
    pub deny_capability: bool,
    /// Index of the allocation that fails.
    pub fail_allocation: Option<usize>,
    /// Index of the memory write that fails.
    pub fail_write: Option<usize>,
    pub fail_install: bool,
}

impl Script {
    /// A clean run: rendezvous, then the loader returns `return_value`.
    pub fn clean(return_value: u64) -> Self {
        Self::faults(vec![
            ScriptedFault::Rendezvous,
            ScriptedFault::Completion { return_value },
        ])
    }

    pub fn faults(faults: Vec<ScriptedFault>) -> Self {
        Self {
            arch: ProcessArchitecture::Native,
            faults,
            deny_capability: false,
            fail_allocation: None,
            fail_write: None,
            fail_install: false,
        }
    }
}

#[derive(Debug)]
struct State {
    script: Script,
    pending_faults: VecDeque<ScriptedFault>,
    calls: Vec<Call>,
    allocations: usize,
    writes: usize,
    thread_state: Option<RegisterSnapshot>,
    suspend_count: u32,
}

/// Process control backend that simulates one well-behaved remote thread and records every call.
#[derive(Clone, Debug)]
pub struct FakeControl {
    state: Arc<Mutex<State>>,
}

impl FakeControl {
    pub fn new(script: Script) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending_faults: script.faults.iter().copied().collect(),
                script,
                calls: Vec::new(),
                allocations: 0,
                writes: 0,
                thread_state: None,
                suspend_count: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn position(&self, matches: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().calls.iter().position(matches)
    }

    /// Register states the engine answered faults with.
    pub fn resumed_states(&self) -> Vec<RegisterSnapshot> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::ReplyFault(FaultReply::Resume(state)) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Regions allocated and released, as (address, size) pairs.
    pub fn allocations(&self) -> (Vec<(RemoteAddress, usize)>, Vec<(RemoteAddress, usize)>) {
        let state = self.lock();
        let mut allocated = Vec::new();
        let mut released = Vec::new();
        let mut next = 0;
        for call in &state.calls {
            match call {
                Call::Allocate(size) => {
                    next += 1;
                    allocated.push((RemoteAddress(REGION_STRIDE * next), *size));
                }
                Call::Deallocate(address, size) => released.push((*address, *size)),
                _ => (),
            }
        }
        (allocated, released)
    }
}

impl ProcessControl for FakeControl {
    type Task = FakeTask;

    fn process_architecture(&self, pid: Pid) -> Result<ProcessArchitecture> {
        let mut state = self.lock();
        state.calls.push(Call::ProcessArchitecture(pid));
        Ok(state.script.arch)
    }

    fn task_for_pid(&self, pid: Pid) -> Result<FakeTask> {
        let mut state = self.lock();
        state.calls.push(Call::TaskForPid(pid));
        if state.script.deny_capability {
            return Err(Error::CapabilityDenied(KernReturn::FAILURE, pid));
        }
        Ok(FakeTask {
            pid,
            control: self.clone(),
        })
    }

    fn runtime_symbols(&self) -> Result<RuntimeSymbols> {
        self.lock().calls.push(Call::RuntimeSymbols);
        Ok(RuntimeSymbols {
            thread_setup: THREAD_SETUP,
            loader_open: LOADER_OPEN,
        })
    }
}

#[derive(Debug)]
pub struct FakeTask {
    pid: Pid,
    control: FakeControl,
}

impl Drop for FakeTask {
    fn drop(&mut self) {
        self.control.lock().calls.push(Call::ReleaseTask);
    }
}

fn with_instruction_pointer(snapshot: RegisterSnapshot, ip: u64) -> RegisterSnapshot {
    match snapshot {
        RegisterSnapshot::X86_64(mut regs) => {
            regs.rip = ip;
            RegisterSnapshot::X86_64(regs)
        }
        RegisterSnapshot::Arm64(mut regs) => {
            regs.pc = ip;
            RegisterSnapshot::Arm64(regs)
        }
    }
}

fn with_return_value(snapshot: RegisterSnapshot, value: u64) -> RegisterSnapshot {
    match snapshot {
        RegisterSnapshot::X86_64(mut regs) => {
            regs.rax = value;
            RegisterSnapshot::X86_64(regs)
        }
        RegisterSnapshot::Arm64(mut regs) => {
            regs.x[0] = value;
            RegisterSnapshot::Arm64(regs)
        }
    }
}

/// Faults only arrive on the channel handed out by [`FakeTask::install_fault_channel`].
fn check_channel(call: &'static str, channel: FaultChannel) -> Result<()> {
    if channel == CHANNEL {
        Ok(())
    } else {
        Err(Error::Kernel(call, KernReturn::INVALID_NAME))
    }
}

impl TaskControl for FakeTask {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn allocate(&mut self, size: usize) -> Result<RemoteAddress> {
        let mut state = self.control.lock();
        let index = state.allocations;
        if state.script.fail_allocation == Some(index) {
            return Err(Error::Kernel("mach_vm_allocate", KernReturn::NO_SPACE));
        }
        state.allocations += 1;
        state.calls.push(Call::Allocate(size));
        Ok(RemoteAddress(REGION_STRIDE * state.allocations as u64))
    }

    fn write_memory(&mut self, address: RemoteAddress, data: &[u8]) -> Result<()> {
        let mut state = self.control.lock();
        let index = state.writes;
        state.writes += 1;
        if state.script.fail_write == Some(index) {
            return Err(Error::Kernel("mach_vm_write", KernReturn::PROTECTION_FAILURE));
        }
        state.calls.push(Call::Write(address, data.to_vec()));
        Ok(())
    }

    fn deallocate(&mut self, address: RemoteAddress, size: usize) -> Result<()> {
        self.control
            .lock()
            .calls
            .push(Call::Deallocate(address, size));
        Ok(())
    }

    fn create_thread(&mut self) -> Result<ThreadHandle> {
        let mut state = self.control.lock();
        state.calls.push(Call::CreateThread);
        state.suspend_count = 1;
        Ok(THREAD)
    }

    fn get_registers(
        &mut self,
        _thread: ThreadHandle,
        _arch: Architecture,
    ) -> Result<RegisterSnapshot> {
        let mut state = self.control.lock();
        state.calls.push(Call::GetRegisters);
        state
            .thread_state
            .ok_or(Error::Kernel("thread_get_state", KernReturn::INVALID_ARGUMENT))
    }

    fn set_registers(&mut self, _thread: ThreadHandle, registers: &RegisterSnapshot) -> Result<()> {
        let mut state = self.control.lock();
        state.calls.push(Call::SetRegisters(*registers));
        state.thread_state = Some(*registers);
        Ok(())
    }

    fn install_fault_channel(
        &mut self,
        _thread: ThreadHandle,
        _arch: Architecture,
    ) -> Result<FaultChannel> {
        let mut state = self.control.lock();
        if state.script.fail_install {
            return Err(Error::Kernel(
                "thread_set_exception_ports",
                KernReturn::INVALID_ARGUMENT,
            ));
        }
        state.calls.push(Call::InstallFaultChannel);
        Ok(CHANNEL)
    }

    fn resume_thread(&mut self, _thread: ThreadHandle) -> Result<()> {
        let mut state = self.control.lock();
        state.calls.push(Call::Resume);
        state.suspend_count = state.suspend_count.saturating_sub(1);
        Ok(())
    }

    fn suspend_thread(&mut self, _thread: ThreadHandle) -> Result<()> {
        let mut state = self.control.lock();
        state.calls.push(Call::Suspend);
        state.suspend_count += 1;
        Ok(())
    }

    fn suspend_count(&mut self, _thread: ThreadHandle) -> Result<u32> {
        let mut state = self.control.lock();
        state.calls.push(Call::SuspendCount);
        Ok(state.suspend_count)
    }

    fn terminate_thread(&mut self, _thread: ThreadHandle) -> Result<()> {
        self.control.lock().calls.push(Call::Terminate);
        Ok(())
    }

    fn receive_fault(
        &mut self,
        channel: FaultChannel,
        arch: Architecture,
    ) -> Result<FaultNotification> {
        check_channel("mach_msg", channel)?;
        let mut state = self.control.lock();
        state.calls.push(Call::ReceiveFault);
        let current = state
            .thread_state
            .ok_or(Error::MalformedFault("thread never primed"))?;
        // A thread with nothing left to do would block the engine forever.
        let fault = state
            .pending_faults
            .pop_front()
            .ok_or(Error::Kernel("mach_msg", KernReturn::TERMINATED))?;

        let faulted = match fault {
            ScriptedFault::Rendezvous => {
                let popped = match current {
                    RegisterSnapshot::X86_64(mut regs) => {
                        regs.rsp += 8;
                        RegisterSnapshot::X86_64(regs)
                    }
                    arm64 => arm64,
                };
                with_instruction_pointer(popped, SENTINEL.0)
            }
            ScriptedFault::Completion { return_value } => {
                with_instruction_pointer(with_return_value(current, return_value), 0)
            }
            ScriptedFault::Unexpected { ip } => with_instruction_pointer(current, ip),
        };
        state.thread_state = Some(faulted);
        Ok(FaultNotification {
            thread: THREAD,
            exception: EXC_BAD_ACCESS,
            state: (faulted.architecture() == arch).then_some(faulted),
            reply_port: 0x3c03,
        })
    }

    fn reply_fault(
        &mut self,
        channel: FaultChannel,
        _notification: &FaultNotification,
        reply: FaultReply,
    ) -> Result<()> {
        check_channel("mach_msg", channel)?;
        let mut state = self.control.lock();
        if let FaultReply::Resume(resumed) = &reply {
            state.thread_state = Some(*resumed);
        }
        state.calls.push(Call::ReplyFault(reply));
        Ok(())
    }

    fn release_fault_channel(&mut self, channel: FaultChannel) -> Result<()> {
        check_channel("mach_port_mod_refs", channel)?;
        self.control.lock().calls.push(Call::ReleaseFaultChannel);
        Ok(())
    }
}
