//! Safety-enforcing wrapper for a thread created inside a remote task.

use scopeguard::{guard, ScopeGuard};
use tracing::{debug, warn};

use crate::registers::{Architecture, RegisterSnapshot};
use crate::task::{FaultChannel, FaultNotification, FaultReply, TaskControl, ThreadHandle};
use crate::Result;

/// States of a remote thread.
pub trait ContextState {}

/// Thread exists and is suspended, its registers are undefined.
pub struct Created;

impl ContextState for Created {}

/// Thread is suspended with a fully defined register snapshot.
pub struct Primed;

impl ContextState for Primed {}

/// Thread is suspended, primed, and its faults are intercepted on `channel`.
pub struct Armed {
    channel: FaultChannel,
}

impl ContextState for Armed {}

/// Thread has been resumed and may be executing inside the task.
pub struct Running {
    channel: FaultChannel,
}

impl ContextState for Running {}

struct Parts<'a, T: TaskControl> {
    task: &'a mut T,
    thread: ThreadHandle,
    channel: Option<FaultChannel>,
}

/// Represents a thread of execution the engine created inside a remote task.
///
/// The thread is automatically terminated, and its fault channel released, when
/// [`RemoteContext`] goes out of scope. Errors detected there are logged and otherwise ignored.
/// Call [`RemoteContext<Running>::terminate`] to handle them.
///
/// # States
///
/// A context moves through [`Created`], [`Primed`], [`Armed`] and [`Running`], in that order.
/// Only an armed context can be resumed, so a remote thread never runs with undefined registers
/// or with nothing listening for its faults.
pub struct RemoteContext<'a, T: TaskControl, State: ContextState> {
    parts: ScopeGuard<Parts<'a, T>, fn(Parts<'a, T>)>,
    state: State,
}

impl<'a, T: TaskControl, State: ContextState> RemoteContext<'a, T, State> {
    pub fn thread(&self) -> ThreadHandle {
        self.parts.thread
    }

    fn transition<Next: ContextState>(self, state: Next) -> RemoteContext<'a, T, Next> {
        RemoteContext {
            parts: self.parts,
            state,
        }
    }
}

impl<'a, T: TaskControl> RemoteContext<'a, T, Created> {
    /// Creates a new suspended thread in the task.
    pub fn create(task: &'a mut T) -> Result<Self> {
        let thread = task.create_thread()?;
        debug!(?thread, "created remote thread");
        Ok(Self {
            parts: guard(
                Parts {
                    task,
                    thread,
                    channel: None,
                },
                abandon::<T> as fn(Parts<'a, T>),
            ),
            state: Created,
        })
    }

    pub fn set_registers(
        mut self,
        registers: &RegisterSnapshot,
    ) -> Result<RemoteContext<'a, T, Primed>> {
        let thread = self.parts.thread;
        self.parts.task.set_registers(thread, registers)?;
        debug!(?thread, ?registers, "primed remote thread");
        Ok(self.transition(Primed))
    }
}

impl<'a, T: TaskControl> RemoteContext<'a, T, Primed> {
    /// Routes every fault of the thread to a new fault channel.
    pub fn intercept_faults(mut self, arch: Architecture) -> Result<RemoteContext<'a, T, Armed>> {
        let thread = self.parts.thread;
        let channel = self.parts.task.install_fault_channel(thread, arch)?;
        debug!(?thread, ?channel, "installed fault interceptor");
        self.parts.channel = Some(channel);
        Ok(self.transition(Armed { channel }))
    }
}

impl<'a, T: TaskControl> RemoteContext<'a, T, Armed> {
    pub fn resume(mut self) -> Result<RemoteContext<'a, T, Running>> {
        let thread = self.parts.thread;
        self.parts.task.resume_thread(thread)?;
        debug!(?thread, "resumed remote thread");
        let channel = self.state.channel;
        Ok(self.transition(Running { channel }))
    }
}

impl<'a, T: TaskControl> RemoteContext<'a, T, Running> {
    pub fn channel(&self) -> FaultChannel {
        self.state.channel
    }

    /// Blocks until the thread raises a fault.
    pub fn receive_fault(&mut self, arch: Architecture) -> Result<FaultNotification> {
        let channel = self.state.channel;
        self.parts.task.receive_fault(channel, arch)
    }

    pub fn reply_fault(&mut self, notification: &FaultNotification, reply: FaultReply) -> Result<()> {
        let channel = self.state.channel;
        self.parts.task.reply_fault(channel, notification, reply)
    }

    pub fn suspend(&mut self) -> Result<()> {
        let thread = self.parts.thread;
        self.parts.task.suspend_thread(thread)
    }

    pub fn suspend_count(&mut self) -> Result<u32> {
        let thread = self.parts.thread;
        self.parts.task.suspend_count(thread)
    }

    pub fn registers(&mut self, arch: Architecture) -> Result<RegisterSnapshot> {
        let thread = self.parts.thread;
        self.parts.task.get_registers(thread, arch)
    }

    /// Terminates the thread, then releases its fault channel.
    /// Both steps are attempted; the first error is returned.
    pub fn terminate(self) -> Result<()> {
        let channel = self.state.channel;
        let Parts { task, thread, .. } = ScopeGuard::into_inner(self.parts);
        let terminated = task.terminate_thread(thread);
        let released = task.release_fault_channel(channel);
        debug!(?thread, "terminated remote thread");
        terminated.and(released)
    }
}

/// Tears down a context dropped before it was terminated.
fn abandon<T: TaskControl>(
    Parts {
        task,
        thread,
        channel,
    }: Parts<'_, T>,
) {
    warn!(?thread, "remote thread abandoned, terminating it");
    if let Err(err) = task.terminate_thread(thread) {
        warn!(?thread, %err, "failed to terminate abandoned remote thread");
    }
    if let Some(channel) = channel {
        if let Err(err) = task.release_fault_channel(channel) {
            warn!(?channel, %err, "failed to release fault channel");
        }
    }
}
