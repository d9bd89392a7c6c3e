use tracing::{debug, info, warn};

use crate::injector::staging::{StagedPayload, COMPLETION, SENTINEL};
use crate::injector::{arm64, x86_64};
use crate::registers::{Architecture, RegisterSnapshot};
use crate::remote_context::{RemoteContext, Running};
use crate::task::{FaultReply, RemoteAddress, RuntimeSymbols, TaskControl};
use crate::{Error, Result};

/// Mode the loader opens the payload with: resolve now, keep symbols private.
pub const LOADER_MODE: u64 = (libc::RTLD_NOW | libc::RTLD_LOCAL) as u64;

/// Faults expected in a clean run: the sentinel rendezvous and the loader's return.
const EXPECTED_FAULTS: usize = 2;

/// Progress of the remote thread through the trampoline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopState {
    /// Thread is running the setup routine.
    AwaitingRendezvous,
    /// Thread was redirected into the loader.
    Dispatched,
    /// Loader returned into the completion address.
    Completed,
    /// Thread faulted somewhere other than the sentinel before the loader was dispatched.
    Aborted(RemoteAddress),
    /// Thread faulted inside the loader, before returning.
    Crashed(RemoteAddress),
}

/// Runs the loader on a new thread inside the task and returns the loader's result.
///
/// The remote thread is terminated before this function returns, whatever the outcome.
pub fn run<T: TaskControl>(
    task: &mut T,
    arch: Architecture,
    staged: &StagedPayload,
    symbols: &RuntimeSymbols,
) -> Result<u64> {
    let pid = task.pid();
    let registers = staged.frame(symbols.thread_setup).build(arch)?;

    info!(entry = ?symbols.thread_setup, "starting remote thread in setup routine");
    let context = RemoteContext::create(task)?
        .set_registers(&registers)?
        .intercept_faults(arch)?
        .resume()?;

    let (context, state, final_registers) = serve_faults(context, arch, symbols.loader_open)?;
    context.terminate()?;

    match state {
        LoopState::Completed => {
            let ret = final_registers.return_value();
            info!(ret = format_args!("0x{ret:x}"), "loader returned");
            Ok(ret)
        }
        LoopState::Aborted(ip) => Err(Error::TrampolineAborted(pid, ip)),
        LoopState::Crashed(ip) => Err(Error::LoaderCrashed(pid, ip)),
        LoopState::AwaitingRendezvous | LoopState::Dispatched => Err(Error::MalformedFault(
            "remote thread suspended without raising a fault",
        )),
    }
}

/// Answers faults of the remote thread until it is found suspended.
/// Returns the final loop state and the thread's registers at that point.
fn serve_faults<'a, T: TaskControl>(
    mut context: RemoteContext<'a, T, Running>,
    arch: Architecture,
    loader_open: RemoteAddress,
) -> Result<(RemoteContext<'a, T, Running>, LoopState, RegisterSnapshot)> {
    let mut state = LoopState::AwaitingRendezvous;
    let mut deliveries = 0;

    loop {
        let notification = context.receive_fault(arch)?;
        deliveries += 1;
        let ip = notification
            .state
            .as_ref()
            .map(RegisterSnapshot::instruction_pointer);
        debug!(exception = notification.exception, ?ip, deliveries, "remote thread faulted");

        match (state, notification.state.as_ref()) {
            (LoopState::AwaitingRendezvous, Some(incoming))
                if incoming.instruction_pointer() == SENTINEL =>
            {
                let outgoing = redirect_to_loader(incoming, loader_open);
                info!(loader = ?loader_open, "rendezvous reached, dispatching loader");
                context.reply_fault(&notification, FaultReply::Resume(outgoing))?;
                state = LoopState::Dispatched;
            }
            _ => {
                if deliveries > EXPECTED_FAULTS {
                    warn!(?ip, deliveries, "unexpected extra fault from remote thread");
                }
                context.suspend()?;
                context.reply_fault(&notification, FaultReply::DoNotResume)?;
                state = match state {
                    LoopState::AwaitingRendezvous => {
                        warn!(?ip, "remote thread faulted before rendezvous");
                        LoopState::Aborted(ip.unwrap_or_default())
                    }
                    LoopState::Dispatched if ip == Some(COMPLETION) => LoopState::Completed,
                    LoopState::Dispatched => {
                        warn!(?ip, "remote thread faulted inside the loader");
                        LoopState::Crashed(ip.unwrap_or_default())
                    }
                    settled => settled,
                };
            }
        }

        let suspend_count = context.suspend_count()?;
        if suspend_count > 0 {
            debug!(suspend_count, ?state, "remote thread suspended");
            let registers = context.registers(arch)?;
            return Ok((context, state, registers));
        }
    }
}

/// Turns the state captured at the rendezvous into a call of the loader with the staged path.
pub fn redirect_to_loader(
    incoming: &RegisterSnapshot,
    loader_open: RemoteAddress,
) -> RegisterSnapshot {
    match incoming {
        RegisterSnapshot::X86_64(regs) => {
            RegisterSnapshot::X86_64(x86_64::redirect_to_loader(regs, loader_open, LOADER_MODE))
        }
        RegisterSnapshot::Arm64(regs) => {
            RegisterSnapshot::Arm64(arm64::redirect_to_loader(regs, loader_open, LOADER_MODE))
        }
    }
}
