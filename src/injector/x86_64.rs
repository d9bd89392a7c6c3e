use crate::registers::{TrampolineFrame, X86_64Registers};
use crate::task::RemoteAddress;

/// Architecture-specific implementation. See documentation of [`TrampolineFrame::build`].
///
/// The thread starts in the setup routine with `rdi` as its argument. `rbx` is callee-saved, so
/// the path address is still there when the routine's `ret` pops the sentinel.
pub fn initial_registers(frame: &TrampolineFrame) -> X86_64Registers {
    X86_64Registers {
        rip: frame.entry_point.0,
        rsp: frame.stack_top.0,
        rbp: frame.stack_base.0,
        rdi: frame.thread_slot.0,
        rbx: frame.payload_path.0,
        ..Default::default()
    }
}

/// Rewrites the state captured at the sentinel fault into a call of the loader.
///
/// The sentinel has already been popped, so `rsp` points at the zero completion address and has
/// the alignment of a function entry. The loader returns into address 0 and faults there.
pub fn redirect_to_loader(
    incoming: &X86_64Registers,
    loader_open: RemoteAddress,
    mode: u64,
) -> X86_64Registers {
    X86_64Registers {
        rip: loader_open.0,
        rdi: incoming.rbx,
        rsi: mode,
        rsp: incoming.rsp,
        ..*incoming
    }
}
