use crate::registers::{Arm64Registers, TrampolineFrame};
use crate::task::RemoteAddress;

/// Register holding the path address across the setup routine. Callee-saved.
const PATH_REGISTER: usize = 19;

/// Architecture-specific implementation. See documentation of [`TrampolineFrame::build`].
///
/// The sentinel is the link register, so the setup routine's `ret` branches straight into it.
pub fn initial_registers(frame: &TrampolineFrame) -> Arm64Registers {
    let mut regs = Arm64Registers {
        pc: frame.entry_point.0,
        sp: frame.stack_top.0,
        fp: frame.stack_base.0,
        lr: frame.sentinel.0,
        ..Default::default()
    };
    regs.x[0] = frame.thread_slot.0;
    regs.x[PATH_REGISTER] = frame.payload_path.0;
    regs
}

/// Rewrites the state captured at the sentinel fault into a call of the loader.
///
/// `lr` is cleared so the loader returns into address 0 rather than into the sentinel again.
pub fn redirect_to_loader(
    incoming: &Arm64Registers,
    loader_open: RemoteAddress,
    mode: u64,
) -> Arm64Registers {
    let mut regs = *incoming;
    regs.pc = loader_open.0;
    regs.lr = 0;
    regs.sp = incoming.sp;
    regs.x[0] = incoming.x[PATH_REGISTER];
    regs.x[1] = mode;
    regs
}
