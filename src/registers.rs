//! Architecture-specific register snapshots of a remote thread.

use std::fmt::{Debug, Formatter};
use std::mem::size_of;

use crate::task::RemoteAddress;
use crate::{Error, Result};

/// Register width and calling convention the engine can drive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Architecture {
    X86_64,
    Arm64,
}

impl Architecture {
    /// Architecture of the running process, if the engine supports it.
    pub fn native() -> Option<Architecture> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Arm64)
        } else {
            None
        }
    }

    /// Kernel thread-state flavor for this architecture's 64-bit general-purpose registers.
    pub fn thread_state_flavor(self) -> i32 {
        match self {
            Architecture::X86_64 => 4,
            Architecture::Arm64 => 6,
        }
    }

    /// Size of the thread state in 32-bit words, as counted by the kernel.
    pub fn thread_state_words(self) -> usize {
        match self {
            Architecture::X86_64 => size_of::<X86_64Registers>() / size_of::<u32>(),
            Architecture::Arm64 => size_of::<Arm64Registers>() / size_of::<u32>(),
        }
    }
}

/// 64-bit x86 general-purpose registers, laid out as the kernel's thread state.
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct X86_64Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

impl Debug for X86_64Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X86_64Registers")
            .field("rip", &format_args!("0x{:x}", self.rip))
            .field("rsp", &format_args!("0x{:x}", self.rsp))
            .field("rbp", &format_args!("0x{:x}", self.rbp))
            .field("rax", &format_args!("0x{:x}", self.rax))
            .field("rbx", &format_args!("0x{:x}", self.rbx))
            .field("rdi", &format_args!("0x{:x}", self.rdi))
            .field("rsi", &format_args!("0x{:x}", self.rsi))
            .finish_non_exhaustive()
    }
}

/// 64-bit ARM general-purpose registers, laid out as the kernel's thread state.
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct Arm64Registers {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub pad: u32,
}

impl Debug for Arm64Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arm64Registers")
            .field("pc", &format_args!("0x{:x}", self.pc))
            .field("sp", &format_args!("0x{:x}", self.sp))
            .field("lr", &format_args!("0x{:x}", self.lr))
            .field("fp", &format_args!("0x{:x}", self.fp))
            .field("x0", &format_args!("0x{:x}", self.x[0]))
            .field("x1", &format_args!("0x{:x}", self.x[1]))
            .field("x19", &format_args!("0x{:x}", self.x[19]))
            .finish_non_exhaustive()
    }
}

/// Full register state of a remote thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterSnapshot {
    X86_64(X86_64Registers),
    Arm64(Arm64Registers),
}

impl RegisterSnapshot {
    pub fn architecture(&self) -> Architecture {
        match self {
            RegisterSnapshot::X86_64(_) => Architecture::X86_64,
            RegisterSnapshot::Arm64(_) => Architecture::Arm64,
        }
    }

    pub fn instruction_pointer(&self) -> RemoteAddress {
        match self {
            RegisterSnapshot::X86_64(regs) => RemoteAddress(regs.rip),
            RegisterSnapshot::Arm64(regs) => RemoteAddress(regs.pc),
        }
    }

    pub fn stack_pointer(&self) -> RemoteAddress {
        match self {
            RegisterSnapshot::X86_64(regs) => RemoteAddress(regs.rsp),
            RegisterSnapshot::Arm64(regs) => RemoteAddress(regs.sp),
        }
    }

    /// Value of the register holding a function's return value.
    pub fn return_value(&self) -> u64 {
        match self {
            RegisterSnapshot::X86_64(regs) => regs.rax,
            RegisterSnapshot::Arm64(regs) => regs.x[0],
        }
    }

    /// Serializes the snapshot into the 32-bit words the kernel exchanges.
    pub fn to_words(&self) -> Vec<u32> {
        let quads: Vec<u64> = match self {
            RegisterSnapshot::X86_64(regs) => vec![
                regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rdi, regs.rsi, regs.rbp, regs.rsp,
                regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15,
                regs.rip, regs.rflags, regs.cs, regs.fs, regs.gs,
            ],
            RegisterSnapshot::Arm64(regs) => {
                let mut quads = regs.x.to_vec();
                quads.extend_from_slice(&[regs.fp, regs.lr, regs.sp, regs.pc]);
                quads.push((regs.cpsr as u64) | ((regs.pad as u64) << 32));
                quads
            }
        };
        quads
            .into_iter()
            .flat_map(|quad| [quad as u32, (quad >> 32) as u32])
            .collect()
    }

    /// Parses kernel thread-state words for the given architecture.
    pub fn from_words(arch: Architecture, words: &[u32]) -> Result<RegisterSnapshot> {
        if words.len() != arch.thread_state_words() {
            return Err(Error::InvalidRegisters("thread state has unexpected word count"));
        }
        let mut quads = words
            .chunks_exact(2)
            .map(|pair| (pair[0] as u64) | ((pair[1] as u64) << 32));
        // The length check above guarantees enough quads for every field.
        let mut next = || quads.next().unwrap_or_default();

        Ok(match arch {
            Architecture::X86_64 => RegisterSnapshot::X86_64(X86_64Registers {
                rax: next(),
                rbx: next(),
                rcx: next(),
                rdx: next(),
                rdi: next(),
                rsi: next(),
                rbp: next(),
                rsp: next(),
                r8: next(),
                r9: next(),
                r10: next(),
                r11: next(),
                r12: next(),
                r13: next(),
                r14: next(),
                r15: next(),
                rip: next(),
                rflags: next(),
                cs: next(),
                fs: next(),
                gs: next(),
            }),
            Architecture::Arm64 => {
                let mut regs = Arm64Registers::default();
                for x in regs.x.iter_mut() {
                    *x = next();
                }
                regs.fp = next();
                regs.lr = next();
                regs.sp = next();
                regs.pc = next();
                let flags = next();
                regs.cpsr = flags as u32;
                regs.pad = (flags >> 32) as u32;
                RegisterSnapshot::Arm64(regs)
            }
        })
    }
}

/// Layout of the synthetic frame a fresh remote thread starts on.
///
/// This is the only way to build the initial [`RegisterSnapshot`] of a remote thread, so every
/// snapshot handed to a new thread has been checked against the staged regions.
#[derive(Copy, Clone, Debug)]
pub struct TrampolineFrame {
    /// Lowest address of the synthetic stack region.
    pub stack_base: RemoteAddress,
    /// Initial stack pointer. Points at the planted sentinel return address.
    pub stack_top: RemoteAddress,
    /// Scratch thread-identity structure passed to the entry point.
    pub thread_slot: RemoteAddress,
    /// Staged payload path.
    pub payload_path: RemoteAddress,
    /// Trusted thread-setup entry point.
    pub entry_point: RemoteAddress,
    /// Address the entry point will fault on when it returns.
    pub sentinel: RemoteAddress,
}

impl TrampolineFrame {
    pub const STACK_ALIGNMENT: u64 = 16;

    /// Validates the frame and builds the initial register snapshot for `arch`.
    pub fn build(&self, arch: Architecture) -> Result<RegisterSnapshot> {
        if self.entry_point.0 == 0 || self.payload_path.0 == 0 || self.thread_slot.0 == 0 {
            return Err(Error::InvalidRegisters("trampoline frame has a null address"));
        }
        if self.stack_top <= self.stack_base {
            return Err(Error::InvalidRegisters("stack top is not above stack base"));
        }
        if self.stack_top.0 % Self::STACK_ALIGNMENT != 0 {
            return Err(Error::InvalidRegisters("stack top is misaligned"));
        }

        Ok(match arch {
            Architecture::X86_64 => {
                RegisterSnapshot::X86_64(crate::injector::x86_64::initial_registers(self))
            }
            Architecture::Arm64 => {
                RegisterSnapshot::Arm64(crate::injector::arm64::initial_registers(self))
            }
        })
    }
}
