use std::ffi::CStr;

use tracing::{debug, warn};

use crate::registers::TrampolineFrame;
use crate::task::{RemoteAddress, TaskControl};
use crate::Result;

/// Bytes reserved for the remote thread's stack, below the trailer.
pub const STACK_SIZE: usize = 25 * 1024;

/// Return address planted for the setup routine. Never mapped in any process.
pub const SENTINEL: RemoteAddress = RemoteAddress(0xabad1dea);

/// Return address of the loader. A fault here means the loader returned.
pub const COMPLETION: RemoteAddress = RemoteAddress(0);

/// Words written at the top of the stack: the sentinel, then the loader's return address.
const TRAILER: [u64; 2] = [SENTINEL.0, COMPLETION.0];

/// What a staged region holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionPurpose {
    Path,
    Stack,
}

/// A block of memory the engine owns inside the target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RemoteRegion {
    pub address: RemoteAddress,
    pub size: usize,
    pub purpose: RegionPurpose,
}

impl RemoteRegion {
    fn allocate<T: TaskControl>(task: &mut T, size: usize, purpose: RegionPurpose) -> Result<Self> {
        let address = task.allocate(size)?;
        debug!(?address, size, ?purpose, "allocated remote region");
        Ok(Self {
            address,
            size,
            purpose,
        })
    }

    /// Writes `data` at `offset` into the region. On failure the region is released.
    fn fill<T: TaskControl>(self, task: &mut T, offset: usize, data: &[u8]) -> Result<Self> {
        match task.write_memory(self.address.offset(offset as u64), data) {
            Ok(()) => Ok(self),
            Err(err) => {
                self.release_quietly(task);
                Err(err)
            }
        }
    }

    pub fn release<T: TaskControl>(self, task: &mut T) -> Result<()> {
        task.deallocate(self.address, self.size)?;
        debug!(address = ?self.address, size = self.size, purpose = ?self.purpose, "released remote region");
        Ok(())
    }

    fn release_quietly<T: TaskControl>(self, task: &mut T) {
        if let Err(err) = self.release(task) {
            warn!(address = ?self.address, %err, "failed to release remote region");
        }
    }
}

/// The payload path and synthetic stack, staged inside the target.
#[derive(Debug)]
pub struct StagedPayload {
    pub path: RemoteRegion,
    pub stack: RemoteRegion,
}

impl StagedPayload {
    /// Copies `payload_path` into the task and prepares a stack whose top holds the sentinel.
    /// Any region already staged is released if a later step fails.
    pub fn stage<T: TaskControl>(task: &mut T, payload_path: &CStr) -> Result<Self> {
        let path_bytes = payload_path.to_bytes_with_nul();
        let path = RemoteRegion::allocate(task, path_bytes.len(), RegionPurpose::Path)?
            .fill(task, 0, path_bytes)?;

        let trailer: Vec<u8> = TRAILER.iter().flat_map(|word| word.to_ne_bytes()).collect();
        let stack = RemoteRegion::allocate(task, STACK_SIZE + trailer.len(), RegionPurpose::Stack)
            .and_then(|stack| stack.fill(task, STACK_SIZE, &trailer));
        match stack {
            Ok(stack) => Ok(Self { path, stack }),
            Err(err) => {
                path.release_quietly(task);
                Err(err)
            }
        }
    }

    /// Layout of the remote thread's initial frame over the staged regions.
    pub fn frame(&self, entry_point: RemoteAddress) -> TrampolineFrame {
        TrampolineFrame {
            stack_base: self.stack.address,
            stack_top: self.stack.address.offset(STACK_SIZE as u64),
            thread_slot: self.stack.address,
            payload_path: self.path.address,
            entry_point,
            sentinel: SENTINEL,
        }
    }

    /// Releases both regions. Both are attempted; the first error is returned.
    pub fn release<T: TaskControl>(self, task: &mut T) -> Result<()> {
        let path = self.path.release(task);
        let stack = self.stack.release(task);
        path.and(stack)
    }
}
