//! [`ProcessControl`] over the Mach kernel.

use mach2::exception_types::{EXCEPTION_STATE_IDENTITY, EXC_MASK_ALL};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_port::{
    mach_port_allocate, mach_port_deallocate, mach_port_insert_right, mach_port_mod_refs,
};
use mach2::mach_types::thread_act_t;
use mach2::message::{
    mach_msg, mach_msg_header_t, mach_msg_type_number_t, MACH_MSG_TIMEOUT_NONE,
    MACH_MSG_TYPE_MAKE_SEND, MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_name_t, mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::thread_act::{
    thread_get_state, thread_resume, thread_set_exception_ports, thread_set_state,
    thread_suspend,
};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_write};
use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::exception::{
    ExceptionReply, ExceptionRequest, MessageHeader, KERN_SUCCESS as REPLY_SUCCESS,
    RAISE_STATE_IDENTITY_ID, REQUEST_BUFFER_SIZE,
};
use crate::registers::{Architecture, RegisterSnapshot};
use crate::task::{
    FaultChannel, FaultNotification, FaultReply, KernReturn, ProcessArchitecture,
    ProcessControl, RemoteAddress, RuntimeSymbols, TaskControl, ThreadHandle,
};
use crate::{Error, Result};

mod ffi;

use ffi::check;

/// Process is 64-bit.
const P_LP64: u32 = 0x4;
/// Process runs under binary translation.
const P_TRANSLATED: u32 = 0x20000;
/// Size of `struct kinfo_proc` on 64-bit hosts.
const KINFO_PROC_SIZE: usize = 648;
/// Offset of `kp_proc.p_flag` in `struct kinfo_proc`.
const P_FLAG_OFFSET: usize = 32;

/// Room for the trailer the kernel appends to received messages.
const RECEIVE_TRAILER_SIZE: usize = 68;

/// Grants Mach task capabilities over processes of the host.
#[derive(Debug, Default)]
pub struct MachControl;

impl MachControl {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessControl for MachControl {
    type Task = MachTask;

    fn process_architecture(&self, pid: Pid) -> Result<ProcessArchitecture> {
        let flags = process_flags(pid)?;
        debug!(pid = pid.as_raw(), flags = format_args!("0x{flags:x}"), "inspected target");
        Ok(classify_process_flags(flags))
    }

    fn task_for_pid(&self, pid: Pid) -> Result<MachTask> {
        let mut port: mach_port_name_t = MACH_PORT_NULL;
        // SAFETY: `port` is a valid location for the returned name.
        let ret = unsafe { task_for_pid(mach_task_self(), pid.as_raw(), &mut port) };
        if ret != KERN_SUCCESS {
            return Err(Error::CapabilityDenied(KernReturn(ret), pid));
        }
        Ok(MachTask {
            pid,
            port,
            pending_replies: Vec::new(),
        })
    }

    fn runtime_symbols(&self) -> Result<RuntimeSymbols> {
        // Both routines live in the shared system libraries, which are mapped at the same
        // address in every process of the same architecture.
        // SAFETY: The symbol name is a valid NUL-terminated string.
        let thread_setup = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"_pthread_set_self".as_ptr()) };
        if thread_setup.is_null() {
            return Err(Error::MissingSymbol("_pthread_set_self"));
        }
        Ok(RuntimeSymbols {
            thread_setup: RemoteAddress(thread_setup as u64),
            loader_open: RemoteAddress(libc::dlopen as usize as u64),
        })
    }
}

/// Reads `p_flag` of the process with given pid.
fn process_flags(pid: Pid) -> Result<u32> {
    let mut mib = [
        libc::CTL_KERN,
        libc::KERN_PROC,
        libc::KERN_PROC_PID,
        pid.as_raw(),
    ];
    let mut info = [0u8; KINFO_PROC_SIZE];
    let mut size = info.len();
    // SAFETY: `info` is writable for `size` bytes, `mib` holds `mib.len()` entries.
    let ret = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            info.as_mut_ptr().cast(),
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret != 0 {
        return Err(Error::ProcessInfo(std::io::Error::last_os_error(), pid));
    }
    // No process with that pid.
    if size == 0 {
        return Err(Error::ProcessInfo(
            std::io::Error::from_raw_os_error(libc::ESRCH),
            pid,
        ));
    }
    let flag = &info[P_FLAG_OFFSET..P_FLAG_OFFSET + 4];
    Ok(u32::from_ne_bytes([flag[0], flag[1], flag[2], flag[3]]))
}

fn classify_process_flags(flags: u32) -> ProcessArchitecture {
    if flags & P_LP64 == 0 {
        ProcessArchitecture::Legacy32
    } else if flags & P_TRANSLATED != 0 {
        ProcessArchitecture::Translated
    } else {
        ProcessArchitecture::Native
    }
}

/// Send right to a foreign task, deallocated on drop.
#[derive(Debug)]
pub struct MachTask {
    pid: Pid,
    port: mach_port_t,
    /// Reply rights of faults answered with [`FaultReply::DoNotResume`]. They are held until
    /// their channel is released, as destroying one lets the kernel resume the thread.
    pending_replies: Vec<(FaultChannel, mach_port_t)>,
}

impl MachTask {
    fn release_name(&self, name: mach_port_name_t) {
        // SAFETY: There are no preconditions for the safety of this call.
        let ret = unsafe { mach_port_deallocate(mach_task_self(), name) };
        if let Err(err) = check("mach_port_deallocate", ret) {
            warn!(name, %err, "failed to release port name");
        }
    }

    fn send(&self, message: &[u8]) -> Result<()> {
        // `mach_msg` wants a header-aligned buffer.
        let mut words: Vec<u32> = message
            .chunks_exact(4)
            .map(|word| u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
            .collect();
        // SAFETY: `words` holds a complete message of `message.len()` bytes, starting with a
        // header.
        let ret = unsafe {
            mach_msg(
                words.as_mut_ptr().cast::<mach_msg_header_t>(),
                MACH_SEND_MSG,
                message.len() as u32,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        check("mach_msg", ret)
    }
}

impl Drop for MachTask {
    fn drop(&mut self) {
        for (_, reply_port) in std::mem::take(&mut self.pending_replies) {
            self.release_name(reply_port);
        }
        self.release_name(self.port);
    }
}

impl TaskControl for MachTask {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn allocate(&mut self, size: usize) -> Result<RemoteAddress> {
        let mut address: mach_vm_address_t = 0;
        // SAFETY: `address` is a valid location for the returned address.
        let ret = unsafe {
            mach_vm_allocate(
                self.port,
                &mut address,
                size as mach_vm_size_t,
                VM_FLAGS_ANYWHERE,
            )
        };
        check("mach_vm_allocate", ret)?;
        Ok(RemoteAddress(address))
    }

    fn write_memory(&mut self, address: RemoteAddress, data: &[u8]) -> Result<()> {
        // SAFETY: `data` is readable for `data.len()` bytes.
        let ret = unsafe {
            mach_vm_write(
                self.port,
                address.0,
                data.as_ptr() as usize,
                data.len() as mach_msg_type_number_t,
            )
        };
        check("mach_vm_write", ret)
    }

    fn deallocate(&mut self, address: RemoteAddress, size: usize) -> Result<()> {
        // SAFETY: The region belongs to the foreign task, nothing in this process refers to it.
        let ret = unsafe { mach_vm_deallocate(self.port, address.0, size as mach_vm_size_t) };
        check("mach_vm_deallocate", ret)
    }

    fn create_thread(&mut self) -> Result<ThreadHandle> {
        let mut thread: thread_act_t = MACH_PORT_NULL;
        // SAFETY: `thread` is a valid location for the returned name.
        let ret = unsafe { ffi::thread_create(self.port, &mut thread) };
        check("thread_create", ret)?;
        Ok(ThreadHandle(thread))
    }

    fn get_registers(
        &mut self,
        thread: ThreadHandle,
        arch: Architecture,
    ) -> Result<RegisterSnapshot> {
        let mut words = vec![0u32; arch.thread_state_words()];
        let mut count = words.len() as mach_msg_type_number_t;
        // SAFETY: `words` is writable for `count` words.
        let ret = unsafe {
            thread_get_state(
                thread.0,
                arch.thread_state_flavor(),
                words.as_mut_ptr(),
                &mut count,
            )
        };
        check("thread_get_state", ret)?;
        RegisterSnapshot::from_words(arch, &words[..count as usize])
    }

    fn set_registers(&mut self, thread: ThreadHandle, registers: &RegisterSnapshot) -> Result<()> {
        let mut words = registers.to_words();
        // SAFETY: `words` is readable for its length. The kernel does not write through it.
        let ret = unsafe {
            thread_set_state(
                thread.0,
                registers.architecture().thread_state_flavor(),
                words.as_mut_ptr(),
                words.len() as mach_msg_type_number_t,
            )
        };
        check("thread_set_state", ret)
    }

    fn install_fault_channel(
        &mut self,
        thread: ThreadHandle,
        arch: Architecture,
    ) -> Result<FaultChannel> {
        let mut port: mach_port_name_t = MACH_PORT_NULL;
        // SAFETY: `port` is a valid location for the returned name.
        let ret = unsafe {
            mach_port_allocate(mach_task_self(), MACH_PORT_RIGHT_RECEIVE, &mut port)
        };
        check("mach_port_allocate", ret)?;
        let channel = FaultChannel(port);

        // SAFETY: `port` names a receive right just allocated in this task.
        let ret = unsafe {
            mach_port_insert_right(mach_task_self(), port, port, MACH_MSG_TYPE_MAKE_SEND)
        };
        let installed = check("mach_port_insert_right", ret).and_then(|()| {
            // SAFETY: There are no preconditions for the safety of this call.
            let ret = unsafe {
                thread_set_exception_ports(
                    thread.0,
                    EXC_MASK_ALL,
                    port,
                    EXCEPTION_STATE_IDENTITY as _,
                    arch.thread_state_flavor(),
                )
            };
            check("thread_set_exception_ports", ret)
        });
        if let Err(err) = installed {
            self.release_fault_channel(channel).ok();
            return Err(err);
        }
        Ok(channel)
    }

    fn resume_thread(&mut self, thread: ThreadHandle) -> Result<()> {
        // SAFETY: There are no preconditions for the safety of this call.
        check("thread_resume", unsafe { thread_resume(thread.0) })
    }

    fn suspend_thread(&mut self, thread: ThreadHandle) -> Result<()> {
        // SAFETY: There are no preconditions for the safety of this call.
        check("thread_suspend", unsafe { thread_suspend(thread.0) })
    }

    fn suspend_count(&mut self, thread: ThreadHandle) -> Result<u32> {
        let mut info = [0 as libc::c_int; ffi::THREAD_BASIC_INFO_COUNT as usize];
        let mut count = ffi::THREAD_BASIC_INFO_COUNT;
        // SAFETY: `info` is writable for `count` words.
        let ret = unsafe {
            ffi::thread_info(
                thread.0,
                ffi::THREAD_BASIC_INFO,
                info.as_mut_ptr(),
                &mut count,
            )
        };
        check("thread_info", ret)?;
        Ok(info[ffi::SUSPEND_COUNT_INDEX] as u32)
    }

    fn terminate_thread(&mut self, thread: ThreadHandle) -> Result<()> {
        // SAFETY: The thread was created by the engine and runs nothing the target relies on.
        check("thread_terminate", unsafe {
            ffi::thread_terminate(thread.0)
        })?;
        self.release_name(thread.0);
        Ok(())
    }

    fn receive_fault(
        &mut self,
        channel: FaultChannel,
        arch: Architecture,
    ) -> Result<FaultNotification> {
        let mut buffer = vec![0u32; (REQUEST_BUFFER_SIZE + RECEIVE_TRAILER_SIZE).div_ceil(4)];
        // SAFETY: `buffer` is header-aligned and writable for the size passed.
        let ret = unsafe {
            mach_msg(
                buffer.as_mut_ptr().cast::<mach_msg_header_t>(),
                MACH_RCV_MSG,
                0,
                (buffer.len() * 4) as u32,
                channel.0,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        check("mach_msg", ret)?;

        let bytes: Vec<u8> = buffer.iter().flat_map(|word| word.to_ne_bytes()).collect();
        let request = ExceptionRequest::decode(&bytes)?;
        // The message carries its own references to the thread and task.
        self.release_name(request.task);
        self.release_name(request.thread);
        Ok(request.notification(arch))
    }

    fn reply_fault(
        &mut self,
        channel: FaultChannel,
        notification: &FaultNotification,
        reply: FaultReply,
    ) -> Result<()> {
        match reply {
            FaultReply::Resume(state) => {
                let request = MessageHeader {
                    bits: MACH_MSG_TYPE_MOVE_SEND_ONCE,
                    remote_port: notification.reply_port,
                    id: RAISE_STATE_IDENTITY_ID,
                    ..Default::default()
                };
                let reply = ExceptionReply::answer(&request, REPLY_SUCCESS, Some(&state));
                self.send(&reply.encode())
            }
            FaultReply::DoNotResume => {
                self.pending_replies.push((channel, notification.reply_port));
                Ok(())
            }
        }
    }

    fn release_fault_channel(&mut self, channel: FaultChannel) -> Result<()> {
        let (pending, kept) = std::mem::take(&mut self.pending_replies)
            .into_iter()
            .partition::<Vec<_>, _>(|(owner, _)| *owner == channel);
        self.pending_replies = kept;
        for (_, reply_port) in pending {
            self.release_name(reply_port);
        }

        // SAFETY: There are no preconditions for the safety of this call.
        let ret = unsafe {
            mach_port_mod_refs(mach_task_self(), channel.0, MACH_PORT_RIGHT_RECEIVE, -1)
        };
        let receive = check("mach_port_mod_refs", ret);
        // SAFETY: There are no preconditions for the safety of this call.
        let ret = unsafe { mach_port_deallocate(mach_task_self(), channel.0) };
        let send = check("mach_port_deallocate", ret);
        receive.and(send)
    }
}
