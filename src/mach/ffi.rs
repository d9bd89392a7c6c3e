//! Kernel entry points not exported by `mach2`.

use libc::c_int;
use mach2::kern_return::kern_return_t;
use mach2::mach_types::thread_act_t;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;

use crate::task::KernReturn;
use crate::{Error, Result};

pub const THREAD_BASIC_INFO: c_int = 3;
/// Size of `thread_basic_info` in words.
pub const THREAD_BASIC_INFO_COUNT: mach_msg_type_number_t = 10;
/// Word index of `suspend_count` in `thread_basic_info`.
pub const SUSPEND_COUNT_INDEX: usize = 8;

extern "C" {
    pub fn thread_create(parent_task: mach_port_t, child_act: *mut thread_act_t) -> kern_return_t;

    pub fn thread_terminate(target_act: thread_act_t) -> kern_return_t;

    pub fn thread_info(
        target_act: thread_act_t,
        flavor: c_int,
        thread_info_out: *mut c_int,
        thread_info_out_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}

/// Converts the status of a kernel call into a [`Result`].
pub fn check(call: &'static str, ret: kern_return_t) -> Result<()> {
    match KernReturn(ret) {
        KernReturn::SUCCESS => Ok(()),
        err => Err(Error::Kernel(call, err)),
    }
}
