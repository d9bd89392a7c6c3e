#![allow(dead_code)]

pub mod fake_task;
#[cfg(target_os = "macos")]
pub mod sleeper;
