use std::process;
use std::thread::sleep;
use std::time::Duration;

#[cfg(target_os = "macos")]
extern "C" {
    fn _dyld_image_count() -> u32;
}

/// Number of images the dynamic loader has mapped into this process.
#[cfg(target_os = "macos")]
fn loaded_images() -> u32 {
    // SAFETY: There are no preconditions for the safety of this call.
    unsafe { _dyld_image_count() }
}

#[cfg(not(target_os = "macos"))]
fn loaded_images() -> u32 {
    0
}

fn main() {
    let pid = process::id();

    loop {
        println!("pid = {pid}, images = {}", loaded_images());
        sleep(Duration::from_secs(1));
    }
}
