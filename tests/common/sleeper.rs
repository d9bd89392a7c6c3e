use std::process::{Child, Command, Stdio};

use nix::unistd::Pid;

/// A process that sleeps until it is dropped. Dropping kills and reaps it.
pub struct SleepingChild {
    child: Child,
}

impl SleepingChild {
    pub fn spawn() -> Self {
        let child = Command::new("/bin/sleep")
            .arg("600")
            .stdin(Stdio::null())
            .spawn()
            .expect("failed to spawn sleeper");
        Self { child }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

impl Drop for SleepingChild {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}
