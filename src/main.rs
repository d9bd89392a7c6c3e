use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

/// Privileged helper that loads libraries into running processes on request.
#[derive(Parser, Debug)]
struct Args {
    /// Path of the socket to listen on
    #[arg(long, default_value = "/var/run/dylib-injector.sock")]
    socket: PathBuf,

    /// Seconds without a request after which the service exits
    #[arg(long, default_value_t = 10)]
    idle_timeout: u64,
}

#[cfg(target_os = "macos")]
fn serve(args: &Args) -> dylib_injector::Result<()> {
    use std::time::Duration;

    use dylib_injector::mach::MachControl;
    use dylib_injector::service::{Service, ServiceExit};
    use dylib_injector::Injector;

    let engine = Injector::new(MachControl::new())?;
    let mut service = Service::bind(
        &args.socket,
        engine,
        Duration::from_secs(args.idle_timeout),
    )?;
    match service.run()? {
        ServiceExit::IdleTimeout => Ok(()),
    }
}

#[cfg(not(target_os = "macos"))]
fn serve(_args: &Args) -> dylib_injector::Result<()> {
    Err(dylib_injector::Error::UnsupportedPlatform)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "service failed");
            ExitCode::FAILURE
        }
    }
}
