use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nix::unistd::Pid;
use tracing::{error, info};

use dylib_injector::client::request_injection;

#[derive(Parser, Debug)]
struct Args {
    /// Pid to inject into
    pid: i32,

    /// Absolute path of the library to load
    payload: PathBuf,

    /// Socket of the injection service
    #[arg(short, long, default_value = "/var/run/dylib-injector.sock")]
    socket: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    match request_injection(&args.socket, Pid::from_raw(args.pid), &args.payload) {
        Ok(reply) if reply.status => {
            info!("payload loaded");
            ExitCode::SUCCESS
        }
        Ok(reply) => {
            error!(reason = ?reply.reason, "service refused or failed the injection");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(%err, "could not reach the service");
            ExitCode::FAILURE
        }
    }
}
