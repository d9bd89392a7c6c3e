//! Requesting injections from a running service.

use std::io::{BufReader, ErrorKind};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::unistd::Pid;
use tracing::debug;

use crate::service::protocol::{read_message, write_message};
use crate::service::{InjectionReply, InjectionRequest};
use crate::{Error, Result};

/// Asks the service listening on `socket` to load `payload` into process `pid`, and waits for
/// its reply.
pub fn request_injection(socket: &Path, pid: Pid, payload: &Path) -> Result<InjectionReply> {
    let mut stream = UnixStream::connect(socket).map_err(Error::Channel)?;
    let request = InjectionRequest {
        target: pid.as_raw(),
        payload: payload.to_path_buf(),
    };
    write_message(&mut stream, &request)?;
    debug!(?request, "sent injection request");

    let mut reader = BufReader::new(stream);
    read_message(&mut reader)?.ok_or_else(|| {
        Error::Channel(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "service closed the connection without replying",
        ))
    })
}
