//! Privileged helper that performs injections on behalf of unprivileged clients.
//!
//! The service listens on a Unix-domain socket and handles one request at a time. It is started
//! on demand and exits after a period without requests.

use std::io::{BufReader, ErrorKind};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use scopeguard::{guard, ScopeGuard};
use serde_json::Value;
use tracing::{debug, info, info_span, warn};

use crate::injector::{Injector, LoaderHandle};
use crate::task::ProcessControl;
use crate::{Error, Result};

pub mod protocol;
pub mod scheduler;

pub use protocol::{InjectionReply, InjectionRequest};
pub use scheduler::Scheduler;

/// Performs one injection. Implemented by [`Injector`].
pub trait Inject {
    fn inject(&self, pid: Pid, payload: &Path) -> Result<LoaderHandle>;
}

impl<P: ProcessControl> Inject for Injector<P> {
    fn inject(&self, pid: Pid, payload: &Path) -> Result<LoaderHandle> {
        Injector::inject(self, pid, payload)
    }
}

/// Why [`Service::run`] returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceExit {
    /// No request arrived for the configured idle timeout.
    IdleTimeout,
}

pub struct Service<E: Inject> {
    listener: UnixListener,
    /// Removes the socket file when the service is dropped.
    socket_path: ScopeGuard<PathBuf, fn(PathBuf)>,
    engine: E,
    idle_timeout: Duration,
    scheduler: Scheduler,
}

impl<E: Inject> Service<E> {
    /// Listens on `socket_path`. A stale socket nobody listens on is replaced; any other file
    /// at that path is left alone and binding fails.
    pub fn bind(socket_path: &Path, engine: E, idle_timeout: Duration) -> Result<Self> {
        remove_stale_socket(socket_path)?;
        let listener = UnixListener::bind(socket_path).map_err(Error::Channel)?;
        info!(path = %socket_path.display(), ?idle_timeout, "listening");

        let mut scheduler = Scheduler::new();
        scheduler.rearm(idle_timeout);
        Ok(Self {
            listener,
            socket_path: guard(socket_path.to_path_buf(), remove_socket as fn(PathBuf)),
            engine,
            idle_timeout,
            scheduler,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Serves connections until the idle timer fires.
    pub fn run(&mut self) -> Result<ServiceExit> {
        loop {
            if self.scheduler.is_expired() {
                info!("idle timeout reached, exiting");
                return Ok(ServiceExit::IdleTimeout);
            }
            if !poll_wrapper(self.listener.as_raw_fd(), self.scheduler.remaining())? {
                continue;
            }
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.serve_connection(stream) {
                        warn!(%err, "dropping connection");
                    }
                }
                Err(err) => warn!(%err, "failed to accept connection"),
            }
        }
    }

    /// Answers requests on one connection until the peer closes it.
    fn serve_connection(&mut self, stream: UnixStream) -> Result<()> {
        let _log_guard = info_span!("connection").entered();
        stream
            .set_read_timeout(Some(self.idle_timeout))
            .map_err(Error::Channel)?;
        let mut writer = stream.try_clone().map_err(Error::Channel)?;
        let mut reader = BufReader::new(stream);

        loop {
            let message = match protocol::read_message::<Value, _>(&mut reader) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(Error::Channel(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    debug!("connection idle, closing it");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let reply = self.handle_request(&message);
            protocol::write_message(&mut writer, &reply)?;
        }
    }

    /// Validates and performs one request. Invalid requests never reach the engine.
    ///
    /// The idle timer is disarmed while the request is processed and rearmed afterwards.
    pub fn handle_request(&mut self, message: &Value) -> InjectionReply {
        self.scheduler.disarm();
        let reply = match InjectionRequest::from_value(message) {
            Ok(request) => {
                let _log_guard = info_span!("request", target = request.target).entered();
                match self
                    .engine
                    .inject(Pid::from_raw(request.target), &request.payload)
                {
                    Ok(handle) => {
                        info!(?handle, payload = %request.payload.display(), "injection succeeded");
                        InjectionReply::success()
                    }
                    Err(err) => {
                        warn!(%err, payload = %request.payload.display(), "injection failed");
                        InjectionReply::failure(err.failure_kind())
                    }
                }
            }
            Err(err) => {
                warn!(%err, "rejecting request");
                InjectionReply::failure(err.failure_kind())
            }
        };
        self.scheduler.rearm(self.idle_timeout);
        reply
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            if UnixStream::connect(path).is_err() {
                debug!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path).map_err(Error::Channel)?;
            }
            Ok(())
        }
        Ok(_) => Err(Error::Channel(std::io::Error::new(
            ErrorKind::AlreadyExists,
            "socket path is occupied by a file that is not a socket",
        ))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Channel(err)),
    }
}

fn remove_socket(path: PathBuf) {
    if let Err(err) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), %err, "failed to remove socket");
    }
}

/// Waits until `fd` is readable or `timeout` elapses. `None` waits indefinitely.
/// Returns whether the descriptor is readable; an interrupted wait counts as a timeout.
fn poll_wrapper(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    let timeout_ms = match timeout {
        None => -1,
        // Round up, so an almost expired timer does not spin.
        Some(timeout) => timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
    };
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pollfd` is a single valid entry.
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match Errno::result(ret) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(errno) => Err(Error::Channel(errno.into())),
    }
}
