//! Messages exchanged with the service: one JSON object per line.

use std::io::{BufRead, ErrorKind, Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, FailureKind, Result};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InjectionRequest {
    /// Pid of the process to inject into.
    pub target: i32,
    /// Absolute path of the library to load.
    pub payload: PathBuf,
}

impl InjectionRequest {
    /// Extracts a request from a decoded message. Missing or mistyped fields, a non-positive
    /// pid and an empty path are all invalid requests.
    pub fn from_value(value: &Value) -> Result<Self> {
        let target = value
            .get("target")
            .and_then(Value::as_i64)
            .ok_or(Error::InvalidRequest("`target` must be an integer"))?;
        let target = i32::try_from(target)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or(Error::InvalidRequest("`target` must be a positive pid"))?;
        let payload = value
            .get("payload")
            .and_then(Value::as_str)
            .filter(|payload| !payload.is_empty())
            .ok_or(Error::InvalidRequest("`payload` must be a non-empty path"))?;
        Ok(Self {
            target,
            payload: PathBuf::from(payload),
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InjectionReply {
    pub status: bool,
    /// Why the injection failed. Never present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureKind>,
}

impl InjectionReply {
    pub fn success() -> Self {
        Self {
            status: true,
            reason: None,
        }
    }

    pub fn failure(reason: FailureKind) -> Self {
        Self {
            status: false,
            reason: Some(reason),
        }
    }
}

/// Longest message accepted, newline included.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Reads one message. Returns `None` once the peer closed the connection.
/// A line longer than [`MAX_MESSAGE_SIZE`] is a channel error; nothing past the limit is read.
pub fn read_message<T: DeserializeOwned, R: BufRead>(reader: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    let read = reader
        .by_ref()
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_line(&mut line)
        .map_err(Error::Channel)?;
    if read == 0 {
        return Ok(None);
    }
    if read > MAX_MESSAGE_SIZE {
        return Err(Error::Channel(std::io::Error::new(
            ErrorKind::InvalidData,
            "message exceeds size limit",
        )));
    }
    Ok(Some(serde_json::from_str(&line)?))
}

pub fn write_message<T: Serialize, W: Write>(writer: &mut W, message: &T) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).map_err(Error::Channel)?;
    writer.flush().map_err(Error::Channel)
}
