//! Wire format of the kernel's fault notifications.
//!
//! A thread whose exception behavior is "state + identity" reports each fault with an
//! `exception_raise_state_identity` request: a message header, port descriptors naming the
//! faulting thread and its task, the exception type and codes, and the thread state. The handler
//! answers with a reply carrying a status and, on success, the state the thread resumes with.
//!
//! Messages are handled as plain byte buffers in native byte order, so this module does not
//! depend on the host kernel.

use crate::registers::{Architecture, RegisterSnapshot};
use crate::task::{FaultNotification, ThreadHandle};
use crate::{Error, Result};

/// Message id of `exception_raise_state_identity` with 32-bit exception codes.
pub const RAISE_STATE_IDENTITY_ID: i32 = 2403;

/// Replies are identified by the request id plus this offset.
pub const REPLY_ID_OFFSET: i32 = 100;

/// Largest thread state a request may carry, in words.
pub const THREAD_STATE_MAX: usize = 1296;

/// Largest number of exception codes in a request.
pub const CODE_MAX: usize = 2;

/// Buffer size that fits any request this module accepts.
pub const REQUEST_BUFFER_SIZE: usize = REQUEST_FIXED_SIZE + 4 * (CODE_MAX + THREAD_STATE_MAX);

const HEADER_SIZE: usize = 24;
const NDR_RECORD: [u8; 8] = [0, 0, 0, 0, 1, 0, 0, 0];
/// Header, body, two port descriptors, NDR, exception, code count, flavor and state count.
const REQUEST_FIXED_SIZE: usize = HEADER_SIZE + 4 + 12 + 12 + 8 + 4 + 4 + 4 + 4;
/// Header, NDR, return code, flavor and state count.
const REPLY_FIXED_SIZE: usize = HEADER_SIZE + 8 + 4 + 4 + 4;
const MSGH_BITS_REMOTE_MASK: u32 = 0x1f;
const DESCRIPTOR_COUNT: u32 = 2;

/// Return code telling the kernel the fault was handled and the thread may resume.
pub const KERN_SUCCESS: i32 = 0;

/// Fixed part of every message.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageHeader {
    pub bits: u32,
    pub size: u32,
    pub remote_port: u32,
    pub local_port: u32,
    pub voucher_port: u32,
    pub id: i32,
}

/// A decoded `exception_raise_state_identity` request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionRequest {
    pub header: MessageHeader,
    pub thread: u32,
    pub task: u32,
    pub exception: i32,
    pub codes: Vec<i32>,
    pub flavor: i32,
    pub state: Vec<u32>,
}

/// An `exception_raise_state_identity` reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionReply {
    pub header: MessageHeader,
    pub ret_code: i32,
    pub flavor: i32,
    pub state: Vec<u32>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32> {
        let end = self.offset + 4;
        let word = self
            .bytes
            .get(self.offset..end)
            .ok_or(Error::MalformedFault("message is truncated"))?;
        self.offset = end;
        Ok(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        self.u32().map(|word| word as i32)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        if self.offset + len > self.bytes.len() {
            return Err(Error::MalformedFault("message is truncated"));
        }
        self.offset += len;
        Ok(())
    }

    fn header(&mut self) -> Result<MessageHeader> {
        Ok(MessageHeader {
            bits: self.u32()?,
            size: self.u32()?,
            remote_port: self.u32()?,
            local_port: self.u32()?,
            voucher_port: self.u32()?,
            id: self.i32()?,
        })
    }
}

fn put_header(out: &mut Vec<u8>, header: &MessageHeader) {
    for word in [
        header.bits,
        header.size,
        header.remote_port,
        header.local_port,
        header.voucher_port,
        header.id as u32,
    ] {
        out.extend_from_slice(&word.to_ne_bytes());
    }
}

fn put_u32(out: &mut Vec<u8>, word: u32) {
    out.extend_from_slice(&word.to_ne_bytes());
}

fn put_port_descriptor(out: &mut Vec<u8>, name: u32) {
    put_u32(out, name);
    put_u32(out, 0);
    // Padding, then `MACH_MSG_TYPE_MOVE_SEND` disposition and `MACH_MSG_PORT_DESCRIPTOR` type.
    out.extend_from_slice(&[0, 0, 17, 0]);
}

impl ExceptionRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, offset: 0 };
        let header = reader.header()?;
        if header.id != RAISE_STATE_IDENTITY_ID {
            return Err(Error::MalformedFault("unexpected message id"));
        }
        if reader.u32()? != DESCRIPTOR_COUNT {
            return Err(Error::MalformedFault("unexpected descriptor count"));
        }
        let thread = reader.u32()?;
        reader.skip(8)?;
        let task = reader.u32()?;
        reader.skip(8)?;
        reader.skip(NDR_RECORD.len())?;

        let exception = reader.i32()?;
        let code_count = reader.u32()? as usize;
        if code_count > CODE_MAX {
            return Err(Error::MalformedFault("too many exception codes"));
        }
        let codes = (0..code_count)
            .map(|_| reader.i32())
            .collect::<Result<Vec<_>>>()?;

        let flavor = reader.i32()?;
        let state_count = reader.u32()? as usize;
        if state_count > THREAD_STATE_MAX {
            return Err(Error::MalformedFault("thread state is too large"));
        }
        let state = (0..state_count)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            header,
            thread,
            task,
            exception,
            codes,
            flavor,
            state,
        })
    }

    /// Encodes the request the way the kernel sends it.
    pub fn encode(&self) -> Vec<u8> {
        let size = REQUEST_FIXED_SIZE + 4 * (self.codes.len() + self.state.len());
        let mut out = Vec::with_capacity(size);
        put_header(
            &mut out,
            &MessageHeader {
                size: size as u32,
                ..self.header
            },
        );
        put_u32(&mut out, DESCRIPTOR_COUNT);
        put_port_descriptor(&mut out, self.thread);
        put_port_descriptor(&mut out, self.task);
        out.extend_from_slice(&NDR_RECORD);
        put_u32(&mut out, self.exception as u32);
        put_u32(&mut out, self.codes.len() as u32);
        for code in &self.codes {
            put_u32(&mut out, *code as u32);
        }
        put_u32(&mut out, self.flavor as u32);
        put_u32(&mut out, self.state.len() as u32);
        for word in &self.state {
            put_u32(&mut out, *word);
        }
        out
    }

    /// Converts the request into a notification, parsing the state if it has `arch`'s flavor.
    pub fn notification(&self, arch: Architecture) -> FaultNotification {
        let state = if self.flavor == arch.thread_state_flavor() {
            RegisterSnapshot::from_words(arch, &self.state).ok()
        } else {
            None
        };
        FaultNotification {
            thread: ThreadHandle(self.thread),
            exception: self.exception,
            state,
            reply_port: self.header.remote_port,
        }
    }
}

impl ExceptionReply {
    /// Builds the reply to `request`. `state` is the thread state to resume with.
    pub fn answer(request: &MessageHeader, ret_code: i32, state: Option<&RegisterSnapshot>) -> Self {
        let (flavor, state) = match state {
            Some(snapshot) => (snapshot.architecture().thread_state_flavor(), snapshot.to_words()),
            None => (0, Vec::new()),
        };
        Self {
            header: MessageHeader {
                bits: request.bits & MSGH_BITS_REMOTE_MASK,
                size: (REPLY_FIXED_SIZE + 4 * state.len()) as u32,
                remote_port: request.remote_port,
                local_port: 0,
                voucher_port: 0,
                id: request.id + REPLY_ID_OFFSET,
            },
            ret_code,
            flavor,
            state,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPLY_FIXED_SIZE + 4 * self.state.len());
        put_header(&mut out, &self.header);
        out.extend_from_slice(&NDR_RECORD);
        put_u32(&mut out, self.ret_code as u32);
        put_u32(&mut out, self.flavor as u32);
        put_u32(&mut out, self.state.len() as u32);
        for word in &self.state {
            put_u32(&mut out, *word);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, offset: 0 };
        let header = reader.header()?;
        if header.id != RAISE_STATE_IDENTITY_ID + REPLY_ID_OFFSET {
            return Err(Error::MalformedFault("unexpected reply id"));
        }
        reader.skip(NDR_RECORD.len())?;
        let ret_code = reader.i32()?;
        let flavor = reader.i32()?;
        let state_count = reader.u32()? as usize;
        if state_count > THREAD_STATE_MAX {
            return Err(Error::MalformedFault("thread state is too large"));
        }
        let state = (0..state_count)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header,
            ret_code,
            flavor,
            state,
        })
    }
}
