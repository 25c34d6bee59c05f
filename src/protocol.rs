//! Relay wire protocol.
//!
//! Every message is one frame: a little-endian `u32` payload length followed
//! by a JSON payload. File descriptors belonging to a frame travel as
//! `SCM_RIGHTS` ancillary data attached to the frame's first bytes, so a
//! receiver collects them while reading the length prefix.
//!
//! The protocol is strictly request/response; every `Request` is answered by
//! exactly one `Response`.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RelayError, Result};
use crate::event::{EventFlags, RelayEvent};
use crate::power::PowerState;

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Most descriptors carried by one frame (an export of four planes plus
/// headroom).
pub const MAX_FDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Consumer
    Configure { width: i32, height: i32, refresh: i32 },
    Wait,
    Export,

    // Producer
    /// Carries exactly one descriptor.
    RegisterExternalBuffer,
    ReleaseHandle { handle: u32 },
    AddFramebuffer { handles: Vec<u32> },
    RemoveFramebuffer { id: u32 },
    PageFlip { id: u32 },
    SetCrtc { id: Option<u32> },
    /// Block until the VBlank after `sequence`, or after the current one.
    WaitVblank { sequence: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changed: Option<bool>,
    },
    Event {
        flags: u32,
        power: PowerState,
    },
    /// Followed by one descriptor per `true` in `valid`, in order.
    Exported {
        id: u32,
        count: usize,
        valid: Vec<bool>,
    },
    Handle {
        handle: u32,
    },
    Framebuffer {
        id: u32,
    },
    /// VBlank sequence reached.
    Vblank {
        sequence: u64,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl Response {
    pub fn ack() -> Self {
        Response::Ack { changed: None }
    }

    pub fn event(event: RelayEvent) -> Self {
        Response::Event {
            flags: event.flags.bits(),
            power: event.power,
        }
    }

    pub fn error(err: &RelayError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Turn an `Error` reply back into a `RelayError`.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Response::Error { kind, message } => Err(RelayError::from_wire(&kind, message)),
            other => Ok(other),
        }
    }

    /// Decode an `Event` reply.
    pub fn into_event(self) -> Result<RelayEvent> {
        match self.into_result()? {
            Response::Event { flags, power } => Ok(RelayEvent {
                flags: EventFlags::from_bits_truncate(flags),
                power,
            }),
            other => Err(unexpected(&other)),
        }
    }
}

pub(crate) fn unexpected(response: &Response) -> RelayError {
    RelayError::Protocol(format!("unexpected reply: {response:?}"))
}

/// Write one frame, attaching `fds` to it.
pub fn send_frame<T: Serialize>(
    stream: &UnixStream,
    msg: &T,
    fds: &[BorrowedFd<'_>],
) -> Result<()> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RelayError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    if fds.len() > MAX_FDS {
        return Err(RelayError::Protocol(format!("{} fds exceed limit", fds.len())));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);

    let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
    let iov = [IoSlice::new(&frame)];

    let sent = loop {
        match socket::sendmsg::<()>(
            stream.as_raw_fd(),
            &iov,
            if raw_fds.is_empty() { &[] } else { &cmsgs },
            MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Ok(sent) => break sent,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    };

    // The descriptors went out with the first chunk; the rest is plain bytes.
    if sent < frame.len() {
        (&*stream).write_all(&frame[sent..])?;
    }
    Ok(())
}

/// Read one frame and the descriptors attached to it.
///
/// Returns `Ok(None)` if the peer closed the connection between frames.
pub fn recv_frame<T: DeserializeOwned>(stream: &UnixStream) -> Result<Option<(T, Vec<OwnedFd>)>> {
    let mut header = [0u8; 4];
    let mut fds = Vec::new();

    let read = recv_with_fds(stream, &mut header, &mut fds)?;
    if read == 0 {
        return Ok(None);
    }
    if read < header.len() {
        read_exact(stream, &mut header[read..])?;
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RelayError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    read_exact(stream, &mut payload)?;

    let msg = serde_json::from_slice(&payload)?;
    Ok(Some((msg, fds)))
}

fn read_exact(stream: &UnixStream, buf: &mut [u8]) -> Result<()> {
    (&*stream).read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            RelayError::Protocol("connection closed mid-frame".into())
        } else {
            RelayError::Io(err)
        }
    })
}

fn recv_with_fds(stream: &UnixStream, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS]);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = loop {
        match socket::recvmsg::<socket::UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => break msg,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Ok(0),
            Err(err) => return Err(err.into()),
        }
    };

    for cmsg in msg.cmsgs()? {
        match cmsg {
            ControlMessageOwned::ScmRights(raw) => {
                for fd in raw {
                    // SAFETY: the kernel just installed this descriptor for us
                    // and nothing else records it.
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
            other => warn!("ignoring unexpected control message: {other:?}"),
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(RelayError::Protocol("too many descriptors in one frame".into()));
    }
    Ok(msg.bytes)
}

/// True if the peer hung up. Does not consume any data.
pub fn peer_closed(stream: &UnixStream) -> bool {
    let mut probe = [0u8; 1];
    match socket::recv(
        stream.as_raw_fd(),
        &mut probe,
        MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(0) => true,
        Ok(_) => false,
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
        Err(_) => true,
    }
}
