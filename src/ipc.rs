//! Relay socket: serving a `RelayDevice` and talking to one.
//!
//! Every accepted connection gets its own thread and session. A session opens
//! a producer `Client` on its first producer request and attaches as the
//! consumer on its first consumer request; both are released when the peer
//! disconnects.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::{Client, ConsumerLink, Export, RelayDevice};
use crate::error::{RelayError, Result};
use crate::event::{DisplayMode, RelayEvent};
use crate::protocol::{self, recv_frame, send_frame, unexpected, Request, Response};
use crate::registry::BufferHandle;

/// How often a blocked `Wait` checks whether its peer is still there.
const HANGUP_POLL: Duration = Duration::from_millis(250);

/// Listening relay socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct RelayServer {
    listener: UnixListener,
    path: PathBuf,
}

impl RelayServer {
    /// Bind `path`, replacing a stale socket left by a previous run.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("relay socket: {}", path.display());
        Ok(Self {
            listener,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the listener fails.
    pub fn run(&self, device: &RelayDevice) -> std::io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            let device = device.clone();
            thread::Builder::new()
                .name("membrane-session".into())
                .spawn(move || serve_connection(device, stream))?;
        }
        Ok(())
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Serve one connection until the peer hangs up.
pub fn serve_connection(device: RelayDevice, stream: UnixStream) {
    debug!("relay peer connected");
    let mut session = Session {
        device,
        stream,
        client: None,
        consumer: None,
    };
    loop {
        match session.step() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                warn!("relay session ended: {err}");
                break;
            }
        }
    }
    debug!("relay peer disconnected");
}

type Reply = (Response, Vec<OwnedFd>);

fn reply(response: Response) -> Result<Reply> {
    Ok((response, Vec::new()))
}

struct Session {
    device: RelayDevice,
    stream: UnixStream,
    client: Option<Client>,
    consumer: Option<ConsumerLink>,
}

impl Session {
    /// Handle one request. Returns false on orderly hang-up.
    fn step(&mut self) -> Result<bool> {
        let Some((request, fds)) = recv_frame::<Request>(&self.stream)? else {
            return Ok(false);
        };

        let (response, out_fds) = match self.handle(request, fds) {
            Ok(reply) => reply,
            Err(RelayError::Disconnected) if protocol::peer_closed(&self.stream) => {
                return Ok(false);
            }
            Err(err) => {
                debug!("request failed: {err}");
                (Response::error(&err), Vec::new())
            }
        };

        let borrowed: Vec<BorrowedFd<'_>> = out_fds.iter().map(|fd| fd.as_fd()).collect();
        send_frame(&self.stream, &response, &borrowed)?;
        Ok(true)
    }

    fn handle(&mut self, request: Request, mut fds: Vec<OwnedFd>) -> Result<Reply> {
        match request {
            Request::Configure {
                width,
                height,
                refresh,
            } => {
                let mode = DisplayMode::from_request(width, height, refresh)?;
                let changed = self.consumer()?.configure(mode);
                reply(Response::Ack {
                    changed: Some(changed),
                })
            }
            Request::Wait => reply(Response::event(self.wait()?)),
            Request::Export => {
                let export = self.consumer()?.export();
                let valid = export.handles.iter().map(Option::is_some).collect();
                let response = Response::Exported {
                    id: export.id,
                    count: export.count(),
                    valid,
                };
                Ok((response, export.handles.into_iter().flatten().collect()))
            }
            Request::RegisterExternalBuffer => {
                if fds.len() != 1 {
                    return Err(RelayError::InvalidArgument(
                        "register_external_buffer takes exactly one fd",
                    ));
                }
                let fd = fds.remove(0);
                let handle = self.client().register_external_buffer(fd);
                reply(Response::Handle {
                    handle: handle.raw(),
                })
            }
            Request::ReleaseHandle { handle } => {
                self.client().release_handle(BufferHandle(handle))?;
                reply(Response::ack())
            }
            Request::AddFramebuffer { handles } => {
                let handles: Vec<_> = handles.into_iter().map(BufferHandle).collect();
                let id = self.client().add_framebuffer(&handles)?;
                reply(Response::Framebuffer { id })
            }
            Request::RemoveFramebuffer { id } => {
                self.client().remove_framebuffer(id)?;
                reply(Response::ack())
            }
            Request::PageFlip { id } => {
                self.client().page_flip(id)?;
                reply(Response::ack())
            }
            Request::SetCrtc { id } => {
                self.client().set_crtc_id(id)?;
                reply(Response::ack())
            }
            Request::WaitVblank { sequence } => {
                let after = sequence.unwrap_or_else(|| self.device.vblank_count());
                reply(Response::Vblank {
                    sequence: self.wait_vblank(after)?,
                })
            }
        }
    }

    fn consumer(&mut self) -> Result<&ConsumerLink> {
        if self.consumer.is_none() {
            self.consumer = Some(self.device.attach_consumer()?);
        }
        self.consumer.as_ref().ok_or(RelayError::Disconnected)
    }

    fn client(&mut self) -> &Client {
        self.client.get_or_insert_with(|| self.device.open_client())
    }

    /// Block for the next event, giving up if the peer goes away.
    fn wait(&mut self) -> Result<RelayEvent> {
        loop {
            if let Some(event) = self.consumer()?.wait_timeout(HANGUP_POLL)? {
                return Ok(event);
            }
            if protocol::peer_closed(&self.stream) {
                return Err(RelayError::Disconnected);
            }
        }
    }

    /// Block until the VBlank after `after`, giving up if the peer goes away.
    fn wait_vblank(&self, after: u64) -> Result<u64> {
        loop {
            let reached = self.device.wait_vblank(after, HANGUP_POLL);
            if reached > after {
                return Ok(reached);
            }
            if protocol::peer_closed(&self.stream) {
                return Err(RelayError::Disconnected);
            }
        }
    }
}

/// Client side of the relay socket.
#[derive(Debug)]
pub struct RelayClient {
    stream: UnixStream,
}

impl RelayClient {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        debug!("connected to relay at {}", path.display());
        Ok(Self { stream })
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    fn call(&mut self, request: &Request, fds: &[BorrowedFd<'_>]) -> Result<Reply> {
        send_frame(&self.stream, request, fds)?;
        let (response, fds) =
            recv_frame::<Response>(&self.stream)?.ok_or(RelayError::Disconnected)?;
        Ok((response.into_result()?, fds))
    }

    fn call_ack(&mut self, request: &Request) -> Result<()> {
        match self.call(request, &[])?.0 {
            Response::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Negotiate the display mode. Returns true if it changed.
    pub fn configure(&mut self, mode: DisplayMode) -> Result<bool> {
        let request = Request::Configure {
            width: mode.width as i32,
            height: mode.height as i32,
            refresh: mode.refresh as i32,
        };
        match self.call(&request, &[])?.0 {
            Response::Ack { changed } => Ok(changed.unwrap_or(false)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn wait(&mut self) -> Result<RelayEvent> {
        self.call(&Request::Wait, &[])?.0.into_event()
    }

    pub fn export(&mut self) -> Result<Export> {
        let (response, fds) = self.call(&Request::Export, &[])?;
        let (id, count, valid) = match response {
            Response::Exported { id, count, valid } => (id, count, valid),
            other => return Err(unexpected(&other)),
        };
        if valid.len() != count || valid.iter().filter(|v| **v).count() != fds.len() {
            return Err(RelayError::Protocol(format!(
                "export of {count} positions arrived with {} fds",
                fds.len()
            )));
        }

        let mut fds = fds.into_iter();
        let handles = valid
            .into_iter()
            .map(|valid| if valid { fds.next() } else { None })
            .collect();
        Ok(Export { id, handles })
    }

    pub fn register_external_buffer(&mut self, fd: BorrowedFd<'_>) -> Result<BufferHandle> {
        match self.call(&Request::RegisterExternalBuffer, &[fd])?.0 {
            Response::Handle { handle } => Ok(BufferHandle(handle)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn release_handle(&mut self, handle: BufferHandle) -> Result<()> {
        self.call_ack(&Request::ReleaseHandle {
            handle: handle.raw(),
        })
    }

    pub fn add_framebuffer(&mut self, handles: &[BufferHandle]) -> Result<u32> {
        let request = Request::AddFramebuffer {
            handles: handles.iter().map(|h| h.raw()).collect(),
        };
        match self.call(&request, &[])?.0 {
            Response::Framebuffer { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    pub fn remove_framebuffer(&mut self, id: u32) -> Result<()> {
        self.call_ack(&Request::RemoveFramebuffer { id })
    }

    pub fn page_flip(&mut self, id: u32) -> Result<()> {
        self.call_ack(&Request::PageFlip { id })
    }

    pub fn set_crtc(&mut self, id: Option<u32>) -> Result<()> {
        self.call_ack(&Request::SetCrtc { id })
    }

    /// Frame acknowledgement: block until the VBlank after `sequence` (the
    /// current one if `None`) and return the sequence reached.
    pub fn wait_vblank(&mut self, sequence: Option<u64>) -> Result<u64> {
        match self.call(&Request::WaitVblank { sequence }, &[])?.0 {
            Response::Vblank { sequence } => Ok(sequence),
            other => Err(unexpected(&other)),
        }
    }
}
