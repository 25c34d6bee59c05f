//! Buffer references shared between the relay and its clients.
//!
//! A buffer is owned outside the relay (a dma-buf exported by the producer's
//! allocator). The relay only ever holds counted references to it: every
//! registry entry, framebuffer plane and present record owns one `Arc`, so
//! `Arc::strong_count` is the live reference count of the buffer.

use std::ffi::CString;
use std::fmt;
use std::io::{self, Write};
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

/// An externally owned buffer the relay can hand out handles to.
pub trait BufferObject: Send + Sync + fmt::Debug {
    /// Mint a new handle the receiving side owns.
    ///
    /// Minting never consumes the reference it is called on.
    fn mint_handle(&self) -> io::Result<OwnedFd>;
}

/// Counted reference to a buffer.
pub type BufferRef = Arc<dyn BufferObject>;

/// A buffer backed by a file descriptor received from a producer.
///
/// Handles are minted by duplicating the descriptor, which is how a dma-buf
/// is shared with another process.
#[derive(Debug)]
pub struct DmaBuf {
    fd: OwnedFd,
}

impl DmaBuf {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_ref(self) -> BufferRef {
        Arc::new(self)
    }
}

impl AsFd for DmaBuf {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl BufferObject for DmaBuf {
    fn mint_handle(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

/// Write an opaque metadata blob into an anonymous memory file.
///
/// Producers attach this as the last handle of a framebuffer so the consumer
/// can rebuild the vendor buffer handle on import.
pub fn metadata_memfd(blob: &[u8]) -> io::Result<OwnedFd> {
    let name = CString::new("membrane_meta").map_err(io::Error::other)?;
    // SAFETY: name is a valid NUL-terminated string.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw was just returned by memfd_create and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut file = std::fs::File::from(fd);
    file.write_all(blob)?;
    Ok(OwnedFd::from(file))
}

/// Identity of the file behind a descriptor, `(device, inode)`.
///
/// Two handles minted from the same buffer share an identity.
pub fn fd_identity(fd: &impl AsFd) -> io::Result<(u64, u64)> {
    let file = std::fs::File::from(fd.as_fd().try_clone_to_owned()?);
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}
