//! Async socket I/O over platform completion APIs.
//!
//! The bus submits operations and consumes one-shot completions:
//! - [`IoBackend`]: submit and drain completions, plus the synchronous
//!   socket surface (open, listen, shutdown, close)
//! - [`Operation`]: accept/connect/recv/send/close description
//!
//! Completions are identified by a caller-chosen `user_data` word and report
//! an `i32` result: a byte count (recv/send), a new descriptor (accept), or
//! zero (connect/close) on success, and a negated errno on failure. A recv
//! result of zero signals orderly peer close.
//!
//! # Safety / Ownership
//!
//! `Recv` and `Send` store raw buffer pointers. Buffers are caller-owned and
//! must remain valid and immovable until the matching completion is drained.
//! The backend is single-threaded; completions are only observed through
//! [`drain`](IoBackend::drain), serialized with the caller's own code.

pub mod sim;

#[cfg(target_os = "linux")]
mod backend_linux;

#[cfg(target_os = "linux")]
pub use backend_linux::UringBackend;

use core::ptr::NonNull;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

/// Platform-specific I/O backend. Use this type alias for portable code.
#[cfg(target_os = "linux")]
pub type Io = UringBackend;

/// Flags for accepted sockets: close-on-exec, set atomically where the
/// platform supports it.
#[cfg(target_os = "linux")]
pub const ACCEPT_SOCKET_FLAGS: u32 = libc::SOCK_CLOEXEC as u32;
#[cfg(not(target_os = "linux"))]
pub const ACCEPT_SOCKET_FLAGS: u32 = 0;

/// Flags for sends: broken pipes surface as errors, never process signals.
#[cfg(target_os = "linux")]
pub const SEND_FLAGS: u32 = libc::MSG_NOSIGNAL as u32;
#[cfg(not(target_os = "linux"))]
pub const SEND_FLAGS: u32 = 0;

/// Describes a socket I/O operation.
///
/// # Buffer Ownership
///
/// `Recv` and `Send` hold raw pointers to caller-owned buffers. Buffers must
/// remain valid and immovable until completion. `len` is `u32` to cap request
/// sizes and match on-wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// No operation. Used as a sentinel.
    Nop,
    /// Accept one connection on `listen_fd`. Completes with the new fd.
    Accept { listen_fd: RawFd, flags: u32 },
    /// Connect `fd` to `addr`. Completes with zero.
    Connect { fd: RawFd, addr: SocketAddrV4 },
    /// Receive up to `len` bytes from `fd` into `buf`. Completes with the
    /// byte count; zero means the peer closed in an orderly way.
    Recv {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        flags: u32,
    },
    /// Send up to `len` bytes from `buf` on `fd`. Completes with the byte
    /// count, which may be short.
    Send {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        flags: u32,
    },
    /// Close `fd`. Completes with zero.
    Close { fd: RawFd },
}

impl Operation {
    /// Returns `true` if this is an actual I/O operation (not [`Nop`](Self::Nop)).
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self, Operation::Nop)
    }

    /// Asserts basic invariants for this operation.
    ///
    /// # Panics
    ///
    /// Panics on invalid fd or zero-length buffer.
    pub fn validate(&self) {
        match *self {
            Operation::Recv { fd, len, .. } | Operation::Send { fd, len, .. } => {
                assert!(fd >= 0, "File descriptor must be non-negative");
                assert!(len > 0, "Length must be positive");
                assert!(len <= i32::MAX as u32, "Length must fit in i32");
            }
            Operation::Accept { listen_fd, .. } => {
                assert!(listen_fd >= 0, "File descriptor must be non-negative");
            }
            Operation::Connect { fd, .. } | Operation::Close { fd } => {
                assert!(fd >= 0, "File descriptor must be non-negative");
            }
            Operation::Nop => {}
        }
    }
}

/// Backend abstraction for platform-specific async socket I/O.
///
/// Callers queue operations, flush them to the kernel, then drain
/// completions. Each `user_data` word identifies at most one outstanding
/// operation at a time (enforced by the caller), and every submitted
/// operation completes exactly once.
#[allow(clippy::result_unit_err)] // Simple success/failure semantics; no error details needed.
pub trait IoBackend {
    /// Minimum supported entries for this backend.
    const ENTRIES_MIN: u32;
    /// Maximum supported entries for this backend (inclusive).
    const ENTRIES_MAX: u32;

    /// Initialize the backend with a fixed queue depth.
    fn new(entries: u32) -> io::Result<Self>
    where
        Self: Sized;

    /// Queue an operation for submission.
    ///
    /// # Safety
    ///
    /// - `op` must describe valid memory regions that remain valid until
    ///   completion
    /// - `user_data` must identify the completion when retrieved via
    ///   [`drain`](Self::drain)
    ///
    /// Returns `Err(())` if the submission queue is full; caller should flush
    /// and retry.
    unsafe fn try_push(&mut self, op: &Operation, user_data: u64) -> Result<(), ()>;

    /// Submit queued operations to the kernel.
    ///
    /// If `wait_for_one` is true, blocks until at least one completion is
    /// available.
    fn flush(&mut self, wait_for_one: bool) -> io::Result<()>;

    /// Process all available completions without blocking.
    ///
    /// Invokes `f(user_data, result)` for each completion, where `result` is
    /// the operation's success value or a negated errno on failure.
    fn drain<F: FnMut(u64, i32)>(&mut self, f: F);

    // ------------------------------------------------------------------
    // Synchronous socket surface
    // ------------------------------------------------------------------

    /// Creates a non-listening stream socket (close-on-exec).
    fn open_stream_socket(&mut self) -> io::Result<RawFd>;

    /// Creates, binds, and listens a stream socket on `addr` with
    /// `SO_REUSEADDR` set and the given backlog.
    fn listen(&mut self, addr: SocketAddrV4, backlog: u32) -> io::Result<RawFd>;

    /// Half-closes both directions of `fd` (`SHUT_RDWR`), leaving the
    /// descriptor itself open until a [`Operation::Close`] completes.
    fn shutdown_socket(&mut self, fd: RawFd) -> io::Result<()>;

    /// Closes `fd` immediately, outside the completion machinery. Used only
    /// during synchronous teardown.
    fn close_socket(&mut self, fd: RawFd) -> io::Result<()>;
}
