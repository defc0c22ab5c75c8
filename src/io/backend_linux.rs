#![cfg(target_os = "linux")]

//! `io_uring` implementation of the socket [`IoBackend`].
//!
//! One submission-queue entry per operation; completions are matched back to
//! the caller via `user_data`. The kernel reports results exactly as the
//! trait's convention expects (count or fd on success, negated errno on
//! failure), so no translation is required.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

use io_uring::{IoUring, opcode, types};

use crate::io::{IoBackend, Operation};

/// Socket address storage for an in-flight connect.
///
/// The kernel reads the sockaddr when the connect is *processed*, not when it
/// is submitted, so the struct must stay at a stable heap address until the
/// completion is drained.
struct ConnectAddr {
    _addr: Box<libc::sockaddr_in>,
}

pub struct UringBackend {
    ring: IoUring,
    connect_addrs: HashMap<u64, ConnectAddr>,
}

fn sockaddr_in_from(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

impl IoBackend for UringBackend {
    const ENTRIES_MIN: u32 = 1;
    const ENTRIES_MAX: u32 = 4096;

    fn new(entries: u32) -> io::Result<Self> {
        assert!(entries >= Self::ENTRIES_MIN);
        assert!(entries <= Self::ENTRIES_MAX);
        assert!(entries.is_power_of_two());

        Ok(Self {
            ring: IoUring::new(entries)?,
            connect_addrs: HashMap::new(),
        })
    }

    unsafe fn try_push(&mut self, op: &Operation, user_data: u64) -> Result<(), ()> {
        op.validate();

        let sqe = match *op {
            Operation::Nop => unreachable!("Nop must not be submitted"),
            Operation::Accept { listen_fd, flags } => opcode::Accept::new(
                types::Fd(listen_fd),
                core::ptr::null_mut(),
                core::ptr::null_mut(),
            )
            .flags(flags as i32)
            .build()
            .user_data(user_data),
            Operation::Connect { fd, addr } => {
                let boxed = Box::new(sockaddr_in_from(&addr));
                let addr_ptr = &raw const *boxed as *const libc::sockaddr;
                let previous = self
                    .connect_addrs
                    .insert(user_data, ConnectAddr { _addr: boxed });
                assert!(
                    previous.is_none(),
                    "one outstanding connect per completion"
                );

                opcode::Connect::new(
                    types::Fd(fd),
                    addr_ptr,
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
                .build()
                .user_data(user_data)
            }
            Operation::Recv {
                fd,
                buf,
                len,
                flags,
            } => opcode::Recv::new(types::Fd(fd), buf.as_ptr(), len)
                .flags(flags as i32)
                .build()
                .user_data(user_data),
            Operation::Send {
                fd,
                buf,
                len,
                flags,
            } => opcode::Send::new(types::Fd(fd), buf.as_ptr(), len)
                .flags(flags as i32)
                .build()
                .user_data(user_data),
            Operation::Close { fd } => opcode::Close::new(types::Fd(fd))
                .build()
                .user_data(user_data),
        };

        // SAFETY: Caller guarantees buffer validity until completion; the
        // sockaddr for connects is pinned in `connect_addrs` until drained.
        let pushed = unsafe { self.ring.submission().push(&sqe) };
        match pushed {
            Ok(()) => Ok(()),
            Err(_) => {
                self.connect_addrs.remove(&user_data);
                Err(())
            }
        }
    }

    fn flush(&mut self, wait_for_one: bool) -> io::Result<()> {
        if wait_for_one {
            self.ring.submit_and_wait(1)?;
        } else {
            self.ring.submit()?;
        }
        Ok(())
    }

    fn drain<F: FnMut(u64, i32)>(&mut self, mut f: F) {
        let mut completion = self.ring.completion();
        completion.sync();

        let mut drained: Vec<(u64, i32)> = Vec::new();
        for cqe in &mut completion {
            drained.push((cqe.user_data(), cqe.result()));
        }
        drop(completion);

        for (user_data, result) in drained {
            self.connect_addrs.remove(&user_data);
            f(user_data, result);
        }
    }

    fn open_stream_socket(&mut self) -> io::Result<RawFd> {
        // SAFETY: Plain syscall; no pointers involved.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn listen(&mut self, addr: SocketAddrV4, backlog: u32) -> io::Result<RawFd> {
        let fd = self.open_stream_socket()?;

        let result: io::Result<()> = (|| {
            let reuse: libc::c_int = 1;
            // SAFETY: `reuse` outlives the call; the option length matches.
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &raw const reuse as *const libc::c_void,
                    size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }

            let sockaddr = sockaddr_in_from(&addr);
            // SAFETY: `sockaddr` outlives the call; the length matches.
            let rc = unsafe {
                libc::bind(
                    fd,
                    &raw const sockaddr as *const libc::sockaddr,
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: Plain syscall.
            let rc = unsafe { libc::listen(fd, backlog as libc::c_int) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        })();

        match result {
            Ok(()) => Ok(fd),
            Err(e) => {
                // SAFETY: `fd` was opened above and is not shared.
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    fn shutdown_socket(&mut self, fd: RawFd) -> io::Result<()> {
        assert!(fd >= 0);

        // SAFETY: Plain syscall.
        let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close_socket(&mut self, fd: RawFd) -> io::Result<()> {
        assert!(fd >= 0);

        // SAFETY: Plain syscall; caller owns the descriptor.
        let rc = unsafe { libc::close(fd) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
