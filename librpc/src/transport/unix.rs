/*
 * This file is part of librpc.
 *
 * librpc is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The `unix` transport: a Unix-domain `SOCK_DGRAM` carrying length-free
//! datagrams and, via `SCM_RIGHTS` ancillary data, real file
//! descriptors — the concrete transport spec.md §8 scenario 5 (fd
//! passing) needs. Datagram sockets preserve message boundaries, so no
//! framing layer is needed on top.
//!
//! The ancillary-data dance has no safe wrapper in the crates already in
//! use, so it goes through raw `libc` calls, in the same unsafe-FFI
//! idiom the teacher uses for `flock`/`getrlimit` in its own OS layer.

use super::{Inbound, Transport, TransportChannel};
use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixDatagram;
use tokio::sync::Notify;

pub struct UnixTransport;

#[async_trait]
impl Transport for UnixTransport {
    async fn connect(&self, path: &str) -> RpcResult<Box<dyn TransportChannel>> {
        let socket = UnixDatagram::unbound()
            .and_then(|s| {
                s.connect(path)?;
                Ok(s)
            })
            .map_err(|e| RpcError::disconnected(format!("connect to {path} failed: {e}")))?;
        Ok(Box::new(UnixChannel::new(socket)))
    }
}

impl UnixTransport {
    /// A connected pair with no filesystem path involved — used by
    /// in-process descriptor-passing tests.
    pub fn pair() -> RpcResult<(Box<dyn TransportChannel>, Box<dyn TransportChannel>)> {
        let (a, b) = UnixDatagram::pair()
            .map_err(|e| RpcError::internal(format!("socketpair failed: {e}")))?;
        Ok((Box::new(UnixChannel::new(a)), Box::new(UnixChannel::new(b))))
    }
}

pub struct UnixChannel {
    socket: UnixDatagram,
    closed: Arc<Notify>,
}

impl UnixChannel {
    fn new(socket: UnixDatagram) -> Self {
        Self {
            socket,
            closed: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl TransportChannel for UnixChannel {
    async fn send(&self, bytes: &[u8], fds: &[RawFd]) -> RpcResult<()> {
        loop {
            self.socket
                .writable()
                .await
                .map_err(|e| RpcError::internal(format!("socket not writable: {e}")))?;
            let fd = self.socket.as_raw_fd();
            let result = self
                .socket
                .try_io(Interest::WRITABLE, || unsafe { scm::send_with_fds(fd, bytes, fds) });
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(RpcError::internal(format!("sendmsg failed: {e}"))),
            }
        }
    }

    async fn recv(&self) -> RpcResult<Option<Inbound>> {
        loop {
            tokio::select! {
                ready = self.socket.readable() => {
                    ready.map_err(|e| RpcError::internal(format!("socket not readable: {e}")))?;
                    let fd = self.socket.as_raw_fd();
                    let result = self.socket.try_io(Interest::READABLE, || unsafe { scm::recv_with_fds(fd) });
                    match result {
                        Ok(Some(raw)) => {
                            return Ok(Some(Inbound { bytes: raw.bytes, fds: raw.fds, credentials: None }));
                        }
                        Ok(None) => return Ok(None),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(RpcError::internal(format!("recvmsg failed: {e}"))),
                    }
                }
                _ = self.closed.notified() => return Ok(None),
            }
        }
    }

    fn abort(&self) {
        self.closed.notify_waiters();
    }
}

/// Raw `sendmsg`/`recvmsg` with `SCM_RIGHTS` ancillary data.
mod scm {
    use libc::{c_void, iovec, msghdr};
    use std::io;
    use std::mem;
    use std::os::unix::io::RawFd;

    const MAX_FDS: usize = 128;
    const BUF_CAP: usize = 64 * 1024;

    pub struct RawInbound {
        pub bytes: Vec<u8>,
        pub fds: Vec<RawFd>,
    }

    pub unsafe fn send_with_fds(fd: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let mut iov = iovec {
            iov_base: bytes.as_ptr() as *mut c_void,
            iov_len: bytes.len(),
        };
        let mut msg: msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let mut cmsg_buf;
        if !fds.is_empty() {
            let space = libc::CMSG_SPACE((fds.len() * mem::size_of::<RawFd>()) as u32) as usize;
            cmsg_buf = vec![0u8; space];
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = space as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as _;
            std::ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg) as *mut RawFd, fds.len());
        }

        let sent = libc::sendmsg(fd, &msg, 0);
        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn recv_with_fds(fd: RawFd) -> io::Result<Option<RawInbound>> {
        let mut buf = vec![0u8; BUF_CAP];
        let mut iov = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_buf = vec![0u8; libc::CMSG_SPACE((MAX_FDS * mem::size_of::<RawFd>()) as u32) as usize];
        let mut msg: msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n as usize);

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header_len = libc::CMSG_LEN(0) as usize;
                let data_len = (*cmsg).cmsg_len as usize - header_len;
                let count = data_len / mem::size_of::<RawFd>();
                let src = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    fds.push(*src.add(i));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        Ok(Some(RawInbound { bytes: buf, fds }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    #[tokio::test]
    async fn round_trips_bytes_without_descriptors() {
        let (a, b) = UnixTransport::pair().unwrap();
        a.send(b"ping", &[]).await.unwrap();
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.bytes, b"ping");
        assert!(got.fds.is_empty());
    }

    #[tokio::test]
    async fn passes_a_descriptor_to_the_same_underlying_file() {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut tmp = tempfile_like_pipe();
        tmp.write_all(b"shared-bytes").unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();
        let fd = tmp.as_raw_fd();

        let (a, b) = UnixTransport::pair().unwrap();
        a.send(b"fd-follows", &[fd]).await.unwrap();
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.bytes, b"fd-follows");
        assert_eq!(got.fds.len(), 1);
        assert_ne!(got.fds[0], fd, "delivered descriptor is a distinct duplicate");

        let mut via_delivered = unsafe { std::fs::File::from_raw_fd(got.fds[0]) };
        let mut contents = String::new();
        via_delivered.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared-bytes");
    }

    fn tempfile_like_pipe() -> std::fs::File {
        let mut path = std::env::temp_dir();
        path.push(format!("librpc-scm-test-{}", std::process::id()));
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap()
    }
}
