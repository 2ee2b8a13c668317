// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Abstractions over the transport streams the pipelines read and write

pub mod http;
pub mod tee;

use std::net::SocketAddr;

/// Socket level operations of a stream or stream half.
///
/// The pipelines only need two things from the transport beyond async IO:
/// the peer address for span tagging, and best-effort half-close so a stuck
/// upstream can be unblocked while buffered bytes still drain. Types that
/// are not sockets (mock IO, in-memory pipes) use the defaults.
pub trait SocketOps {
    /// Return the address of the remote peer, if the stream is a socket.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Shut down the read direction of the underlying socket.
    fn shutdown_read(&self) {}

    /// Shut down the write direction of the underlying socket.
    fn shutdown_write(&self) {}
}

#[cfg(unix)]
fn socket_shutdown(fd: std::os::unix::io::RawFd, how: nix::sys::socket::Shutdown) {
    if let Err(e) = nix::sys::socket::shutdown(fd, how) {
        log::debug!("Failed to shutdown socket fd {fd}: {e:?}");
    }
}

impl SocketOps for tokio::net::TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }

    #[cfg(unix)]
    fn shutdown_read(&self) {
        use std::os::unix::io::AsRawFd;
        socket_shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Read);
    }

    #[cfg(unix)]
    fn shutdown_write(&self) {
        use std::os::unix::io::AsRawFd;
        socket_shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Write);
    }
}

impl SocketOps for tokio::net::tcp::OwnedReadHalf {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.as_ref().peer_addr().ok()
    }

    #[cfg(unix)]
    fn shutdown_read(&self) {
        use std::os::unix::io::AsRawFd;
        socket_shutdown(
            self.as_ref().as_raw_fd(),
            nix::sys::socket::Shutdown::Read,
        );
    }

    #[cfg(unix)]
    fn shutdown_write(&self) {
        use std::os::unix::io::AsRawFd;
        socket_shutdown(
            self.as_ref().as_raw_fd(),
            nix::sys::socket::Shutdown::Write,
        );
    }
}

impl SocketOps for tokio::net::tcp::OwnedWriteHalf {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.as_ref().peer_addr().ok()
    }

    #[cfg(unix)]
    fn shutdown_read(&self) {
        use std::os::unix::io::AsRawFd;
        socket_shutdown(
            self.as_ref().as_raw_fd(),
            nix::sys::socket::Shutdown::Read,
        );
    }

    #[cfg(unix)]
    fn shutdown_write(&self) {
        use std::os::unix::io::AsRawFd;
        socket_shutdown(
            self.as_ref().as_raw_fd(),
            nix::sys::socket::Shutdown::Write,
        );
    }
}

// Implement SocketOps for 3rd party types, mostly for testing
mod ext_io_impl {
    use super::*;
    use std::io::Cursor;
    use tokio::io::DuplexStream;
    use tokio_test::io::Mock;

    impl SocketOps for Mock {}
    impl<T> SocketOps for Cursor<T> {}
    impl SocketOps for DuplexStream {}
}
