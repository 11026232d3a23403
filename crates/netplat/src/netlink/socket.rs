//! Async rtnetlink socket.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::error::{Error, Result};
use crate::transport::NetlinkIo;

/// Largest datagram the kernel sends for rtnetlink dumps.
const RECV_BUF_LEN: usize = 32768;

const SOL_NETLINK: libc::c_int = 270;
const NETLINK_GET_STRICT_CHK: libc::c_int = 12;

/// rtnetlink multicast groups (RTNLGRP_*).
pub mod rtnetlink_groups {
    pub const RTNLGRP_LINK: u32 = 1;
    pub const RTNLGRP_TC: u32 = 4;
    pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
    pub const RTNLGRP_IPV4_ROUTE: u32 = 7;
    pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
    pub const RTNLGRP_IPV6_ROUTE: u32 = 11;

    /// Every group whose objects the cache mirrors.
    pub const CACHED: &[u32] = &[
        RTNLGRP_LINK,
        RTNLGRP_TC,
        RTNLGRP_IPV4_IFADDR,
        RTNLGRP_IPV4_ROUTE,
        RTNLGRP_IPV6_IFADDR,
        RTNLGRP_IPV6_ROUTE,
    ];
}

/// Options applied while the socket is created.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Multicast groups to join.
    pub groups: Vec<u32>,
    /// SO_RCVBUF size; 0 keeps the system default.
    pub recv_buffer_size: usize,
}

/// Async netlink socket bound to NETLINK_ROUTE.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    pid: u32,
    ext_ack: bool,
    strict_check: bool,
}

impl NetlinkSocket {
    /// Create a socket in the current network namespace.
    pub fn new(options: &SocketOptions) -> Result<Self> {
        Self::create_socket(options)
    }

    /// Create a socket that operates in the namespace behind `ns_fd`.
    ///
    /// The calling thread is switched into the namespace for the duration of
    /// socket creation and then switched back. The socket stays bound to the
    /// target namespace.
    pub fn new_in_namespace(options: &SocketOptions, ns_fd: RawFd) -> Result<Self> {
        let current_ns = File::open("/proc/self/ns/net")
            .map_err(|e| Error::InvalidMessage(format!("cannot open current namespace: {}", e)))?;

        // SAFETY: ns_fd refers to an open namespace file; setns only affects
        // the calling thread.
        let ret = unsafe { libc::setns(ns_fd, libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let result = Self::create_socket(options);

        // SAFETY: current_ns was opened from /proc/self/ns/net above.
        let restore_ret = unsafe { libc::setns(current_ns.as_raw_fd(), libc::CLONE_NEWNET) };
        if restore_ret < 0 {
            tracing::error!(
                error = %std::io::Error::last_os_error(),
                "failed to restore original network namespace"
            );
        }

        result
    }

    /// Create a socket in the namespace at `ns_path`
    /// (`/var/run/netns/<name>` or `/proc/<pid>/ns/net`).
    pub fn new_in_namespace_path<P: AsRef<Path>>(
        options: &SocketOptions,
        ns_path: P,
    ) -> Result<Self> {
        let ns_file = File::open(ns_path.as_ref()).map_err(|e| {
            Error::NotFound(format!(
                "namespace '{}': {}",
                ns_path.as_ref().display(),
                e
            ))
        })?;
        Self::new_in_namespace(options, ns_file.as_raw_fd())
    }

    fn create_socket(options: &SocketOptions) -> Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_ROUTE)?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        if options.recv_buffer_size > 0 {
            socket.set_rx_buf_sz(options.recv_buffer_size)?;
        }

        let ext_ack = socket.set_ext_ack(true).is_ok();
        let strict_check = set_strict_check(socket.as_raw_fd());

        for &group in &options.groups {
            socket.add_membership(group)?;
        }

        tracing::debug!(pid, ext_ack, strict_check, groups = ?options.groups, "netlink socket ready");

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            pid,
            ext_ack,
            strict_check,
        })
    }

    /// Whether the kernel accepted NETLINK_EXT_ACK.
    pub fn ext_ack(&self) -> bool {
        self.ext_ack
    }

    /// Whether the kernel accepted NETLINK_GET_STRICT_CHK.
    pub fn strict_check(&self) -> bool {
        self.strict_check
    }

    /// Subscribe to a multicast group.
    pub fn add_membership(&mut self, group: u32) -> Result<()> {
        self.fd.get_mut().add_membership(group)?;
        Ok(())
    }

    async fn send_datagram(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;

            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_datagram(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(RECV_BUF_LEN);

        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;

            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    let n = result?;
                    tracing::trace!(bytes = n, "datagram received");
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl NetlinkIo for NetlinkSocket {
    fn port_id(&self) -> u32 {
        self.pid
    }

    fn extended_ack(&self) -> bool {
        self.ext_ack
    }

    fn strict_check(&self) -> bool {
        self.strict_check
    }

    async fn send(&self, msg: &[u8]) -> Result<()> {
        self.send_datagram(msg).await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.recv_datagram().await
    }
}

fn set_strict_check(fd: RawFd) -> bool {
    let one: libc::c_int = 1;
    // SAFETY: fd is a live netlink socket and `one` outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_NETLINK,
            NETLINK_GET_STRICT_CHK,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    ret == 0
}
