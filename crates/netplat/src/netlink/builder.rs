//! Message builder for constructing netlink messages.

use std::net::IpAddr;

use zerocopy::{Immutable, IntoBytes};

use super::attr::{NLA_F_NESTED, NLA_HDRLEN, NlAttr, nla_align};
use super::error::{Error, Result};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned when starting a nested attribute.
/// Used to finalize the nested attribute length.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct NestToken {
    offset: usize,
    attr_type: u16,
}

/// Builder for constructing netlink messages.
///
/// An attribute whose length does not fit `nla_len` is not written; the
/// first one is remembered and reported by [`MessageBuilder::check`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    /// First attribute that overflowed, as (type, payload length).
    oversized: Option<(u16, usize)>,
}

impl MessageBuilder {
    /// Create a new message builder with the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let header = NlMsgHdr::new(msg_type, flags);
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(header.as_bytes());
        buf.resize(NLMSG_HDRLEN, 0);
        Self {
            buf,
            oversized: None,
        }
    }

    /// Message type from the header.
    pub fn msg_type(&self) -> u16 {
        u16::from_ne_bytes([self.buf[4], self.buf[5]])
    }

    /// Flags from the header.
    pub fn flags(&self) -> u16 {
        u16::from_ne_bytes([self.buf[6], self.buf[7]])
    }

    /// Add flags to the header.
    pub fn add_flags(&mut self, flags: u16) {
        let merged = (self.flags() | flags).to_ne_bytes();
        self.buf[6..8].copy_from_slice(&merged);
    }

    /// Append raw bytes to the message (with alignment padding).
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a fixed-size kernel struct (ifinfomsg, tcmsg, ...).
    pub fn append<T: IntoBytes + Immutable>(&mut self, data: &T) {
        self.append_bytes(data.as_bytes());
    }

    /// Append an attribute with the given type and data.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        let Some(attr) = NlAttr::new(attr_type, data.len()) else {
            self.oversized.get_or_insert((attr_type, data.len()));
            return;
        };
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a u8 attribute.
    pub fn append_attr_u8(&mut self, attr_type: u16, value: u8) {
        self.append_attr(attr_type, &[value]);
    }

    /// Append a u32 attribute (native endian).
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append an address attribute in network byte order.
    pub fn append_attr_ip(&mut self, attr_type: u16, addr: IpAddr) {
        match addr {
            IpAddr::V4(v4) => self.append_attr(attr_type, &v4.octets()),
            IpAddr::V6(v6) => self.append_attr(attr_type, &v6.octets()),
        }
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Start a nested attribute. Returns a token to finalize it.
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr {
            nla_len: NLA_HDRLEN as u16,
            nla_type: attr_type | NLA_F_NESTED,
        };
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset, attr_type }
    }

    /// End a nested attribute started with `nest_start`.
    pub fn nest_end(&mut self, token: NestToken) {
        let len = self.buf.len() - token.offset;
        match u16::try_from(len) {
            Ok(len) => {
                self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes())
            }
            Err(_) => {
                self.oversized
                    .get_or_insert((token.attr_type, len - NLA_HDRLEN));
            }
        }
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Fail if an attribute or nest outgrew the 16-bit length field.
    pub fn check(&self) -> Result<()> {
        match self.oversized {
            Some((attr_type, len)) => Err(Error::InvalidArgument(format!(
                "attribute {} carries {} bytes, more than a netlink attribute can hold",
                attr_type, len
            ))),
            None => Ok(()),
        }
    }

    /// Finalize and return the message bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}
