//! Parser combinators and traits for strongly-typed netlink message parsing.
//!
//! Object decoders are written as winnow parsers over the message payload
//! (everything after the `nlmsghdr`). Each decoder consumes the fixed kernel
//! header and then the attribute section.

use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::attr::{NLA_HDRLEN, NLA_TYPE_MASK, nla_align};
use super::error::{Error, Result};

/// Result type for winnow parsers.
pub type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// Trait for types that can be parsed from netlink wire format.
pub trait FromNetlink: Sized {
    /// Parse from a mutable byte slice reference.
    /// The slice is advanced past the consumed bytes.
    fn parse(input: &mut &[u8]) -> PResult<Self>;

    /// Parse from a complete message payload.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse
            .parse(data)
            .map_err(|e| Error::Parse(format!("{}", e)))
    }
}

/// Abort parsing; the message is malformed.
pub(crate) fn cut<T>() -> PResult<T> {
    Err(ErrMode::Cut(ContextError::new()))
}

/// Take exactly `n` bytes.
pub fn take_bytes<'a>(input: &mut &'a [u8], n: usize) -> PResult<&'a [u8]> {
    take(n).parse_next(input)
}

/// Parse a fixed-size kernel header struct.
pub fn parse_header<T: FromBytes + KnownLayout + Immutable>(input: &mut &[u8]) -> PResult<T> {
    let bytes = take_bytes(input, std::mem::size_of::<T>())?;
    match T::read_from_bytes(bytes) {
        Ok(value) => Ok(value),
        Err(_) => cut(),
    }
}

/// Parse one attribute and return (type, payload).
pub fn parse_attr<'a>(input: &mut &'a [u8]) -> PResult<(u16, &'a [u8])> {
    let hdr = take_bytes(input, NLA_HDRLEN)?;
    let len = u16::from_ne_bytes([hdr[0], hdr[1]]) as usize;
    let kind = u16::from_ne_bytes([hdr[2], hdr[3]]) & NLA_TYPE_MASK;

    if len < NLA_HDRLEN {
        return cut();
    }

    let payload = take_bytes(input, len - NLA_HDRLEN)?;

    // The last attribute may omit its padding.
    let padding = (nla_align(len) - len).min(input.len());
    take_bytes(input, padding)?;

    Ok((kind, payload))
}

/// Parse all attributes from the remaining input.
pub fn parse_attrs<'a>(input: &mut &'a [u8]) -> PResult<Vec<(u16, &'a [u8])>> {
    let mut attrs = Vec::new();
    while input.len() >= NLA_HDRLEN {
        attrs.push(parse_attr(input)?);
    }
    // Sub-header trailing bytes are padding.
    *input = &[];
    Ok(attrs)
}

/// Lift an attribute helper error into the parser error type.
pub(crate) fn lift<T>(value: Result<T>) -> PResult<T> {
    value.or_else(|_| cut())
}
