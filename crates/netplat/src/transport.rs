//! Request/reply correlation over a raw netlink channel.
//!
//! [`Transport`] stamps every outgoing request with a fresh sequence number
//! and remembers what kind of answer it expects. Incoming datagrams are split
//! into messages and sorted into [`TransportEvent`]s:
//!
//! - `NLMSG_ERROR` with a pending sequence number becomes a [`Reply`] (an ack
//!   is an error message with errno 0);
//! - object messages belonging to a pending dump are buffered until
//!   `NLMSG_DONE` arrives, or handed out as [`TransportEvent::DumpChunk`]s in
//!   incremental mode;
//! - every other object message is a change notification. This includes the
//!   notifications the kernel emits for our own requests, which carry our
//!   sequence number;
//! - `ENOBUFS` on receive and `NLMSG_OVERRUN` become [`TransportEvent::Overrun`].
//!
//! Messages that fail to parse are logged and skipped.

use std::collections::HashMap;
use std::future::Future;

use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{MessageIter, NLM_F_DUMP_INTR, NlMsgError, NlMsgHdr, NlMsgType};
use crate::object::{ChangeKind, ObjectKind, PlatformObject};

/// Raw datagram I/O with the kernel.
///
/// Implemented by [`NetlinkSocket`](crate::netlink::socket::NetlinkSocket)
/// and, with the `testing` feature, by
/// [`FakeKernel`](crate::testing::FakeKernel).
pub trait NetlinkIo {
    /// Local port id; the kernel addresses replies to it.
    fn port_id(&self) -> u32;

    /// Whether extended acks (kernel error strings) are enabled.
    fn extended_ack(&self) -> bool;

    /// Whether strict dump checking is enabled.
    fn strict_check(&self) -> bool;

    /// Send one datagram.
    fn send(&self, msg: &[u8]) -> impl Future<Output = Result<()>>;

    /// Receive one datagram. Must be cancel safe.
    fn recv(&self) -> impl Future<Output = Result<Vec<u8>>>;
}

/// Correlates a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u32);

impl Token {
    pub fn seq(self) -> u32 {
        self.0
    }
}

/// How dump results are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    /// Hold everything until `NLMSG_DONE`.
    #[default]
    Buffered,
    /// Emit a [`TransportEvent::DumpChunk`] per datagram.
    Incremental,
}

/// Successful completion of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    Dump {
        kind: ObjectKind,
        /// Everything the dump returned; empty in incremental mode.
        objects: Vec<PlatformObject>,
        /// The kernel flagged the dump as inconsistent (`NLM_F_DUMP_INTR`).
        interrupted: bool,
    },
}

/// Something that came in from the kernel.
#[derive(Debug)]
pub enum TransportEvent {
    Reply {
        token: Token,
        result: Result<Reply>,
    },
    DumpChunk {
        token: Token,
        objects: Vec<PlatformObject>,
    },
    Notification {
        kind: ObjectKind,
        change: ChangeKind,
        object: PlatformObject,
    },
    /// Notifications were lost; the cache can no longer be trusted.
    Overrun,
}

#[derive(Debug)]
enum Pending {
    Ack,
    Dump {
        kind: ObjectKind,
        mode: DumpMode,
        objects: Vec<PlatformObject>,
        interrupted: bool,
    },
}

/// Sequence-number bookkeeping on top of a [`NetlinkIo`].
pub struct Transport<S> {
    io: S,
    seq: u32,
    pending: HashMap<u32, Pending>,
}

impl<S: NetlinkIo> Transport<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            seq: 0,
            pending: HashMap::new(),
        }
    }

    pub fn io(&self) -> &S {
        &self.io
    }

    pub fn port_id(&self) -> u32 {
        self.io.port_id()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn next_seq(&mut self) -> u32 {
        // 0 marks kernel-originated messages.
        self.seq = self.seq.wrapping_add(1).max(1);
        self.seq
    }

    async fn send_tracked(&mut self, mut builder: MessageBuilder, pending: Pending) -> Result<Token> {
        let seq = self.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.io.port_id());
        let msg_type = builder.msg_type();
        let flags = builder.flags();
        let msg = builder.finish();

        self.io.send(&msg).await?;
        tracing::debug!(seq, msg_type, flags = format_args!("{:#x}", flags), "request sent");
        self.pending.insert(seq, pending);
        Ok(Token(seq))
    }

    /// Send a request that is answered by an ack.
    pub async fn send(&mut self, builder: MessageBuilder) -> Result<Token> {
        self.send_tracked(builder, Pending::Ack).await
    }

    /// Send a dump request for objects of `kind`.
    pub async fn send_dump(
        &mut self,
        builder: MessageBuilder,
        kind: ObjectKind,
        mode: DumpMode,
    ) -> Result<Token> {
        self.send_tracked(
            builder,
            Pending::Dump {
                kind,
                mode,
                objects: Vec::new(),
                interrupted: false,
            },
        )
        .await
    }

    /// Forget a request. A reply that still arrives is ignored.
    pub fn cancel(&mut self, token: Token) -> bool {
        self.pending.remove(&token.0).is_some()
    }

    /// Wait for the next datagram and return what it contained.
    ///
    /// Cancel safe as long as [`NetlinkIo::recv`] is.
    pub async fn poll(&mut self) -> Result<Vec<TransportEvent>> {
        let data = match self.io.recv().await {
            Ok(data) => data,
            Err(e) if e.is_overrun() => {
                tracing::warn!("receive buffer overrun, notifications were lost");
                return Ok(vec![TransportEvent::Overrun]);
            }
            Err(e) => return Err(e),
        };
        tracing::trace!(bytes = data.len(), "datagram");

        let mut events = Vec::new();
        for msg in MessageIter::new(&data) {
            match msg {
                Ok((header, payload)) => self.dispatch(header, payload, &mut events),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed datagram tail");
                    break;
                }
            }
        }
        Ok(events)
    }

    fn ours(&self, header: &NlMsgHdr) -> bool {
        header.nlmsg_seq != 0
            && header.nlmsg_pid == self.io.port_id()
            && self.pending.contains_key(&header.nlmsg_seq)
    }

    fn dispatch(&mut self, header: &NlMsgHdr, payload: &[u8], events: &mut Vec<TransportEvent>) {
        let seq = header.nlmsg_seq;

        if header.is_overrun() {
            tracing::warn!("kernel reported NLMSG_OVERRUN");
            events.push(TransportEvent::Overrun);
            return;
        }

        if header.is_error() {
            if !self.ours(header) {
                tracing::debug!(seq, "ignoring stray error message");
                return;
            }
            let result = match NlMsgError::from_bytes(payload) {
                Ok(err) if err.is_ack() => self.complete(seq),
                Ok(err) => {
                    self.pending.remove(&seq);
                    Err(err.to_error(payload))
                }
                Err(e) => {
                    self.pending.remove(&seq);
                    Err(e)
                }
            };
            events.push(TransportEvent::Reply {
                token: Token(seq),
                result,
            });
            return;
        }

        if header.is_done() {
            if !self.ours(header) {
                return;
            }
            if header.nlmsg_flags & NLM_F_DUMP_INTR != 0 {
                self.mark_interrupted(seq);
            }
            // A dump that failed part way reports the errno in the DONE payload.
            let errno = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(i32::from_ne_bytes)
                .unwrap_or(0);
            let result = if errno < 0 {
                self.pending.remove(&seq);
                Err(Error::from_errno(errno))
            } else {
                self.complete(seq)
            };
            events.push(TransportEvent::Reply {
                token: Token(seq),
                result,
            });
            return;
        }

        if header.nlmsg_type == NlMsgType::NOOP {
            return;
        }

        let decoded = match PlatformObject::decode(header.nlmsg_type, payload) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                tracing::trace!(msg_type = header.nlmsg_type, "ignoring message");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    msg_type = header.nlmsg_type,
                    seq,
                    error = %e,
                    "skipping unparseable message"
                );
                return;
            }
        };

        if header.nlmsg_flags & NLM_F_DUMP_INTR != 0 {
            self.mark_interrupted(seq);
        }

        let (change, object) = decoded;
        let from_us = header.nlmsg_pid == self.io.port_id();
        if let Some(Pending::Dump {
            kind, mode, objects, ..
        }) = self.pending.get_mut(&seq).filter(|_| from_us)
        {
            if object.kind() != *kind {
                tracing::trace!(expected = %kind, got = %object.kind(), "foreign object in dump");
                return;
            }
            match mode {
                DumpMode::Buffered => objects.push(object),
                DumpMode::Incremental => match events.last_mut() {
                    Some(TransportEvent::DumpChunk { token, objects }) if token.0 == seq => {
                        objects.push(object)
                    }
                    _ => events.push(TransportEvent::DumpChunk {
                        token: Token(seq),
                        objects: vec![object],
                    }),
                },
            }
            return;
        }

        events.push(TransportEvent::Notification {
            kind: object.kind(),
            change,
            object,
        });
    }

    fn mark_interrupted(&mut self, seq: u32) {
        if let Some(Pending::Dump { interrupted, .. }) = self.pending.get_mut(&seq) {
            *interrupted = true;
        }
    }

    fn complete(&mut self, seq: u32) -> Result<Reply> {
        match self.pending.remove(&seq) {
            Some(Pending::Dump {
                kind,
                objects,
                interrupted,
                ..
            }) => {
                if interrupted {
                    tracing::warn!(%kind, "dump was interrupted by a concurrent change");
                }
                Ok(Reply::Dump {
                    kind,
                    objects,
                    interrupted,
                })
            }
            _ => Ok(Reply::Ack),
        }
    }
}
