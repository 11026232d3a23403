//! rtnetlink wire layer: framing, attributes, kernel structs and the socket.

pub mod attr;
pub mod builder;
pub mod error;
pub mod message;
pub mod parse;
pub mod socket;
pub mod types;

pub use builder::MessageBuilder;
pub use error::{Error, Result, Status};
pub use message::{MessageIter, NlMsgError, NlMsgHdr, NlMsgType};
pub use parse::FromNetlink;
pub use socket::{NetlinkSocket, SocketOptions};
