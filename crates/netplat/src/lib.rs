//! Kernel network state cache and synchronization engine over rtnetlink.
//!
//! `netplat` keeps an in-memory mirror of links, addresses, routes, qdiscs
//! and traffic filters, kept current by rtnetlink notifications, and
//! applies desired state to the kernel idempotently.
//!
//! The layers, bottom up:
//!
//! - [`netlink`]: message framing, attribute codec and the socket;
//! - [`transport`]: sequence numbers, ack/dump correlation, notifications;
//! - [`object`]: typed snapshots and their identity keys;
//! - [`cache`]: the mirror, with change subscriptions;
//! - [`capability`]: what the running kernel supports;
//! - [`platform`]: the context tying it together.
//!
//! # Features
//!
//! - `serde` - Serialize snapshots, outcomes and capability reports
//! - `testing` - In-process fake kernel ([`testing::FakeKernel`])
//! - `integration` - Tests against the real kernel (root required)
//!
//! # Example
//!
//! ```ignore
//! use netplat::{ApplyMode, Address, Link, Platform, PlatformConfig};
//!
//! #[tokio::main]
//! async fn main() -> netplat::Result<()> {
//!     let mut platform = Platform::open(PlatformConfig::default()).await?;
//!
//!     platform
//!         .apply(Link::dummy("test0").up(true).into(), ApplyMode::Add)
//!         .await?;
//!     let ifindex = platform.link_by_name("test0").map(|l| l.ifindex).unwrap_or(0);
//!     platform
//!         .apply(Address::parse_cidr(ifindex, "192.0.2.1/24")?.into(), ApplyMode::Add)
//!         .await?;
//!
//!     for addr in platform.cache().iter_by_interface(ifindex) {
//!         println!("{}", addr);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod capability;
pub mod config;
pub mod netlink;
pub mod object;
pub mod platform;
pub mod transport;

#[cfg(feature = "testing")]
pub mod testing;

pub use cache::{Cache, CacheChange, CacheEvent, ReconcileSummary, Subscription, SubscriptionFilter};
pub use capability::{CapabilityProbe, KernelSupport};
pub use config::{Namespace, PlatformConfig};
pub use netlink::{Error, Result, Status};
pub use object::{
    Address, FqCodelParams, Link, LinkKind, ObjectKey, ObjectKind, OperState, PlatformObject,
    Qdisc, QdiscOptions, Route, TcAction, TcHandle, Tfilter,
};
pub use platform::{ApplyMode, OpHandle, OpId, OperationOutcome, Platform};
