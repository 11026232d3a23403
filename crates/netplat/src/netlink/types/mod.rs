//! Kernel structures and attribute ids for the rtnetlink families we speak.

pub mod addr;
pub mod link;
pub mod route;
pub mod tc;
