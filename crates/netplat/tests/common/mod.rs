//! Helpers for tests that talk to the real kernel.
//!
//! Each test gets its own network namespace, created with `ip netns` and
//! removed on drop, so nothing leaks onto the host.

use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use netplat::{Error, Platform, PlatformConfig, Result};
use netplat::netlink::NetlinkSocket;

static NAMESPACE_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_ns_name(prefix: &str) -> String {
    let id = NAMESPACE_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("netplat-test-{}-{}-{}", prefix, std::process::id(), id)
}

/// A disposable network namespace.
pub struct TestNamespace {
    name: String,
}

impl TestNamespace {
    pub fn new(prefix: &str) -> Result<Self> {
        let name = unique_ns_name(prefix);
        let status = Command::new("ip")
            .args(["netns", "add", &name])
            .status()
            .map_err(|e| Error::Io(io::Error::from(e.kind())))?;
        if !status.success() {
            return Err(Error::InvalidMessage(format!(
                "failed to create namespace: {}",
                name
            )));
        }
        Ok(Self { name })
    }

    #[allow(dead_code)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A platform whose socket lives in this namespace.
    pub async fn platform(&self) -> Result<Platform<NetlinkSocket>> {
        Platform::open(PlatformConfig::new().namespace_named(&self.name)).await
    }

    /// Run a command inside the namespace and return its stdout.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("ip")
            .args(["netns", "exec", &self.name, cmd])
            .args(args)
            .output()
            .map_err(|e| Error::Io(io::Error::from(e.kind())))?;
        if !output.status.success() {
            return Err(Error::InvalidMessage(format!(
                "command failed: {} {:?}: {}",
                cmd,
                args,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let _ = Command::new("ip").args(["netns", "del", &self.name]).status();
    }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Return early from a test that needs root.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ns_name() {
        let a = unique_ns_name("x");
        let b = unique_ns_name("x");
        assert_ne!(a, b);
        assert!(a.starts_with("netplat-test-x-"));
    }
}
