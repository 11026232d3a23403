//! Platform configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::capability::KernelSupport;

/// Where the platform socket lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Namespace {
    /// The namespace of the calling thread.
    #[default]
    Current,
    /// A named namespace under `/var/run/netns`.
    Named(String),
    /// A namespace file such as `/proc/<pid>/ns/net`.
    Path(PathBuf),
}

impl Namespace {
    /// The namespace file to enter, if any.
    pub fn path(&self) -> Option<PathBuf> {
        match self {
            Namespace::Current => None,
            Namespace::Named(name) => Some(PathBuf::from("/var/run/netns").join(name)),
            Namespace::Path(path) => Some(path.clone()),
        }
    }
}

/// Timeouts, retry policy and socket setup for a [`Platform`](crate::Platform).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use netplat::PlatformConfig;
///
/// let config = PlatformConfig::new()
///     .ack_timeout(Duration::from_secs(2))
///     .max_retries(5)
///     .namespace_named("test-ns");
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub ack_timeout: Duration,
    pub confirm_timeout: Duration,
    pub max_retries: u32,
    /// First retry delay; doubled per attempt.
    pub retry_backoff: Duration,
    pub dump_retries: u32,
    pub recv_buffer_size: usize,
    pub echo: bool,
    /// Skip probing and use these capabilities.
    pub kernel_support: Option<KernelSupport>,
    pub module_root: PathBuf,
    pub namespace: Namespace,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            confirm_timeout: Duration::from_millis(250),
            max_retries: 3,
            retry_backoff: Duration::from_millis(20),
            dump_retries: 3,
            recv_buffer_size: 4 * 1024 * 1024,
            echo: false,
            kernel_support: None,
            module_root: PathBuf::from("/"),
            namespace: Namespace::Current,
        }
    }
}

impl PlatformConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn dump_retries(mut self, retries: u32) -> Self {
        self.dump_retries = retries;
        self
    }

    pub fn recv_buffer_size(mut self, bytes: usize) -> Self {
        self.recv_buffer_size = bytes;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn kernel_support(mut self, support: KernelSupport) -> Self {
        self.kernel_support = Some(support);
        self
    }

    pub fn module_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.module_root = root.into();
        self
    }

    pub fn namespace_named(mut self, name: impl Into<String>) -> Self {
        self.namespace = Namespace::Named(name.into());
        self
    }

    pub fn namespace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.namespace = Namespace::Path(path.into());
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlatformConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.confirm_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.recv_buffer_size, 4 * 1024 * 1024);
        assert!(config.kernel_support.is_none());
        assert_eq!(config.namespace, Namespace::Current);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = PlatformConfig::new().retry_backoff(Duration::from_millis(10));
        assert_eq!(config.backoff_for(1), Duration::from_millis(10));
        assert_eq!(config.backoff_for(2), Duration::from_millis(20));
        assert_eq!(config.backoff_for(4), Duration::from_millis(80));
    }

    #[test]
    fn test_namespace_paths() {
        assert_eq!(Namespace::Current.path(), None);
        assert_eq!(
            Namespace::Named("blue".into()).path(),
            Some(PathBuf::from("/var/run/netns/blue"))
        );
    }
}
