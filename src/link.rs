//! Link management
//!
//! [`LinkManager`] owns one transport connection and hands lines to the
//! decoder. A read fault moves the link to `Degraded` and triggers an
//! immediate close+open; further attempts follow the injected
//! [`RetryPolicy`]. Only an exhausted policy surfaces to the caller, as
//! [`LinkError::Fatal`].

use crate::error::{ConnectionError, LinkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default serial baud rate of the motion sensor
pub const DEFAULT_BAUD: u32 = 115_200;

/// Connection state as seen by the ingestion loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Faulted; a reconnect is in progress or pending
    Degraded,
}

/// Where the line stream comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Networked device, `host:port`
    Tcp(String),
    /// Serial device node or recorded capture file
    Device(PathBuf),
    Stdin,
}

impl LinkTarget {
    /// Parse `tcp://host:port`, `host:port`, `-` or a path
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConnectionError::InvalidTarget("empty target".into()));
        }
        if raw == "-" {
            return Ok(LinkTarget::Stdin);
        }
        if let Some(addr) = raw.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(ConnectionError::InvalidTarget(raw.to_string()));
            }
            return Ok(LinkTarget::Tcp(addr.to_string()));
        }
        if looks_like_host_port(raw) {
            return Ok(LinkTarget::Tcp(raw.to_string()));
        }
        Ok(LinkTarget::Device(PathBuf::from(raw)))
    }
}

fn looks_like_host_port(raw: &str) -> bool {
    if raw.contains('/') || raw.contains('\\') {
        return false;
    }
    match raw.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkTarget::Tcp(addr) => write!(f, "tcp://{addr}"),
            LinkTarget::Device(path) => write!(f, "{}", path.display()),
            LinkTarget::Stdin => f.write_str("stdin"),
        }
    }
}

/// Transport options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkOptions {
    pub baud: u32,
    pub connect_timeout: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Delay between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based, after the immediate attempt)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// How hard to try before declaring the link lost
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failed reconnects tolerated; `None` retries forever
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            backoff: Backoff::Exponential {
                initial_ms: 100,
                max_ms: 5_000,
            },
        }
    }
}

impl RetryPolicy {
    /// Retry forever without delay
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::None,
        }
    }

    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
        }
    }
}

/// A line-oriented byte stream that can be reopened
pub trait Transport {
    /// Establish the connection
    fn open(&mut self, target: &LinkTarget, options: &LinkOptions) -> Result<(), ConnectionError>;

    /// Next complete line without its terminator
    ///
    /// `Ok(None)` means the timeout elapsed without a full line.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError>;

    /// Release resources; safe to call repeatedly
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, target: &LinkTarget, options: &LinkOptions) -> Result<(), ConnectionError> {
        (**self).open(target, options)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        (**self).read_line(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub lines_read: u64,
    pub faults: u64,
    pub reconnects: u64,
}

type TransitionObserver = Box<dyn FnMut(LinkState, LinkState) + Send>;

/// Supervises one transport: open, read, detect faults, reconnect
pub struct LinkManager<T: Transport> {
    transport: T,
    target: LinkTarget,
    options: LinkOptions,
    policy: RetryPolicy,
    state: LinkState,
    stats: LinkStats,
    observer: Option<TransitionObserver>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<T: Transport> LinkManager<T> {
    pub fn new(transport: T, target: LinkTarget, options: LinkOptions) -> Self {
        Self {
            transport,
            target,
            options,
            policy: RetryPolicy::default(),
            state: LinkState::Disconnected,
            stats: LinkStats::default(),
            observer: None,
            cancel: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Abort pending reconnects once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Called with `(from, to)` on every state change
    pub fn on_transition<F>(&mut self, observer: F)
    where
        F: FnMut(LinkState, LinkState) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn target(&self) -> &LinkTarget {
        &self.target
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open the link; a failure leaves it `Disconnected`
    pub fn open(&mut self) -> Result<(), ConnectionError> {
        self.transition(LinkState::Connecting);
        match self.transport.open(&self.target, &self.options) {
            Ok(()) => {
                info!(target_link = %self.target, baud = self.options.baud, "link connected");
                self.transition(LinkState::Connected);
                Ok(())
            }
            Err(e) => {
                self.transition(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Read the next line, reconnecting on faults
    ///
    /// Returns `Ok(None)` on timeout and right after a successful reconnect.
    pub fn next_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        match self.state {
            LinkState::Connected => {}
            LinkState::Degraded => {
                self.reconnect("resuming degraded link".to_string())?;
                return Ok(None);
            }
            LinkState::Disconnected | LinkState::Connecting => return Err(LinkError::NotOpen),
        }

        match self.transport.read_line(timeout) {
            Ok(Some(line)) => {
                self.stats.lines_read += 1;
                Ok(Some(line))
            }
            Ok(None) => Ok(None),
            Err(LinkError::EndOfStream) => {
                info!(target_link = %self.target, "input stream ended");
                self.close();
                Err(LinkError::EndOfStream)
            }
            Err(e) => {
                self.stats.faults += 1;
                warn!(target_link = %self.target, error = %e, "link fault, reconnecting");
                self.transition(LinkState::Degraded);
                self.reconnect(e.to_string())?;
                Ok(None)
            }
        }
    }

    fn reconnect(&mut self, cause: String) -> Result<(), LinkError> {
        let mut last = cause;
        let mut attempt: u32 = 0;
        loop {
            if let Some(max) = self.policy.max_attempts {
                if attempt >= max {
                    warn!(target_link = %self.target, attempts = attempt, "giving up on link");
                    self.transport.close();
                    self.transition(LinkState::Disconnected);
                    return Err(LinkError::Fatal {
                        attempts: attempt,
                        last,
                    });
                }
            }
            if self.cancelled() {
                self.transport.close();
                self.transition(LinkState::Disconnected);
                return Err(LinkError::Cancelled);
            }
            if attempt > 0 {
                let delay = self.policy.backoff.delay(attempt);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            attempt += 1;

            self.transport.close();
            match self.transport.open(&self.target, &self.options) {
                Ok(()) => {
                    self.stats.reconnects += 1;
                    info!(target_link = %self.target, attempt, "link reconnected");
                    self.transition(LinkState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(target_link = %self.target, attempt, error = %e, "reconnect failed");
                    last = e.to_string();
                }
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Close the link; idempotent
    pub fn close(&mut self) {
        self.transport.close();
        self.transition(LinkState::Disconnected);
    }

    fn transition(&mut self, to: LinkState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(target_link = %self.target, ?from, ?to, "link state changed");
        if let Some(observer) = self.observer.as_mut() {
            observer(from, to);
        }
    }
}

impl<T: Transport> Drop for LinkManager<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}
