use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Outcome taxonomy for a single TCP connect attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Open,
    /// Not probed yet, or left outstanding by a cancelled scan.
    Unchecked,
    /// Refused or unreachable.
    Closed,
    /// No answer before the deadline; usually a filtering firewall.
    Timeout,
    /// The local process ran out of descriptors or socket buffers while dialing.
    ResourceExhausted,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "PortOpen",
            PortState::Unchecked => "PortUnchecked",
            PortState::Closed => "PortClosed",
            PortState::Timeout => "PortTimeout",
            PortState::ResourceExhausted => "PortResourceExhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PortState::Unchecked)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ENFILE, EMFILE, ENOBUFS
#[cfg(any(target_os = "linux", target_os = "android"))]
const EXHAUSTION_CODES: &[i32] = &[23, 24, 105];

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const EXHAUSTION_CODES: &[i32] = &[23, 24, 55];

#[cfg(windows)]
const EXHAUSTION_CODES: &[i32] = &[
    10024, // WSAEMFILE
    10055, // WSAENOBUFS
];

#[cfg(not(any(unix, windows)))]
const EXHAUSTION_CODES: &[i32] = &[];

/// Map the outcome of a connect attempt to a terminal [`PortState`].
///
/// `None` means the handshake completed. Descriptor exhaustion is checked
/// before anything else: it describes the local process, not the remote port,
/// and must never be reported as `Closed`.
pub fn classify(outcome: Option<&io::Error>) -> PortState {
    let Some(err) = outcome else {
        return PortState::Open;
    };

    if is_resource_exhausted(err) {
        return PortState::ResourceExhausted;
    }

    match err.kind() {
        io::ErrorKind::TimedOut => PortState::Timeout,
        _ => PortState::Closed,
    }
}

fn is_resource_exhausted(err: &io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        if EXHAUSTION_CODES.contains(&code) {
            return true;
        }
    }
    err.to_string()
        .to_ascii_lowercase()
        .contains("too many open files")
}

/// A single host/port pair to dial.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of exactly one probe attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub target: ProbeTarget,
    pub state: PortState,
    /// Connect latency, only recorded for open ports.
    pub latency_ms: Option<u64>,
}

impl ProbeResult {
    pub fn new(target: ProbeTarget, state: PortState) -> Self {
        Self {
            target,
            state,
            latency_ms: None,
        }
    }

    pub fn open(target: ProbeTarget, latency: Duration) -> Self {
        Self {
            target,
            state: PortState::Open,
            latency_ms: Some(latency.as_millis() as u64),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.target, self.state)
    }
}

/// Scan input: a host and an inclusive port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub per_attempt_timeout: Duration,
}

impl ScanRequest {
    pub fn new(
        host: impl Into<String>,
        ports: RangeInclusive<u16>,
        per_attempt_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port_range_start: *ports.start(),
            port_range_end: *ports.end(),
            per_attempt_timeout,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        if self.port_range_start == 0 {
            return Err(ValidationError::PortOutOfRange { port: 0 });
        }
        if self.port_range_start > self.port_range_end {
            return Err(ValidationError::InvertedRange {
                start: self.port_range_start,
                end: self.port_range_end,
            });
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ValidationError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn port_count(&self) -> usize {
        if self.port_range_start > self.port_range_end {
            return 0;
        }
        (self.port_range_end - self.port_range_start) as usize + 1
    }
}

/// Every per-port result of one scan, sorted by port.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanReport {
    pub host: String,
    pub results: Vec<ProbeResult>,
    pub cancelled: bool,
}

impl ScanReport {
    /// Targets that accepted a connection.
    pub fn open(&self) -> BTreeSet<ProbeTarget> {
        self.results
            .iter()
            .filter(|r| r.is_open())
            .map(|r| r.target.clone())
            .collect()
    }

    pub fn count(&self, state: PortState) -> usize {
        self.results.iter().filter(|r| r.state == state).count()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|r| r.state.is_terminal())
    }

    /// Plain-text rendering: one `host:port PortOpen` line per open port.
    pub fn render_open_lines(&self) -> String {
        let mut out = String::new();
        for r in self.results.iter().filter(|r| r.is_open()) {
            out.push_str(&r.to_string());
            out.push('\n');
        }
        out
    }
}
