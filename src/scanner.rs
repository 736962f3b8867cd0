use crate::error::ValidationError;
use crate::types::{classify, PortState, ProbeResult, ProbeTarget, ScanReport, ScanRequest};
use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound on simultaneous connect attempts, whatever the caller asks for.
pub const MAX_CONCURRENCY: usize = 5_000;

/// Tuning knobs for a [`Prober`].
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Max concurrent TCP connect attempts within one scan.
    pub concurrency: usize,
    /// Send a minimal HTTP request to every open port found by `scan`.
    pub verify: bool,
    /// Bytes read back during verification.
    pub verify_read_limit: usize,
    /// `Host` header for verification; defaults to the probed host.
    pub verify_host: Option<String>,
    /// Resource-exhausted results tolerated before dispatch pauses. 0 disables the pause.
    pub exhaustion_threshold: usize,
    /// How long dispatch pauses once the threshold is reached.
    pub exhaustion_backoff: Duration,
    /// Wall-clock bound for a whole scan.
    pub scan_deadline: Option<Duration>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            concurrency: 1000,
            verify: false,
            verify_read_limit: 256,
            verify_host: None,
            exhaustion_threshold: 16,
            exhaustion_backoff: Duration::from_millis(250),
            scan_deadline: None,
        }
    }
}

/// Live counters for a running scan. Cheap to clone; all clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub done: Arc<AtomicU64>,
    pub open: Arc<AtomicU64>,
    pub exhausted: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, state: PortState) {
        if !state.is_terminal() {
            return;
        }
        self.done.fetch_add(1, Ordering::Relaxed);
        match state {
            PortState::Open => {
                self.open.fetch_add(1, Ordering::Relaxed);
            }
            PortState::ResourceExhausted => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Counts resource-exhausted results and decides when dispatch should pause.
#[derive(Debug, Clone, Copy)]
struct ExhaustionGate {
    threshold: usize,
    seen: usize,
}

impl ExhaustionGate {
    /// A threshold of 0 never pauses.
    fn new(threshold: usize) -> Self {
        Self { threshold, seen: 0 }
    }

    fn record(&mut self, state: PortState) {
        if state == PortState::ResourceExhausted {
            self.seen += 1;
        }
    }

    /// Returns the count seen since the last pause once it reaches the
    /// threshold, and starts counting again from zero.
    fn take_pause(&mut self) -> Option<usize> {
        if self.threshold == 0 || self.seen < self.threshold {
            return None;
        }
        Some(std::mem::take(&mut self.seen))
    }
}

/// Concurrent TCP connect prober.
#[derive(Clone, Debug, Default)]
pub struct Prober {
    config: Arc<ProberConfig>,
}

impl Prober {
    pub fn new(config: ProberConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// One bounded connect attempt against `target`. Never fails: every
    /// outcome is encoded in the returned state.
    ///
    /// Name resolution counts against `timeout`. With `verify` set, an open
    /// port additionally gets a best-effort HTTP exchange whose outcome is only
    /// logged.
    pub async fn probe(&self, target: ProbeTarget, timeout: Duration, verify: bool) -> ProbeResult {
        let started = Instant::now();
        let connected = connect_within((target.host.as_str(), target.port), timeout).await;
        self.finish_probe(target, connected, started, timeout, verify)
            .await
    }

    /// Scan every port of `request` and return only the open targets.
    pub async fn scan_open(
        &self,
        request: &ScanRequest,
    ) -> Result<BTreeSet<ProbeTarget>, ValidationError> {
        Ok(self.scan(request).await?.open())
    }

    /// Scan every port of `request`, returning one result per port.
    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanReport, ValidationError> {
        self.scan_with_progress(request, CancellationToken::new(), SharedProgress::new())
            .await
    }

    /// Variant that accepts a `CancellationToken` to allow external cancellation.
    pub async fn scan_with_cancel(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanReport, ValidationError> {
        self.scan_with_progress(request, cancel, SharedProgress::new())
            .await
    }

    /// Full scan entry point.
    ///
    /// - Rejects malformed requests before anything is dialed.
    /// - Limits concurrent attempts with a `Semaphore`; each port runs as its own task.
    /// - Collects results from the `JoinSet`, so no collection is shared between tasks.
    /// - On cancellation (caller token or `scan_deadline`) ports without a
    ///   terminal result are reported as `Unchecked`.
    pub async fn scan_with_progress(
        &self,
        request: &ScanRequest,
        cancel: CancellationToken,
        progress: SharedProgress,
    ) -> Result<ScanReport, ValidationError> {
        request.validate()?;

        let host = request.host.trim().to_string();
        let start = request.port_range_start;
        let total = request.port_count();
        let timeout = request.per_attempt_timeout;
        progress.total.store(total as u64, Ordering::Relaxed);

        // Child token: cancelling it stops this scan only, never the caller's token.
        let scan_token = cancel.child_token();
        let _stop_deadline = scan_token.clone().drop_guard();
        if let Some(deadline) = self.config.scan_deadline {
            let token = scan_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = time::sleep(deadline) => {
                        debug!(?deadline, "scan deadline reached");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        info!(
            host = %host,
            start,
            end = request.port_range_end,
            ports = total,
            concurrency = self.config.concurrency,
            "starting scan"
        );
        let began = Instant::now();

        let mut slots: Vec<Option<ProbeResult>> = vec![None; total];

        match resolve(&host, timeout).await {
            Ok(ip) => {
                self.dispatch(&host, ip, request, &scan_token, &progress, &mut slots)
                    .await;
            }
            Err(err) => {
                let state = classify(Some(&err));
                warn!(host = %host, error = %err, %state, "could not resolve host");
                for (i, slot) in slots.iter_mut().enumerate() {
                    progress.record(state);
                    *slot = Some(ProbeResult::new(
                        ProbeTarget::new(host.clone(), start + i as u16),
                        state,
                    ));
                }
            }
        }

        let cancelled = scan_token.is_cancelled();
        let results: Vec<ProbeResult> = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    ProbeResult::new(
                        ProbeTarget::new(host.clone(), start + i as u16),
                        PortState::Unchecked,
                    )
                })
            })
            .collect();

        let report = ScanReport {
            host,
            results,
            cancelled,
        };
        info!(
            host = %report.host,
            open = report.count(PortState::Open),
            closed = report.count(PortState::Closed),
            timeout = report.count(PortState::Timeout),
            exhausted = report.count(PortState::ResourceExhausted),
            unchecked = report.count(PortState::Unchecked),
            cancelled,
            elapsed_ms = began.elapsed().as_millis() as u64,
            "scan finished"
        );
        Ok(report)
    }

    async fn dispatch(
        &self,
        host: &str,
        ip: IpAddr,
        request: &ScanRequest,
        token: &CancellationToken,
        progress: &SharedProgress,
        slots: &mut [Option<ProbeResult>],
    ) {
        let start = request.port_range_start;
        let timeout = request.per_attempt_timeout;
        let verify = self.config.verify;
        let sem = Arc::new(Semaphore::new(
            self.config.concurrency.clamp(1, MAX_CONCURRENCY),
        ));
        let mut set = JoinSet::new();
        let mut gate = ExhaustionGate::new(self.config.exhaustion_threshold);

        for port in request.ports() {
            while let Some(joined) = set.try_join_next() {
                if let Some(state) = self.collect(joined, start, progress, slots) {
                    gate.record(state);
                }
            }

            if let Some(seen) = gate.take_pause() {
                warn!(
                    host,
                    port,
                    exhausted = seen,
                    backoff = ?self.config.exhaustion_backoff,
                    "local socket resources exhausted, pausing dispatch"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(self.config.exhaustion_backoff) => {}
                }
            }

            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let target = ProbeTarget::new(host, port);
            let addr = SocketAddr::new(ip, port);
            let prober = self.clone();
            let token = token.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                let unchecked = ProbeResult::new(target.clone(), PortState::Unchecked);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => unchecked,
                    result = prober.probe_addr(target, addr, timeout, verify) => result,
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            self.collect(joined, start, progress, slots);
        }
    }

    /// Store one task's result in its slot and return its state.
    fn collect(
        &self,
        joined: Result<ProbeResult, JoinError>,
        start: u16,
        progress: &SharedProgress,
        slots: &mut [Option<ProbeResult>],
    ) -> Option<PortState> {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "probe task did not complete");
                return None;
            }
        };

        progress.record(result.state);
        let state = result.state;
        let idx = (result.target.port - start) as usize;
        if let Some(slot) = slots.get_mut(idx) {
            *slot = Some(result);
        }
        Some(state)
    }

    async fn probe_addr(
        &self,
        target: ProbeTarget,
        addr: SocketAddr,
        timeout: Duration,
        verify: bool,
    ) -> ProbeResult {
        let started = Instant::now();
        let connected = connect_within(addr, timeout).await;
        self.finish_probe(target, connected, started, timeout, verify)
            .await
    }

    async fn finish_probe(
        &self,
        target: ProbeTarget,
        connected: io::Result<TcpStream>,
        started: Instant,
        timeout: Duration,
        verify: bool,
    ) -> ProbeResult {
        match connected {
            Ok(mut stream) => {
                let latency = started.elapsed();
                if verify {
                    self.verify_http(&mut stream, &target, timeout).await;
                }
                trace!(endpoint = %target, latency_ms = latency.as_millis() as u64, "port open");
                ProbeResult::open(target, latency)
                // `stream` is dropped here, closing the socket.
            }
            Err(err) => {
                let state = classify(Some(&err));
                if state == PortState::ResourceExhausted {
                    warn!(endpoint = %target, error = %err, "connect failed: out of local sockets");
                } else {
                    debug!(endpoint = %target, error = %err, %state, "port not open");
                }
                ProbeResult::new(target, state)
            }
        }
    }

    /// Best-effort HTTP liveness exchange. Outcomes are logged; none of them
    /// change the port's state.
    async fn verify_http(&self, stream: &mut TcpStream, target: &ProbeTarget, timeout: Duration) {
        let host = self.config.verify_host.as_deref().unwrap_or(&target.host);
        let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");

        match time::timeout(timeout, stream.write_all(request.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(endpoint = %target, error = %e, "verification write failed");
                return;
            }
            Err(_) => {
                debug!(endpoint = %target, "verification write timed out");
                return;
            }
        }

        let mut buf = vec![0u8; self.config.verify_read_limit.max(1)];
        match time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => debug!(endpoint = %target, "verification read hit end of stream"),
            Ok(Ok(n)) => debug!(
                endpoint = %target,
                bytes = n,
                response = %printable(&buf[..n]),
                "verification read back"
            ),
            Ok(Err(e)) => warn!(endpoint = %target, error = %e, "verification read failed"),
            Err(_) => debug!(endpoint = %target, "verification read timed out"),
        }
    }
}

/// TCP connect bounded by `timeout`. An elapsed deadline surfaces as `ErrorKind::TimedOut`.
async fn connect_within<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<TcpStream> {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect deadline elapsed",
        )),
    }
}

async fn resolve(host: &str, timeout: Duration) -> io::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = match time::timeout(timeout, lookup_host((host, 0))).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "name resolution deadline elapsed",
            ))
        }
    };
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))
}

/// Lossy UTF-8 with line breaks escaped, for single-line log output.
fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_escapes_line_breaks() {
        assert_eq!(printable(b"HTTP/1.1 200 OK\r\n"), "HTTP/1.1 200 OK\\r\\n");
    }

    #[test]
    fn progress_counts_terminal_states_only() {
        let p = SharedProgress::new();
        p.record(PortState::Open);
        p.record(PortState::Closed);
        p.record(PortState::ResourceExhausted);
        p.record(PortState::Unchecked);
        assert_eq!(p.done.load(Ordering::Relaxed), 3);
        assert_eq!(p.open.load(Ordering::Relaxed), 1);
        assert_eq!(p.exhausted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn gate_pauses_at_threshold_and_resets() {
        let mut gate = ExhaustionGate::new(3);
        gate.record(PortState::ResourceExhausted);
        gate.record(PortState::Closed);
        gate.record(PortState::ResourceExhausted);
        assert_eq!(gate.take_pause(), None);

        gate.record(PortState::ResourceExhausted);
        assert_eq!(gate.take_pause(), Some(3));
        assert_eq!(gate.take_pause(), None);

        gate.record(PortState::ResourceExhausted);
        gate.record(PortState::ResourceExhausted);
        assert_eq!(gate.take_pause(), None);
    }

    #[test]
    fn gate_ignores_other_states() {
        let mut gate = ExhaustionGate::new(1);
        for s in [PortState::Open, PortState::Closed, PortState::Timeout, PortState::Unchecked] {
            gate.record(s);
        }
        assert_eq!(gate.take_pause(), None);
    }

    #[test]
    fn zero_threshold_never_pauses() {
        let mut gate = ExhaustionGate::new(0);
        for _ in 0..100 {
            gate.record(PortState::ResourceExhausted);
        }
        assert_eq!(gate.take_pause(), None);
    }

    #[tokio::test]
    async fn resolve_accepts_literal_addresses() {
        let ip = resolve("127.0.0.1", Duration::from_millis(50)).await.unwrap();
        assert_eq!(ip, IpAddr::from([127, 0, 0, 1]));
    }

    #[tokio::test]
    async fn unresolvable_host_marks_every_port() {
        let prober = Prober::default();
        let req = ScanRequest::new(
            "name.invalid",
            1..=3,
            Duration::from_millis(500),
        );
        let report = prober.scan(&req).await.unwrap();
        assert_eq!(report.results.len(), 3);
        assert!(report.open().is_empty());
        assert!(report.is_complete());
    }
}
