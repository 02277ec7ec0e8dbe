//! Generic request/retry/correlation exchange engine.
//!
//! One exchange is one logical request/response interaction with a
//! device, possibly spanning several retransmissions. The engine owns a
//! private response bus and a protocol-specific [`ExchangeCodec`]; it
//! never touches sockets. Retransmits reuse the identical bytes (same
//! nonce) with exponentially growing deadlines; datagrams that fail to
//! decode or fail to correlate are noise, discarded while waiting.
//!
//! NAT-PMP and UPnP-IGD engines reuse this component by injecting their
//! own codec; nothing here is PCP-specific.

use crate::error::PcpError;
use burrow_bus::{Bus, next_id, spawn_worker};
use burrow_gateways::{NetEvent, NetRequest};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Protocol strategy injected into an exchange.
///
/// The engine treats the wire format as opaque: the codec produces the
/// request bytes once, and decides for each inbound datagram whether it
/// is the matching response.
pub trait ExchangeCodec {
    /// Decoded response type yielded on a match.
    type Output;

    /// Encode the request. Called once; retransmissions reuse the bytes
    /// so the correlation nonce stays stable across attempts.
    fn request_bytes(&self) -> Vec<u8>;

    /// Try to match an inbound datagram against this exchange.
    ///
    /// Returns `None` both for undecodable datagrams and for valid
    /// responses correlated to some other exchange; either way the
    /// engine keeps waiting.
    fn match_response(&self, payload: &[u8]) -> Option<Self::Output>;
}

/// Retransmission schedule for one exchange.
///
/// The nth attempt waits `base * 2^(n-1)`, capped at `cap`; after
/// `max_attempts` unanswered attempts the exchange times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first send
    pub base: Duration,
    /// Ceiling applied to every computed wait
    pub cap: Duration,
    /// Total number of sends before giving up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(8),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Short schedule for discovery probes, where an absent device is
    /// the common case and should resolve quickly.
    #[must_use]
    pub fn discovery() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(1),
            max_attempts: 2,
        }
    }

    /// Wait for the given 1-based attempt: `base * 2^(attempt-1)`,
    /// capped at `cap`.
    #[must_use]
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base.saturating_mul(1 << exponent);
        scaled.min(self.cap)
    }

    /// Worst-case wall-clock time for a fully unanswered exchange.
    #[must_use]
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts).map(|n| self.timeout_for(n)).sum()
    }
}

/// Terminal outcome of a detached exchange, delivered as a message.
#[derive(Debug)]
pub enum Outcome<T> {
    /// A correlated response arrived
    Matched(T),
    /// The exchange failed; carries the same errors the blocking call
    /// shape returns
    Failed(PcpError),
}

/// Run one exchange, blocking the calling thread until a terminal
/// outcome.
///
/// Opens a private socket through the network gateway, sends the
/// codec's request to `device`, and waits on a private response bus;
/// retransmits per `policy`. The socket is closed before returning.
///
/// # Errors
///
/// - [`PcpError::Transport`] if the gateway reports an OS-level failure
/// - [`PcpError::Timeout`] if no matching response arrives within the
///   retry budget
pub fn run<C: ExchangeCodec>(
    codec: &C,
    net: &Bus<NetRequest>,
    device: SocketAddr,
    policy: &RetryPolicy,
) -> Result<C::Output, PcpError> {
    let reply = Bus::new();
    let socket_id = next_id();
    net.send(NetRequest::OpenSocket {
        id: socket_id,
        local_addr: unspecified_local(device),
        reply: reply.clone(),
    });

    // Bounded wait: a gateway that was shut down never answers.
    let open_deadline = Instant::now() + policy.total_budget();
    loop {
        match reply.recv_deadline(open_deadline) {
            Some(NetEvent::SocketOpened { id, .. }) if id == socket_id => break,
            Some(NetEvent::Error { id, cause }) if id == socket_id => {
                return Err(PcpError::Transport(cause));
            }
            Some(other) => trace!("ignoring event while opening socket: {other:?}"),
            None => return Err(PcpError::Timeout),
        }
    }

    let result = run_attempts(codec, net, device, socket_id, &reply, policy);
    net.send(NetRequest::CloseSocket { socket: socket_id });
    result
}

/// Run one exchange without blocking the caller: the terminal outcome
/// is delivered to `reply` instead.
pub fn run_detached<C>(
    codec: C,
    net: Bus<NetRequest>,
    device: SocketAddr,
    policy: RetryPolicy,
    reply: Bus<Outcome<C::Output>>,
) where
    C: ExchangeCodec + Send + 'static,
    C::Output: Send + 'static,
{
    let _ = spawn_worker("burrow-exchange", move || {
        let outcome = match run(&codec, &net, device, &policy) {
            Ok(output) => Outcome::Matched(output),
            Err(e) => Outcome::Failed(e),
        };
        reply.send(outcome);
    });
}

fn run_attempts<C: ExchangeCodec>(
    codec: &C,
    net: &Bus<NetRequest>,
    device: SocketAddr,
    socket_id: u64,
    reply: &Bus<NetEvent>,
    policy: &RetryPolicy,
) -> Result<C::Output, PcpError> {
    let request = codec.request_bytes();

    for attempt in 1..=policy.max_attempts {
        net.send(NetRequest::WriteDatagram {
            id: next_id(),
            socket: socket_id,
            dest: device,
            payload: request.clone(),
            reply: reply.clone(),
        });
        let deadline = Instant::now() + policy.timeout_for(attempt);

        while let Some(event) = reply.recv_deadline(deadline) {
            match event {
                NetEvent::WriteAck { .. } => {}
                NetEvent::DatagramReceived { source, payload } => {
                    if let Some(output) = codec.match_response(&payload) {
                        debug!("exchange with {device} matched on attempt {attempt}");
                        return Ok(output);
                    }
                    trace!("discarding unmatched datagram from {source}");
                }
                NetEvent::Error { cause, .. } => {
                    warn!("exchange with {device} failed: {cause}");
                    return Err(PcpError::Transport(cause));
                }
                other => trace!("ignoring event: {other:?}"),
            }
        }
        debug!(
            "exchange with {device}: attempt {attempt}/{} timed out, retrying",
            policy.max_attempts
        );
    }

    debug!("exchange with {device} exhausted its retry budget");
    Err(PcpError::Timeout)
}

/// Unspecified local bind address in the device's address family.
fn unspecified_local(device: SocketAddr) -> SocketAddr {
    if device.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Codec that matches any datagram equal to its expected bytes.
    struct ByteCodec {
        request: Vec<u8>,
        expected: Vec<u8>,
    }

    impl ExchangeCodec for ByteCodec {
        type Output = Vec<u8>;

        fn request_bytes(&self) -> Vec<u8> {
            self.request.clone()
        }

        fn match_response(&self, payload: &[u8]) -> Option<Vec<u8>> {
            (payload == self.expected.as_slice()).then(|| payload.to_vec())
        }
    }

    /// In-process stand-in for the network gateway: honors the message
    /// contract without any real sockets. `respond` maps each write's
    /// payload to the datagrams delivered back, once `answer_after`
    /// writes have been seen.
    fn fake_gateway(
        responses: Vec<Vec<u8>>,
        answer_after: u32,
        writes: Arc<AtomicU32>,
    ) -> Bus<NetRequest> {
        let bus: Bus<NetRequest> = Bus::new();
        let inbox = bus.clone();
        let _ = spawn_worker("fake-net", move || {
            let device: SocketAddr = "192.0.2.1:5351".parse().unwrap();
            loop {
                match inbox.recv() {
                    NetRequest::OpenSocket { id, reply, .. } => {
                        reply.send(NetEvent::SocketOpened {
                            id,
                            local_addr: "127.0.0.1:50000".parse().unwrap(),
                        });
                    }
                    NetRequest::WriteDatagram { id, reply, .. } => {
                        let seen = writes.fetch_add(1, Ordering::SeqCst) + 1;
                        reply.send(NetEvent::WriteAck { id, bytes: 0 });
                        if seen >= answer_after {
                            for payload in &responses {
                                reply.send(NetEvent::DatagramReceived {
                                    source: device,
                                    payload: payload.clone(),
                                });
                            }
                        }
                    }
                    NetRequest::CloseSocket { .. } => break,
                    NetRequest::Shutdown => break,
                    NetRequest::GetLocalAddresses { reply } => {
                        reply.send(NetEvent::LocalAddresses(Vec::new()));
                    }
                }
            }
        });
        bus
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(30),
            cap: Duration::from_millis(200),
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(8),
            max_attempts: 8,
        };
        assert_eq!(policy.timeout_for(1), Duration::from_millis(250));
        assert_eq!(policy.timeout_for(2), Duration::from_millis(500));
        assert_eq!(policy.timeout_for(3), Duration::from_secs(1));
        assert_eq!(policy.timeout_for(6), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(policy.timeout_for(7), Duration::from_secs(8));
        assert_eq!(policy.timeout_for(8), Duration::from_secs(8));
    }

    #[test]
    fn test_total_budget_is_the_schedule_sum() {
        let policy = fast_policy(3);
        // 30 + 60 + 120
        assert_eq!(policy.total_budget(), Duration::from_millis(210));
    }

    #[test]
    fn test_match_on_first_attempt() {
        let writes = Arc::new(AtomicU32::new(0));
        let net = fake_gateway(vec![b"answer".to_vec()], 1, Arc::clone(&writes));
        let codec = ByteCodec {
            request: b"ask".to_vec(),
            expected: b"answer".to_vec(),
        };
        let device = "192.0.2.1:5351".parse().unwrap();
        let out = run(&codec, &net, device, &fast_policy(4)).unwrap();
        assert_eq!(out, b"answer");
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_then_match() {
        let writes = Arc::new(AtomicU32::new(0));
        let net = fake_gateway(vec![b"answer".to_vec()], 3, Arc::clone(&writes));
        let codec = ByteCodec {
            request: b"ask".to_vec(),
            expected: b"answer".to_vec(),
        };
        let device = "192.0.2.1:5351".parse().unwrap();
        let out = run(&codec, &net, device, &fast_policy(4)).unwrap();
        assert_eq!(out, b"answer");
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_silence_times_out_after_exact_attempts() {
        let writes = Arc::new(AtomicU32::new(0));
        let net = fake_gateway(Vec::new(), u32::MAX, Arc::clone(&writes));
        let codec = ByteCodec {
            request: b"ask".to_vec(),
            expected: b"answer".to_vec(),
        };
        let device = "192.0.2.1:5351".parse().unwrap();
        let policy = fast_policy(3);

        let start = Instant::now();
        let err = run(&codec, &net, device, &policy).unwrap_err();
        assert!(matches!(err, PcpError::Timeout));
        // Retry count is exactly the configured maximum.
        assert_eq!(writes.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= policy.total_budget());
    }

    #[test]
    fn test_noise_does_not_complete_the_exchange() {
        let writes = Arc::new(AtomicU32::new(0));
        let net = fake_gateway(
            vec![b"garbage".to_vec(), b"other-exchange".to_vec()],
            1,
            Arc::clone(&writes),
        );
        let codec = ByteCodec {
            request: b"ask".to_vec(),
            expected: b"answer".to_vec(),
        };
        let device = "192.0.2.1:5351".parse().unwrap();
        let err = run(&codec, &net, device, &fast_policy(2)).unwrap_err();
        assert!(matches!(err, PcpError::Timeout));
    }

    #[test]
    fn test_gateway_error_fails_immediately() {
        let bus: Bus<NetRequest> = Bus::new();
        let inbox = bus.clone();
        let _ = spawn_worker("fake-net-err", move || {
            loop {
                match inbox.recv() {
                    NetRequest::OpenSocket { id, reply, .. } => {
                        reply.send(NetEvent::SocketOpened {
                            id,
                            local_addr: "127.0.0.1:50001".parse().unwrap(),
                        });
                    }
                    NetRequest::WriteDatagram { id, reply, .. } => {
                        reply.send(NetEvent::Error {
                            id,
                            cause: "network unreachable".to_string(),
                        });
                    }
                    _ => break,
                }
            }
        });

        let codec = ByteCodec {
            request: b"ask".to_vec(),
            expected: b"answer".to_vec(),
        };
        let device = "192.0.2.1:5351".parse().unwrap();
        let start = Instant::now();
        let err = run(&codec, &bus, device, &fast_policy(4)).unwrap_err();
        assert!(matches!(err, PcpError::Transport(_)));
        // No retries after a transport error.
        assert!(start.elapsed() < Duration::from_millis(500));
        bus.send(NetRequest::Shutdown);
    }

    #[test]
    fn test_detached_outcome_arrives_on_bus() {
        let writes = Arc::new(AtomicU32::new(0));
        let net = fake_gateway(vec![b"answer".to_vec()], 1, writes);
        let codec = ByteCodec {
            request: b"ask".to_vec(),
            expected: b"answer".to_vec(),
        };
        let reply = Bus::new();
        run_detached(
            codec,
            net,
            "192.0.2.1:5351".parse().unwrap(),
            fast_policy(4),
            reply.clone(),
        );
        match reply.recv_timeout(Duration::from_secs(2)) {
            Some(Outcome::Matched(out)) => assert_eq!(out, b"answer"),
            other => panic!("expected Matched, got {other:?}"),
        }
    }
}
