//! Gateway lifecycle contract and worker-thread helpers.
//!
//! A gateway is an actor that owns scarce blocking resources (sockets,
//! child processes) and mutates them only from its own worker thread(s),
//! reached exclusively through its request bus. This replaces lock-based
//! sharing of the resources with message passing.

use crate::Bus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// An actor owning blocking I/O resources, reachable only via its bus.
///
/// Implementations must guarantee that every accepted request eventually
/// produces exactly one terminal outcome on that request's response bus,
/// and that [`Gateway::shutdown`] releases every owned resource before
/// returning. Requests are validated at construction (their fields are
/// required by the type), so a gateway never rejects a request for shape
/// reasons; only operational failures surface as error events.
pub trait Gateway {
    /// Request message type accepted on the gateway's bus.
    type Request;

    /// The inbox to send this gateway requests.
    fn bus(&self) -> Bus<Self::Request>;

    /// Stop the gateway: release all owned resources and join the worker
    /// thread(s). Blocks until termination is observed. In-flight
    /// operations are abandoned without leaks, though their response
    /// buses may never see a terminal message; callers blocking on one
    /// must apply their own bounded wait.
    fn shutdown(self);
}

/// Allocate a process-wide unique correlation id for a request.
///
/// Callers stamp requests with an id before sending so responses and
/// error events can be matched back to them.
#[must_use]
pub fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Spawn a named gateway worker thread.
///
/// # Panics
///
/// Panics if the OS refuses to spawn a thread.
pub fn spawn_worker<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    debug!("spawning worker thread {name}");
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Minimal gateway used to exercise the trait shape: echoes each
    /// request's id back on the request's response bus.
    struct EchoGateway {
        bus: Bus<EchoRequest>,
        worker: JoinHandle<()>,
    }

    enum EchoRequest {
        Echo { id: u64, reply: Bus<u64> },
        Shutdown,
    }

    impl EchoGateway {
        fn spawn() -> Self {
            let bus: Bus<EchoRequest> = Bus::new();
            let inbox = bus.clone();
            let worker = spawn_worker("echo-gateway", move || {
                loop {
                    match inbox.recv() {
                        EchoRequest::Echo { id, reply } => reply.send(id),
                        EchoRequest::Shutdown => break,
                    }
                }
            });
            Self { bus, worker }
        }
    }

    impl Gateway for EchoGateway {
        type Request = EchoRequest;

        fn bus(&self) -> Bus<EchoRequest> {
            self.bus.clone()
        }

        fn shutdown(self) {
            self.bus.send(EchoRequest::Shutdown);
            self.worker.join().expect("echo gateway worker panicked");
        }
    }

    #[test]
    fn test_gateway_round_trip_and_shutdown() {
        let gw = EchoGateway::spawn();
        let reply = Bus::new();
        let id = next_id();
        gw.bus().send(EchoRequest::Echo {
            id,
            reply: reply.clone(),
        });
        assert_eq!(reply.recv(), id);
        gw.shutdown();
    }

    #[test]
    fn test_next_id_unique_across_threads() {
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(std::thread::spawn(|| {
                (0..100).map(|_| next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate correlation id {id}");
            }
        }
    }
}
