//! Child-process gateway.
//!
//! Owns every child process it spawns: a command worker consumes the
//! gateway bus, and each child gets one reader thread streaming its
//! stdout back to the creating request's response bus. Stream shape per
//! child: `Created`, zero or more `DataRead`, then exactly one terminal
//! `Exited`.
//!
//! Mapping protocols that shell out to helper binaries drive those
//! helpers exclusively through this contract.

use crate::error::GatewayError;
use burrow_bus::{Bus, Gateway, spawn_worker};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Stdout read chunk size per child.
const READ_CHUNK: usize = 4096;

/// Requests accepted on the process gateway's bus.
#[derive(Debug)]
pub enum ProcRequest {
    /// Spawn a child process.
    ///
    /// Outcome stream on `reply`: [`ProcEvent::Created`] (or
    /// [`ProcEvent::Error`]), then zero or more [`ProcEvent::DataRead`],
    /// closed by exactly one [`ProcEvent::Exited`].
    Create {
        /// Correlation id; doubles as the child handle
        id: u64,
        /// Receives the child's event stream
        reply: Bus<ProcEvent>,
        /// Program to run
        command: String,
        /// Program arguments
        args: Vec<String>,
    },
    /// Write bytes to a child's stdin.
    Write {
        /// Child handle from a previous [`ProcRequest::Create`]
        id: u64,
        /// Bytes to write
        bytes: Vec<u8>,
    },
    /// Kill a child process. Its terminal [`ProcEvent::Exited`] still
    /// arrives, delivered by the child's reader thread.
    Kill {
        /// Child handle to kill
        id: u64,
    },
    /// Stop the gateway, killing every remaining child.
    Shutdown,
}

/// Responses and notifications emitted by the process gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcEvent {
    /// The child process started
    Created {
        /// Correlation id of the create request
        id: u64,
    },
    /// Bytes read from the child's stdout
    DataRead {
        /// Child handle
        id: u64,
        /// Chunk of stdout output
        bytes: Vec<u8>,
    },
    /// Terminal: the child exited
    Exited {
        /// Child handle
        id: u64,
        /// Exit code; `None` when killed by a signal
        code: Option<i32>,
    },
    /// An operation failed at the OS level
    Error {
        /// Correlation id of the failed request
        id: u64,
        /// Failure description
        cause: String,
    },
}

/// Gateway actor owning all spawned child processes.
pub struct ProcessGateway {
    bus: Bus<ProcRequest>,
    worker: JoinHandle<()>,
}

impl ProcessGateway {
    /// Start the gateway worker. Returns once it is accepting requests.
    #[must_use]
    pub fn spawn() -> Self {
        let bus = Bus::new();
        let inbox = bus.clone();
        let worker = spawn_worker("burrow-proc", move || worker_loop(&inbox));
        info!("process gateway started");
        Self { bus, worker }
    }
}

impl Gateway for ProcessGateway {
    type Request = ProcRequest;

    fn bus(&self) -> Bus<ProcRequest> {
        self.bus.clone()
    }

    fn shutdown(self) {
        self.bus.send(ProcRequest::Shutdown);
        if self.worker.join().is_err() {
            warn!("process gateway worker panicked during shutdown");
        }
    }
}

struct ChildEntry {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    reply: Bus<ProcEvent>,
    exited: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

fn worker_loop(inbox: &Bus<ProcRequest>) {
    let mut children: HashMap<u64, ChildEntry> = HashMap::new();

    loop {
        // Drop bookkeeping for children whose reader already finished.
        children.retain(|id, entry| {
            let alive = !entry.exited.load(Ordering::Acquire);
            if !alive {
                trace!("reaped child {id}");
            }
            alive
        });

        match inbox.recv() {
            ProcRequest::Create {
                id,
                reply,
                command,
                args,
            } => match create_child(id, &command, &args, reply.clone()) {
                Ok(entry) => {
                    debug!("child {id} spawned: {command}");
                    children.insert(id, entry);
                    reply.send(ProcEvent::Created { id });
                }
                Err(e) => {
                    warn!("failed to spawn child {id}: {e}");
                    reply.send(ProcEvent::Error {
                        id,
                        cause: e.to_string(),
                    });
                }
            },
            ProcRequest::Write { id, bytes } => {
                if let Some(entry) = children.get_mut(&id) {
                    let outcome = match entry.stdin.as_mut() {
                        Some(stdin) => stdin.write_all(&bytes).and_then(|()| stdin.flush()),
                        None => Ok(()),
                    };
                    if let Err(e) = outcome {
                        warn!("write to child {id} failed: {e}");
                        entry.reply.send(ProcEvent::Error {
                            id,
                            cause: e.to_string(),
                        });
                    }
                }
            }
            ProcRequest::Kill { id } => {
                if let Some(entry) = children.get(&id) {
                    // Racing a natural exit is fine; the reader still
                    // delivers the single terminal Exited event.
                    if let Ok(mut child) = entry.child.lock() {
                        let _ = child.kill();
                    }
                    debug!("killed child {id}");
                }
            }
            ProcRequest::Shutdown => break,
        }
    }

    for (id, entry) in children.drain() {
        if let Ok(mut child) = entry.child.lock() {
            let _ = child.kill();
        }
        let _ = entry.reader.join();
        debug!("child {id} terminated on shutdown");
    }
    info!("process gateway stopped");
}

fn create_child(
    id: u64,
    command: &str,
    args: &[String],
    reply: Bus<ProcEvent>,
) -> Result<ChildEntry, GatewayError> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| GatewayError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or(GatewayError::MissingPipe("stdout"))?;
    let stdin = child.stdin.take();
    let child = Arc::new(Mutex::new(child));
    let exited = Arc::new(AtomicBool::new(false));

    let reader = {
        let child = Arc::clone(&child);
        let exited = Arc::clone(&exited);
        let reply = reply.clone();
        spawn_worker(&format!("burrow-proc-reader-{id}"), move || {
            read_until_exit(id, stdout, &child, &reply);
            exited.store(true, Ordering::Release);
        })
    };

    Ok(ChildEntry {
        child,
        stdin,
        reply,
        exited,
        reader,
    })
}

/// Stream a child's stdout, then reap it and emit the terminal event.
fn read_until_exit(
    id: u64,
    mut stdout: impl Read,
    child: &Mutex<Child>,
    reply: &Bus<ProcEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!("child {id}: read {n} bytes");
                reply.send(ProcEvent::DataRead {
                    id,
                    bytes: buf[..n].to_vec(),
                });
            }
            Err(e) => {
                warn!("child {id}: stdout read failed: {e}");
                break;
            }
        }
    }

    let code = match child.lock() {
        Ok(mut child) => child.wait().ok().and_then(|status| status.code()),
        Err(_) => None,
    };
    debug!("child {id} exited with {code:?}");
    reply.send(ProcEvent::Exited { id, code });
}
