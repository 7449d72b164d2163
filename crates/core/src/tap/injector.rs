//! Upstream control signal injection
//!
//! Taps run with the edge locked by the runtime, so they cannot deliver an
//! upstream event themselves without risking re-entry. The injector owns a
//! worker thread; the tap enqueues a request and returns immediately, and the
//! worker sends the signal against the data flow.
//!
//! Delivery failures indicate a malformed graph (nothing upstream honours the
//! request). They are logged and posted as a terminal
//! [`GraphEvent::SignalDeliveryFailed`].
//!
//! Signals still queued at shutdown are discarded: the graph is already
//! stopped by then and nothing upstream can act on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::graph::{ControlSignal, Edge, EventSender, GraphEvent};

/// Commands sent to the worker thread
enum InjectorCommand {
    /// Deliver a control signal upstream
    Send(ControlSignal),
    /// Shutdown the worker
    Shutdown,
}

/// Fire-and-forget sender of upstream control signals for one edge
pub struct SignalInjector {
    edge: String,
    commands: Sender<InjectorCommand>,
    events: EventSender,
    closing: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SignalInjector {
    /// Start a worker delivering signals on `edge`
    pub fn spawn<E: Edge>(edge: E, events: EventSender) -> Self {
        let name = edge.name();
        let (commands, command_rx) = channel::unbounded::<InjectorCommand>();
        let worker_events = events.clone();
        let closing = Arc::new(AtomicBool::new(false));
        let worker_closing = Arc::clone(&closing);

        let worker = thread::Builder::new()
            .name("signal-injector".to_string())
            .spawn(move || {
                for command in command_rx {
                    match command {
                        InjectorCommand::Send(signal) if worker_closing.load(Ordering::Acquire) => {
                            debug!(edge = %edge.name(), ?signal, "Discarding pending control signal");
                        }
                        InjectorCommand::Send(signal) => deliver(&edge, signal, &worker_events),
                        InjectorCommand::Shutdown => break,
                    }
                }
                debug!(edge = %edge.name(), "Signal injector stopped");
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(edge = %name, error = %e, "Failed to spawn signal injector thread");
                None
            }
        };

        Self {
            edge: name,
            commands,
            events,
            closing,
            worker: Mutex::new(worker),
        }
    }

    /// Ask the producer of this edge for a new key unit
    ///
    /// Never blocks.
    pub fn request_sync_point(&self) {
        self.send(ControlSignal::force_key_unit());
    }

    /// Queue `signal` for upstream delivery
    pub fn send(&self, signal: ControlSignal) {
        if self.commands.send(InjectorCommand::Send(signal)).is_err() {
            error!(edge = %self.edge, ?signal, "Signal injector is not running");
            let _ = self.events.send(GraphEvent::SignalDeliveryFailed {
                edge: self.edge.clone(),
                reason: "signal injector is not running".to_string(),
            });
        }
    }

    /// Stop the worker, discarding signals not yet delivered
    ///
    /// A delivery already in flight completes first. Idempotent.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.closing.store(true, Ordering::Release);
        let _ = self.commands.send(InjectorCommand::Shutdown);
        if worker.join().is_err() {
            error!(edge = %self.edge, "Signal injector thread panicked");
        }
    }
}

impl Drop for SignalInjector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver<E: Edge>(edge: &E, signal: ControlSignal, events: &EventSender) {
    match edge.send_upstream(signal) {
        Ok(()) => debug!(edge = %edge.name(), ?signal, "Control signal sent upstream"),
        Err(e) => {
            error!(edge = %e.edge, reason = %e.reason, "Control signal was not handled upstream");
            let _ = events.send(GraphEvent::SignalDeliveryFailed {
                edge: e.edge,
                reason: e.reason,
            });
        }
    }
}
