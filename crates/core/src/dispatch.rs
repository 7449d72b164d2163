//! Event dispatcher
//!
//! Maps each [`GraphEvent`] to operator output and tells the driver whether
//! the run is over. Status lines go to the output writer (stdout), failures to
//! the error writer (stderr).

use std::io::{self, Write};

use tracing::{trace, warn};

use crate::driver::{FailureKind, RuntimeFailure, StopReason};
use crate::graph::{GraphEvent, PropertyNotification};
use crate::tap::TapStats;

/// Outcome of dispatching one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Terminal(StopReason),
}

pub struct EventDispatcher {
    verbose: bool,
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

impl EventDispatcher {
    pub fn new(verbose: bool, out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
        Self { verbose, out, err }
    }

    /// Dispatcher writing to the process stdout/stderr
    pub fn stdio(verbose: bool) -> Self {
        Self::new(verbose, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn dispatch(&mut self, event: GraphEvent) -> Dispatch {
        match event {
            GraphEvent::Error {
                source,
                message,
                debug,
            } => {
                self.error_line(&format!("ERROR from element {source}: {message}"));
                self.error_line(&format!(
                    "Debugging info: {}",
                    debug.as_deref().unwrap_or("none")
                ));
                Dispatch::Terminal(StopReason::Error(RuntimeFailure {
                    kind: FailureKind::Runtime,
                    source,
                    message,
                    debug,
                }))
            }
            GraphEvent::EndOfStream => {
                self.status("eos");
                Dispatch::Terminal(StopReason::EndOfStream)
            }
            GraphEvent::PropertyNotification(notification) => {
                if self.verbose {
                    self.status(&render_notification(&notification));
                }
                Dispatch::Continue
            }
            GraphEvent::DropWindowClosed {
                edge,
                dropped,
                sync_requested,
            } => {
                if sync_requested {
                    self.status(&format!(
                        "Discarded {dropped} buffers on {edge}, key unit requested"
                    ));
                } else {
                    self.status(&format!("Discarded {dropped} buffers on {edge}"));
                }
                Dispatch::Continue
            }
            GraphEvent::SignalDeliveryFailed { edge, reason } => {
                self.error_line(&format!("ERROR: key unit request on {edge} was not handled: {reason}"));
                Dispatch::Terminal(StopReason::Error(RuntimeFailure {
                    kind: FailureKind::SignalDelivery,
                    source: edge,
                    message: reason,
                    debug: None,
                }))
            }
            GraphEvent::StopRequested => {
                self.status("Stop requested, shutting down graph");
                Dispatch::Terminal(StopReason::OperatorRequested)
            }
            GraphEvent::Other { kind } => {
                trace!(kind = %kind, "Ignoring graph event");
                Dispatch::Continue
            }
        }
    }

    /// Print a status line to the output writer
    pub fn status(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            warn!(error = %e, "Failed to write status line");
        }
    }

    fn error_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.err, "{line}").and_then(|_| self.err.flush()) {
            warn!(error = %e, "Failed to write error line");
        }
    }

    pub fn tap_summary(&mut self, edge: &str, stats: &TapStats) {
        self.status(&format!(
            "Tap on {edge}: {} buffers observed, {} admitted, {} discarded, {} key unit request(s)",
            stats.observed, stats.admitted, stats.discarded, stats.sync_requests
        ));
    }
}

fn render_notification(notification: &PropertyNotification) -> String {
    format!(
        "{}: {} = {}",
        notification.path, notification.name, notification.value
    )
}
