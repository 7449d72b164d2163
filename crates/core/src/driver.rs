//! Lifecycle driver
//!
//! Owns a [`Graph`] and walks it through `NotStarted -> Running -> Stopped`.
//! The driver is the single writer of the run state: events proposed by the
//! runtime, the tap, the injector and stop handles all arrive through one
//! channel and are consumed by [`LifecycleDriver::run_until_terminal`] on the
//! control thread. The first terminal event ends the loop; anything queued
//! behind it is discarded.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::buffer::BufferMeta;
use crate::config::{Config, TapConfig};
use crate::dispatch::{Dispatch, EventDispatcher};
use crate::error::{Error, LookupError, Result};
use crate::graph::{
    create_event_channel, Edge, EventReceiver, EventSender, Graph, GraphEvent, TargetState,
};
use crate::tap::{FlowTap, SignalInjector, TapPolicy, TapStats};

/// What caused a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Reported by a stage while running
    Runtime,
    /// A key unit request could not be routed upstream
    SignalDelivery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub kind: FailureKind,
    pub source: String,
    pub message: String,
    pub debug: Option<String>,
}

/// Why the graph stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Error(RuntimeFailure),
    OperatorRequested,
}

impl StopReason {
    pub fn is_success(&self) -> bool {
        !matches!(self, StopReason::Error(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfStream => f.write_str("end of stream"),
            StopReason::Error(failure) => write!(f, "error from {}: {}", failure.source, failure.message),
            StopReason::OperatorRequested => f.write_str("stopped by operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped(StopReason),
}

/// Requests a stop from any thread
///
/// The request is queued behind events already posted and ends the run with
/// [`StopReason::OperatorRequested`] unless another terminal event wins.
#[derive(Clone)]
pub struct StopHandle {
    events: EventSender,
}

impl StopHandle {
    pub fn request_stop(&self) {
        let _ = self.events.send(GraphEvent::StopRequested);
    }
}

pub struct LifecycleDriver<G: Graph> {
    graph: G,
    tap_config: TapConfig,
    dispatcher: EventDispatcher,
    state: RunState,
    tap: Option<Arc<FlowTap>>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    released: bool,
}

impl<G: Graph> LifecycleDriver<G> {
    pub fn new(graph: G, config: &Config, dispatcher: EventDispatcher) -> Self {
        let (events_tx, events_rx) = create_event_channel();
        Self {
            graph,
            tap_config: config.tap.clone(),
            dispatcher,
            state: RunState::NotStarted,
            tap: None,
            events_tx,
            events_rx,
            released: false,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            events: self.events_tx.clone(),
        }
    }

    pub fn tap_stats(&self) -> Option<TapStats> {
        self.tap.as_ref().map(|tap| tap.stats())
    }

    /// Attach the tap (when a target is configured) and set the graph running
    ///
    /// A target that cannot be resolved leaves the driver in `NotStarted` with
    /// the graph untouched. Any later failure tears the graph down and leaves
    /// the driver in `Stopped(Error)`; it cannot be started again.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RunState::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        self.tap_config.validate()?;

        let edge = match self.tap_config.target.clone() {
            Some(target) => Some(self.resolve(&target)?),
            None => None,
        };

        if let Err(e) = self.launch(edge) {
            warn!(error = %e, "Graph failed to start");
            self.finish(StopReason::Error(RuntimeFailure {
                kind: FailureKind::Runtime,
                source: "graph".to_string(),
                message: e.to_string(),
                debug: None,
            }));
            return Err(e);
        }

        info!(tapped = self.tap.is_some(), "Graph running");
        self.state = RunState::Running;
        Ok(())
    }

    fn launch(&mut self, edge: Option<G::Edge>) -> Result<()> {
        if let Some(edge) = edge {
            self.install_tap(edge)?;
        }
        self.graph
            .subscribe(self.events_tx.clone(), self.dispatcher.verbose())?;
        self.graph.set_state(TargetState::Running)
    }

    fn resolve(&self, target: &str) -> std::result::Result<G::Edge, LookupError> {
        let stage = self
            .graph
            .find_stage(target)
            .ok_or_else(|| LookupError::Stage(target.to_string()))?;
        self.graph
            .output_edge(&stage)
            .ok_or_else(|| LookupError::Edge(target.to_string()))
    }

    fn install_tap(&mut self, edge: G::Edge) -> Result<()> {
        let name = edge.name();
        let policy = TapPolicy::from(&self.tap_config);

        let mut tap = FlowTap::new(name.clone(), policy).with_events(self.events_tx.clone());
        if policy.request_sync_point && policy.drop_count > 0 {
            tap = tap.with_injector(SignalInjector::spawn(edge.clone(), self.events_tx.clone()));
        }
        let tap = Arc::new(tap);

        let callback = Arc::clone(&tap);
        self.graph
            .attach_tap(&edge, Arc::new(move |buffer: &BufferMeta| callback.on_buffer(buffer)))?;

        info!(
            edge = %name,
            allow = policy.allow_count,
            drop = policy.drop_count,
            request_sync_point = policy.request_sync_point,
            "Tap attached"
        );
        self.dispatcher.status(&format!(
            "Tapping {name}: allow {}, drop {}, key unit request {}",
            policy.allow_count,
            policy.drop_count,
            if policy.request_sync_point { "on" } else { "off" }
        ));
        self.tap = Some(tap);
        Ok(())
    }

    /// Dispatch events until one of them ends the run, then tear down
    ///
    /// Blocks the calling thread. Returns the stop reason; calling it again
    /// after the run ended returns the same reason.
    pub fn run_until_terminal(&mut self) -> Result<StopReason> {
        match &self.state {
            RunState::NotStarted => return Err(Error::NotStarted),
            RunState::Stopped(reason) => return Ok(reason.clone()),
            RunState::Running => {}
        }

        let reason = loop {
            let Ok(event) = self.events_rx.recv() else {
                break StopReason::Error(RuntimeFailure {
                    kind: FailureKind::Runtime,
                    source: "graph".to_string(),
                    message: "event channel closed".to_string(),
                    debug: None,
                });
            };
            debug!(?event, "Dispatching graph event");
            if let Dispatch::Terminal(reason) = self.dispatcher.dispatch(event) {
                break reason;
            }
        };

        self.finish(reason.clone());
        Ok(reason)
    }

    /// Stop the graph on operator request
    ///
    /// No-op once stopped.
    pub fn stop(&mut self) {
        if matches!(self.state, RunState::Stopped(_)) {
            return;
        }
        self.finish(StopReason::OperatorRequested);
    }

    /// Print the tap counters as a status line
    pub fn report_tap(&mut self) {
        if let Some(tap) = &self.tap {
            let stats = tap.stats();
            let edge = tap.edge().to_string();
            self.dispatcher.tap_summary(&edge, &stats);
        }
    }

    fn finish(&mut self, reason: StopReason) {
        self.teardown();
        let discarded = self.events_rx.try_iter().count();
        if discarded > 0 {
            debug!(discarded, "Dropped events queued behind terminal event");
        }
        info!(%reason, "Graph stopped");
        self.state = RunState::Stopped(reason);
    }

    fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = self.graph.set_state(TargetState::Stopped) {
            warn!(error = %e, "Failed to stop graph");
        }
        self.graph.release();
        if let Some(tap) = &self.tap {
            tap.shutdown();
        }
        debug!("Graph released");
    }
}

impl<G: Graph> Drop for LifecycleDriver<G> {
    fn drop(&mut self) {
        self.teardown();
    }
}
