//! Terminal Event Tests
//!
//! Uses a scripted graph that queues a fixed event sequence when started, to
//! check that the first terminal event wins and is acted on exactly once, and
//! that a failed start never leaves the graph half set up.

mod common;

use std::sync::{Arc, Mutex};

use common::{config, SharedBuffer};
use launchdrop_core::{
    ControlSignal, Edge, Error, EventDispatcher, EventSender, FailureKind, Graph, GraphEvent,
    LifecycleDriver, PropertyNotification, PropertyValue, Result, RunState, SignalDeliveryError,
    StopReason, TapFn, TargetState,
};

#[derive(Clone)]
struct ScriptedEdge;

impl Edge for ScriptedEdge {
    fn name(&self) -> String {
        "scripted:src".to_string()
    }

    fn send_upstream(&self, _signal: ControlSignal) -> std::result::Result<(), SignalDeliveryError> {
        Ok(())
    }
}

#[derive(Default)]
struct Journal {
    states: Vec<TargetState>,
    taps: usize,
    releases: usize,
}

struct ScriptedGraph {
    script: Vec<GraphEvent>,
    events: Option<EventSender>,
    journal: Arc<Mutex<Journal>>,
    fail_subscribe: bool,
    fail_running: bool,
}

impl ScriptedGraph {
    fn new(script: Vec<GraphEvent>) -> (Self, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let graph = Self {
            script,
            events: None,
            journal: Arc::clone(&journal),
            fail_subscribe: false,
            fail_running: false,
        };
        (graph, journal)
    }
}

impl Graph for ScriptedGraph {
    type Stage = ();
    type Edge = ScriptedEdge;

    fn find_stage(&self, name: &str) -> Option<()> {
        (name == "scripted").then_some(())
    }

    fn output_edge(&self, _stage: &()) -> Option<ScriptedEdge> {
        Some(ScriptedEdge)
    }

    fn attach_tap(&mut self, _edge: &ScriptedEdge, _tap: TapFn) -> Result<()> {
        self.journal.lock().unwrap().taps += 1;
        Ok(())
    }

    fn subscribe(&mut self, events: EventSender, _property_notifications: bool) -> Result<()> {
        if self.fail_subscribe {
            return Err(Error::State("bus unavailable".into()));
        }
        self.events = Some(events);
        Ok(())
    }

    fn set_state(&mut self, state: TargetState) -> Result<()> {
        self.journal.lock().unwrap().states.push(state);
        if state == TargetState::Running {
            if self.fail_running {
                return Err(Error::State("refused to run".into()));
            }
            if let Some(events) = &self.events {
                for event in self.script.drain(..) {
                    events.send(event).unwrap();
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.journal.lock().unwrap().releases += 1;
        self.events = None;
    }
}

fn runtime_error() -> GraphEvent {
    GraphEvent::Error {
        source: "encoder".into(),
        message: "Internal data stream error.".into(),
        debug: Some("streaming stopped, reason not-negotiated (-4)".into()),
    }
}

/// Error queued ahead of EndOfStream wins; EndOfStream is never dispatched
#[test]
fn test_first_terminal_event_wins() {
    let (graph, journal) = ScriptedGraph::new(vec![
        GraphEvent::Other { kind: "StateChanged".into() },
        runtime_error(),
        GraphEvent::EndOfStream,
        runtime_error(),
    ]);
    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let dispatcher = EventDispatcher::new(false, Box::new(out.clone()), Box::new(err.clone()));
    let mut driver = LifecycleDriver::new(graph, &config(None, 0, 20, false), dispatcher);

    driver.start().unwrap();
    let reason = driver.run_until_terminal().unwrap();

    match &reason {
        StopReason::Error(failure) => {
            assert_eq!(failure.kind, FailureKind::Runtime);
            assert_eq!(failure.source, "encoder");
            assert_eq!(
                failure.debug.as_deref(),
                Some("streaming stopped, reason not-negotiated (-4)")
            );
        }
        other => panic!("unexpected stop reason {other:?}"),
    }
    assert_eq!(driver.state(), &RunState::Stopped(reason.clone()));

    // A second call reports the same outcome without dispatching anything
    assert_eq!(driver.run_until_terminal().unwrap(), reason);
    driver.stop();
    assert_eq!(driver.state(), &RunState::Stopped(reason));

    assert_eq!(
        err.contents(),
        "ERROR from element encoder: Internal data stream error.\n\
         Debugging info: streaming stopped, reason not-negotiated (-4)\n"
    );
    assert!(out.contents().is_empty());

    drop(driver);
    let journal = journal.lock().unwrap();
    assert_eq!(journal.states, [TargetState::Running, TargetState::Stopped]);
    assert_eq!(journal.releases, 1);
}

/// EndOfStream queued first wins over a later error
#[test]
fn test_end_of_stream_before_error() {
    let (graph, _journal) = ScriptedGraph::new(vec![GraphEvent::EndOfStream, runtime_error()]);
    let err = SharedBuffer::default();
    let dispatcher = EventDispatcher::new(false, Box::new(std::io::sink()), Box::new(err.clone()));
    let mut driver = LifecycleDriver::new(graph, &config(None, 0, 20, false), dispatcher);

    driver.start().unwrap();
    assert_eq!(driver.run_until_terminal().unwrap(), StopReason::EndOfStream);
    assert!(err.contents().is_empty());
}

/// Property notifications are non-terminal and hidden unless verbose
#[test]
fn test_notifications_do_not_end_run() {
    let notification = GraphEvent::PropertyNotification(PropertyNotification {
        path: "/pipeline0/encoder".into(),
        name: "bitrate".into(),
        value: PropertyValue::Serialized("2048".into()),
    });
    let (graph, _journal) = ScriptedGraph::new(vec![
        notification.clone(),
        notification,
        GraphEvent::EndOfStream,
    ]);
    let out = SharedBuffer::default();
    let dispatcher = EventDispatcher::new(true, Box::new(out.clone()), Box::new(std::io::sink()));
    let mut driver = LifecycleDriver::new(graph, &config(None, 0, 20, false), dispatcher);

    driver.start().unwrap();
    assert_eq!(driver.run_until_terminal().unwrap(), StopReason::EndOfStream);
    assert_eq!(
        out.contents(),
        "/pipeline0/encoder: bitrate = 2048\n/pipeline0/encoder: bitrate = 2048\neos\n"
    );
}

/// Stop requests queued behind an error do not override it
#[test]
fn test_stop_request_after_error_is_ignored() {
    let (graph, _journal) = ScriptedGraph::new(vec![runtime_error()]);
    let mut driver = LifecycleDriver::new(graph, &config(None, 0, 20, false), common::silent_dispatcher());

    driver.start().unwrap();
    driver.stop_handle().request_stop();

    let reason = driver.run_until_terminal().unwrap();
    assert!(matches!(reason, StopReason::Error(_)));
    assert!(!reason.is_success());
}

fn assert_failed_start(driver: &LifecycleDriver<ScriptedGraph>, message: &str) {
    match driver.state() {
        RunState::Stopped(StopReason::Error(failure)) => {
            assert_eq!(failure.kind, FailureKind::Runtime);
            assert!(failure.message.contains(message), "{}", failure.message);
        }
        other => panic!("unexpected state {other:?}"),
    }
}

/// A subscription failure after the tap is attached tears the graph down
#[test]
fn test_subscribe_failure_stops_driver() {
    let (mut graph, journal) = ScriptedGraph::new(vec![GraphEvent::EndOfStream]);
    graph.fail_subscribe = true;
    let mut driver = LifecycleDriver::new(
        graph,
        &config(Some("scripted"), 0, 5, true),
        common::silent_dispatcher(),
    );

    assert!(matches!(driver.start(), Err(Error::State(_))));
    assert_failed_start(&driver, "bus unavailable");

    // Retrying cannot stack a second tap on the same edge
    assert!(matches!(driver.start(), Err(Error::AlreadyStarted)));
    assert!(matches!(
        driver.run_until_terminal(),
        Ok(StopReason::Error(_))
    ));

    drop(driver);
    let journal = journal.lock().unwrap();
    assert_eq!(journal.taps, 1);
    assert_eq!(journal.states, [TargetState::Stopped]);
    assert_eq!(journal.releases, 1);
}

/// A runtime refusing to run ends the run as a failure
#[test]
fn test_running_failure_stops_driver() {
    let (mut graph, journal) = ScriptedGraph::new(Vec::new());
    graph.fail_running = true;
    let mut driver = LifecycleDriver::new(
        graph,
        &config(Some("scripted"), 2, 3, false),
        common::silent_dispatcher(),
    );

    assert!(matches!(driver.start(), Err(Error::State(_))));
    assert_failed_start(&driver, "refused to run");
    assert!(matches!(driver.start(), Err(Error::AlreadyStarted)));

    drop(driver);
    let journal = journal.lock().unwrap();
    assert_eq!(journal.taps, 1);
    assert_eq!(journal.states, [TargetState::Running, TargetState::Stopped]);
    assert_eq!(journal.releases, 1);
}
