//! Interfaces of the media runtime
//!
//! A runtime provides a [`GraphBuilder`] that turns a textual description into
//! a [`Graph`]. The graph exposes named stages, their output [`Edge`]s, buffer
//! taps on those edges, and an asynchronous stream of [`GraphEvent`]s.
//!
//! Events from every producer (runtime bus, tap, injector, stop handles) are
//! funnelled into one unbounded channel that the lifecycle driver drains on
//! the control thread.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::buffer::{BufferMeta, Verdict};
use crate::error::{BuildError, Result, SignalDeliveryError};

/// Sending half of the graph event channel
pub type EventSender = Sender<GraphEvent>;

/// Receiving half of the graph event channel
pub type EventReceiver = Receiver<GraphEvent>;

/// Create an unbounded event channel
///
/// Sends never block, so producers running on streaming threads can post
/// without stalling the data path.
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    channel::unbounded()
}

/// Callback invoked for every buffer crossing a tapped edge
pub type TapFn = Arc<dyn Fn(&BufferMeta) -> Verdict + Send + Sync>;

/// Upstream control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Ask the producer for a new key unit as soon as possible
    ForceKeyUnit {
        /// Re-send stream headers along with the key unit
        all_headers: bool,
        /// Running count of requests in this series
        count: u32,
    },
}

impl ControlSignal {
    /// The request sent once a discard window closes
    pub fn force_key_unit() -> Self {
        ControlSignal::ForceKeyUnit {
            all_headers: true,
            count: 1,
        }
    }
}

/// Value attached to a property notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// String property, shown as-is
    Text(String),
    /// Caps, tag lists and structures in their canonical string form
    Structured(String),
    /// Any other type, through the runtime's generic serializer
    Serialized(String),
    /// Value not available or not serializable
    Unset,
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) | PropertyValue::Structured(s) | PropertyValue::Serialized(s) => {
                f.write_str(s)
            }
            PropertyValue::Unset => f.write_str("(no value)"),
        }
    }
}

/// A stage property changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyNotification {
    /// Full path of the owning object
    pub path: String,
    pub name: String,
    pub value: PropertyValue,
}

/// Events delivered to the control thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// A stage failed
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },

    /// All data has reached the sinks
    EndOfStream,

    /// A property changed somewhere in the graph
    PropertyNotification(PropertyNotification),

    /// The tap finished its discard window
    DropWindowClosed {
        edge: String,
        dropped: u64,
        sync_requested: bool,
    },

    /// The injector could not route a control signal upstream
    SignalDeliveryFailed { edge: String, reason: String },

    /// The operator asked the run to end
    StopRequested,

    /// Anything the dispatcher does not act on
    Other { kind: String },
}

impl GraphEvent {
    /// Whether this event ends the dispatch loop
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphEvent::Error { .. }
                | GraphEvent::EndOfStream
                | GraphEvent::SignalDeliveryFailed { .. }
                | GraphEvent::StopRequested
        )
    }
}

/// Target states accepted by [`Graph::set_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Stopped,
}

/// A connection leaving a stage
pub trait Edge: Clone + Send + Sync + 'static {
    /// Human readable `stage:pad` name
    fn name(&self) -> String;

    /// Send a control signal against the data flow
    ///
    /// May be called from any thread. Implementations must not wait for the
    /// producing stage to act on the signal.
    fn send_upstream(&self, signal: ControlSignal) -> std::result::Result<(), SignalDeliveryError>;
}

/// A built, runnable graph
pub trait Graph: Send {
    type Stage;
    type Edge: Edge;

    fn find_stage(&self, name: &str) -> Option<Self::Stage>;

    fn output_edge(&self, stage: &Self::Stage) -> Option<Self::Edge>;

    /// Install `tap` on `edge`; it runs on the streaming thread for every buffer
    fn attach_tap(&mut self, edge: &Self::Edge, tap: TapFn) -> Result<()>;

    /// Forward graph events into `events`
    ///
    /// Property notifications are only produced when `property_notifications`
    /// is set.
    fn subscribe(&mut self, events: EventSender, property_notifications: bool) -> Result<()>;

    /// Move the graph to `state`
    ///
    /// `TargetState::Stopped` returns only once no streaming thread is
    /// running anymore.
    fn set_state(&mut self, state: TargetState) -> Result<()>;

    /// Detach taps and drop event subscriptions
    fn release(&mut self);
}

/// Turns a textual description into a [`Graph`]
pub trait GraphBuilder {
    type Graph: Graph;

    fn build(&self, description: &[String]) -> std::result::Result<Self::Graph, BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(GraphEvent::EndOfStream.is_terminal());
        assert!(GraphEvent::StopRequested.is_terminal());
        assert!(GraphEvent::SignalDeliveryFailed {
            edge: "encoder:src".into(),
            reason: "unhandled".into(),
        }
        .is_terminal());
        assert!(!GraphEvent::Other { kind: "state-changed".into() }.is_terminal());
        assert!(!GraphEvent::DropWindowClosed {
            edge: "encoder:src".into(),
            dropped: 20,
            sync_requested: false,
        }
        .is_terminal());
    }

    #[test]
    fn test_event_channel_preserves_order() {
        let (tx, rx) = create_event_channel();
        tx.send(GraphEvent::Other { kind: "a".into() }).unwrap();
        tx.send(GraphEvent::EndOfStream).unwrap();

        assert_eq!(rx.recv().unwrap(), GraphEvent::Other { kind: "a".into() });
        assert_eq!(rx.recv().unwrap(), GraphEvent::EndOfStream);
    }
}
