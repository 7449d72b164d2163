//! Flow tap
//!
//! A [`FlowTap`] sits on one edge and decides, buffer by buffer, whether the
//! buffer continues downstream. Positions are 1-based:
//!
//! ```text
//!  1 ..= allow            admitted   (allow window)
//!  allow+1 ..= allow+drop discarded  (drop window)
//!  allow+drop+1 ..        admitted   (pass-through)
//! ```
//!
//! When the last buffer of the drop window is observed and sync point
//! requests are enabled, the tap hands a key-unit request to its
//! [`SignalInjector`], which delivers it upstream off the streaming thread.
//! The window never re-arms.

pub mod injector;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::buffer::{BufferMeta, Verdict};
use crate::config::TapConfig;
use crate::graph::{EventSender, GraphEvent};

pub use injector::SignalInjector;

/// Fixed admission policy of a tap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapPolicy {
    pub allow_count: u64,
    pub drop_count: u64,
    pub request_sync_point: bool,
}

impl Default for TapPolicy {
    fn default() -> Self {
        Self::from(&TapConfig::default())
    }
}

impl From<&TapConfig> for TapPolicy {
    fn from(config: &TapConfig) -> Self {
        Self {
            allow_count: config.allow_count,
            drop_count: config.drop_count,
            request_sync_point: config.request_sync_point,
        }
    }
}

/// Where a buffer position falls relative to the windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    Allow,
    Drop { last: bool },
    PassThrough,
}

impl WindowPosition {
    pub fn verdict(self) -> Verdict {
        match self {
            WindowPosition::Drop { .. } => Verdict::Discard,
            WindowPosition::Allow | WindowPosition::PassThrough => Verdict::Admit,
        }
    }
}

impl TapPolicy {
    /// Classify the buffer at 1-based `position`
    pub fn classify(&self, position: u64) -> WindowPosition {
        let drop_end = self.allow_count.saturating_add(self.drop_count);
        if position <= self.allow_count {
            WindowPosition::Allow
        } else if position <= drop_end {
            WindowPosition::Drop {
                last: position == drop_end,
            }
        } else {
            WindowPosition::PassThrough
        }
    }
}

/// Snapshot of a tap's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapStats {
    pub observed: u64,
    pub admitted: u64,
    pub discarded: u64,
    pub sync_requests: u64,
}

/// Admission policy bound to one edge
pub struct FlowTap {
    edge: String,
    policy: TapPolicy,

    /// Position of the last observed buffer
    sequence: AtomicU64,
    admitted: AtomicU64,
    discarded: AtomicU64,
    sync_requests: AtomicU64,

    injector: Option<SignalInjector>,
    events: Option<EventSender>,
}

impl FlowTap {
    /// Create a tap that only applies `policy`
    pub fn new(edge: impl Into<String>, policy: TapPolicy) -> Self {
        Self {
            edge: edge.into(),
            policy,
            sequence: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            sync_requests: AtomicU64::new(0),
            injector: None,
            events: None,
        }
    }

    /// Route key-unit requests through `injector`
    pub fn with_injector(mut self, injector: SignalInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Post window notices to `events`
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn edge(&self) -> &str {
        &self.edge
    }

    /// Decide the fate of one buffer
    ///
    /// Called on the streaming thread, once per buffer, in arrival order.
    pub fn on_buffer(&self, buffer: &BufferMeta) -> Verdict {
        let position = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;

        trace!(
            edge = %self.edge,
            sequence = position,
            "Received buffer {}",
            buffer
        );

        let window = self.policy.classify(position);
        match window {
            WindowPosition::Allow | WindowPosition::PassThrough => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
            }
            WindowPosition::Drop { last } => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                trace!(
                    edge = %self.edge,
                    "Buffer {}/{} discarded",
                    position - self.policy.allow_count,
                    self.policy.drop_count
                );
                if last {
                    self.close_window();
                }
            }
        }
        window.verdict()
    }

    fn close_window(&self) {
        let mut sync_requested = false;
        if self.policy.request_sync_point {
            debug!(edge = %self.edge, "All buffers have been discarded, requesting a key unit");
            match &self.injector {
                Some(injector) => {
                    injector.request_sync_point();
                    self.sync_requests.fetch_add(1, Ordering::Relaxed);
                    sync_requested = true;
                }
                None => debug!(edge = %self.edge, "No injector attached, key unit request skipped"),
            }
        } else {
            debug!(edge = %self.edge, "All buffers have been discarded");
        }

        if let Some(events) = &self.events {
            let _ = events.send(GraphEvent::DropWindowClosed {
                edge: self.edge.clone(),
                dropped: self.policy.drop_count,
                sync_requested,
            });
        }
    }

    /// Position of the last buffer observed
    pub fn observed(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TapStats {
        TapStats {
            observed: self.observed(),
            admitted: self.admitted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            sync_requests: self.sync_requests.load(Ordering::Relaxed),
        }
    }

    /// Stop the injector; requests not yet delivered are dropped
    pub fn shutdown(&self) {
        if let Some(injector) = &self.injector {
            injector.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalDeliveryError;
    use crate::graph::{create_event_channel, ControlSignal, Edge};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct RecordingEdge {
        signals: Arc<Mutex<Vec<ControlSignal>>>,
    }

    impl Edge for RecordingEdge {
        fn name(&self) -> String {
            "encoder:src".to_string()
        }

        fn send_upstream(&self, signal: ControlSignal) -> Result<(), SignalDeliveryError> {
            self.signals.lock().push(signal);
            Ok(())
        }
    }

    fn policy(allow: u64, drop: u64, sync: bool) -> TapPolicy {
        TapPolicy {
            allow_count: allow,
            drop_count: drop,
            request_sync_point: sync,
        }
    }

    fn frame(i: u64) -> BufferMeta {
        BufferMeta::delta(Duration::from_millis(i * 33))
    }

    fn feed(tap: &FlowTap, count: u64) -> Vec<Verdict> {
        (1..=count).map(|i| tap.on_buffer(&frame(i))).collect()
    }

    #[test]
    fn test_classify_matches_windows() {
        for allow in 0..5 {
            for drop in 0..5 {
                let p = policy(allow, drop, false);
                for position in 1..=12 {
                    let expected = if position <= allow || position > allow + drop {
                        Verdict::Admit
                    } else {
                        Verdict::Discard
                    };
                    assert_eq!(
                        p.classify(position).verdict(),
                        expected,
                        "allow={allow} drop={drop} position={position}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_last_drop_position_is_unique() {
        let p = policy(3, 4, true);
        let lasts: Vec<u64> = (1..=20)
            .filter(|&n| p.classify(n) == WindowPosition::Drop { last: true })
            .collect();
        assert_eq!(lasts, vec![7]);
    }

    #[test]
    fn test_default_policy_drops_first_twenty() {
        let tap = FlowTap::new("encoder:src", TapPolicy::default());
        let verdicts = feed(&tap, 25);

        assert!(verdicts[..20].iter().all(|v| *v == Verdict::Discard));
        assert!(verdicts[20..].iter().all(|v| *v == Verdict::Admit));
        assert_eq!(
            tap.stats(),
            TapStats {
                observed: 25,
                admitted: 5,
                discarded: 20,
                sync_requests: 0,
            }
        );
    }

    #[test]
    fn test_sync_point_requested_on_window_close() {
        let edge = RecordingEdge::default();
        let (tx, rx) = create_event_channel();
        let injector = SignalInjector::spawn(edge.clone(), tx.clone());
        let tap = FlowTap::new("encoder:src", policy(5, 10, true))
            .with_injector(injector)
            .with_events(tx);

        let verdicts = feed(&tap, 14);
        assert!(verdicts[..5].iter().all(|v| *v == Verdict::Admit));
        assert!(verdicts[5..].iter().all(|v| *v == Verdict::Discard));
        assert_eq!(tap.stats().sync_requests, 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(tap.on_buffer(&frame(15)), Verdict::Discard);
        assert_eq!(tap.stats().sync_requests, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            GraphEvent::DropWindowClosed {
                edge: "encoder:src".into(),
                dropped: 10,
                sync_requested: true,
            }
        );

        feed(&tap, 30);
        let deadline = Instant::now() + Duration::from_secs(5);
        while edge.signals.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        tap.shutdown();
        assert_eq!(edge.signals.lock().as_slice(), &[ControlSignal::force_key_unit()]);
        assert_eq!(tap.stats().sync_requests, 1);
    }

    #[test]
    fn test_zero_drop_is_pure_observer() {
        let edge = RecordingEdge::default();
        let (tx, rx) = create_event_channel();
        let tap = FlowTap::new("encoder:src", policy(0, 0, true))
            .with_injector(SignalInjector::spawn(edge.clone(), tx.clone()))
            .with_events(tx);

        assert!(feed(&tap, 10).iter().all(|v| *v == Verdict::Admit));
        tap.shutdown();

        assert_eq!(tap.observed(), 10);
        assert!(edge.signals.lock().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_window_close_without_sync_request() {
        let (tx, rx) = create_event_channel();
        let tap = FlowTap::new("encoder:src", policy(0, 2, false)).with_events(tx);

        feed(&tap, 3);
        assert_eq!(
            rx.try_recv().unwrap(),
            GraphEvent::DropWindowClosed {
                edge: "encoder:src".into(),
                dropped: 2,
                sync_requested: false,
            }
        );
    }

    #[test]
    fn test_counter_is_shared_across_threads() {
        let tap = Arc::new(FlowTap::new("encoder:src", policy(0, 50, false)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tap = Arc::clone(&tap);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        tap.on_buffer(&frame(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = tap.stats();
        assert_eq!(stats.observed, 100);
        assert_eq!(stats.discarded, 50);
        assert_eq!(stats.admitted, 50);
    }
}
