//! In-process graph runtime
//!
//! Builds linear graphs of synthetic stages from a launch-style description:
//!
//! ```text
//! testsrc num-buffers=100 framerate=30 ! encoder name=encoder key-int-max=30 ! sink
//! ```
//!
//! Stages:
//! - `testsrc`: produces raw frames (`num-buffers`, `-1` for unbounded;
//!   `framerate`; `is-live` paces frames in real time)
//! - `encoder`: marks frames as key or delta units (`key-int-max`, `0` for
//!   first and forced key units only; `fail-after` reports an error once it
//!   produced that many buffers). Honours upstream force-key-unit requests.
//! - `sink`: records everything it receives
//!
//! One streaming thread carries every buffer through the whole chain. Each
//! link's tap runs while that link's lock is held.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{BufferMeta, Verdict};
use crate::error::{BuildError, Error, Result, SignalDeliveryError};
use crate::graph::{
    ControlSignal, Edge, EventSender, Graph, GraphBuilder, GraphEvent, PropertyNotification,
    PropertyValue, TapFn, TargetState,
};

const GRAPH_NAME: &str = "pipeline0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceProps {
    num_buffers: Option<u64>,
    framerate: u32,
    is_live: bool,
}

impl Default for SourceProps {
    fn default() -> Self {
        Self {
            num_buffers: Some(100),
            framerate: 30,
            is_live: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EncoderProps {
    key_int_max: u64,
    fail_after: Option<u64>,
}

impl Default for EncoderProps {
    fn default() -> Self {
        Self {
            key_int_max: 30,
            fail_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Source(SourceProps),
    Encoder(EncoderProps),
    Sink,
}

impl StageKind {
    fn factory(&self) -> &'static str {
        match self {
            StageKind::Source(_) => "testsrc",
            StageKind::Encoder(_) => "encoder",
            StageKind::Sink => "sink",
        }
    }
}

#[derive(Debug, Clone)]
struct StageSpec {
    name: String,
    kind: StageKind,
}

/// Builds [`MemoryGraph`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBuilder;

impl MemoryBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl GraphBuilder for MemoryBuilder {
    type Graph = MemoryGraph;

    fn build(&self, description: &[String]) -> std::result::Result<MemoryGraph, BuildError> {
        let stages = parse_description(&description.join(" "))?;
        Ok(MemoryGraph::new(stages))
    }
}

fn parse_description(description: &str) -> std::result::Result<Vec<StageSpec>, BuildError> {
    if description.trim().is_empty() {
        return Err(BuildError::new("empty pipeline description"));
    }

    let mut counters = [0usize; 3];
    let mut names = HashSet::new();
    let mut stages = Vec::new();

    for segment in description.split('!') {
        let mut tokens = segment.split_whitespace();
        let Some(factory) = tokens.next() else {
            return Err(BuildError::new("empty stage in pipeline description"));
        };
        let (mut kind, counter) = match factory {
            "testsrc" => (StageKind::Source(SourceProps::default()), 0),
            "encoder" => (StageKind::Encoder(EncoderProps::default()), 1),
            "sink" => (StageKind::Sink, 2),
            other => return Err(BuildError::new(format!("no element \"{other}\""))),
        };

        let mut name = format!("{factory}{}", counters[counter]);
        counters[counter] += 1;

        for token in tokens {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| BuildError::new(format!("unexpected token \"{token}\" for element \"{factory}\"")))?;
            if key == "name" {
                if value.is_empty() {
                    return Err(BuildError::new("empty element name"));
                }
                name = value.to_string();
                continue;
            }
            set_property(&mut kind, &name, key, value)?;
        }

        if !names.insert(name.clone()) {
            return Err(BuildError::new(format!("duplicate element name \"{name}\"")));
        }
        stages.push(StageSpec { name, kind });
    }

    if !matches!(stages.first().map(|s| s.kind), Some(StageKind::Source(_))) {
        return Err(BuildError::new("first element must be a testsrc"));
    }
    if !matches!(stages.last().map(|s| s.kind), Some(StageKind::Sink)) || stages.len() < 2 {
        return Err(BuildError::new("last element must be a sink"));
    }
    if let Some(misplaced) = stages[1..stages.len() - 1]
        .iter()
        .find(|s| !matches!(s.kind, StageKind::Encoder(_)))
    {
        return Err(BuildError::new(format!(
            "element \"{}\" ({}) cannot be linked in the middle of the graph",
            misplaced.name,
            misplaced.kind.factory()
        )));
    }

    Ok(stages)
}

fn set_property(
    kind: &mut StageKind,
    element: &str,
    key: &str,
    value: &str,
) -> std::result::Result<(), BuildError> {
    let invalid = || {
        BuildError::new(format!(
            "could not set property \"{key}\" in element \"{element}\" to \"{value}\""
        ))
    };

    match (kind, key) {
        (StageKind::Source(props), "num-buffers") => {
            let n: i64 = value.parse().map_err(|_| invalid())?;
            props.num_buffers = match n {
                -1 => None,
                n if n >= 0 => Some(n as u64),
                _ => return Err(invalid()),
            };
        }
        (StageKind::Source(props), "framerate") => {
            props.framerate = value
                .parse::<u32>()
                .ok()
                .filter(|rate| *rate > 0)
                .ok_or_else(invalid)?;
        }
        (StageKind::Source(props), "is-live") => {
            props.is_live = parse_bool(value).ok_or_else(invalid)?;
        }
        (StageKind::Encoder(props), "key-int-max") => {
            props.key_int_max = value.parse().map_err(|_| invalid())?;
        }
        (StageKind::Encoder(props), "fail-after") => {
            props.fail_after = Some(value.parse().map_err(|_| invalid())?);
        }
        _ => {
            return Err(BuildError::new(format!(
                "no property \"{key}\" in element \"{element}\""
            )))
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Shared state of an encoder stage
#[derive(Debug, Default)]
struct EncoderControl {
    /// Pending forced key unit; value is `all_headers`
    pending: Mutex<Option<bool>>,
    requests: AtomicU64,
}

impl EncoderControl {
    fn force_key_unit(&self, all_headers: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        *pending = Some(pending.unwrap_or(false) || all_headers);
    }

    fn take_pending(&self) -> Option<bool> {
        self.pending.lock().take()
    }
}

#[derive(Debug, Default)]
struct SinkRecord {
    buffers: Mutex<Vec<BufferMeta>>,
}

struct Link {
    name: String,
    tap: Mutex<Option<TapFn>>,
    /// Encoder feeding this link, if any
    producer: Option<Arc<EncoderControl>>,
}

/// Output edge of a memory stage
#[derive(Clone)]
pub struct MemoryEdge {
    link: Arc<Link>,
}

impl Edge for MemoryEdge {
    fn name(&self) -> String {
        self.link.name.clone()
    }

    fn send_upstream(&self, signal: ControlSignal) -> std::result::Result<(), SignalDeliveryError> {
        let Some(producer) = &self.link.producer else {
            return Err(SignalDeliveryError::new(
                self.name(),
                "upstream stage cannot produce key units",
            ));
        };
        match signal {
            ControlSignal::ForceKeyUnit { all_headers, .. } => producer.force_key_unit(all_headers),
        }
        Ok(())
    }
}

/// Handle to a stage of a [`MemoryGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStage {
    index: usize,
}

/// Observes a [`MemoryGraph`] from outside the driver
#[derive(Clone)]
pub struct MemoryProbe {
    sink: Arc<SinkRecord>,
    encoders: Vec<(String, Arc<EncoderControl>)>,
}

impl MemoryProbe {
    /// Buffers that reached the sink, in arrival order
    pub fn received(&self) -> Vec<BufferMeta> {
        self.sink.buffers.lock().clone()
    }

    /// Key unit requests the named encoder received
    pub fn key_unit_requests(&self, encoder: &str) -> Option<u64> {
        self.encoders
            .iter()
            .find(|(name, _)| name == encoder)
            .map(|(_, control)| control.requests.load(Ordering::Relaxed))
    }
}

struct Streaming {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct MemoryGraph {
    stages: Vec<StageSpec>,
    controls: Vec<Option<Arc<EncoderControl>>>,
    links: Vec<Arc<Link>>,
    sink: Arc<SinkRecord>,
    events: Option<EventSender>,
    property_notifications: bool,
    streaming: Option<Streaming>,
}

impl MemoryGraph {
    fn new(stages: Vec<StageSpec>) -> Self {
        let controls: Vec<_> = stages
            .iter()
            .map(|stage| match stage.kind {
                StageKind::Encoder(_) => Some(Arc::new(EncoderControl::default())),
                _ => None,
            })
            .collect();

        let links = stages
            .windows(2)
            .enumerate()
            .map(|(i, _)| {
                Arc::new(Link {
                    name: format!("{}:src", stages[i].name),
                    tap: Mutex::new(None),
                    producer: controls[i].clone(),
                })
            })
            .collect();

        Self {
            stages,
            controls,
            links,
            sink: Arc::new(SinkRecord::default()),
            events: None,
            property_notifications: false,
            streaming: None,
        }
    }

    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe {
            sink: Arc::clone(&self.sink),
            encoders: self
                .stages
                .iter()
                .zip(&self.controls)
                .filter_map(|(stage, control)| {
                    control.as_ref().map(|c| (stage.name.clone(), Arc::clone(c)))
                })
                .collect(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.streaming.is_some()
    }

    fn spawn_streaming(&mut self) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let chain = StreamChain {
            stages: self
                .stages
                .iter()
                .zip(&self.controls)
                .map(|(spec, control)| StageRuntime::new(spec, control.clone()))
                .collect(),
            links: self.links.clone(),
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            property_notifications: self.property_notifications,
            stop: Arc::clone(&stop),
        };

        let thread = thread::Builder::new()
            .name("memory-streaming".to_string())
            .spawn(move || chain.run())?;

        self.streaming = Some(Streaming { stop, thread });
        Ok(())
    }
}

impl Graph for MemoryGraph {
    type Stage = MemoryStage;
    type Edge = MemoryEdge;

    fn find_stage(&self, name: &str) -> Option<MemoryStage> {
        self.stages
            .iter()
            .position(|stage| stage.name == name)
            .map(|index| MemoryStage { index })
    }

    fn output_edge(&self, stage: &MemoryStage) -> Option<MemoryEdge> {
        self.links.get(stage.index).map(|link| MemoryEdge {
            link: Arc::clone(link),
        })
    }

    fn attach_tap(&mut self, edge: &MemoryEdge, tap: TapFn) -> Result<()> {
        let mut slot = edge.link.tap.lock();
        if slot.is_some() {
            return Err(Error::State(format!("{} already has a tap", edge.link.name)));
        }
        *slot = Some(tap);
        Ok(())
    }

    fn subscribe(&mut self, events: EventSender, property_notifications: bool) -> Result<()> {
        self.events = Some(events);
        self.property_notifications = property_notifications;
        Ok(())
    }

    fn set_state(&mut self, state: TargetState) -> Result<()> {
        match state {
            TargetState::Running => {
                if self.streaming.is_none() {
                    self.spawn_streaming()?;
                }
            }
            TargetState::Stopped => {
                if let Some(streaming) = self.streaming.take() {
                    streaming.stop.store(true, Ordering::Release);
                    if streaming.thread.join().is_err() {
                        return Err(Error::State("streaming thread panicked".to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        for link in &self.links {
            link.tap.lock().take();
        }
        self.events = None;
    }
}

impl Drop for MemoryGraph {
    fn drop(&mut self) {
        if let Err(e) = self.set_state(TargetState::Stopped) {
            warn!(error = %e, "Failed to stop memory graph");
        }
    }
}

enum StageRuntime {
    Source {
        props: SourceProps,
    },
    Encoder {
        name: String,
        props: EncoderProps,
        control: Arc<EncoderControl>,
        produced: u64,
    },
    Sink,
}

impl StageRuntime {
    fn new(spec: &StageSpec, control: Option<Arc<EncoderControl>>) -> Self {
        match (spec.kind, control) {
            (StageKind::Source(props), _) => StageRuntime::Source { props },
            (StageKind::Encoder(props), Some(control)) => StageRuntime::Encoder {
                name: spec.name.clone(),
                props,
                control,
                produced: 0,
            },
            (StageKind::Encoder(props), None) => StageRuntime::Encoder {
                name: spec.name.clone(),
                props,
                control: Arc::default(),
                produced: 0,
            },
            (StageKind::Sink, _) => StageRuntime::Sink,
        }
    }

    fn caps(&self, framerate: u32) -> String {
        match self {
            StageRuntime::Source { .. } => format!("video/x-raw, framerate=(fraction){framerate}/1"),
            StageRuntime::Encoder { .. } => {
                format!("video/x-memory-encoded, framerate=(fraction){framerate}/1")
            }
            StageRuntime::Sink => String::new(),
        }
    }
}

/// Everything the streaming thread owns
struct StreamChain {
    stages: Vec<StageRuntime>,
    links: Vec<Arc<Link>>,
    sink: Arc<SinkRecord>,
    events: Option<EventSender>,
    property_notifications: bool,
    stop: Arc<AtomicBool>,
}

/// Why a buffer did not reach the end of the chain
enum Interrupted {
    Discarded,
    Failed(GraphEvent),
}

impl StreamChain {
    fn post(&self, event: GraphEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn run(mut self) {
        let source = match self.stages.first() {
            Some(StageRuntime::Source { props }) => *props,
            _ => return,
        };
        let frame_ns = 1_000_000_000 / u64::from(source.framerate);

        if self.property_notifications {
            for (stage, link) in self.stages.iter().zip(&self.links) {
                self.post(GraphEvent::PropertyNotification(PropertyNotification {
                    path: format!("/{GRAPH_NAME}/{}", link.name),
                    name: "caps".to_string(),
                    value: PropertyValue::Structured(stage.caps(source.framerate)),
                }));
            }
        }

        let mut sequence = 0u64;
        loop {
            if self.stop.load(Ordering::Acquire) {
                debug!(buffers = sequence, "Streaming stopped");
                return;
            }
            if source.num_buffers.is_some_and(|limit| sequence >= limit) {
                break;
            }
            if source.is_live {
                thread::sleep(Duration::from_nanos(frame_ns));
            }

            let buffer = BufferMeta::key_unit(Duration::from_nanos(frame_ns * sequence));
            sequence += 1;

            if let Err(Interrupted::Failed(event)) = self.push(buffer) {
                self.post(event);
                return;
            }
        }

        debug!(buffers = sequence, "Source exhausted");
        self.post(GraphEvent::EndOfStream);
    }

    /// Carry one source buffer through every link and stage
    fn push(&mut self, mut buffer: BufferMeta) -> std::result::Result<(), Interrupted> {
        for index in 0..self.links.len() {
            {
                let tap = self.links[index].tap.lock();
                if let Some(tap) = tap.as_ref() {
                    if tap(&buffer) == Verdict::Discard {
                        return Err(Interrupted::Discarded);
                    }
                }
            }

            match &mut self.stages[index + 1] {
                StageRuntime::Encoder {
                    name,
                    props,
                    control,
                    produced,
                } => {
                    if props.fail_after.is_some_and(|limit| *produced >= limit) {
                        return Err(Interrupted::Failed(GraphEvent::Error {
                            source: name.clone(),
                            message: "Internal data stream error.".to_string(),
                            debug: Some(format!("{name} failed after {produced} buffers")),
                        }));
                    }

                    let forced = control.take_pending();
                    let periodic = props.key_int_max > 0 && *produced % props.key_int_max == 0;
                    let key_unit = *produced == 0 || periodic || forced.is_some();
                    buffer = BufferMeta {
                        pts: buffer.pts,
                        delta_unit: !key_unit,
                        header: *produced == 0 || forced == Some(true),
                    };
                    *produced += 1;
                }
                StageRuntime::Sink => self.sink.buffers.lock().push(buffer),
                StageRuntime::Source { .. } => {}
            }
        }
        Ok(())
    }
}
