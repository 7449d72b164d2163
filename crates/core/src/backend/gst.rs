//! GStreamer graph runtime
//!
//! Graphs are built with `gst::parse::launchv`, taps are buffer pad probes on
//! a stage's static `src` pad, and key unit requests are upstream
//! force-key-unit events sent on that pad. Bus messages are forwarded into the
//! event channel from a bus sync handler, so no GLib main loop is needed.

use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;
use gstreamer_video as gst_video;
use tracing::{debug, warn};

use crate::buffer::{BufferMeta, Verdict};
use crate::error::{BuildError, Error, Result, SignalDeliveryError};
use crate::graph::{
    ControlSignal, Edge, EventSender, Graph, GraphBuilder, GraphEvent, PropertyNotification,
    PropertyValue, TapFn, TargetState,
};

/// Builds [`GstGraph`]s
#[derive(Debug)]
pub struct GstBuilder {
    _initialized: (),
}

impl GstBuilder {
    /// Initialize GStreamer
    ///
    /// Safe to call more than once.
    pub fn init() -> Result<Self> {
        gst::init().map_err(|e| Error::Init(format!("GStreamer: {e}")))?;
        Ok(Self { _initialized: () })
    }
}

impl GraphBuilder for GstBuilder {
    type Graph = GstGraph;

    fn build(&self, description: &[String]) -> std::result::Result<GstGraph, BuildError> {
        let argv: Vec<&str> = description.iter().map(String::as_str).collect();
        let element = gst::parse::launchv(&argv).map_err(|e| BuildError::new(e.message()))?;

        let pipeline = match element.downcast::<gst::Pipeline>() {
            Ok(pipeline) => pipeline,
            Err(element) => {
                let pipeline = gst::Pipeline::new();
                pipeline
                    .add(&element)
                    .map_err(|e| BuildError::new(e.to_string()))?;
                pipeline
            }
        };
        debug!(pipeline = %pipeline.name(), "Graph built");

        Ok(GstGraph {
            pipeline,
            probes: Vec::new(),
            notify_watch: None,
        })
    }
}

/// A stage's static `src` pad
#[derive(Clone)]
pub struct GstEdge {
    pad: gst::Pad,
}

impl Edge for GstEdge {
    fn name(&self) -> String {
        match self.pad.parent_element() {
            Some(element) => format!("{}:{}", element.name(), self.pad.name()),
            None => self.pad.name().to_string(),
        }
    }

    fn send_upstream(&self, signal: ControlSignal) -> std::result::Result<(), SignalDeliveryError> {
        let event = match signal {
            ControlSignal::ForceKeyUnit { all_headers, count } => {
                gst_video::UpstreamForceKeyUnitEvent::builder()
                    .all_headers(all_headers)
                    .count(count)
                    .build()
            }
        };
        if self.pad.send_event(event) {
            Ok(())
        } else {
            Err(SignalDeliveryError::new(
                self.name(),
                "force-key-unit event was not handled upstream",
            ))
        }
    }
}

pub struct GstGraph {
    pipeline: gst::Pipeline,
    probes: Vec<(gst::Pad, gst::PadProbeId)>,
    notify_watch: Option<gst::NotifyWatchId>,
}

impl Graph for GstGraph {
    type Stage = gst::Element;
    type Edge = GstEdge;

    fn find_stage(&self, name: &str) -> Option<gst::Element> {
        self.pipeline.by_name(name)
    }

    fn output_edge(&self, stage: &gst::Element) -> Option<GstEdge> {
        stage.static_pad("src").map(|pad| GstEdge { pad })
    }

    fn attach_tap(&mut self, edge: &GstEdge, tap: TapFn) -> Result<()> {
        let id = edge
            .pad
            .add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
                let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data else {
                    return gst::PadProbeReturn::Ok;
                };
                let flags = buffer.flags();
                let meta = BufferMeta {
                    pts: buffer.pts().map(|t| Duration::from_nanos(t.nseconds())),
                    delta_unit: flags.contains(gst::BufferFlags::DELTA_UNIT),
                    header: flags.contains(gst::BufferFlags::HEADER),
                };
                match tap(&meta) {
                    Verdict::Admit => gst::PadProbeReturn::Ok,
                    Verdict::Discard => gst::PadProbeReturn::Drop,
                }
            })
            .ok_or_else(|| Error::State(format!("Failed to add buffer probe on {}", edge.name())))?;

        self.probes.push((edge.pad.clone(), id));
        Ok(())
    }

    fn subscribe(&mut self, events: EventSender, property_notifications: bool) -> Result<()> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| Error::State("Pipeline has no bus".to_string()))?;

        bus.set_sync_handler(move |_bus, message| {
            let _ = events.send(translate(message));
            gst::BusSyncReply::Drop
        });

        if property_notifications {
            self.notify_watch = Some(self.pipeline.add_property_deep_notify_watch(None, true));
        }
        Ok(())
    }

    fn set_state(&mut self, state: TargetState) -> Result<()> {
        let target = match state {
            TargetState::Running => gst::State::Playing,
            TargetState::Stopped => gst::State::Null,
        };
        self.pipeline
            .set_state(target)
            .map_err(|e| Error::State(format!("Failed to set pipeline to {target:?}: {e}")))?;
        Ok(())
    }

    fn release(&mut self) {
        for (pad, id) in self.probes.drain(..) {
            pad.remove_probe(id);
        }
        if let Some(watch) = self.notify_watch.take() {
            self.pipeline.remove_property_notify_watch(watch);
        }
        match self.pipeline.bus() {
            Some(bus) => bus.unset_sync_handler(),
            None => warn!("Pipeline has no bus to unsubscribe from"),
        }
    }
}

fn translate(message: &gst::Message) -> GraphEvent {
    use gst::MessageView;

    match message.view() {
        MessageView::Error(err) => GraphEvent::Error {
            source: message
                .src()
                .map(|s| s.name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            message: err.error().message().to_string(),
            debug: err.debug().map(|d| d.to_string()),
        },
        MessageView::Eos(_) => GraphEvent::EndOfStream,
        MessageView::PropertyNotify(notify) => {
            let (object, name, value) = notify.get();
            GraphEvent::PropertyNotification(PropertyNotification {
                path: object.path_string().to_string(),
                name: name.to_string(),
                value: value.map(describe_value).unwrap_or(PropertyValue::Unset),
            })
        }
        _ => GraphEvent::Other {
            kind: format!("{:?}", message.type_()),
        },
    }
}

fn describe_value(value: &gst::glib::Value) -> PropertyValue {
    if let Ok(Some(text)) = value.get::<Option<String>>() {
        return PropertyValue::Text(text);
    }
    if let Ok(Some(caps)) = value.get::<Option<gst::Caps>>() {
        return PropertyValue::Structured(caps.to_string());
    }
    if let Ok(Some(tags)) = value.get::<Option<gst::TagList>>() {
        return PropertyValue::Structured(tags.to_string());
    }
    if let Ok(Some(structure)) = value.get::<Option<gst::Structure>>() {
        return PropertyValue::Structured(structure.to_string());
    }
    match value.serialize() {
        Ok(serialized) => PropertyValue::Serialized(serialized.to_string()),
        Err(_) => PropertyValue::Unset,
    }
}
