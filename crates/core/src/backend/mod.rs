//! Graph runtimes
//!
//! - [`memory`]: in-process runtime with synthetic stages, always available
//! - `gst`: GStreamer runtime, behind the `gstreamer` feature

pub mod memory;

#[cfg(feature = "gstreamer")]
pub mod gst;
