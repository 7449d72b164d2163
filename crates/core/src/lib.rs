//! launch-drop core
//!
//! Runs a media processing graph built from a textual description while
//! intercepting the buffers that leave one named stage. The interception
//! point (the [`FlowTap`]) admits an initial window of buffers, discards the
//! next window, and can ask the producing stage for a fresh key unit once the
//! discard window closes.
//!
//! The crate is split along the same seams as the running system:
//!
//! - [`graph`]: interfaces of the media runtime (builder, graph, edges, events)
//! - [`tap`]: per-buffer admission policy and the upstream signal injector
//! - [`driver`]: graph lifecycle (start, blocking dispatch loop, stop)
//! - [`dispatch`]: mapping of graph events to operator output and termination
//! - [`backend`]: runtimes implementing [`graph`] (in-process, GStreamer)
//!
//! # Example
//!
//! ```no_run
//! use launchdrop_core::backend::memory::MemoryBuilder;
//! use launchdrop_core::{Config, EventDispatcher, GraphBuilder, LifecycleDriver};
//!
//! # fn main() -> launchdrop_core::Result<()> {
//! let description = vec![
//!     "testsrc num-buffers=60 ! encoder name=encoder ! sink".to_string(),
//! ];
//! let graph = MemoryBuilder::new().build(&description)?;
//!
//! let mut config = Config::default();
//! config.tap.target = Some("encoder".to_string());
//!
//! let mut driver = LifecycleDriver::new(graph, &config, EventDispatcher::stdio(false));
//! driver.start()?;
//! let reason = driver.run_until_terminal()?;
//! println!("stopped: {reason}");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod graph;
pub mod tap;

pub use buffer::{BufferMeta, Verdict};
pub use config::{Config, ConfigError, OutputConfig, TapConfig};
pub use dispatch::{Dispatch, EventDispatcher};
pub use driver::{FailureKind, LifecycleDriver, RunState, RuntimeFailure, StopHandle, StopReason};
pub use error::{BuildError, Error, LookupError, Result, SignalDeliveryError};
pub use graph::{
    create_event_channel, ControlSignal, Edge, EventReceiver, EventSender, Graph, GraphBuilder,
    GraphEvent, PropertyNotification, PropertyValue, TapFn, TargetState,
};
pub use tap::{FlowTap, TapPolicy, TapStats, WindowPosition};
