//! Buffer metadata seen by a tap
//!
//! The tap never touches buffer payloads. Runtimes hand it a [`BufferMeta`]
//! snapshot and act on the returned [`Verdict`].

use std::fmt;
use std::time::Duration;

/// Read-only view of one buffer crossing an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferMeta {
    /// Presentation timestamp, `None` when unknown
    pub pts: Option<Duration>,

    /// Buffer cannot be decoded on its own (not a key unit)
    pub delta_unit: bool,

    /// Buffer carries stream headers
    pub header: bool,
}

impl BufferMeta {
    /// A self-contained key unit at `pts`
    pub fn key_unit(pts: Duration) -> Self {
        Self {
            pts: Some(pts),
            delta_unit: false,
            header: false,
        }
    }

    /// A delta unit at `pts`
    pub fn delta(pts: Duration) -> Self {
        Self {
            pts: Some(pts),
            delta_unit: true,
            header: false,
        }
    }

    pub fn is_key_unit(&self) -> bool {
        !self.delta_unit
    }
}

impl fmt::Display for BufferMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pts {} delta: {} header: {}",
            ClockDisplay(self.pts),
            u8::from(self.delta_unit),
            u8::from(self.header)
        )
    }
}

/// Admission decision for one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the buffer unchanged
    Admit,
    /// Do not forward the buffer
    Discard,
}

/// Formats an optional timestamp as `H:MM:SS.NNNNNNNNN`
///
/// Unknown timestamps render as `99:99:99.999999999`.
#[derive(Debug, Clone, Copy)]
pub struct ClockDisplay(pub Option<Duration>);

impl fmt::Display for ClockDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("99:99:99.999999999"),
            Some(t) => {
                let secs = t.as_secs();
                write!(
                    f,
                    "{}:{:02}:{:02}.{:09}",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60,
                    t.subsec_nanos()
                )
            }
        }
    }
}
