//! Human-readable byte counts for limits and error messages.

use std::fmt;

use serde::Serialize;

/// A byte count that displays in IEC units (KiB, MiB, GiB) with trimmed precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            return write!(f, "{} B", self.0);
        }

        let mut rendered = format!("{value:.2}");
        while rendered.ends_with('0') {
            rendered.pop();
        }
        if rendered.ends_with('.') {
            rendered.pop();
        }
        write!(f, "{rendered} {}", UNITS[unit])
    }
}
