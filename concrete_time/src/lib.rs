// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A crate with concrete, serializable time values.
//!
//! `std::time` provides [`std::time::Duration`] which cannot be serialized, because its
//! internals are private. These types are open equivalents which can cross serialization
//! boundaries (e.g. into process result metadata).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

///
/// An opaque duration, with second and nanosecond components.
///
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Duration {
    pub secs: u64,
    pub nanos: u32,
}

impl Duration {
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self { secs, nanos }
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self::new(duration.as_secs(), duration.subsec_nanos())
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        std::time::Duration::new(duration.secs, duration.nanos)
    }
}

impl From<Duration> for prost_types::Duration {
    fn from(duration: Duration) -> Self {
        prost_types::Duration {
            seconds: duration.secs as i64,
            nanos: duration.nanos as i32,
        }
    }
}

///
/// A span of time, relative to the unix epoch.
///
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    /// The time from the start of the unix epoch until the start of this span.
    pub start: Duration,
    /// The duration of the span.
    pub duration: Duration,
}

impl TimeSpan {
    ///
    /// Construct a TimeSpan from a pair of protobuf Timestamps, failing if they are not
    /// ordered.
    ///
    pub fn from_start_and_end(
        start: &prost_types::Timestamp,
        end: &prost_types::Timestamp,
    ) -> Result<TimeSpan, String> {
        let start_duration = std::time::Duration::new(start.seconds as u64, start.nanos as u32);
        let end_duration = std::time::Duration::new(end.seconds as u64, end.nanos as u32);
        let duration = end_duration.checked_sub(start_duration).ok_or_else(|| {
            format!("Got negative span between timestamps: {start:?} to {end:?}")
        })?;
        Ok(TimeSpan {
            start: start_duration.into(),
            duration: duration.into(),
        })
    }

    ///
    /// Construct a TimeSpan that started at `start` and ends now.
    ///
    pub fn since(start: &SystemTime) -> TimeSpan {
        let start_relative_to_epoch = start
            .duration_since(UNIX_EPOCH)
            .expect("All times should be after the unix epoch.");
        TimeSpan {
            start: start_relative_to_epoch.into(),
            duration: start.elapsed().unwrap_or_default().into(),
        }
    }

    pub fn end(&self) -> Duration {
        let end = std::time::Duration::from(self.start) + std::time::Duration::from(self.duration);
        end.into()
    }
}

#[cfg(test)]
mod tests {
    use super::{Duration, TimeSpan};

    #[test]
    fn duration_roundtrips_with_std() {
        let std = std::time::Duration::new(3, 141_592_653);
        let ours: Duration = std.into();
        assert_eq!(ours, Duration::new(3, 141_592_653));
        assert_eq!(std::time::Duration::from(ours), std);
    }

    #[test]
    fn time_span_end() {
        let span = TimeSpan {
            start: Duration::new(1, 900_000_000),
            duration: Duration::new(0, 200_000_000),
        };
        assert_eq!(span.end(), Duration::new(2, 100_000_000));
    }

    #[test]
    fn time_span_since() {
        let start = std::time::SystemTime::now();
        let span = TimeSpan::since(&start);
        assert!(span.duration.secs < 60);
    }
}
