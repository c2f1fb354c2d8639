//! Monotonic time source and identifiers used by scheduling decisions

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Monotonic clock. Wall-clock adjustments never affect deadlines.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonoClock;

impl MonoClock {
    /// Current monotonic instant
    pub fn now() -> Instant {
        Instant::now()
    }

    /// Milliseconds elapsed since `start`, saturating at `u64::MAX`
    pub fn elapsed_ms(start: Instant) -> u64 {
        duration_ms(start.elapsed())
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of one `execute` call
    ExecutionId
);

uuid_id!(
    /// Identity of a pooled isolate
    IsolateId
);

uuid_id!(
    /// Identity of a registered script
    ScriptId
);
