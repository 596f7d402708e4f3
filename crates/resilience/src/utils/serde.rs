//! Serde adapters for durations in settings files and statistics.
//!
//! Every duration the crate reads or writes is expressed in whole
//! milliseconds, e.g. `recovery_timeout = 60000`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// `Duration` <-> `u64` milliseconds.
///
/// ```rust
/// use std::time::Duration;
///
/// use serde::{Deserialize, Serialize};
/// use tradeguard_resilience::utils::serde::duration_millis;
///
/// #[derive(Serialize, Deserialize)]
/// struct Probe {
///     #[serde(with = "duration_millis")]
///     interval: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    /// Serialize as milliseconds, saturating at `u64::MAX`.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` <-> optional `u64` milliseconds.
///
/// Use together with `#[serde(default)]` so an absent key means `None`.
pub mod option_duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    /// Serialize `Some` as milliseconds and `None` as a unit/none value.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
