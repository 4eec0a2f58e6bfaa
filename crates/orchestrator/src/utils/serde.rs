//! Serde helpers for configuration durations
//!
//! Configuration files express every delay and timeout as an integer number
//! of milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// `Duration` as `u64` milliseconds.
///
/// ```rust
/// use std::time::Duration;
///
/// use serde::{Deserialize, Serialize};
/// use tenantry_orchestrator::utils::serde::duration_millis;
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     delay: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a `Duration` as whole milliseconds, saturating at `u64::MAX`.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize milliseconds into a `Duration`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// `Option<Duration>` as optional `u64` milliseconds.
///
/// Pair with `#[serde(default)]` so an absent field reads as `None`.
pub mod option_duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize `Some(duration)` as milliseconds and `None` as null.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer
                .serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Timeouts {
        #[serde(with = "duration_millis")]
        delay: Duration,
        #[serde(default, with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
        deadline: Option<Duration>,
    }

    /// Tests that durations are written as plain millisecond integers
    #[test]
    fn test_serializes_as_millis() {
        let value = Timeouts { delay: Duration::from_millis(1500), deadline: None };
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(json, r#"{"delay":1500}"#);
    }

    /// Tests that a missing optional duration reads as `None`
    #[test]
    fn test_optional_field_defaults_to_none() {
        let value: Timeouts = serde_json::from_str(r#"{"delay":250}"#).expect("deserialize");
        assert_eq!(value.delay, Duration::from_millis(250));
        assert_eq!(value.deadline, None);

        let value: Timeouts =
            serde_json::from_str(r#"{"delay":0,"deadline":60000}"#).expect("deserialize");
        assert_eq!(value.deadline, Some(Duration::from_secs(60)));
    }
}
