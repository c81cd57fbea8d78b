//! Serde helpers shared by the configuration types

/// Serialize a `Duration` as whole seconds.
///
/// Keeps TOML files readable: `reconnect_delay = 15` rather than a
/// `{ secs, nanos }` table.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        connect: Duration,
    }

    #[test]
    fn test_duration_written_as_seconds() {
        let timeouts = Timeouts {
            connect: Duration::from_secs(20),
        };
        assert_eq!(serde_json::to_string(&timeouts).unwrap(), r#"{"connect":20}"#);
    }

    #[test]
    fn test_duration_read_from_seconds() {
        let timeouts: Timeouts = serde_json::from_str(r#"{"connect":45}"#).unwrap();
        assert_eq!(timeouts.connect, Duration::from_secs(45));
    }

    #[test]
    fn test_sub_second_precision_is_dropped() {
        let timeouts = Timeouts {
            connect: Duration::from_millis(2500),
        };
        let json = serde_json::to_string(&timeouts).unwrap();
        let parsed: Timeouts = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.connect, Duration::from_secs(2));
    }
}
