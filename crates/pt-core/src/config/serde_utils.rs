//! Serde helpers for configuration durations
//!
//! Config files spell durations as plain integers. Use `duration_secs` for
//! long deadlines and `duration_millis` where sub-second precision matters
//! (ICE gathering, direct handshake).

/// `Duration` as an integer number of seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Duration` as an integer number of milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Deadlines {
        #[serde(with = "duration_secs")]
        request: Duration,
        #[serde(with = "duration_millis")]
        gather: Duration,
    }

    #[test]
    fn test_durations_written_as_integers() {
        let deadlines = Deadlines {
            request: Duration::from_secs(30),
            gather: Duration::from_millis(1500),
        };
        let text = toml::to_string(&deadlines).unwrap();
        assert!(text.contains("request = 30"));
        assert!(text.contains("gather = 1500"));
    }

    #[test]
    fn test_seconds_truncate_subsecond_parts() {
        let deadlines = Deadlines {
            request: Duration::from_millis(2900),
            gather: Duration::from_millis(250),
        };
        let parsed: Deadlines = toml::from_str(&toml::to_string(&deadlines).unwrap()).unwrap();
        assert_eq!(parsed.request, Duration::from_secs(2));
        assert_eq!(parsed.gather, Duration::from_millis(250));
    }

    #[test]
    fn test_negative_rejected() {
        assert!(toml::from_str::<Deadlines>("request = -1\ngather = 0\n").is_err());
    }
}
