use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> Result<Option<Duration>, E> {
        match self {
            Self::Millis(ms) => Ok(Some(Duration::from_millis(ms))),
            Self::Text(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(None);
                }
                humantime::parse_duration(value).map(Some).map_err(E::custom)
            }
        }
    }
}

/// Bare integers are milliseconds, strings are humantime (`7d`, `2500ms`).
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()?
        .ok_or_else(|| D::Error::custom("empty duration"))
}

pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => raw.into_duration(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "super::deserialize_duration")]
        retention: Duration,
        #[serde(default, deserialize_with = "super::deserialize_optional_duration")]
        sweep: Option<Duration>,
    }

    #[test]
    fn integer_is_milliseconds() {
        let sample: Sample = serde_yaml::from_str("retention: 2500").unwrap();
        assert_eq!(sample.retention, Duration::from_millis(2500));
        assert!(sample.sweep.is_none());
    }

    #[test]
    fn text_is_humantime() {
        let sample: Sample =
            serde_yaml::from_str("retention: 7d\nsweep: 10m").unwrap();
        assert_eq!(sample.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(sample.sweep, Some(Duration::from_secs(600)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(serde_yaml::from_str::<Sample>("retention: soon").is_err());
    }
}
