// src/types/date.rs

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ParseError;

/// A Parse timestamp as it appears in LiveQuery object payloads (`createdAt`, `updatedAt`).
///
/// The server sends these as bare ISO 8601 strings; the string is kept verbatim so a
/// payload round-trips unchanged, and converted to `chrono` on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDate {
    pub iso: String,
}

impl ParseDate {
    pub fn new(iso_string: impl Into<String>) -> Self {
        ParseDate {
            iso: iso_string.into(),
        }
    }

    pub fn iso(&self) -> &str {
        &self.iso
    }

    pub fn from_datetime(date: DateTime<Utc>) -> Self {
        ParseDate {
            iso: date.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn to_datetime(&self) -> Result<DateTime<Utc>, ParseError> {
        DateTime::parse_from_rfc3339(&self.iso)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|e| {
                ParseError::JsonDeserializationFailed(format!(
                    "invalid ISO 8601 date '{}': {}",
                    self.iso, e
                ))
            })
    }
}

impl<'de> Deserialize<'de> for ParseDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Pointer-style dates ({"__type": "Date", "iso": ...}) show up in custom fields.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Plain(String),
            Typed { iso: String },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Plain(iso) | Repr::Typed { iso } => Ok(ParseDate { iso }),
        }
    }
}

impl Serialize for ParseDate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.iso)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_parse_date_to_datetime() {
        let date = ParseDate::new("2024-05-01T12:30:45.123Z");
        let parsed = date.to_datetime().expect("valid date");
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.month(), 5);
        assert_eq!(parsed.hour(), 12);
        assert_eq!(parsed.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_parse_date_from_datetime_uses_millis_and_z() {
        let date = Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            ParseDate::from_datetime(date).iso(),
            "2023-01-02T03:04:05.000Z"
        );
    }

    #[test]
    fn test_parse_date_accepts_typed_representation() {
        let date: ParseDate =
            serde_json::from_str(r#"{"__type":"Date","iso":"2023-01-02T03:04:05.000Z"}"#)
                .unwrap();
        assert_eq!(date.iso(), "2023-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_invalid_date_is_an_error() {
        assert!(ParseDate::new("yesterday").to_datetime().is_err());
    }
}
