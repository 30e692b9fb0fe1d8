//! Telemetry record types shared by the builder, queue store and transport

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Arbitrary JSON mapping used for fields, properties, contexts and extra.
pub type Fields = Map<String, Value>;

/// String to string mapping attached to every record.
pub type Tags = HashMap<String, String>;

pub const SDK_NAME: &str = "logtap-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Event,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Debug => write!(f, "debug"),
            Level::Info => write!(f, "info"),
            Level::Warn => write!(f, "warn"),
            Level::Error => write!(f, "error"),
            Level::Fatal => write!(f, "fatal"),
            Level::Event => write!(f, "event"),
        }
    }
}

impl From<&str> for Level {
    fn from(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TRACE" | "VERBOSE" | "DEBUG" => Level::Debug,
            "INFO" | "INFORMATION" => Level::Info,
            "WARN" | "WARNING" => Level::Warn,
            "ERROR" | "ERR" => Level::Error,
            "FATAL" | "CRITICAL" | "PANIC" => Level::Fatal,
            "EVENT" => Level::Event,
            _ => Level::Info,
        }
    }
}

/// Profile of the user the client currently acts for.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traits: Option<Fields>,
}

impl UserProfile {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_traits(mut self, traits: Fields) -> Self {
        self.traits = Some(traits);
        self
    }

    /// Trim every identity field and drop blank ones. A profile with nothing
    /// left is no profile at all.
    pub fn normalized(self) -> Option<Self> {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        let profile = Self {
            id: clean(self.id),
            email: clean(self.email),
            username: clean(self.username),
            traits: self.traits.filter(|t| !t.is_empty()),
        };

        if profile.id.is_none()
            && profile.email.is_none()
            && profile.username.is_none()
            && profile.traits.is_none()
        {
            None
        } else {
            Some(profile)
        }
    }
}

/// Metadata describing the SDK that produced a record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl Default for SdkInfo {
    fn default() -> Self {
        Self {
            name: SDK_NAME.to_string(),
            version: SDK_VERSION.to_string(),
            runtime: "rust".to_string(),
            os: Some(std::env::consts::OS.to_string()),
            arch: Some(std::env::consts::ARCH.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub contexts: Fields,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackEvent {
    pub name: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Fields,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub contexts: Fields,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,
}

/// Either kind of record, as seen by the transform hook.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Log(LogRecord),
    Track(TrackEvent),
}

impl Record {
    pub fn kind(&self) -> QueueKind {
        match self {
            Record::Log(_) => QueueKind::Logs,
            Record::Track(_) => QueueKind::Track,
        }
    }
}

/// The two independent queues a record can land in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Logs,
    Track,
}

impl QueueKind {
    /// Path suffix of the ingestion endpoint for this queue.
    pub fn path(&self) -> &'static str {
        match self {
            QueueKind::Logs => "/logs/",
            QueueKind::Track => "/track/",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Logs => write!(f, "logs"),
            QueueKind::Track => write!(f, "track"),
        }
    }
}

/// Contiguous slice taken from one queue for a single transmission attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Batch {
    Logs(Vec<LogRecord>),
    Track(Vec<TrackEvent>),
}

impl Batch {
    pub fn kind(&self) -> QueueKind {
        match self {
            Batch::Logs(_) => QueueKind::Logs,
            Batch::Track(_) => QueueKind::Track,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Logs(logs) => logs.len(),
            Batch::Track(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the batch as the JSON array the ingestion API expects.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Batch::Logs(logs) => serde_json::to_vec(logs),
            Batch::Track(events) => serde_json::to_vec(events),
        }
    }
}

/// Caller supplied timestamp: either preformatted or a point in time.
#[derive(Clone, Debug, PartialEq)]
pub enum Timestamp {
    Formatted(String),
    At(DateTime<Utc>),
}

impl Timestamp {
    pub fn to_rfc3339(&self) -> Option<String> {
        match self {
            Timestamp::Formatted(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Timestamp::At(dt) => Some(format_timestamp(*dt)),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::At(dt)
    }
}

impl From<String> for Timestamp {
    fn from(s: String) -> Self {
        Timestamp::Formatted(s)
    }
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Formatted(s.to_string())
    }
}

/// RFC3339 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Generate a new trace ID
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Generate a new span ID
pub fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Generate a new device ID
pub fn generate_device_id() -> String {
    format!("d_{:032x}", rand::random::<u128>())
}

/// Current time in milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(Level::from("INFO"), Level::Info);
        assert_eq!(Level::from("error"), Level::Error);
        assert_eq!(Level::from("warning"), Level::Warn);
        assert_eq!(Level::from("critical"), Level::Fatal);
        assert_eq!(Level::from("unknown"), Level::Info);
    }

    #[test]
    fn test_level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Level::Warn).unwrap(), "\"warn\"");
        assert_eq!(Level::Event.to_string(), "event");
    }

    #[test]
    fn test_user_profile_normalization() {
        let user = UserProfile {
            id: Some("  u1 ".to_string()),
            email: Some("   ".to_string()),
            username: None,
            traits: Some(Fields::new()),
        };
        let user = user.normalized().unwrap();
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert!(user.email.is_none());
        assert!(user.traits.is_none());

        let blank = UserProfile {
            id: Some(" ".to_string()),
            ..Default::default()
        };
        assert!(blank.normalized().is_none());
    }

    #[test]
    fn test_log_record_omits_empty_fields() {
        let record = LogRecord {
            level: Level::Info,
            message: "hello".to_string(),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            device_id: Some("d_1".to_string()),
            trace_id: None,
            span_id: None,
            fields: Fields::new(),
            tags: Tags::new(),
            user: None,
            contexts: Fields::new(),
            extra: Fields::new(),
            sdk: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj["level"], "info");
        assert_eq!(obj["device_id"], "d_1");
        assert!(!obj.contains_key("fields"));
        assert!(!obj.contains_key("trace_id"));
        assert!(!obj.contains_key("user"));
    }

    #[test]
    fn test_timestamp_formatting() {
        let dt = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(dt), "2025-01-02T03:04:05.000Z");
        assert_eq!(
            Timestamp::from(dt).to_rfc3339().as_deref(),
            Some("2025-01-02T03:04:05.000Z")
        );
        assert_eq!(
            Timestamp::from("2024-06-01T00:00:00Z").to_rfc3339().as_deref(),
            Some("2024-06-01T00:00:00Z")
        );
        assert!(Timestamp::from("  ").to_rfc3339().is_none());
    }

    #[test]
    fn test_generated_ids() {
        assert_eq!(generate_trace_id().len(), 32);
        assert_eq!(generate_span_id().len(), 16);
        let device = generate_device_id();
        assert!(device.starts_with("d_"));
        assert_eq!(device.len(), 34);
    }

    #[test]
    fn test_queue_kind_paths() {
        assert_eq!(QueueKind::Logs.path(), "/logs/");
        assert_eq!(QueueKind::Track.path(), "/track/");
        assert_eq!(Batch::Track(vec![]).kind(), QueueKind::Track);
    }
}
