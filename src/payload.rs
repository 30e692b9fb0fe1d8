//! Builds immutable log and track records from caller input

use crate::config::{BeforeSend, Config};
use crate::telemetry::{
    format_timestamp, Fields, Level, LogRecord, Record, SdkInfo, Tags, Timestamp, TrackEvent,
    UserProfile,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

thread_local! {
    static IN_BEFORE_SEND: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is running the `before_send` hook. Panics
/// raised there are handled by the builder and must not be captured.
pub(crate) fn in_before_send() -> bool {
    IN_BEFORE_SEND.with(Cell::get)
}

/// Per-call options for log records.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub timestamp: Option<Timestamp>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub tags: Tags,
    pub device_id: Option<String>,
    pub user: Option<UserProfile>,
    pub contexts: Fields,
    pub extra: Fields,
}

impl LogOptions {
    pub fn with_timestamp(mut self, timestamp: impl Into<Timestamp>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_trace_context(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Per-call options for track events.
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    pub timestamp: Option<Timestamp>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub tags: Tags,
    pub device_id: Option<String>,
    pub user: Option<UserProfile>,
    pub contexts: Fields,
    pub extra: Fields,
    /// Send right away instead of waiting for a batch
    pub immediate: bool,
}

impl TrackOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<Timestamp>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_trace_context(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Client state copied into every record at build time.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub device_id: Option<String>,
    pub user: Option<UserProfile>,
}

/// Merges global defaults into caller input and applies the transform hook.
#[derive(Debug, Clone, Default)]
pub struct PayloadBuilder {
    global_fields: Fields,
    global_properties: Fields,
    global_tags: Tags,
    global_contexts: Fields,
    before_send: Option<BeforeSend>,
    sdk: SdkInfo,
}

impl PayloadBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            global_fields: config.global_fields.clone(),
            global_properties: config.global_properties.clone(),
            global_tags: config.global_tags.clone(),
            global_contexts: config.global_contexts.clone(),
            before_send: config.before_send.clone(),
            sdk: SdkInfo::default(),
        }
    }

    /// Build a log record, or `None` when the message is blank or the hook
    /// discards it.
    pub fn build_log(
        &self,
        level: Level,
        message: &str,
        fields: Option<Fields>,
        options: LogOptions,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Option<LogRecord> {
        let record = self.assemble_log(level, message, fields, options, identity, now)?;
        match self.apply_before_send(Record::Log(record))? {
            Record::Log(record) => Some(record),
            Record::Track(_) => None,
        }
    }

    /// Build a log record for a captured failure. Skips `before_send`: this
    /// can run inside the process panic hook, where a second panic aborts.
    pub(crate) fn build_captured_log(
        &self,
        level: Level,
        message: &str,
        fields: Fields,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Option<LogRecord> {
        self.assemble_log(level, message, Some(fields), LogOptions::default(), identity, now)
    }

    fn assemble_log(
        &self,
        level: Level,
        message: &str,
        fields: Option<Fields>,
        options: LogOptions,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Option<LogRecord> {
        let message = message.trim();
        if message.is_empty() {
            debug!("Dropping log with empty message");
            return None;
        }

        let record = LogRecord {
            level,
            message: message.to_string(),
            timestamp: resolve_timestamp(options.timestamp.as_ref(), now),
            device_id: clean(options.device_id).or_else(|| identity.device_id.clone()),
            trace_id: clean(options.trace_id),
            span_id: clean(options.span_id),
            fields: merge_fields(&self.global_fields, fields.unwrap_or_default()),
            tags: merge_tags(&self.global_tags, options.tags),
            user: options
                .user
                .and_then(UserProfile::normalized)
                .or_else(|| identity.user.clone()),
            contexts: merge_fields(&self.global_contexts, options.contexts),
            extra: options.extra,
            sdk: Some(self.sdk.clone()),
        };

        Some(record)
    }

    /// Build a track event, or `None` when the name is blank or the hook
    /// discards it.
    pub fn build_track(
        &self,
        name: &str,
        properties: Option<Fields>,
        options: TrackOptions,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Option<TrackEvent> {
        let name = name.trim();
        if name.is_empty() {
            debug!("Dropping track event with empty name");
            return None;
        }

        let event = TrackEvent {
            name: name.to_string(),
            timestamp: resolve_timestamp(options.timestamp.as_ref(), now),
            device_id: clean(options.device_id).or_else(|| identity.device_id.clone()),
            trace_id: clean(options.trace_id),
            span_id: clean(options.span_id),
            properties: merge_fields(&self.global_properties, properties.unwrap_or_default()),
            tags: merge_tags(&self.global_tags, options.tags),
            user: options
                .user
                .and_then(UserProfile::normalized)
                .or_else(|| identity.user.clone()),
            contexts: merge_fields(&self.global_contexts, options.contexts),
            extra: options.extra,
            sdk: Some(self.sdk.clone()),
        };

        match self.apply_before_send(Record::Track(event))? {
            Record::Track(event) => Some(event),
            Record::Log(_) => None,
        }
    }

    /// Run the transform hook. Errors, panics and kind changes keep the
    /// original record; `Ok(None)` discards it.
    fn apply_before_send(&self, record: Record) -> Option<Record> {
        let Some(hook) = &self.before_send else {
            return Some(record);
        };

        let original = record.clone();
        let kind = original.kind();

        IN_BEFORE_SEND.with(|flag| flag.set(true));
        let result = catch_unwind(AssertUnwindSafe(|| hook.call(record)));
        IN_BEFORE_SEND.with(|flag| flag.set(false));

        match result {
            Ok(Ok(Some(out))) if out.kind() == kind => Some(out),
            Ok(Ok(Some(_))) => {
                warn!(%kind, "before_send changed the record kind, keeping original");
                Some(original)
            }
            Ok(Ok(None)) => {
                debug!(%kind, "before_send discarded record");
                None
            }
            Ok(Err(e)) => {
                warn!(%kind, error = %e, "before_send failed, keeping original");
                Some(original)
            }
            Err(_) => {
                warn!(%kind, "before_send panicked, keeping original");
                Some(original)
            }
        }
    }
}

/// Explicit timestamp wins over the capture time.
fn resolve_timestamp(explicit: Option<&Timestamp>, now: DateTime<Utc>) -> String {
    explicit
        .and_then(Timestamp::to_rfc3339)
        .unwrap_or_else(|| format_timestamp(now))
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Global values first, call values override on key collision.
pub fn merge_fields(global: &Fields, call: Fields) -> Fields {
    let mut out = global.clone();
    out.extend(call);
    out
}

pub fn merge_tags(global: &Tags, call: Tags) -> Tags {
    let mut out = global.clone();
    out.extend(call);
    out
}

/// Convert any serializable value to detached JSON, `None` when it cannot be
/// represented.
pub fn json_safe<T: Serialize + ?Sized>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

/// Convert a serializable struct or map into a field bag. Values that are not
/// JSON objects yield `None`.
pub fn to_fields<T: Serialize + ?Sized>(value: &T) -> Option<Fields> {
    match json_safe(value)? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Insert a value into a field bag; values that fail to serialize are
/// skipped. Returns whether the key was inserted.
pub fn insert_field<T: Serialize + ?Sized>(fields: &mut Fields, key: impl Into<String>, value: &T) -> bool {
    match json_safe(value) {
        Some(v) => {
            fields.insert(key.into(), v);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LogtapError;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn identity() -> Identity {
        Identity {
            device_id: Some("d_test".to_string()),
            user: None,
        }
    }

    fn fields(value: Value) -> Fields {
        to_fields(&value).unwrap()
    }

    #[test]
    fn test_blank_message_is_dropped() {
        let builder = PayloadBuilder::default();
        assert!(builder
            .build_log(Level::Info, "   ", None, LogOptions::default(), &identity(), now())
            .is_none());
        assert!(builder
            .build_track("", None, TrackOptions::default(), &identity(), now())
            .is_none());
    }

    #[test]
    fn test_globals_merge_with_call_values_winning() {
        let mut config = Config::new("http://localhost", "1");
        config.global_fields = fields(json!({"service": "api", "region": "eu"}));
        config.global_tags = HashMap::from([("env".to_string(), "prod".to_string())]);
        config.global_contexts = fields(json!({"app": {"version": "1.0"}}));
        let builder = PayloadBuilder::new(&config);

        let record = builder
            .build_log(
                Level::Warn,
                "  disk almost full ",
                Some(fields(json!({"region": "us", "pct": 91}))),
                LogOptions::default().with_tag("req", "1"),
                &identity(),
                now(),
            )
            .unwrap();

        assert_eq!(record.message, "disk almost full");
        assert_eq!(record.fields["service"], "api");
        assert_eq!(record.fields["region"], "us");
        assert_eq!(record.fields["pct"], 91);
        assert_eq!(record.tags["env"], "prod");
        assert_eq!(record.tags["req"], "1");
        assert_eq!(record.contexts["app"]["version"], "1.0");
        assert_eq!(record.device_id.as_deref(), Some("d_test"));
        assert_eq!(record.timestamp, "2025-01-01T00:00:00.000Z");
        assert_eq!(record.sdk.as_ref().unwrap().runtime, "rust");
    }

    #[test]
    fn test_track_uses_global_properties_not_fields() {
        let mut config = Config::new("http://localhost", "1");
        config.global_fields = fields(json!({"only_logs": true}));
        config.global_properties = fields(json!({"plan": "free"}));
        let builder = PayloadBuilder::new(&config);

        let event = builder
            .build_track(
                "signup",
                Some(fields(json!({"plan": "pro"}))),
                TrackOptions::default(),
                &identity(),
                now(),
            )
            .unwrap();

        assert_eq!(event.properties["plan"], "pro");
        assert!(!event.properties.contains_key("only_logs"));
    }

    #[test]
    fn test_explicit_timestamp_and_overrides() {
        let builder = PayloadBuilder::default();
        let client_identity = Identity {
            device_id: Some("d_client".to_string()),
            user: UserProfile::with_id("client-user").normalized(),
        };

        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let record = builder
            .build_log(
                Level::Error,
                "boom",
                None,
                LogOptions::default()
                    .with_timestamp(at)
                    .with_device_id("d_call")
                    .with_user(UserProfile::with_id("call-user"))
                    .with_trace_context(" t1 ", "s1"),
                &client_identity,
                now(),
            )
            .unwrap();

        assert_eq!(record.timestamp, "2024-12-31T23:59:59.000Z");
        assert_eq!(record.device_id.as_deref(), Some("d_call"));
        assert_eq!(record.user.unwrap().id.as_deref(), Some("call-user"));
        assert_eq!(record.trace_id.as_deref(), Some("t1"));

        let record = builder
            .build_log(
                Level::Info,
                "preformatted",
                None,
                LogOptions::default().with_timestamp("2020-05-05T05:05:05Z"),
                &client_identity,
                now(),
            )
            .unwrap();
        assert_eq!(record.timestamp, "2020-05-05T05:05:05Z");
        assert_eq!(record.user.unwrap().id.as_deref(), Some("client-user"));
    }

    #[test]
    fn test_caller_data_is_copied() {
        let builder = PayloadBuilder::default();
        let mut caller_fields = fields(json!({"nested": {"count": 1}}));
        let record = builder
            .build_log(
                Level::Info,
                "copy",
                Some(caller_fields.clone()),
                LogOptions::default(),
                &identity(),
                now(),
            )
            .unwrap();

        caller_fields.insert("nested".to_string(), json!({"count": 2}));
        assert_eq!(record.fields["nested"]["count"], 1);
    }

    #[test]
    fn test_before_send_can_transform_and_discard() {
        let config = Config::new("http://localhost", "1").with_before_send(|record| match record {
            Record::Log(log) if log.message == "drop me" => Ok(None),
            Record::Log(mut log) => {
                log.tags.insert("scrubbed".to_string(), "yes".to_string());
                Ok(Some(Record::Log(log)))
            }
            other => Ok(Some(other)),
        });
        let builder = PayloadBuilder::new(&config);

        let kept = builder
            .build_log(Level::Info, "keep", None, LogOptions::default(), &identity(), now())
            .unwrap();
        assert_eq!(kept.tags["scrubbed"], "yes");

        assert!(builder
            .build_log(Level::Info, "drop me", None, LogOptions::default(), &identity(), now())
            .is_none());
    }

    #[test]
    fn test_before_send_failure_keeps_original() {
        let failing = Config::new("http://localhost", "1")
            .with_before_send(|_| Err(LogtapError::hook("nope")));
        let builder = PayloadBuilder::new(&failing);
        let record = builder
            .build_log(Level::Info, "still here", None, LogOptions::default(), &identity(), now())
            .unwrap();
        assert_eq!(record.message, "still here");

        let panicking = Config::new("http://localhost", "1")
            .with_before_send(|_| panic!("hook exploded"));
        let builder = PayloadBuilder::new(&panicking);
        let event = builder
            .build_track("survives", None, TrackOptions::default(), &identity(), now())
            .unwrap();
        assert_eq!(event.name, "survives");
        assert!(!in_before_send());
    }

    #[test]
    fn test_captured_logs_skip_before_send() {
        let config = Config::new("http://localhost", "1").with_before_send(|_| {
            assert!(in_before_send());
            panic!("hook exploded")
        });
        let builder = PayloadBuilder::new(&config);

        let mut fields = Fields::new();
        fields.insert("kind".to_string(), json!("panic"));
        let record = builder
            .build_captured_log(Level::Fatal, "panic", fields, &identity(), now())
            .unwrap();
        assert_eq!(record.level, Level::Fatal);
        assert_eq!(record.fields["kind"], "panic");
        assert!(!in_before_send());
    }

    #[test]
    fn test_before_send_kind_change_is_ignored() {
        let config = Config::new("http://localhost", "1").with_before_send(|record| {
            let timestamp = match &record {
                Record::Log(l) => l.timestamp.clone(),
                Record::Track(t) => t.timestamp.clone(),
            };
            Ok(Some(Record::Track(TrackEvent {
                name: "swapped".to_string(),
                timestamp,
                device_id: None,
                trace_id: None,
                span_id: None,
                properties: Fields::new(),
                tags: Tags::new(),
                user: None,
                contexts: Fields::new(),
                extra: Fields::new(),
                sdk: None,
            })))
        });
        let builder = PayloadBuilder::new(&config);
        let record = builder
            .build_log(Level::Info, "original", None, LogOptions::default(), &identity(), now())
            .unwrap();
        assert_eq!(record.message, "original");
    }

    #[test]
    fn test_field_helpers() {
        #[derive(Serialize)]
        struct Order {
            id: u32,
            total: f64,
        }

        let mut bag = Fields::new();
        assert!(insert_field(&mut bag, "order", &Order { id: 7, total: 9.5 }));
        assert_eq!(bag["order"]["id"], 7);

        assert!(to_fields(&json!([1, 2, 3])).is_none());
        assert_eq!(to_fields(&Order { id: 1, total: 0.0 }).unwrap()["id"], 1);
    }
}
