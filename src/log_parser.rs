//! Line parsing for the `pipe` command: turns lines read from stdin into log
//! records or track events

use crate::client::Client;
use crate::payload::{LogOptions, TrackOptions};
use crate::telemetry::{Fields, Level, Timestamp};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Log {
        level: Level,
        message: String,
        fields: Fields,
        timestamp: Option<DateTime<Utc>>,
        trace_id: Option<String>,
        span_id: Option<String>,
    },
    Track {
        name: String,
        properties: Fields,
        timestamp: Option<DateTime<Utc>>,
    },
}

impl ParsedLine {
    /// Hand the line to the client. Returns whether a record was queued.
    pub fn submit(self, client: &Client) -> bool {
        match self {
            ParsedLine::Log {
                level,
                message,
                fields,
                timestamp,
                trace_id,
                span_id,
            } => {
                let options = LogOptions {
                    timestamp: timestamp.map(Timestamp::At),
                    trace_id,
                    span_id,
                    ..Default::default()
                };
                let fields = (!fields.is_empty()).then_some(fields);
                client.log_with(level, &message, fields, options)
            }
            ParsedLine::Track {
                name,
                properties,
                timestamp,
            } => {
                let options = TrackOptions {
                    timestamp: timestamp.map(Timestamp::At),
                    ..Default::default()
                };
                let properties = (!properties.is_empty()).then_some(properties);
                client.track_with(&name, properties, options)
            }
        }
    }
}

/// Turns a raw line into a record, `None` when the line holds nothing usable.
pub trait LineParser: Send + Sync {
    fn parse_line(&self, line: &str) -> Option<ParsedLine>;
}

/// JSON object per line. An `event` key makes a track event, anything else
/// a log record; keys that are not recognised become fields.
pub struct JsonLineParser {
    default_level: Level,
}

impl JsonLineParser {
    pub fn new(default_level: Level) -> Self {
        Self { default_level }
    }
}

const LEVEL_KEYS: [&str; 3] = ["level", "severity", "log_level"];
const MESSAGE_KEYS: [&str; 3] = ["message", "msg", "text"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "@timestamp", "time"];
const TRACE_KEYS: [&str; 2] = ["trace_id", "traceId"];
const SPAN_KEYS: [&str; 2] = ["span_id", "spanId"];

fn take_str(obj: &mut Fields, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        if let Some(value) = obj.remove(*key) {
            if found.is_none() {
                found = value.as_str().map(|s| s.to_string());
            }
        }
    }
    found
}

fn take_timestamp(obj: &mut Fields) -> Option<DateTime<Utc>> {
    let mut found = None;
    for key in TIMESTAMP_KEYS {
        if let Some(value) = obj.remove(key) {
            if found.is_none() {
                found = match &value {
                    Value::String(s) => parse_timestamp(s),
                    Value::Number(n) => n.as_i64().and_then(from_epoch),
                    _ => None,
                };
            }
        }
    }
    found
}

impl LineParser for JsonLineParser {
    fn parse_line(&self, line: &str) -> Option<ParsedLine> {
        let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(line.trim()) else {
            return None;
        };

        let timestamp = take_timestamp(&mut obj);

        if let Some(name) = take_str(&mut obj, &["event"]) {
            let properties = match obj.remove("properties") {
                Some(Value::Object(props)) => props,
                _ => obj,
            };
            return Some(ParsedLine::Track {
                name,
                properties,
                timestamp,
            });
        }

        let message = take_str(&mut obj, &MESSAGE_KEYS)?;
        if message.trim().is_empty() {
            return None;
        }

        let level = take_str(&mut obj, &LEVEL_KEYS)
            .map(|l| Level::from(l.as_str()))
            .unwrap_or(self.default_level);
        let trace_id = take_str(&mut obj, &TRACE_KEYS);
        let span_id = take_str(&mut obj, &SPAN_KEYS);

        let fields = match obj.remove("fields") {
            Some(Value::Object(fields)) => fields,
            _ => obj,
        };

        Some(ParsedLine::Log {
            level,
            message,
            fields,
            timestamp,
            trace_id,
            span_id,
        })
    }
}

struct LinePattern {
    regex: Regex,
    level_group: usize,
    message_group: usize,
    timestamp_group: Option<usize>,
}

/// Plain text lines in the usual logger layouts; anything else is logged
/// verbatim at the default level.
pub struct PatternLineParser {
    default_level: Level,
}

impl PatternLineParser {
    pub fn new(default_level: Level) -> Self {
        Self { default_level }
    }

    fn patterns() -> &'static [LinePattern] {
        static PATTERNS: OnceLock<Vec<LinePattern>> = OnceLock::new();
        PATTERNS.get_or_init(|| {
            let pattern = |re: &str, level_group, message_group, timestamp_group| {
                Regex::new(re).ok().map(|regex| LinePattern {
                    regex,
                    level_group,
                    message_group,
                    timestamp_group,
                })
            };

            [
                // [2023-12-01T10:30:45Z] INFO: Message
                pattern(r"^\[([^\]]+)\]\s+(\w+):\s+(.+)$", 2, 3, Some(1)),
                // 2023-12-01T10:30:45Z INFO Message
                pattern(
                    r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?Z?)\s+(\w+)\s+(.+)$",
                    2,
                    3,
                    Some(1),
                ),
                // 2023/12/01 10:30:45 [error] Message
                pattern(
                    r"^(\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2})\s+\[(\w+)\]\s+(.+)$",
                    2,
                    3,
                    Some(1),
                ),
                // ERROR: Message
                pattern(r"^(\w+):\s+(.+)$", 1, 2, None),
            ]
            .into_iter()
            .flatten()
            .collect()
        })
    }
}

fn is_level_word(word: &str) -> bool {
    matches!(
        word.to_uppercase().as_str(),
        "TRACE" | "DEBUG" | "VERBOSE" | "INFO" | "INFORMATION" | "WARN" | "WARNING" | "ERROR"
            | "ERR" | "FATAL" | "CRITICAL" | "PANIC"
    )
}

impl LineParser for PatternLineParser {
    fn parse_line(&self, line: &str) -> Option<ParsedLine> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        for pattern in Self::patterns() {
            let Some(captures) = pattern.regex.captures(line) else {
                continue;
            };
            let level = captures.get(pattern.level_group).map(|m| m.as_str())?;
            if !is_level_word(level) {
                continue;
            }
            let message = captures
                .get(pattern.message_group)
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            if message.is_empty() {
                continue;
            }

            return Some(ParsedLine::Log {
                level: Level::from(level),
                message: message.to_string(),
                fields: Fields::new(),
                timestamp: pattern
                    .timestamp_group
                    .and_then(|group| captures.get(group))
                    .and_then(|m| parse_timestamp(m.as_str())),
                trace_id: None,
                span_id: None,
            });
        }

        Some(ParsedLine::Log {
            level: self.default_level,
            message: line.to_string(),
            fields: Fields::new(),
            timestamp: None,
            trace_id: None,
            span_id: None,
        })
    }
}

/// JSON first, text patterns as fallback.
pub struct CompositeLineParser {
    json: JsonLineParser,
    pattern: PatternLineParser,
}

impl CompositeLineParser {
    pub fn new(default_level: Level) -> Self {
        Self {
            json: JsonLineParser::new(default_level),
            pattern: PatternLineParser::new(default_level),
        }
    }
}

impl LineParser for CompositeLineParser {
    fn parse_line(&self, line: &str) -> Option<ParsedLine> {
        if line.trim_start().starts_with('{') {
            if let Some(parsed) = self.json.parse_line(line) {
                return Some(parsed);
            }
        }
        self.pattern.parse_line(line)
    }
}

/// Parser for a `--format` value: `json`, `plain` or `auto` (the default).
pub fn parser_for(format: &str, default_level: Level) -> Box<dyn LineParser> {
    match format.to_lowercase().as_str() {
        "json" => Box::new(JsonLineParser::new(default_level)),
        "plain" | "text" => Box::new(PatternLineParser::new(default_level)),
        _ => Box::new(CompositeLineParser::new(default_level)),
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // Values this large are milliseconds.
    if value.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Parse the timestamp layouts common in log lines
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 5] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(ts.trim_end_matches('Z'), format) {
            return Some(dt.and_utc());
        }
    }

    if let Ok(dt) = DateTime::parse_from_str(ts, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(dt.with_timezone(&Utc));
    }

    ts.parse::<i64>().ok().and_then(from_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_parts(parsed: ParsedLine) -> (Level, String, Fields) {
        match parsed {
            ParsedLine::Log {
                level,
                message,
                fields,
                ..
            } => (level, message, fields),
            other => panic!("expected log, got {:?}", other),
        }
    }

    #[test]
    fn test_json_log_parsing() {
        let parser = JsonLineParser::new(Level::Info);
        let line = r#"{"timestamp": 1701234567, "level": "ERROR", "msg": "Test error", "trace_id": "abc123", "span_id": "def456", "user_id": "u1"}"#;

        let parsed = parser.parse_line(line).unwrap();
        let ParsedLine::Log {
            level,
            message,
            fields,
            timestamp,
            trace_id,
            span_id,
        } = parsed
        else {
            panic!("expected log");
        };

        assert_eq!(level, Level::Error);
        assert_eq!(message, "Test error");
        assert_eq!(trace_id.as_deref(), Some("abc123"));
        assert_eq!(span_id.as_deref(), Some("def456"));
        assert_eq!(timestamp.unwrap().timestamp(), 1701234567);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["user_id"], "u1");
    }

    #[test]
    fn test_json_event_becomes_track() {
        let parser = JsonLineParser::new(Level::Info);
        let parsed = parser
            .parse_line(r#"{"event": "signup", "properties": {"plan": "pro"}, "ignored": 1}"#)
            .unwrap();

        match parsed {
            ParsedLine::Track {
                name, properties, ..
            } => {
                assert_eq!(name, "signup");
                assert_eq!(properties.len(), 1);
                assert_eq!(properties["plan"], "pro");
            }
            other => panic!("expected track, got {:?}", other),
        }
    }

    #[test]
    fn test_json_without_message_is_skipped() {
        let parser = JsonLineParser::new(Level::Info);
        assert!(parser.parse_line(r#"{"level": "info"}"#).is_none());
        assert!(parser.parse_line(r#"[1, 2]"#).is_none());
        assert!(parser.parse_line("not json").is_none());
    }

    #[test]
    fn test_pattern_parsing() {
        let parser = PatternLineParser::new(Level::Info);

        let (level, message, _) =
            log_parts(parser.parse_line("[2023-12-01T10:30:45Z] ERROR: Database connection failed").unwrap());
        assert_eq!(level, Level::Error);
        assert_eq!(message, "Database connection failed");

        let (level, message, _) = log_parts(parser.parse_line("2023/12/01 10:30:45 [warn] slow").unwrap());
        assert_eq!(level, Level::Warn);
        assert_eq!(message, "slow");

        let (level, message, _) = log_parts(parser.parse_line("FATAL: out of memory").unwrap());
        assert_eq!(level, Level::Fatal);
        assert_eq!(message, "out of memory");
    }

    #[test]
    fn test_plain_lines_keep_default_level() {
        let parser = PatternLineParser::new(Level::Debug);

        let (level, message, _) = log_parts(parser.parse_line("note: this is not a level").unwrap());
        assert_eq!(level, Level::Debug);
        assert_eq!(message, "note: this is not a level");

        assert!(parser.parse_line("   ").is_none());
    }

    #[test]
    fn test_composite_parser() {
        let parser = parser_for("auto", Level::Info);

        let (level, message, _) = log_parts(parser.parse_line(r#"{"level": "warn", "message": "json"}"#).unwrap());
        assert_eq!(level, Level::Warn);
        assert_eq!(message, "json");

        let (level, message, _) = log_parts(parser.parse_line("{broken json").unwrap());
        assert_eq!(level, Level::Info);
        assert_eq!(message, "{broken json");
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_timestamp("2025-01-01T10:30:45Z").is_some());
        assert!(parse_timestamp("2025-01-01T10:30:45.123+02:00").is_some());
        assert!(parse_timestamp("2025-01-01 10:30:45").is_some());
        assert!(parse_timestamp("2025/01/01 10:30:45").is_some());
        assert_eq!(
            parse_timestamp("1701234567000").unwrap(),
            parse_timestamp("1701234567").unwrap()
        );
        assert!(parse_timestamp("invalid").is_none());
    }
}
