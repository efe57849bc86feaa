use chrono::NaiveDateTime;
use lazy_static::lazy_static;
use logweave_core::{Level, LineParser, ParsedLine};
use regex::Regex;

lazy_static! {
    static ref LEVEL_RE: Regex =
        Regex::new(r"(?i)\b(TRACE|DEBUG|INFO|WARN(?:ING)?|ERROR|FATAL)\b").unwrap();

    // 2024-01-31 12:00:00, 2024-01-31T12:00:00.123, [2024-01-31 12:00:00,123]
    static ref TIMESTAMP_RE: Regex = Regex::new(
        r"^\s*\[?(?P<date>\d{4}-\d{2}-\d{2})[ T](?P<time>\d{2}:\d{2}:\d{2})(?:[.,](?P<frac>\d{1,9}))?"
    ).unwrap();
}

/// Detects the first level keyword and a leading timestamp of a line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextLineParser;

impl TextLineParser {
    pub fn new() -> Self {
        Self
    }
}

fn parse_level(raw: &str) -> Level {
    let Some(m) = LEVEL_RE.find(raw) else {
        return Level::None;
    };
    match m.as_str().to_ascii_uppercase().as_str() {
        "TRACE" => Level::Trace,
        "DEBUG" => Level::Debug,
        "INFO" => Level::Info,
        "WARN" | "WARNING" => Level::Warning,
        "ERROR" => Level::Error,
        "FATAL" => Level::Fatal,
        _ => Level::None,
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let caps = TIMESTAMP_RE.captures(raw)?;
    let text = match caps.name("frac") {
        Some(frac) => format!("{} {}.{}", &caps["date"], &caps["time"], frac.as_str()),
        None => format!("{} {}", &caps["date"], &caps["time"]),
    };
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f").ok()
}

impl LineParser for TextLineParser {
    fn parse(&self, raw: &str) -> ParsedLine {
        ParsedLine {
            level: parse_level(raw),
            timestamp: parse_timestamp(raw),
        }
    }
}
