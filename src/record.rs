use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Generic string-keyed payload carried in [`LogRecord::object`] and
/// [`LogRecord::extra`].
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Severity of a [`LogRecord`], ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum Level {
    Finest,
    Finer,
    Fine,
    Config,
    #[default]
    Info,
    Warning,
    Severe,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Finest => "FINEST",
            Level::Finer => "FINER",
            Level::Fine => "FINE",
            Level::Config => "CONFIG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Severe => "SEVERE",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown log level `{0}`")]
pub struct UnknownLevel(pub String);

impl FromStr for Level {
    type Err = UnknownLevel;

    /// Case-insensitive; an empty string is the default level.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.to_ascii_uppercase().as_str() {
            "" | "INFO" => Level::Info,
            "FINEST" => Level::Finest,
            "FINER" => Level::Finer,
            "FINE" => Level::Fine,
            "CONFIG" => Level::Config,
            "WARNING" => Level::Warning,
            "SEVERE" => Level::Severe,
            _ => return Err(UnknownLevel(s.to_string())),
        };
        Ok(level)
    }
}

impl TryFrom<String> for Level {
    type Error = UnknownLevel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single structured log record as it is persisted and queried.
///
/// Records are immutable once published; the broker shares them between
/// subscribers behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, deserialize_with = "lenient_level")]
    pub level: Level,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_fields")]
    pub object: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_fields")]
    pub extra: Option<Fields>,
    #[serde(default)]
    pub logger_name: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl LogRecord {
    /// Minimal record with the given message and timestamp; everything
    /// else takes its default.
    pub fn new(message: impl Into<String>, time: DateTime<Utc>) -> Self {
        LogRecord {
            level: Level::default(),
            message: message.into(),
            object: None,
            extra: None,
            logger_name: String::new(),
            time,
            sequence: 0,
            error: None,
            stacktrace: None,
            session_id: String::new(),
            client_id: String::new(),
            source: String::new(),
            client_ip: None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Parse a structured field that was persisted as text.
///
/// Empty text and `null` mean "absent"; anything that is not a JSON
/// object degrades to an empty map.
pub fn parse_fields(text: &str) -> Option<Fields> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return None;
    }
    Some(serde_json::from_str::<Fields>(trimmed).unwrap_or_default())
}

/// Serialize a structured field into its text column form.
pub fn fields_to_text(fields: &Option<Fields>) -> String {
    match fields {
        Some(map) => serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string()),
        None => String::new(),
    }
}

/// Stored records never fail on their level: anything unrecognised reads
/// back as the default level, like a columnar row does.
fn lenient_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|text| text.parse().ok())
        .unwrap_or_default())
}

fn lenient_fields<'de, D>(deserializer: D) -> Result<Option<Fields>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Object(map)) => Some(map.into_iter().collect()),
        Some(serde_json::Value::String(text)) => parse_fields(&text),
        Some(_) => Some(Fields::new()),
    })
}
