//! Conversation export to JSON, plain text and Markdown.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chat::clock::Clock;
use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::types::{Message, iso_millis};

/// Version tag written into JSON exports.
pub const EXPORT_VERSION: &str = "1.0";

/// Supported export formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON envelope.
    Json,
    /// One `[time] Speaker: text` paragraph per message.
    Text,
    /// Markdown document.
    Markdown,
}

impl ExportFormat {
    /// File extension without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
            Self::Markdown => "md",
        }
    }

    /// MIME type of the exported data.
    #[must_use]
    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
            Self::Markdown => "text/markdown",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "txt" => Ok(Self::Text),
            "md" | "markdown" => Ok(Self::Markdown),
            _ => Err(ChatError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Export payload ready to be offered as a download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
    /// File contents.
    pub data: String,
    /// Suggested file name.
    pub filename: String,
    /// MIME type of `data`.
    pub mime_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonEnvelope<'a> {
    messages: &'a [Message],
    exported_at: String,
    version: &'static str,
}

/// Render `messages` in `format`.
///
/// `clock` stamps the export; each human-readable time uses the offset in
/// effect at that instant.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn export_messages(
    messages: &[Message],
    format: ExportFormat,
    clock: &dyn Clock,
) -> ChatResult<ExportedFile> {
    let now = clock.now();
    let data = match format {
        ExportFormat::Json => serde_json::to_string_pretty(&JsonEnvelope {
            messages,
            exported_at: iso_millis::format(&now),
            version: EXPORT_VERSION,
        })?,
        ExportFormat::Text => messages
            .iter()
            .map(|m| {
                format!(
                    "[{}] {}: {}",
                    locale_time(&m.timestamp, clock),
                    m.role.label(),
                    m.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        ExportFormat::Markdown => {
            let body = messages
                .iter()
                .map(|m| {
                    format!(
                        "### **{}** _({})_\n\n{}\n",
                        m.role.label(),
                        locale_datetime(&m.timestamp, clock),
                        m.content
                    )
                })
                .collect::<Vec<_>>()
                .join("\n---\n\n");
            format!(
                "# Chat Export\n\nExported on {}\n\n---\n\n{body}",
                locale_datetime(&now, clock)
            )
        }
    };

    Ok(ExportedFile {
        data,
        filename: format!("chat-export-{}.{}", now.format("%Y-%m-%d"), format.extension()),
        mime_type: format.mime_type().to_string(),
    })
}

/// `3:04:05 PM` style time.
fn locale_time(at: &DateTime<Utc>, clock: &dyn Clock) -> String {
    at.with_timezone(&clock.offset_at(*at))
        .format("%-I:%M:%S %p")
        .to_string()
}

/// `11/14/2023, 3:04:05 PM` style date and time.
fn locale_datetime(at: &DateTime<Utc>, clock: &dyn Clock) -> String {
    at.with_timezone(&clock.offset_at(*at))
        .format("%-m/%-d/%Y, %-I:%M:%S %p")
        .to_string()
}
