//! Exchange file grammar.
//!
//! ```text
//! Updates                 <- topic (first remaining header line)
//! -- a comment            <- dropped
//! Date: 2024-11-29        <- metadata
//! ---                     <- separator (three or more leading dashes)
//! Server down             <- message body
//! ```

use std::collections::HashMap;

use crate::models::Notification;

/// The two ways an exchange file can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("file has no topic")]
    NoTopic,
    #[error("file has an empty message")]
    EmptyMessage,
}

/// Parse the raw contents of an exchange file.
pub fn parse_content(content: &str) -> Result<Notification, ParseError> {
    let lines: Vec<&str> = content.lines().collect();
    parse_lines(&lines)
}

/// Parse a file already split into lines.
///
/// The first separator splits header from body. Every separator line is
/// dropped, including ones inside the body.
pub fn parse_lines(lines: &[&str]) -> Result<Notification, ParseError> {
    let split = lines.iter().position(|line| is_separator(line));
    let (head, body) = match split {
        Some(idx) => (&lines[..idx], &lines[idx + 1..]),
        None => (lines, &lines[lines.len()..]),
    };

    let mut head = head
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !is_comment(line));

    let topic = head.next().ok_or(ParseError::NoTopic)?;
    let metadata = parse_metadata(head);

    let message = body
        .iter()
        .copied()
        .filter(|line| !is_separator(line))
        .collect::<Vec<_>>()
        .join("\n");
    if message.trim().is_empty() {
        return Err(ParseError::EmptyMessage);
    }

    Ok(Notification {
        topic: topic.to_string(),
        metadata,
        message,
    })
}

/// Collect `key: value` pairs. Lines without a colon or with an empty side
/// are skipped; the last occurrence of a key wins.
pub fn parse_metadata<'a>(lines: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        metadata.insert(key.to_string(), value.to_string());
    }
    metadata
}

fn is_separator(line: &str) -> bool {
    line.starts_with("---")
}

fn is_comment(line: &str) -> bool {
    line.starts_with("--") && !is_separator(line)
}
