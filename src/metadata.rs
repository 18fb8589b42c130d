//! Skill metadata header parser.
//!
//! A skill's code bytes open with a comment preamble declaring what the
//! skill is and what it needs:
//!
//! ```text
//! # @skill weather_report
//! # @description Fetch tomorrow's forecast
//! # @secrets WEATHER_API_KEY
//! # @network api.weather.example
//! # @timeout 20
//! ```
//!
//! Lines are recognized as `@<key> <value>` inside the leading comment
//! block (`#` or `//` prefixes; a shebang line is skipped). Parsing stops
//! at the first non-comment, non-blank line. `@skill` is required.

use std::fmt;

/// Default wall-clock timeout when the header declares none.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct SkillMetadata {
    pub skill: String,
    pub description: Option<String>,
    /// Required secret names, one `@secrets` line each.
    pub secrets: Vec<String>,
    /// Allow-listed hosts, one `@network` line each. Empty means no network.
    pub network: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, PartialEq)]
pub enum MetadataError {
    /// The code bytes are not valid UTF-8.
    NotUtf8,
    /// The leading comment block has no `@skill` line.
    MissingSkill,
    /// `@timeout` value is not a positive integer.
    BadTimeout(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotUtf8 => f.write_str("code is not valid UTF-8"),
            Self::MissingSkill => f.write_str("metadata header missing required @skill field"),
            Self::BadTimeout(v) => write!(f, "invalid @timeout value: {v}"),
        }
    }
}

impl std::error::Error for MetadataError {}

/// Strips the comment marker from a preamble line.
/// Returns `None` when the line is not a comment (ends the preamble).
fn comment_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest)
    } else {
        trimmed.strip_prefix('#')
    }
}

/// Parses the metadata header from raw code bytes.
pub fn parse(code: &[u8]) -> Result<SkillMetadata, MetadataError> {
    let text = std::str::from_utf8(code).map_err(|_| MetadataError::NotUtf8)?;

    let mut skill = None;
    let mut description = None;
    let mut secrets = Vec::new();
    let mut network = Vec::new();
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;

    for (i, line) in text.lines().enumerate() {
        // Shebang counts as part of the preamble but carries no fields
        if i == 0 && line.starts_with("#!") {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some(body) = comment_body(line) else {
            break; // first code line ends the preamble
        };
        let body = body.trim();
        let Some(field) = body.strip_prefix('@') else {
            continue; // plain comment line inside the preamble
        };
        let (key, value) = match field.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => (field, ""),
        };
        match key {
            "skill" if !value.is_empty() => skill = Some(value.to_string()),
            "description" if !value.is_empty() => description = Some(value.to_string()),
            "secrets" if !value.is_empty() => secrets.push(value.to_string()),
            "network" if !value.is_empty() => network.push(value.to_string()),
            "timeout" => {
                timeout_secs = value
                    .parse::<u64>()
                    .ok()
                    .filter(|t| *t > 0)
                    .ok_or_else(|| MetadataError::BadTimeout(value.to_string()))?;
            }
            _ => {} // unknown keys tolerated
        }
    }

    Ok(SkillMetadata {
        skill: skill.ok_or(MetadataError::MissingSkill)?,
        description,
        secrets,
        network,
        timeout_secs,
    })
}
