//! INI-style parser shared by the settings file and machine files
//!
//! Section names keep their brackets (`[Machine]`), keys are upper-cased and
//! repeated keys accumulate in file order.

use std::collections::HashMap;

/// A section maps each key to all of its values, in the order they appeared
pub type ParsedSection = HashMap<String, Vec<String>>;

/// A parsed file is a map of section names to their contents
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Setting '{0}' has too many values: {1:?}")]
    TooManyValues(String, Vec<String>),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Missing section {0}")]
    MissingSection(String),
}

/// Parse an INI file from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections = HashMap::new();
    let mut lines = content.lines().map(str::trim).peekable();

    // Skip lines before the first section
    while lines.peek().map_or(false, |l| !l.starts_with('[')) {
        lines.next();
    }

    let Some(first_section) = lines.next() else {
        return Ok(sections);
    };

    let mut current_name = first_section.to_string();
    let mut current_lines = Vec::new();

    for line in lines {
        if line.starts_with('[') {
            if sections.contains_key(&current_name) {
                return Err(ParseError::DuplicateSection(current_name));
            }
            sections.insert(current_name.clone(), parse_section(&current_lines));
            current_name = line.to_string();
            current_lines.clear();
        } else {
            current_lines.push(line);
        }
    }

    if sections.contains_key(&current_name) {
        return Err(ParseError::DuplicateSection(current_name));
    }
    sections.insert(current_name, parse_section(&current_lines));

    Ok(sections)
}

fn parse_section(lines: &[&str]) -> ParsedSection {
    let mut entries: ParsedSection = HashMap::new();

    for line in lines {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };

        let value = strip_trailing_comment(value.trim());
        if value.is_empty() {
            continue;
        }

        entries
            .entry(name.trim().to_uppercase())
            .or_default()
            .push(value.to_string());
    }

    entries
}

/// Drop a trailing ` ; comment` (only when preceded by whitespace)
fn strip_trailing_comment(value: &str) -> &str {
    match value.find(" ;").or_else(|| value.find("\t;")) {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    }
}

/// Take the single value of a key, rejecting repeats
pub fn single(section: &mut ParsedSection, key: &str) -> Result<Option<String>, ParseError> {
    match section.remove(key) {
        None => Ok(None),
        Some(mut values) if values.len() == 1 => Ok(values.pop()),
        Some(values) => Err(ParseError::TooManyValues(key.to_string(), values)),
    }
}

/// Parse a systemd-style boolean (yes/no, true/false, on/off, 1/0)
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ParseError> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(ParseError::InvalidValue(key.to_string(), value.to_string())),
    }
}
