//! Line-oriented key/value text tables
//!
//! Used for the `.debug` and `.deps` side files. Every line is `name=value`.
//! A grouped element is written as `name=~` and its children follow on lines
//! indented with a single tab:
//!
//! ```text
//! abc=~
//! 	foo.txt=64
//! 	bar.txt=doesnotexist
//! ```
//!
//! Backslash escapes cover `\\`, newline, carriage return and tab everywhere,
//! `=` in names and a leading `~` in values. Any malformed line fails the
//! whole parse.

use crate::error::{ArchiveError, Result};
use std::collections::BTreeMap;

const GROUP_MARKER: &str = "~";

/// A named group of `name=value` entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextGroup {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// Parse a flat table. Later duplicates replace earlier ones.
pub fn parse_table(text: &str) -> Result<BTreeMap<String, String>> {
    let mut table = BTreeMap::new();
    for (line_no, line) in lines(text) {
        if line.starts_with('\t') {
            return Err(format_error(line_no, "unexpected indented entry"));
        }
        let (key, value) = parse_line(line_no, line)?;
        match value {
            Some(value) => {
                table.insert(key, value);
            }
            None => return Err(format_error(line_no, "unexpected group in flat table")),
        }
    }
    Ok(table)
}

/// Serialize a flat table
pub fn write_table(table: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in table {
        push_entry(&mut out, key, value);
    }
    out
}

/// Parse a table made of groups
pub fn parse_grouped(text: &str) -> Result<Vec<TextGroup>> {
    let mut groups: Vec<TextGroup> = Vec::new();
    for (line_no, line) in lines(text) {
        if let Some(child) = line.strip_prefix('\t') {
            let group = groups
                .last_mut()
                .ok_or_else(|| format_error(line_no, "entry outside of any group"))?;
            if child.starts_with('\t') {
                return Err(format_error(line_no, "nested groups are not supported"));
            }
            match parse_line(line_no, child)? {
                (key, Some(value)) => group.entries.push((key, value)),
                (_, None) => return Err(format_error(line_no, "nested groups are not supported")),
            }
        } else {
            match parse_line(line_no, line)? {
                (name, None) => groups.push(TextGroup {
                    name,
                    entries: Vec::new(),
                }),
                (_, Some(_)) => return Err(format_error(line_no, "expected a group")),
            }
        }
    }
    Ok(groups)
}

/// Serialize a table made of groups
pub fn write_grouped(groups: &[TextGroup]) -> String {
    let mut out = String::new();
    for group in groups {
        out.push_str(&escape(&group.name, true));
        out.push('=');
        out.push_str(GROUP_MARKER);
        out.push('\n');
        for (key, value) in &group.entries {
            out.push('\t');
            push_entry(&mut out, key, value);
        }
    }
    out
}

fn push_entry(out: &mut String, key: &str, value: &str) {
    out.push_str(&escape(key, true));
    out.push('=');
    let escaped = escape(value, false);
    if escaped.starts_with('~') {
        out.push('\\');
    }
    out.push_str(&escaped);
    out.push('\n');
}

fn escape(text: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' if is_key => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

/// Non-empty lines with 1-based line numbers; a trailing `\r` is ignored
fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split('\n')
        .enumerate()
        .map(|(i, line)| (i + 1, line.strip_suffix('\r').unwrap_or(line)))
        .filter(|(_, line)| !line.is_empty())
}

/// Split one line into its name and value. `None` as the value marks a group.
fn parse_line(line_no: usize, line: &str) -> Result<(String, Option<String>)> {
    let mut key = String::new();
    let mut chars = line.chars();
    loop {
        match chars.next() {
            None => return Err(format_error(line_no, "missing '='")),
            Some('=') => break,
            Some('\\') => key.push(unescape_char(line_no, chars.next())?),
            Some(c) => key.push(c),
        }
    }

    let raw_value = chars.as_str();
    if raw_value == GROUP_MARKER {
        return Ok((key, None));
    }

    let mut value = String::with_capacity(raw_value.len());
    let mut chars = raw_value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => value.push(unescape_char(line_no, chars.next())?),
            c => value.push(c),
        }
    }
    Ok((key, Some(value)))
}

fn unescape_char(line_no: usize, c: Option<char>) -> Result<char> {
    match c {
        Some('\\') => Ok('\\'),
        Some('n') => Ok('\n'),
        Some('r') => Ok('\r'),
        Some('t') => Ok('\t'),
        Some('=') => Ok('='),
        Some('~') => Ok('~'),
        Some(other) => Err(format_error(line_no, &format!("unknown escape '\\{}'", other))),
        None => Err(format_error(line_no, "dangling escape")),
    }
}

fn format_error(line: usize, reason: &str) -> ArchiveError {
    ArchiveError::TextFormat {
        line,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_table() {
        let mut table = BTreeMap::new();
        table.insert("abc".to_string(), "ShaderPatch".to_string());
        table.insert("ShaderPatch-log".to_string(), "line one\nline two".to_string());

        let text = write_table(&table);
        assert_eq!(text, "ShaderPatch-log=line one\\nline two\nabc=ShaderPatch\n");
        assert_eq!(parse_table(&text).unwrap(), table);
    }

    #[test]
    fn test_awkward_strings() {
        let mut table = BTreeMap::new();
        table.insert("a=b\\c".to_string(), "~tilde=and\ttab".to_string());
        table.insert("plain".to_string(), "~".to_string());
        table.insert("empty".to_string(), String::new());

        let parsed = parse_table(&write_table(&table)).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_grouped_table() {
        let groups = vec![
            TextGroup {
                name: "abc".to_string(),
                entries: vec![
                    ("foo.txt".to_string(), "64".to_string()),
                    ("bar.txt".to_string(), "doesnotexist".to_string()),
                ],
            },
            TextGroup {
                name: "def".to_string(),
                entries: Vec::new(),
            },
        ];

        let text = write_grouped(&groups);
        assert_eq!(text, "abc=~\n\tfoo.txt=64\n\tbar.txt=doesnotexist\ndef=~\n");
        assert_eq!(parse_grouped(&text).unwrap(), groups);
    }

    #[test]
    fn test_crlf_tolerated() {
        let parsed = parse_table("a=1\r\nb=2\r\n").unwrap();
        assert_eq!(parsed.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            parse_table("good=1\nbroken line\n"),
            Err(ArchiveError::TextFormat { line: 2, .. })
        ));
        assert!(parse_table("a=\\q\n").is_err());
        assert!(parse_table("a=ends with\\").is_err());
        assert!(parse_table("g=~\n").is_err());
        assert!(parse_grouped("\tfoo=1\n").is_err());
        assert!(parse_grouped("a=1\n").is_err());
        assert!(parse_grouped("a=~\n\t\tb=1\n").is_err());
    }
}
