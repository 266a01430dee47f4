//! Best-effort recovery of JSON embedded in assistant prose.
//!
//! The assistant is asked for JSON but regularly wraps it in Markdown fences,
//! surrounds it with commentary, or emits something only JSON-shaped: single
//! quotes, bare keys, trailing or missing commas, Python literals, comments,
//! or a reply cut off mid-object. [`repair_json`] accepts all of these and
//! returns the most plausible value.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::io;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("no JSON object or array in text")]
    NoStructure,

    #[error("nesting deeper than {} levels", MAX_DEPTH)]
    TooDeep,

    #[error("failed to serialize repaired value: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("repaired value is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Containers nested deeper than this abandon the repair.
const MAX_DEPTH: usize = 128;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?(.*?)```").expect("invalid fence regex"));

/// The repair pass applied to buffered replies: unwrap the first fenced
/// block, trim to the outermost object (or array), repair, unpack a list to
/// its first element, and re-serialize. Falls back to the trimmed text when
/// nothing can be recovered.
pub fn clean_json_output(raw: &str) -> String {
    let trimmed = trim_to_structure(raw);
    match repair_json(&trimmed).and_then(|value| to_canonical_json(&unpack_list(value))) {
        Ok(json) => json,
        Err(e) => {
            debug!("JSON repair failed ({}), returning trimmed text", e);
            trimmed
        }
    }
}

fn trim_to_structure(raw: &str) -> String {
    let mut text = raw.trim();
    if text.contains("```")
        && let Some(inner) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1))
    {
        text = inner.as_str().trim();
    }

    let bounds = match (text.find('{'), text.rfind('}')) {
        (Some(start), end) => Some((start, end)),
        (None, _) => text.find('[').map(|start| (start, text.rfind(']'))),
    };
    match bounds {
        Some((start, Some(end))) if end >= start => text[start..=end].to_string(),
        _ => text.to_string(),
    }
}

fn unpack_list(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            warn!("Repaired JSON is a list of {}, keeping the first item", items.len());
            items
                .into_iter()
                .next()
                .unwrap_or_else(|| Value::Object(Map::new()))
        }
        other => other,
    }
}

/// Serialize with `", "` and `": "` separators and non-ASCII left as is.
pub fn to_canonical_json(value: &Value) -> Result<String, RepairError> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out)?)
}

struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Parse the first object or array in `text`, tolerating the usual ways
/// model output breaks JSON. Unterminated strings and containers are closed
/// at end of input.
pub fn repair_json(text: &str) -> Result<Value, RepairError> {
    let mut parser = Parser::new(text);
    parser.skip_to_structure();
    if parser.peek().is_none() {
        return Err(RepairError::NoStructure);
    }
    let value = parser.parse_value();
    if parser.too_deep {
        return Err(RepairError::TooDeep);
    }
    value.ok_or(RepairError::NoStructure)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
    too_deep: bool,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
            too_deep: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_to_structure(&mut self) {
        while let Some(c) = self.peek() {
            if c == '{' || c == '[' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Whitespace plus `//` and `/* */` comments.
    fn skip_trivia(&mut self) {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => self.pos += 1,
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some('/'), Some('*')) => {
                    self.pos += 2;
                    while self.peek().is_some() && !(self.peek() == Some('*') && self.peek_at(1) == Some('/')) {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.chars.len());
                }
                _ => break,
            }
        }
    }

    fn parse_value(&mut self) -> Option<Value> {
        self.skip_trivia();
        match self.peek()? {
            '{' | '[' if self.depth >= MAX_DEPTH => {
                self.too_deep = true;
                self.pos = self.chars.len();
                None
            }
            '{' => Some(self.parse_object()),
            '[' => Some(self.parse_array()),
            '"' | '\'' => Some(Value::String(self.parse_string())),
            c if c == '-' || c == '.' || c.is_ascii_digit() => Some(self.parse_number()),
            _ => self.parse_word(),
        }
    }

    fn parse_object(&mut self) -> Value {
        self.pos += 1;
        self.depth += 1;
        let mut map = Map::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => break,
                Some('}') | Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }

            let start = self.pos;
            let key = self.parse_key();
            self.skip_trivia();
            if self.peek() == Some(':') {
                self.pos += 1;
                self.skip_trivia();
            }
            let value = match self.peek() {
                None | Some(',') | Some('}') => Value::Null,
                _ => self.parse_value().unwrap_or(Value::Null),
            };

            if self.pos == start {
                self.pos += 1;
                continue;
            }
            map.insert(key, value);
        }
        self.depth -= 1;
        Value::Object(map)
    }

    fn parse_key(&mut self) -> String {
        match self.peek() {
            Some('"') | Some('\'') => self.parse_string(),
            _ => {
                let mut key = String::new();
                while let Some(c) = self.peek() {
                    if c == ':' || c == ',' || c == '}' || c.is_whitespace() {
                        break;
                    }
                    key.push(c);
                    self.pos += 1;
                }
                key
            }
        }
    }

    fn parse_array(&mut self) -> Value {
        self.pos += 1;
        self.depth += 1;
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => break,
                Some(']') | Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }

            let start = self.pos;
            if let Some(value) = self.parse_value() {
                items.push(value);
            }
            if self.pos == start {
                self.pos += 1;
            }
        }
        self.depth -= 1;
        Value::Array(items)
    }

    fn parse_string(&mut self) -> String {
        let quote = self.chars[self.pos];
        self.pos += 1;
        let mut out = String::new();

        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == '\\' {
                match self.peek() {
                    Some(escaped) => {
                        self.pos += 1;
                        match escaped {
                            'n' => out.push('\n'),
                            't' => out.push('\t'),
                            'r' => out.push('\r'),
                            'b' => out.push('\u{8}'),
                            'f' => out.push('\u{c}'),
                            'u' => out.push(self.parse_unicode_escape()),
                            other => out.push(other),
                        }
                    }
                    None => break,
                }
            } else if c == quote {
                if self.closes_string() {
                    return out;
                }
                out.push(c);
            } else {
                out.push(c);
            }
        }
        out
    }

    /// An unescaped quote only ends the string when what follows looks like
    /// the rest of a document; otherwise it is part of the text.
    fn closes_string(&self) -> bool {
        let mut crossed_line = false;
        for &c in &self.chars[self.pos..] {
            if c == '\n' {
                crossed_line = true;
            } else if !c.is_whitespace() {
                return crossed_line || matches!(c, ',' | '}' | ']' | ':');
            }
        }
        true
    }

    fn read_hex4(&mut self) -> Option<u32> {
        let digits: String = self.chars.get(self.pos..self.pos + 4)?.iter().collect();
        let code = u32::from_str_radix(&digits, 16).ok()?;
        self.pos += 4;
        Some(code)
    }

    fn parse_unicode_escape(&mut self) -> char {
        let Some(high) = self.read_hex4() else {
            return char::REPLACEMENT_CHARACTER;
        };
        if (0xD800..0xDC00).contains(&high) && self.peek() == Some('\\') && self.peek_at(1) == Some('u') {
            let resume = self.pos;
            self.pos += 2;
            match self.read_hex4() {
                Some(low) if (0xDC00..0xE000).contains(&low) => {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER);
                }
                _ => self.pos = resume,
            }
        }
        char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    fn parse_number(&mut self) -> Value {
        let mut raw = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                raw.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }

        let is_float = raw.contains(['.', 'e', 'E']);
        if !is_float {
            if let Ok(int) = raw.parse::<i64>() {
                return Value::from(int);
            }
            if let Ok(int) = raw.parse::<u64>() {
                return Value::from(int);
            }
        }
        raw.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(raw))
    }

    /// Bare words: JSON and Python literals, otherwise an unquoted string.
    fn parse_word(&mut self) -> Option<Value> {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, ',' | '}' | ']' | ':' | '\n') {
                break;
            }
            word.push(c);
            self.pos += 1;
        }

        match word.trim() {
            "" => None,
            "true" | "True" => Some(Value::Bool(true)),
            "false" | "False" => Some(Value::Bool(false)),
            "null" | "None" => Some(Value::Null),
            other => Some(Value::String(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_with_prose() {
        assert_eq!(
            clean_json_output("prefix ```json\n{\"a\":1}\n``` suffix"),
            r#"{"a": 1}"#
        );
    }

    #[test]
    fn embedded_object_round_trips() {
        let original = json!({
            "action": "click",
            "target": {"index": 3, "labels": ["ok", "確定"]},
            "done": false,
            "score": 0.5,
            "note": null,
            "id": 12345678901234567890u64
        });
        let wrapped = format!("Sure! Here you go:\n{}\nLet me know.", original);
        let cleaned = clean_json_output(&wrapped);
        assert_eq!(serde_json::from_str::<Value>(&cleaned).unwrap(), original);
        assert!(cleaned.contains("確定"));
    }

    #[test]
    fn runaway_nesting_falls_back_to_text() {
        let deep = "[".repeat(200_000);
        assert_eq!(clean_json_output(&deep), deep);
        assert!(matches!(repair_json(&"{\"a\": ".repeat(500)), Err(RepairError::TooDeep)));

        let nested = format!("{}1{}", "[".repeat(100), "]".repeat(100));
        assert!(repair_json(&nested).is_ok());
    }

    #[test]
    fn arrays_unpack_to_first_element() {
        assert_eq!(
            clean_json_output(r#"[{"step": 1}, {"step": 2}]"#),
            r#"{"step": 1}"#
        );
        assert_eq!(clean_json_output("[]"), "{}");
    }

    #[test]
    fn no_structure_falls_back_to_trimmed_text() {
        assert_eq!(clean_json_output("  Hello there \n"), "Hello there");
    }

    #[test]
    fn repairs_common_breakage() {
        assert_eq!(
            repair_json("{'name': 'x', 'tags': ['a', 'b',],}").unwrap(),
            json!({"name": "x", "tags": ["a", "b"]})
        );
        assert_eq!(
            repair_json("{ok: True, missing: None, off: False}").unwrap(),
            json!({"ok": true, "missing": null, "off": false})
        );
        assert_eq!(
            repair_json("{\"a\": 1\n\"b\": 2}").unwrap(),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(
            repair_json("{\n  // step\n  \"a\": 1, /* why */ \"b\": [1, 2.5, -3]\n}").unwrap(),
            json!({"a": 1, "b": [1, 2.5, -3]})
        );
    }

    #[test]
    fn closes_truncated_input() {
        assert_eq!(
            repair_json(r#"{"thought": "almost there", "items": [1, 2"#).unwrap(),
            json!({"thought": "almost there", "items": [1, 2]})
        );
        assert_eq!(
            repair_json(r#"{"text": "cut off mid"#).unwrap(),
            json!({"text": "cut off mid"})
        );
    }

    #[test]
    fn stray_inner_quotes_stay_in_the_string() {
        assert_eq!(
            repair_json(r#"{"say": "he said "hi" twice"}"#).unwrap(),
            json!({"say": "he said \"hi\" twice"})
        );
    }

    #[test]
    fn escapes_are_decoded() {
        assert_eq!(
            repair_json(r#"{"s": "line\nnext é 😀"}"#).unwrap(),
            json!({"s": "line\nnext é 😀"})
        );
    }

    #[test]
    fn canonical_spacing() {
        let value = json!({"a": [1, 2], "b": {"c": "ü"}});
        assert_eq!(
            to_canonical_json(&value).unwrap(),
            r#"{"a": [1, 2], "b": {"c": "ü"}}"#
        );
    }
}
