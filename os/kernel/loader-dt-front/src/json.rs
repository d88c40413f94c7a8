//! Extended-JSON tokenizer and parser.
//!
//! A superset of JSON tailored to device tree description files: strings may
//! be delimited by either `'` or `"`, `/* ... */` block comments are
//! skipped like whitespace, and an object key prefixed with `@` names an
//! array of child nodes rather than a property.
//!
//! Unlike the original's two-pass tokenize-then-build pipeline (fill a
//! fixed-size token array, retry with a bigger one on `JSMN_ERROR_NOMEM`),
//! this parses directly into an owned [`JsonValue`] tree in one recursive
//! pass — the call stack and `Vec` growth already do what the retry loop
//! worked around.

use crate::FrontError;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone)]
pub enum JsonValue {
    Integer(i64),
    String(String),
    Array(Vec<JsonValue>),
    Object(Vec<(String, JsonValue)>),
}

pub fn parse(input: &str) -> Result<JsonValue, FrontError> {
    let bytes = input.as_bytes();
    let mut pos = 0usize;
    let value = parse_value(bytes, &mut pos)?;
    skip_trivia(bytes, &mut pos);
    Ok(value)
}

fn skip_trivia(buf: &[u8], pos: &mut usize) {
    loop {
        while *pos < buf.len() && (buf[*pos] as char).is_whitespace() {
            *pos += 1;
        }
        if buf[*pos..].starts_with(b"/*") {
            *pos += 2;
            while *pos < buf.len() && !buf[*pos..].starts_with(b"*/") {
                *pos += 1;
            }
            *pos = (*pos + 2).min(buf.len());
            continue;
        }
        break;
    }
}

fn parse_value(buf: &[u8], pos: &mut usize) -> Result<JsonValue, FrontError> {
    skip_trivia(buf, pos);
    match buf.get(*pos) {
        Some(b'{') => parse_object(buf, pos),
        Some(b'[') => parse_array(buf, pos),
        Some(b'\'' | b'"') => parse_string(buf, pos).map(JsonValue::String),
        Some(_) => parse_primitive(buf, pos),
        None => Err(FrontError::UnexpectedEof),
    }
}

fn parse_object(buf: &[u8], pos: &mut usize) -> Result<JsonValue, FrontError> {
    *pos += 1; // '{'
    let mut entries = Vec::new();
    loop {
        skip_trivia(buf, pos);
        match buf.get(*pos) {
            Some(b'}') => {
                *pos += 1;
                return Ok(JsonValue::Object(entries));
            }
            Some(b',') => {
                *pos += 1;
                continue;
            }
            None => return Err(FrontError::UnexpectedEof),
            _ => {}
        }

        let key = parse_string(buf, pos)?;
        skip_trivia(buf, pos);
        if buf.get(*pos) != Some(&b':') {
            return Err(FrontError::ExpectedColon);
        }
        *pos += 1;
        let value = parse_value(buf, pos)?;
        entries.push((key, value));
    }
}

fn parse_array(buf: &[u8], pos: &mut usize) -> Result<JsonValue, FrontError> {
    *pos += 1; // '['
    let mut items = Vec::new();
    loop {
        skip_trivia(buf, pos);
        match buf.get(*pos) {
            Some(b']') => {
                *pos += 1;
                return Ok(JsonValue::Array(items));
            }
            Some(b',') => {
                *pos += 1;
                continue;
            }
            None => return Err(FrontError::UnexpectedEof),
            _ => {}
        }
        items.push(parse_value(buf, pos)?);
    }
}

fn parse_string(buf: &[u8], pos: &mut usize) -> Result<String, FrontError> {
    skip_trivia(buf, pos);
    let quote = match buf.get(*pos) {
        Some(&q @ (b'\'' | b'"')) => q,
        _ => return Err(FrontError::ExpectedString),
    };
    *pos += 1;
    let mut out = String::new();
    loop {
        match buf.get(*pos) {
            Some(&b'\\') => {
                *pos += 1;
                match buf.get(*pos) {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(&c) => out.push(c as char),
                    None => return Err(FrontError::UnexpectedEof),
                }
                *pos += 1;
            }
            Some(&c) if c == quote => {
                *pos += 1;
                return Ok(out);
            }
            Some(&c) => {
                out.push(c as char);
                *pos += 1;
            }
            None => return Err(FrontError::UnexpectedEof),
        }
    }
}

fn parse_primitive(buf: &[u8], pos: &mut usize) -> Result<JsonValue, FrontError> {
    let start = *pos;
    while *pos < buf.len() && !matches!(buf[*pos], b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n') {
        *pos += 1;
    }
    if *pos == start {
        return Err(FrontError::ExpectedPrimitive);
    }
    let token = core::str::from_utf8(&buf[start..*pos]).map_err(|_| FrontError::ExpectedPrimitive)?;
    match token {
        "true" => Ok(JsonValue::Integer(1)),
        "false" | "null" => Ok(JsonValue::Integer(0)),
        _ => {
            let value = if let Some(hex) = token.strip_prefix("0x") {
                i64::from_str_radix(hex, 16).map_err(|_| FrontError::ExpectedPrimitive)?
            } else {
                token.parse::<i64>().map_err(|_| FrontError::ExpectedPrimitive)?
            };
            Ok(JsonValue::Integer(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_quote_strings() {
        let v = parse("{'a': \"b\", \"c\": 'd'}").unwrap();
        match v {
            JsonValue::Object(entries) => assert_eq!(entries.len(), 2),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn skips_block_comments() {
        let v = parse("{/* comment */ 'a': 1}").unwrap();
        match v {
            JsonValue::Object(entries) => assert_eq!(entries[0].0, "a"),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parses_hex_and_decimal_integers() {
        let v = parse("{'a': 0x10, 'b': 42}").unwrap();
        if let JsonValue::Object(entries) = v {
            assert!(matches!(entries[0].1, JsonValue::Integer(16)));
            assert!(matches!(entries[1].1, JsonValue::Integer(42)));
        } else {
            panic!("expected object");
        }
    }

    #[test]
    fn parses_children_array_key() {
        let v = parse("{'@children': [{'name': 'cpu0'}]}").unwrap();
        if let JsonValue::Object(entries) = v {
            assert_eq!(entries[0].0, "@children");
            assert!(matches!(entries[0].1, JsonValue::Array(_)));
        } else {
            panic!("expected object");
        }
    }
}
