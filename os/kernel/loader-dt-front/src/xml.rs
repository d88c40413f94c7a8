//! XML property-list front-end.
//!
//! Reads an Apple-style plist (`<dict>`/`<array>`/`<key>`/`<string>`/
//! `<integer>`/`<true/>`/`<false/>`) and produces the same
//! [`crate::json::JsonValue`] tree the JSON front-end does, so both feed
//! the same [`crate::build_device_tree`] walk. Only the first top-level
//! `<dict>` found in the document is parsed — anything before it (an XML
//! declaration, a `<plist>` wrapper, a DOCTYPE) is skipped, and anything
//! after it is ignored, matching the original's "found it, stop scanning"
//! behavior.

use crate::FrontError;
use crate::json::JsonValue;
use alloc::string::String;
use alloc::vec::Vec;

pub fn parse(input: &str) -> Result<JsonValue, FrontError> {
    let buf = input.as_bytes();
    let start = find_tag_start(buf, "dict").ok_or(FrontError::NoRootDict)?;
    let (value, _end) = parse_element(buf, start)?;
    Ok(value)
}

fn find_tag_start(buf: &[u8], name: &str) -> Option<usize> {
    let needle_open = alloc::format!("<{name}>");
    let mut pos = 0;
    while pos < buf.len() {
        if buf[pos..].starts_with(needle_open.as_bytes()) {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

struct OpenTag<'a> {
    name: &'a str,
    self_closing: bool,
    /// Offset just past the `>` of the opening tag.
    body_start: usize,
}

fn read_open_tag(buf: &[u8], pos: usize) -> Result<OpenTag<'_>, FrontError> {
    if buf.get(pos) != Some(&b'<') {
        return Err(FrontError::ExpectedTag);
    }
    let close = buf[pos..].iter().position(|&b| b == b'>').ok_or(FrontError::UnexpectedEof)?;
    let tag_inner = &buf[pos + 1..pos + close];
    let self_closing = tag_inner.ends_with(b"/");
    let name_bytes = if self_closing {
        &tag_inner[..tag_inner.len() - 1]
    } else {
        tag_inner
    };
    let name = core::str::from_utf8(name_bytes).map_err(|_| FrontError::ExpectedTag)?;
    Ok(OpenTag {
        name,
        self_closing,
        body_start: pos + close + 1,
    })
}

/// Parse the element starting at `pos` (which must point at a `<`),
/// returning the value and the offset just past its closing tag.
fn parse_element(buf: &[u8], pos: usize) -> Result<(JsonValue, usize), FrontError> {
    let open = read_open_tag(buf, pos)?;

    if open.self_closing {
        let value = match open.name {
            "true" => JsonValue::Integer(1),
            "false" => JsonValue::Integer(0),
            _ => JsonValue::Integer(0),
        };
        return Ok((value, open.body_start));
    }

    match open.name {
        "dict" => parse_dict(buf, open.body_start, open.name),
        "array" => parse_array(buf, open.body_start, open.name),
        "key" | "string" | "data" => {
            let (text, end) = read_leaf_text(buf, open.body_start, open.name)?;
            Ok((JsonValue::String(text), end))
        }
        "integer" => {
            let (text, end) = read_leaf_text(buf, open.body_start, open.name)?;
            let value = if let Some(hex) = text.strip_prefix("0x") {
                i64::from_str_radix(hex, 16).map_err(|_| FrontError::ExpectedPrimitive)?
            } else {
                text.parse::<i64>().map_err(|_| FrontError::ExpectedPrimitive)?
            };
            Ok((JsonValue::Integer(value), end))
        }
        _ => Err(FrontError::ExpectedTag),
    }
}

fn read_leaf_text(buf: &[u8], start: usize, name: &str) -> Result<(String, usize), FrontError> {
    let close_tag = alloc::format!("</{name}>");
    let rel = buf[start..]
        .windows(close_tag.len())
        .position(|w| w == close_tag.as_bytes())
        .ok_or(FrontError::UnexpectedEof)?;
    let text = core::str::from_utf8(&buf[start..start + rel])
        .map_err(|_| FrontError::ExpectedString)?
        .trim();
    Ok((String::from(text), start + rel + close_tag.len()))
}

fn parse_dict(buf: &[u8], mut pos: usize, name: &str) -> Result<(JsonValue, usize), FrontError> {
    let close_tag = alloc::format!("</{name}>");
    let mut entries = Vec::new();

    loop {
        pos = skip_whitespace(buf, pos);
        if buf[pos..].starts_with(close_tag.as_bytes()) {
            return Ok((JsonValue::Object(entries), pos + close_tag.len()));
        }

        let (key_value, after_key) = parse_element(buf, pos)?;
        let key = match key_value {
            JsonValue::String(s) => s,
            _ => return Err(FrontError::ExpectedString),
        };
        pos = skip_whitespace(buf, after_key);
        let (value, after_value) = parse_element(buf, pos)?;
        entries.push((key, value));
        pos = after_value;
    }
}

fn parse_array(buf: &[u8], mut pos: usize, name: &str) -> Result<(JsonValue, usize), FrontError> {
    let close_tag = alloc::format!("</{name}>");
    let mut items = Vec::new();

    loop {
        pos = skip_whitespace(buf, pos);
        if buf[pos..].starts_with(close_tag.as_bytes()) {
            return Ok((JsonValue::Array(items), pos + close_tag.len()));
        }
        let (value, after_value) = parse_element(buf, pos)?;
        items.push(value);
        pos = after_value;
    }
}

fn skip_whitespace(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && (buf[pos] as char).is_whitespace() {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_dict_with_string_and_integer() {
        let xml = "<?xml version=\"1.0\"?><plist><dict><key>model</key><string>xnu-arm-virt</string><key>count</key><integer>3</integer></dict></plist>";
        let v = parse(xml).unwrap();
        if let JsonValue::Object(entries) = v {
            assert_eq!(entries[0].0, "model");
            assert!(matches!(&entries[0].1, JsonValue::String(s) if s == "xnu-arm-virt"));
            assert!(matches!(entries[1].1, JsonValue::Integer(3)));
        } else {
            panic!("expected dict");
        }
    }

    #[test]
    fn parses_nested_children_array() {
        let xml = "<dict><key>@children</key><array><dict><key>name</key><string>cpu0</string></dict></array></dict>";
        let v = parse(xml).unwrap();
        if let JsonValue::Object(entries) = v {
            assert_eq!(entries[0].0, "@children");
            if let JsonValue::Array(items) = &entries[0].1 {
                assert_eq!(items.len(), 1);
            } else {
                panic!("expected array");
            }
        } else {
            panic!("expected dict");
        }
    }

    #[test]
    fn stops_at_first_top_level_dict() {
        let xml = "<plist><dict><key>a</key><integer>1</integer></dict></plist><dict><key>b</key><integer>2</integer></dict>";
        let v = parse(xml).unwrap();
        if let JsonValue::Object(entries) = v {
            assert_eq!(entries[0].0, "a");
        } else {
            panic!("expected dict");
        }
    }
}
