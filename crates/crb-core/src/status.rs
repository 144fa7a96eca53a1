//! Rendering of the control service's status record.
//!
//! The bot shows the record the way a dynamic-language dictionary prints
//! (`{'a': 1, 'b': True}`), with every comma turned into a line break.
//!
//! Numbers keep their lexical form from the response body, so integers of any size print
//! exactly; `serde_json::Value` would turn integers beyond 64 bits into floats.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::value::RawValue;

/// A parsed status body. Object key order is the order of the response.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusRecord {
    Null,
    Bool(bool),
    /// JSON number text, exactly as received.
    Number(String),
    Str(String),
    List(Vec<StatusRecord>),
    Dict(Vec<(String, StatusRecord)>),
}

impl StatusRecord {
    /// Parse a JSON document.
    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        let raw: Box<RawValue> = serde_json::from_str(body)?;
        Self::from_raw(&raw)
    }

    fn from_raw(raw: &RawValue) -> serde_json::Result<Self> {
        let text = raw.get();
        match text.as_bytes().first() {
            Some(b'{') | Some(b'[') => serde_json::from_str::<Container>(text).map(|c| c.0),
            Some(b'"') => serde_json::from_str::<String>(text).map(StatusRecord::Str),
            Some(b't') | Some(b'f') => serde_json::from_str::<bool>(text).map(StatusRecord::Bool),
            Some(b'n') => Ok(StatusRecord::Null),
            _ => Ok(StatusRecord::Number(text.to_string())),
        }
    }
}

/// Objects and arrays; children are captured raw so numbers keep their text.
struct Container(StatusRecord);

impl<'de> Deserialize<'de> for Container {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ContainerVisitor)
    }
}

struct ContainerVisitor;

impl<'de> Visitor<'de> for ContainerVisitor {
    type Value = Container;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object or array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Container, A::Error> {
        let mut items = Vec::new();
        while let Some(raw) = seq.next_element::<Box<RawValue>>()? {
            items.push(StatusRecord::from_raw(&raw).map_err(de::Error::custom)?);
        }
        Ok(Container(StatusRecord::List(items)))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Container, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, raw)) = map.next_entry::<String, Box<RawValue>>()? {
            entries.push((key, StatusRecord::from_raw(&raw).map_err(de::Error::custom)?));
        }
        Ok(Container(StatusRecord::Dict(entries)))
    }
}

/// Render a status record as the text sent back to the sender.
pub fn format_status(record: &StatusRecord) -> String {
    render_literal(record).replace(',', "\n")
}

/// Dictionary-literal form of a record.
pub fn render_literal(record: &StatusRecord) -> String {
    let mut out = String::new();
    write_value(&mut out, record);
    out
}

fn write_value(out: &mut String, record: &StatusRecord) {
    match record {
        StatusRecord::Null => out.push_str("None"),
        StatusRecord::Bool(true) => out.push_str("True"),
        StatusRecord::Bool(false) => out.push_str("False"),
        StatusRecord::Number(n) => out.push_str(&render_number(n)),
        StatusRecord::Str(s) => write_str(out, s),
        StatusRecord::List(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        StatusRecord::Dict(entries) => {
            out.push('{');
            for (idx, (k, v)) in entries.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_str(out, k);
                out.push_str(": ");
                write_value(out, v);
            }
            out.push('}');
        }
    }
}

fn write_str(out: &mut String, s: &str) {
    // Single quotes unless the text has a single quote and no double quote.
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };

    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if !is_printable(c) => {
                let cp = c as u32;
                if cp < 0x100 {
                    out.push_str(&format!("\\x{cp:02x}"));
                } else if cp < 0x10000 {
                    out.push_str(&format!("\\u{cp:04x}"));
                } else {
                    out.push_str(&format!("\\U{cp:08x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

/// Characters a dictionary literal prints as-is.
///
/// Escaped: controls (Cc), format characters (Cf), separators other than the ASCII space
/// (Zs, Zl, Zp), private use (Co) and noncharacters. Unassigned code points are not
/// tracked and print as-is.
fn is_printable(c: char) -> bool {
    let cp = c as u32;
    let escaped = matches!(
        cp,
        // Cc
        0x00..=0x1f | 0x7f..=0x9f
        // Zs (except U+0020), Zl, Zp
        | 0xa0 | 0x1680 | 0x2000..=0x200a | 0x2028 | 0x2029 | 0x202f | 0x205f | 0x3000
        // Cf
        | 0xad | 0x600..=0x605 | 0x61c | 0x6dd | 0x70f | 0x890..=0x891 | 0x8e2 | 0x180e
        | 0x200b..=0x200f | 0x202a..=0x202e | 0x2060..=0x2064 | 0x2066..=0x206f
        | 0xfeff | 0xfff9..=0xfffb | 0x110bd | 0x110cd | 0x13430..=0x1343f
        | 0x1bca0..=0x1bca3 | 0x1d173..=0x1d17a | 0xe0001 | 0xe0020..=0xe007f
        // Co
        | 0xe000..=0xf8ff | 0xf0000..=0xffffd | 0x100000..=0x10fffd
        // noncharacters
        | 0xfdd0..=0xfdef
    );
    !escaped && (cp & 0xfffe) != 0xfffe
}

fn render_number(text: &str) -> String {
    let is_integer = !text.contains(['.', 'e', 'E']);
    if is_integer {
        return if text == "-0" { "0".to_string() } else { text.to_string() };
    }
    match text.parse::<f64>() {
        Ok(f) => render_float(f),
        Err(_) => text.to_string(),
    }
}

fn render_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let abs = f.abs();
    if !(1e-4..1e16).contains(&abs) {
        // Scientific form with a signed, two-digit exponent: 1e+16, 2.5e-05.
        let sci = format!("{f:e}");
        let Some((mantissa, exp)) = sci.split_once('e') else {
            return sci;
        };
        let Ok(exp) = exp.parse::<i32>() else {
            return sci;
        };
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }

    let plain = f.to_string();
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}
