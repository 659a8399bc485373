//! Canonical signing-form emitter.
//!
//! The byte string hashed to produce an event id is the JSON array
//! `[0,pubkey,created_at,kind,tags,content]` with no whitespace and a fixed
//! escape table. The form is emitted by hand so the id computation never
//! depends on a JSON backend's formatting choices.

use crate::event::Tag;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Append `s` to `out` as a JSON string literal (with surrounding quotes).
///
/// Escapes `"` and `\` with a backslash, uses the short escapes for
/// `\n \r \t \b \f`, and `\u00XX` for every other byte below 0x20.
pub fn escape_string_into(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let b = c as u32;
                out.push_str("\\u00");
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Build the canonical signing form `[0,pubkey,created_at,kind,tags,content]`.
///
/// Tag order is preserved exactly as given. Integers are emitted in plain
/// decimal. Two calls with equal inputs produce identical byte strings.
pub fn signing_form(
    pubkey: &str,
    created_at: i64,
    kind: u64,
    tags: &[Tag],
    content: &str,
) -> String {
    let mut out = String::with_capacity(128 + content.len());
    out.push_str("[0,");
    escape_string_into(&mut out, pubkey);
    out.push(',');
    out.push_str(&created_at.to_string());
    out.push(',');
    out.push_str(&kind.to_string());
    out.push_str(",[");
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, item) in tag.as_slice().iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            escape_string_into(&mut out, item);
        }
        out.push(']');
    }
    out.push_str("],");
    escape_string_into(&mut out, content);
    out.push(']');
    out
}
