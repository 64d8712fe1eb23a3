//! Escaping codec: renders values as PostgreSQL literals.
//!
//! Text becomes an `E'...'` escape-string literal. Metacharacters go through a
//! fixed octal table, printable ASCII passes through, and every other code
//! point becomes a `\uXXXX` or `\UXXXXXXXX` escape. Binary payloads become
//! `'\x...'` bytea literals.

use std::fmt::Write;

use chrono::NaiveDateTime;

/// The SQL `NULL` literal used for absent optional values.
pub const NULL_LITERAL: &str = "NULL";

/// Escape `text` as an `E'...'` string literal.
pub fn escape_text(text: &str) -> String {
    if text.is_empty() {
        return "E''".to_string();
    }

    let mut out = String::with_capacity(text.len() * 6 + 3);
    out.push_str("E'");

    for c in text.chars() {
        match c {
            '\0' => out.push(' '),
            '\r' => out.push_str("\\015"),
            '\n' => out.push_str("\\012"),
            '\x0b' => out.push_str("\\013"),
            '\x0c' => out.push_str("\\014"),
            '\\' => out.push_str("\\134"),
            '\'' => out.push_str("\\047"),
            '%' => out.push_str("\\045"),
            '_' => out.push_str("\\137"),
            ':' => out.push_str("\\072"),
            ' '..='~' => out.push(c),
            _ => {
                let code = c as u32;
                // Writing into a String cannot fail.
                if code > 0xFFFF {
                    let _ = write!(out, "\\U{code:08x}");
                } else {
                    let _ = write!(out, "\\u{code:04x}");
                }
            }
        }
    }

    out.push('\'');
    out
}

/// Render `bytes` as a hex bytea literal: `'\x0a1b...'`.
pub fn escape_binary(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 4);
    out.push_str("'\\x");
    out.push_str(&hex::encode(bytes));
    out.push('\'');
    out
}

/// Escape an optional binary payload; `None` renders as `NULL`, never `''`.
pub fn escape_optional_binary(bytes: Option<&[u8]>) -> String {
    match bytes {
        Some(b) => escape_binary(b),
        None => NULL_LITERAL.to_string(),
    }
}

/// Render a timestamp as a quoted ISO-8601 literal without fractional seconds.
pub fn escape_timestamp(ts: &NaiveDateTime) -> String {
    format!("'{}'", ts.format("%Y-%m-%dT%H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn empty_text_is_empty_literal() {
        assert_eq!(escape_text(""), "E''");
    }

    #[test]
    fn quote_is_escaped() {
        assert_eq!(escape_text("O'Brien"), "E'O\\047Brien'");
    }

    #[test]
    fn metacharacters_use_octal_table() {
        assert_eq!(
            escape_text("a\r\n\x0b\x0c\\%_:b"),
            "E'a\\015\\012\\013\\014\\134\\045\\137\\072b'"
        );
    }

    #[test]
    fn plain_ascii_passes_through() {
        assert_eq!(escape_text("hello world!"), "E'hello world!'");
    }

    #[test]
    fn bmp_code_points_use_short_form() {
        assert_eq!(escape_text("é"), "E'\\u00e9'");
        assert_eq!(escape_text("\u{80}"), "E'\\u0080'");
        assert_eq!(escape_text("\u{FFFF}"), "E'\\uffff'");
        assert_eq!(escape_text("\t"), "E'\\u0009'");
    }

    #[test]
    fn astral_code_points_use_long_form() {
        assert_eq!(escape_text("😀"), "E'\\U0001f600'");
        assert_eq!(escape_text("\u{10000}"), "E'\\U00010000'");
    }

    #[test]
    fn nul_becomes_space() {
        assert_eq!(escape_text("a\0b"), "E'a b'");
    }

    #[test]
    fn binary_is_hex_bytea() {
        assert_eq!(escape_binary(&[0x00, 0xab, 0x10]), "'\\x00ab10'");
        assert_eq!(escape_binary(&[]), "'\\x'");
    }

    #[test]
    fn absent_binary_is_null_not_empty() {
        assert_eq!(escape_optional_binary(None), "NULL");
        assert_eq!(escape_optional_binary(Some(&[0xff])), "'\\xff'");
    }

    #[test]
    fn timestamp_is_iso() {
        let ts = NaiveDate::from_ymd_opt(2016, 3, 24)
            .unwrap()
            .and_hms_opt(16, 5, 0)
            .unwrap();
        assert_eq!(escape_timestamp(&ts), "'2016-03-24T16:05:00'");
    }
}
