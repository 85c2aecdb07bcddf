//! LDIF content records (RFC 2849).

use std::borrow::Cow;
use std::io::{self, Write};

use base64::Engine;
use tracing::warn;

use crate::directory::{Attributes, DirectoryEntry, Value};


const LINE_WIDTH: usize = 76;


fn normalize_newlines<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.contains("\r\n") {
        Cow::Owned(ldif.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(ldif)
    }
}

fn join_continuations<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.contains("\n ") {
        Cow::Owned(ldif.replace("\n ", ""))
    } else {
        Cow::Borrowed(ldif)
    }
}

fn strip_comments<'a>(ldif: &'a str) -> Cow<'a, str> {
    if ldif.starts_with('#') || ldif.contains("\n#") {
        let uncommented: Vec<&str> = ldif
            .split('\n')
            .filter(|ln| !ln.starts_with('#'))
            .collect();
        Cow::Owned(uncommented.join("\n"))
    } else {
        Cow::Borrowed(ldif)
    }
}

fn cut_str_to_max(s: &str, mut max_bytes: usize) -> &str {
    if max_bytes >= s.len() {
        return s;
    }
    while !s.is_char_boundary(max_bytes) {
        max_bytes -= 1;
    }
    &s[0..max_bytes]
}

/// Decodes the part of an LDIF line after the attribute name.
fn parse_value(rest: &str) -> Option<Vec<u8>> {
    if let Some(base64_str) = rest.strip_prefix(':') {
        let base64_str = base64_str.trim_matches(' ');
        match base64::engine::general_purpose::STANDARD.decode(base64_str) {
            Ok(bs) => Some(bs),
            Err(_) => {
                warn!(value = cut_str_to_max(base64_str, 64), "skipping invalid base64 value in LDIF");
                None
            },
        }
    } else if rest.starts_with('<') {
        warn!("skipping LDIF value loaded from a URL");
        None
    } else {
        Some(rest.trim_start_matches(' ').as_bytes().to_vec())
    }
}


/// Reads the content records of an LDIF document.
///
/// Change records other than `changetype: add`, and records without a DN,
/// are skipped with a warning.
pub fn parse_ldif(ldif: &str) -> Vec<DirectoryEntry> {
    let normalized = normalize_newlines(ldif);
    let stripped = strip_comments(&normalized);
    let joined = join_continuations(&stripped);

    let mut entries = Vec::new();
    let mut lines = joined.split('\n').peekable();
    while lines.peek().is_some() {
        // each record ends at a blank line
        let mut record = Vec::new();
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            record.push(line);
        }
        if record.is_empty() {
            continue;
        }
        if let Some(entry) = parse_record(&record) {
            entries.push(entry);
        }
    }
    entries
}

fn parse_record(lines: &[&str]) -> Option<DirectoryEntry> {
    let mut dn = None;
    let mut attributes = Attributes::new();

    for line in lines {
        let Some((key, rest)) = line.split_once(':') else {
            warn!(line = cut_str_to_max(line, 64), "skipping LDIF line missing colon");
            continue;
        };
        let Some(value) = parse_value(rest) else { continue };

        if key.eq_ignore_ascii_case("version") && dn.is_none() {
            continue;
        }
        if key.eq_ignore_ascii_case("dn") {
            match String::from_utf8(value) {
                Ok(s) => dn = Some(s),
                Err(_) => {
                    warn!("skipping LDIF record whose DN is not UTF-8");
                    return None;
                },
            }
            continue;
        }
        if key.eq_ignore_ascii_case("changetype") {
            if value.eq_ignore_ascii_case(b"add") {
                continue;
            }
            warn!(dn = dn.as_deref().unwrap_or(""), "skipping LDIF change record");
            return None;
        }
        attributes.push(key.trim(), Value::from_bytes(value));
    }

    let Some(dn) = dn else {
        if !attributes.is_empty() {
            warn!(attributes = attributes.len(), "skipping LDIF record missing required \"dn\"");
        }
        return None;
    };
    Some(DirectoryEntry::new(dn, attributes))
}


/// Whether a value can be written as-is (RFC 2849 SAFE-STRING).
fn is_safe_string(value: &[u8]) -> bool {
    let Some(&first) = value.first() else { return true };
    if first == b' ' || first == b':' || first == b'<' {
        return false;
    }
    if value.last() == Some(&b' ') {
        return false;
    }
    value.iter().all(|&b| b != 0 && b != b'\n' && b != b'\r' && b < 0x80)
}

fn write_line<W: Write>(out: &mut W, key: &str, value: &[u8]) -> io::Result<()> {
    let line = if is_safe_string(value) {
        // checked to be ASCII above
        format!("{}: {}", key, String::from_utf8_lossy(value))
    } else {
        format!("{}:: {}", key, base64::engine::general_purpose::STANDARD.encode(value))
    };

    let mut first = true;
    let mut rest = line.as_str();
    while !rest.is_empty() {
        let width = if first { LINE_WIDTH } else { LINE_WIDTH - 1 };
        let chunk = cut_str_to_max(rest, width);
        let chunk = if chunk.is_empty() { rest } else { chunk };
        if !first {
            out.write_all(b" ")?;
        }
        out.write_all(chunk.as_bytes())?;
        out.write_all(b"\n")?;
        rest = &rest[chunk.len()..];
        first = false;
    }
    Ok(())
}

/// Writes one entry as an LDIF record, followed by a blank line.
pub fn write_entry<W: Write>(out: &mut W, entry: &DirectoryEntry) -> io::Result<()> {
    write_line(out, "dn", entry.dn.as_bytes())?;
    for (name, values) in entry.attributes.iter() {
        for value in values {
            write_line(out, name, value.as_bytes())?;
        }
    }
    out.write_all(b"\n")
}
