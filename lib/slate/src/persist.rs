use crate::value::Value;
use basalt::encoding::base64;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Exact first significant line of a persistent file.
pub const FILE_HEADER: &str = "[NetworkTables Storage 3.0]";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PersistError {
    /// The first significant line was not the expected header.
    BadHeader,
    Io(io::ErrorKind),
}

impl From<io::Error> for PersistError {
    #[inline]
    fn from(err: io::Error) -> Self {
        PersistError::Io(err.kind())
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PersistError::BadHeader => write!(f, "header line mismatch, ignoring rest of file"),
            PersistError::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}

/// Escapes a string for a persistent-file line. Backslash, double quote,
/// newline and tab get two-character escapes; any other byte outside the
/// printable ASCII range is written as `\xHH`.
fn escape_string(out: &mut String, s: &str) {
    out.push('"');
    for byte in s.bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                out.push_str("\\x");
                out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap());
                out.push(char::from_digit(u32::from(byte & 0xf), 16).unwrap());
            }
        }
    }
    out.push('"');
}

fn from_hex_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Reverses [`escape_string`] on a token that still carries its surrounding
/// quotes. Returns `None` when the escapes decode to invalid UTF-8.
fn unescape_string(token: &str) -> Option<String> {
    debug_assert!(token.len() >= 2 && token.starts_with('"') && token.ends_with('"'));

    let body = &token.as_bytes()[1..token.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;

    while i < body.len() {
        let ch = body[i];
        if ch != b'\\' {
            out.push(ch);
            i += 1;
            continue;
        }

        i += 1;
        if i >= body.len() {
            out.push(b'\\');
            break;
        }

        match body[i] {
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b't' => out.push(b'\t'),
            b'n' => out.push(b'\n'),
            b'x' => {
                match body.get(i + 1).copied().and_then(from_hex_digit) {
                    None => out.push(b'x'),
                    Some(first) => {
                        i += 1;
                        match body.get(i + 1).copied().and_then(from_hex_digit) {
                            Some(second) => {
                                i += 1;
                                out.push((first << 4) | second);
                            }
                            None => out.push(first),
                        }
                    }
                }
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 1;
    }

    String::from_utf8(out).ok()
}

/// Extracts a quoted token from the front of `source`. The returned token
/// keeps both quotes; the second element is the unconsumed tail. Returns an
/// empty token when the front is not a quote, and an unterminated token
/// (no trailing quote) when the line runs out.
fn read_string_token(source: &str) -> (&str, &str) {
    if !source.starts_with('"') {
        return ("", source);
    }

    let bytes = source.as_bytes();
    let mut pos = 1;
    while pos < bytes.len() {
        if bytes[pos] == b'"' && bytes[pos - 1] != b'\\' {
            pos += 1;
            break;
        }
        pos += 1;
    }

    (&source[..pos], &source[pos..])
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        Value::Double(v) => out.push_str(&v.to_string()),
        Value::Str(v) => escape_string(out, v),
        Value::Raw(v) => out.push_str(&base64::encode(v)),
        Value::BooleanArray(v) => {
            for (i, elem) in v.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                out.push_str(if *elem { "true" } else { "false" });
            }
        }
        Value::DoubleArray(v) => {
            for (i, elem) in v.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                out.push_str(&elem.to_string());
            }
        }
        Value::StringArray(v) => {
            for (i, elem) in v.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                escape_string(out, elem);
            }
        }
        // RPC definitions are server-process state, never persisted.
        Value::Rpc(_) => {}
    }
}

fn type_keyword(value: &Value) -> Option<&'static str> {
    match value {
        Value::Boolean(_) => Some("boolean"),
        Value::Double(_) => Some("double"),
        Value::Str(_) => Some("string"),
        Value::Raw(_) => Some("raw"),
        Value::BooleanArray(_) => Some("array boolean"),
        Value::DoubleArray(_) => Some("array double"),
        Value::StringArray(_) => Some("array string"),
        Value::Rpc(_) => None,
    }
}

/// Writes the persistent text representation of `entries` to `w`. The caller
/// is expected to hand over name-sorted entries.
pub fn save<W: Write>(w: &mut W, entries: &[(String, Arc<Value>)]) -> io::Result<()> {
    let mut line = String::new();

    writeln!(w, "{}", FILE_HEADER)?;

    for (name, value) in entries {
        let keyword = match type_keyword(value) {
            Some(keyword) => keyword,
            None => continue,
        };

        line.clear();
        line.push_str(keyword);
        line.push(' ');
        escape_string(&mut line, name);
        line.push('=');
        write_value(&mut line, value);

        writeln!(w, "{}", line)?;
    }

    Ok(())
}

fn parse_value(type_kw: &str, rest: &str, array_kw: Option<&str>) -> Result<Value, &'static str> {
    match (type_kw, array_kw) {
        ("boolean", None) => match rest {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => Err("unrecognized boolean value, not 'true' or 'false'"),
        },
        ("double", None) => rest
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| "invalid double value"),
        ("string", None) => {
            let (token, _) = read_string_token(rest);
            if token.is_empty() {
                return Err("missing string value");
            }
            if !token.ends_with('"') || token.len() < 2 {
                return Err("unterminated string value");
            }
            unescape_string(token)
                .map(Value::Str)
                .ok_or("invalid utf-8 in string value")
        }
        ("raw", None) => base64::decode(rest.trim())
            .map(Value::Raw)
            .map_err(|_| "invalid base64 value"),
        ("array", Some("boolean")) => {
            let mut elems = Vec::new();
            if !rest.is_empty() {
                for tok in rest.split(',') {
                    match tok.trim_matches(|c| c == ' ' || c == '\t') {
                        "true" => elems.push(true),
                        "false" => elems.push(false),
                        _ => return Err("unrecognized boolean value, not 'true' or 'false'"),
                    }
                }
            }
            Ok(Value::BooleanArray(elems))
        }
        ("array", Some("double")) => {
            let mut elems = Vec::new();
            if !rest.is_empty() {
                for tok in rest.split(',') {
                    let tok = tok.trim_matches(|c| c == ' ' || c == '\t');
                    match tok.parse::<f64>() {
                        Ok(v) => elems.push(v),
                        Err(_) => return Err("invalid double value"),
                    }
                }
            }
            Ok(Value::DoubleArray(elems))
        }
        ("array", Some("string")) => {
            let mut elems = Vec::new();
            let mut line = rest;
            while !line.is_empty() {
                let (token, tail) = read_string_token(line);
                if token.is_empty() {
                    return Err("missing string value");
                }
                if !token.ends_with('"') || token.len() < 2 {
                    return Err("unterminated string value");
                }
                match unescape_string(token) {
                    Some(s) => elems.push(s),
                    None => return Err("invalid utf-8 in string value"),
                }

                line = tail.trim_start_matches(|c| c == ' ' || c == '\t');
                if line.is_empty() {
                    break;
                }
                if !line.starts_with(',') {
                    return Err("expected comma between strings");
                }
                line = line[1..].trim_start_matches(|c| c == ' ' || c == '\t');
            }
            Ok(Value::StringArray(elems))
        }
        _ => Err("unrecognized type"),
    }
}

fn parse_line(line: &str) -> Result<(String, Value), &'static str> {
    // type keyword, possibly two words for arrays
    let (type_kw, rest) = match line.find(' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, ""),
    };

    let (array_kw, rest) = if type_kw == "array" {
        match rest.find(' ') {
            Some(pos) => (Some(&rest[..pos]), &rest[pos + 1..]),
            None => (Some(rest), ""),
        }
    } else {
        (None, rest)
    };

    match (type_kw, array_kw) {
        ("boolean", None)
        | ("double", None)
        | ("string", None)
        | ("raw", None)
        | ("array", Some("boolean"))
        | ("array", Some("double"))
        | ("array", Some("string")) => {}
        _ => return Err("unrecognized type"),
    }

    // name
    let (name_tok, rest) = read_string_token(rest);
    if name_tok.is_empty() {
        return Err("missing name");
    }
    if !name_tok.ends_with('"') || name_tok.len() < 2 {
        return Err("unterminated name string");
    }
    let name = unescape_string(name_tok).ok_or("invalid utf-8 in name")?;

    // =
    let rest = rest.trim_start_matches(|c| c == ' ' || c == '\t');
    if !rest.starts_with('=') {
        return Err("expected = after name");
    }
    let rest = rest[1..].trim_start_matches(|c| c == ' ' || c == '\t');

    let value = parse_value(type_kw, rest, array_kw)?;
    Ok((name, value))
}

/// Parses a persistent file. Blank lines and `;`/`#` comments are skipped;
/// the first significant line must be the exact header. Malformed lines are
/// reported through `warn` with their line number and skipped; everything
/// recognizable loads.
pub fn load<R: BufRead>(
    reader: R,
    warn: &mut dyn FnMut(usize, &str),
) -> Result<Vec<(String, Value)>, PersistError> {
    let mut entries = Vec::new();
    let mut saw_header = false;

    for (idx, line) in reader.lines().enumerate() {
        let line_num = idx + 1;
        let raw = line?;
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim_matches(|c| c == ' ' || c == '\t');

        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }

        if !saw_header {
            if line != FILE_HEADER {
                warn(line_num, "header line mismatch, ignoring rest of file");
                return Err(PersistError::BadHeader);
            }
            saw_header = true;
            continue;
        }

        match parse_line(trimmed) {
            Ok(entry) => entries.push(entry),
            Err(msg) => warn(line_num, msg),
        }
    }

    if !saw_header {
        return Err(PersistError::BadHeader);
    }

    Ok(entries)
}
