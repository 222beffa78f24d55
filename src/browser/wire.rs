//! Raw-slice JSON field extraction for the child wire protocol.
//!
//! Each response line is a flat object `{"id":N,"result":<any>}` or
//! `{"id":N,"error":"<message>"}`. Rather than parsing the whole line into a
//! `serde_json::Value` tree and re-serializing `result` for pass-through,
//! this walks the object once and returns the raw, unparsed text span of a
//! requested field. This keeps large payloads (screenshot bytes, base64
//! blobs) binary-clean and avoids an allocation/copy pass proportional to
//! their size — the one deliberate performance shortcut this layer takes.

/// Scan a single-line JSON object and return the raw (unparsed) text of the
/// value bound to `target_key`, or `None` if the object has no such key or
/// is malformed.
pub fn extract_field_raw<'a>(json: &'a str, target_key: &str) -> Option<&'a str> {
    let bytes = json.as_bytes();
    let mut i = skip_ws(bytes, 0);
    if i >= bytes.len() || bytes[i] != b'{' {
        return None;
    }
    i += 1;
    loop {
        i = skip_ws(bytes, i);
        if i >= bytes.len() {
            return None;
        }
        if bytes[i] == b'}' {
            return None;
        }
        if bytes[i] == b',' {
            i += 1;
            continue;
        }
        if bytes[i] != b'"' {
            return None;
        }
        let key_start = i;
        i = skip_string(bytes, i)?;
        let key = &json[key_start + 1..i - 1];
        i = skip_ws(bytes, i);
        if i >= bytes.len() || bytes[i] != b':' {
            return None;
        }
        i += 1;
        i = skip_ws(bytes, i);
        let value_start = i;
        i = skip_value(bytes, i)?;
        if key == target_key {
            return Some(&json[value_start..i]);
        }
    }
}

/// Extract and parse the `id` field. Returns `None` if absent or non-numeric.
pub fn extract_id(json: &str) -> Option<u32> {
    extract_field_raw(json, "id")?.trim().parse().ok()
}

/// Extract the `error` field as a decoded string, if present. The wire
/// protocol always sends `error` as a JSON string, so this one field is
/// parsed rather than sliced raw.
pub fn extract_error(json: &str) -> Option<String> {
    let raw = extract_field_raw(json, "error")?;
    serde_json::from_str::<String>(raw).ok()
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b'\n' | b'\r') {
        i += 1;
    }
    i
}

/// Advance past a JSON string starting at `bytes[start] == '"'`, tracking
/// backslash escapes so an escaped quote doesn't end the string early.
/// Returns the index just past the closing quote.
fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Advance past one JSON value (object, array, string, number, or literal).
/// Bracket depth is tracked for objects/arrays; the scanner never descends
/// into strings for depth counting, so braces inside string values are
/// ignored correctly.
fn skip_value(bytes: &[u8], start: usize) -> Option<usize> {
    let i = start;
    if i >= bytes.len() {
        return None;
    }
    match bytes[i] {
        b'"' => skip_string(bytes, i),
        b'{' | b'[' => {
            let mut depth = 0i32;
            let mut i = i;
            loop {
                if i >= bytes.len() {
                    return None;
                }
                match bytes[i] {
                    b'"' => i = skip_string(bytes, i)?,
                    b'{' | b'[' => {
                        depth += 1;
                        i += 1;
                    }
                    b'}' | b']' => {
                        depth -= 1;
                        i += 1;
                        if depth == 0 {
                            return Some(i);
                        }
                    }
                    _ => i += 1,
                }
            }
        }
        _ => {
            // number / true / false / null — runs until a structural char.
            let mut i = i;
            while i < bytes.len() && !matches!(bytes[i], b',' | b'}' | b']') {
                i += 1;
            }
            Some(i)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_flat_result() {
        let line = r#"{"id":7,"result":"pong"}"#;
        assert_eq!(extract_id(line), Some(7));
        assert_eq!(extract_field_raw(line, "result"), Some("\"pong\""));
    }

    #[test]
    fn extracts_nested_result_without_parsing() {
        let line = r#"{"id":3,"result":{"width":1920,"height":1080,"bytes":"AAAA"}}"#;
        assert_eq!(extract_id(line), Some(3));
        let raw = extract_field_raw(line, "result").unwrap();
        assert_eq!(raw, r#"{"width":1920,"height":1080,"bytes":"AAAA"}"#);
    }

    #[test]
    fn extracts_error_string() {
        let line = r#"{"id":9,"error":"boom \"quoted\" text"}"#;
        assert_eq!(extract_error(line), Some("boom \"quoted\" text".to_string()));
    }

    #[test]
    fn commas_and_braces_inside_strings_do_not_confuse_the_scanner() {
        let line = r#"{"id":1,"result":"a, b} c{","done":true}"#;
        assert_eq!(extract_field_raw(line, "result"), Some(r#""a, b} c{""#));
        assert_eq!(extract_field_raw(line, "done"), Some("true"));
    }

    #[test]
    fn missing_key_returns_none() {
        let line = r#"{"id":1,"result":null}"#;
        assert_eq!(extract_field_raw(line, "error"), None);
    }

    #[test]
    fn malformed_json_returns_none_rather_than_panicking() {
        assert_eq!(extract_field_raw("not json", "id"), None);
        assert_eq!(extract_field_raw("{\"id\":", "id"), None);
    }
}
