//! Minimal `multipart/form-data` parsing for the audio endpoints.
//!
//! The transcription form carries small text fields (`model`, `language`,
//! `prompt`, `response_format`, `temperature`) plus one file part.  This
//! parser splits the body on the boundary from the Content-Type header,
//! reads each part's `Content-Disposition` for `name`/`filename`, and
//! hands back text fields and the file bytes.  The raw body is preserved
//! separately for callbacks that want the whole thing.

use std::collections::HashMap;

use bytes::Bytes;

/// Parsed multipart form: text fields plus at most one file part.
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub fields: HashMap<String, String>,
    pub file_name: Option<String>,
    pub file_bytes: Option<Bytes>,
}

impl MultipartForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Extract `boundary=...` from a `multipart/form-data` Content-Type value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let param = param.trim();
        let value = param.strip_prefix("boundary=")?;
        Some(value.trim_matches('"').to_owned())
    })
}

/// Parse a multipart body.  Unknown or malformed parts are skipped rather
/// than failing the whole request; `None` only when no boundary delimiter
/// is found at all.
pub fn parse(body: &Bytes, boundary: &str) -> Option<MultipartForm> {
    let delimiter = format!("--{boundary}");
    let data: &[u8] = body;

    let mut form = MultipartForm::default();
    let mut found_any = false;

    let mut pos = 0usize;
    while let Some(start) = find(data, pos, delimiter.as_bytes()) {
        let after = start + delimiter.len();
        // Closing delimiter is "--boundary--".
        if data[after..].starts_with(b"--") {
            found_any = true;
            break;
        }
        // Skip the CRLF after the delimiter line.
        let part_start = match find(data, after, b"\r\n") {
            Some(i) => i + 2,
            None => break,
        };
        let part_end = match find(data, part_start, delimiter.as_bytes()) {
            Some(i) => i,
            None => break,
        };
        found_any = true;
        parse_part(&data[part_start..part_end], body, part_start, &mut form);
        pos = part_end;
    }

    found_any.then_some(form)
}

/// One part: headers, blank line, content (trailing CRLF belongs to the
/// delimiter line and is trimmed).
fn parse_part(part: &[u8], body: &Bytes, part_offset: usize, form: &mut MultipartForm) {
    let Some(header_end) = find(part, 0, b"\r\n\r\n") else {
        return;
    };
    let headers = String::from_utf8_lossy(&part[..header_end]);

    let mut name = None;
    let mut filename = None;
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-disposition:") {
            name = header_param(line, "name");
            filename = header_param(line, "filename");
        }
    }
    let Some(name) = name else { return };

    let content_start = header_end + 4;
    let mut content_end = part.len();
    if part[..content_end].ends_with(b"\r\n") {
        content_end -= 2;
    }

    if filename.is_some() {
        form.file_name = filename;
        // Slice out of the original Bytes so the audio payload is not copied.
        form.file_bytes = Some(body.slice(part_offset + content_start..part_offset + content_end));
    } else {
        let value = String::from_utf8_lossy(&part[content_start..content_end]).into_owned();
        form.fields.insert(name, value);
    }
}

/// `param="value"` extraction from a Content-Disposition line.
fn header_param(line: &str, param: &str) -> Option<String> {
    let needle = format!("{param}=\"");
    let start = line.find(&needle)? + needle.len();
    let end = line[start..].find('"')? + start;
    Some(line[start..end].to_owned())
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
