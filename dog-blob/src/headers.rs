//! Mapping between [`BlobMetadata`] and standard HTTP headers.
//!
//! Every hop speaks the same convention: `Content-Type`,
//! `Content-Disposition` and, when known, `Content-Length`.

use http::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{BlobMetadata, DEFAULT_MEDIA_TYPE};

/// Name used when neither the key nor the headers yield one.
pub const FALLBACK_NAME: &str = "download";

/// Final path segment of a store key.
pub fn name_from_key(key: &str) -> &str {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(FALLBACK_NAME)
}

/// `attachment; filename="<name>"`, with an RFC 5987 `filename*` added
/// for names that are not plain printable ASCII.
pub fn attachment_disposition(name: &str) -> String {
    let plain = name.chars().all(|c| c.is_ascii_graphic() || c == ' ');
    if plain {
        return format!("attachment; filename=\"{}\"", escape_quoted(name));
    }

    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        escape_quoted(&fallback),
        utf8_percent_encode(name, ATTR_CHAR)
    )
}

/// Extract the filename parameter from a Content-Disposition value.
/// `filename*` wins over `filename` when both are present.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for param in split_params(value) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();
        if key == "filename*" {
            if let Some(decoded) = decode_ext_value(raw) {
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if key == "filename" {
            let unquoted = unquote(raw);
            if !unquoted.is_empty() {
                plain = Some(unquoted);
            }
        }
    }
    plain
}

/// Headers describing `metadata`. Values that cannot be encoded fall
/// back to the defaults rather than failing the transfer.
pub fn metadata_headers(metadata: &BlobMetadata) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_type = HeaderValue::from_str(&metadata.media_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MEDIA_TYPE));
    headers.insert(CONTENT_TYPE, content_type);

    let disposition = HeaderValue::from_str(&metadata.disposition).or_else(|_| {
        HeaderValue::from_str(&attachment_disposition(&metadata.name))
    });
    if let Ok(disposition) = disposition {
        headers.insert(CONTENT_DISPOSITION, disposition);
    }

    if let Some(len) = metadata.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    headers
}

/// Rebuild metadata from headers received over the wire. `fallback_name`
/// is used when the disposition carries no filename.
pub fn metadata_from_headers(headers: &HeaderMap, fallback_name: &str) -> BlobMetadata {
    merge_headers(BlobMetadata::new(fallback_name), headers)
}

/// Overlay whatever `headers` carry onto `base`. Absent headers keep the
/// base values; the length is always taken from the headers, since a
/// peer that streams back without one has not promised a size.
pub fn merge_headers(base: BlobMetadata, headers: &HeaderMap) -> BlobMetadata {
    let disposition = header_str(headers, CONTENT_DISPOSITION.as_str());
    let metadata = match disposition.and_then(filename_from_disposition) {
        Some(name) if name != base.name => base.with_name(name),
        _ => base,
    };

    metadata
        .with_media_type(header_str(headers, CONTENT_TYPE.as_str()))
        .with_disposition(disposition)
        .with_content_length(content_length(headers))
}

/// Parsed `Content-Length`, if present and well formed.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

// Split on `;` outside of quoted strings.
fn split_params(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

// `attr-char` of RFC 5987 passes through; everything else is encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

// `UTF-8''<pct-encoded>`; other charsets are ignored.
fn decode_ext_value(raw: &str) -> Option<String> {
    let (charset, rest) = raw.split_once('\'')?;
    let (_lang, encoded) = rest.split_once('\'')?;
    if !charset.eq_ignore_ascii_case("utf-8") {
        return None;
    }
    percent_decode_str(encoded).decode_utf8().ok().map(|name| name.into_owned())
}
