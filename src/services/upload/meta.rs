use super::UploadError;
use axum::http::HeaderMap;
use percent_encoding::percent_decode_str;
use std::path::Path;
use std::str::FromStr;

/// Header carrying a local path to read the body from instead of the request.
pub const LOCAL_SOURCE_HEADER: &str = "x-file";

/// The raw, still unparsed transfer headers of one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferHeaders {
    pub content_type: Option<String>,
    pub content_range: Option<String>,
    pub content_disposition: Option<String>,
    pub local_source: Option<String>,
    pub sid: Option<String>,
}

impl TransferHeaders {
    pub fn from_http(headers: &HeaderMap, sid: Option<String>) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            content_type: get("content-type"),
            content_range: get("content-range"),
            content_disposition: get("content-disposition"),
            local_source: get(LOCAL_SOURCE_HEADER),
            sid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    OctetStream,
    Multipart { boundary: String },
}

/// `Content-Range: bytes <start>-<end>/<total>`, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ContentRange {
    pub fn new(start: u64, end: u64, total: u64) -> Result<Self, UploadError> {
        if start > end || end >= total {
            return Err(UploadError::MalformedContentRange(format!(
                "bytes {}-{}/{} is out of bounds",
                start, end, total
            )));
        }
        Ok(Self { start, end, total })
    }

    /// Number of bytes this range carries.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl FromStr for ContentRange {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || UploadError::MalformedContentRange(s.to_string());

        let spec = s.trim().strip_prefix("bytes").ok_or_else(malformed)?;
        let spec = spec.trim_start();
        let (range, total) = spec.split_once('/').ok_or_else(malformed)?;
        let (start, end) = range.split_once('-').ok_or_else(malformed)?;

        let number = |v: &str| v.trim().parse::<u64>().map_err(|_| malformed());
        Self::new(number(start)?, number(end)?, number(total)?)
    }
}

/// Transfer metadata, parsed once per inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub filename: Option<String>,
    pub media_type: MediaType,
    pub range: Option<ContentRange>,
    pub sid: String,
}

impl TransferMeta {
    pub fn parse(headers: &TransferHeaders) -> Result<Self, UploadError> {
        let media_type = parse_content_type(headers.content_type.as_deref())?;
        let range = headers
            .content_range
            .as_deref()
            .map(str::parse::<ContentRange>)
            .transpose()?;
        let filename = headers
            .content_disposition
            .as_deref()
            .map(parse_content_disposition)
            .transpose()?;
        let sid = headers
            .sid
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(UploadError::MissingSessionId)?
            .to_string();

        if media_type == MediaType::OctetStream && filename.is_none() {
            return Err(UploadError::MissingFilename);
        }

        Ok(Self {
            filename,
            media_type,
            range,
            sid,
        })
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.media_type, MediaType::Multipart { .. })
    }
}

/// Anything that is not `multipart/form-data` is treated as a raw octet stream.
pub fn parse_content_type(value: Option<&str>) -> Result<MediaType, UploadError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(MediaType::OctetStream);
    };

    let parsed: mime::Mime = value
        .parse()
        .map_err(|e: mime::FromStrError| UploadError::MalformedContentType(e.to_string()))?;

    if parsed.type_() == mime::MULTIPART && parsed.subtype() == mime::FORM_DATA {
        let boundary = parsed
            .get_param(mime::BOUNDARY)
            .map(|b| b.as_str().to_string())
            .filter(|b| !b.is_empty())
            .ok_or(UploadError::MissingBoundary)?;
        return Ok(MediaType::Multipart { boundary });
    }

    Ok(MediaType::OctetStream)
}

/// Extracts the filename from a Content-Disposition value. `filename*` wins over `filename`.
pub fn parse_content_disposition(value: &str) -> Result<String, UploadError> {
    let malformed = |why: &str| UploadError::MalformedContentDisposition(format!("{}: {}", why, value));

    let mut segments = split_params(value).into_iter();
    let disposition = segments.next().unwrap_or_default();
    if disposition.is_empty() || !disposition.chars().all(is_token_char) {
        return Err(malformed("invalid disposition type"));
    }

    let mut plain = None;
    let mut extended = None;
    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        let (key, raw) = segment
            .split_once('=')
            .ok_or_else(|| malformed("parameter without value"))?;
        match key.trim().to_ascii_lowercase().as_str() {
            "filename" => plain = Some(unquote(raw.trim())),
            "filename*" => extended = Some(decode_ext_value(raw.trim()).ok_or_else(|| malformed("bad filename*"))?),
            _ => {}
        }
    }

    extended
        .or(plain)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.is_empty())
        .ok_or(UploadError::MissingFilename)
}

/// Keeps only the final path component so a filename can never escape its directory.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match Path::new(last).file_name().and_then(|n| n.to_str()) {
        Some(n) if n != ".." => n.to_string(),
        _ => String::new(),
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// Splits on `;` outside of quoted strings.
fn split_params(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in value.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ';' if !in_quotes => parts.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

fn unquote(raw: &str) -> String {
    let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) else {
        return raw.to_string();
    };
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
}

/// RFC 5987 `charset'lang'pct-encoded`. Only UTF-8 and ISO-8859-1 are accepted.
fn decode_ext_value(raw: &str) -> Option<String> {
    let mut pieces = raw.splitn(3, '\'');
    let charset = pieces.next()?.to_ascii_lowercase();
    let _lang = pieces.next()?;
    let encoded = pieces.next()?;
    let bytes: Vec<u8> = percent_decode_str(encoded).collect();
    match charset.as_str() {
        "utf-8" => String::from_utf8(bytes).ok(),
        "iso-8859-1" => Some(bytes.into_iter().map(char::from).collect()),
        _ => None,
    }
}
