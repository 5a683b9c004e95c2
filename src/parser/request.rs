//! HTTP request parsing and representation.

use std::collections::HashMap;
use std::str::FromStr;
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use url::{form_urlencoded, Url};

use crate::parser::error::Error;
use crate::parser::method::is_token;
use crate::parser::version::HttpVersion;

/// Represents an HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The method token exactly as sent (GET, POST, etc.)
    pub method: String,
    /// The percent-decoded request path, without the query string
    pub path: String,
    /// The path exactly as it appeared in the request target
    pub raw_path: String,
    /// The raw query string, if the target had one
    pub query: Option<String>,
    /// The HTTP version
    pub version: HttpVersion,
    /// Header names (lowercase) mapped to their values
    pub headers: HashMap<String, String>,
    /// The request body
    pub body: Vec<u8>,
    /// Query parameters parsed from the query string
    pub query_params: HashMap<String, String>,
}

impl HttpRequest {
    /// Create a new HTTP request with an empty body.
    ///
    /// `target` is an origin-form request target. Anything after the first
    /// `?` becomes the query string; the rest is percent-decoded into the
    /// path that routing matches on.
    pub fn new(
        method: impl Into<String>,
        target: &str,
        version: HttpVersion,
        headers: HashMap<String, String>,
    ) -> Self {
        let (raw_path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        let path = percent_decode_str(&raw_path).decode_utf8_lossy().into_owned();

        let query_params = query
            .as_deref()
            .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        Self {
            method: method.into(),
            path,
            raw_path,
            query,
            version,
            headers,
            body: Vec::new(),
            query_params,
        }
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Check if a header exists (case-insensitive).
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// The declared body length. A missing header means no body.
    pub fn content_length(&self) -> Result<usize, Error> {
        match self.get_header("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::InvalidContentLength(value.clone())),
            None => Ok(0),
        }
    }

    /// Whether the client expects the connection to stay open after the
    /// response.
    pub fn keep_alive(&self) -> bool {
        let connection = self.get_header("Connection").map(|v| v.to_ascii_lowercase());
        match connection.as_deref() {
            Some(v) if v.split(',').any(|t| t.trim() == "close") => false,
            Some(v) if v.split(',').any(|t| t.trim() == "keep-alive") => true,
            _ => self.version.keeps_alive_by_default(),
        }
    }

    /// Parse the request body as JSON.
    ///
    /// Fails with [`Error::MissingHeader`] unless the Content-Type is
    /// `application/json`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        if !self.is_json() {
            return Err(Error::MissingHeader("Content-Type: application/json".to_string()));
        }

        let json = serde_json::from_slice(&self.body)?;
        Ok(json)
    }

    /// Check if the Content-Type header is application/json.
    pub fn is_json(&self) -> bool {
        self.get_header("Content-Type")
            .is_some_and(|content_type| content_type.starts_with("application/json"))
    }

    /// Get a query parameter value.
    pub fn get_query_param(&self, name: &str) -> Option<&String> {
        self.query_params.get(name)
    }

    /// Check if a query parameter exists.
    pub fn has_query_param(&self, name: &str) -> bool {
        self.query_params.contains_key(name)
    }
}

/// Locate the end of the request head.
///
/// Returns the offset just past the blank line that terminates the headers,
/// accepting both CRLF and bare LF line endings.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some(i + 2),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Parse a request line and headers.
///
/// The returned request has an empty body; the caller reads
/// [`HttpRequest::content_length`] bytes after the head.
pub fn parse_head(input: &[u8]) -> Result<HttpRequest, Error> {
    if input.is_empty() {
        return Err(Error::EmptyRequest);
    }

    let input_str = String::from_utf8_lossy(input);

    // Tolerate leading blank lines before the request line (RFC 9112, section 2.2)
    let mut lines = input_str
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .skip_while(|line| line.is_empty());

    let request_line = lines.next().ok_or(Error::EmptyRequest)?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(Error::MalformedRequestLine(request_line.to_string()));
    }

    let method = parts[0];
    if !is_token(method) {
        return Err(Error::InvalidMethod(method.to_string()));
    }

    let target = match parts[1] {
        target if target.starts_with('/') || target == "*" => target.to_string(),
        target => origin_form(target).ok_or_else(|| Error::InvalidPath(target.to_string()))?,
    };
    if !has_valid_escapes(&target) {
        return Err(Error::InvalidPath(target));
    }

    let version = HttpVersion::from_str(parts[2])?;

    let mut headers = HashMap::new();
    for line in lines {
        // Empty line indicates the end of headers
        if line.is_empty() {
            break;
        }

        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
            _ => return Err(Error::InvalidHeaderFormat(line.to_string())),
        }
    }

    // Host is only required for HTTP/1.1
    if version == HttpVersion::Http11 && !headers.contains_key("host") {
        return Err(Error::MissingHeader("Host".to_string()));
    }

    Ok(HttpRequest::new(method, &target, version, headers))
}

/// Reduce an absolute-form target (`http://host/path?query`) to its path and
/// query.
fn origin_form(target: &str) -> Option<String> {
    let url = Url::parse(target).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    match url.query() {
        Some(query) => Some(format!("{}?{query}", url.path())),
        None => Some(url.path().to_string()),
    }
}

/// Every `%` must start a two-digit hex escape.
fn has_valid_escapes(target: &str) -> bool {
    let bytes = target.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match bytes.get(i + 1..i + 3) {
                Some([hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => i += 3,
                _ => return false,
            }
        } else {
            i += 1;
        }
    }
    true
}

/// Parse a complete HTTP request from a byte slice.
///
/// Bytes after the head are taken as the body, truncated to the declared
/// Content-Length.
pub fn parse_request(input: &[u8]) -> Result<HttpRequest, Error> {
    let head_end = find_head_end(input).unwrap_or(input.len());
    let mut request = parse_head(&input[..head_end])?;

    let rest = &input[head_end..];
    let body_len = request.content_length()?.min(rest.len());
    request.body = rest[..body_len].to_vec();

    Ok(request)
}
