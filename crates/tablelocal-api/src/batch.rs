//! `multipart/mixed` codec for `$batch` requests.
//!
//! A batch body holds either one changeset (itself `multipart/mixed`) with the
//! write operations, or a single bare `application/http` part for a point
//! read. Every `application/http` part wraps a complete HTTP/1.1 request.
//! Line endings may be CRLF or bare LF.

use crate::resource::path_and_query;
use axum::http::{Method, StatusCode};
use tablelocal_common::{Error, Result};
use uuid::Uuid;

/// One HTTP request embedded in a batch body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRequest {
    pub method: Method,
    /// Path and query, scheme and authority removed
    pub target: String,
    /// Header names are lowercased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SubRequest {
    /// Case-insensitive header lookup
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

/// Parsed batch body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub requests: Vec<SubRequest>,
    /// Whether the requests arrived inside a changeset
    pub changeset: bool,
}

/// One HTTP response to embed in the batch response
#[derive(Debug, Clone)]
pub struct SubResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SubResponse {
    #[must_use]
    pub const fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, content_type: &str, body: String) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body;
        self
    }
}

/// Encoded batch response
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub content_type: String,
    pub body: String,
}

/// Extract the boundary parameter of a `multipart/mixed` content type
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or_default().trim();
    if !mime.eq_ignore_ascii_case("multipart/mixed") {
        return Err(Error::invalid_input(format!(
            "batch content type must be multipart/mixed, got {mime}"
        )));
    }
    params
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|boundary| !boundary.is_empty())
        .ok_or_else(|| Error::invalid_input("multipart content type has no boundary"))
}

/// Parse a batch body delimited by `boundary`
pub fn parse_batch(body: &[u8], boundary: &str) -> Result<BatchRequest> {
    let body = std::str::from_utf8(body)
        .map_err(|_| Error::invalid_input("batch body is not valid UTF-8"))?;

    let mut requests = Vec::new();
    let mut changeset = false;
    for part in split_parts(body, boundary)? {
        let (head, content) = split_head(part);
        let headers = parse_headers(head)?;
        let content_type = lookup(&headers, "content-type").unwrap_or_default();

        if content_type.to_ascii_lowercase().starts_with("multipart/mixed") {
            if changeset {
                return Err(Error::invalid_input("a batch may hold only one changeset"));
            }
            changeset = true;
            let inner = boundary_from_content_type(content_type)?;
            for inner_part in split_parts(content, &inner)? {
                let (inner_head, inner_content) = split_head(inner_part);
                expect_http_part(&parse_headers(inner_head)?)?;
                requests.push(parse_http_request(inner_content)?);
            }
        } else {
            expect_http_part(&headers)?;
            requests.push(parse_http_request(content)?);
        }
    }

    Ok(BatchRequest {
        requests,
        changeset,
    })
}

/// Encode the responses of a batch. Writes are wrapped in a changeset
/// response; a point read is returned as a bare part.
#[must_use]
pub fn write_batch_response(responses: &[SubResponse], changeset: bool) -> BatchResponse {
    let batch_boundary = format!("batchresponse_{}", Uuid::new_v4());
    let mut body = String::new();

    if changeset {
        let changeset_boundary = format!("changesetresponse_{}", Uuid::new_v4());
        body.push_str(&format!("--{batch_boundary}\r\n"));
        body.push_str(&format!(
            "Content-Type: multipart/mixed; boundary={changeset_boundary}\r\n\r\n"
        ));
        for response in responses {
            body.push_str(&format!("--{changeset_boundary}\r\n"));
            write_http_part(&mut body, response);
        }
        body.push_str(&format!("--{changeset_boundary}--\r\n"));
    } else {
        for response in responses {
            body.push_str(&format!("--{batch_boundary}\r\n"));
            write_http_part(&mut body, response);
        }
    }
    body.push_str(&format!("--{batch_boundary}--\r\n"));

    BatchResponse {
        content_type: format!("multipart/mixed; boundary={batch_boundary}"),
        body,
    }
}

fn write_http_part(out: &mut String, response: &SubResponse) {
    out.push_str("Content-Type: application/http\r\n");
    out.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
    out.push_str(&format!(
        "HTTP/1.1 {} {}\r\n",
        response.status.as_u16(),
        response.status.canonical_reason().unwrap_or_default()
    ));
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    if !response.body.is_empty() {
        out.push_str(&response.body);
        out.push_str("\r\n");
    }
}

/// Split a multipart body into the contents of its parts
fn split_parts<'a>(body: &'a str, boundary: &str) -> Result<Vec<&'a str>> {
    let delimiter = format!("--{boundary}");
    let mut sections = body.split(delimiter.as_str());
    // preamble
    sections.next();

    let mut parts = Vec::new();
    for section in sections {
        if section.starts_with("--") {
            return Ok(parts);
        }
        // The rest of the delimiter line, then the part up to the line break
        // that belongs to the next delimiter.
        let section = section.find('\n').map_or("", |eol| &section[eol + 1..]);
        let section = section
            .strip_suffix("\r\n")
            .or_else(|| section.strip_suffix('\n'))
            .unwrap_or(section);
        parts.push(section);
    }
    Err(Error::invalid_input(format!(
        "multipart body has no closing delimiter for {boundary}"
    )))
}

/// Split at the first blank line into (headers, content)
fn split_head(part: &str) -> (&str, &str) {
    if part.starts_with("\r\n") {
        return ("", &part[2..]);
    }
    if part.starts_with('\n') {
        return ("", &part[1..]);
    }
    match (part.find("\r\n\r\n"), part.find("\n\n")) {
        (Some(crlf), Some(lf)) if lf < crlf => (&part[..lf], &part[lf + 2..]),
        (Some(crlf), _) => (&part[..crlf], &part[crlf + 4..]),
        (None, Some(lf)) => (&part[..lf], &part[lf + 2..]),
        (None, None) => (part, ""),
    }
}

fn parse_headers(head: &str) -> Result<Vec<(String, String)>> {
    head.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
                .ok_or_else(|| Error::invalid_input(format!("malformed header line: {line}")))
        })
        .collect()
}

fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn expect_http_part(headers: &[(String, String)]) -> Result<()> {
    match lookup(headers, "content-type") {
        Some(ct) if ct.to_ascii_lowercase().starts_with("application/http") => Ok(()),
        other => Err(Error::invalid_input(format!(
            "batch part must be application/http, got {}",
            other.unwrap_or("no content type")
        ))),
    }
}

fn parse_http_request(content: &str) -> Result<SubRequest> {
    let content = content.trim_start_matches(['\r', '\n']);
    let (request_line, rest) = content
        .split_once('\n')
        .unwrap_or((content, ""));
    let request_line = request_line.trim_end_matches('\r');

    let mut words = request_line.split_whitespace();
    let (Some(method), Some(url)) = (words.next(), words.next()) else {
        return Err(Error::invalid_input(format!(
            "malformed request line in batch: {request_line}"
        )));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::invalid_input(format!("invalid method in batch: {method}")))?;

    let (head, body) = if rest.starts_with("\r\n") || rest.starts_with('\n') || rest.is_empty() {
        ("", rest.trim_start_matches(['\r', '\n']))
    } else {
        split_head(rest)
    };

    Ok(SubRequest {
        method,
        target: path_and_query(url).to_string(),
        headers: parse_headers(head)?,
        body: body.trim_end_matches(['\r', '\n']).as_bytes().to_vec(),
    })
}
