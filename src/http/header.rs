//! HTTP message header: incremental parse, normalization, composition, and
//! the common field helpers.
//!
//! ```text
//! generic-message = start-line *(message-header CRLF) CRLF [ body ]
//! start-line      = Request-Line | Status-Line
//! Request-Line    = Method SP Request-URI SP HTTP-Version CRLF
//! Status-Line     = HTTP-Version SP Status-Code SP Reason-Phrase CRLF
//! message-header  = field-name ":" [ field-value ]
//! ```
//!
//! Parsing is incremental: call the `parse_*` entry point whenever bytes
//! arrive until it returns true. Errors are ranked; the worst one seen so
//! far is retained and the caller decides how bad is too bad. Wire junk
//! shows up in all shapes, so nothing here trusts NUL-terminated strings or
//! a single parse pass.

use std::collections::BTreeMap;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::consts::*;
use crate::stream::MemoryStream;

/// Parse outcomes, ordered by severity; the header keeps the max seen.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum ParseError {
    #[default]
    Init = 0,
    /// Reached the final CRLF with everything in order.
    Ok,
    /// More bytes needed.
    NoData,
    /// A field with an invalid name or content.
    BadFieldSpec,
    /// A line with no identifiable field (no `:`).
    NoField,
    /// Status line without a reason phrase (HTTP/1.1 only).
    NoStatusReason,
    /// Request line without a version.
    NoRequestVersion,
    /// Unparsable status code.
    InvalidStatusCode,
    /// Status line without a code.
    NoStatusCode,
    /// Request line without a URI.
    NoRequestUri,
}

impl ParseError {
    pub fn name(self) -> &'static str {
        match self {
            ParseError::Init => "READ_INIT",
            ParseError::Ok => "READ_OK",
            ParseError::NoData => "READ_NO_DATA",
            ParseError::BadFieldSpec => "READ_BAD_FIELD_SPEC",
            ParseError::NoField => "READ_NO_FIELD",
            ParseError::NoStatusReason => "READ_NO_STATUS_REASON",
            ParseError::NoRequestVersion => "READ_NO_REQUEST_VERSION",
            ParseError::InvalidStatusCode => "READ_INVALID_STATUS_CODE",
            ParseError::NoStatusCode => "READ_NO_STATUS_CODE",
            ParseError::NoRequestUri => "READ_NO_REQUEST_URI",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FirstLineType {
    #[default]
    Unknown,
    Request,
    Status,
    /// The first line was consumed but could not be fully made sense of.
    Error,
}

pub type FieldMap = BTreeMap<String, String>;

pub struct Header {
    /// Strict mode refuses to record fields with invalid names/content.
    is_strict: bool,
    bytes_parsed: usize,
    parse_error: ParseError,
    last_parse_error: ParseError,
    pending_name: String,
    pending_value: String,

    version: HttpVersion,
    method: HttpMethod,
    status_code: StatusCode,
    uri: String,
    reason: String,
    first_line_type: FirstLineType,

    fields: FieldMap,
    verbatim: String,
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl Header {
    pub fn new(is_strict: bool) -> Self {
        Self {
            is_strict,
            bytes_parsed: 0,
            parse_error: ParseError::Init,
            last_parse_error: ParseError::Init,
            pending_name: String::new(),
            pending_value: String::new(),
            version: HttpVersion::Unknown,
            method: HttpMethod::Unknown,
            status_code: StatusCode::UNKNOWN,
            uri: String::new(),
            reason: String::new(),
            first_line_type: FirstLineType::Unknown,
            fields: FieldMap::new(),
            verbatim: String::new(),
        }
    }

    /// Back to a fresh sheet; always call before parsing a new header.
    pub fn clear(&mut self) {
        self.bytes_parsed = 0;
        self.parse_error = ParseError::Init;
        self.last_parse_error = ParseError::Init;
        self.pending_name.clear();
        self.pending_value.clear();
        self.version = HttpVersion::Unknown;
        self.method = HttpMethod::Unknown;
        self.status_code = StatusCode::UNKNOWN;
        self.uri.clear();
        self.reason.clear();
        self.first_line_type = FirstLineType::Unknown;
        self.fields.clear();
        self.verbatim.clear();
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn bytes_parsed(&self) -> usize {
        self.bytes_parsed
    }

    /// Worst error seen since the last clear.
    pub fn parse_error(&self) -> ParseError {
        self.parse_error
    }

    pub fn last_parse_error(&self) -> ParseError {
        self.last_parse_error
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn http_version(&self) -> HttpVersion {
        self.version
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn first_line_type(&self) -> FirstLineType {
        self.first_line_type
    }

    pub fn set_http_version(&mut self, version: HttpVersion) {
        self.version = version;
    }

    pub fn set_method(&mut self, method: HttpMethod) {
        self.method = method;
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    pub fn set_status_code(&mut self, code: StatusCode) {
        self.status_code = code;
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub fn set_first_line_type(&mut self, flt: FirstLineType) {
        self.first_line_type = flt;
    }

    /// Verbatim text appended after the fields, before the final CRLF.
    pub fn set_verbatim(&mut self, verbatim: impl Into<String>) {
        self.verbatim = verbatim.into();
    }

    // ── First-line preparation ──────────────────────────────────────────────

    pub fn prepare_status_line(&mut self, code: StatusCode, version: HttpVersion) {
        self.first_line_type = FirstLineType::Status;
        self.status_code = code;
        self.reason = code.description().to_owned();
        self.version = version;
    }

    pub fn prepare_request_line(&mut self, uri: &str, method: HttpMethod, version: HttpVersion) {
        self.first_line_type = FirstLineType::Request;
        self.uri = uri.to_owned();
        self.method = method;
        self.version = version;
    }

    // ── Field validity and normalization ────────────────────────────────────

    /// Name: token chars, internal (not leading) LWS tolerated.
    pub fn is_valid_field_name(name: &[u8]) -> bool {
        let mut valid = false;
        for (i, &b) in name.iter().enumerate() {
            if !is_token_char(b) && (!is_lws_char(b) || i == 0) {
                return false;
            }
            valid = true;
        }
        valid
    }

    /// Content: anything but CTLs (LWS excepted). Empty is fine.
    pub fn is_valid_field_content(content: &[u8]) -> bool {
        content.iter().all(|&b| !is_ctl_char(b) || is_lws_char(b))
    }

    /// `content-lengTH` → `Content-Length`: trim LWS, lowercase, then
    /// upcase the first letter of each dash-separated word; internal
    /// whitespace becomes a dash.
    pub fn normalize_field_name(name: &str) -> String {
        let trimmed = name.trim_matches(|c| c == ' ' || c == '\t');
        let mut out = String::with_capacity(trimmed.len());
        let mut upcase = true;
        for c in trimmed.chars() {
            if c.is_ascii_alphabetic() {
                if upcase {
                    upcase = false;
                    out.push(c.to_ascii_uppercase());
                } else {
                    out.push(c.to_ascii_lowercase());
                }
            } else {
                upcase = true;
                out.push(if c == ' ' || c == '\t' { '-' } else { c });
            }
        }
        out
    }

    // ── Field map operations ────────────────────────────────────────────────

    /// Records a field under its normalized name. Duplicate adds merge with
    /// `", "` unless `replace` (or the previous content was empty).
    /// Invalid names or content are refused.
    pub fn add_field(&mut self, name: &str, content: &str, replace: bool) -> bool {
        if !Self::is_valid_field_name(name.as_bytes())
            || !Self::is_valid_field_content(content.as_bytes())
        {
            return false;
        }
        let normalized = Self::normalize_field_name(name);
        match self.fields.get_mut(&normalized) {
            None => {
                self.fields.insert(normalized, content.to_owned());
            }
            Some(existing) if replace || existing.is_empty() => {
                *existing = content.to_owned();
            }
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(content);
            }
        }
        true
    }

    pub fn clear_field(&mut self, name: &str) -> bool {
        self.fields.remove(&Self::normalize_field_name(name)).is_some()
    }

    pub fn find_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Copies fields (only) from `src`; returns how many were accepted.
    pub fn copy_header_fields(&mut self, src: &Header, replace: bool) -> usize {
        let mut copied = 0;
        for (name, content) in &src.fields {
            if self.add_field(name, content, replace) {
                copied += 1;
            }
        }
        copied
    }

    /// Copies fields and the first-line components from `src`.
    pub fn copy_headers(&mut self, src: &Header, replace: bool) -> usize {
        let copied = self.copy_header_fields(src, replace);
        self.version = src.version;
        self.method = src.method;
        self.status_code = src.status_code;
        self.uri = src.uri.clone();
        self.reason = src.reason.clone();
        self.first_line_type = src.first_line_type;
        copied
    }

    // ── Composition ─────────────────────────────────────────────────────────

    /// First line from the stored components; empty for unknown/error line
    /// types.
    pub fn compose_first_line(&self) -> String {
        match self.first_line_type {
            FirstLineType::Request => format!(
                "{} {} {}\r\n",
                self.method.name(),
                self.uri,
                self.version.name()
            ),
            FirstLineType::Status => format!(
                "{} {} {}\r\n",
                self.version.name(),
                self.status_code.as_u16(),
                self.reason
            ),
            _ => String::new(),
        }
    }

    /// Writes first line, each field as `Name: Value CRLF`, the verbatim
    /// trailer, then the terminating CRLF.
    pub fn append_to_stream(&self, io: &mut MemoryStream) {
        io.write(self.compose_first_line().as_bytes());
        for (name, content) in &self.fields {
            io.write(name.as_bytes());
            io.write(b": ");
            io.write(content.as_bytes());
            io.write(b"\r\n");
        }
        if !self.verbatim.is_empty() {
            io.write(self.verbatim.as_bytes());
        }
        io.write(b"\r\n");
    }

    pub fn to_text(&self) -> String {
        let mut io = MemoryStream::new();
        self.append_to_stream(&mut io);
        lossy(&io.read_all())
    }

    // ── Parsing ─────────────────────────────────────────────────────────────

    fn set_parse_error(&mut self, error: ParseError) {
        self.last_parse_error = error;
        self.parse_error = self.parse_error.max(error);
    }

    /// Parses a request header; call repeatedly as data arrives until true.
    /// The read pointer advances over whatever was consumed.
    pub fn parse_http_request(&mut self, io: &mut MemoryStream) -> bool {
        self.parse_header(io, FirstLineType::Request)
    }

    /// As above for a reply (status line first).
    pub fn parse_http_reply(&mut self, io: &mut MemoryStream) -> bool {
        self.parse_header(io, FirstLineType::Status)
    }

    fn parse_header(&mut self, io: &mut MemoryStream, expected: FirstLineType) -> bool {
        debug_assert_ne!(self.last_parse_error, ParseError::Ok, "parse after completion");
        if self.bytes_parsed == 0 {
            if !self.read_first_line(io, expected) {
                return false;
            }
        }
        self.read_header_fields(io)
    }

    fn read_first_line(&mut self, io: &mut MemoryStream, expected: FirstLineType) -> bool {
        let Some(raw) = io.read_crlf_line() else {
            self.set_parse_error(ParseError::NoData);
            return false;
        };
        self.bytes_parsed += raw.len();
        let line = lossy(&raw[..raw.len() - 2]);

        // Token 1: method (request) or version (status).
        let Some(sp1) = line.find(' ') else {
            self.first_line_type = FirstLineType::Error;
            if expected == FirstLineType::Request {
                self.set_parse_error(ParseError::NoRequestUri);
                self.method = HttpMethod::parse(&line);
            } else {
                self.set_parse_error(ParseError::NoStatusCode);
                self.version = HttpVersion::parse(&line);
            }
            return true; // the line was consumed; fields may still follow
        };
        if expected == FirstLineType::Request {
            self.method = HttpMethod::parse(&line[..sp1]);
        } else {
            self.version = HttpVersion::parse(&line[..sp1]);
        }
        let rest = line[sp1..].trim_start_matches(' ');

        // Token 2: URI (request) or status code.
        let Some(sp2) = rest.find(' ') else {
            if expected == FirstLineType::Request {
                self.first_line_type = FirstLineType::Error;
                self.set_parse_error(ParseError::NoRequestVersion);
                self.uri = rest.to_owned();
            } else {
                // A code with no reason phrase: tolerated up to HTTP/1.0.
                if self.version <= HttpVersion::V1_0 {
                    self.first_line_type = expected;
                } else {
                    self.first_line_type = FirstLineType::Error;
                    self.set_parse_error(ParseError::NoStatusReason);
                }
                self.parse_status_code(rest);
            }
            return true;
        };
        if expected == FirstLineType::Request {
            self.uri = rest[..sp2].to_owned();
        } else {
            self.parse_status_code(&rest[..sp2]);
        }
        let tail = rest[sp2..].trim_start_matches(' ');

        // Token 3: version (request) or reason phrase.
        if expected == FirstLineType::Request {
            self.version = HttpVersion::parse(tail);
        } else {
            self.reason = tail.to_owned();
        }
        self.first_line_type = expected;
        true
    }

    fn parse_status_code(&mut self, text: &str) {
        let digits: &str = {
            let end = text.bytes().take_while(u8::is_ascii_digit).count();
            &text[..end]
        };
        match digits.parse::<u16>() {
            Ok(code) if !digits.is_empty() => self.status_code = StatusCode(code),
            _ => {
                self.set_parse_error(ParseError::InvalidStatusCode);
                self.status_code = StatusCode::UNKNOWN;
            }
        }
    }

    /// Commits the field being accumulated (with its continuation lines).
    fn add_pending_field(&mut self) -> bool {
        let mut ok = true;
        if !self.pending_name.is_empty() {
            if !Self::is_valid_field_name(self.pending_name.as_bytes())
                || !Self::is_valid_field_content(self.pending_value.as_bytes())
            {
                self.set_parse_error(ParseError::BadFieldSpec);
                ok = false;
            }
            if !self.is_strict || ok {
                let normalized = Self::normalize_field_name(&self.pending_name);
                match self.fields.get_mut(&normalized) {
                    None => {
                        self.fields.insert(normalized, self.pending_value.clone());
                    }
                    Some(existing) => {
                        existing.push_str(", ");
                        existing.push_str(&self.pending_value);
                    }
                }
            }
        }
        self.pending_name.clear();
        self.pending_value.clear();
        ok
    }

    /// Reads field lines until the blank line. True once the header is
    /// complete; also usable standalone for chunked-transfer trailers.
    pub fn read_header_fields(&mut self, io: &mut MemoryStream) -> bool {
        while let Some(raw) = io.read_crlf_line() {
            self.bytes_parsed += raw.len();
            let line = &raw[..raw.len() - 2];

            if line.is_empty() {
                // The terminating CRLF.
                if self.add_pending_field() {
                    self.set_parse_error(ParseError::Ok);
                }
                return true;
            }
            let lws_end = line.iter().take_while(|&&b| is_lws_char(b)).count();
            if lws_end > 0 && !self.pending_name.is_empty() {
                // Continuation line: extends the previous field's value.
                self.pending_value.push(' ');
                self.pending_value.push_str(lossy(&line[lws_end..]).trim_end());
            } else {
                self.add_pending_field();
                match line.iter().position(|&b| b == b':') {
                    None => self.set_parse_error(ParseError::NoField),
                    Some(colon) => {
                        // Names and values travel LWS-trimmed.
                        self.pending_name = lossy(&line[..colon])
                            .trim_matches(|c| c == ' ' || c == '\t')
                            .to_owned();
                        self.pending_value =
                            lossy(&line[colon + 1..]).trim_matches(|c| c == ' ' || c == '\t').to_owned();
                    }
                }
            }
        }
        self.set_parse_error(ParseError::NoData);
        false
    }

    // ── Field helpers ───────────────────────────────────────────────────────

    fn field_starts_with(&self, field: &str, prefix: &str) -> bool {
        match self.find_field(field) {
            Some(value) => {
                let value = value.trim().as_bytes();
                value.len() >= prefix.len()
                    && value[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
            }
            None => false,
        }
    }

    pub fn is_chunked_transfer(&self) -> bool {
        self.field_starts_with(HEADER_TRANSFER_ENCODING, "chunked")
    }

    pub fn set_chunked_transfer(&mut self, chunked: bool) {
        if chunked {
            self.add_field(HEADER_TRANSFER_ENCODING, "chunked", true);
        } else {
            self.clear_field(HEADER_TRANSFER_ENCODING);
        }
    }

    pub fn is_gzip_content_encoding(&self) -> bool {
        self.field_starts_with(HEADER_CONTENT_ENCODING, "gzip")
    }

    pub fn is_deflate_content_encoding(&self) -> bool {
        self.field_starts_with(HEADER_CONTENT_ENCODING, "deflate")
    }

    pub fn set_content_encoding(&mut self, encoding: Option<&str>) {
        match encoding {
            Some(encoding) => {
                self.add_field(HEADER_CONTENT_ENCODING, encoding, true);
            }
            None => {
                self.clear_field(HEADER_CONTENT_ENCODING);
            }
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.field_starts_with(HEADER_CONNECTION, "keep-alive")
    }

    /// How much body makes sense absent a Content-Length.
    pub fn default_body_len(&self) -> i64 {
        match self.first_line_type {
            FirstLineType::Request
                if self.method == HttpMethod::Put || self.method == HttpMethod::Post =>
            {
                i64::MAX
            }
            FirstLineType::Status => i64::MAX,
            _ => 0,
        }
    }

    // ── Dates (RFC 822, RFC 850, asctime) ───────────────────────────────────

    pub fn get_date_field(&self, field: &str) -> Option<DateTime<Utc>> {
        const FORMATS: [&str; 3] = [
            // Sun, 06 Nov 1994 08:49:37 GMT  (RFC 822 / 1123)
            "%a, %d %b %Y %H:%M:%S GMT",
            // Sunday, 06-Nov-94 08:49:37 GMT (RFC 850 / 1036)
            "%A, %d-%b-%y %H:%M:%S GMT",
            // Sun Nov  6 08:49:37 1994       (asctime)
            "%a %b %e %H:%M:%S %Y",
        ];
        let value = self.find_field(field)?.trim();
        for format in FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
                return Some(Utc.from_utc_datetime(&dt));
            }
        }
        None
    }

    pub fn set_date_field(&mut self, field: &str, when: DateTime<Utc>) -> bool {
        let formatted = when.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        self.add_field(field, &formatted, true)
    }

    // ── Basic authorization ─────────────────────────────────────────────────

    /// Decodes `Authorization: Basic <base64(user:pass)>`.
    pub fn get_authorization_field(&self) -> Option<(String, String)> {
        let value = self.find_field(HEADER_AUTHORIZATION)?.trim();
        let (_scheme, encoded) = value.split_once(' ')?;
        let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
        let decoded = lossy(&decoded);
        let (user, passwd) = decoded.split_once(':')?;
        Some((user.to_owned(), passwd.to_owned()))
    }

    /// False when `user` contains a colon (unencodable).
    pub fn set_authorization_field(&mut self, user: &str, passwd: &str) -> bool {
        if user.contains(':') {
            return false;
        }
        let encoded = BASE64_STANDARD.encode(format!("{user}:{passwd}"));
        self.add_field(HEADER_AUTHORIZATION, &format!("Basic {encoded}"), true)
    }

    // ── Acceptance (RFC 2616 §14 q-values) ──────────────────────────────────

    /// Acceptance level for `value` in a list field like `Accept` or
    /// `Accept-Encoding`:
    ///
    /// ```text
    /// Accept: text/plain; q=0.5, text/html, text/x-dvi; q=0.8
    /// Accept-Encoding: gzip;q=1.0, identity; q=0.5, *;q=0
    /// ```
    ///
    /// An exact match wins; otherwise the local wildcard (`text/*`), then
    /// the global one (`*` / `*/*`).
    pub fn get_header_acceptance(
        &self,
        field: &str,
        value: &str,
        local_wildcard: &str,
        global_wildcard: &str,
    ) -> f32 {
        let Some(raw) = self.find_field(field) else {
            return 0.0;
        };
        let mut local_pref = None;
        let mut global_pref = None;
        for component in raw.split(',') {
            let mut specs = component.split(';');
            let head = specs.next().unwrap_or("").trim();
            let mut quality = 1.0f32;
            for spec in specs {
                if let Some(q) = spec.trim().strip_prefix("q=") {
                    quality = q.trim().parse().unwrap_or(0.0);
                }
            }
            if head.eq_ignore_ascii_case(value) {
                return quality;
            }
            if !local_wildcard.is_empty() && head.eq_ignore_ascii_case(local_wildcard) {
                local_pref = Some(quality);
            } else if !global_wildcard.is_empty() && head.eq_ignore_ascii_case(global_wildcard) {
                global_pref = Some(quality);
            }
        }
        local_pref.or(global_pref).unwrap_or(0.0)
    }

    pub fn is_gzip_acceptable_encoding(&self) -> bool {
        if self.version < HttpVersion::V1_0 {
            return false;
        }
        self.get_header_acceptance(HEADER_ACCEPT_ENCODING, "gzip", "", "*") > 0.0
    }

    pub fn is_deflate_acceptable_encoding(&self) -> bool {
        if self.version < HttpVersion::V1_0 {
            return false;
        }
        self.get_header_acceptance(HEADER_ACCEPT_ENCODING, "deflate", "", "*") > 0.0
    }

    /// Compressing this content type is worth it (`text/*`,
    /// `application/*`).
    pub fn is_zippable_content_type(&self) -> bool {
        match self.find_field(HEADER_CONTENT_TYPE) {
            Some(value) => {
                let value = value.trim_start().as_bytes();
                (value.len() >= 5 && value[..5].eq_ignore_ascii_case(b"text/"))
                    || (value.len() >= 12 && value[..12].eq_ignore_ascii_case(b"application/"))
            }
            None => false,
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new(true)
    }
}
