//! HTTP/1.x constants: versions, methods, status codes, standard field
//! names, and the RFC 2616 character classes.

use std::fmt;

// ── Versions ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum HttpVersion {
    #[default]
    Unknown,
    V0_9,
    V1_0,
    V1_1,
}

impl HttpVersion {
    pub fn parse(text: &str) -> Self {
        match text {
            "HTTP/0.9" => HttpVersion::V0_9,
            "HTTP/1.0" => HttpVersion::V1_0,
            "HTTP/1.1" => HttpVersion::V1_1,
            _ => HttpVersion::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HttpVersion::Unknown => "HTTP/Unknown",
            HttpVersion::V0_9 => "HTTP/0.9",
            HttpVersion::V1_0 => "HTTP/1.0",
            HttpVersion::V1_1 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Methods ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum HttpMethod {
    #[default]
    Unknown,
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl HttpMethod {
    pub fn parse(text: &str) -> Self {
        match text {
            "OPTIONS" => HttpMethod::Options,
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            _ => HttpMethod::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HttpMethod::Unknown => "UNKNOWN",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Status codes ─────────────────────────────────────────────────────────────

/// RFC 2616 status code. A newtype rather than an enum: parsers must carry
/// whatever numeric code the peer sent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const UNKNOWN: StatusCode = StatusCode(0);

    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);

    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const NON_AUTHORITATIVE_INFORMATION: StatusCode = StatusCode(203);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const RESET_CONTENT: StatusCode = StatusCode(205);
    pub const PARTIAL_CONTENT: StatusCode = StatusCode(206);

    pub const MULTIPLE_CHOICES: StatusCode = StatusCode(300);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const SEE_OTHER: StatusCode = StatusCode(303);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const USE_PROXY: StatusCode = StatusCode(305);
    pub const TEMPORARY_REDIRECT: StatusCode = StatusCode(307);

    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const PAYMENT_REQUIRED: StatusCode = StatusCode(402);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const NOT_ACCEPTABLE: StatusCode = StatusCode(406);
    pub const PROXY_AUTHENTICATION_REQUIRED: StatusCode = StatusCode(407);
    pub const REQUEST_TIME_OUT: StatusCode = StatusCode(408);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const GONE: StatusCode = StatusCode(410);
    pub const LENGTH_REQUIRED: StatusCode = StatusCode(411);
    pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
    pub const REQUEST_ENTITY_TOO_LARGE: StatusCode = StatusCode(413);
    pub const REQUEST_URI_TOO_LARGE: StatusCode = StatusCode(414);
    pub const UNSUPPORTED_MEDIA_TYPE: StatusCode = StatusCode(415);
    pub const REQUESTED_RANGE_NOT_SATISFIABLE: StatusCode = StatusCode(416);
    pub const EXPECTATION_FAILED: StatusCode = StatusCode(417);

    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const GATEWAY_TIME_OUT: StatusCode = StatusCode(504);
    pub const HTTP_VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_informational(self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Canonical reason phrase, empty for codes outside the RFC 2616 set.
    pub fn description(self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Time-out",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            414 => "Request-URI Too Large",
            415 => "Unsupported Media Type",
            416 => "Requested range not satisfiable",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Time-out",
            505 => "HTTP Version not supported",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Standard field names ─────────────────────────────────────────────────────

// General headers
pub const HEADER_CACHE_CONTROL: &str = "Cache-Control";
pub const HEADER_CONNECTION: &str = "Connection";
pub const HEADER_DATE: &str = "Date";
pub const HEADER_PRAGMA: &str = "Pragma";
pub const HEADER_TRAILER: &str = "Trailer";
pub const HEADER_TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const HEADER_UPGRADE: &str = "Upgrade";
pub const HEADER_VIA: &str = "Via";
pub const HEADER_WARNING: &str = "Warning";

// Request headers
pub const HEADER_ACCEPT: &str = "Accept";
pub const HEADER_ACCEPT_CHARSET: &str = "Accept-Charset";
pub const HEADER_ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const HEADER_ACCEPT_LANGUAGE: &str = "Accept-Language";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_EXPECT: &str = "Expect";
pub const HEADER_FROM: &str = "From";
pub const HEADER_HOST: &str = "Host";
pub const HEADER_IF_MODIFIED_SINCE: &str = "If-Modified-Since";
pub const HEADER_IF_NONE_MATCH: &str = "If-None-Match";
pub const HEADER_RANGE: &str = "Range";
pub const HEADER_REFERER: &str = "Referer";
pub const HEADER_USER_AGENT: &str = "User-Agent";

// Response headers
pub const HEADER_ACCEPT_RANGES: &str = "Accept-Ranges";
pub const HEADER_AGE: &str = "Age";
pub const HEADER_ETAG: &str = "ETag";
pub const HEADER_KEEP_ALIVE: &str = "Keep-Alive";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";
pub const HEADER_SERVER: &str = "Server";
pub const HEADER_VARY: &str = "Vary";
pub const HEADER_WWW_AUTHENTICATE: &str = "WWW-Authenticate";

// Entity headers
pub const HEADER_ALLOW: &str = "Allow";
pub const HEADER_CONTENT_ENCODING: &str = "Content-Encoding";
pub const HEADER_CONTENT_LANGUAGE: &str = "Content-Language";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_CONTENT_LOCATION: &str = "Content-Location";
pub const HEADER_CONTENT_RANGE: &str = "Content-Range";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_EXPIRES: &str = "Expires";
pub const HEADER_LAST_MODIFIED: &str = "Last-Modified";

// Common non-standard
pub const HEADER_LOCATION: &str = "Location";
pub const HEADER_COOKIE: &str = "Cookie";
pub const HEADER_SET_COOKIE: &str = "Set-Cookie";

// ── Character classes (RFC 2616 §2.2) ────────────────────────────────────────

/// CTL: octets 0–31 and DEL.
#[inline]
pub fn is_ctl_char(b: u8) -> bool {
    b < 32 || b == 127
}

/// Linear whitespace characters (space and horizontal tab).
#[inline]
pub fn is_lws_char(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

#[inline]
pub fn is_separator_char(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"'
            | b'/' | b'[' | b']' | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t'
    )
}

/// token = 1*<any CHAR except CTLs or separators>
#[inline]
pub fn is_token_char(b: u8) -> bool {
    b < 128 && !is_ctl_char(b) && !is_separator_char(b)
}
