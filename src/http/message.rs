//! HTTP request/reply encoding and streaming parse.
//!
//! [`Request`] pairs the two half-messages of one exchange — what the
//! client sends (header + body) and what the server sends back — plus the
//! lazily allocated compression state shared by the encode paths. The
//! encode side handles identity and chunked transfer, gzip and deflate
//! content coding, and the body-suppression rules (HEAD, 1xx, 204, 304).
//!
//! [`RequestParser`] is the receiving side: a resumable state machine fed
//! from a [`MemoryStream`] as bytes arrive. Every call returns a bitmask
//! of [`read_state`] flags describing what is now available; terminal
//! conditions (errors included) carry `REQUEST_FINISHED`. Configure limits
//! before the first call and `clear()` between messages on a connection.
//!
//! One deliberate compatibility quirk, kept from long exposure to real
//! servers: a body labeled gzip that fails to parse as gzip is retried as
//! raw deflate, using the buffer's marker to rewind the attempted bytes.

use tracing::{debug, warn};

use super::consts::*;
use super::header::{FirstLineType, Header, ParseError};
use crate::stream::{MemoryStream, DEFAULT_BLOCK_SIZE};
use crate::url::Url;
use crate::zlib::{GzipDecoder, GzipEncoder, ZStatus, ZlibDeflate, ZlibInflate};

/// Bitmask values returned by the parser entry points.
pub mod read_state {
    /// Header fully parsed.
    pub const HEADER_READ: u32 = 1;
    /// Reading an identity-coded body; some of it may already be delivered.
    pub const BODY_READING: u32 = 2;
    /// Same, for a chunked body.
    pub const CHUNKED_BODY_READING: u32 = 4;
    /// Reading the trailer fields of a chunked body.
    pub const CHUNKED_TRAILER_READING: u32 = 8;
    /// Identity body fully delivered.
    pub const BODY_FINISHED: u32 = 16;
    /// Chunked body fully delivered.
    pub const CHUNKS_FINISHED: u32 = 32;
    /// Nothing more will come of this message (success or error).
    pub const REQUEST_FINISHED: u32 = 64;
    /// Call again immediately — an event was delivered mid-message.
    pub const CONTINUE: u32 = 128;

    pub fn name(mask: u32) -> String {
        let mut parts = Vec::new();
        for (bit, text) in [
            (HEADER_READ, "HEADER_READ"),
            (BODY_READING, "BODY_READING"),
            (CHUNKED_BODY_READING, "CHUNKED_BODY_READING"),
            (CHUNKED_TRAILER_READING, "CHUNKED_TRAILER_READING"),
            (BODY_FINISHED, "BODY_FINISHED"),
            (CHUNKS_FINISHED, "CHUNKS_FINISHED"),
            (REQUEST_FINISHED, "REQUEST_FINISHED"),
            (CONTINUE, "CONTINUE"),
        ] {
            if mask & bit != 0 {
                parts.push(text);
            }
        }
        if parts.is_empty() {
            return "NONE".to_owned();
        }
        parts.join(" | ")
    }
}

use read_state::*;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CompressOption {
    None,
    Gzip,
    Deflate,
}

/// Byte counters across one request's lifetime (raw = on-the-wire).
#[derive(Clone, Copy, Default, Debug)]
pub struct RequestStats {
    pub client_size: i64,
    pub server_size: i64,
    pub client_raw_size: i64,
    pub server_raw_size: i64,
}

// ── Request ──────────────────────────────────────────────────────────────────

pub struct Request {
    /// Body sent by the client (a POST/PUT payload, typically).
    pub client_data: MemoryStream,
    pub client_header: Header,
    /// Body sent by the server (the reply entity).
    pub server_data: MemoryStream,
    pub server_header: Header,

    url: Option<Url>,
    /// A chunk stream is open and must be closed with the empty chunk.
    in_chunk_encoding: bool,
    deflate: Option<ZlibDeflate>,
    gzip: Option<GzipEncoder>,
    gzip_state_begin: bool,
    server_use_gzip_encoding: bool,
    server_gzip_drain_buffer: bool,
    compress_option: CompressOption,
    stats: RequestStats,
}

impl Request {
    pub fn new() -> Self {
        Self::with_options(true, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_options(
        strict_headers: bool,
        client_block_size: usize,
        server_block_size: usize,
    ) -> Self {
        Self {
            client_data: MemoryStream::with_block_size(client_block_size),
            client_header: Header::new(strict_headers),
            server_data: MemoryStream::with_block_size(server_block_size),
            server_header: Header::new(strict_headers),
            url: None,
            in_chunk_encoding: false,
            deflate: None,
            gzip: None,
            gzip_state_begin: true,
            server_use_gzip_encoding: true,
            server_gzip_drain_buffer: true,
            compress_option: CompressOption::None,
            stats: RequestStats::default(),
        }
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Builds the request URL by resolving the request-line URI against
    /// `absolute_root`; `None` when the request line was unusable.
    pub fn initialize_url_from_client_request(&mut self, absolute_root: &Url) -> Option<&Url> {
        self.url = None;
        if self.client_header.parse_error() < ParseError::NoRequestUri {
            self.url = Some(absolute_root.resolve(self.client_header.uri()));
        }
        self.url.as_ref()
    }

    pub fn server_use_gzip_encoding(&self) -> bool {
        self.server_use_gzip_encoding
    }

    /// `drain_buffer` should stay true for request/response conversations;
    /// turn it off for long single-direction streams so the encoder is not
    /// flushed on every chunk.
    pub fn set_server_use_gzip_encoding(&mut self, use_gzip: bool, drain_buffer: bool) {
        self.server_use_gzip_encoding = use_gzip;
        self.server_gzip_drain_buffer = drain_buffer;
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = RequestStats::default();
    }

    /// Replies that must not carry a body: HEAD requests, 1xx, 204, 304.
    pub fn no_server_body_transmitted(&self) -> bool {
        let code = self.server_header.status_code();
        self.client_header.method() == HttpMethod::Head
            || code.is_informational()
            || code == StatusCode::NO_CONTENT
            || code == StatusCode::NOT_MODIFIED
    }

    // ── Client encode ───────────────────────────────────────────────────────

    /// Serializes the client request (headers + body) into `out`, applying
    /// content coding per the prepared headers and chunking when
    /// `Transfer-Encoding: chunked` is set. Consumes `client_data`.
    pub fn append_client_request(&mut self, out: &mut MemoryStream, max_chunk_size: Option<usize>) {
        assert!(!self.in_chunk_encoding, "chunk stream already open");
        assert_eq!(
            self.client_header.first_line_type(),
            FirstLineType::Request,
            "prepare the request line first"
        );
        debug_assert_ne!(self.client_header.method(), HttpMethod::Unknown);
        debug_assert_ne!(self.client_header.http_version(), HttpVersion::Unknown);

        let zippable = self.client_header.is_zippable_content_type();
        if self.client_header.is_gzip_content_encoding() && zippable {
            assert!(self.client_header.http_version() >= HttpVersion::V1_0);
            self.gzip = Some(GzipEncoder::new());
            self.gzip_state_begin = true;
            self.client_header.set_content_encoding(Some("gzip"));
            self.compress_option = CompressOption::Gzip;
        } else if self.client_header.is_deflate_content_encoding() && zippable {
            assert!(self.client_header.http_version() >= HttpVersion::V1_0);
            self.deflate = Some(ZlibDeflate::new());
            self.client_header.set_content_encoding(Some("deflate"));
            self.compress_option = CompressOption::Deflate;
        } else {
            self.client_header.set_content_encoding(None);
            self.compress_option = CompressOption::None;
        }

        if self.server_use_gzip_encoding {
            // We can take back gzip and deflate, not much else.
            self.client_header.add_field(HEADER_ACCEPT_ENCODING, "gzip, deflate", true);
        } else {
            self.client_header.clear_field(HEADER_ACCEPT_ENCODING);
        }

        let out_size = out.size();
        let client_data_size = self.client_data.size();
        if self.client_header.is_chunked_transfer() {
            assert!(self.client_header.http_version() >= HttpVersion::V1_1);
            self.in_chunk_encoding = true;
            self.client_header.append_to_stream(out);
            while !self.client_data.is_empty() {
                self.append_client_chunk(out, max_chunk_size);
            }
        } else {
            self.client_header.set_chunked_transfer(false);
            let mut compressed = MemoryStream::new();
            let use_temp = match self.compress_option {
                CompressOption::Gzip => {
                    self.gzip.as_mut().unwrap().encode(&mut self.client_data, &mut compressed);
                    true
                }
                CompressOption::Deflate => {
                    self.deflate.as_mut().unwrap().deflate(&mut self.client_data, &mut compressed);
                    true
                }
                CompressOption::None => false,
            };
            let needs_length = !self.client_data.is_empty()
                || self.client_header.method() == HttpMethod::Post
                || self.client_header.method() == HttpMethod::Put;
            let source =
                if use_temp { &mut compressed } else { &mut self.client_data };
            if needs_length {
                self.client_header.add_field(
                    HEADER_CONTENT_LENGTH,
                    &source.size().to_string(),
                    true,
                );
            }
            self.client_header.append_to_stream(out);
            out.append_stream(source, None);
        }
        self.stats.client_raw_size += (out.size() - out_size) as i64;
        self.stats.client_size += (client_data_size - self.client_data.size()) as i64;
    }

    /// Appends the current `client_data` as more chunk(s); with empty data
    /// this closes the chunk stream. True once the last chunk went out.
    pub fn append_client_chunk(&mut self, out: &mut MemoryStream, max_chunk_size: Option<usize>) -> bool {
        let decorations = self.client_header.http_version() >= HttpVersion::V1_1;
        self.append_chunk_side(false, out, decorations, max_chunk_size)
    }

    // ── Server encode ───────────────────────────────────────────────────────

    /// Serializes the server reply into `out`. `streaming` + `do_chunks`
    /// selects chunked transfer (HTTP/1.1 peers only); otherwise the whole
    /// body is emitted with a `Content-Length`. Consumes `server_data`.
    pub fn append_server_reply(
        &mut self,
        out: &mut MemoryStream,
        streaming: bool,
        do_chunks: bool,
        max_chunk_size: Option<usize>,
    ) {
        assert!(!self.in_chunk_encoding, "chunk stream already open");
        assert_eq!(
            self.server_header.first_line_type(),
            FirstLineType::Status,
            "prepare the status line first"
        );
        debug_assert_ne!(self.server_header.status_code(), StatusCode::UNKNOWN);
        if self.server_header.http_version() == HttpVersion::Unknown {
            self.server_header.set_http_version(HttpVersion::V1_1);
        }
        if self.server_header.http_version() > self.client_header.http_version() {
            warn!(
                client = %self.client_header.http_version(),
                "downgrading server version for an older peer"
            );
            self.server_header.set_http_version(HttpVersion::V1_0);
        }

        let zippable = self.server_header.is_zippable_content_type();
        if self.server_use_gzip_encoding && zippable {
            if self.client_header.is_gzip_acceptable_encoding() {
                self.gzip = Some(GzipEncoder::new());
                self.gzip_state_begin = true;
                self.server_header.set_content_encoding(Some("gzip"));
                self.compress_option = CompressOption::Gzip;
            } else if self.client_header.is_deflate_acceptable_encoding() {
                self.deflate = Some(ZlibDeflate::new());
                self.server_header.set_content_encoding(Some("deflate"));
                self.compress_option = CompressOption::Deflate;
            } else {
                self.server_header.set_content_encoding(None);
                self.compress_option = CompressOption::None;
            }
        } else {
            self.server_header.set_content_encoding(None);
            self.compress_option = CompressOption::None;
        }

        let out_size = out.size();
        let server_data_size = self.server_data.size();
        if streaming {
            if do_chunks && self.client_header.http_version() >= HttpVersion::V1_1 {
                self.server_header.set_chunked_transfer(true);
            } else {
                self.server_header.set_chunked_transfer(false);
            }
            self.server_header.append_to_stream(out);
            if !self.no_server_body_transmitted() {
                self.in_chunk_encoding = true;
                while !self.server_data.is_empty() {
                    // The caller closes the stream with an empty-data call.
                    self.append_server_chunk(out, do_chunks, max_chunk_size);
                }
            }
        } else {
            self.server_header.set_chunked_transfer(false);
            let mut compressed = MemoryStream::new();
            let use_temp = match self.compress_option {
                CompressOption::Gzip => {
                    self.gzip.as_mut().unwrap().encode(&mut self.server_data, &mut compressed);
                    true
                }
                CompressOption::Deflate => {
                    self.deflate.as_mut().unwrap().deflate(&mut self.server_data, &mut compressed);
                    true
                }
                CompressOption::None => false,
            };
            let source = if use_temp { &mut compressed } else { &mut self.server_data };
            let code = self.server_header.status_code();
            if !code.is_informational()
                && code != StatusCode::NO_CONTENT
                && code != StatusCode::NOT_MODIFIED
                && self.client_header.method() != HttpMethod::Head
            {
                self.server_header.add_field(
                    HEADER_CONTENT_LENGTH,
                    &source.size().to_string(),
                    true,
                );
            }
            self.server_header.append_to_stream(out);
            out.append_stream(source, None);
        }
        self.stats.server_raw_size += (out.size() - out_size) as i64;
        self.stats.server_size += (server_data_size - self.server_data.size()) as i64;
    }

    /// Appends the current `server_data` as more chunk(s); empty data
    /// closes the chunk stream. Must not be called when
    /// [`no_server_body_transmitted`](Self::no_server_body_transmitted).
    pub fn append_server_chunk(
        &mut self,
        out: &mut MemoryStream,
        do_chunks: bool,
        max_chunk_size: Option<usize>,
    ) -> bool {
        assert!(
            !self.no_server_body_transmitted(),
            "chunk append on a body-less reply"
        );
        let decorations = do_chunks && self.client_header.http_version() >= HttpVersion::V1_1;
        self.append_chunk_side(true, out, decorations, max_chunk_size)
    }

    /// The shared chunk writer. True when the closing (empty) chunk and
    /// trailer were appended.
    fn append_chunk_side(
        &mut self,
        server_side: bool,
        out: &mut MemoryStream,
        add_decorations: bool,
        max_chunk_size: Option<usize>,
    ) -> bool {
        fn buffer_append_chunk(
            input: &mut MemoryStream,
            out: &mut MemoryStream,
            add_decorations: bool,
            max_size: usize,
        ) {
            let size = input.size().min(max_size);
            if add_decorations {
                out.write(format!("{size:x}\r\n").as_bytes());
            }
            out.append_stream(input, Some(size));
            if add_decorations {
                out.write(b"\r\n");
            }
        }

        let max_size = max_chunk_size.unwrap_or(usize::MAX);
        let drain = self.server_gzip_drain_buffer;
        let src = if server_side { &mut self.server_data } else { &mut self.client_data };
        let is_empty = src.is_empty();

        if self.compress_option == CompressOption::None {
            if is_empty {
                // The closing chunk.
                self.in_chunk_encoding = false;
                if add_decorations {
                    out.write(b"0\r\n\r\n");
                }
                return true;
            }
            while !src.is_empty() {
                buffer_append_chunk(src, out, add_decorations, max_size);
            }
            return false;
        }

        let mut tmp = MemoryStream::new();
        if self.compress_option == CompressOption::Gzip {
            if is_empty && self.gzip_state_begin {
                // No member in progress: nothing to flush, close cleanly
                // (a stray empty member would trip the receiver's
                // after-stream-end chunk rule).
                self.in_chunk_encoding = false;
                if add_decorations {
                    out.write(b"0\r\n\r\n");
                }
                return true;
            }
            let gzip = self.gzip.as_mut().expect("gzip encoder not prepared");
            if self.gzip_state_begin {
                gzip.begin_encoding();
                self.gzip_state_begin = false;
            }
            gzip.continue_encoding(src, &mut tmp);
            if is_empty || drain {
                gzip.end_encoding(&mut tmp);
                self.gzip_state_begin = true;
            }
        } else {
            // One over the data size keeps the deflate stream open; an
            // empty flush (budget 0) ends it.
            let mut budget = src.size();
            if !is_empty {
                budget += 1;
            }
            let deflate = self.deflate.as_mut().expect("deflate encoder not prepared");
            deflate.deflate_size(src, &mut tmp, &mut budget);
        }

        if tmp.is_empty() && !is_empty {
            // The encoder held everything back; try again next call.
            return false;
        }
        while !tmp.is_empty() {
            buffer_append_chunk(&mut tmp, out, add_decorations, max_size);
        }
        if is_empty {
            self.in_chunk_encoding = false;
            if add_decorations {
                out.write(b"0\r\n\r\n");
            }
            return true;
        }
        false
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Parser states. Values at or past 100 are final; at or past 200, errors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ParseState {
    Initialized = 0,
    HeaderReading = 1,
    EndOfHeader = 2,
    BodyReading = 10,
    ChunkHeadReading = 21,
    ChunkReading = 22,
    EndOfChunk = 23,
    LastChunkRead = 24,

    /// Header complete and no body follows (HEAD, 204, ...).
    EndOfHeaderFinal = 100,
    BodyEnd = 110,
    EndOfTrailHeader = 120,

    ErrorHeaderBad = 200,
    ErrorHeaderBadContentLen = 201,
    ErrorHeaderTooLong = 202,
    ErrorHeaderLine = 203,
    ErrorContentTooLong = 210,
    ErrorTransferEncodingUnknown = 211,
    ErrorContentEncodingUnknown = 212,
    ErrorContentGzipTooLong = 213,
    ErrorContentGzipError = 214,
    ErrorContentGzipUnfinished = 215,
    ErrorChunkHeaderTooLong = 220,
    ErrorChunkTooLong = 221,
    ErrorChunkTooMany = 222,
    ErrorChunkTrailHeader = 223,
    ErrorChunkBadChunkLength = 224,
    ErrorChunkBadChunkTermination = 225,
    ErrorChunkBiggerThanDeclared = 226,
    ErrorChunkUnfinishedGzipContent = 227,
    ErrorChunkContinuedFinishedGzipContent = 228,
    ErrorChunkContentGzipTooLong = 229,
    ErrorChunkContentGzipError = 230,
    ErrorChunkTrailerTooLong = 231,
}

const FIRST_FINAL_STATE: u32 = 100;
const FIRST_ERROR_STATE: u32 = 200;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NextChunkExpectation {
    /// No expectation for the next chunk.
    None,
    /// The compressed stream ended: only the closing chunk may follow.
    Empty,
    /// The compressed stream is mid-flight: a data chunk must follow.
    NonEmpty,
}

pub struct RequestParser {
    // Protocol limits.
    max_header_size: usize,
    max_body_size: i64,
    max_chunk_size: i64,
    max_num_chunks: i64,
    accept_wrong_method: bool,
    accept_wrong_version: bool,
    accept_no_content_length: bool,
    worst_accepted_header_error: ParseError,

    /// Shows up in logs; name it after the connection.
    name: String,

    parse_state: ParseState,
    body_size_to_read: i64,
    chunk_size_to_read: i64,
    num_chunks_read: i64,
    next_chunk_expectation: NextChunkExpectation,
    partial_data: MemoryStream,
    trail_header: Header,
    inflate: Option<ZlibInflate>,
    gzip: Option<GzipDecoder>,
}

impl RequestParser {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_limits(
            name,
            16384,
            4 << 20,
            1 << 20,
            -1,
            false,
            false,
            false,
            ParseError::NoStatusReason,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_limits(
        name: impl Into<String>,
        max_header_size: usize,
        max_body_size: i64,
        max_chunk_size: i64,
        max_num_chunks: i64,
        accept_wrong_method: bool,
        accept_wrong_version: bool,
        accept_no_content_length: bool,
        worst_accepted_header_error: ParseError,
    ) -> Self {
        Self {
            max_header_size,
            max_body_size,
            max_chunk_size,
            max_num_chunks,
            accept_wrong_method,
            accept_wrong_version,
            accept_no_content_length,
            worst_accepted_header_error,
            name: name.into(),
            parse_state: ParseState::Initialized,
            body_size_to_read: 0,
            chunk_size_to_read: 0,
            num_chunks_read: 0,
            next_chunk_expectation: NextChunkExpectation::None,
            partial_data: MemoryStream::new(),
            trail_header: Header::new(true),
            inflate: None,
            gzip: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parse_state(&self) -> ParseState {
        self.parse_state
    }

    pub fn in_final_state(&self) -> bool {
        self.parse_state as u32 >= FIRST_FINAL_STATE
    }

    pub fn in_error_state(&self) -> bool {
        self.parse_state as u32 >= FIRST_ERROR_STATE
    }

    pub fn set_max_num_chunks(&mut self, max_num_chunks: i64) {
        self.max_num_chunks = max_num_chunks;
    }

    pub fn set_max_body_size(&mut self, max_body_size: i64) {
        self.max_body_size = max_body_size;
    }

    /// Back to a clean slate; call between messages — and you better do it.
    pub fn clear(&mut self) {
        self.parse_state = ParseState::Initialized;
        self.body_size_to_read = 0;
        self.chunk_size_to_read = 0;
        self.num_chunks_read = 0;
        self.next_chunk_expectation = NextChunkExpectation::None;
        self.partial_data.clear();
        self.trail_header.clear();
        self.inflate = None;
        self.gzip = None;
    }

    fn set_state(&mut self, state: ParseState) {
        debug!(parser = %self.name, from = ?self.parse_state, to = ?state, "state change");
        self.parse_state = state;
    }

    /// We only know identity, gzip and deflate content codings.
    pub fn is_known_content_encoding(header: &Header) -> bool {
        match header.find_field(HEADER_CONTENT_ENCODING) {
            None => true,
            Some(value) => {
                let value = value.trim();
                value.is_empty()
                    || starts_ignore_case(value, "gzip")
                    || starts_ignore_case(value, "deflate")
                    || starts_ignore_case(value, "identity")
            }
        }
    }

    /// We only know identity and chunked transfer codings.
    pub fn is_known_transfer_encoding(header: &Header) -> bool {
        match header.find_field(HEADER_TRANSFER_ENCODING) {
            None => true,
            Some(value) => {
                let value = value.trim();
                value.is_empty()
                    || starts_ignore_case(value, "chunked")
                    || starts_ignore_case(value, "identity")
            }
        }
    }

    // ── Entry points ────────────────────────────────────────────────────────

    /// Parses a client request from `input` into `req`. Keep feeding the
    /// same message until the result carries `REQUEST_FINISHED`.
    pub fn parse_client_request(&mut self, input: &mut MemoryStream, req: &mut Request) -> u32 {
        assert!(!self.in_final_state(), "parse after a final state");
        if self.parse_state == ParseState::Initialized {
            req.client_data.clear();
            req.client_header.clear();
            self.set_state(ParseState::HeaderReading);
        }
        if self.parse_state == ParseState::HeaderReading {
            if !req.client_header.parse_http_request(input) {
                if input.size() + req.client_header.bytes_parsed() > self.max_header_size {
                    warn!(parser = %self.name, "request header over size limit");
                    self.set_state(ParseState::ErrorHeaderTooLong);
                    return REQUEST_FINISHED;
                }
                return 0; // more header bytes needed
            }
            if req.client_header.bytes_parsed() > self.max_header_size {
                warn!(parser = %self.name, "request header over size limit");
                self.set_state(ParseState::ErrorHeaderTooLong);
                return REQUEST_FINISHED;
            }
            if (req.client_header.http_version() == HttpVersion::Unknown
                && !self.accept_wrong_version)
                || (req.client_header.method() == HttpMethod::Unknown
                    && !self.accept_wrong_method)
            {
                warn!(parser = %self.name, "unusable request line");
                self.set_state(ParseState::ErrorHeaderLine);
                return HEADER_READ | REQUEST_FINISHED;
            }
            if req.client_header.parse_error() > self.worst_accepted_header_error {
                warn!(
                    parser = %self.name,
                    error = req.client_header.parse_error().name(),
                    "request header too damaged"
                );
                self.set_state(ParseState::ErrorHeaderBad);
                return HEADER_READ | REQUEST_FINISHED;
            }
            self.set_state(ParseState::EndOfHeader);
            // Let the caller look at the header before the body streams in.
            return HEADER_READ | CONTINUE;
        }
        self.parse_payload(input, &mut req.client_header, &mut req.client_data)
    }

    /// Parses a server reply from `input` into `req`. The client half of
    /// `req` supplies the context (a HEAD request suppresses the body).
    pub fn parse_server_reply(&mut self, input: &mut MemoryStream, req: &mut Request) -> u32 {
        assert!(!self.in_final_state(), "parse after a final state");
        if self.parse_state == ParseState::Initialized {
            req.server_data.clear();
            req.server_header.clear();
            self.set_state(ParseState::HeaderReading);
        }
        if self.parse_state == ParseState::HeaderReading {
            if !req.server_header.parse_http_reply(input) {
                if input.size() + req.server_header.bytes_parsed() > self.max_header_size {
                    warn!(parser = %self.name, "reply header over size limit");
                    self.set_state(ParseState::ErrorHeaderTooLong);
                    return REQUEST_FINISHED;
                }
                // First-line glitches may still resolve with more data.
                req.server_header.set_first_line_type(FirstLineType::Status);
                return 0;
            }
            if req.server_header.bytes_parsed() > self.max_header_size {
                warn!(parser = %self.name, "reply header over size limit");
                self.set_state(ParseState::ErrorHeaderTooLong);
                return REQUEST_FINISHED;
            }
            if req.server_header.parse_error() > self.worst_accepted_header_error {
                warn!(
                    parser = %self.name,
                    error = req.server_header.parse_error().name(),
                    "reply header too damaged"
                );
                self.set_state(ParseState::ErrorHeaderBad);
                return HEADER_READ | REQUEST_FINISHED;
            }
            if req.no_server_body_transmitted() {
                self.set_state(ParseState::EndOfHeaderFinal);
                return HEADER_READ | REQUEST_FINISHED;
            }
            self.set_state(ParseState::EndOfHeader);
            return HEADER_READ | CONTINUE;
        }
        self.parse_payload(input, &mut req.server_header, &mut req.server_data)
    }

    // ── Body transport selection ────────────────────────────────────────────

    fn parse_payload(
        &mut self,
        input: &mut MemoryStream,
        header: &mut Header,
        out: &mut MemoryStream,
    ) -> u32 {
        debug_assert!(self.parse_state >= ParseState::EndOfHeader);
        if self.parse_state == ParseState::EndOfHeader {
            if !Self::is_known_content_encoding(header) {
                warn!(parser = %self.name, "unknown content encoding");
                self.set_state(ParseState::ErrorContentEncodingUnknown);
                return HEADER_READ | REQUEST_FINISHED;
            }
            if !Self::is_known_transfer_encoding(header) {
                warn!(parser = %self.name, "unknown transfer encoding");
                self.set_state(ParseState::ErrorTransferEncodingUnknown);
                return HEADER_READ | REQUEST_FINISHED;
            }
            if header.is_chunked_transfer() {
                self.set_state(ParseState::ChunkHeadReading);
            } else {
                match header.find_field(HEADER_CONTENT_LENGTH) {
                    None => {
                        self.body_size_to_read = header.default_body_len();
                        if !self.accept_no_content_length && self.body_size_to_read > 0 {
                            // A body with no length: refuse to guess.
                            self.set_state(ParseState::EndOfHeaderFinal);
                            return HEADER_READ | REQUEST_FINISHED;
                        }
                        if self.max_body_size >= 0 && self.body_size_to_read > self.max_body_size {
                            self.body_size_to_read = self.max_body_size;
                        }
                        self.set_state(ParseState::BodyReading);
                    }
                    Some(text) => match parse_decimal(text) {
                        Some(length) if length >= 0 => {
                            self.body_size_to_read = length;
                            self.set_state(ParseState::BodyReading);
                        }
                        _ => {
                            warn!(parser = %self.name, value = text, "bad Content-Length");
                            self.set_state(ParseState::ErrorHeaderBadContentLen);
                            return HEADER_READ | REQUEST_FINISHED;
                        }
                    },
                }
            }
        }
        if self.parse_state == ParseState::BodyReading {
            return self.parse_body(input, header, out);
        }
        debug_assert!(
            self.parse_state >= ParseState::ChunkHeadReading,
            "payload parser in {:?}",
            self.parse_state
        );
        self.parse_chunks(input, header, out)
    }

    // ── Identity body ───────────────────────────────────────────────────────

    fn parse_body(
        &mut self,
        input: &mut MemoryStream,
        header: &mut Header,
        out: &mut MemoryStream,
    ) -> u32 {
        debug_assert_eq!(self.parse_state, ParseState::BodyReading);
        if self.max_body_size >= 0 && self.body_size_to_read > self.max_body_size {
            warn!(parser = %self.name, "declared body over size limit");
            self.set_state(ParseState::ErrorContentTooLong);
            return HEADER_READ | REQUEST_FINISHED;
        }
        let to_read = self.body_size_to_read.min(input.size() as i64).max(0) as usize;
        self.partial_data.append_stream(input, Some(to_read));
        self.body_size_to_read -= to_read as i64;

        let mut is_gzipped = header.is_gzip_content_encoding();
        let mut is_deflated = header.is_deflate_content_encoding();
        if self.inflate.is_some() && is_gzipped {
            // An earlier pass re-labeled this body raw-deflate.
            is_deflated = true;
            is_gzipped = false;
        }

        if is_gzipped && self.partial_data.is_empty() && self.body_size_to_read > 0 {
            // Nothing to decode yet; in particular, don't let the first
            // gzip-or-deflate judgement happen on thin air.
            return HEADER_READ | BODY_READING;
        }
        if is_gzipped {
            let maybe_try_deflate = self.gzip.is_none();
            let gzip = self.gzip.get_or_insert_with(GzipDecoder::new);
            loop {
                self.partial_data.marker_set();
                let mut tmp = MemoryStream::new();
                let initial_size = self.partial_data.size();
                let status = gzip.decode(&mut self.partial_data, &mut tmp);
                let consumed = initial_size - self.partial_data.size();
                match status {
                    ZStatus::StreamEnd => {
                        self.partial_data.marker_clear();
                        out.append_stream(&mut tmp, None);
                        if self.body_size_to_read == 0 && self.partial_data.is_empty() {
                            self.set_state(ParseState::BodyEnd);
                            return HEADER_READ | BODY_FINISHED | REQUEST_FINISHED;
                        }
                    }
                    ZStatus::Corrupt => {
                        if !maybe_try_deflate {
                            self.partial_data.marker_clear();
                            warn!(parser = %self.name, "broken gzip body");
                            self.set_state(ParseState::ErrorContentGzipError);
                            return HEADER_READ | BODY_READING | REQUEST_FINISHED;
                        }
                        // Mislabeled by the peer; rewind and go deflate.
                        debug!(parser = %self.name, "gzip failed, retrying as deflate");
                        self.partial_data.marker_restore();
                        is_deflated = true;
                    }
                    ZStatus::Ok => {
                        self.partial_data.marker_clear();
                        out.append_stream(&mut tmp, None);
                        if self.body_size_to_read == 0 {
                            warn!(parser = %self.name, "body ended inside the gzip stream");
                            self.set_state(ParseState::ErrorContentGzipUnfinished);
                            return HEADER_READ | BODY_FINISHED | REQUEST_FINISHED;
                        }
                    }
                }
                if is_deflated || consumed == 0 || self.partial_data.is_empty() {
                    break;
                }
            }
        }
        if is_deflated {
            let inflate = self.inflate.get_or_insert_with(ZlibInflate::new);
            match inflate.inflate_chunk(&mut self.partial_data, out) {
                ZStatus::StreamEnd => {
                    if self.body_size_to_read > 0 {
                        warn!(parser = %self.name, left = self.body_size_to_read,
                              "deflate stream ended before the body did");
                        self.set_state(ParseState::ErrorContentGzipTooLong);
                        return HEADER_READ | BODY_READING | REQUEST_FINISHED;
                    }
                    self.set_state(ParseState::BodyEnd);
                    return HEADER_READ | BODY_FINISHED | REQUEST_FINISHED;
                }
                ZStatus::Corrupt => {
                    warn!(parser = %self.name, "broken deflate body");
                    self.set_state(ParseState::ErrorContentGzipError);
                    return HEADER_READ | BODY_READING | REQUEST_FINISHED;
                }
                ZStatus::Ok => {}
            }
        } else if !is_gzipped {
            out.append_stream(&mut self.partial_data, None);
            if self.body_size_to_read == 0 {
                self.set_state(ParseState::BodyEnd);
                return HEADER_READ | BODY_FINISHED | REQUEST_FINISHED;
            }
        }
        debug_assert_eq!(self.parse_state, ParseState::BodyReading);
        HEADER_READ | BODY_READING
    }

    // ── Chunked body ────────────────────────────────────────────────────────

    //  Chunked-Body = *chunk last-chunk trailer CRLF
    //  chunk        = chunk-size [ chunk-extension ] CRLF chunk-data CRLF
    //  chunk-size   = 1*HEX ; last-chunk = 1*("0") [ chunk-extension ] CRLF
    //  trailer      = *(entity-header CRLF)
    fn parse_chunks(
        &mut self,
        input: &mut MemoryStream,
        header: &mut Header,
        out: &mut MemoryStream,
    ) -> u32 {
        loop {
            match self.parse_state {
                ParseState::ChunkHeadReading => {
                    let Some(raw) = input.read_crlf_line() else {
                        if input.size() > self.max_header_size {
                            warn!(parser = %self.name, "chunk header over size limit");
                            self.set_state(ParseState::ErrorChunkHeaderTooLong);
                            return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                        }
                        return HEADER_READ | CHUNKED_BODY_READING;
                    };
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 2]).into_owned();
                    // Extensions after ';' are ignored.
                    let Some(chunk_length) = parse_hex_prefix(&line) else {
                        warn!(parser = %self.name, %line, "bad chunk length");
                        self.set_state(ParseState::ErrorChunkBadChunkLength);
                        return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                    };
                    if chunk_length == 0 {
                        if self.next_chunk_expectation == NextChunkExpectation::NonEmpty {
                            warn!(parser = %self.name, "chunks ended inside the gzip stream");
                            self.set_state(ParseState::ErrorChunkUnfinishedGzipContent);
                            return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                        }
                        self.next_chunk_expectation = NextChunkExpectation::None;
                        self.set_state(ParseState::LastChunkRead);
                        continue;
                    }
                    if self.next_chunk_expectation == NextChunkExpectation::Empty {
                        warn!(parser = %self.name, "data chunk after the gzip stream ended");
                        self.set_state(ParseState::ErrorChunkContinuedFinishedGzipContent);
                        return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                    }
                    if chunk_length > self.max_chunk_size {
                        warn!(parser = %self.name, chunk_length, "chunk over size limit");
                        self.set_state(ParseState::ErrorChunkTooLong);
                        return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                    }
                    self.next_chunk_expectation = NextChunkExpectation::None;
                    self.num_chunks_read += 1;
                    if self.max_num_chunks >= 0 && self.num_chunks_read > self.max_num_chunks {
                        warn!(parser = %self.name, "too many chunks");
                        self.set_state(ParseState::ErrorChunkTooMany);
                        return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                    }
                    self.chunk_size_to_read = chunk_length;
                    self.set_state(ParseState::ChunkReading);
                }

                ParseState::EndOfChunk => {
                    // Exactly one CRLF closes a chunk's payload.
                    let Some(raw) = input.read_crlf_line() else {
                        if input.size() > 2 {
                            warn!(parser = %self.name, "junk at end of chunk");
                            self.set_state(ParseState::ErrorChunkBadChunkTermination);
                            return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                        }
                        return HEADER_READ | CHUNKED_BODY_READING;
                    };
                    if raw.len() > 2 {
                        warn!(parser = %self.name, "chunk longer than declared");
                        self.set_state(ParseState::ErrorChunkBiggerThanDeclared);
                        return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                    }
                    self.set_state(ParseState::ChunkHeadReading);
                }

                ParseState::ChunkReading => {
                    if input.is_empty() {
                        return HEADER_READ | CHUNKED_BODY_READING;
                    }
                    let to_read = self.chunk_size_to_read.min(input.size() as i64).max(0) as usize;
                    self.partial_data.append_stream(input, Some(to_read));
                    self.chunk_size_to_read -= to_read as i64;

                    let mut is_gzipped = header.is_gzip_content_encoding();
                    let mut is_deflated = header.is_deflate_content_encoding();
                    if is_gzipped && self.inflate.is_some() {
                        is_deflated = true;
                        is_gzipped = false;
                    }
                    if self.chunk_size_to_read == 0 {
                        self.set_state(ParseState::EndOfChunk);
                    }

                    if is_gzipped {
                        if self.gzip.is_none()
                            && self.partial_data.size() < GzipDecoder::MIN_DECODE_SIZE
                        {
                            // Not even a gzip header's worth yet; don't let
                            // the gzip-or-deflate call happen on a sliver.
                            if input.size() > GzipDecoder::MIN_DECODE_SIZE {
                                continue;
                            }
                            return HEADER_READ | CHUNKED_BODY_READING;
                        }
                        let maybe_try_deflate = self.gzip.is_none();
                        let gzip = self.gzip.get_or_insert_with(GzipDecoder::new);
                        loop {
                            self.partial_data.marker_set();
                            let mut tmp = MemoryStream::new();
                            let initial_size = self.partial_data.size();
                            let status = gzip.decode(&mut self.partial_data, &mut tmp);
                            let consumed = initial_size - self.partial_data.size();
                            match status {
                                ZStatus::StreamEnd => {
                                    self.partial_data.marker_clear();
                                    out.append_stream(&mut tmp, None);
                                    if self.chunk_size_to_read == 0 && self.partial_data.is_empty()
                                    {
                                        // Only the closing chunk may follow.
                                        self.next_chunk_expectation = NextChunkExpectation::Empty;
                                    }
                                }
                                ZStatus::Corrupt => {
                                    if !maybe_try_deflate {
                                        self.partial_data.marker_clear();
                                        warn!(parser = %self.name, "broken gzip chunk content");
                                        self.set_state(ParseState::ErrorChunkContentGzipError);
                                        return HEADER_READ
                                            | CHUNKED_BODY_READING
                                            | REQUEST_FINISHED;
                                    }
                                    debug!(parser = %self.name, "gzip failed, retrying as deflate");
                                    self.partial_data.marker_restore();
                                    is_deflated = true;
                                }
                                ZStatus::Ok => {
                                    self.partial_data.marker_clear();
                                    out.append_stream(&mut tmp, None);
                                    if self.chunk_size_to_read == 0 {
                                        // Chunk drained but the stream isn't
                                        // done: more chunks must follow.
                                        self.next_chunk_expectation =
                                            NextChunkExpectation::NonEmpty;
                                    }
                                }
                            }
                            if is_deflated || consumed == 0 || self.partial_data.is_empty() {
                                break;
                            }
                        }
                    }
                    if is_deflated {
                        let inflate = self.inflate.get_or_insert_with(ZlibInflate::new);
                        match inflate.inflate_chunk(&mut self.partial_data, out) {
                            ZStatus::StreamEnd => {
                                if self.chunk_size_to_read > 0 {
                                    warn!(parser = %self.name,
                                          "deflate stream ended before the chunk did");
                                    self.set_state(ParseState::ErrorChunkContentGzipTooLong);
                                    return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                                }
                                self.next_chunk_expectation = NextChunkExpectation::Empty;
                            }
                            ZStatus::Corrupt => {
                                warn!(parser = %self.name, "broken deflate chunk content");
                                self.set_state(ParseState::ErrorChunkContentGzipError);
                                return HEADER_READ | CHUNKED_BODY_READING | REQUEST_FINISHED;
                            }
                            ZStatus::Ok => {
                                if self.chunk_size_to_read == 0 {
                                    self.next_chunk_expectation = NextChunkExpectation::NonEmpty;
                                }
                            }
                        }
                    } else if !is_gzipped {
                        out.append_stream(&mut self.partial_data, None);
                    }
                }

                ParseState::LastChunkRead => {
                    return self.parse_trail_header(input, header);
                }

                state => unreachable!("chunk parser in state {state:?}"),
            }
        }
    }

    /// Trailer fields after the last chunk merge (without replacing) into
    /// the message header.
    fn parse_trail_header(&mut self, input: &mut MemoryStream, header: &mut Header) -> u32 {
        debug_assert_eq!(self.parse_state, ParseState::LastChunkRead);
        if !self.trail_header.read_header_fields(input) {
            if self.trail_header.bytes_parsed() + input.size() > self.max_header_size {
                warn!(parser = %self.name, "chunk trailer over size limit");
                self.set_state(ParseState::ErrorChunkTrailerTooLong);
                return HEADER_READ | CHUNKED_TRAILER_READING | REQUEST_FINISHED;
            }
            return HEADER_READ | CHUNKED_TRAILER_READING;
        }
        if self.trail_header.parse_error() > self.worst_accepted_header_error {
            warn!(
                parser = %self.name,
                error = self.trail_header.parse_error().name(),
                "chunk trailer too damaged"
            );
            self.set_state(ParseState::ErrorChunkTrailHeader);
            return HEADER_READ | CHUNKED_TRAILER_READING | REQUEST_FINISHED;
        }
        header.copy_header_fields(&self.trail_header, false);
        self.set_state(ParseState::EndOfTrailHeader);
        HEADER_READ | CHUNKS_FINISHED | REQUEST_FINISHED
    }
}

// ── Small parse helpers ──────────────────────────────────────────────────────

fn starts_ignore_case(text: &str, prefix: &str) -> bool {
    let text = text.as_bytes();
    text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Leading decimal number; `None` when there is none.
fn parse_decimal(text: &str) -> Option<i64> {
    let text = text.trim();
    let negative = text.starts_with('-');
    let digits_off = usize::from(negative);
    let end = digits_off
        + text[digits_off..].bytes().take_while(u8::is_ascii_digit).count();
    if end == digits_off {
        return None;
    }
    let value: i64 = text[digits_off..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Leading hexadecimal number (chunk sizes); `None` when there is none.
fn parse_hex_prefix(text: &str) -> Option<i64> {
    let text = text.trim();
    let end = text.bytes().take_while(u8::is_ascii_hexdigit).count();
    if end == 0 || end > 15 {
        return None;
    }
    i64::from_str_radix(&text[..end], 16).ok()
}
