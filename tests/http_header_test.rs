use chrono::{TimeZone, Utc};

use wharf::http::consts::*;
use wharf::http::{FirstLineType, Header, HttpMethod, HttpVersion, ParseError};
use wharf::stream::MemoryStream;

fn parse_request(text: &str, strict: bool) -> Header {
    let mut io = MemoryStream::with_block_size(128);
    io.write(text.as_bytes());
    let mut header = Header::new(strict);
    assert!(header.parse_http_request(&mut io));
    header
}

fn parse_reply(text: &str, strict: bool) -> Header {
    let mut io = MemoryStream::with_block_size(128);
    io.write(text.as_bytes());
    let mut header = Header::new(strict);
    assert!(header.parse_http_reply(&mut io));
    header
}

#[test]
fn field_name_normalization() {
    assert_eq!(Header::normalize_field_name("content-lengTH"), "Content-Length");
    assert_eq!(Header::normalize_field_name("  ACCEPT-encoding  "), "Accept-Encoding");
    assert_eq!(Header::normalize_field_name("x y"), "X-Y");
    assert_eq!(Header::normalize_field_name("eTaG"), "Etag");
}

#[test]
fn messy_field_line_normalizes_and_merges() {
    let mut header = parse_request(
        "GET / HTTP/1.1\r\n  content-lengTH  :   42 \r\n\r\n",
        true,
    );
    assert_eq!(header.parse_error(), ParseError::Ok);
    assert_eq!(header.find_field(HEADER_CONTENT_LENGTH), Some("42"));

    // A duplicate add without replace appends with ", ".
    assert!(header.add_field("Content-Length", "43", false));
    assert_eq!(header.find_field(HEADER_CONTENT_LENGTH), Some("42, 43"));
    assert!(header.add_field("Content-Length", "17", true));
    assert_eq!(header.find_field(HEADER_CONTENT_LENGTH), Some("17"));
}

#[test]
fn request_line_components() {
    let header = parse_request(
        "GET /en-US/firefox/bookmarks/%0A HTTP/1.0\r\n\
         User-Agent: Wget/1.10.2\r\n\
         Accept: */*\r\n\
         Host: en-us.add-ons.mozilla.com\r\n\
         Connection: Keep-Alive\r\n\
         \r\n",
        true,
    );
    assert_eq!(header.parse_error(), ParseError::Ok);
    assert_eq!(header.method(), HttpMethod::Get);
    assert_eq!(header.uri(), "/en-US/firefox/bookmarks/%0A");
    assert_eq!(header.http_version(), HttpVersion::V1_0);
    assert_eq!(header.first_line_type(), FirstLineType::Request);
    assert!(header.is_keep_alive());
}

#[test]
fn continuation_lines_join_with_a_space() {
    let header = parse_request(
        "GET / HTTP/1.0\r\n\
         User-Agent: Wget/1.10.2\r\n\
         \x20 and friends\r\n\
         Accept: */*\r\n\
         \r\n",
        true,
    );
    assert_eq!(header.parse_error(), ParseError::Ok);
    assert_eq!(header.find_field(HEADER_USER_AGENT), Some("Wget/1.10.2 and friends"));
}

#[test]
fn duplicate_fields_merge_during_parse() {
    let header = parse_request(
        "GET / HTTP/1.0\r\n\
         User-Agent: first\r\n\
         Accept: */*\r\n\
         User-Agent: second\r\n\
         \r\n",
        true,
    );
    assert_eq!(header.parse_error(), ParseError::Ok);
    assert_eq!(header.find_field(HEADER_USER_AGENT), Some("first, second"));
}

#[test]
fn incremental_parse_across_arbitrary_cuts() {
    let text = "POST /submit HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\n";
    for cut in 1..text.len() {
        let mut io = MemoryStream::with_block_size(16);
        let mut header = Header::new(true);
        io.write(&text.as_bytes()[..cut]);
        let first = header.parse_http_request(&mut io);
        io.write(&text.as_bytes()[cut..]);
        let second = first || header.parse_http_request(&mut io);
        assert!(second, "failed with cut at {cut}");
        assert_eq!(header.parse_error(), ParseError::Ok);
        assert_eq!(header.method(), HttpMethod::Post);
        assert_eq!(header.find_field(HEADER_HOST), Some("example.test"));
        assert_eq!(header.bytes_parsed(), text.len());
    }
}

#[test]
fn status_line_parsing() {
    let header = parse_reply("HTTP/1.1 404 Not Found\r\nServer: x\r\n\r\n", true);
    assert_eq!(header.parse_error(), ParseError::Ok);
    assert_eq!(header.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(header.reason(), "Not Found");
    assert_eq!(header.first_line_type(), FirstLineType::Status);
}

#[test]
fn status_without_reason_is_lenient_up_to_1_0() {
    let header = parse_reply("HTTP/1.0 204\r\n\r\n", true);
    assert_eq!(header.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(header.parse_error(), ParseError::Ok);
    assert_eq!(header.first_line_type(), FirstLineType::Status);

    let header = parse_reply("HTTP/1.1 204\r\n\r\n", true);
    assert_eq!(header.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(header.parse_error(), ParseError::NoStatusReason);
}

#[test]
fn missing_request_version_is_flagged() {
    let header = parse_request("GET /path\r\nHost: h\r\n\r\n", false);
    assert_eq!(header.parse_error(), ParseError::NoRequestVersion);
    assert_eq!(header.uri(), "/path");
    assert_eq!(header.find_field(HEADER_HOST), Some("h"));
}

#[test]
fn invalid_field_content_strictness() {
    let raw = "GET / HTTP/1.0\r\nBad\x01Name: x\r\nGood: y\r\n\r\n";
    let strict = parse_request(raw, true);
    assert_eq!(strict.parse_error(), ParseError::BadFieldSpec);
    assert!(!strict.has_field("Bad\u{1}Name"));
    assert_eq!(strict.find_field("Good"), Some("y"));

    let lax = parse_request(raw, false);
    assert_eq!(lax.parse_error(), ParseError::BadFieldSpec);
    assert_eq!(lax.find_field("Good"), Some("y"));
}

#[test]
fn compose_then_parse_is_identity_modulo_order() {
    let mut header = Header::new(true);
    header.prepare_request_line("/index.html", HttpMethod::Get, HttpVersion::V1_1);
    header.add_field(HEADER_HOST, "example.test", true);
    header.add_field(HEADER_ACCEPT, "text/html", true);
    header.add_field(HEADER_USER_AGENT, "wharf-test", true);

    let mut io = MemoryStream::new();
    header.append_to_stream(&mut io);

    let mut reparsed = Header::new(true);
    assert!(reparsed.parse_http_request(&mut io));
    assert_eq!(reparsed.parse_error(), ParseError::Ok);
    assert_eq!(reparsed.method(), header.method());
    assert_eq!(reparsed.uri(), header.uri());
    assert_eq!(reparsed.http_version(), header.http_version());
    assert_eq!(reparsed.fields(), header.fields());
}

#[test]
fn http_dates_in_all_three_formats() {
    let expected = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
    let header = parse_request(
        "GET / HTTP/1.0\r\n\
         Date1: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
         Date2: Sunday, 06-Nov-94 08:49:37 GMT\r\n\
         Date3: Sun Nov  6 08:49:37 1994\r\n\
         \r\n",
        true,
    );
    assert_eq!(header.get_date_field("Date1"), Some(expected));
    assert_eq!(header.get_date_field("Date2"), Some(expected));
    assert_eq!(header.get_date_field("Date3"), Some(expected));
    assert_eq!(header.get_date_field("Date9"), None);

    let mut header = Header::new(true);
    assert!(header.set_date_field(HEADER_DATE, expected));
    assert_eq!(header.find_field(HEADER_DATE), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
    assert_eq!(header.get_date_field(HEADER_DATE), Some(expected));
}

#[test]
fn basic_authorization_roundtrip() {
    let mut header = Header::new(true);
    assert!(header.set_authorization_field("Aladdin", "open sesame"));
    assert_eq!(
        header.find_field(HEADER_AUTHORIZATION),
        Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
    );
    assert_eq!(
        header.get_authorization_field(),
        Some(("Aladdin".to_owned(), "open sesame".to_owned()))
    );
    // Colons cannot travel in the user name.
    assert!(!header.set_authorization_field("a:b", "pw"));
}

#[test]
fn acceptance_quality_values() {
    let header = parse_request(
        "GET / HTTP/1.1\r\n\
         Accept: text/plain; q=0.5, text/html, text/x-dvi; q=0.8\r\n\
         Accept-Encoding: gzip;q=1.0, identity; q=0.5, *;q=0\r\n\
         \r\n",
        true,
    );
    assert_eq!(header.get_header_acceptance(HEADER_ACCEPT, "text/html", "text/*", "*/*"), 1.0);
    assert_eq!(header.get_header_acceptance(HEADER_ACCEPT, "text/plain", "text/*", "*/*"), 0.5);
    // No exact match: the local wildcard's quality applies... but there is
    // none, so it falls to the global wildcard in Accept-Encoding.
    assert_eq!(header.get_header_acceptance(HEADER_ACCEPT_ENCODING, "deflate", "", "*"), 0.0);
    assert_eq!(header.get_header_acceptance(HEADER_ACCEPT_ENCODING, "gzip", "", "*"), 1.0);
    assert!(header.is_gzip_acceptable_encoding());
    assert!(!header.is_deflate_acceptable_encoding());
}

#[test]
fn transfer_and_content_coding_helpers() {
    let mut header = Header::new(true);
    assert!(!header.is_chunked_transfer());
    header.set_chunked_transfer(true);
    assert!(header.is_chunked_transfer());
    header.set_chunked_transfer(false);
    assert!(!header.has_field(HEADER_TRANSFER_ENCODING));

    header.set_content_encoding(Some("gzip"));
    assert!(header.is_gzip_content_encoding());
    assert!(!header.is_deflate_content_encoding());
    header.set_content_encoding(None);
    assert!(!header.is_gzip_content_encoding());

    header.add_field(HEADER_CONTENT_TYPE, "Text/HTML; charset=utf-8", true);
    assert!(header.is_zippable_content_type());
    header.add_field(HEADER_CONTENT_TYPE, "image/png", true);
    assert!(!header.is_zippable_content_type());
}

#[test]
fn copy_headers_carries_the_first_line() {
    let src = parse_reply("HTTP/1.1 302 Found\r\nLocation: /next\r\n\r\n", true);
    let mut dst = Header::new(true);
    let copied = dst.copy_headers(&src, true);
    assert_eq!(copied, 1);
    assert_eq!(dst.status_code(), StatusCode::FOUND);
    assert_eq!(dst.find_field(HEADER_LOCATION), Some("/next"));
    assert_eq!(dst.first_line_type(), FirstLineType::Status);
}
