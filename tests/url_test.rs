use std::net::{IpAddr, Ipv4Addr};

use wharf::addr::HostPort;
use wharf::url::{url_escape, url_unescape, Url};

#[test]
fn full_url_splits_into_components() {
    let url = Url::parse("http://user@example.test:8080/a/b?x=1&y=2#frag");
    assert!(url.is_valid());
    assert_eq!(url.scheme(), "http");
    assert_eq!(url.user(), "user");
    assert_eq!(url.host(), "example.test");
    assert_eq!(url.port(), "8080");
    assert_eq!(url.int_port(), 8080);
    assert_eq!(url.path(), "/a/b");
    assert_eq!(url.query(), "x=1&y=2");
    assert_eq!(url.fragment(), "frag");
}

#[test]
fn query_and_path_for_request() {
    let url = Url::parse("http://h/a/b/c/d?x=10&y=20");
    assert!(url.is_valid());
    assert_eq!(url.scheme(), "http");
    assert_eq!(url.host(), "h");
    assert_eq!(url.path(), "/a/b/c/d");
    assert_eq!(url.query(), "x=10&y=20");
    assert_eq!(url.path_for_request(), "/a/b/c/d?x=10&y=20");
    assert_eq!(url.int_port(), -1);
    assert_eq!(
        url.query_params(true),
        vec![("x".to_owned(), "10".to_owned()), ("y".to_owned(), "20".to_owned())]
    );
}

#[test]
fn invalid_specs_clear_everything() {
    for spec in ["", "no-scheme", "http://hostonly-no-path", "://x/"] {
        let url = Url::parse(spec);
        assert!(!url.is_valid(), "{spec:?} should be invalid");
        assert_eq!(url.scheme(), "");
        assert_eq!(url.host(), "");
        assert_eq!(url.path_for_request(), "");
    }
}

#[test]
fn reassemble_is_the_identity_on_canonical_specs() {
    for spec in [
        "http://h/a/b/c/d?x=10&y=20",
        "https://user@example.test:443/index.html#top",
        "ftp://files.example.test/pub/",
        "http://h/",
    ] {
        let mut url = Url::parse(spec);
        assert!(url.is_valid());
        assert_eq!(url.reassemble(), spec);
        // And parsing a reassembled spec is idempotent.
        let mut again = Url::parse(url.spec());
        assert_eq!(again.reassemble(), spec);
    }
}

#[test]
fn resolve_joins_and_normalizes_paths() {
    let base = Url::parse("http://example.test/app/pages/");
    let resolved = base.resolve("../static/logo.png");
    assert!(resolved.is_valid());
    assert_eq!(resolved.path(), "/app/static/logo.png");
    assert_eq!(resolved.host(), "example.test");

    let absolute = base.resolve("/top?q=1#sec");
    assert_eq!(absolute.path(), "/top");
    assert_eq!(absolute.query(), "q=1");
    assert_eq!(absolute.fragment(), "sec");
    assert_eq!(absolute.spec(), "http://example.test/top?q=1#sec");

    let dotted = base.resolve("./a/./b/../c");
    assert_eq!(dotted.path(), "/app/pages/a/c");
}

#[test]
fn escape_and_unescape() {
    assert_eq!(url_escape(b"plain-text.01"), "plain-text.01");
    assert_eq!(url_escape(b"a b&c"), "a%20b%26c");
    assert_eq!(url_escape(b"\xC3\xA9"), "%C3%A9");

    assert_eq!(url_unescape(b"a%20b%26c"), "a b&c");
    assert_eq!(url_unescape(b"1+2"), "1 2");
    // Malformed escapes pass through untouched.
    assert_eq!(url_unescape(b"100%"), "100%");
    assert_eq!(url_unescape(b"%zz"), "%zz");
    // Round trip.
    assert_eq!(url_unescape(url_escape(b"odd /?&=# value").as_bytes()), "odd /?&=# value");
}

#[test]
fn query_params_decode_plus_and_escapes() {
    let url = Url::parse("http://h/p?a=1+2&b=x%26y&flag");
    assert_eq!(
        url.query_params(true),
        vec![
            ("a".to_owned(), "1 2".to_owned()),
            ("b".to_owned(), "x&y".to_owned()),
            ("flag".to_owned(), String::new()),
        ]
    );
    // Without unescaping the raw pieces survive.
    assert_eq!(url.query_params(false)[1].1, "x%26y");
}

#[test]
fn host_port_validity_and_conversions() {
    let mut hp = HostPort::default();
    assert!(hp.is_invalid());
    assert_eq!(hp.to_socket_addr(), None);

    hp.set_ip(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
    assert!(hp.is_invalid()); // still no port
    hp.set_port(8080);
    assert!(hp.is_valid());
    assert_eq!(hp.to_string(), "10.1.2.3:8080");

    let parsed = HostPort::parse("10.1.2.3:8080");
    assert_eq!(parsed, hp);
    assert_eq!(HostPort::from(parsed.to_socket_addr().unwrap()), parsed);

    let v6 = HostPort::parse("[::1]:443");
    assert!(v6.is_valid());
    assert!(v6.is_ipv6());
    assert!(HostPort::parse("not-an-ip:80").is_invalid());
}
