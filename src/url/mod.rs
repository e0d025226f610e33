//! Simple ASCII URL splitter: `scheme://[user@]host[:port]/path[?query][#ref]`.
//!
//! Deliberately not a general-purpose URL parser — no IDN, no Unicode
//! normalization, no relative references beyond path resolution. An
//! invalid spec clears every component and flips `is_valid` off; nothing
//! here panics on wire junk.

use std::fmt;

/// Escape-table verdict per byte: ASCII punctuation, controls, and every
/// non-ASCII byte get `%NN`-escaped; alphanumerics and `-._~` pass.
const PASS: u8 = 0;
const ESCAPE: u8 = 1;

#[rustfmt::skip]
const CHAR_LOOKUP: [u8; 0x100] = [
    // control characters
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    // ' '     !       "       #       $       %       &       '
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    // (       )       *       +       ,       -       .       /
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, PASS,   PASS,   ESCAPE,
    // 0-9                                     :       ;       <       =       >       ?
    PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    PASS,   PASS,   ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    // @       A-O
    PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    // P-Z                                     [       \       ]       ^       _
    PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    PASS,   PASS,   PASS,   ESCAPE, ESCAPE, ESCAPE, ESCAPE, PASS,
    // `       a-o
    ESCAPE, PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    // p-z                                     {       |       }       ~       DEL
    PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,   PASS,
    PASS,   PASS,   PASS,   ESCAPE, ESCAPE, ESCAPE, PASS,   ESCAPE,
    // all high-bit bytes are escaped
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
    ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE, ESCAPE,
];

fn hexval(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => 10 + c - b'a',
        b'A'..=b'F' => 10 + c - b'A',
        _ => 0x10,
    }
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Url {
    spec: String,
    is_valid: bool,
    scheme: String,
    user: String,
    host: String,
    port: String,
    path: String,
    query: String,
    fragment: String,
}

impl Url {
    /// Parses an ASCII spec. Check [`is_valid`](Self::is_valid) after.
    pub fn parse(spec: impl Into<String>) -> Self {
        let mut url = Url { spec: spec.into(), ..Url::default() };
        url.parse_spec();
        url
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn is_empty(&self) -> bool {
        self.spec.is_empty()
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn has_port(&self) -> bool {
        !self.port.is_empty()
    }

    pub fn has_query(&self) -> bool {
        !self.query.is_empty()
    }

    pub fn has_fragment(&self) -> bool {
        !self.fragment.is_empty()
    }

    /// Case-sensitive scheme check against a lower-case ASCII scheme.
    pub fn scheme_is(&self, lower_ascii_scheme: &str) -> bool {
        self.scheme == lower_ascii_scheme
    }

    pub fn scheme_is_secure(&self) -> bool {
        self.scheme_is("https")
    }

    /// Numeric port, -1 when absent or unparsable.
    pub fn int_port(&self) -> i32 {
        if self.port.is_empty() {
            return -1;
        }
        match self.port.parse::<u32>() {
            Ok(port) if port > 0 && port <= u16::MAX as u32 => port as i32,
            _ => -1,
        }
    }

    /// The path to put on a request line: path (`/` when empty) plus query
    /// and fragment with their separators.
    pub fn path_for_request(&self) -> String {
        if !self.is_valid {
            return String::new();
        }
        if !self.has_query() && !self.has_fragment() {
            return self.path.clone();
        }
        let mut out = String::new();
        out.push_str(if self.path.is_empty() { "/" } else { &self.path });
        if self.has_query() {
            out.push('?');
            out.push_str(&self.query);
        }
        if self.has_fragment() {
            out.push('#');
            out.push_str(&self.fragment);
        }
        out
    }

    /// Joins `relative` onto this URL's path (normalizing `.`/`..`) and
    /// adopts the relative reference's query and fragment. Resolving
    /// against an invalid URL yields an invalid URL.
    pub fn resolve(&self, relative: &str) -> Url {
        if !self.is_valid {
            return Url::default();
        }
        let mut url = self.clone();
        let (before_fragment, fragment) = match relative.split_once('#') {
            Some((head, fragment)) => (head, fragment),
            None => (relative, ""),
        };
        let (rel_path, query) = match before_fragment.split_once('?') {
            Some((head, query)) => (head, query),
            None => (before_fragment, ""),
        };
        url.path = normalize_url_path(&join_paths(&self.path, rel_path));
        url.query = query.to_owned();
        url.fragment = fragment.to_owned();
        url.reassemble();
        url
    }

    /// Rebuilds `spec` from the components; returns the new spec.
    pub fn reassemble(&mut self) -> &str {
        let mut spec = String::new();
        spec.push_str(&self.scheme);
        spec.push_str("://");
        if !self.user.is_empty() {
            spec.push_str(&self.user);
            spec.push('@');
        }
        spec.push_str(&self.host);
        if !self.port.is_empty() {
            spec.push(':');
            spec.push_str(&self.port);
        }
        spec.push_str(&self.path);
        if !self.query.is_empty() {
            spec.push('?');
            spec.push_str(&self.query);
        }
        if !self.fragment.is_empty() {
            spec.push('#');
            spec.push_str(&self.fragment);
        }
        self.spec = spec;
        &self.spec
    }

    /// Query parameters as `k=v` pairs split on `&`.
    pub fn query_params(&self, unescape: bool) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if self.query.is_empty() {
            return out;
        }
        for piece in self.query.split('&') {
            let piece = if unescape {
                url_unescape(piece.as_bytes())
            } else {
                piece.to_owned()
            };
            match piece.split_once('=') {
                Some((k, v)) => out.push((k.to_owned(), v.to_owned())),
                None => out.push((piece, String::new())),
            }
        }
        out
    }

    fn invalidate(&mut self) {
        *self = Url::default();
    }

    fn parse_spec(&mut self) {
        self.is_valid = true;
        let Some(scheme_pos) = self.spec.find("://") else {
            self.invalidate();
            return;
        };
        self.scheme = self.spec[..scheme_pos].to_owned();
        if self.scheme.is_empty() {
            self.invalidate();
            return;
        }
        let after_scheme = scheme_pos + 3;
        let Some(path_rel) = self.spec[after_scheme..].find('/') else {
            self.invalidate();
            return;
        };
        let path_pos = after_scheme + path_rel;
        let host_port = self.spec[after_scheme..path_pos].to_owned();
        self.parse_host_port(&host_port);

        let tail = &self.spec[path_pos..];
        match tail.find('?') {
            None => match tail.find('#') {
                None => self.path = tail.to_owned(),
                Some(ref_pos) => {
                    self.path = tail[..ref_pos].to_owned();
                    self.fragment = tail[ref_pos + 1..].to_owned();
                }
            },
            Some(query_pos) => {
                self.path = tail[..query_pos].to_owned();
                let query_tail = &tail[query_pos + 1..];
                match query_tail.find('#') {
                    None => self.query = query_tail.to_owned(),
                    Some(ref_pos) => {
                        self.query = query_tail[..ref_pos].to_owned();
                        self.fragment = query_tail[ref_pos + 1..].to_owned();
                    }
                }
            }
        }
    }

    fn parse_host_port(&mut self, host_port: &str) {
        let rest = match host_port.split_once('@') {
            Some((user, rest)) => {
                self.user = user.to_owned();
                rest
            }
            None => host_port,
        };
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                self.host = host.to_owned();
                self.port = port.to_owned();
            }
            None => self.host = rest.to_owned(),
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

// ── Escaping ─────────────────────────────────────────────────────────────────

/// Escapes a piece for inclusion in a URL: everything the lookup table
/// marks becomes `%NN` (uppercase hex).
pub fn url_escape(spec: &[u8]) -> String {
    let mut out = String::with_capacity(spec.len());
    for &b in spec {
        if CHAR_LOOKUP[b as usize] == ESCAPE {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Undoes `%NN` escapes and decodes `+` as space. Malformed escapes pass
/// through untouched.
pub fn url_unescape(spec: &[u8]) -> String {
    let mut out = Vec::with_capacity(spec.len());
    let mut i = 0;
    while i < spec.len() {
        let b = spec[i];
        if b == b'%' && i + 2 < spec.len() {
            let hi = hexval(spec[i + 1]);
            let lo = hexval(spec[i + 2]);
            if hi <= 0xf && lo <= 0xf {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(if b == b'+' { b' ' } else { b });
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Path helpers ─────────────────────────────────────────────────────────────

/// Joins an absolute or relative `rel` onto `base`.
fn join_paths(base: &str, rel: &str) -> String {
    if rel.starts_with('/') || base.is_empty() {
        return rel.to_owned();
    }
    let mut out = base.trim_end_matches('/').to_owned();
    out.push('/');
    out.push_str(rel);
    out
}

/// Collapses `.` and `..` segments; the result always starts with `/`.
fn normalize_url_path(path: &str) -> String {
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    if trailing_slash && out.len() > 1 {
        out.push('/');
    }
    out
}
