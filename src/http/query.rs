//! Query string parsing: ordered pairs, percent-decoded, duplicates kept.

use crate::http::types::percent_decode;
use memchr::memchr;

/// Parse a query string into ordered `(name, value)` pairs.
///
/// The grammar is lenient the way browsers are: a pair without `=` gets
/// an empty value, empty names are kept, and an undecodable percent
/// escape falls back to the literal bytes. Order and duplicates are
/// preserved; callers wanting last-wins semantics can fold the list
/// themselves.
///
/// # Examples
/// ```
/// use polyhttp::query::parse;
///
/// let pairs = parse(b"a=1&flag&a=2", 16).unwrap();
/// assert_eq!(pairs.len(), 3);
/// assert_eq!(pairs[0], ("a".to_string(), "1".to_string()));
/// assert_eq!(pairs[1], ("flag".to_string(), String::new()));
/// assert_eq!(pairs[2], ("a".to_string(), "2".to_string()));
/// ```
pub fn parse(query: &[u8], limit: usize) -> Result<Vec<(String, String)>, Error> {
    let data = match query.first() {
        Some(b'?') => &query[1..],
        _ => query,
    };

    let mut pairs = Vec::new();
    let mut start = 0;

    while start < data.len() {
        if pairs.len() >= limit {
            return Err(Error::OverLimit(limit));
        }

        let end = memchr(b'&', &data[start..])
            .map(|pos| start + pos)
            .unwrap_or(data.len());

        let split = memchr(b'=', &data[start..end]).map(|pos| start + pos);
        let (key, value) = match split {
            Some(eq) => (&data[start..eq], &data[eq + 1..end]),
            None => (&data[start..end], &b""[..]),
        };

        if !(key.is_empty() && value.is_empty()) {
            pairs.push((decode_component(key), decode_component(value)));
        }
        start = end + 1;
    }

    Ok(pairs)
}

#[inline]
fn decode_component(raw: &[u8]) -> String {
    match percent_decode(raw) {
        Some(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
        None => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Query parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// More pairs than the configured limit.
    #[error("query parameter limit exceeded: limit={0}")]
    OverLimit(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn basic() {
        for line in ["a=1&b=2", "?a=1&b=2"] {
            let pairs = parse(line.as_bytes(), 8).unwrap();
            assert_eq!(pairs, owned(&[("a", "1"), ("b", "2")]));
        }
    }

    #[test]
    fn shapes() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[(&str, &str)]); 6] = [
            (b"flag",                 &[("flag", "")]),
            (b"empty=",               &[("empty", "")]),
            (b"=val",                 &[("", "val")]),
            (b"a=1&&b=2",             &[("a", "1"), ("b", "2")]),
            (b"k=a=b",                &[("k", "a=b")]),
            (b"",                     &[]),
        ];

        for (input, expected) in cases {
            assert_eq!(parse(input, 10).unwrap(), owned(expected), "{input:?}");
        }
    }

    #[test]
    fn percent_decoded() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[(&str, &str)]); 4] = [
            (b"name=John%20Doe",      &[("name", "John Doe")]),
            (b"email=u%40example.com", &[("email", "u@example.com")]),
            (b"path=%2Ftmp%2Fx",      &[("path", "/tmp/x")]),
            // Bad escape falls back to the literal bytes.
            (b"pct=100%",             &[("pct", "100%")]),
        ];

        for (input, expected) in cases {
            assert_eq!(parse(input, 10).unwrap(), owned(expected), "{input:?}");
        }
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let pairs = parse(b"a=1&a=2&a=3", 10).unwrap();
        assert_eq!(pairs, owned(&[("a", "1"), ("a", "2"), ("a", "3")]));
    }

    #[test]
    fn limit_enforced() {
        assert_eq!(parse(b"a&a&a", 2), Err(Error::OverLimit(2)));
    }
}
