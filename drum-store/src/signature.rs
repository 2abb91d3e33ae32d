use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use drum_core::RouterError;
use std::collections::HashMap;

type Blake2b8 = Blake2b<U8>;

/// Prefix reserved for response-cache keys.
pub const KEY_PREFIX: &str = "k:";

/// Canonical request signature:
/// `method \0 path \0 header_lines \0 query \0 body`, header lines
/// being key-sorted `"k:v"` pairs joined with `\x01`.
///
/// Decodable back to the request as long as no NUL appears in the
/// method, path, headers or query (the body is unrestricted).
pub fn encode_request_signature(
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    query: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut pairs: Vec<(&String, &String)> = headers.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let header_lines = pairs
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\x01");

    let mut signature = Vec::with_capacity(
        method.len() + path.len() + header_lines.len() + query.len() + body.len() + 4,
    );
    for field in [method.as_bytes(), path.as_bytes(), header_lines.as_bytes(), query.as_bytes()] {
        signature.extend_from_slice(field);
        signature.push(0);
    }
    signature.extend_from_slice(body);
    signature
}

/// The request a signature was computed from.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RequestSignature {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub params: String,
    #[serde(skip)]
    pub body: Vec<u8>,
}

pub fn decode_request_signature(data: &[u8]) -> Result<RequestSignature, RouterError> {
    let mut fields = data.splitn(5, |b| *b == 0);
    let mut next = |name: &str| {
        fields
            .next()
            .ok_or_else(|| RouterError::Store(format!("truncated request signature: {name}")))
    };
    let method = next("method")?;
    let path = next("path")?;
    let header_lines = next("headers")?;
    let params = next("params")?;
    let body = next("body")?;

    let text = |bytes: &[u8], name: &str| {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RouterError::Store(format!("non-utf8 request signature: {name}")))
    };

    let mut headers = HashMap::new();
    if !header_lines.is_empty() {
        for line in header_lines.split(|b| *b == 1) {
            let line = text(line, "headers")?;
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| RouterError::Store("malformed header line".into()))?;
            headers.insert(key.to_string(), value.to_string());
        }
    }

    Ok(RequestSignature {
        method: text(method, "method")?,
        path: text(path, "path")?,
        headers,
        params: text(params, "params")?,
        body: body.to_vec(),
    })
}

/// `"k:"`-prefixed 8-byte Blake2b digest of arbitrary key material.
pub fn make_key(data: &[u8]) -> String {
    let mut hasher = Blake2b8::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut key = String::with_capacity(KEY_PREFIX.len() + 16);
    key.push_str(KEY_PREFIX);
    for byte in digest {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn signature_roundtrip() {
        let hdrs = headers(&[("content-type", "application/json"), ("accept", "*/*")]);
        let encoded = encode_request_signature(
            "GET",
            "/api/wb/foo",
            &hdrs,
            "d1=2024-05-24&d2=2024-06-22",
            b"body \x00 with nul",
        );
        let decoded = decode_request_signature(&encoded).unwrap();
        assert_eq!(decoded.method, "GET");
        assert_eq!(decoded.path, "/api/wb/foo");
        assert_eq!(decoded.headers, hdrs);
        assert_eq!(decoded.params, "d1=2024-05-24&d2=2024-06-22");
        assert_eq!(decoded.body, b"body \x00 with nul");
    }

    #[test]
    fn signature_roundtrip_empty_headers() {
        let encoded = encode_request_signature("POST", "/api/x", &HashMap::new(), "", b"");
        let decoded = decode_request_signature(&encoded).unwrap();
        assert!(decoded.headers.is_empty());
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn key_is_independent_of_header_order() {
        let a = headers(&[("a", "1"), ("b", "2")]);
        // same pairs, inserted in the opposite order
        let b = headers(&[("b", "2"), ("a", "1")]);
        let key_a = make_key(&encode_request_signature("GET", "/p", &a, "q=1", b""));
        let key_b = make_key(&encode_request_signature("GET", "/p", &b, "q=1", b""));
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn key_differs_when_any_field_differs() {
        let base = encode_request_signature("GET", "/p", &HashMap::new(), "q=1", b"x");
        let variants = [
            encode_request_signature("POST", "/p", &HashMap::new(), "q=1", b"x"),
            encode_request_signature("GET", "/q", &HashMap::new(), "q=1", b"x"),
            encode_request_signature("GET", "/p", &headers(&[("h", "1")]), "q=1", b"x"),
            encode_request_signature("GET", "/p", &HashMap::new(), "q=2", b"x"),
            encode_request_signature("GET", "/p", &HashMap::new(), "q=1", b"y"),
        ];
        for variant in variants {
            assert_ne!(make_key(&base), make_key(&variant));
        }
    }

    #[test]
    fn key_format() {
        let key = make_key(b"anything");
        assert!(key.starts_with("k:"));
        assert_eq!(key.len(), 2 + 16); // 8 bytes hex-encoded
    }

    #[test]
    fn truncated_signature_is_an_error() {
        assert!(decode_request_signature(b"GET\x00/p").is_err());
    }
}
