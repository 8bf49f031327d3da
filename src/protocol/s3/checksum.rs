//! SHA-256 helpers and URL/ETag normalization

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn to_base64(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Full-object checksum: base64 SHA-256 over the raw part digests in part order
pub fn compose_checksum<'a, I>(part_digests: I) -> String
where
    I: IntoIterator<Item = &'a [u8; 32]>,
{
    let mut hasher = Sha256::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    to_base64(&hasher.finalize())
}

/// Presigned URLs may arrive base64-encoded
///
/// URLs that already look like URLs are used verbatim. Otherwise the string
/// is decoded and the result used if it is UTF-8 and starts with `http`;
/// anything else is passed through unchanged.
pub fn decode_presigned_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    STANDARD
        .decode(trimmed)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|url| url.starts_with("http"))
        .unwrap_or_else(|| trimmed.to_string())
}

pub fn strip_etag_quotes(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}
