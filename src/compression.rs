//! CompressionDecider (component C8): the five-step should-we-compress
//! decision from spec §4.8, plus the gzip/brotli encoders it feeds into.

use crate::config::ServerConfig;
use brotli::enc::BrotliEncoderParams;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

const BLOCKED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "zip", "gz", "7z", "rar", "pdf", "mp3", "mp4", "mov",
    "avi", "woff", "woff2",
];

const ALLOWED_MIME_PREFIXES: &[&str] = &["text/"];
const ALLOWED_MIME_EXACT: &[&str] = &[
    "application/json",
    "application/javascript",
    "application/xml",
    "application/xhtml+xml",
    "image/svg+xml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Brotli,
}

impl Codec {
    #[must_use]
    pub fn content_encoding(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Brotli => "br",
        }
    }
}

/// Parses an `Accept-Encoding` header into the set of codecs the client
/// will accept, honoring `q=0` disqualification (spec §4.8).
fn accepted_codecs(accept_encoding: &str) -> (bool, bool) {
    let mut gzip_ok = false;
    let mut brotli_ok = false;
    for token in accept_encoding.split(',') {
        let mut parts = token.split(';');
        let name = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut disqualified = false;
        for param in parts {
            let param = param.trim();
            if let Some(q) = param.strip_prefix("q=") {
                if q.trim() == "0" || q.trim() == "0.0" || q.trim() == "0.000" {
                    disqualified = true;
                }
            }
        }
        match name.as_str() {
            "gzip" if !disqualified => gzip_ok = true,
            "br" if !disqualified => brotli_ok = true,
            _ => {}
        }
    }
    (gzip_ok, brotli_ok)
}

/// Applies the five ordered rules from spec §4.8. `mime_type` should not
/// include the `; charset=...` suffix — callers are expected to strip it
/// before calling, same as spec.md's inputs describe.
#[must_use]
pub fn decide(
    accept_encoding: Option<&str>,
    mime_type: Option<&str>,
    size: u64,
    filename: &str,
    config: &ServerConfig,
) -> Option<Codec> {
    let (gzip_ok, brotli_ok) = accept_encoding.map(accepted_codecs).unwrap_or((false, false));
    if !gzip_ok && !brotli_ok {
        return None;
    }
    if size < config.compression_min_bytes as u64 {
        return None;
    }
    if let Some(ext) = filename.rsplit('.').next() {
        if BLOCKED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return None;
        }
    }
    let mime = mime_type.unwrap_or("").trim();
    let mime_allowed = !mime.is_empty()
        && (ALLOWED_MIME_PREFIXES.iter().any(|p| mime.starts_with(p))
            || ALLOWED_MIME_EXACT.contains(&mime));
    if !mime_allowed {
        return None;
    }
    if brotli_ok {
        Some(Codec::Brotli)
    } else {
        Some(Codec::Gzip)
    }
}

/// Strips a `; charset=...` (or any `;`-delimited parameter) suffix from
/// a MIME type, as spec §4.8 describes its `mime_type` input.
#[must_use]
pub fn strip_mime_parameters(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

pub fn compress(codec: Codec, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match codec {
        Codec::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Codec::Brotli => {
            let params = BrotliEncoderParams::default();
            let mut out = Vec::new();
            brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::default()
    }

    #[test]
    fn no_codec_offered_means_no_compression() {
        assert_eq!(decide(None, Some("text/html"), 10_000, "index.html", &config()), None);
        assert_eq!(
            decide(Some("identity"), Some("text/html"), 10_000, "index.html", &config()),
            None
        );
    }

    #[test]
    fn small_body_is_not_compressed() {
        assert_eq!(
            decide(Some("gzip, br"), Some("text/plain"), 10, "a.txt", &config()),
            None
        );
    }

    #[test]
    fn blocked_extension_is_skipped_even_if_mime_allowed() {
        assert_eq!(
            decide(Some("gzip, br"), Some("text/plain"), 100_000, "photo.png", &config()),
            None
        );
    }

    #[test]
    fn disallowed_mime_is_skipped() {
        assert_eq!(
            decide(Some("gzip, br"), Some("application/octet-stream"), 100_000, "a.bin", &config()),
            None
        );
    }

    #[test]
    fn brotli_preferred_over_gzip_when_both_offered() {
        assert_eq!(
            decide(Some("gzip, br"), Some("text/html"), 100_000, "index.html", &config()),
            Some(Codec::Brotli)
        );
    }

    #[test]
    fn gzip_used_when_brotli_not_offered() {
        assert_eq!(
            decide(Some("gzip"), Some("text/html"), 100_000, "index.html", &config()),
            Some(Codec::Gzip)
        );
    }

    #[test]
    fn q_zero_disqualifies_a_codec() {
        assert_eq!(
            decide(Some("br;q=0, gzip"), Some("text/html"), 100_000, "index.html", &config()),
            Some(Codec::Gzip)
        );
    }

    #[test]
    fn charset_suffix_is_stripped_before_mime_check() {
        assert_eq!(strip_mime_parameters("text/html; charset=utf-8"), "text/html");
    }

    #[test]
    fn gzip_round_trips() {
        let compressed = compress(Codec::Gzip, b"hello hello hello").unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
        assert_eq!(out, "hello hello hello");
    }
}
