//! Transparent body codecs.
//!
//! HTTP bodies and Connect frame payloads are decompressed for inspection
//! and recompressed after modification so the wire format is preserved.
//! All codecs here are buffered — rewrite rules operate on whole payloads,
//! bounded by the size limits in the settings.

use std::io::{Read, Write};
use std::sync::OnceLock;

/// Below this printable ratio a payload is treated as binary and skipped.
pub const BINARY_SKIP_RATIO: f64 = 0.30;
/// At or above this ratio a length-delimited protobuf field is treated as UTF-8 text.
pub const TEXT_FIELD_RATIO: f64 = 0.70;
/// At or above this ratio decoded text is kept as-is for previews.
pub const PREVIEW_KEEP_RATIO: f64 = 0.85;
/// Threshold used by the protobuf JSON projection to choose string vs base64.
pub const PROJECTION_TEXT_RATIO: f64 = 0.50;

/// Whether the zstd codec is usable in this process.
///
/// Probed once with a tiny round-trip; a failure disables zstd rewrites
/// globally (compressed frames are then passed through untouched).
pub fn zstd_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let probe = b"periscope";
        match zstd::stream::encode_all(&probe[..], 1) {
            Ok(encoded) => matches!(
                zstd::stream::decode_all(&encoded[..]),
                Ok(ref decoded) if decoded == probe
            ),
            Err(_) => false,
        }
    })
}

/// True for the encodings this layer can both decompress and recompress.
pub fn is_supported_encoding(encoding: &str) -> bool {
    matches!(
        normalize_encoding(encoding),
        "identity" | "gzip" | "deflate" | "br" | "zstd"
    )
}

fn normalize_encoding(encoding: &str) -> &str {
    let enc = encoding.trim();
    if enc.is_empty() || enc.eq_ignore_ascii_case("identity") {
        return "identity";
    }
    if enc.eq_ignore_ascii_case("gzip") || enc.eq_ignore_ascii_case("x-gzip") {
        return "gzip";
    }
    if enc.eq_ignore_ascii_case("deflate") {
        return "deflate";
    }
    if enc.eq_ignore_ascii_case("br") {
        return "br";
    }
    if enc.eq_ignore_ascii_case("zstd") {
        return "zstd";
    }
    "unknown"
}

pub fn decompress(encoding: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match normalize_encoding(encoding) {
        "identity" => Ok(data.to_vec()),
        "gzip" => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        "deflate" => {
            // HTTP "deflate" is zlib-wrapped in practice, but some servers
            // send raw deflate streams. Try zlib first, fall back to raw.
            let mut out = Vec::new();
            match flate2::read::ZlibDecoder::new(data).read_to_end(&mut out) {
                Ok(_) => Ok(out),
                Err(_) => {
                    let mut out = Vec::new();
                    flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)?;
                    Ok(out)
                }
            }
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(data, 4096).read_to_end(&mut out)?;
            Ok(out)
        }
        "zstd" => {
            if !zstd_available() {
                return Err(unsupported(encoding));
            }
            zstd::stream::decode_all(data)
        }
        _ => Err(unsupported(encoding)),
    }
}

pub fn compress(encoding: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match normalize_encoding(encoding) {
        "identity" => Ok(data.to_vec()),
        "gzip" => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)?;
            enc.finish()
        }
        "deflate" => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)?;
            enc.finish()
        }
        "br" => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(data)?;
                writer.flush()?;
            }
            Ok(out)
        }
        "zstd" => {
            if !zstd_available() {
                return Err(unsupported(encoding));
            }
            zstd::stream::encode_all(data, 3)
        }
        _ => Err(unsupported(encoding)),
    }
}

fn unsupported(encoding: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("unsupported content encoding: {}", encoding),
    )
}

/// Whether a content type is worth decompressing for inspection —
/// textual formats plus the proto/Connect family.
pub fn should_decompress(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("xml")
        || ct.contains("javascript")
        || ct.contains("ecmascript")
        || ct.contains("urlencoded")
        || ct.contains("graphql")
        || ct.contains("proto")
        || ct.contains("grpc")
        || ct.contains("connect")
}

/// Decompress for logging only, bounded by `max_bytes` on the compressed side.
/// Returns `None` when the body is oversize or the codec fails — the caller
/// logs the raw bytes instead.
pub fn decompress_for_logging(encoding: &str, data: &[u8], max_bytes: usize) -> Option<Vec<u8>> {
    if data.len() > max_bytes {
        return None;
    }
    decompress(encoding, data).ok()
}

/// Fraction of bytes that are tab/LF/CR or printable ASCII. Cheap
/// text-vs-binary discriminator; an empty buffer counts as fully printable.
pub fn printable_ratio(buf: &[u8]) -> f64 {
    if buf.is_empty() {
        return 1.0;
    }
    let printable = buf
        .iter()
        .filter(|&&b| b == 0x09 || b == 0x0A || b == 0x0D || (0x20..=0x7E).contains(&b))
        .count();
    printable as f64 / buf.len() as f64
}
