//! Subtitle file encoding detection and decoding.
//!
//! Subtitle files in the wild arrive in a mess of encodings (UTF-8 with and
//! without BOM, UTF-16, CP949/EUC-KR, Shift-JIS, CP1252...). This module
//! reads a file, figures out what it is, and hands back clean UTF-8 text
//! with `\n` line endings.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Bytes sampled for statistical detection.
const DETECT_SAMPLE_LEN: usize = 64 * 1024;

/// Minimum chardet confidence before we trust its verdict.
const MIN_CONFIDENCE: f32 = 0.6;

/// A decoded subtitle file.
#[derive(Debug, Clone)]
pub struct DecodedFile {
    pub text: String,
    /// Label of the encoding that actually produced the text.
    pub encoding: String,
}

/// Read a subtitle file and decode it to UTF-8.
///
/// Detection order: BOM (authoritative), then a statistical pass over the
/// first 64 KiB. When neither yields a confident answer the file is decoded
/// as UTF-8 with replacement characters and a warning is logged; an
/// unreadable file is the only hard error.
pub fn read_subtitle_text(path: &Path) -> Result<DecodedFile> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read subtitle file: {}", path.display()))?;
    Ok(decode_bytes(&bytes, path))
}

fn decode_bytes(bytes: &[u8], path: &Path) -> DecodedFile {
    if let Some(decoded) = decode_bom(bytes) {
        return decoded;
    }

    let sample = &bytes[..bytes.len().min(DETECT_SAMPLE_LEN)];
    let (charset, confidence, _) = chardet::detect(sample);
    let label = chardet::charset2encoding(&charset).to_string();
    debug!(
        "encoding detect: {} -> {} (confidence {:.2})",
        path.display(),
        label,
        confidence
    );

    if confidence > MIN_CONFIDENCE {
        if let Some(enc) = encoding_rs::Encoding::for_label(label.as_bytes()) {
            let (text, used, had_errors) = enc.decode(bytes);
            if !had_errors {
                return DecodedFile {
                    text: normalize(&text),
                    encoding: used.name().to_string(),
                };
            }
            debug!(
                "decode with detected {} had errors, falling back: {}",
                used.name(),
                path.display()
            );
        }
    } else {
        warn!(
            "no confident encoding for {} (best: {} at {:.2}), trying fallbacks",
            path.display(),
            label,
            confidence
        );
    }

    // Fallback chain: CP1252, ISO-8859-1, then permissive UTF-8.
    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
    if !had_errors {
        return DecodedFile {
            text: normalize(&text),
            encoding: "windows-1252".to_string(),
        };
    }
    let latin1: String = bytes.iter().map(|&b| b as char).collect();
    if !latin1.is_empty() || bytes.is_empty() {
        return DecodedFile {
            text: normalize(&latin1),
            encoding: "iso-8859-1".to_string(),
        };
    }
    DecodedFile {
        text: normalize(&String::from_utf8_lossy(bytes)),
        encoding: "utf-8".to_string(),
    }
}

/// Decode from a byte-order mark, if one is present.
///
/// UTF-32 marks are checked before UTF-16 because a UTF-32LE BOM starts with
/// the UTF-16LE one.
fn decode_bom(bytes: &[u8]) -> Option<DecodedFile> {
    if bytes.starts_with(&[0xFF, 0xFE, 0x00, 0x00]) {
        return Some(decode_utf32(&bytes[4..], true));
    }
    if bytes.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        return Some(decode_utf32(&bytes[4..], false));
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(bytes);
        return Some(DecodedFile {
            text: normalize(&text),
            encoding: "utf-16le".to_string(),
        });
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(bytes);
        return Some(DecodedFile {
            text: normalize(&text),
            encoding: "utf-16be".to_string(),
        });
    }
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        let text = String::from_utf8_lossy(&bytes[3..]);
        return Some(DecodedFile {
            text: normalize(&text),
            encoding: "utf-8".to_string(),
        });
    }
    None
}

// encoding_rs has no UTF-32 support; files with this BOM are rare enough
// that a direct code-point conversion suffices.
fn decode_utf32(body: &[u8], little_endian: bool) -> DecodedFile {
    let mut text = String::with_capacity(body.len() / 4);
    for chunk in body.chunks_exact(4) {
        let cp = if little_endian {
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        } else {
            u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        };
        text.push(char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    DecodedFile {
        text: normalize(&text),
        encoding: if little_endian {
            "utf-32le".to_string()
        } else {
            "utf-32be".to_string()
        },
    }
}

/// Normalize line endings to `\n` and drop a stray BOM.
fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}
