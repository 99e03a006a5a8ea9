//! Subtitle track parsing.
//!
//! Each format parser produces raw `(start_ms, end_ms, text)` cues; the
//! shared post-processing pass strips markup, normalizes whitespace, drops
//! empty or inverted cues, clamps corrupt durations, and de-duplicates
//! repeated text within a track.

pub mod ass;
pub mod smi;
pub mod srt;

use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

/// One timed text segment of a subtitle track.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Durations above this are treated as corrupt.
const MAX_CUE_DURATION_MS: u64 = 60_000;

/// Replacement duration for a clamped cue.
const CLAMPED_DURATION_MS: u64 = 10_000;

/// Parse a subtitle file's decoded text, dispatching on its extension.
///
/// Returns cues sorted by `start_ms`, post-processed and de-duplicated.
pub fn parse_track(extension: &str, text: &str) -> Result<Vec<Cue>> {
    let raw = match extension.to_ascii_lowercase().as_str() {
        "srt" => srt::parse(text)?,
        "smi" | "sami" => smi::parse(text)?,
        "ass" | "ssa" => ass::parse(text)?,
        other => bail!("unsupported subtitle format: .{}", other),
    };
    Ok(postprocess(raw))
}

fn postprocess(raw: Vec<Cue>) -> Vec<Cue> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut clamped = 0usize;
    let mut cues: Vec<Cue> = Vec::with_capacity(raw.len());

    for mut cue in raw {
        cue.text = clean_text(&cue.text);
        if cue.text.is_empty() || cue.end_ms <= cue.start_ms {
            continue;
        }
        if cue.end_ms - cue.start_ms > MAX_CUE_DURATION_MS {
            cue.end_ms = cue.start_ms + CLAMPED_DURATION_MS;
            clamped += 1;
        }
        if !seen.insert(cue.text.clone()) {
            continue;
        }
        cues.push(cue);
    }

    if clamped > 0 {
        warn!("clamped {} cue(s) with durations over 60s", clamped);
    }

    cues.sort_by_key(|c| c.start_ms);
    cues
}

/// Strip HTML-ish tags and ASS override blocks, collapse runs of spaces and
/// tabs, and trim each line. Newlines between lines of a cue are preserved.
pub fn clean_text(text: &str) -> String {
    let stripped = strip_tags(text);
    let mut lines: Vec<String> = Vec::new();
    for line in stripped.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '<' => {
                let mut tag = String::new();
                for t in chars.by_ref() {
                    if t == '>' {
                        break;
                    }
                    tag.push(t);
                }
                // <br> variants become line breaks; everything else vanishes.
                if tag.trim_end_matches('/').trim().eq_ignore_ascii_case("br") {
                    out.push('\n');
                }
            }
            '{' => {
                // ASS style override block, e.g. {\an8\i1}
                if chars.peek() == Some(&'\\') {
                    for t in chars.by_ref() {
                        if t == '}' {
                            break;
                        }
                    }
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Parse `HH:MM:SS,mmm` (or with `.` as the millisecond separator) into
/// milliseconds. Tolerates surrounding whitespace and 1-3 millisecond digits.
pub fn parse_timestamp(s: &str) -> Option<u64> {
    let s = s.trim();
    let (hms, millis) = match s.rsplit_once([',', '.']) {
        Some((hms, frac)) => {
            let frac = frac.trim();
            if frac.is_empty() || frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            // "1" means 100ms, "12" means 120ms
            let padded = format!("{:0<3}", frac);
            (hms, padded.parse::<u64>().ok()?)
        }
        None => (s, 0),
    };

    let mut parts = hms.split(':');
    let hours: u64 = parts.next()?.trim().parse().ok()?;
    let minutes: u64 = parts.next()?.trim().parse().ok()?;
    let seconds: u64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    Some((hours * 3600 + minutes * 60 + seconds) * 1000 + millis)
}

/// Render milliseconds as `HH:MM:SS,mmm` for display columns.
pub fn format_timestamp(ms: u64) -> String {
    let millis = ms % 1000;
    let total_secs = ms / 1000;
    let seconds = total_secs % 60;
    let minutes = (total_secs / 60) % 60;
    let hours = total_secs / 3600;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}
