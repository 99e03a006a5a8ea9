//! Advanced SubStation Alpha (`.ass`/`.ssa`) parsing.

use anyhow::{bail, Result};

use super::Cue;

/// Parse the `[Events]` section of an ASS/SSA file into raw cues.
///
/// The `Format:` line, when present, determines field positions; otherwise
/// the standard v4+ layout is assumed. Only `Dialogue:` lines are read.
pub fn parse(text: &str) -> Result<Vec<Cue>> {
    let mut in_events = false;
    let mut start_idx = 1usize;
    let mut end_idx = 2usize;
    let mut text_idx = 9usize;
    let mut field_count = 10usize;
    let mut cues = Vec::new();

    for (line_no, raw_line) in text.split('\n').enumerate() {
        let line = raw_line.trim();
        if line.starts_with('[') {
            in_events = line.eq_ignore_ascii_case("[events]");
            continue;
        }
        if !in_events {
            continue;
        }

        if let Some(fields) = line.strip_prefix("Format:") {
            let names: Vec<String> = fields
                .split(',')
                .map(|f| f.trim().to_ascii_lowercase())
                .collect();
            field_count = names.len();
            start_idx = position(&names, "start", 1);
            end_idx = position(&names, "end", 2);
            text_idx = position(&names, "text", field_count.saturating_sub(1));
            continue;
        }

        let Some(rest) = line.strip_prefix("Dialogue:") else {
            continue;
        };

        // Text is the final field and may itself contain commas.
        let fields: Vec<&str> = rest.splitn(field_count, ',').collect();
        if fields.len() <= start_idx.max(end_idx) {
            bail!("malformed cue at line {}: truncated Dialogue line", line_no + 1);
        }
        let (Some(start_ms), Some(end_ms)) = (
            parse_ass_timestamp(fields[start_idx]),
            parse_ass_timestamp(fields[end_idx]),
        ) else {
            bail!("malformed cue at line {}: bad timestamp", line_no + 1);
        };
        let body = fields.get(text_idx).copied().unwrap_or("");

        cues.push(Cue {
            start_ms,
            end_ms,
            text: body.replace("\\N", "\n").replace("\\n", "\n"),
        });
    }

    Ok(cues)
}

fn position(names: &[String], field: &str, fallback: usize) -> usize {
    names
        .iter()
        .position(|n| n.as_str() == field)
        .unwrap_or(fallback)
}

/// ASS timestamps are `H:MM:SS.cc` with centisecond precision.
fn parse_ass_timestamp(s: &str) -> Option<u64> {
    let s = s.trim();
    let (hms, centis) = s.rsplit_once('.')?;
    let centis: u64 = centis.trim().parse().ok()?;
    let mut parts = hms.split(':');
    let hours: u64 = parts.next()?.trim().parse().ok()?;
    let minutes: u64 = parts.next()?.trim().parse().ok()?;
    let seconds: u64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    Some((hours * 3600 + minutes * 60 + seconds) * 1000 + centis * 10)
}
