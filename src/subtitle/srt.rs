//! SubRip (`.srt`) parsing.

use anyhow::{bail, Result};

use super::{parse_timestamp, Cue};

/// Parse SRT text into raw cues.
///
/// Blocks are separated by blank lines. The numeric index line is optional
/// and ignored; a block whose timing line cannot be parsed is a hard error
/// carrying the offending line number.
pub fn parse(text: &str) -> Result<Vec<Cue>> {
    let mut cues = Vec::new();
    let lines: Vec<&str> = text.split('\n').collect();
    let mut i = 0usize;

    while i < lines.len() {
        // Skip blank lines between blocks.
        while i < lines.len() && lines[i].trim().is_empty() {
            i += 1;
        }
        if i >= lines.len() {
            break;
        }

        let mut line = lines[i].trim();

        // Optional index line.
        if !line.contains("-->") && line.bytes().all(|b| b.is_ascii_digit()) {
            i += 1;
            while i < lines.len() && lines[i].trim().is_empty() {
                i += 1;
            }
            if i >= lines.len() {
                break;
            }
            line = lines[i].trim();
        }

        let Some((start_raw, end_raw)) = line.split_once("-->") else {
            bail!("malformed cue at line {}: expected timing line", i + 1);
        };
        let (Some(start_ms), Some(end_ms)) =
            (parse_timestamp(start_raw), parse_timestamp(end_raw))
        else {
            bail!("malformed cue at line {}: bad timestamp", i + 1);
        };
        i += 1;

        let mut body: Vec<&str> = Vec::new();
        while i < lines.len() && !lines[i].trim().is_empty() {
            body.push(lines[i]);
            i += 1;
        }

        cues.push(Cue {
            start_ms,
            end_ms,
            text: body.join("\n"),
        });
    }

    Ok(cues)
}
