//! SAMI (`.smi`) parsing.

use anyhow::{bail, Result};

use super::Cue;

/// Tail duration for the final cue, which has no successor to end it.
const FINAL_CUE_TAIL_MS: u64 = 5_000;

/// Parse SAMI text into raw cues.
///
/// Cues are introduced by `<SYNC Start=N>`; a cue's text runs until the next
/// `<SYNC>` tag. End times are derived: one millisecond before the next
/// cue's start, or a fixed tail after the last.
pub fn parse(text: &str) -> Result<Vec<Cue>> {
    let mut starts_and_text: Vec<(u64, String)> = Vec::new();
    let lower = text.to_ascii_lowercase();

    let mut pos = 0usize;
    while let Some(rel) = lower[pos..].find("<sync") {
        let tag_start = pos + rel;
        let Some(tag_len) = lower[tag_start..].find('>') else {
            bail!("malformed cue at byte {}: unterminated <SYNC> tag", tag_start);
        };
        let tag_end = tag_start + tag_len + 1;

        let attrs = &text[tag_start + 5..tag_end - 1];
        let Some(start_ms) = parse_start_attr(attrs) else {
            bail!(
                "malformed cue at byte {}: <SYNC> without a Start attribute",
                tag_start
            );
        };

        let body_end = lower[tag_end..]
            .find("<sync")
            .map(|n| tag_end + n)
            .unwrap_or(text.len());
        starts_and_text.push((start_ms, text[tag_end..body_end].to_string()));
        pos = body_end;
    }

    let mut cues = Vec::with_capacity(starts_and_text.len());
    for i in 0..starts_and_text.len() {
        let (start_ms, ref body) = starts_and_text[i];
        let end_ms = match starts_and_text.get(i + 1) {
            Some(&(next_start, _)) => next_start.saturating_sub(1),
            None => start_ms + FINAL_CUE_TAIL_MS,
        };
        cues.push(Cue {
            start_ms,
            end_ms,
            // <P>/<FONT>/<BR> and friends are stripped by the shared pass.
            text: body.clone(),
        });
    }
    Ok(cues)
}

fn parse_start_attr(attrs: &str) -> Option<u64> {
    let lower = attrs.to_ascii_lowercase();
    let idx = lower.find("start")?;
    let rest = &attrs[idx + 5..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let digits: String = rest
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_cues_end_times() {
        let text = "<SAMI><BODY>\n<SYNC Start=5000><P Class=ENCC>One\n<SYNC Start=9000><P Class=ENCC>Two\n</BODY></SAMI>";
        let cues = parse(text).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start_ms, 5000);
        assert_eq!(cues[0].end_ms, 8999);
        assert_eq!(cues[1].start_ms, 9000);
        assert_eq!(cues[1].end_ms, 14_000);
    }

    #[test]
    fn test_case_insensitive_and_quoted_attr() {
        let text = "<sync start=\"1500\"><p>quoted\n<SYNC START=2500><p>next";
        let cues = parse(text).unwrap();
        assert_eq!(cues[0].start_ms, 1500);
        assert_eq!(cues[1].start_ms, 2500);
    }

    #[test]
    fn test_sync_without_start_is_error() {
        let text = "<SYNC End=100><P>broken";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_no_cues() {
        let cues = parse("<SAMI><BODY></BODY></SAMI>").unwrap();
        assert!(cues.is_empty());
    }

    #[test]
    fn test_markup_survives_to_shared_stripper() {
        let text = "<SYNC Start=0><P Class=ENCC>Hello<br>there";
        let cues = parse(text).unwrap();
        assert_eq!(crate::subtitle::clean_text(&cues[0].text), "Hello\nthere");
    }
}
