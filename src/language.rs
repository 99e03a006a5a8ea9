//! Language classification for parsed subtitle tracks.
//!
//! Admission and labeling are deliberately separate concerns: an
//! ASCII-letter ratio decides whether a track is "English enough" to index,
//! while an n-gram detector supplies the `lang` tag stored with the cues.
//! The detector may disagree with the ratio (e.g. a mostly-ASCII track that
//! is actually romanized Korean); its tag wins, but admission stays with the
//! ratio.

use whatlang::Lang;

/// Characters sampled for n-gram detection.
const DETECT_SAMPLE_CHARS: usize = 4096;

#[derive(Debug, Clone)]
pub struct LangVerdict {
    /// ISO-639-1 tag, or "unknown".
    pub tag: String,
    pub is_english: bool,
    pub ascii_ratio: f64,
}

/// Classify the concatenated text of one subtitle track.
pub fn classify(text: &str, min_english_ratio: f64) -> LangVerdict {
    let ratio = ascii_letter_ratio(text);
    let is_english = ratio >= min_english_ratio;

    let sample: String = text.chars().take(DETECT_SAMPLE_CHARS).collect();
    let tag = match whatlang::detect_lang(&sample) {
        Some(lang) => iso639_1(lang).to_string(),
        None => "unknown".to_string(),
    };

    LangVerdict {
        tag,
        is_english,
        ascii_ratio: ratio,
    }
}

/// Ratio of ASCII letters to all letter-class characters. Zero when the text
/// contains no letters at all.
fn ascii_letter_ratio(text: &str) -> f64 {
    let mut letters = 0u64;
    let mut ascii = 0u64;
    for c in text.chars() {
        if c.is_alphabetic() {
            letters += 1;
            if c.is_ascii_alphabetic() {
                ascii += 1;
            }
        }
    }
    if letters == 0 {
        return 0.0;
    }
    ascii as f64 / letters as f64
}

// whatlang reports ISO 639-3; the corpus stores 639-1 where one exists.
fn iso639_1(lang: Lang) -> &'static str {
    match lang {
        Lang::Eng => "en",
        Lang::Kor => "ko",
        Lang::Jpn => "ja",
        Lang::Cmn => "zh",
        Lang::Spa => "es",
        Lang::Fra => "fr",
        Lang::Deu => "de",
        Lang::Ita => "it",
        Lang::Por => "pt",
        Lang::Rus => "ru",
        Lang::Nld => "nl",
        Lang::Swe => "sv",
        Lang::Pol => "pl",
        Lang::Tur => "tr",
        Lang::Vie => "vi",
        Lang::Tha => "th",
        Lang::Ara => "ar",
        Lang::Hin => "hi",
        Lang::Ind => "id",
        _ => "unknown",
    }
}
