/// Text matcher module
///
/// Normalizes machine transcripts and configured phrase variations into a
/// common form, then matches with tolerance for single-character ASR noise:
/// exact substring containment first, Levenshtein-1 token windows second.

use crate::keywords::{KeywordId, VariationId};
use tracing::trace;

/// A phrase variation located inside a transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub keyword_id: KeywordId,
    pub variation_id: VariationId,

    /// Index of the first matched token in the normalized transcript
    pub token_index: usize,

    /// Number of transcript tokens the match spans
    pub token_count: usize,

    /// Total tokens in the normalized transcript
    pub transcript_tokens: usize,
}

impl TextMatch {
    /// Fractional position of the match inside the transcript, used to
    /// interpolate an event time between the window's recognized speech
    /// start and end offsets.
    pub fn position_fraction(&self) -> f64 {
        if self.transcript_tokens <= 1 {
            return 0.0;
        }
        self.token_index as f64 / self.transcript_tokens as f64
    }
}

/// A phrase variation prepared for matching.
#[derive(Debug, Clone)]
pub struct NormalizedPhrase {
    pub variation_id: VariationId,
    pub text: String,
    pub tokens: Vec<String>,
}

impl NormalizedPhrase {
    pub fn new(variation_id: VariationId, phrase: &str) -> Option<Self> {
        let text = normalize_text(phrase);
        if text.is_empty() {
            return None;
        }
        let tokens = text.split_whitespace().map(str::to_string).collect();
        Some(Self {
            variation_id,
            text,
            tokens,
        })
    }
}

/// Normalize a transcript or phrase: trim, case-fold, fold Latin
/// diacritics, replace non-alphanumerics with spaces, collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;

    for c in input.trim().chars() {
        for folded in fold_char(c) {
            if folded.is_alphanumeric() {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                for lower in folded.to_lowercase() {
                    out.push(lower);
                }
            } else {
                pending_space = true;
            }
        }
    }

    out
}

/// Strip Latin diacritics; anything else passes through unchanged.
fn fold_char(c: char) -> impl Iterator<Item = char> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'a',
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => 'u',
        'ý' | 'ÿ' | 'Ý' => 'y',
        'ñ' | 'Ñ' => 'n',
        'ç' | 'Ç' => 'c',
        other => other,
    };
    std::iter::once(folded)
}

/// Standard DP edit distance with a two-row rolling array.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Iterate over the longer string, keep rows sized to the shorter one
    let (outer, inner) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };

    let mut prev: Vec<usize> = (0..=inner.len()).collect();
    let mut curr = vec![0usize; inner.len() + 1];

    for (i, &oc) in outer.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &ic) in inner.iter().enumerate() {
            let cost = if oc == ic { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[inner.len()]
}

/// Edit-distance budget for ASR noise. Fixed at one single-character
/// operation regardless of phrase length.
const MAX_EDIT_DISTANCE: usize = 1;

/// Match one prepared phrase against a normalized transcript.
///
/// Tries exact substring containment, then the Levenshtein-1 token-window
/// scan. Returns token position information on success.
pub fn match_phrase(
    keyword_id: &KeywordId,
    phrase: &NormalizedPhrase,
    transcript: &str,
    transcript_token_list: &[&str],
) -> Option<TextMatch> {
    // Cheap path: exact substring containment
    if transcript.contains(&phrase.text) {
        let token_index = substring_token_index(transcript, &phrase.text, transcript_token_list);
        trace!("Exact containment: '{}'", phrase.text);
        return Some(TextMatch {
            keyword_id: keyword_id.clone(),
            variation_id: phrase.variation_id.clone(),
            token_index,
            token_count: phrase.tokens.len(),
            transcript_tokens: transcript_token_list.len(),
        });
    }

    match phrase.tokens.len() {
        0 => None,
        1 => {
            let target = &phrase.tokens[0];
            for (i, token) in transcript_token_list.iter().enumerate() {
                if *token == target || levenshtein(token, target) <= MAX_EDIT_DISTANCE {
                    trace!("Fuzzy token match: '{}' ~ '{}'", token, target);
                    return Some(TextMatch {
                        keyword_id: keyword_id.clone(),
                        variation_id: phrase.variation_id.clone(),
                        token_index: i,
                        token_count: 1,
                        transcript_tokens: transcript_token_list.len(),
                    });
                }
            }
            None
        }
        window_len => {
            if transcript_token_list.len() < window_len {
                return None;
            }
            for i in 0..=(transcript_token_list.len() - window_len) {
                let joined = transcript_token_list[i..i + window_len].join(" ");
                if joined == phrase.text || levenshtein(&joined, &phrase.text) <= MAX_EDIT_DISTANCE
                {
                    trace!("Fuzzy window match: '{}' ~ '{}'", joined, phrase.text);
                    return Some(TextMatch {
                        keyword_id: keyword_id.clone(),
                        variation_id: phrase.variation_id.clone(),
                        token_index: i,
                        token_count: window_len,
                        transcript_tokens: transcript_token_list.len(),
                    });
                }
            }
            None
        }
    }
}

/// Token index of the first exact occurrence of `needle` in `transcript`.
fn substring_token_index(transcript: &str, needle: &str, tokens: &[&str]) -> usize {
    let byte_pos = match transcript.find(needle) {
        Some(p) => p,
        None => return 0,
    };

    let mut cursor = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        let start = match transcript[cursor..].find(token) {
            Some(p) => cursor + p,
            None => return 0,
        };
        if start + token.len() > byte_pos {
            return i;
        }
        cursor = start + token.len();
    }
    0
}

/// Match every prepared phrase of every keyword against one transcript.
///
/// Keyword order is evaluation order. Returns all matches; the arbiter
/// decides which (if any) becomes a detection.
pub fn match_transcript(
    keywords: &[(KeywordId, Vec<NormalizedPhrase>)],
    raw_transcript: &str,
) -> Vec<TextMatch> {
    let transcript = normalize_text(raw_transcript);
    if transcript.is_empty() {
        return Vec::new();
    }
    let tokens: Vec<&str> = transcript.split_whitespace().collect();

    let mut matches = Vec::new();
    for (keyword_id, phrases) in keywords {
        for phrase in phrases {
            if let Some(m) = match_phrase(keyword_id, phrase, &transcript, &tokens) {
                matches.push(m);
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn phrase(text: &str) -> NormalizedPhrase {
        NormalizedPhrase::new("var-1".to_string(), text).unwrap()
    }

    fn find(phrase_text: &str, transcript: &str) -> Option<TextMatch> {
        let normalized = normalize_text(transcript);
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        match_phrase(
            &"kw-1".to_string(),
            &phrase(phrase_text),
            &normalized,
            &tokens,
        )
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello, World!  "), "hello world");
        assert_eq!(normalize_text("Café Olé"), "cafe ole");
        assert_eq!(normalize_text("one   two\t\nthree"), "one two three");
        assert_eq!(normalize_text("!!!"), "");
        assert_eq!(normalize_text("it's-fine"), "it s fine");
    }

    #[test]
    fn test_empty_phrase_rejected() {
        assert!(NormalizedPhrase::new("v".to_string(), "  ?! ").is_none());
    }

    #[test_case("kitten", "sitting", 3)]
    #[test_case("flaw", "lawn", 2)]
    #[test_case("", "abc", 3)]
    #[test_case("same", "same", 0)]
    #[test_case("world", "wrold", 2 ; "transposition costs two")]
    #[test_case("stop now", "stopnow", 1)]
    fn test_levenshtein(a: &str, b: &str, expected: usize) {
        assert_eq!(levenshtein(a, b), expected);
        assert_eq!(levenshtein(b, a), expected);
    }

    #[test]
    fn test_exact_substring_always_matches() {
        let m = find("turn on the lights", "please Turn ON the lights now").unwrap();
        assert_eq!(m.token_index, 1);
        assert_eq!(m.token_count, 4);
        assert_eq!(m.transcript_tokens, 6);
    }

    #[test]
    fn test_single_edit_matches() {
        // substitution
        assert!(find("world", "hello wrold test").is_some());
        // deletion in transcript token
        assert!(find("hello", "helo there").is_some());
        // insertion in transcript token
        assert!(find("hello", "hhello there").is_some());
    }

    #[test]
    fn test_two_edits_never_match() {
        assert!(find("hello", "hxlxo there").is_none());
        assert!(find("world", "wrodl maybe").is_none());
    }

    #[test]
    fn test_scenario_hello_wrold() {
        let m = find("world", "hello wrold test").unwrap();
        assert_eq!(m.token_index, 1);
        assert_eq!(m.token_count, 1);
    }

    #[test]
    fn test_scenario_stopnow_rejected() {
        // "stop now" vs joined window "stopnow" is distance 1, but the
        // transcript has no two-token window to slide; single joined token
        // against the two-token phrase needs >= 2 edits elsewhere.
        assert!(find("stop now", "please stopnow").is_none());
    }

    #[test]
    fn test_multi_token_fuzzy_window() {
        let m = find("stop now", "please stop npw everything").unwrap();
        assert_eq!(m.token_index, 1);
        assert_eq!(m.token_count, 2);
    }

    #[test]
    fn test_match_transcript_keyword_order() {
        let keywords = vec![
            (
                "kw-a".to_string(),
                vec![phrase("hello")],
            ),
            (
                "kw-b".to_string(),
                vec![NormalizedPhrase::new("var-2".to_string(), "hello there").unwrap()],
            ),
        ];

        let matches = match_transcript(&keywords, "well hello there friend");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].keyword_id, "kw-a");
        assert_eq!(matches[1].keyword_id, "kw-b");
    }

    #[test]
    fn test_empty_transcript_no_matches() {
        let keywords = vec![("kw-a".to_string(), vec![phrase("hello")])];
        assert!(match_transcript(&keywords, "   ").is_empty());
        assert!(match_transcript(&keywords, "...").is_empty());
    }

    #[test]
    fn test_position_fraction() {
        let m = TextMatch {
            keyword_id: "k".to_string(),
            variation_id: "v".to_string(),
            token_index: 2,
            token_count: 1,
            transcript_tokens: 4,
        };
        assert!((m.position_fraction() - 0.5).abs() < 1e-9);

        let single = TextMatch {
            transcript_tokens: 1,
            token_index: 0,
            ..m
        };
        assert_eq!(single.position_fraction(), 0.0);
    }
}
