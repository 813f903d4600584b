// src/estimator/mod.rs
// C1: character/word/punctuation heuristic token estimator (spec §4.3).
// Pure function, no I/O, calibrated to undercount by at most ~20% versus a
// real BPE tokenizer on English text; a floor guards against gross
// underestimation that would let context overflow unnoticed.

const PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':', '(', ')', '[', ']', '{', '}', '\'', '"'];

/// Estimate the token count of `text` per the spec §4.3 heuristic.
pub fn estimate(text: &str) -> usize {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let char_count_no_ws = trimmed.chars().filter(|c| !c.is_whitespace()).count();
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let word_count = words.len();
    let punctuation_count = trimmed.chars().filter(|c| PUNCTUATION.contains(c)).count();
    let long_word_count = words.iter().filter(|w| w.chars().count() > 8).count();

    let base = div_ceil(char_count_no_ws, 3.5);
    let punctuation_contribution = ceil_mul(punctuation_count as f64, 0.8);
    let subword_contribution = ceil_mul(long_word_count as f64, 0.3);

    let primary = base + punctuation_contribution + subword_contribution;
    let floor = ((div_ceil(trimmed.chars().count(), 4.0) as f64) * 0.8).floor() as usize;

    primary.max(floor)
}

fn div_ceil(count: usize, divisor: f64) -> usize {
    (count as f64 / divisor).ceil() as usize
}

fn ceil_mul(count: f64, factor: f64) -> usize {
    (count * factor).ceil() as usize
}

/// Whether `current` has reached or exceeded `budget` (spec §4.3).
pub fn threshold_reached(current: i64, budget: i64) -> bool {
    current >= budget
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate(""), 0);
        assert_eq!(estimate("   \n  "), 0);
    }

    #[test]
    fn short_text_uses_floor() {
        // "Hi." -> 3 chars, floor dominates for very short strings.
        let t = estimate("Hi.");
        assert!(t >= 1);
    }

    #[test]
    fn longer_text_scales_with_length() {
        let short = estimate("The quick brown fox jumps.");
        let long = estimate(&"The quick brown fox jumps over the lazy dog. ".repeat(10));
        assert!(long > short * 5);
    }

    #[test]
    fn punctuation_heavy_text_counts_more() {
        let plain = estimate("one two three four five");
        let punctuated = estimate("one, two, three, four, five!");
        assert!(punctuated > plain);
    }

    #[test]
    fn threshold_predicate() {
        assert!(!threshold_reached(3999, 4000));
        assert!(threshold_reached(4000, 4000));
        assert!(threshold_reached(4001, 4000));
    }
}
