//! Word counting and token estimation.
//!
//! Token figures here are an approximation (a quarter of the text length), not
//! the output of a real tokenizer. Costs derived from them are estimates, not
//! billing-accurate amounts.

/// Count whitespace-separated words. Empty or whitespace-only text counts as zero.
#[must_use]
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Estimate the token count as `ceil(len / 4)`.
///
/// `len` is the UTF-16 code-unit length of the text.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let len = text.encode_utf16().count() as u64;
    len.div_ceil(4)
}
