use tiktoken_rs::{CoreBPE, tokenizer};

/// Multiplier applied to the input-derived guess of how many tokens a
/// correction will produce. Corrected text tends to come back slightly
/// longer than the submission.
const OUTPUT_ESTIMATE_NUMERATOR: u64 = 11;
const OUTPUT_ESTIMATE_DENOMINATOR: u64 = 10;

/// Estimated token count for `text` under `model`.
///
/// Models with a known tiktoken encoding are counted exactly; everything
/// else falls back to the ~4-characters-per-token heuristic. Backends that
/// report real usage override these numbers at settlement time.
pub fn estimate_tokens(model: &str, text: &str) -> u32 {
    match bpe_for_model(model) {
        Some(bpe) => clamp_usize_to_u32(bpe.encode_with_special_tokens(text).len()),
        None => heuristic_tokens(text),
    }
}

/// Estimated input tokens for a whole optimize request: the text plus any
/// custom instructions and context the prompt will carry.
pub fn estimate_request_tokens(
    model: &str,
    text: &str,
    custom_prompt: Option<&str>,
    context: Option<&str>,
) -> u32 {
    let mut tokens = estimate_tokens(model, text);
    if let Some(prompt) = custom_prompt {
        tokens = tokens.saturating_add(estimate_tokens(model, prompt));
    }
    if let Some(context) = context {
        tokens = tokens.saturating_add(estimate_tokens(model, context));
    }
    tokens
}

pub fn estimate_output_tokens(model: &str, text: &str) -> u32 {
    let tokens = u64::from(estimate_tokens(model, text));
    let estimate = (tokens * OUTPUT_ESTIMATE_NUMERATOR).div_ceil(OUTPUT_ESTIMATE_DENOMINATOR);
    if estimate > u64::from(u32::MAX) {
        u32::MAX
    } else {
        estimate as u32
    }
}

fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    let tokenizer = tokenizer::get_tokenizer(model)?;
    Some(match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    })
}

fn heuristic_tokens(text: &str) -> u32 {
    clamp_usize_to_u32(text.chars().count().div_ceil(4))
}

fn clamp_usize_to_u32(value: usize) -> u32 {
    if value > usize::try_from(u32::MAX).unwrap_or(usize::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}
