/// Qualifiers appended to every generated prompt.
pub const QUALITY_SUFFIX: &str = "photorealistic, 8k, cinematic lighting, masterpiece";

/// Failure modes steered away from during sampling.
pub const NEGATIVE_PROMPT: &str =
    "low quality, bad quality, sketches, cartoon, blurry, disfigured, bad anatomy";

/// Combines what the captioner saw with what the operator asked for.
pub fn compose_prompt(caption: &str, instruction: &str) -> String {
    format!("{}, {}, {QUALITY_SUFFIX}", caption.trim(), instruction.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_caption_instruction_and_qualifiers() {
        let prompt = compose_prompt("a red car parked on a street", "make it snowy");
        assert_eq!(
            prompt,
            "a red car parked on a street, make it snowy, \
             photorealistic, 8k, cinematic lighting, masterpiece"
        );
        assert_eq!(
            prompt,
            format!("a red car parked on a street, make it snowy, {QUALITY_SUFFIX}")
        );
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(
            compose_prompt(" a dog \n", "  night "),
            format!("a dog, night, {QUALITY_SUFFIX}")
        );
    }
}
