use regex::Regex;
use std::sync::OnceLock;

/// Sentinel label for model identifiers with no recognizable quantization token.
pub const UNKNOWN: &str = "Unknown";

/// One quantization matcher: a label family and the pattern that detects it.
///
/// Matchers are evaluated in order and the first match wins, so new
/// quantization schemes are added here without touching call sites.
struct QuantMatcher {
    pattern: &'static str,
    regex: OnceLock<Regex>,
}

impl QuantMatcher {
    const fn new(pattern: &'static str) -> Self {
        Self {
            pattern,
            regex: OnceLock::new(),
        }
    }

    fn find(&self, identifier: &str) -> Option<String> {
        let regex = self
            .regex
            .get_or_init(|| Regex::new(self.pattern).expect("quant matcher pattern is valid"));
        regex
            .find(identifier)
            .map(|m| m.as_str().to_ascii_uppercase())
    }
}

/// Ordered matcher list, highest priority first: bit-width tokens with up
/// to two qualifier tokens (q4_k_m, q8_0, q5_1), then floating-point
/// precision tokens (f16, fp16, bf16, ...).
static QUANT_MATCHERS: [QuantMatcher; 2] = [
    QuantMatcher::new(r"(?i)\bq\d+(?:_[a-z0-9]+){0,2}"),
    QuantMatcher::new(r"(?i)\b(?:bf16|fp16|fp32|f16|f32)\b"),
];

/// Extract the quantization label from a model identifier.
///
/// Case-insensitive; the matched token is upper-cased. Identifiers with no
/// recognizable token yield the `Unknown` sentinel.
pub fn quantization_label(identifier: &str) -> String {
    for matcher in &QUANT_MATCHERS {
        if let Some(label) = matcher.find(identifier) {
            return label;
        }
    }
    UNKNOWN.to_string()
}

/// The last path-separated segment of a model identifier.
pub fn short_name(identifier: &str) -> &str {
    identifier.rsplit('/').next().unwrap_or(identifier)
}

/// Parse the leading numeric portion of a size string ("4.1G" -> 4.1).
///
/// Absent or unparsable sizes are 0.0 so ranking still works; display code
/// uses [`size_display`] to show "Unknown" instead.
pub fn size_gb(size: Option<&str>) -> f64 {
    let Some(size) = size else {
        return 0.0;
    };
    let numeric: String = size
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    numeric.parse().unwrap_or(0.0)
}

/// Human-facing size: the raw upstream string, or "Unknown" when absent.
pub fn size_display(size: Option<&str>) -> String {
    match size {
        Some(size) if !size.trim().is_empty() => size.trim().to_string(),
        _ => UNKNOWN.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantization_bit_width_tokens() {
        assert_eq!(quantization_label("model-Q4_K_M.gguf"), "Q4_K_M");
        assert_eq!(quantization_label("llama-3-8b-q4_0.gguf"), "Q4_0");
        assert_eq!(quantization_label("llama-3-8b-q8_0.gguf"), "Q8_0");
        assert_eq!(
            quantization_label("mistral-7b-v0.3-q4_k_m.gguf"),
            "Q4_K_M"
        );
        assert_eq!(quantization_label("phi-3-mini-4k-q5_1.gguf"), "Q5_1");
    }

    #[test]
    fn test_quantization_precision_tokens() {
        assert_eq!(quantization_label("model-f16"), "F16");
        assert_eq!(quantization_label("model-F32.gguf"), "F32");
        assert_eq!(quantization_label("model-bf16.gguf"), "BF16");
        assert_eq!(quantization_label("model-fp16"), "FP16");
    }

    #[test]
    fn test_quantization_unknown_sentinel() {
        assert_eq!(quantization_label("model-plain"), UNKNOWN);
        assert_eq!(quantization_label(""), UNKNOWN);
        // "qwen" must not look like a bit-width token
        assert_eq!(quantization_label("qwen-7b-instruct"), UNKNOWN);
    }

    #[test]
    fn test_quantization_first_match_wins() {
        // Both token families present: the bit-width matcher has priority
        assert_eq!(quantization_label("model-f16-q4_0.gguf"), "Q4_0");
    }

    #[test]
    fn test_quantization_is_idempotent() {
        let first = quantization_label("models/llama-3-8b-q4_k_m.gguf");
        let second = quantization_label("models/llama-3-8b-q4_k_m.gguf");
        assert_eq!(first, second);
        assert_eq!(first, "Q4_K_M");
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("models/llama-3-8b-q4_0.gguf"), "llama-3-8b-q4_0.gguf");
        assert_eq!(
            short_name("/opt/models/nested/phi-3-mini.gguf"),
            "phi-3-mini.gguf"
        );
        assert_eq!(short_name("plain-name"), "plain-name");
    }

    #[test]
    fn test_size_gb_parses_leading_numeric() {
        assert!((size_gb(Some("4.1G")) - 4.1).abs() < 1e-9);
        assert!((size_gb(Some("13G")) - 13.0).abs() < 1e-9);
        assert!((size_gb(Some(" 0.5G ")) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_size_gb_fallback_to_zero() {
        assert_eq!(size_gb(None), 0.0);
        assert_eq!(size_gb(Some("unknown")), 0.0);
        assert_eq!(size_gb(Some("")), 0.0);
    }

    #[test]
    fn test_size_display() {
        assert_eq!(size_display(Some("4.1G")), "4.1G");
        assert_eq!(size_display(None), UNKNOWN);
        assert_eq!(size_display(Some("  ")), UNKNOWN);
    }
}
