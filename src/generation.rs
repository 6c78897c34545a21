use crate::SourceImage;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// The remote image generation service.
///
/// Retries, deadlines and failure isolation are handled by the scheduler;
/// implementations only make the call.
#[async_trait]
pub trait GenerationClient: Send + Sync + 'static {
    /// Returns the URL (or inline payload reference) of the generated image.
    async fn generate(&self, prompt: &str, source: &SourceImage)
        -> Result<String, GenerationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    CircuitOpen,
    RetriesExhausted,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::CircuitOpen => f.write_str("circuit open"),
            FallbackReason::RetriesExhausted => f.write_str("retries exhausted"),
        }
    }
}

const SCENES: &[&str] = &[
    "standing on a rooftop at golden hour, cinematic lighting",
    "walking through a neon-lit street at night, light rain",
    "sitting in a sunlit cafe, soft film grain",
    "on a mountain trail in autumn, wide angle",
    "at a beach boardwalk at sunset, pastel tones",
    "in a minimalist studio, high-key lighting",
    "in a botanical greenhouse, diffused daylight",
    "on a city rooftop garden, overcast sky",
];

const PRODUCTS: &[&str] = &[
    "wearing a tailored wool coat",
    "wearing white leather sneakers",
    "wearing a linen summer shirt",
    "wearing a knitted scarf and beanie",
    "wearing a denim jacket",
];

/// One in `PRODUCT_EVERY` positions (by hash) features a catalog product.
const PRODUCT_EVERY: u64 = 4;

/// Whether a feed position renders as a product card. Fixed hash rule, so a
/// position always lands on the same side.
pub fn is_product_slot(position: u64) -> bool {
    fnv1a(&position.to_le_bytes()) % PRODUCT_EVERY == 0
}

/// Prompt for a feed position. The same position always yields the same prompt.
pub fn prompt_for_position(position: u64) -> String {
    let scene = SCENES[(position % SCENES.len() as u64) as usize];
    if is_product_slot(position) {
        let product = PRODUCTS[(position / PRODUCT_EVERY % PRODUCTS.len() as u64) as usize];
        format!("the person {product}, {scene}")
    } else {
        format!("the person {scene}")
    }
}

/// Locally synthesized placeholder used when the service is unavailable.
pub fn fallback_url(position: u64, prompt: &str) -> String {
    let hue = fnv1a(prompt.as_bytes()) % 360;
    format!("fallback://feed/{position}?hue={hue}")
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_is_deterministic() {
        for position in 0..50 {
            assert_eq!(prompt_for_position(position), prompt_for_position(position));
        }
        assert_ne!(prompt_for_position(0), prompt_for_position(1));
    }

    #[test]
    fn test_product_slots_are_a_fraction() {
        let products = (0..1000).filter(|p| is_product_slot(*p)).count();
        assert!(products > 0 && products < 1000);
        for position in (0..1000).filter(|p| is_product_slot(*p)) {
            assert!(prompt_for_position(position).contains("wearing"));
        }
    }

    #[test]
    fn test_fallback_url_is_deterministic() {
        let prompt = prompt_for_position(7);
        assert_eq!(fallback_url(7, &prompt), fallback_url(7, &prompt));
        assert!(fallback_url(7, &prompt).starts_with("fallback://feed/7?hue="));
    }
}
