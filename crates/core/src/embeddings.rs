pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

const FNV_OFFSET: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;
const WORD_WEIGHT: f32 = 2.0;

pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;

    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Feature-hashing embedder over lowercase words and character trigrams.
///
/// Deterministic and model-free: identical text always maps to the identical
/// L2-normalized vector, and every component is non-negative.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, feature: &str) -> usize {
        let mut hash = FNV_OFFSET;
        for byte in feature.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        (hash % self.dimensions.max(1) as u64) as usize
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions()];
        let lowered = text.to_lowercase();

        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            vector[self.bucket(word)] += WORD_WEIGHT;

            let padded: Vec<char> = std::iter::once(' ')
                .chain(word.chars())
                .chain(std::iter::once(' '))
                .collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                vector[self.bucket(&trigram)] += 1.0;
            }
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[cfg(test)]
mod tests {
    use super::{Embedder, HashingEmbedder};

    fn dot(left: &[f32], right: &[f32]) -> f32 {
        left.iter().zip(right).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = HashingEmbedder::new(32);
        assert_eq!(embedder.embed("abc").len(), 32);
        assert_eq!(embedder.embed("").len(), 32);
    }

    #[test]
    fn shared_words_score_higher_than_unrelated_text() {
        let embedder = HashingEmbedder::default();
        let chunk = embedder.embed("The Alpha section describes pump maintenance.");
        let related = embedder.embed("What does the alpha section say about maintenance?");
        let unrelated = embedder.embed("zebra quartz xylophone");
        assert!(dot(&chunk, &related) > dot(&chunk, &unrelated));
    }

    #[test]
    fn batch_matches_single_embeddings() {
        let embedder = HashingEmbedder::new(16);
        let batch = embedder.embed_batch(&["one", "two"]);
        assert_eq!(batch, vec![embedder.embed("one"), embedder.embed("two")]);
    }
}
