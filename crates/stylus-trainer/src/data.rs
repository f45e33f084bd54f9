//! Batches and the loader contract.

use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::reference::ReferenceModelBuilder;
use crate::{Result, TrainerError};

/// One training batch.
///
/// Waveforms stay on the host with their natural lengths; everything else is
/// padded to the longest item.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Raw waveform samples per utterance.
    pub waves: Vec<Vec<f32>>,
    /// Token ids `[B, L]` (int32).
    pub texts: Array,
    /// Valid tokens per utterance.
    pub input_lengths: Vec<i32>,
    /// Reference token ids `[B, L_ref]`.
    pub ref_texts: Array,
    /// Valid reference tokens per utterance.
    pub ref_lengths: Vec<i32>,
    /// Normalized log-mel spectrograms `[B, M, T]`.
    pub mels: Array,
    /// Valid mel frames per utterance.
    pub mel_lengths: Vec<i32>,
    /// Reference mel spectrograms `[B, M, T_ref]`.
    pub ref_mels: Array,
}

impl Batch {
    /// Number of utterances.
    pub fn batch_size(&self) -> usize {
        self.input_lengths.len()
    }

    /// Check that every per-utterance field agrees on the batch size and that
    /// lengths fit inside the padded arrays.
    pub fn validate(&self) -> Result<()> {
        let b = self.batch_size();
        let consistent = self.waves.len() == b
            && self.mel_lengths.len() == b
            && self.ref_lengths.len() == b
            && self.texts.dim(0) as usize == b
            && self.mels.dim(0) as usize == b;
        if !consistent {
            return Err(TrainerError::contract("loader", "batch fields disagree on batch size"));
        }
        if self.input_lengths.iter().any(|&l| l < 1 || l > self.texts.dim(1)) {
            return Err(TrainerError::contract("loader", "token length outside padded text"));
        }
        if self.mel_lengths.iter().any(|&l| l < 1 || l > self.mels.dim(2)) {
            return Err(TrainerError::contract("loader", "mel length outside padded spectrogram"));
        }
        Ok(())
    }
}

/// Source of batches, one epoch at a time.
pub trait BatchLoader {
    /// Start a new epoch, optionally reshuffling with a new seed.
    fn reset(&mut self, seed: Option<u64>);

    /// Next batch of the current epoch.
    fn next_batch(&mut self) -> Option<Batch>;

    /// Batches per epoch.
    fn num_batches(&self) -> usize;
}

/// In-memory loader over prepared batches.
#[derive(Debug, Clone)]
pub struct VecLoader {
    batches: Vec<Batch>,
    order: Vec<usize>,
    position: usize,
    shuffle: bool,
    seed: u64,
}

impl VecLoader {
    /// Loader yielding `batches` in order.
    pub fn new(batches: Vec<Batch>) -> Self {
        let order = (0..batches.len()).collect();
        Self {
            batches,
            order,
            position: 0,
            shuffle: false,
            seed: 0,
        }
    }

    /// Shuffle batch order on every reset.
    #[must_use]
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }
}

impl BatchLoader for VecLoader {
    fn reset(&mut self, seed: Option<u64>) {
        self.position = 0;
        if self.shuffle {
            if let Some(seed) = seed {
                self.seed = seed;
            }
            let mut rng = StdRng::seed_from_u64(self.seed);
            self.order.shuffle(&mut rng);
        }
    }

    fn next_batch(&mut self) -> Option<Batch> {
        let index = *self.order.get(self.position)?;
        self.position += 1;
        self.batches.get(index).cloned()
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Random batches shaped for the reference model.
///
/// Every utterance gets at least `frames_per_token` aligner frames per token
/// so that a monotonic path always exists.
#[derive(Debug, Clone)]
pub struct SyntheticBatches {
    dims: ReferenceModelBuilder,
    batch_size: usize,
    min_tokens: i32,
    max_tokens: i32,
    frames_per_token: i32,
}

impl SyntheticBatches {
    /// Generator for the given model dimensions.
    pub fn new(dims: ReferenceModelBuilder, batch_size: usize) -> Self {
        Self {
            dims,
            batch_size,
            min_tokens: 4,
            max_tokens: 6,
            frames_per_token: 24,
        }
    }

    /// Token count range per utterance.
    #[must_use]
    pub fn tokens(mut self, min: i32, max: i32) -> Self {
        self.min_tokens = min.max(1);
        self.max_tokens = max.max(self.min_tokens);
        self
    }

    /// Mel frames per token.
    #[must_use]
    pub fn frames_per_token(mut self, frames: i32) -> Self {
        self.frames_per_token = frames.max(1 << self.dims.n_down);
        self
    }

    fn tokens_array(&self, rng: &mut StdRng, lengths: &[i32], width: i32) -> Array {
        let mut data = Vec::with_capacity(lengths.len() * width as usize);
        for &len in lengths {
            for t in 0..width {
                data.push(if t < len { rng.gen_range(1..self.dims.vocab) } else { 0 });
            }
        }
        Array::from_slice(&data, &[lengths.len() as i32, width])
    }

    fn mel_array(&self, rng: &mut StdRng, lengths: &[i32], width: i32) -> Array {
        let m = self.dims.n_mels;
        let b = lengths.len();
        let mut data = vec![0.0f32; b * (m * width) as usize];
        for (i, &len) in lengths.iter().enumerate() {
            for band in 0..m {
                for t in 0..len {
                    let idx = i * (m * width) as usize + (band * width + t) as usize;
                    data[idx] = rng.gen_range(-1.0..0.5);
                }
            }
        }
        Array::from_slice(&data, &[b as i32, m, width])
    }

    /// One batch; `mel_lengths` are even and divisible by the aligner stride.
    pub fn batch(&self, rng: &mut StdRng) -> Batch {
        let b = self.batch_size;
        let stride = 1i32 << self.dims.n_down;
        let step = stride.max(2);

        let input_lengths: Vec<i32> = (0..b)
            .map(|_| rng.gen_range(self.min_tokens..=self.max_tokens))
            .collect();
        let mel_lengths: Vec<i32> = input_lengths
            .iter()
            .map(|&l| {
                let frames = l * self.frames_per_token + rng.gen_range(0..self.frames_per_token);
                (frames / step) * step
            })
            .collect();
        let ref_lengths: Vec<i32> = (0..b)
            .map(|_| rng.gen_range(self.min_tokens..=self.max_tokens))
            .collect();

        let max_tokens = input_lengths.iter().copied().max().unwrap_or(1);
        let max_ref = ref_lengths.iter().copied().max().unwrap_or(1);
        let max_frames = mel_lengths.iter().copied().max().unwrap_or(step);

        let waves = mel_lengths
            .iter()
            .map(|&frames| {
                (0..frames * self.dims.hop)
                    .map(|_| rng.gen_range(-0.5f32..0.5))
                    .collect()
            })
            .collect();

        Batch {
            waves,
            texts: self.tokens_array(rng, &input_lengths, max_tokens),
            input_lengths,
            ref_texts: self.tokens_array(rng, &ref_lengths, max_ref),
            ref_lengths,
            mels: self.mel_array(rng, &mel_lengths, max_frames),
            ref_mels: self.mel_array(rng, &mel_lengths, max_frames),
            mel_lengths,
        }
    }

    /// `count` batches from `seed`.
    pub fn generate(&self, count: usize, seed: u64) -> Vec<Batch> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| self.batch(&mut rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_batches_are_valid() {
        let dims = ReferenceModelBuilder::tiny();
        let batches = SyntheticBatches::new(dims, 3).generate(2, 5);
        for batch in &batches {
            batch.validate().unwrap();
            for (i, &frames) in batch.mel_lengths.iter().enumerate() {
                assert_eq!(frames % 2, 0);
                assert!(frames / 2 >= batch.input_lengths[i]);
                assert_eq!(batch.waves[i].len() as i32, frames * dims.hop);
            }
        }
    }

    #[test]
    fn test_vec_loader_epochs() {
        let batches = SyntheticBatches::new(ReferenceModelBuilder::tiny(), 2).generate(3, 0);
        let mut loader = VecLoader::new(batches).shuffled(1);
        for _ in 0..2 {
            loader.reset(None);
            let mut seen = 0;
            while loader.next_batch().is_some() {
                seen += 1;
            }
            assert_eq!(seen, loader.num_batches());
        }
    }

    #[test]
    fn test_validate_rejects_bad_lengths() {
        let mut batch = SyntheticBatches::new(ReferenceModelBuilder::tiny(), 2).generate(1, 0).remove(0);
        batch.mel_lengths[0] = batch.mels.dim(2) + 1;
        assert!(batch.validate().is_err());
    }
}
