//! Coarse band profile of a frame and profile similarity

use crate::audio::{mean, Frame};

/// Number of bands in a frequency profile
pub const PROFILE_BANDS: usize = 8;

/// Mean energy of eight contiguous, equal-width bands
pub type FrequencyProfile = [f32; PROFILE_BANDS];

/// Reduce a frame into its eight-band profile.
///
/// Band width is `len / 8` (integer division); trailing bins beyond
/// `8 * (len / 8)` are not counted. Frames shorter than eight bins give an
/// all-zero profile.
pub fn frequency_profile(frame: &Frame) -> FrequencyProfile {
    let bins = frame.bins();
    let band_size = bins.len() / PROFILE_BANDS;
    let mut profile = [0.0f32; PROFILE_BANDS];

    if band_size == 0 {
        return profile;
    }

    for (band, chunk) in profile.iter_mut().zip(bins.chunks_exact(band_size)) {
        *band = mean(chunk);
    }

    profile
}

/// Cosine similarity of two profiles; 0 when either has zero norm
pub fn cosine_similarity(a: &FrequencyProfile, b: &FrequencyProfile) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
