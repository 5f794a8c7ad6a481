//! Reference motion classifier: per-pixel differencing with a luminance
//! gate. A stand-in with the same capability surface as a real optical-flow
//! implementation.

use engine::{GrayImage, MotionClassifier};
use tracing::debug;

pub struct DiffClassifier {
    /// Frames darker than this mean luminance never register motion; a dark
    /// scene is mostly sensor noise.
    pub min_mean_luminance: u8,
    /// Absolute per-pixel difference counted as changed.
    pub pixel_threshold: u8,
    /// Fraction of changed pixels that flips the verdict.
    pub trigger_fraction: f64,
}

impl Default for DiffClassifier {
    fn default() -> Self {
        Self { min_mean_luminance: 32, pixel_threshold: 24, trigger_fraction: 0.02 }
    }
}

impl MotionClassifier for DiffClassifier {
    fn classify(&self, current: &GrayImage, next: &GrayImage) -> bool {
        if current.data.len() != next.data.len() {
            debug!("classifier saw mismatched views, treating as no motion");
            return false;
        }
        if current.mean_luminance() < self.min_mean_luminance {
            return false;
        }

        let changed = current
            .data
            .iter()
            .zip(&next.data)
            .filter(|(a, b)| a.abs_diff(**b) > self.pixel_threshold)
            .count();
        let fraction = changed as f64 / current.data.len().max(1) as f64;
        fraction > self.trigger_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(data: Vec<u8>) -> GrayImage {
        let width = data.len() as u32;
        GrayImage { data, width, height: 1 }
    }

    #[test]
    fn identical_views_read_as_still() {
        let classifier = DiffClassifier::default();
        let a = image(vec![120; 64]);
        let b = image(vec![120; 64]);
        assert!(!classifier.classify(&a, &b));
    }

    #[test]
    fn a_moved_block_reads_as_motion() {
        let classifier = DiffClassifier::default();
        let mut a = vec![120u8; 64];
        let mut b = vec![120u8; 64];
        a[0..8].fill(250);
        b[32..40].fill(250);
        assert!(classifier.classify(&image(a), &image(b)));
    }

    #[test]
    fn dark_scenes_are_gated_out() {
        let classifier = DiffClassifier::default();
        let a = image(vec![5; 64]);
        let mut b = vec![5u8; 64];
        b[0..32].fill(200);
        assert!(!classifier.classify(&a, &image(b)));
    }
}
