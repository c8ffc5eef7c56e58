use crate::error::{SsdError, SsdResult};

/// One convolutional feature map level that default (prior) boxes are tiled over.
///
/// Relevant excerpt from
///
/// “SSD: Single Shot MultiBox Detector”
/// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
/// Link (official): https://arxiv.org/abs/1512.02325
///
/// - Liu et al. - Pg 3
///
/// Multi-scale feature maps for detection
///
/// We add convolutional feature layers to the end of the truncated base network. These
/// layers decrease in size progressively and allow predictions of detections at multiple
/// scales. The convolutional model for predicting detections is different for each feature
/// layer (cf Overfeat[4] and YOLO[5] that operate on a single scale feature map).
///
/// Levels are square: a level of `size` 38 has 38x38 cells. The backbone producing the
/// maps does not matter, only the resulting geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLevel {
    /// Number of cells along each side of the feature map.
    pub size: usize,
    /// Input pixels per cell.
    pub step: usize,
    /// Side of the smallest square box, in input pixels.
    pub min_size: f32,
    /// When set, adds a square box of side `sqrt(min_size * max_size)` per cell.
    pub max_size: Option<f32>,
    /// Extra aspect ratios; each adds a `ar` and a `1/ar` box per cell.
    pub aspect_ratios: Vec<f32>,
}

impl FeatureLevel {
    pub fn new(
        size: usize,
        step: usize,
        min_size: f32,
        max_size: Option<f32>,
        aspect_ratios: Vec<f32>,
    ) -> SsdResult<Self> {
        let positive = |v: f32| v.is_finite() && v > 0.0;

        if size == 0 || step == 0 {
            return Err(SsdError::config(format!(
                "feature map size ({size}) and step ({step}) must be positive"
            )));
        }
        if !positive(min_size) || max_size.is_some_and(|m| !positive(m)) {
            return Err(SsdError::config(format!(
                "box sizes must be positive, got min {min_size} max {max_size:?}"
            )));
        }
        if let Some(ar) = aspect_ratios.iter().find(|ar| !positive(**ar)) {
            return Err(SsdError::config(format!(
                "aspect ratios must be positive, got {ar}"
            )));
        }

        Ok(FeatureLevel {
            size,
            step,
            min_size,
            max_size,
            aspect_ratios,
        })
    }

    /// Number of default boxes generated for each cell of this level.
    pub fn box_count(&self) -> usize {
        // Add default box for aspect ratio 1, plus the optional larger square
        1 + usize::from(self.max_size.is_some()) + 2 * self.aspect_ratios.len()
    }

    /// Total number of default boxes on this level.
    pub fn prior_count(&self) -> usize {
        self.size * self.size * self.box_count()
    }

    /// Returns the `(width, height)` of every default box of one cell, relative to the
    /// input size, in generation order.
    pub fn default_box_sizes(&self, min_dim: usize) -> Vec<(f32, f32)> {
        let min_dim = min_dim as f32;
        let mut box_sizes = Vec::with_capacity(self.box_count());

        let s_k = self.min_size / min_dim;
        box_sizes.push((s_k, s_k));

        if let Some(max_size) = self.max_size {
            let s_k_prime = (s_k * (max_size / min_dim)).sqrt();
            box_sizes.push((s_k_prime, s_k_prime));
        }

        for ar in self.aspect_ratios.iter() {
            let r = ar.sqrt();
            box_sizes.push((s_k * r, s_k / r));
            box_sizes.push((s_k / r, s_k * r));
        }

        box_sizes
    }

    /// Relative cell centers along one axis.
    ///
    /// We set the center of each default box to (i+0.5)/|fk|, (j+0.5)/|fk| where |fk|
    /// is `min_dim / step`, the size of the k-th square feature map in steps,
    /// i, j ∈ [0, size).
    pub fn centers(&self, min_dim: usize) -> Vec<f32> {
        let f_k = min_dim as f32 / self.step as f32;
        (0..self.size).map(|i| (i as f32 + 0.5) / f_k).collect()
    }
}
