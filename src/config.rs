use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{SsdError, SsdResult};
use crate::layers::FeatureLevel;

/// Scaling applied to the regression targets, `(center, size)`.
///
/// The offsets a prediction head regresses are divided by these values when a
/// target is encoded and multiplied back in when a prediction is decoded. The
/// SSD and RefineDet reference configurations both use `(0.1, 0.2)`, which
/// roughly brings the center and log-size offsets to unit variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Variance {
    pub center: f32,
    pub size: f32,
}

impl Variance {
    pub const SSD: Variance = Variance {
        center: 0.1,
        size: 0.2,
    };

    pub fn new(center: f32, size: f32) -> Self {
        Variance { center, size }
    }

    /// Both components must be finite and strictly positive.
    pub fn validate(&self) -> SsdResult<()> {
        let ok = |v: f32| v.is_finite() && v > 0.0;
        if ok(self.center) && ok(self.size) {
            Ok(())
        } else {
            Err(SsdError::config(format!(
                "variance must be strictly positive, got ({}, {})",
                self.center, self.size
            )))
        }
    }
}

impl Default for Variance {
    fn default() -> Self {
        Variance::SSD
    }
}

/// Anchor generation parameters for one model configuration.
///
/// “SSD: Single Shot MultiBox Detector”
/// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
/// Link (official): https://arxiv.org/abs/1512.02325
///
/// Choosing scales and aspect ratios for default boxes - Pg. 6
///
/// Feature maps from different levels within a network are known to have different
/// (empirical) receptive field sizes. Fortunately, within the SSD framework, the default
/// boxes do not necessary need to correspond to the actual receptive fields of each layer.
/// We design the tiling of default boxes so that specific feature maps learn to be
/// responsive to particular scales of the objects.
///
/// All per-level lists (`feature_maps`, `steps`, `min_sizes`, `aspect_ratios`) must have
/// the same length. `max_sizes` is either empty (RefineDet style, no extra square box per
/// cell) or the same length as `min_sizes`. Sizes and steps are in input pixels, with
/// `min_dim` the square input resolution.
#[derive(Config, Debug)]
pub struct PriorBoxConfig {
    pub name: String,
    pub min_dim: usize,
    pub feature_maps: Vec<usize>,
    pub steps: Vec<usize>,
    pub min_sizes: Vec<f32>,
    pub max_sizes: Vec<f32>,
    pub aspect_ratios: Vec<Vec<f32>>,
    #[config(default = "Variance::SSD")]
    pub variance: Variance,
    #[config(default = true)]
    pub clip: bool,
}

impl PriorBoxConfig {
    /// SSD300 on PASCAL VOC, 8732 priors.
    pub fn voc() -> Self {
        PriorBoxConfig::new(
            "VOC".into(),
            300,
            vec![38, 19, 10, 5, 3, 1],
            vec![8, 16, 32, 64, 100, 300],
            vec![30.0, 60.0, 111.0, 162.0, 213.0, 264.0],
            vec![60.0, 111.0, 162.0, 213.0, 264.0, 315.0],
            vec![
                vec![2.0],
                vec![2.0, 3.0],
                vec![2.0, 3.0],
                vec![2.0, 3.0],
                vec![2.0],
                vec![2.0],
            ],
        )
    }

    /// RefineDet with a 320x320 input on PASCAL VOC, 6375 priors.
    pub fn voc320() -> Self {
        PriorBoxConfig::new(
            "VOC320".into(),
            320,
            vec![40, 20, 10, 5],
            vec![8, 16, 32, 64],
            vec![32.0, 64.0, 128.0, 256.0],
            vec![],
            vec![vec![2.0]; 4],
        )
    }

    /// SSD300 on COCO. Same tiling as [`PriorBoxConfig::voc`] with smaller boxes, since
    /// COCO objects tend to be smaller.
    pub fn coco() -> Self {
        let mut config = PriorBoxConfig::voc();
        config.name = "COCO".into();
        config.min_sizes = vec![21.0, 45.0, 99.0, 153.0, 207.0, 261.0];
        config.max_sizes = vec![45.0, 99.0, 153.0, 207.0, 261.0, 315.0];
        config
    }

    /// Validates the per-level lists and zips them into [`FeatureLevel`]s.
    pub fn levels(&self) -> SsdResult<Vec<FeatureLevel>> {
        let count = self.feature_maps.len();

        if count == 0 {
            return Err(SsdError::config("at least one feature map level is required"));
        }
        if self.min_dim == 0 {
            return Err(SsdError::config("min_dim must be positive"));
        }
        if self.steps.len() != count
            || self.min_sizes.len() != count
            || self.aspect_ratios.len() != count
        {
            return Err(SsdError::config(format!(
                "{}: feature_maps ({}), steps ({}), min_sizes ({}) and aspect_ratios ({}) \
                 must have the same length",
                self.name,
                count,
                self.steps.len(),
                self.min_sizes.len(),
                self.aspect_ratios.len()
            )));
        }
        if !self.max_sizes.is_empty() && self.max_sizes.len() != count {
            return Err(SsdError::config(format!(
                "{}: max_sizes must be empty or have {} entries, got {}",
                self.name,
                count,
                self.max_sizes.len()
            )));
        }
        self.variance.validate()?;

        (0..count)
            .map(|k| {
                FeatureLevel::new(
                    self.feature_maps[k],
                    self.steps[k],
                    self.min_sizes[k],
                    self.max_sizes.get(k).copied(),
                    self.aspect_ratios[k].clone(),
                )
            })
            .collect()
    }
}

/// Hyper-parameters of [`crate::loss::MultiboxLoss`].
///
/// `num_classes` includes the background class at index 0. Setting it to 2 trains a
/// binary objectness head (the RefineDet anchor refinement module), in which case every
/// ground-truth label is collapsed to 1.
#[derive(Config, Debug)]
pub struct MultiboxLossConfig {
    pub num_classes: usize,
    /// IoU a prior needs with its ground truth to count as a positive.
    #[config(default = 0.5)]
    pub overlap_thresh: f32,
    /// Maximum negatives kept per positive during hard negative mining.
    #[config(default = 3)]
    pub negpos_ratio: usize,
    #[config(default = 0.5)]
    pub neg_overlap: f32,
    /// Refine variant: priors whose anchor-refinement objectness is at or below this
    /// value are not used as positives when filtering is enabled.
    #[config(default = 0.01)]
    pub object_score: f32,
    #[config(default = "Variance::SSD")]
    pub variance: Variance,
}

/// Hyper-parameters of [`crate::inference::Detect`].
#[derive(Config, Debug)]
pub struct DetectConfig {
    pub num_classes: usize,
    #[config(default = 0.01)]
    pub conf_thresh: f32,
    #[config(default = 0.45)]
    pub nms_thresh: f32,
    #[config(default = 200)]
    pub max_per_image: usize,
    #[config(default = "Variance::SSD")]
    pub variance: Variance,
}

pub(crate) fn check_unit_interval(name: &str, value: f32) -> SsdResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SsdError::config(format!("{name} must be in [0, 1], got {value}")))
    }
}
