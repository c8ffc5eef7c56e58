use burn::{prelude::Backend, tensor::Tensor};
use tracing::debug;

use crate::boxes::{BoxCoords, boxes_to_tensor, point_form};
use crate::config::PriorBoxConfig;
use crate::error::{SsdError, SsdResult};
use crate::layers::FeatureLevel;

/// The immutable set of default (prior) boxes of one model configuration.
///
/// Boxes are stored in center form `(cx, cy, w, h)` in generation order, so prior `i`
/// lines up with row `i` of the location and confidence predictions. The corner form is
/// computed once here since matching needs it for every image.
#[derive(Debug, Clone)]
pub struct PriorSet {
    center: Vec<BoxCoords>,
    corner: Vec<BoxCoords>,
    levels: Vec<FeatureLevel>,
}

impl PriorSet {
    /// Generates all default boxes for the feature map levels of `config`.
    ///
    /// Each feature map cell is associated with a set of default boxes of different aspect
    /// ratios and scales. The default boxes tile the feature map in a convolutional manner,
    /// centering them on the "grid points" of the feature map, so the position of each box
    /// relative to its cell is fixed.
    ///
    /// Relevant excerpt from
    ///
    /// “SSD: Single Shot MultiBox Detector”
    /// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
    ///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
    /// Link (official): https://arxiv.org/abs/1512.02325
    ///
    /// Default boxes and aspect ratios - Pg. 4 Liu et al.
    ///
    /// Allowing different default box shapes in several feature maps let us efficiently
    /// discretize the space of possible output box shapes.
    ///
    /// Boxes are emitted level by level, then row by row, column by column, and within a
    /// cell in the order of [`FeatureLevel::default_box_sizes`].
    pub fn new(config: &PriorBoxConfig) -> SsdResult<Self> {
        let levels = config.levels()?;
        let expected: usize = levels.iter().map(FeatureLevel::prior_count).sum();

        let mut center = Vec::with_capacity(expected);

        for level in levels.iter() {
            let centers = level.centers(config.min_dim);
            let box_sizes = level.default_box_sizes(config.min_dim);

            // e.g. for conv4_3 38x38 this is 5776 boxes (38*38*4)
            for cy in centers.iter() {
                for cx in centers.iter() {
                    for (w, h) in box_sizes.iter() {
                        center.push([*cx, *cy, *w, *h]);
                    }
                }
            }
        }

        if config.clip {
            for b in center.iter_mut() {
                *b = b.map(|v| v.clamp(0.0, 1.0));
            }
        }

        if center.len() != expected {
            return Err(SsdError::PriorCountMismatch {
                expected,
                actual: center.len(),
            });
        }

        let mut priors = Self::from_center_form(center)?;
        priors.levels = levels;

        debug!("generated {} priors for {}", priors.len(), config.name);

        Ok(priors)
    }

    /// Wraps externally generated center-form priors.
    ///
    /// Every prior must have a finite, strictly positive width and height, otherwise
    /// encoding a target against it would divide by zero.
    pub fn from_center_form(center: Vec<BoxCoords>) -> SsdResult<Self> {
        if center.is_empty() {
            return Err(SsdError::config("a prior set needs at least one prior"));
        }

        if let Some((index, b)) = center.iter().enumerate().find(|(_, b)| {
            !b.iter().all(|v| v.is_finite()) || b[2] <= 0.0 || b[3] <= 0.0
        }) {
            return Err(SsdError::DegeneratePrior {
                index,
                w: b[2],
                h: b[3],
            });
        }

        let corner = center.iter().map(point_form).collect();

        Ok(PriorSet {
            center,
            corner,
            levels: vec![],
        })
    }

    pub fn len(&self) -> usize {
        self.center.len()
    }

    pub fn is_empty(&self) -> bool {
        self.center.is_empty()
    }

    /// Priors as `(cx, cy, w, h)`.
    pub fn center_form(&self) -> &[BoxCoords] {
        &self.center
    }

    /// Priors as `(x1, y1, x2, y2)`.
    pub fn point_form(&self) -> &[BoxCoords] {
        &self.corner
    }

    /// Feature levels the set was generated from; empty for externally supplied priors.
    pub fn levels(&self) -> &[FeatureLevel] {
        &self.levels
    }

    /// Fails unless a prediction tensor with `actual` rows lines up with this set.
    pub fn check_count(&self, actual: usize) -> SsdResult<()> {
        if actual == self.len() {
            Ok(())
        } else {
            Err(SsdError::PriorCountMismatch {
                expected: self.len(),
                actual,
            })
        }
    }

    /// Verifies the `(height, width)` of the feature maps a detection head actually
    /// produced against the geometry these priors were generated for.
    ///
    /// The head emits `sum(h * w * boxes_per_cell)` predictions; if that differs from the
    /// number of priors, predictions and priors would be silently misaligned.
    pub fn check_feature_shapes(&self, shapes: &[(usize, usize)]) -> SsdResult<()> {
        if self.levels.len() != shapes.len() {
            return Err(SsdError::config(format!(
                "expected {} feature maps, got {}",
                self.levels.len(),
                shapes.len()
            )));
        }

        let actual: usize = self
            .levels
            .iter()
            .zip(shapes.iter())
            .map(|(level, (h, w))| h * w * level.box_count())
            .sum();

        self.check_count(actual)
    }

    /// Center-form priors as a `[num_priors, 4]` tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        boxes_to_tensor(&self.center, device)
    }
}
