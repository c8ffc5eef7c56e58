use burn::nn::loss::HuberLossConfig;
use burn::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::boxes::{boxes_to_tensor, tensor_to_boxes, tensor_to_vec};
use crate::check_nan;
use crate::config::{MultiboxLossConfig, check_unit_interval};
use crate::error::{SsdError, SsdResult};
use crate::matching::{GroundTruth, MatchKind, MatchResult, Matcher};
use crate::priors::PriorSet;

impl MultiboxLossConfig {
    pub fn init(&self) -> SsdResult<MultiboxLoss> {
        if self.num_classes < 2 {
            return Err(SsdError::config(format!(
                "num_classes includes the background and must be at least 2, got {}",
                self.num_classes
            )));
        }
        check_unit_interval("neg_overlap", self.neg_overlap)?;
        check_unit_interval("object_score", self.object_score)?;

        Ok(MultiboxLoss {
            num_classes: self.num_classes,
            matcher: Matcher::new(self.overlap_thresh, self.variance)?,
            negpos_ratio: self.negpos_ratio,
            object_score: self.object_score,
        })
    }
}

/// Which predictions the ground truth is matched against.
#[derive(Debug, Clone)]
pub enum LossKind<B: Backend> {
    /// Plain SSD: match against the priors.
    Standard,
    /// RefineDet object detection module: match against the priors refined by the anchor
    /// refinement module.
    Refine {
        /// `[batch, num_priors, 4]` offsets predicted by the anchor refinement module.
        arm_loc: Tensor<B, 3>,
        /// `[batch, num_priors, 2]` objectness probabilities of the anchor refinement
        /// module. Only read when `filter_object` is set.
        arm_conf: Tensor<B, 3>,
        /// Drop positives the anchor refinement module already considers background.
        filter_object: bool,
    },
}

/// Result of [`MultiboxLoss::forward`].
#[derive(Debug, Clone)]
pub struct MultiboxLossOutput<B: Backend> {
    /// Smooth L1 localization loss over the positives, divided by `num_pos`. Shape `[1]`.
    pub loc: Tensor<B, 1>,
    /// Cross-entropy over positives and mined negatives, divided by `num_pos`. Shape `[1]`.
    pub conf: Tensor<B, 1>,
    /// Positive priors across the whole batch (`N`).
    pub num_pos: usize,
    /// Negatives kept by hard negative mining, per image.
    pub kept_negatives: Vec<usize>,
}

impl<B: Backend> MultiboxLossOutput<B> {
    /// `loc + conf`, the training objective with α = 1.
    pub fn total(&self) -> Tensor<B, 1> {
        self.loc.clone() + self.conf.clone()
    }
}

/// The SSD multibox training objective.
#[derive(Debug, Clone)]
pub struct MultiboxLoss {
    num_classes: usize,
    matcher: Matcher,
    negpos_ratio: usize,
    object_score: f32,
}

/// Computes the cross-entropy loss for multi-class classification without requiring one-hot
/// encoding similar to how torch cross entropy works.
///
/// # Arguments
/// * `logits` - A 2D tensor of shape `[num_boxes, num_classes]` representing the predicted raw
///   scores (logits) for each class.
/// * `targets` - A 1D tensor of shape `[num_boxes]` containing the integer class labels for each
///   prediction. Each label should be in the range `[0, num_classes - 1]`.
///
/// # Returns
/// A 1D tensor of shape `[num_boxes]` containing the cross-entropy loss for each prediction,
/// which equals `logsumexp(logits) - logits[target]`.
///
/// Further reading:
///
/// Lau, R. (2025, March 5). Cross-Entropy, negative Log-Likelihood, and all that jazz.
///  Towards Data Science.
/// https://towardsdatascience.com/cross-entropy-negative-log-likelihood-and-all-that-jazz-47a95bd2e81/
///
fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,       // [# of boxes, # Classes]
    targets: Tensor<B, 1, Int>, // [# of boxes]
) -> Tensor<B, 1> {
    let [box_count] = targets.dims();

    // Apply log_softmax along the class dimension and convert logits into log-probabilities,
    // which is required by negative log-likelihood.
    //
    //                        ⎛  exp ⎛x ⎞  ⎞
    //                        ⎜      ⎝ i⎠  ⎟
    //  log(softmax(x)) = log ⎜────────────⎟
    //               i        ⎜___         ⎟
    //                        ⎜╲   exp ⎛x ⎞⎟
    //                        ⎜╱       ⎝ i⎠⎟
    //                        ⎝‾‾‾         ⎠

    let log_probabilities = burn::tensor::activation::log_softmax(logits, 1);
    let targets = targets.reshape([box_count, 1]);

    // loss  = -log ⎛P ⎛y , x ⎞⎞
    //     i        ⎝  ⎝ i   i⎠⎠
    //
    let nll = log_probabilities.gather(1, targets) * -1;

    nll.reshape([box_count])
}

/// Hard negative mining - Pg. 6 Liu et al.
///
/// After the matching step, most of the default boxes are negatives, especially when the
/// number of possible default boxes is large. This introduces a significant imbalance
/// between the positive and negative training examples. Instead of using all the negative
/// examples, we sort them using the highest confidence loss for each default box and pick
/// the top ones so that the ratio between the negatives and positives is at most 3:1. We
/// found that this leads to faster optimization and a more stable training.
///
/// Works on one image. Returns prior indices, highest loss first; equal losses keep the
/// lower index first. At most `num_priors - 1` negatives are kept.
fn hard_negatives(conf_loss: &[f32], positive: &[bool], negpos_ratio: usize) -> Vec<usize> {
    let num_pos = positive.iter().filter(|p| **p).count();
    let num_neg = (negpos_ratio * num_pos).min(conf_loss.len().saturating_sub(1));

    let mut candidates: Vec<usize> = (0..conf_loss.len()).filter(|p| !positive[*p]).collect();
    candidates.sort_by(|a, b| conf_loss[*b].total_cmp(&conf_loss[*a]));
    candidates.truncate(num_neg);

    candidates
}

fn check_dims<const D: usize>(
    name: &'static str,
    actual: [usize; D],
    expected: [usize; D],
) -> SsdResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(SsdError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

impl MultiboxLoss {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Computes the localization and confidence losses of a batch.
    ///
    /// - `loc_pred`: `[batch, num_priors, 4]` predicted offsets.
    /// - `conf_pred`: `[batch, num_priors, num_classes]` raw class logits.
    /// - `targets`: ground truth of every image in the batch.
    ///
    /// “SSD: Single Shot MultiBox Detector”
    /// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
    ///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
    /// Link (official): https://arxiv.org/abs/1512.02325
    ///
    /// Training objective - Pg. 5 Liu et al.
    ///
    /// The SSD training objective is derived from the MultiBox objective [7,8] but is extended
    /// to handle multiple object categories. The overall objective loss function is a weighted
    /// sum of the localization loss (loc) and the confidence loss (conf):
    ///
    /// ```text
    ///                 ⎛1⎞
    /// L(x, c, l, g) = ⎜─⎟ ⋅ (Lconf(x, c)) + α ⋅ Lloc(x, l, g))
    ///                 ⎝N⎠
    /// ```
    ///
    /// where N is the number of matched default boxes. If N = 0, we set the loss to 0.
    ///
    /// Here N is counted over the whole batch, and both terms are returned separately.
    pub fn forward<B: Backend>(
        &self,
        loc_pred: Tensor<B, 3>,
        conf_pred: Tensor<B, 3>,
        priors: &PriorSet,
        targets: &[GroundTruth],
        kind: LossKind<B>,
    ) -> SsdResult<MultiboxLossOutput<B>> {
        let device = loc_pred.device();
        let [_, num_priors, _] = loc_pred.dims();
        let batch = targets.len();

        priors.check_count(num_priors)?;
        check_dims("loc_pred", loc_pred.dims(), [batch, num_priors, 4])?;
        check_dims(
            "conf_pred",
            conf_pred.dims(),
            [batch, num_priors, self.num_classes],
        )?;

        let targets = targets
            .iter()
            .map(|t| self.class_targets(t))
            .collect::<SsdResult<Vec<_>>>()?;

        let (arm_loc, objectness) = match kind {
            LossKind::Standard => (None, None),
            LossKind::Refine {
                arm_loc,
                arm_conf,
                filter_object,
            } => {
                check_dims("arm_loc", arm_loc.dims(), [batch, num_priors, 4])?;
                check_dims("arm_conf", arm_conf.dims(), [batch, num_priors, 2])?;

                let arm_loc = tensor_to_boxes(arm_loc.reshape([batch * num_priors, 4]))?;
                let objectness = if filter_object {
                    Some(tensor_to_vec(arm_conf.slice([
                        0..batch,
                        0..num_priors,
                        1..2,
                    ]))?)
                } else {
                    None
                };

                (Some(arm_loc), objectness)
            }
        };

        let matches = targets
            .par_iter()
            .enumerate()
            .map(|(i, truth)| {
                let kind = match &arm_loc {
                    Some(arm_loc) => MatchKind::Refine {
                        arm_loc: &arm_loc[i * num_priors..(i + 1) * num_priors],
                    },
                    None => MatchKind::Standard,
                };
                self.matcher.match_image(priors, truth, kind)
            })
            .collect::<SsdResult<Vec<MatchResult>>>()?;

        // Negative anchor filtering: priors the refinement module scores as background are
        // not positives, but keep their label for the negative pool.
        let positives: Vec<Vec<bool>> = matches
            .iter()
            .enumerate()
            .map(|(i, m)| {
                m.conf_target
                    .iter()
                    .enumerate()
                    .map(|(p, label)| {
                        *label > 0
                            && objectness
                                .as_ref()
                                .is_none_or(|s| s[i * num_priors + p] > self.object_score)
                    })
                    .collect()
            })
            .collect();

        let num_pos: usize = positives
            .iter()
            .map(|pos| pos.iter().filter(|p| **p).count())
            .sum();

        if num_pos == 0 {
            debug!("no positive priors in a batch of {batch}, loss is 0");

            return Ok(MultiboxLossOutput {
                loc: Tensor::zeros([1], &device),
                conf: Tensor::zeros([1], &device),
                num_pos,
                kept_negatives: vec![0; batch],
            });
        }

        let conf_t: Vec<i64> = matches
            .iter()
            .flat_map(|m| m.conf_target.iter().map(|c| *c as i64))
            .collect();
        let conf_t = Tensor::<B, 1, Int>::from_data(
            TensorData::new(conf_t, [batch * num_priors]),
            &device,
        );

        let conf_loss = cross_entropy_loss(
            conf_pred.reshape([batch * num_priors, self.num_classes]),
            conf_t,
        );

        // rank negatives on the host, within each image
        let conf_loss_host = tensor_to_vec(conf_loss.clone())?;
        let negatives: Vec<Vec<usize>> = positives
            .par_iter()
            .enumerate()
            .map(|(i, pos)| {
                hard_negatives(
                    &conf_loss_host[i * num_priors..(i + 1) * num_priors],
                    pos,
                    self.negpos_ratio,
                )
            })
            .collect();

        let mut pos_index = Vec::with_capacity(num_pos);
        let mut loc_t = Vec::with_capacity(num_pos);

        for (i, (m, pos)) in matches.iter().zip(positives.iter()).enumerate() {
            for (p, _) in pos.iter().enumerate().filter(|(_, is_pos)| **is_pos) {
                pos_index.push((i * num_priors + p) as i64);
                loc_t.push(m.loc_target[p]);
            }
        }

        let mut conf_index = pos_index.clone();
        for (i, neg) in negatives.iter().enumerate() {
            conf_index.extend(neg.iter().map(|p| (i * num_priors + p) as i64));
        }

        let n = num_pos as f32;
        let kept_negatives: Vec<usize> = negatives.iter().map(Vec::len).collect();

        // The localization loss is a Smooth L1 loss between the predicted box (l) and the
        // ground truth box (g) parameters.
        let pos_index =
            Tensor::<B, 1, Int>::from_data(TensorData::new(pos_index, [num_pos]), &device);
        let loc_p = loc_pred.reshape([batch * num_priors, 4]).select(0, pos_index);
        let loc_t = boxes_to_tensor::<B>(&loc_t, &device);

        let loc = HuberLossConfig::new(1.0)
            .init()
            .forward_no_reduction(loc_p, loc_t)
            .sum()
            .div_scalar(n);

        let conf_count = conf_index.len();
        let conf_index =
            Tensor::<B, 1, Int>::from_data(TensorData::new(conf_index, [conf_count]), &device);
        let conf = conf_loss.select(0, conf_index).sum().div_scalar(n);

        check_nan!(loc, "localization loss");
        check_nan!(conf, "confidence loss");

        debug!(
            "multibox loss over {batch} images: {num_pos} positives, {} negatives",
            conf_count - num_pos
        );

        Ok(MultiboxLossOutput {
            loc,
            conf,
            num_pos,
            kept_negatives,
        })
    }

    /// Labels as the classifier sees them: collapsed to objectness for a binary head,
    /// otherwise checked against the number of classes.
    fn class_targets(&self, truth: &GroundTruth) -> SsdResult<GroundTruth> {
        if self.num_classes == 2 {
            return GroundTruth::new(truth.boxes().to_vec(), vec![1; truth.len()]);
        }

        if let Some(label) = truth.labels().iter().find(|l| **l >= self.num_classes) {
            return Err(SsdError::InvalidGroundTruth(format!(
                "label {label} is out of range for {} classes",
                self.num_classes
            )));
        }

        Ok(truth.clone())
    }
}
