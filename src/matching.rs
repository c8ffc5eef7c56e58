use crate::boxes::{BoxCoords, center_size, decode, encode, iou};
use crate::config::{Variance, check_unit_interval};
use crate::error::{SsdError, SsdResult};
use crate::priors::PriorSet;

/// Ground truth of one image: corner-form boxes and their class labels.
///
/// Labels start at 1; 0 is the background class and can not be used for an object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    boxes: Vec<BoxCoords>,
    labels: Vec<usize>,
}

impl GroundTruth {
    pub fn new(boxes: Vec<BoxCoords>, labels: Vec<usize>) -> SsdResult<Self> {
        if boxes.len() != labels.len() {
            return Err(SsdError::InvalidGroundTruth(format!(
                "{} boxes but {} labels",
                boxes.len(),
                labels.len()
            )));
        }
        if let Some(i) = labels.iter().position(|l| *l == 0) {
            return Err(SsdError::InvalidGroundTruth(format!(
                "object {i} uses the background label 0"
            )));
        }
        if let Some(i) = boxes.iter().position(|b| !b.iter().all(|v| v.is_finite())) {
            return Err(SsdError::InvalidGroundTruth(format!(
                "object {i} has non-finite coordinates"
            )));
        }

        Ok(GroundTruth { boxes, labels })
    }

    /// An image without any labeled object.
    pub fn empty() -> Self {
        GroundTruth::default()
    }

    pub fn boxes(&self) -> &[BoxCoords] {
        &self.boxes
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Training targets of one image, indexed by prior.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Encoded offset from each prior to its matched ground truth. Only meaningful where
    /// `conf_target` is non-zero.
    pub loc_target: Vec<BoxCoords>,
    /// Class label per prior, 0 for background.
    pub conf_target: Vec<usize>,
    /// Ground truth each prior was assigned to, `None` when the image has no objects.
    pub matched_gt: Vec<Option<usize>>,
}

impl MatchResult {
    fn background(num_priors: usize) -> Self {
        MatchResult {
            loc_target: vec![[0.0; 4]; num_priors],
            conf_target: vec![0; num_priors],
            matched_gt: vec![None; num_priors],
        }
    }

    pub fn num_positives(&self) -> usize {
        self.conf_target.iter().filter(|c| **c > 0).count()
    }

    /// Prior indices with a non-background label, ascending.
    pub fn positive_indices(&self) -> Vec<usize> {
        self.conf_target
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Which anchors the ground truth is matched against.
#[derive(Debug, Clone, Copy)]
pub enum MatchKind<'a> {
    /// The priors themselves.
    Standard,
    /// Priors shifted by the anchor refinement module's offsets (one per prior), as in
    /// the two-step cascaded regression of RefineDet.
    Refine { arm_loc: &'a [BoxCoords] },
}

/// Assigns ground truth boxes to priors.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    threshold: f32,
    variance: Variance,
}

impl Matcher {
    pub fn new(threshold: f32, variance: Variance) -> SsdResult<Self> {
        check_unit_interval("overlap threshold", threshold)?;
        variance.validate()?;

        Ok(Matcher {
            threshold,
            variance,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Matches one image's ground truth against the priors.
    ///
    /// During SSD training, each ground truth box is matched to default boxes across
    /// different locations, aspect ratios, and scales. This function:
    ///
    /// 1. Computes the IoU of every ground truth box against every anchor.
    /// 2. Matches each ground truth box to the anchor with the highest IoU, whatever that
    ///    IoU is, so no object is left without a positive anchor.
    /// 3. Matches every other anchor to the ground truth box it overlaps most, and keeps
    ///    that match as a positive when the IoU reaches the threshold.
    ///
    /// Relevant excerpt from
    ///
    /// “SSD: Single Shot MultiBox Detector”
    /// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
    ///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
    /// Link (official): https://arxiv.org/abs/1512.02325
    ///
    /// Matching strategy - Liu et al. - Pg 6
    ///
    /// We begin by matching each ground truth box to the default box with the best Jaccard
    /// overlap (as in MultiBox [7]). Unlike MultiBox, we then match default boxes to any
    /// ground truth with Jaccard overlap higher than a threshold (0.5). This simplifies the
    /// learning problem, allowing the network to predict high scores for multiple
    /// overlapping default boxes rather than requiring it to pick only the one with maximum
    /// overlap.
    ///
    /// # Ordering
    ///
    /// Argmax ties resolve to the lowest index. The forced matches of step 2 are applied
    /// in ground truth order, so when two ground truth boxes share the same best anchor
    /// the later one keeps it.
    ///
    /// With [`MatchKind::Refine`] the anchors are the priors decoded with `arm_loc`, and
    /// the location targets are encoded against those refined anchors.
    pub fn match_image(
        &self,
        priors: &PriorSet,
        truth: &GroundTruth,
        kind: MatchKind<'_>,
    ) -> SsdResult<MatchResult> {
        let num_priors = priors.len();

        // anchors in corner form for the overlaps, center form for the encoding
        let refined: Option<(Vec<BoxCoords>, Vec<BoxCoords>)> = match kind {
            MatchKind::Standard => None,
            MatchKind::Refine { arm_loc } => {
                priors.check_count(arm_loc.len())?;

                let corner: Vec<BoxCoords> = arm_loc
                    .iter()
                    .zip(priors.center_form().iter())
                    .map(|(offset, prior)| decode(offset, prior, self.variance))
                    .collect();
                let center = corner.iter().map(center_size).collect();

                Some((corner, center))
            }
        };

        let (anchors_corner, anchors_center) = match &refined {
            Some((corner, center)) => (corner.as_slice(), center.as_slice()),
            None => (priors.point_form(), priors.center_form()),
        };

        if truth.is_empty() {
            return Ok(MatchResult::background(num_priors));
        }

        // best ground truth per anchor and best anchor per ground truth in one pass over
        // the overlap matrix
        let mut best_truth_overlap = vec![-1.0f32; num_priors];
        let mut best_truth_idx = vec![0usize; num_priors];
        let mut best_prior_idx = Vec::with_capacity(truth.len());

        for (j, gt) in truth.boxes().iter().enumerate() {
            let mut best_prior = (0usize, -1.0f32);

            for (p, anchor) in anchors_corner.iter().enumerate() {
                let overlap = iou(gt, anchor);

                if overlap > best_prior.1 {
                    best_prior = (p, overlap);
                }
                if overlap > best_truth_overlap[p] {
                    best_truth_overlap[p] = overlap;
                    best_truth_idx[p] = j;
                }
            }

            best_prior_idx.push(best_prior.0);
        }

        // Force every ground truth onto its best anchor. An overlap of 2 is above any
        // threshold, so the anchor always ends up positive.
        for (j, p) in best_prior_idx.iter().enumerate() {
            best_truth_idx[*p] = j;
            best_truth_overlap[*p] = 2.0;
        }

        let mut result = MatchResult::background(num_priors);

        for p in 0..num_priors {
            let j = best_truth_idx[p];

            result.matched_gt[p] = Some(j);
            result.loc_target[p] = encode(&truth.boxes()[j], &anchors_center[p], self.variance);

            if best_truth_overlap[p] >= self.threshold {
                result.conf_target[p] = truth.labels()[j];
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::point_form;
    use crate::config::PriorBoxConfig;
    use crate::debug::assert_approx_eq;

    fn corner_priors(boxes: &[BoxCoords]) -> PriorSet {
        PriorSet::from_center_form(boxes.iter().map(center_size).collect()).unwrap()
    }

    fn dflt_boxes() -> PriorSet {
        corner_priors(&[
            [0.10, 0.10, 0.30, 0.30],
            [0.20, 0.25, 0.40, 0.45],
            [0.60, 0.50, 0.80, 0.70],
            [0.35, 0.15, 0.55, 0.35],
            [0.50, 0.60, 0.70, 0.80],
            [0.25, 0.40, 0.45, 0.60],
            [0.05, 0.65, 0.25, 0.85],
            [0.70, 0.25, 0.90, 0.45],
            [0.10, 0.50, 0.30, 0.70],
            [0.55, 0.05, 0.75, 0.25],
            [0.45, 0.75, 0.65, 0.95],
            [0.20, 0.60, 0.40, 0.80],
            [0.65, 0.40, 0.85, 0.60],
            [0.30, 0.35, 0.50, 0.55],
            [0.15, 0.20, 0.35, 0.40],
            [0.40, 0.10, 0.60, 0.30],
        ])
    }

    #[test]
    fn test_single_prior_exact_match() {
        let priors = PriorSet::from_center_form(vec![[0.5, 0.5, 0.2, 0.2]]).unwrap();
        let truth = GroundTruth::new(vec![[0.4, 0.4, 0.6, 0.6]], vec![3]).unwrap();

        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();
        let result = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();

        assert_eq!(result.conf_target, vec![3]);
        assert_eq!(result.matched_gt, vec![Some(0)]);
        for v in result.loc_target[0].iter() {
            assert_approx_eq(v, &0.0, 1e-5);
        }
    }

    #[test]
    fn test_assign_target_labels_to_default_boxes() {
        let truth = GroundTruth::new(
            vec![
                [0.12, 0.15, 0.30, 0.40],
                [0.05, 0.05, 0.25, 0.20],
                [0.60, 0.10, 0.85, 0.35],
                [0.40, 0.60, 0.65, 0.85],
            ],
            vec![1, 2, 3, 4],
        )
        .unwrap();

        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();
        let result = matcher
            .match_image(&dflt_boxes(), &truth, MatchKind::Standard)
            .unwrap();

        // gt 0 is best matched by prior 14. Prior 0 overlaps gt 0 most, but it is the best
        // prior of gt 1 (IoU 0.27) and gets forced onto it. gt 2 best matches prior 9 and
        // gt 3 prior 4, both below the threshold.
        let mut expected = vec![0; 16];
        expected[0] = 2;
        expected[4] = 4;
        expected[9] = 3;
        expected[14] = 1;

        assert_eq!(result.conf_target, expected);
        assert_eq!(result.matched_gt[0], Some(1));
        assert_eq!(result.num_positives(), 4);
        assert_eq!(result.positive_indices(), vec![0, 4, 9, 14]);
    }

    #[test]
    fn test_forced_match_below_threshold() {
        let priors = corner_priors(&[[0.0, 0.0, 0.2, 0.2], [0.5, 0.5, 0.9, 0.9]]);
        // IoU with prior 0 is 0.01 / 0.04 = 0.25
        let truth = GroundTruth::new(vec![[0.1, 0.1, 0.2, 0.2]], vec![7]).unwrap();

        let matcher = Matcher::new(0.9, Variance::SSD).unwrap();
        let result = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();

        assert_eq!(result.conf_target, vec![7, 0]);
    }

    #[test]
    fn test_forced_match_without_any_overlap() {
        let priors = corner_priors(&[[0.0, 0.0, 0.1, 0.1], [0.2, 0.2, 0.3, 0.3]]);
        let truth = GroundTruth::new(vec![[0.8, 0.8, 0.9, 0.9]], vec![1]).unwrap();

        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();
        let result = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();

        // every IoU is 0, the first prior wins the tie
        assert_eq!(result.conf_target, vec![1, 0]);
    }

    #[test]
    fn test_every_ground_truth_gets_a_positive() {
        let priors = PriorSet::new(&PriorBoxConfig::voc()).unwrap();
        let truth = GroundTruth::new(
            vec![
                [0.02, 0.02, 0.05, 0.06],
                [0.30, 0.30, 0.90, 0.95],
                [0.60, 0.10, 0.70, 0.15],
            ],
            vec![5, 9, 14],
        )
        .unwrap();

        let matcher = Matcher::new(0.99, Variance::SSD).unwrap();
        let result = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();

        for (j, label) in truth.labels().iter().enumerate() {
            let count = (0..priors.len())
                .filter(|p| result.matched_gt[*p] == Some(j) && result.conf_target[*p] == *label)
                .count();
            assert!(count >= 1, "ground truth {j} has no positive prior");
        }
    }

    #[test]
    fn test_empty_ground_truth_is_background() {
        let priors = dflt_boxes();
        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();

        let result = matcher
            .match_image(&priors, &GroundTruth::empty(), MatchKind::Standard)
            .unwrap();

        assert!(result.conf_target.iter().all(|c| *c == 0));
        assert!(result.matched_gt.iter().all(Option::is_none));
        assert_eq!(result.loc_target.len(), 16);
        assert_eq!(result.num_positives(), 0);
    }

    #[test]
    fn test_refine_matches_against_decoded_anchors() {
        let priors = PriorSet::from_center_form(vec![[0.3, 0.3, 0.2, 0.2], [0.7, 0.7, 0.2, 0.2]])
            .unwrap();
        // ground truth sits on the second prior
        let truth = GroundTruth::new(vec![[0.6, 0.6, 0.8, 0.8]], vec![2]).unwrap();

        // refinement moves the first anchor onto the ground truth and the second away
        let shift = 0.4 / (0.1 * 0.2);
        let arm_loc = vec![[shift, shift, 0.0, 0.0], [-shift, -shift, 0.0, 0.0]];

        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();

        let standard = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();
        assert_eq!(standard.conf_target, vec![0, 2]);

        let refined = matcher
            .match_image(&priors, &truth, MatchKind::Refine { arm_loc: &arm_loc })
            .unwrap();
        assert_eq!(refined.conf_target, vec![2, 0]);

        // targets are relative to the refined anchor, which already covers the box
        for v in refined.loc_target[0].iter() {
            assert_approx_eq(v, &0.0, 1e-4);
        }
    }

    #[test]
    fn test_refine_with_zero_offsets_equals_standard() {
        let priors = dflt_boxes();
        let truth = GroundTruth::new(
            vec![[0.12, 0.15, 0.30, 0.40], [0.50, 0.40, 0.75, 0.65]],
            vec![1, 2],
        )
        .unwrap();
        let arm_loc = vec![[0.0; 4]; priors.len()];

        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();
        let standard = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();
        let refined = matcher
            .match_image(&priors, &truth, MatchKind::Refine { arm_loc: &arm_loc })
            .unwrap();

        assert_eq!(standard.conf_target, refined.conf_target);
        assert_eq!(standard.matched_gt, refined.matched_gt);
    }

    #[test]
    fn test_refine_offsets_must_cover_every_prior() {
        let priors = dflt_boxes();
        let truth = GroundTruth::new(vec![[0.1, 0.1, 0.3, 0.3]], vec![1]).unwrap();
        let arm_loc = vec![[0.0; 4]; 3];

        let matcher = Matcher::new(0.5, Variance::SSD).unwrap();
        assert!(matches!(
            matcher.match_image(&priors, &truth, MatchKind::Refine { arm_loc: &arm_loc }),
            Err(SsdError::PriorCountMismatch {
                expected: 16,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(Matcher::new(1.5, Variance::SSD).is_err());
        assert!(Matcher::new(0.5, Variance::new(0.0, 0.2)).is_err());

        assert!(GroundTruth::new(vec![[0.1, 0.1, 0.2, 0.2]], vec![]).is_err());
        assert!(GroundTruth::new(vec![[0.1, 0.1, 0.2, 0.2]], vec![0]).is_err());
        assert!(GroundTruth::new(vec![[0.1, f32::NAN, 0.2, 0.2]], vec![1]).is_err());
    }

    #[test]
    fn test_loc_target_decodes_to_matched_box() {
        let priors = dflt_boxes();
        let truth = GroundTruth::new(vec![[0.33, 0.20, 0.50, 0.45]], vec![1]).unwrap();

        let matcher = Matcher::new(0.3, Variance::SSD).unwrap();
        let result = matcher
            .match_image(&priors, &truth, MatchKind::Standard)
            .unwrap();

        for p in result.positive_indices() {
            let decoded = decode(
                &result.loc_target[p],
                &priors.center_form()[p],
                Variance::SSD,
            );
            for (a, b) in decoded.iter().zip(truth.boxes()[0].iter()) {
                assert_approx_eq(a, b, 1e-5);
            }
            // sanity: the anchor really overlaps the box
            assert!(iou(&point_form(&priors.center_form()[p]), &truth.boxes()[0]) > 0.0);
        }
    }
}
