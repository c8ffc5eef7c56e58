use burn::tensor::{Tensor, TensorData, backend::Backend};
use rayon::prelude::*;
use tracing::debug;

use crate::boxes::{BoxCoords, decode, tensor_to_boxes, tensor_to_vec};
use crate::config::{DetectConfig, Variance, check_unit_interval};
use crate::error::{SsdError, SsdResult};
use crate::nms::nms;
use crate::priors::PriorSet;

/// Values per detection row: `score, x1, y1, x2, y2`.
pub const DETECTION_WIDTH: usize = 5;

impl DetectConfig {
    pub fn init(&self) -> SsdResult<Detect> {
        if self.num_classes < 2 {
            return Err(SsdError::config(format!(
                "num_classes includes the background and must be at least 2, got {}",
                self.num_classes
            )));
        }
        if !(self.nms_thresh.is_finite() && self.nms_thresh > 0.0) {
            return Err(SsdError::config(format!(
                "nms_thresh must be positive, got {}",
                self.nms_thresh
            )));
        }
        if self.max_per_image == 0 {
            return Err(SsdError::config("max_per_image must be at least 1"));
        }
        check_unit_interval("conf_thresh", self.conf_thresh)?;
        self.variance.validate()?;

        Ok(Detect {
            num_classes: self.num_classes,
            conf_thresh: self.conf_thresh,
            nms_thresh: self.nms_thresh,
            max_per_image: self.max_per_image,
            variance: self.variance,
        })
    }
}

/// One detected object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub score: f32,
    /// Corner form, relative to the image size.
    pub bbox: BoxCoords,
}

/// Detections of one image as a dense `[num_classes, max_per_image, 5]` block.
///
/// Each class owns `max_per_image` rows of `(score, x1, y1, x2, y2)`, filled highest score
/// first and zero padded. Class 0 is the background and is always zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Detections {
    num_classes: usize,
    max_per_image: usize,
    data: Vec<f32>,
}

impl Detections {
    fn zeros(num_classes: usize, max_per_image: usize) -> Self {
        Detections {
            num_classes,
            max_per_image,
            data: vec![0.0; num_classes * max_per_image * DETECTION_WIDTH],
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.num_classes, self.max_per_image, DETECTION_WIDTH]
    }

    /// The raw row-major block.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Row `rank` of `class_id`, `None` when that row is padding.
    pub fn slot(&self, class_id: usize, rank: usize) -> Option<Detection> {
        if class_id >= self.num_classes || rank >= self.max_per_image {
            return None;
        }

        let start = (class_id * self.max_per_image + rank) * DETECTION_WIDTH;
        let row = &self.data[start..start + DETECTION_WIDTH];

        // kept scores are above a non-negative threshold
        (row[0] > 0.0).then(|| Detection {
            class_id,
            score: row[0],
            bbox: [row[1], row[2], row[3], row[4]],
        })
    }

    /// Number of detections of `class_id`.
    pub fn count(&self, class_id: usize) -> usize {
        (0..self.max_per_image)
            .take_while(|rank| self.slot(class_id, *rank).is_some())
            .count()
    }

    /// All detections, by class and then by descending score.
    pub fn iter(&self) -> impl Iterator<Item = Detection> + '_ {
        (1..self.num_classes).flat_map(move |class_id| {
            (0..self.max_per_image).map_while(move |rank| self.slot(class_id, rank))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.dims()), device)
    }
}

/// Turns the raw predictions of a trained model into per-class detections.
///
/// At inference, the location predictions are decoded against the priors, boxes below the
/// confidence threshold are discarded, and non-maximum suppression is applied to each class
/// on its own. Classes never suppress each other.
#[derive(Debug, Clone)]
pub struct Detect {
    num_classes: usize,
    conf_thresh: f32,
    nms_thresh: f32,
    max_per_image: usize,
    variance: Variance,
}

impl Detect {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn max_per_image(&self) -> usize {
        self.max_per_image
    }

    /// Detects objects in one image.
    ///
    /// - `loc`: `num_priors` predicted offsets.
    /// - `conf`: `num_priors * num_classes` class probabilities (already normalized, e.g.
    ///   by a softmax), row-major per prior.
    pub fn detect_image(
        &self,
        loc: &[BoxCoords],
        conf: &[f32],
        priors: &PriorSet,
    ) -> SsdResult<Detections> {
        let num_priors = priors.len();
        priors.check_count(loc.len())?;

        if conf.len() != num_priors * self.num_classes {
            return Err(SsdError::ShapeMismatch {
                name: "conf",
                expected: vec![num_priors, self.num_classes],
                actual: vec![conf.len()],
            });
        }

        let decoded: Vec<BoxCoords> = loc
            .par_iter()
            .zip(priors.center_form().par_iter())
            .map(|(offset, prior)| decode(offset, prior, self.variance))
            .collect();

        let mut detections = Detections::zeros(self.num_classes, self.max_per_image);

        // every class fills its own block of rows; class 0 stays empty
        detections
            .data
            .par_chunks_mut(self.max_per_image * DETECTION_WIDTH)
            .enumerate()
            .skip(1)
            .for_each(|(class_id, rows)| {
                let candidates: Vec<usize> = (0..num_priors)
                    .filter(|p| conf[p * self.num_classes + class_id] > self.conf_thresh)
                    .collect();

                if candidates.is_empty() {
                    return;
                }

                let boxes: Vec<BoxCoords> = candidates.iter().map(|p| decoded[*p]).collect();
                let scores: Vec<f32> = candidates
                    .iter()
                    .map(|p| conf[p * self.num_classes + class_id])
                    .collect();

                let keep = nms(&boxes, &scores, self.nms_thresh, self.max_per_image);

                for (row, k) in rows.chunks_exact_mut(DETECTION_WIDTH).zip(keep.iter()) {
                    let [x1, y1, x2, y2] = boxes[*k];
                    row.copy_from_slice(&[scores[*k], x1, y1, x2, y2]);
                }
            });

        debug!(
            "{} detections over {} classes",
            detections.iter().count(),
            self.num_classes - 1
        );

        Ok(detections)
    }

    /// Batched detection.
    ///
    /// - `loc`: `[batch, num_priors, 4]` predicted offsets.
    /// - `conf`: `[batch, num_priors, num_classes]` class probabilities.
    ///
    /// Returns `[batch, num_classes, max_per_image, 5]`.
    pub fn forward<B: Backend>(
        &self,
        loc: Tensor<B, 3>,
        conf: Tensor<B, 3>,
        priors: &PriorSet,
    ) -> SsdResult<Tensor<B, 4>> {
        let device = loc.device();
        let [batch, num_priors, loc_width] = loc.dims();

        if loc_width != 4 {
            return Err(SsdError::ShapeMismatch {
                name: "loc",
                expected: vec![batch, num_priors, 4],
                actual: loc.dims().to_vec(),
            });
        }
        if conf.dims() != [batch, num_priors, self.num_classes] {
            return Err(SsdError::ShapeMismatch {
                name: "conf",
                expected: vec![batch, num_priors, self.num_classes],
                actual: conf.dims().to_vec(),
            });
        }
        priors.check_count(num_priors)?;

        let loc = tensor_to_boxes(loc.reshape([batch * num_priors, 4]))?;
        let conf = tensor_to_vec(conf)?;

        let image_len = self.num_classes * self.max_per_image * DETECTION_WIDTH;
        let conf_len = num_priors * self.num_classes;

        let mut output = Vec::with_capacity(batch * image_len);
        for i in 0..batch {
            let detections = self.detect_image(
                &loc[i * num_priors..(i + 1) * num_priors],
                &conf[i * conf_len..(i + 1) * conf_len],
                priors,
            )?;
            output.extend_from_slice(detections.as_slice());
        }

        Ok(Tensor::from_data(
            TensorData::new(
                output,
                [batch, self.num_classes, self.max_per_image, DETECTION_WIDTH],
            ),
            &device,
        ))
    }
}
