use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorData},
};

use crate::config::Variance;
use crate::error::{SsdError, SsdResult};

/// A box as four floats, either `(x1, y1, x2, y2)` corner form or `(cx, cy, w, h)` center
/// form, normalized to the image size.
pub type BoxCoords = [f32; 4];

/// Converts a box from center format (cx, cy, w, h) to corner format (x1, y1, x2, y2).
pub fn point_form(b: &BoxCoords) -> BoxCoords {
    let [cx, cy, w, h] = *b;
    [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]
}

/// Converts a box from corner format (x1, y1, x2, y2) to center format (cx, cy, w, h).
pub fn center_size(b: &BoxCoords) -> BoxCoords {
    let [x1, y1, x2, y2] = *b;
    let w = x2 - x1;
    let h = y2 - y1;
    [x1 + w * 0.5, y1 + h * 0.5, w, h]
}

/// Area of a corner-form box; inverted boxes count as empty.
pub fn area(b: &BoxCoords) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Computes the Intersection over Union (Jaccard overlap) of two corner-form boxes.
///
/// `IoU = intersection_area / union_area`
///
/// The intersection sides are clamped at 0, so disjoint boxes give exactly 0. A zero
/// union (two empty boxes) also gives 0.
pub fn iou(a: &BoxCoords, b: &BoxCoords) -> f32 {
    // --- Intersection corners ---
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = area(a) + area(b) - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// IoU of every ground truth box against every anchor.
///
/// Get IOU matrix
///
/// ```text
///                    Dim 1
///             Default Anchor Boxes
///             ┌──────────────►
///             │┌──────────────────┐
///             ││                  │
///    Dim 0    ││       IOU        │
/// Image Target││                  │
///    Boxes    ││                  │
///             ▼└──────────────────┘
/// ```
///
/// Both inputs are in corner form. The result has shape `[truths.len()][anchors.len()]`.
pub fn iou_matrix(truths: &[BoxCoords], anchors: &[BoxCoords]) -> Vec<Vec<f32>> {
    truths
        .iter()
        .map(|t| anchors.iter().map(|a| iou(t, a)).collect())
        .collect()
}

/// Computes the regression target that moves `prior` onto `matched`.
///
/// The regression formula:
/// - tx = (Gx - Px) / Pw / v_center
/// - ty = (Gy - Py) / Ph / v_center
/// - tw = log(Gw / Pw) / v_size
/// - th = log(Gh / Ph) / v_size
///
/// Where (Gx, Gy, Gw, Gh) is the matched box and (Px, Py, Pw, Ph) the prior, both in
/// center form. `matched` is given in corner form, `prior` in center form.
///
/// “Rich feature hierarchies for accurate object detection and semantic segmentation”
/// Authors: Ross Girshick, Jeff Donahue, Trevor Darrell, Jitendra Malik
/// Link (official): https://arxiv.org/abs/1311.2524
///
/// Appendix Section C. Bounding-box regression
///
/// The first two specify a scale-invariant translation of the center of P’s bounding box,
/// while the second two specify log-space translations of the width and height of P’s
/// bounding box.
///
/// Priors must have strictly positive width and height, which [`crate::priors::PriorSet`]
/// guarantees. A degenerate matched box would need the log of a non-positive ratio; that
/// size offset is defined as 0, and any other non-finite component is also replaced by 0.
pub fn encode(matched: &BoxCoords, prior: &BoxCoords, variance: Variance) -> BoxCoords {
    let [gx, gy, gw, gh] = center_size(matched);
    let [px, py, pw, ph] = *prior;

    //      Gx - Px
    // tx = ───────
    //        Pw
    let tx = (gx - px) / pw / variance.center;
    let ty = (gy - py) / ph / variance.center;

    //          ⎛Gw⎞
    // tw = log ⎜──⎟
    //          ⎝Pw⎠
    let tw = log_ratio(gw, pw) / variance.size;
    let th = log_ratio(gh, ph) / variance.size;

    [tx, ty, tw, th].map(finite_or_zero)
}

/// Inverse of [`encode`]: applies a predicted offset to a center-form prior and returns
/// the resulting box in corner form.
///
/// The formulas used:
/// - cx = Px + dx * v_center * Pw
/// - cy = Py + dy * v_center * Ph
/// - w = Pw * exp(dw * v_size)
/// - h = Ph * exp(dh * v_size)
pub fn decode(offset: &BoxCoords, prior: &BoxCoords, variance: Variance) -> BoxCoords {
    let [dx, dy, dw, dh] = *offset;
    let [px, py, pw, ph] = *prior;

    let cx = px + dx * variance.center * pw;
    let cy = py + dy * variance.center * ph;
    let w = pw * (dw * variance.size).exp();
    let h = ph * (dh * variance.size).exp();

    point_form(&[cx, cy, w, h])
}

fn log_ratio(numerator: f32, denominator: f32) -> f32 {
    let ratio = numerator / denominator;
    if ratio.is_finite() && ratio > 0.0 {
        ratio.ln()
    } else {
        0.0
    }
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() { v } else { 0.0 }
}

/// Creates a `[n, 4]` tensor from host boxes.
pub fn boxes_to_tensor<B: Backend>(boxes: &[BoxCoords], device: &B::Device) -> Tensor<B, 2> {
    let flat: Vec<f32> = boxes.iter().flatten().copied().collect();
    Tensor::from_data(TensorData::new(flat, [boxes.len(), 4]), device)
}

/// Reads a `[n, 4]` tensor back into host boxes.
pub fn tensor_to_boxes<B: Backend>(tensor: Tensor<B, 2>) -> SsdResult<Vec<BoxCoords>> {
    let [_, cols] = tensor.dims();
    if cols != 4 {
        return Err(SsdError::ShapeMismatch {
            name: "boxes",
            expected: vec![tensor.dims()[0], 4],
            actual: tensor.dims().to_vec(),
        });
    }

    Ok(tensor_to_vec(tensor)?
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

/// Copies any float tensor to a flat host `Vec<f32>` in row-major order.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> SsdResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SsdError::TensorData(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem},
    };

    fn assert_box_eq(a: &BoxCoords, b: &BoxCoords, epsilon: f32) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert_approx_eq(x, y, epsilon);
        }
    }

    #[test]
    fn test_form_conversion() {
        let corner = [0.1, 0.2, 0.5, 0.8];
        let center = center_size(&corner);
        assert_box_eq(&center, &[0.3, 0.5, 0.4, 0.6], 1e-6);
        assert_box_eq(&point_form(&center), &corner, 1e-6);
    }

    #[test]
    fn test_iou() {
        let boxes1 = [
            [0.12, 0.15, 0.30, 0.40],
            [0.05, 0.05, 0.25, 0.20],
            [0.33, 0.20, 0.50, 0.45],
            [0.60, 0.10, 0.85, 0.35],
        ];

        let boxes2 = [
            [0.10, 0.10, 0.30, 0.30],
            [0.20, 0.25, 0.40, 0.45],
            [0.60, 0.50, 0.80, 0.70],
            [0.35, 0.15, 0.55, 0.35],
            [0.50, 0.60, 0.70, 0.80],
            [0.25, 0.40, 0.45, 0.60],
        ];

        let expected = [
            [0.46551722, 0.21428573, 0.0, 0.0, 0.0, 0.0],
            [0.27272725, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.20437954, 0.0, 0.375, 0.0, 0.07843133],
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];

        let matrix = iou_matrix(&boxes1, &boxes2);

        for (row, expected_row) in matrix.iter().zip(expected.iter()) {
            for (a, b) in row.iter().zip(expected_row.iter()) {
                assert_approx_eq(a, b, 1e-5);
            }
        }
    }

    #[test]
    fn test_iou_properties() {
        let a = [0.1, 0.1, 0.4, 0.5];
        let b = [0.2, 0.3, 0.6, 0.7];
        let disjoint = [0.7, 0.7, 0.9, 0.9];

        assert_approx_eq(&iou(&a, &a), &1.0, 1e-6);
        assert_eq!(iou(&a, &disjoint), 0.0);
        assert_eq!(iou(&a, &b), iou(&b, &a));

        // touching edges share no area
        assert_eq!(iou(&[0.0, 0.0, 0.5, 0.5], &[0.5, 0.0, 1.0, 0.5]), 0.0);
        // two empty boxes
        assert_eq!(iou(&[0.2, 0.2, 0.2, 0.2], &[0.2, 0.2, 0.2, 0.2]), 0.0);
    }

    #[test]
    fn test_box_regression() {
        let gt_box = [0.35725, 0.51429164, 0.61651564, 0.7677916];
        let dflt_bx = center_size(&[0.4080761, 0.42141542, 0.5919239, 0.7891109]);

        let offset = encode(&gt_box, &dflt_bx, Variance::SSD);
        assert_box_eq(&offset, &[-0.7134, 0.9730, 1.7187, -1.8594], 1e-3);

        let decoded = decode(&offset, &dflt_bx, Variance::SSD);
        assert_box_eq(&decoded, &gt_box, 1e-5);
    }

    #[test]
    fn test_encode_identical_box_is_zero() {
        let prior = [0.5, 0.5, 0.2, 0.2];
        let gt = [0.4, 0.4, 0.6, 0.6];

        let offset = encode(&gt, &prior, Variance::SSD);
        assert_box_eq(&offset, &[0.0, 0.0, 0.0, 0.0], 1e-5);
        assert_box_eq(&decode(&offset, &prior, Variance::SSD), &gt, 1e-5);
    }

    #[test]
    fn test_round_trip_over_box_grid() {
        let variance = Variance::new(0.1, 0.2);
        let priors = [[0.5, 0.5, 0.2, 0.2], [0.1, 0.9, 0.05, 0.3], [0.75, 0.3, 0.6, 0.15]];
        let boxes = [[0.0, 0.0, 1.0, 1.0], [0.3, 0.45, 0.35, 0.5], [0.6, 0.1, 0.95, 0.4]];

        for prior in priors.iter() {
            for b in boxes.iter() {
                let decoded = decode(&encode(b, prior, variance), prior, variance);
                assert_box_eq(&decoded, b, 1e-5);
            }
        }
    }

    #[test]
    fn test_encode_degenerate_box_is_finite() {
        let prior = [0.5, 0.5, 0.2, 0.2];
        let flat = [0.4, 0.4, 0.4, 0.6];

        let offset = encode(&flat, &prior, Variance::SSD);
        assert!(offset.iter().all(|v| v.is_finite()));
        assert_eq!(offset[2], 0.0);
    }

    #[test]
    fn test_tensor_conversion() {
        type B = NdArray<f32>;
        let device = &NdArrayDevice::default();

        let boxes = vec![[0.1, 0.2, 0.3, 0.4], [0.5, 0.6, 0.7, 0.8]];
        let tensor = boxes_to_tensor::<B>(&boxes, device);

        Tensor::<B, 2>::from_data([[0.1, 0.2, 0.3, 0.4], [0.5, 0.6, 0.7, 0.8]], device)
            .into_data()
            .assert_approx_eq::<FloatElem<B>>(&tensor.to_data(), Tolerance::default());

        assert_eq!(tensor_to_boxes(tensor).unwrap(), boxes);
    }

    #[test]
    fn test_tensor_to_boxes_rejects_wrong_width() {
        type B = NdArray<f32>;
        let device = &NdArrayDevice::default();

        let tensor = Tensor::<B, 2>::zeros([3, 5], device);
        assert!(matches!(
            tensor_to_boxes(tensor),
            Err(SsdError::ShapeMismatch { .. })
        ));
    }
}
