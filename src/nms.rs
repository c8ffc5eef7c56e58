use crate::boxes::{BoxCoords, iou};

/// Greedy non-maximum suppression over the boxes of one class.
///
/// Returns the indices of the kept boxes, highest score first.
///
/// Candidates are ranked by score. The highest remaining box is kept and every remaining
/// box overlapping it by more than `overlap` IoU is discarded, until nothing is left or
/// `max_kept` boxes were kept. Equal scores keep their input order.
///
/// Relevant excerpt from
///
/// “SSD: Single Shot MultiBox Detector”
/// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
/// Link (official): https://arxiv.org/abs/1512.02325
///
/// Inference time - Liu et al. - Pg 7
///
/// Given the large number of boxes generated from our method, it is essential to perform
/// non-maximum suppression (nms) efficiently during inference. By using a confidence
/// threshold of 0.01, we can filter out most boxes. We then apply nms with jaccard overlap
/// of 0.45 per class and keep the top 200 detections per image.
pub fn nms(boxes: &[BoxCoords], scores: &[f32], overlap: f32, max_kept: usize) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());

    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    // stable, so equal scores stay in index order
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

    let mut suppressed = vec![false; boxes.len()];
    let mut keep = Vec::with_capacity(max_kept.min(order.len()));

    for (rank, i) in order.iter().enumerate() {
        if keep.len() >= max_kept {
            break;
        }
        if suppressed[*i] {
            continue;
        }

        keep.push(*i);

        for j in order[rank + 1..].iter() {
            if !suppressed[*j] && iou(&boxes[*i], &boxes[*j]) > overlap {
                suppressed[*j] = true;
            }
        }
    }

    keep
}
