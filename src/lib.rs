#![recursion_limit = "256"]

//! Box pipeline of the SSD and RefineDet single shot detectors: default box generation,
//! ground truth matching, the multibox training loss and per-class detection with
//! non-maximum suppression.

pub mod boxes;
pub mod config;
pub mod debug;
pub mod error;
pub mod inference;
pub mod layers;
pub mod loss;
pub mod matching;
pub mod nms;
pub mod priors;

pub use config::{DetectConfig, MultiboxLossConfig, PriorBoxConfig, Variance};
pub use error::{SsdError, SsdResult};
pub use inference::{Detect, Detection, Detections};
pub use loss::{LossKind, MultiboxLoss, MultiboxLossOutput};
pub use matching::{GroundTruth, MatchKind, MatchResult, Matcher};
pub use priors::PriorSet;
