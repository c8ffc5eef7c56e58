use num::Float;

/// Returns `Err(SsdError::NonFinite)` from the enclosing function when a single-element
/// tensor holds NaN or infinity.
#[macro_export]
macro_rules! check_nan {
    ($tensor:expr, $name:expr) => {{
        use burn::tensor::cast::ToElement;
        let value = $tensor.clone().into_scalar().to_f32();
        if !value.is_finite() {
            tracing::warn!("found {} in {} (line {})", value, $name, line!());
            return Err($crate::error::SsdError::NonFinite($name));
        }
    }};
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}
