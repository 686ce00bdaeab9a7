//! Utilities for numerics.

/// Applies the standard sigmoid/logistic function to the input.
///
/// The face-presence flag output by the network is a logit; this turns it into a confidence in
/// range `0.0..=1.0`.
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_sigmoid() {
        assert_relative_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
        assert_relative_eq!(sigmoid(2.0) + sigmoid(-2.0), 1.0);
    }
}
