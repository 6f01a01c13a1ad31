/// Evaluate `coeffs[0] + coeffs[1] x + coeffs[2] x^2 + ...` by Horner's method.
///
/// An empty coefficient list evaluates to 0.
#[inline]
pub fn polynomial(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}
