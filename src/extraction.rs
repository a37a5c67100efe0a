use crate::knots::{KnotVector, validate_clamped};
use crate::types::SplineError;
use ndarray::{Array1, Array2, ArrayView1, s};

/// Computes one Bezier extraction operator per element of a clamped knot vector.
///
/// The walk goes element by element from left to right. Wherever an interior knot has
/// multiplicity below `degree`, knots are virtually inserted until it reaches `degree`;
/// the blending coefficients are folded into the current element's operator and the
/// tail of that operator seeds the leading entries of the next one. Interior knots
/// that already have multiplicity `degree` need no blending.
///
/// # Returns
/// A `Vec` with one `(degree + 1) x (degree + 1)` matrix per non-degenerate knot
/// interval, in knot order. Matrix `E` is in control-point orientation: row `r` holds
/// Bernstein coefficient `r` of the element as an affine combination of the element's
/// `degree + 1` B-spline control points, so every row sums to one. Equivalently the
/// local B-spline basis is `N = E^T B`, with `B` the Bernstein basis on the element.
pub fn extract_bezier_operators(
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Vec<Array2<f64>>, SplineError> {
    if degree < 1 {
        return Err(SplineError::InvalidDegree { degree, minimum: 1 });
    }
    validate_clamped(knots, degree)?;

    let p = degree;
    let m = knots.len() - p - 1;
    // One-based knot access keeps the index arithmetic of the insertion formulas intact.
    let knot = |k: usize| knots[k - 1];

    let mut operators = Vec::new();
    let mut alphas = vec![0.0; p + 1];
    let mut current = Array2::<f64>::eye(p + 1);
    let mut a = p + 1;
    let mut b = a + 1;

    while b <= m {
        // The next element's operator, carrying the seeds written while finishing this one.
        let mut pending = Array2::<f64>::eye(p + 1);

        let i = b;
        while b <= m && knot(b + 1) == knot(b) {
            b += 1;
        }
        let multiplicity = b - i + 1;

        if multiplicity < p {
            let numerator = knot(b) - knot(a);
            for j in (multiplicity + 1..=p).rev() {
                alphas[j - multiplicity] = numerator / (knot(a + j) - knot(a));
            }

            let r = p - multiplicity;
            for j in 1..=r {
                let save = r - j + 1;
                let start = multiplicity + j;
                for k in (start + 1..=p + 1).rev() {
                    let alpha = alphas[k - start];
                    let (mut target, source) =
                        current.multi_slice_mut((s![.., k - 1], s![.., k - 2]));
                    target.zip_mut_with(&source, |t, &src| *t = alpha * *t + (1.0 - alpha) * src);
                }
                pending
                    .slice_mut(s![save - 1..save + j, save - 1])
                    .assign(&current.slice(s![p - j..=p, p]));
            }
        }

        operators.push(current.t().to_owned());
        current = pending;
        a = b;
        b += 1;
    }
    operators.push(current.t().to_owned());

    log::trace!(
        "Extracted {} Bezier operators for a degree-{p} knot vector",
        operators.len()
    );
    Ok(operators)
}

/// `extract_bezier_operators` for a validated knot vector.
pub fn bezier_operators(knot_vector: &KnotVector) -> Result<Vec<Array2<f64>>, SplineError> {
    extract_bezier_operators(knot_vector.knots(), knot_vector.degree())
}

/// Bernstein polynomials `C(p, k) t^k (1 - t)^(p - k)` on `[0, 1]`, via de Casteljau's
/// triangle so no binomial coefficients are formed.
pub fn bernstein_basis(t: f64, degree: usize) -> Array1<f64> {
    let mut values = Array1::zeros(degree + 1);
    values[0] = 1.0;
    let one_minus_t = 1.0 - t;
    for j in 1..=degree {
        let mut saved = 0.0;
        for k in 0..j {
            let temp = values[k];
            values[k] = saved + one_minus_t * temp;
            saved = t * temp;
        }
        values[j] = saved;
    }
    values
}
