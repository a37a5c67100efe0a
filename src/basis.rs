use crate::knots::KnotVector;
use crate::types::SplineError;
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Zip};

/// Divides `numerator` by `denominator`, forcing the `0/0` case to zero.
///
/// Degenerate knot intervals (repeated knots) produce zero-width denominators in the
/// Cox-de Boor recursion, and the B-spline convention is that such terms vanish. A zero
/// denominator under a nonzero numerator is not covered by that convention and is
/// reported as `SplineError::NumericDegeneracy` instead of being masked.
#[inline]
pub fn divide_or_zero(
    numerator: f64,
    denominator: f64,
    context: &'static str,
    index: usize,
) -> Result<f64, SplineError> {
    if denominator == 0.0 {
        if numerator == 0.0 {
            Ok(0.0)
        } else {
            Err(SplineError::NumericDegeneracy { context, index })
        }
    } else {
        Ok(numerator / denominator)
    }
}

/// Evaluates the `p + 1` nonzero B-spline basis functions `N_{i-p,p} .. N_{i,p}` at `u`.
///
/// This is the triangular de Boor-Cox accumulation: starting from `N[0] = 1`, every pass
/// `j = 1..=p` raises the degree by one using the `left`/`right` knot distances and a
/// running `saved` term, so the whole evaluation is `O(p^2)` and allocation-light.
///
/// # Arguments
/// * `i`: the span index of `u`, as returned by `find_span`. Must satisfy `p <= i <= n`.
/// * `u`: the parameter value. Must lie in the knot domain `[U[p], U[n + 1]]`.
/// * `p`: the polynomial degree.
/// * `knots`: the clamped knot vector `U`.
///
/// # Returns
/// An `Array1<f64>` of length `p + 1`, non-negative and summing to one.
pub fn basis_fun(i: usize, u: f64, p: usize, knots: ArrayView1<f64>) -> Result<Array1<f64>, SplineError> {
    check_span_and_parameter(i, u, p, knots)?;
    let mut values = Array1::zeros(p + 1);
    internal::cox_de_boor_into(i, u, p, knots, values.view_mut())?;
    Ok(values)
}

/// First derivatives `dN_{k,p}/du` of the `p + 1` basis functions that are nonzero on span `i`.
///
/// Uses the analytic derivative of the recursion,
/// `N'_{k,p} = p * (N_{k,p-1} / (U[k+p] - U[k]) - N_{k+1,p-1} / (U[k+p+1] - U[k+1]))`,
/// evaluated from the degree `p - 1` values on the same span. The same `0/0 -> 0` rule
/// applies. Degree zero functions are piecewise constant and have zero derivative.
pub fn basis_fun_derivatives(
    i: usize,
    u: f64,
    p: usize,
    knots: ArrayView1<f64>,
) -> Result<Array1<f64>, SplineError> {
    check_span_and_parameter(i, u, p, knots)?;
    let mut ders = Array1::zeros(p + 1);
    internal::first_derivatives_into(i, u, p, knots, ders.view_mut())?;
    Ok(ders)
}

/// Batched basis evaluation for a vector of parameter values.
///
/// Spans are located for the whole batch first (every parameter is range-checked before
/// anything is evaluated), then each row is filled independently in parallel.
///
/// # Returns
/// A tuple `(spans, values)` where `spans[k]` is the span of `params[k]` and row `k` of
/// `values` holds the `p + 1` nonzero basis values `N_{spans[k]-p..=spans[k], p}(params[k])`.
pub fn basis_funs(
    params: ArrayView1<f64>,
    knot_vector: &KnotVector,
) -> Result<(Array1<usize>, Array2<f64>), SplineError> {
    batched(params, knot_vector, internal::cox_de_boor_into)
}

/// Batched first derivatives with respect to the parameter value, laid out like `basis_funs`.
pub fn basis_funs_derivatives(
    params: ArrayView1<f64>,
    knot_vector: &KnotVector,
) -> Result<(Array1<usize>, Array2<f64>), SplineError> {
    batched(params, knot_vector, internal::first_derivatives_into)
}

type RowKernel = fn(usize, f64, usize, ArrayView1<f64>, ArrayViewMut1<f64>) -> Result<(), SplineError>;

fn batched(
    params: ArrayView1<f64>,
    knot_vector: &KnotVector,
    kernel: RowKernel,
) -> Result<(Array1<usize>, Array2<f64>), SplineError> {
    let p = knot_vector.degree();
    let knots = knot_vector.knots();
    let spans = knot_vector.find_spans(params)?;

    let mut values = Array2::zeros((params.len(), p + 1));
    let status = Zip::from(values.rows_mut())
        .and(&spans)
        .and(&params)
        .par_map_collect(|row, &span, &u| kernel(span, u, p, knots, row));
    status.into_iter().collect::<Result<(), SplineError>>()?;

    Ok((spans, values))
}

/// Row-major outer product of univariate basis value vectors.
///
/// For factors `a`, `b`, `c` the entry at flat position `(i * |b| + j) * |c| + k` is
/// `a[i] * b[j] * c[k]`, which is the local tensor-product weight of the multivariate
/// basis function with local multi-index `(i, j, k)`.
pub fn tensor_product(factors: &[ArrayView1<f64>]) -> Array1<f64> {
    factors.iter().fold(Array1::ones(1), |acc, factor| {
        acc.iter()
            .flat_map(|&a| factor.iter().map(move |&b| a * b))
            .collect()
    })
}

fn check_span_and_parameter(
    i: usize,
    u: f64,
    p: usize,
    knots: ArrayView1<f64>,
) -> Result<(), SplineError> {
    if knots.len() < 2 * (p + 1) {
        return Err(SplineError::InvalidKnotVector(format!(
            "degree {p} needs at least {} knots, got {}",
            2 * (p + 1),
            knots.len()
        )));
    }
    let n = knots.len() - p - 2;
    if i < p || i > n {
        return Err(SplineError::SpanOutOfRange {
            span: i,
            lower: p,
            upper: n,
        });
    }
    let (lower, upper) = (knots[p], knots[n + 1]);
    if !(u >= lower && u <= upper) {
        return Err(SplineError::ParameterOutOfRange {
            value: u,
            lower,
            upper,
        });
    }
    // Closed on the right so the end of the domain stays reachable from span `n`.
    let (start, end) = (knots[i], knots[i + 1]);
    if !(u >= start && u <= end) {
        return Err(SplineError::ParameterNotInSpan {
            value: u,
            span: i,
            lower: start,
            upper: end,
        });
    }
    Ok(())
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Fills `out` with the `p + 1` nonzero basis values on span `i`.
    /// The caller has validated `i` and `u`.
    pub(super) fn cox_de_boor_into(
        i: usize,
        u: f64,
        p: usize,
        knots: ArrayView1<f64>,
        mut out: ArrayViewMut1<f64>,
    ) -> Result<(), SplineError> {
        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];

        out.fill(0.0);
        out[0] = 1.0;
        for j in 1..=p {
            left[j] = u - knots[i + 1 - j];
            right[j] = knots[i + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                let temp = divide_or_zero(out[r], right[r + 1] + left[j - r], "basis recursion", i)?;
                out[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            out[j] = saved;
        }
        Ok(())
    }

    pub(super) fn first_derivatives_into(
        i: usize,
        u: f64,
        p: usize,
        knots: ArrayView1<f64>,
        mut out: ArrayViewMut1<f64>,
    ) -> Result<(), SplineError> {
        out.fill(0.0);
        if p == 0 {
            return Ok(());
        }

        // N_{i-p+1..=i, p-1}; the degree p span is also a valid degree p-1 span.
        let mut lower = Array1::zeros(p);
        cox_de_boor_into(i, u, p - 1, knots, lower.view_mut())?;

        let degree = p as f64;
        for r in 0..=p {
            let k = i - p + r;
            let left_parent = if r >= 1 { lower[r - 1] } else { 0.0 };
            let right_parent = if r < p { lower[r] } else { 0.0 };
            let left_term = divide_or_zero(left_parent, knots[k + p] - knots[k], "basis derivative", k)?;
            let right_term = divide_or_zero(
                right_parent,
                knots[k + p + 1] - knots[k + 1],
                "basis derivative",
                k + 1,
            )?;
            out[r] = degree * (left_term - right_term);
        }
        Ok(())
    }
}
