use crate::types::SplineError;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, Zip, s};
use serde::{Deserialize, Serialize};

/// A clamped (open) knot vector together with the polynomial degree it was built for.
///
/// The first and last knot values are each repeated exactly `degree + 1` times, interior
/// knots are non-decreasing with multiplicity at most `degree`, and there are at least
/// two distinct values. A `KnotVector` is never mutated; refinement returns a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedKnotVector")]
pub struct KnotVector {
    knots: Array1<f64>,
    degree: usize,
}

// Deserialized fields before they pass `KnotVector::new`.
#[derive(Deserialize)]
struct UncheckedKnotVector {
    knots: Array1<f64>,
    degree: usize,
}

impl TryFrom<UncheckedKnotVector> for KnotVector {
    type Error = SplineError;

    fn try_from(raw: UncheckedKnotVector) -> Result<Self, Self::Error> {
        KnotVector::new(raw.knots, raw.degree)
    }
}

impl KnotVector {
    /// Validates `knots` as a clamped knot vector of the given degree.
    pub fn new(knots: Array1<f64>, degree: usize) -> Result<Self, SplineError> {
        validate_clamped(knots.view(), degree)?;
        Ok(Self { knots, degree })
    }

    /// Builds a clamped knot vector with `num_elements` equal-width elements on
    /// `[lower, upper]`.
    pub fn uniform(
        num_elements: usize,
        degree: usize,
        lower: f64,
        upper: f64,
    ) -> Result<Self, SplineError> {
        if num_elements == 0 || !(lower < upper) {
            return Err(SplineError::InvalidKnotVector(format!(
                "cannot build {num_elements} uniform elements on [{lower}, {upper}]"
            )));
        }
        let h = (upper - lower) / num_elements as f64;
        let interior = (1..num_elements).map(|i| lower + i as f64 * h);
        let knots: Array1<f64> = std::iter::repeat_n(lower, degree + 1)
            .chain(interior)
            .chain(std::iter::repeat_n(upper, degree + 1))
            .collect();
        Self::new(knots, degree)
    }

    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.knots.view()
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn len(&self) -> usize {
        self.knots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knots.is_empty()
    }

    /// Number of basis functions, `m - p - 1`.
    pub fn num_basis(&self) -> usize {
        self.knots.len() - self.degree - 1
    }

    /// Index of the last valid span, `n = m - p - 2`.
    pub fn last_span(&self) -> usize {
        self.knots.len() - self.degree - 2
    }

    /// The parametric domain `[U[p], U[n + 1]]`.
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[self.degree], self.knots[self.last_span() + 1])
    }

    pub fn unique_knots(&self) -> Vec<f64> {
        self.knots.iter().copied().dedup().collect()
    }

    /// Number of non-degenerate knot intervals (Bezier elements).
    pub fn num_elements(&self) -> usize {
        self.unique_knots().len() - 1
    }

    /// Midpoint refinement. Every existing knot is kept.
    pub fn refine(&self) -> Result<KnotVector, SplineError> {
        let refined = refine_knots(self.knots.view(), self.degree)?;
        KnotVector::new(refined, self.degree)
    }

    pub fn find_span(&self, u: f64) -> Result<usize, SplineError> {
        find_span(self.last_span(), self.degree, u, self.knots.view())
    }

    pub fn find_spans(&self, params: ArrayView1<f64>) -> Result<Array1<usize>, SplineError> {
        find_spans(params, self.knots.view(), self.degree)
    }
}

pub(crate) fn validate_sorted(knots: ArrayView1<f64>) -> Result<(), SplineError> {
    if knots.iter().any(|k| !k.is_finite()) {
        return Err(SplineError::InvalidKnotVector(
            "knot vector contains non-finite (NaN or Infinity) values".to_string(),
        ));
    }
    if let Some((pos, _)) = knots
        .iter()
        .tuple_windows()
        .find_position(|(a, b)| a > b)
    {
        return Err(SplineError::InvalidKnotVector(format!(
            "knot vector decreases at position {}",
            pos + 1
        )));
    }
    Ok(())
}

pub(crate) fn validate_clamped(knots: ArrayView1<f64>, degree: usize) -> Result<(), SplineError> {
    validate_sorted(knots)?;

    let required = 2 * (degree + 1);
    if knots.len() < required {
        return Err(SplineError::InvalidKnotVector(format!(
            "degree {degree} needs at least {required} knots, got {}",
            knots.len()
        )));
    }

    let runs: Vec<(usize, f64)> = knots.iter().copied().dedup_with_count().collect();
    if runs.len() < 2 {
        return Err(SplineError::TooFewUniqueKnots(runs.len()));
    }

    let (first, last) = (runs[0], runs[runs.len() - 1]);
    if first.0 != degree + 1 || last.0 != degree + 1 {
        return Err(SplineError::InvalidKnotVector(format!(
            "end knots must each be repeated {} times, found {} and {}",
            degree + 1,
            first.0,
            last.0
        )));
    }

    // Piecewise constants keep simple interior knots.
    let max_interior = degree.max(1);
    if let Some(&(count, value)) = runs[1..runs.len() - 1]
        .iter()
        .find(|(count, _)| *count > max_interior)
    {
        return Err(SplineError::InvalidKnotVector(format!(
            "interior knot {value} has multiplicity {count}, at most {max_interior} allowed"
        )));
    }
    Ok(())
}

/// Inserts the midpoint between every pair of consecutive distinct knot values.
///
/// All existing knots are kept with their multiplicities, so the result is a true
/// refinement of the input and the clamped end multiplicities are unchanged.
pub fn refine_knots(knots: ArrayView1<f64>, degree: usize) -> Result<Array1<f64>, SplineError> {
    validate_clamped(knots, degree)?;
    let unique: Vec<f64> = knots.iter().copied().dedup().collect();

    let midpoints = unique.iter().tuple_windows().map(|(a, b)| 0.5 * (a + b));
    let refined: Array1<f64> = knots
        .iter()
        .copied()
        .merge(midpoints)
        .collect();

    log::trace!(
        "refined degree-{degree} knot vector from {} to {} knots",
        knots.len(),
        refined.len()
    );
    Ok(refined)
}

/// Finds the span index `i` with `U[i] <= u < U[i + 1]` by binary search over
/// `U[p..=n + 1]`. The right end of the domain maps to `n`, the last valid span.
pub fn find_span(n: usize, p: usize, u: f64, knots: ArrayView1<f64>) -> Result<usize, SplineError> {
    if p > n || n + 1 >= knots.len() {
        return Err(SplineError::SpanOutOfRange {
            span: n,
            lower: p,
            upper: knots.len().saturating_sub(2),
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
    if u == upper {
        return Ok(n);
    }

    let mut low = p;
    let mut high = n + 1;
    let mut mid = (low + high) / 2;
    while u < knots[mid] || u >= knots[mid + 1] {
        if u < knots[mid] {
            high = mid;
        } else {
            low = mid;
        }
        mid = (low + high) / 2;
    }
    Ok(mid)
}

/// Vectorized span lookup. Every parameter is range-checked before any span is computed.
pub fn find_spans(
    params: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array1<usize>, SplineError> {
    if knots.len() < 2 * (degree + 1) {
        return Err(SplineError::InvalidKnotVector(format!(
            "degree {degree} needs at least {} knots, got {}",
            2 * (degree + 1),
            knots.len()
        )));
    }
    let n = knots.len() - degree - 2;
    let (lower, upper) = (knots[degree], knots[n + 1]);
    if let Some(&bad) = params.iter().find(|&&u| !(u >= lower && u <= upper)) {
        return Err(SplineError::ParameterOutOfRange {
            value: bad,
            lower,
            upper,
        });
    }

    let sorted = knots.to_vec();
    Ok(Zip::from(&params).par_map_collect(|&u| {
        if u == upper {
            n
        } else {
            (sorted.partition_point(|&k| k <= u) - 1).min(n)
        }
    }))
}

/// Greville abscissae of a tensor-product basis, one row per basis function in
/// row-major order over the per-dimension basis counts. Coordinate `d` of the point
/// with multi-index `k` is `(U_d[k_d + 1] + ... + U_d[k_d + p_d]) / p_d`.
pub fn greville_abscissae(knot_vectors: &[KnotVector]) -> Result<Array2<f64>, SplineError> {
    if knot_vectors.is_empty() {
        return Err(SplineError::LengthMismatch {
            what: "knot vectors",
            expected: 1,
            found: 0,
        });
    }
    if let Some(kv) = knot_vectors.iter().find(|kv| kv.degree() == 0) {
        return Err(SplineError::InvalidDegree {
            degree: kv.degree(),
            minimum: 1,
        });
    }

    let per_dim: Vec<Vec<f64>> = knot_vectors
        .iter()
        .map(|kv| {
            let p = kv.degree();
            let u = kv.knots();
            (0..kv.num_basis())
                .map(|k| u.slice(s![k + 1..=k + p]).sum() / p as f64)
                .collect()
        })
        .collect();

    Ok(row_major_points(&per_dim))
}

/// Parametric sample grid with `shape[d]` points per dimension, each axis sampled as
/// `1e-5 + k * (1 - 1e-5) / shape[d]` for `k < shape[d]`. Rows are in row-major order.
pub fn parametric_grid(shape: &[usize]) -> Array2<f64> {
    const START: f64 = 1e-5;
    let per_dim: Vec<Vec<f64>> = shape
        .iter()
        .map(|&count| {
            let step = (1.0 - START) / count.max(1) as f64;
            (0..count).map(|k| START + k as f64 * step).collect()
        })
        .collect();
    row_major_points(&per_dim)
}

// Cartesian product of per-dimension coordinates, last dimension varying fastest.
fn row_major_points(per_dim: &[Vec<f64>]) -> Array2<f64> {
    let ndim = per_dim.len();
    let total: usize = per_dim.iter().map(Vec::len).product();
    if ndim == 0 || total == 0 {
        return Array2::zeros((0, ndim));
    }
    // strides[d] = product of the axis lengths after d.
    let mut strides = vec![1; ndim];
    for d in (0..ndim - 1).rev() {
        strides[d] = strides[d + 1] * per_dim[d + 1].len();
    }
    Array2::from_shape_fn((total, ndim), |(row, d)| {
        per_dim[d][(row / strides[d]) % per_dim[d].len()]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn cubic() -> KnotVector {
        KnotVector::new(array![0., 0., 0., 0., 1., 2., 3., 4., 4., 4., 4.], 3).unwrap()
    }

    #[test]
    fn uniform_matches_hand_written_vector() {
        let kv = KnotVector::uniform(4, 3, 0.0, 4.0).unwrap();
        assert_eq!(kv, cubic());
        assert_eq!(kv.num_basis(), 7);
        assert_eq!(kv.last_span(), 6);
        assert_eq!(kv.domain(), (0.0, 4.0));
        assert_eq!(kv.num_elements(), 4);
    }

    #[test]
    fn rejects_malformed_vectors() {
        assert!(matches!(
            KnotVector::new(array![0., 0., 1., 0.5, 1.], 1),
            Err(SplineError::InvalidKnotVector(_))
        ));
        assert!(matches!(
            KnotVector::new(array![0., 0., 1., 1., 1.], 1),
            Err(SplineError::InvalidKnotVector(_))
        ));
        assert!(matches!(
            KnotVector::new(array![0., 0., 0., 1., 1., 1., 2., 2., 2.], 2),
            Err(SplineError::InvalidKnotVector(_))
        ));
        assert!(matches!(
            KnotVector::new(array![2., 2., 2., 2.], 1),
            Err(SplineError::TooFewUniqueKnots(1))
        ));
        assert!(matches!(
            KnotVector::new(array![0., f64::NAN, 1., 1.], 1),
            Err(SplineError::InvalidKnotVector(_))
        ));
    }

    #[test]
    fn refine_inserts_midpoints_and_keeps_multiplicities() {
        let knots = array![0., 0., 0., 1., 1., 2., 3., 3., 3.];
        let refined = refine_knots(knots.view(), 2).unwrap();
        assert_eq!(
            refined,
            array![0., 0., 0., 0.5, 1., 1., 1.5, 2., 2.5, 3., 3., 3.]
        );
    }

    #[test]
    fn refine_requires_two_distinct_values() {
        let knots = array![1., 1., 1., 1.];
        assert_eq!(
            refine_knots(knots.view(), 1).unwrap_err(),
            SplineError::TooFewUniqueKnots(1)
        );
    }

    #[test]
    fn refine_rejects_vectors_not_clamped_for_the_degree() {
        let knots = array![0., 0., 1., 1.];
        assert!(matches!(
            refine_knots(knots.view(), 3),
            Err(SplineError::InvalidKnotVector(_))
        ));
        assert_eq!(
            refine_knots(knots.view(), 1).unwrap(),
            array![0., 0., 0.5, 1., 1.]
        );
    }

    #[test]
    fn deserialization_validates_the_vector() {
        let malformed = "degree = 3\n[knots]\nv = 1\ndim = [2]\ndata = [0.0, 1.0]\n";
        assert!(toml::from_str::<KnotVector>(malformed).is_err());

        let linear = "degree = 1\n[knots]\nv = 1\ndim = [4]\ndata = [0.0, 0.0, 1.0, 1.0]\n";
        let kv: KnotVector = toml::from_str(linear).unwrap();
        assert_eq!(kv, KnotVector::uniform(1, 1, 0.0, 1.0).unwrap());
        assert_eq!(kv.num_basis(), 2);
    }

    #[test]
    fn refining_twice_preserves_every_knot() {
        let coarse = cubic();
        let once = coarse.refine().unwrap();
        let twice = once.refine().unwrap();

        let interior = |kv: &KnotVector| kv.unique_knots().len() - 2;
        assert!(interior(&once) >= interior(&coarse));
        assert!(interior(&twice) >= interior(&once));
        assert_eq!(interior(&twice), 15);

        for k in coarse.unique_knots() {
            assert!(twice.knots().iter().any(|&t| t == k));
        }
        assert_eq!(twice.degree(), 3);
    }

    #[test]
    fn find_span_matches_interval_definition() {
        let kv = cubic();
        assert_eq!(kv.find_span(0.0).unwrap(), 3);
        assert_eq!(kv.find_span(0.5).unwrap(), 3);
        assert_eq!(kv.find_span(1.0).unwrap(), 4);
        assert_eq!(kv.find_span(2.5).unwrap(), 5);
        assert_eq!(kv.find_span(3.999).unwrap(), 6);
    }

    #[test]
    fn last_knot_maps_to_last_span_for_every_degree() {
        for degree in 0..5 {
            for elements in 1..6 {
                let kv = KnotVector::uniform(elements, degree, -1.0, 2.0).unwrap();
                let n = kv.last_span();
                assert_eq!(kv.find_span(2.0).unwrap(), n);
                assert_eq!(kv.find_spans(array![2.0].view()).unwrap()[0], n);
            }
        }
    }

    #[test]
    fn find_span_rejects_parameters_outside_domain() {
        let kv = cubic();
        assert!(matches!(
            kv.find_span(4.5),
            Err(SplineError::ParameterOutOfRange { .. })
        ));
        assert!(matches!(
            kv.find_span(f64::NAN),
            Err(SplineError::ParameterOutOfRange { .. })
        ));
        assert!(matches!(
            kv.find_spans(array![0.5, -0.1].view()),
            Err(SplineError::ParameterOutOfRange { .. })
        ));
    }

    #[test]
    fn batched_spans_agree_with_binary_search() {
        let kv = KnotVector::new(array![0., 0., 0., 0.5, 0.5, 1.5, 2., 2., 2.], 2).unwrap();
        let params = Array1::linspace(0.0, 2.0, 41).mapv(|u: f64| u.min(2.0));
        let spans = kv.find_spans(params.view()).unwrap();
        for (&u, &span) in params.iter().zip(spans.iter()) {
            assert_eq!(span, kv.find_span(u).unwrap(), "u = {u}");
        }
    }

    #[test]
    fn greville_points_of_quadratic_basis() {
        let kv = KnotVector::new(array![0., 0., 0., 1., 2., 2., 2.], 2).unwrap();
        let g = greville_abscissae(std::slice::from_ref(&kv)).unwrap();
        assert_eq!(g.shape(), &[4, 1]);
        let expected = [0.0, 0.5, 1.5, 2.0];
        for (row, e) in g.outer_iter().zip(expected) {
            assert_abs_diff_eq!(row[0], e, epsilon = 1e-12);
        }

        let lin = KnotVector::uniform(2, 1, 0.0, 1.0).unwrap();
        let g2 = greville_abscissae(&[kv, lin]).unwrap();
        assert_eq!(g2.shape(), &[12, 2]);
        assert_abs_diff_eq!(g2[[1, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g2[[1, 1]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(g2[[3, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(g2[[3, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn parametric_grid_is_row_major_and_open_on_the_right() {
        let grid = parametric_grid(&[2, 3]);
        assert_eq!(grid.shape(), &[6, 2]);
        assert_abs_diff_eq!(grid[[0, 0]], 1e-5, epsilon = 1e-15);
        assert_abs_diff_eq!(grid[[1, 1]], 1e-5 + (1.0 - 1e-5) / 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(grid[[3, 0]], 1e-5 + (1.0 - 1e-5) / 2.0, epsilon = 1e-15);
        assert!(grid.iter().all(|&x| x > 0.0 && x < 1.0));
    }
}
