// ========================================================================================
//
//                 The kernel: a segmented gather and its scatter-add adjoint
//
// ========================================================================================
//
// This module holds the innermost loops of the evaluation engine. A THB-spline value is
// a sparse matrix-vector product: rows are samples, columns are global control points
// and the entries are truncated basis weights. The forward pass is that product and the
// backward pass is its transpose. Nothing here knows about levels, knots or autodiff
// frameworks; it executes a validated (index, weight, segment) plan.
//
// Determinism: every output row is accumulated in ascending pair order, on both the
// serial and the parallel path, so the result does not depend on the thread count.

use crate::config::EngineConfig;
use crate::types::EvaluationError;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};
use std::sync::OnceLock;

// ========================================================================================
//                            Public API & type definitions
// ========================================================================================

/// A validated sparse evaluation operator `A` with `A[s, c] = sum of the weights of the
/// pairs of segment `s` that reference control point `c``.
///
/// The constructor is the sole entry point and checks every invariant the loops rely
/// on: matching lengths, non-decreasing segment ids below `num_samples`, and global
/// indices below `num_control_points`. After that, `apply` and `apply_transpose` only
/// need to check the shape of the dense operand.
#[derive(Debug)]
pub struct EvaluationOperator {
    indices: Vec<usize>,
    weights: Vec<f64>,
    segment_ids: Vec<usize>,
    num_samples: usize,
    num_control_points: usize,
    /// Row pointers: the pairs of segment `s` are `segment_offsets[s]..segment_offsets[s + 1]`.
    segment_offsets: Vec<usize>,
    /// Pairs bucketed by control point, built on the first parallel backward pass.
    transpose: OnceLock<TransposeLayout>,
}

/// Column-major view of the pair list: the pairs touching control point `c` are
/// `pairs[offsets[c]..offsets[c + 1]]`, in ascending pair order.
#[derive(Debug)]
struct TransposeLayout {
    offsets: Vec<usize>,
    pairs: Vec<usize>,
}

impl EvaluationOperator {
    pub fn new(
        indices: Vec<usize>,
        weights: Vec<f64>,
        segment_ids: Vec<usize>,
        num_samples: usize,
        num_control_points: usize,
    ) -> Result<Self, EvaluationError> {
        if weights.len() != indices.len() {
            return Err(EvaluationError::LengthMismatch {
                what: "basis weights",
                expected: indices.len(),
                found: weights.len(),
            });
        }
        if segment_ids.len() != indices.len() {
            return Err(EvaluationError::LengthMismatch {
                what: "segment ids",
                expected: indices.len(),
                found: segment_ids.len(),
            });
        }
        if let Some(position) = segment_ids.windows(2).position(|w| w[0] > w[1]) {
            return Err(EvaluationError::UnsortedSegments {
                position: position + 1,
            });
        }
        if let Some(&segment) = segment_ids.last() {
            if segment >= num_samples {
                return Err(EvaluationError::SegmentOutOfRange {
                    segment,
                    num_samples,
                });
            }
        }
        if let Some(&index) = indices.iter().find(|&&i| i >= num_control_points) {
            return Err(EvaluationError::IndexOutOfBounds {
                index,
                num_control_points,
            });
        }

        let segment_offsets = bucket_offsets(&segment_ids, num_samples);
        Ok(Self {
            indices,
            weights,
            segment_ids,
            num_samples,
            num_control_points,
            segment_offsets,
            transpose: OnceLock::new(),
        })
    }

    #[inline]
    pub fn num_terms(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    #[inline]
    pub fn num_control_points(&self) -> usize {
        self.num_control_points
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn segment_ids(&self) -> &[usize] {
        &self.segment_ids
    }

    /// The pair range belonging to sample `s`.
    pub fn segment(&self, s: usize) -> std::ops::Range<usize> {
        self.segment_offsets[s]..self.segment_offsets[s + 1]
    }

    /// Forward pass: `out[s] = sum over pairs k of segment s of weights[k] * cp[indices[k]]`.
    ///
    /// Samples without any pair evaluate to zero.
    pub fn apply(
        &self,
        control_points: ArrayView2<f64>,
        config: &EngineConfig,
    ) -> Result<Array2<f64>, EvaluationError> {
        if control_points.nrows() != self.num_control_points {
            return Err(EvaluationError::LengthMismatch {
                what: "control points",
                expected: self.num_control_points,
                found: control_points.nrows(),
            });
        }

        Ok(self.gather(control_points, config))
    }

    // `apply` once the row count of `control_points` is known to match.
    pub(crate) fn gather(&self, control_points: ArrayView2<f64>, config: &EngineConfig) -> Array2<f64> {
        let mut out = Array2::zeros((self.num_samples, control_points.ncols()));
        if config.use_parallel(self.num_terms()) {
            out.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(s, mut row)| {
                    for k in self.segment(s) {
                        row.scaled_add(self.weights[k], &control_points.row(self.indices[k]));
                    }
                });
        } else {
            for k in 0..self.num_terms() {
                out.row_mut(self.segment_ids[k])
                    .scaled_add(self.weights[k], &control_points.row(self.indices[k]));
            }
        }
        out
    }

    /// Backward pass, the exact adjoint of `apply`:
    /// `grad[indices[k]] += weights[k] * grad_output[segment_ids[k]]` for every pair `k`.
    ///
    /// A control point referenced by several pairs receives the sum of all of them;
    /// control points referenced by none keep a zero gradient. The parallel path buckets
    /// the pairs by control point once and then reduces each bucket independently, so no
    /// two threads ever write the same row.
    pub fn apply_transpose(
        &self,
        grad_output: ArrayView2<f64>,
        config: &EngineConfig,
    ) -> Result<Array2<f64>, EvaluationError> {
        if grad_output.nrows() != self.num_samples {
            return Err(EvaluationError::LengthMismatch {
                what: "upstream gradient rows",
                expected: self.num_samples,
                found: grad_output.nrows(),
            });
        }

        let mut grad = Array2::zeros((self.num_control_points, grad_output.ncols()));
        if config.use_parallel(self.num_terms()) {
            let layout = self.transpose.get_or_init(|| self.build_transpose());
            grad.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(c, mut row)| {
                    for &k in &layout.pairs[layout.offsets[c]..layout.offsets[c + 1]] {
                        row.scaled_add(self.weights[k], &grad_output.row(self.segment_ids[k]));
                    }
                });
        } else {
            for k in 0..self.num_terms() {
                grad.row_mut(self.indices[k])
                    .scaled_add(self.weights[k], &grad_output.row(self.segment_ids[k]));
            }
        }
        Ok(grad)
    }

    // Stable counting sort of the pairs by control point.
    fn build_transpose(&self) -> TransposeLayout {
        let offsets = bucket_offsets(&self.indices, self.num_control_points);
        let mut cursor = offsets.clone();
        let mut pairs = vec![0; self.num_terms()];
        for (k, &c) in self.indices.iter().enumerate() {
            pairs[cursor[c]] = k;
            cursor[c] += 1;
        }
        log::trace!(
            "Bucketed {} pairs over {} control points for the adjoint",
            pairs.len(),
            self.num_control_points
        );
        TransposeLayout { offsets, pairs }
    }
}

// Prefix sums of bucket sizes; bucket `b` spans `offsets[b]..offsets[b + 1]`.
// Every key is below `num_buckets`.
fn bucket_offsets(keys: &[usize], num_buckets: usize) -> Vec<usize> {
    let mut offsets = vec![0; num_buckets + 1];
    for &key in keys {
        offsets[key + 1] += 1;
    }
    for b in 0..num_buckets {
        offsets[b + 1] += offsets[b];
    }
    offsets
}

// ========================================================================================
//                              Array-level entry points
// ========================================================================================

/// Forward evaluation on raw arrays.
///
/// # Arguments
/// * `control_points`: the flattened control-point store, `[num_control_points, dim]`.
/// * `indices`, `weights`, `segment_ids`: one entry per (sample, control point) pair.
/// * `num_samples`: number of output rows.
pub fn forward(
    control_points: ArrayView2<f64>,
    indices: &[usize],
    weights: &[f64],
    segment_ids: &[usize],
    num_samples: usize,
) -> Result<Array2<f64>, EvaluationError> {
    let operator = EvaluationOperator::new(
        indices.to_vec(),
        weights.to_vec(),
        segment_ids.to_vec(),
        num_samples,
        control_points.nrows(),
    )?;
    operator.apply(control_points, &EngineConfig::default())
}

/// Backward evaluation on raw arrays. The result has the shape of `control_points` and
/// is zero wherever no pair contributes.
pub fn backward(
    grad_output: ArrayView2<f64>,
    control_points: ArrayView2<f64>,
    indices: &[usize],
    weights: &[f64],
    segment_ids: &[usize],
) -> Result<Array2<f64>, EvaluationError> {
    if grad_output.ncols() != control_points.ncols() {
        return Err(EvaluationError::GradientShapeMismatch {
            expected: (grad_output.nrows(), control_points.ncols()),
            found: grad_output.dim(),
        });
    }
    let operator = EvaluationOperator::new(
        indices.to_vec(),
        weights.to_vec(),
        segment_ids.to_vec(),
        grad_output.nrows(),
        control_points.nrows(),
    )?;
    operator.apply_transpose(grad_output, &EngineConfig::default())
}
