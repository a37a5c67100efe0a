// ========================================================================================
//
//                 Hierarchical evaluation: from per-level data to a flat plan
//
// ========================================================================================
//
// A THB-spline stores its control points level by level, each level an n-dimensional
// grid. The evaluation kernel only understands one flat control-point store and flat
// (index, weight, segment) triples. This module performs that translation once, so a
// fitting loop can call `forward` and `backward` many times against the same plan.

use crate::config::EngineConfig;
use crate::kernel::EvaluationOperator;
use crate::types::EvaluationError;
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, IxDyn, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One active basis function supporting a sample: the level it lives on and its
/// multi-index into that level's control-point grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupportEntry {
    pub level: usize,
    pub index: Vec<usize>,
}

impl SupportEntry {
    pub fn new(level: usize, index: impl Into<Vec<usize>>) -> Self {
        Self {
            level,
            index: index.into(),
        }
    }
}

/// Row-major (C order) position of `index` in a grid of the given `shape`.
/// Returns `None` when the ranks differ or any component is out of bounds.
pub fn ravel_multi_index(index: &[usize], shape: &[usize]) -> Option<usize> {
    if index.len() != shape.len() {
        return None;
    }
    index
        .iter()
        .zip(shape)
        .try_fold(0usize, |acc, (&i, &n)| (i < n).then(|| acc * n + i))
}

/// Prefix sums of level sizes: level `l` occupies rows `offsets[l]..offsets[l + 1]`.
pub fn level_offsets(level_shapes: &[Vec<usize>]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(level_shapes.len() + 1);
    offsets.push(0);
    for shape in level_shapes {
        let size: usize = shape.iter().product();
        offsets.push(offsets[offsets.len() - 1] + size);
    }
    offsets
}

/// Concatenates per-level control points into one `[total, dim]` store.
///
/// Level `l` may be given either with shape `[level_shapes[l].., dim]` or already
/// flattened as `[prod(level_shapes[l]), dim]`. Points are laid out level by level and,
/// within a level, in row-major order of the multi-index.
pub fn flatten_levels(
    levels: &[ArrayViewD<f64>],
    level_shapes: &[Vec<usize>],
) -> Result<(Array2<f64>, Vec<usize>), EvaluationError> {
    if levels.is_empty() {
        return Err(EvaluationError::EmptyHierarchy);
    }
    if levels.len() != level_shapes.len() {
        return Err(EvaluationError::LevelCountMismatch {
            levels: levels.len(),
            shapes: level_shapes.len(),
        });
    }

    let dim = levels[0].shape().last().copied().unwrap_or(0);
    let offsets = level_offsets(level_shapes);
    let mut flat = Array2::zeros((offsets[levels.len()], dim));

    for (level, (view, shape)) in levels.iter().zip(level_shapes).enumerate() {
        let (leading, last) = view.shape().split_at(view.ndim().saturating_sub(1));
        let found_dim = last.first().copied().unwrap_or(0);
        if found_dim != dim {
            return Err(EvaluationError::PointDimensionMismatch {
                level,
                expected: dim,
                found: found_dim,
            });
        }

        let expected: usize = shape.iter().product();
        let already_flat = leading.len() == 1 && leading[0] == expected;
        if leading != shape.as_slice() && !already_flat {
            return Err(EvaluationError::LevelSizeMismatch {
                level,
                shape: shape.clone(),
                expected,
                found: leading.iter().product(),
            });
        }

        // `iter` walks the view in logical row-major order whatever its memory layout.
        flat.slice_mut(s![offsets[level]..offsets[level + 1], ..])
            .iter_mut()
            .zip(view.iter())
            .for_each(|(dst, &src)| *dst = src);
    }
    Ok((flat, offsets))
}

/// A prepared evaluation context: the flattened control points plus the validated
/// sparse plan that maps them onto the samples.
#[derive(Debug)]
pub struct HierarchicalEvaluation {
    control_points: Array2<f64>,
    level_shapes: Vec<Vec<usize>>,
    level_offsets: Vec<usize>,
    operator: EvaluationOperator,
    config: EngineConfig,
}

/// Flattens a hierarchy and its per-sample supports into an evaluation context.
///
/// # Arguments
/// * `levels`: control points of each level, `[shape.., dim]` or `[prod(shape), dim]`.
/// * `level_shapes`: the grid shape of each level.
/// * `supports`: for each sample, the active basis functions supporting it.
/// * `weights`: for each sample, the basis values aligned with `supports`.
/// * `config`: execution settings carried into every later pass.
///
/// Sample `s` becomes segment `s`; its triples keep the order of `supports[s]`. A
/// sample with no support entries evaluates to zero.
pub fn prepare_hierarchical_evaluation(
    levels: &[ArrayViewD<f64>],
    level_shapes: &[Vec<usize>],
    supports: &[Vec<SupportEntry>],
    weights: &[Vec<f64>],
    config: EngineConfig,
) -> Result<HierarchicalEvaluation, EvaluationError> {
    let (control_points, level_offsets) = flatten_levels(levels, level_shapes)?;

    if weights.len() != supports.len() {
        return Err(EvaluationError::LengthMismatch {
            what: "per-sample weight lists",
            expected: supports.len(),
            found: weights.len(),
        });
    }

    let num_samples = supports.len();
    let num_terms: usize = supports.iter().map(Vec::len).sum();
    let mut global_indices = Vec::with_capacity(num_terms);
    let mut flat_weights = Vec::with_capacity(num_terms);
    let mut segment_ids = Vec::with_capacity(num_terms);

    for (sample, (entries, values)) in supports.iter().zip(weights).enumerate() {
        if entries.len() != values.len() {
            return Err(EvaluationError::LengthMismatch {
                what: "basis weights of a sample",
                expected: entries.len(),
                found: values.len(),
            });
        }
        for (entry, &weight) in entries.iter().zip(values) {
            global_indices.push(global_index(entry, level_shapes, &level_offsets)?);
            flat_weights.push(weight);
            segment_ids.push(sample);
        }
    }

    if let Some(tolerance) = config.unity_tolerance {
        warn_on_unity_violations(weights, tolerance);
    }

    let operator = EvaluationOperator::new(
        global_indices,
        flat_weights,
        segment_ids,
        num_samples,
        control_points.nrows(),
    )?;

    log::debug!(
        "Prepared hierarchical evaluation: {} levels, {} control points of dimension {}, {} samples, {} terms",
        level_shapes.len(),
        control_points.nrows(),
        control_points.ncols(),
        num_samples,
        operator.num_terms()
    );

    Ok(HierarchicalEvaluation {
        control_points,
        level_shapes: level_shapes.to_vec(),
        level_offsets,
        operator,
        config,
    })
}

fn global_index(
    entry: &SupportEntry,
    level_shapes: &[Vec<usize>],
    offsets: &[usize],
) -> Result<usize, EvaluationError> {
    let shape = level_shapes
        .get(entry.level)
        .ok_or(EvaluationError::LevelOutOfRange {
            level: entry.level,
            num_levels: level_shapes.len(),
        })?;
    let local = ravel_multi_index(&entry.index, shape).ok_or_else(|| {
        EvaluationError::MultiIndexOutOfBounds {
            level: entry.level,
            index: entry.index.clone(),
            shape: shape.clone(),
        }
    })?;
    Ok(offsets[entry.level] + local)
}

fn warn_on_unity_violations(weights: &[Vec<f64>], tolerance: f64) {
    let mut violations = weights
        .iter()
        .enumerate()
        .filter(|(_, values)| !values.is_empty())
        .map(|(s, values)| (s, values.iter().sum::<f64>()))
        .filter(|(_, total)| (total - 1.0).abs() > tolerance);

    if let Some((first, total)) = violations.next() {
        let count = 1 + violations.count();
        log::warn!(
            "{count} samples have basis weights that do not sum to one (first: sample {first}, sum {total}); check the support lists."
        );
    }
}

impl HierarchicalEvaluation {
    /// Evaluates the spline at every sample with the stored control points.
    pub fn forward(&self) -> Array2<f64> {
        self.operator.gather(self.control_points.view(), &self.config)
    }

    /// Evaluates the spline with another flat control-point store of the same layout,
    /// for example after an optimizer step.
    pub fn forward_with(
        &self,
        control_points: ArrayView2<f64>,
    ) -> Result<Array2<f64>, EvaluationError> {
        self.operator.apply(control_points, &self.config)
    }

    /// Gradient of a scalar loss with respect to the flat control points, given its
    /// gradient with respect to the samples (`[num_samples, dim]`).
    pub fn backward(&self, grad_output: ArrayView2<f64>) -> Result<Array2<f64>, EvaluationError> {
        let expected = (self.num_samples(), self.point_dim());
        if grad_output.dim() != expected {
            return Err(EvaluationError::GradientShapeMismatch {
                expected,
                found: grad_output.dim(),
            });
        }
        self.operator.apply_transpose(grad_output, &self.config)
    }

    /// Splits a flat `[num_control_points, dim]` array back into per-level arrays of
    /// shape `[level_shape.., dim]`.
    pub fn split_levels(&self, flat: ArrayView2<f64>) -> Result<Vec<ArrayD<f64>>, EvaluationError> {
        if flat.nrows() != self.num_control_points() {
            return Err(EvaluationError::LengthMismatch {
                what: "flat control-point rows",
                expected: self.num_control_points(),
                found: flat.nrows(),
            });
        }
        self.level_shapes
            .iter()
            .enumerate()
            .map(|(level, shape)| {
                let rows = flat.slice(s![self.level_offsets[level]..self.level_offsets[level + 1], ..]);
                let mut full = shape.clone();
                full.push(flat.ncols());
                ArrayD::from_shape_vec(IxDyn(&full), rows.iter().copied().collect()).map_err(|_| {
                    EvaluationError::LevelSizeMismatch {
                        level,
                        shape: shape.clone(),
                        expected: shape.iter().product(),
                        found: rows.nrows(),
                    }
                })
            })
            .collect()
    }

    pub fn control_points(&self) -> ArrayView2<'_, f64> {
        self.control_points.view()
    }

    /// Rows of level `level` in the flat store.
    pub fn level_range(&self, level: usize) -> Option<Range<usize>> {
        (level < self.num_levels()).then(|| self.level_offsets[level]..self.level_offsets[level + 1])
    }

    pub fn level_control_points(&self, level: usize) -> Option<ArrayView2<'_, f64>> {
        self.level_range(level)
            .map(|range| self.control_points.slice(s![range, ..]))
    }

    pub fn level_offsets(&self) -> &[usize] {
        &self.level_offsets
    }

    pub fn level_shapes(&self) -> &[Vec<usize>] {
        &self.level_shapes
    }

    /// Flat row of a (level, multi-index) pair.
    pub fn global_index(&self, entry: &SupportEntry) -> Result<usize, EvaluationError> {
        global_index(entry, &self.level_shapes, &self.level_offsets)
    }

    pub fn num_levels(&self) -> usize {
        self.level_shapes.len()
    }

    pub fn num_control_points(&self) -> usize {
        self.control_points.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.operator.num_samples()
    }

    pub fn point_dim(&self) -> usize {
        self.control_points.ncols()
    }

    pub fn operator(&self) -> &EvaluationOperator {
        &self.operator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};

    fn two_level_context(config: EngineConfig) -> HierarchicalEvaluation {
        let coarse = array![[0.0, 0.0], [1.0, 1.0]];
        let fine = Array3::from_shape_fn((2, 2, 2), |(i, j, d)| (10 * i + j) as f64 + d as f64 * 0.5);
        let levels = vec![coarse.view().into_dyn(), fine.view().into_dyn()];
        let shapes = vec![vec![2], vec![2, 2]];
        let supports = vec![
            vec![SupportEntry::new(0, [0]), SupportEntry::new(0, [1])],
            vec![SupportEntry::new(1, [1, 0]), SupportEntry::new(0, [1])],
            vec![],
        ];
        let weights = vec![vec![0.25, 0.75], vec![0.5, 0.5], vec![]];
        prepare_hierarchical_evaluation(&levels, &shapes, &supports, &weights, config).unwrap()
    }

    #[test]
    fn ravel_is_row_major() {
        assert_eq!(ravel_multi_index(&[1, 2], &[3, 4]), Some(6));
        assert_eq!(ravel_multi_index(&[2, 3, 1], &[3, 4, 2]), Some(23));
        assert_eq!(ravel_multi_index(&[], &[]), Some(0));
        assert_eq!(ravel_multi_index(&[3, 0], &[3, 4]), None);
        assert_eq!(ravel_multi_index(&[1], &[3, 4]), None);
    }

    #[test]
    fn layout_concatenates_levels_in_order() {
        let ctx = two_level_context(EngineConfig::default());
        assert_eq!(ctx.level_offsets(), &[0, 2, 6]);
        assert_eq!(ctx.level_range(1), Some(2..6));
        assert_eq!(ctx.level_range(2), None);
        assert_eq!(ctx.num_control_points(), 6);
        assert_eq!(ctx.global_index(&SupportEntry::new(1, [1, 0])).unwrap(), 4);
        assert_eq!(ctx.operator().indices(), &[0, 1, 4, 1]);
        assert_eq!(ctx.operator().segment_ids(), &[0, 0, 1, 1]);
        assert_eq!(
            ctx.level_control_points(1).unwrap().row(2),
            array![10.0, 10.5]
        );
    }

    #[test]
    fn forward_blends_across_levels() {
        let ctx = two_level_context(EngineConfig::default());
        let out = ctx.forward();
        let expected = array![[0.75, 0.75], [5.5, 5.75], [0.0, 0.0]];
        assert_abs_diff_eq!(out, expected, epsilon = 1e-15);
    }

    #[test]
    fn backward_returns_per_level_gradients() {
        let ctx = two_level_context(EngineConfig::serial());
        let grad = ctx.backward(Array2::ones((3, 2)).view()).unwrap();
        let per_level = ctx.split_levels(grad.view()).unwrap();
        assert_eq!(per_level[0].shape(), &[2, 2]);
        assert_eq!(per_level[1].shape(), &[2, 2, 2]);
        assert_abs_diff_eq!(per_level[0][[0, 1]], 0.25, epsilon = 1e-15);
        assert_abs_diff_eq!(per_level[0][[1, 0]], 1.25, epsilon = 1e-15);
        assert_abs_diff_eq!(per_level[1][[1, 0, 1]], 0.5, epsilon = 1e-15);
        assert_eq!(per_level[1][[0, 0, 0]], 0.0);
    }

    #[test]
    fn gradient_shape_is_checked() {
        let ctx = two_level_context(EngineConfig::default());
        assert_eq!(
            ctx.backward(Array2::ones((3, 3)).view()).unwrap_err(),
            EvaluationError::GradientShapeMismatch {
                expected: (3, 2),
                found: (3, 3)
            }
        );
    }

    #[test]
    fn flat_and_gridded_levels_are_equivalent() {
        let grid = Array3::from_shape_fn((2, 3, 1), |(i, j, _)| (i * 3 + j) as f64);
        let flat = grid.clone().into_shape_with_order((6, 1)).unwrap();
        let shapes = vec![vec![2, 3]];
        let (a, _) = flatten_levels(&[grid.view().into_dyn()], &shapes).unwrap();
        let (b, _) = flatten_levels(&[flat.view().into_dyn()], &shapes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_hierarchies_are_rejected() {
        let cp = array![[0.0, 0.0], [1.0, 1.0]];
        let levels = vec![cp.view().into_dyn()];
        let shapes = vec![vec![2]];
        let config = EngineConfig::default;

        assert_eq!(
            prepare_hierarchical_evaluation(&[], &[], &[], &[], config()).unwrap_err(),
            EvaluationError::EmptyHierarchy
        );
        assert!(matches!(
            prepare_hierarchical_evaluation(&levels, &[vec![3]], &[], &[], config()),
            Err(EvaluationError::LevelSizeMismatch { expected: 3, found: 2, .. })
        ));
        assert!(matches!(
            prepare_hierarchical_evaluation(
                &levels,
                &shapes,
                &[vec![SupportEntry::new(1, [0])]],
                &[vec![1.0]],
                config()
            ),
            Err(EvaluationError::LevelOutOfRange { level: 1, num_levels: 1 })
        ));
        assert!(matches!(
            prepare_hierarchical_evaluation(
                &levels,
                &shapes,
                &[vec![SupportEntry::new(0, [2])]],
                &[vec![1.0]],
                config()
            ),
            Err(EvaluationError::MultiIndexOutOfBounds { .. })
        ));
        assert!(matches!(
            prepare_hierarchical_evaluation(
                &levels,
                &shapes,
                &[vec![SupportEntry::new(0, [0])]],
                &[vec![1.0, 0.0]],
                config()
            ),
            Err(EvaluationError::LengthMismatch { .. })
        ));

        let other = array![[0.0, 0.0, 0.0]];
        assert!(matches!(
            flatten_levels(
                &[cp.view().into_dyn(), other.view().into_dyn()],
                &[vec![2], vec![1]]
            ),
            Err(EvaluationError::PointDimensionMismatch { level: 1, expected: 2, found: 3 })
        ));
    }

    #[test]
    fn unity_violations_only_warn() {
        let cp = array![[1.0], [2.0]];
        let config = EngineConfig {
            unity_tolerance: Some(1e-12),
            ..EngineConfig::default()
        };
        let ctx = prepare_hierarchical_evaluation(
            &[cp.view().into_dyn()],
            &[vec![2]],
            &[vec![SupportEntry::new(0, [0]), SupportEntry::new(0, [1])]],
            &[vec![0.5, 0.25]],
            config,
        )
        .unwrap();
        assert_abs_diff_eq!(ctx.forward(), array![[1.0]], epsilon = 1e-15);
    }
}
