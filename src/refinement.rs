// ========================================================================================
//
//                      The refinement operator: coarse-to-fine transfer
//
// ========================================================================================
//
// Builds the matrix T with `P_fine = T * P_coarse` for a coarse knot vector and a refined
// one. Row `i` only ever depends on fine knot `i` and the coarse knots, so the rows are
// assembled independently and in parallel.

use crate::basis::divide_or_zero;
use crate::knots::{KnotVector, validate_sorted};
use crate::types::SplineError;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis};

/// Assembles the knot-insertion operator between two knot vectors of the same degree.
///
/// Sub-degree 0 is the indicator `T[i, j] = 1` iff `fine[i]` lies in the half-open
/// interval `[coarse[j], coarse[j + 1])`. Each pass `q = 1..=degree` then blends adjacent
/// columns with the knot-insertion weights, choosing between three mutually exclusive
/// cases depending on which of the two parent supports is degenerate.
///
/// # Returns
/// An `Array2<f64>` of shape `[fine.len() - degree - 1, coarse.len() - degree - 1]`
/// (fine basis by coarse basis). When `fine` contains every knot of `coarse`, each row
/// sums to one. A `fine` vector that is not a refinement is accepted with a warning;
/// the resulting operator is meaningless and that is the caller's responsibility.
pub fn assemble_refinement_operator(
    coarse: ArrayView1<f64>,
    fine: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, SplineError> {
    validate_sorted(coarse)?;
    validate_sorted(fine)?;

    let required = 2 * (degree + 1);
    if coarse.len() < required {
        return Err(SplineError::InvalidKnotVector(format!(
            "degree {degree} needs at least {required} coarse knots, got {}",
            coarse.len()
        )));
    }
    if fine.len() < coarse.len() {
        return Err(SplineError::IncompatibleRefinement(format!(
            "fine vector has {} knots, fewer than the {} coarse knots",
            fine.len(),
            coarse.len()
        )));
    }
    let ends_match = coarse[0] == fine[0] && coarse[coarse.len() - 1] == fine[fine.len() - 1];
    if !ends_match {
        return Err(SplineError::IncompatibleRefinement(
            "fine and coarse vectors span different domains".to_string(),
        ));
    }
    if !is_nested(coarse, fine) {
        log::warn!(
            "Fine knot vector does not contain every coarse knot; the degree-{degree} transfer operator will not reproduce the coarse spline."
        );
    }

    let rows = fine.len() - degree - 1;
    let cols = coarse.len() - degree - 1;
    let mut t = Array2::zeros((rows, cols));

    t.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .try_for_each(|(i, row)| assemble_row(i, coarse, fine, degree, row))?;

    log::debug!("Assembled {rows}x{cols} refinement operator for degree {degree}");
    Ok(t)
}

/// `assemble_refinement_operator` for two validated knot vectors.
pub fn refinement_operator(coarse: &KnotVector, fine: &KnotVector) -> Result<Array2<f64>, SplineError> {
    if coarse.degree() != fine.degree() {
        return Err(SplineError::IncompatibleRefinement(format!(
            "coarse degree {} differs from fine degree {}",
            coarse.degree(),
            fine.degree()
        )));
    }
    assemble_refinement_operator(coarse.knots(), fine.knots(), coarse.degree())
}

// Runs the sub-degree recursion for a single fine-basis row.
fn assemble_row(
    i: usize,
    coarse: ArrayView1<f64>,
    fine: ArrayView1<f64>,
    degree: usize,
    mut row: ArrayViewMut1<f64>,
) -> Result<(), SplineError> {
    let x = fine[i];
    let mut current: Vec<f64> = (0..coarse.len() - 1)
        .map(|j| if x >= coarse[j] && x < coarse[j + 1] { 1.0 } else { 0.0 })
        .collect();

    for q in 1..=degree {
        let x = fine[i + q];
        let mut next = vec![0.0; coarse.len() - q - 1];
        for (j, value) in next.iter_mut().enumerate() {
            let left_width = coarse[j + q] - coarse[j];
            let right_width = coarse[j + q + 1] - coarse[j + 1];
            // A zero-width parent must carry a zero coefficient.
            let left = divide_or_zero(current[j], left_width, "refinement operator", j)?;
            let right = divide_or_zero(current[j + 1], right_width, "refinement operator", j + 1)?;
            *value = (x - coarse[j]) * left + (coarse[j + q + 1] - x) * right;
        }
        current = next;
    }

    row.iter_mut().zip(current).for_each(|(dst, src)| *dst = src);
    Ok(())
}

// Multiset inclusion of `coarse` in `fine`; both are sorted.
fn is_nested(coarse: ArrayView1<f64>, fine: ArrayView1<f64>) -> bool {
    let mut fine_iter = fine.iter().peekable();
    coarse.iter().all(|&c| {
        while fine_iter.next_if(|&&f| f < c).is_some() {}
        fine_iter.next_if(|&&f| f == c).is_some()
    })
}
