// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use thiserror::Error;

/// The two classes of failure the crate reports. Every error carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-supplied data is malformed: bad knot vector, parameter outside the
    /// domain, out-of-bounds index, or mismatched array lengths.
    InvalidInput,
    /// A division by zero whose numerator does not vanish. This is never the
    /// documented `0/0 -> 0` convention; it indicates an invalid knot configuration.
    NumericDegeneracy,
}

/// Errors raised by the univariate spline primitives: knot vectors, span lookup,
/// basis evaluation, refinement and Bezier extraction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplineError {
    #[error("Spline degree must be at least {minimum}, but was {degree}.")]
    InvalidDegree { degree: usize, minimum: usize },

    #[error("Invalid knot vector: {0}")]
    InvalidKnotVector(String),

    #[error("A knot vector needs at least two distinct values, but found {0}.")]
    TooFewUniqueKnots(usize),

    #[error("Parameter {value} lies outside the knot domain [{lower}, {upper}].")]
    ParameterOutOfRange { value: f64, lower: f64, upper: f64 },

    #[error("Parameter {value} does not lie in span {span}, which covers [{lower}, {upper}].")]
    ParameterNotInSpan {
        value: f64,
        span: usize,
        lower: f64,
        upper: f64,
    },

    #[error("Span index {span} is outside the valid range [{lower}, {upper}].")]
    SpanOutOfRange {
        span: usize,
        lower: usize,
        upper: usize,
    },

    #[error("Refined knot vector does not match the coarse one: {0}")]
    IncompatibleRefinement(String),

    #[error("Expected {expected} entries for {what}, but found {found}.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Division by zero with a nonzero numerator in {context} (index {index}).")]
    NumericDegeneracy { context: &'static str, index: usize },
}

impl SplineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SplineError::NumericDegeneracy { .. } => ErrorKind::NumericDegeneracy,
            _ => ErrorKind::InvalidInput,
        }
    }
}

/// Errors raised while flattening a hierarchy or applying the evaluation operator.
/// All of them are caller errors and are detected before any output is written.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("The hierarchy has no levels.")]
    EmptyHierarchy,

    #[error("Got {levels} control-point levels but {shapes} level shapes.")]
    LevelCountMismatch { levels: usize, shapes: usize },

    #[error("Level {level} has {found} control points, but its shape {shape:?} requires {expected}.")]
    LevelSizeMismatch {
        level: usize,
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },

    #[error("Level {level} has control points of dimension {found}, expected {expected}.")]
    PointDimensionMismatch {
        level: usize,
        expected: usize,
        found: usize,
    },

    #[error("Support entry refers to level {level}, but the hierarchy has {num_levels} levels.")]
    LevelOutOfRange { level: usize, num_levels: usize },

    #[error("Multi-index {index:?} is out of bounds for level {level} with shape {shape:?}.")]
    MultiIndexOutOfBounds {
        level: usize,
        index: Vec<usize>,
        shape: Vec<usize>,
    },

    #[error("Global index {index} is out of bounds for {num_control_points} control points.")]
    IndexOutOfBounds {
        index: usize,
        num_control_points: usize,
    },

    #[error("Expected {expected} entries for {what}, but found {found}.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Segment ids must be non-decreasing, but position {position} goes backwards.")]
    UnsortedSegments { position: usize },

    #[error("Segment id {segment} is out of range for {num_samples} samples.")]
    SegmentOutOfRange { segment: usize, num_samples: usize },

    #[error("Upstream gradient has shape {found:?}, expected {expected:?}.")]
    GradientShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

impl EvaluationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degeneracy_is_the_only_numeric_kind() {
        let degenerate = SplineError::NumericDegeneracy {
            context: "basis recursion",
            index: 3,
        };
        assert_eq!(degenerate.kind(), ErrorKind::NumericDegeneracy);
        assert_eq!(
            SplineError::TooFewUniqueKnots(1).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            EvaluationError::UnsortedSegments { position: 4 }.kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn messages_name_the_offending_values() {
        let err = SplineError::ParameterOutOfRange {
            value: 5.0,
            lower: 0.0,
            upper: 4.0,
        };
        assert_eq!(
            err.to_string(),
            "Parameter 5 lies outside the knot domain [0, 4]."
        );
    }
}
