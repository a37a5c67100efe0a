pub mod basis;
pub mod config;
pub mod extraction;
pub mod hierarchy;
pub mod kernel;
pub mod knots;
pub mod refinement;
pub mod types;

pub use basis::{basis_fun, basis_fun_derivatives, basis_funs, basis_funs_derivatives, tensor_product};
pub use config::{ConfigError, EngineConfig};
pub use extraction::{bernstein_basis, bezier_operators, extract_bezier_operators};
pub use hierarchy::{
    HierarchicalEvaluation, SupportEntry, flatten_levels, prepare_hierarchical_evaluation,
    ravel_multi_index,
};
pub use kernel::{EvaluationOperator, backward, forward};
pub use knots::{KnotVector, find_span, find_spans, greville_abscissae, parametric_grid, refine_knots};
pub use refinement::{assemble_refinement_operator, refinement_operator};
pub use types::{ErrorKind, EvaluationError, SplineError};
