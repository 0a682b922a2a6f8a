//! Shared test fixtures.
//!
//! Used by unit tests and the integration tests under `tests/`; not part of
//! the public API surface proper.

use crate::graph::Graph;
use crate::params::StackParams;
use crate::reconciler::{ApplyOptions, Stack};
use crate::template::stack_descriptors;
use crate::wait::ConvergencePolicy;

/// Default parameters, which are valid as-is
pub fn test_params() -> StackParams {
    StackParams::default()
}

/// Apply options with millisecond-scale polling for fast tests
pub fn fast_options() -> ApplyOptions {
    ApplyOptions {
        convergence: ConvergencePolicy::fast(),
        ..ApplyOptions::default()
    }
}

/// A stack built from [`test_params`]
pub fn test_stack() -> Stack {
    Stack::new(test_params()).expect("default parameters are valid")
}

/// The full resource graph for `params`
pub fn full_graph(params: &StackParams) -> Graph {
    Graph::build(stack_descriptors(params)).expect("stack template is acyclic")
}
