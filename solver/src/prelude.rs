//! Re-exports the types most callers need to ease import.

pub use crate::constraint::{Constraint, Fail, PostError, PropagatorId};
pub use crate::constraints::count::Cardinality;
pub use crate::constraints::disjunctive::Task;
pub use crate::solver::Solver;
pub use crate::vars::VarId;
