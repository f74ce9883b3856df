//! The propagator interface shared by every global constraint, and the precondition
//! errors raised when a constraint is posted against a malformed model
//! (`SPEC_FULL.md` §7, precondition-violation errors).

use crate::create_ref_type;
use crate::solver::Solver;

create_ref_type!(PropagatorId);

/// Raised by a propagation failure. Caught by the nearest open checkpoint; never a
/// panic (`spec.md` §7). Carries no payload: the reason is implicit in "this
/// constraint could not be satisfied", which is all the core needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fail;

impl std::fmt::Display for Fail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "propagation failure")
    }
}
impl std::error::Error for Fail {}

/// A malformed constraint-construction request: fatal at `post`/`add_constraint`
/// time, never recovered from (`SPEC_FULL.md` §7).
#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("variable {0:?} was not created by this solver")]
    WrongSolver(crate::vars::VarId),
    #[error("array size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("index {index} out of range (domain size {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("constraint requires at least one variable")]
    EmptyScope,
}

/// Implemented by every global constraint. `post` runs once, at construction time, to
/// allocate reversible state and register watchers; `initial_propagate` then narrows
/// every variable to its first fixed point; `propagate` is what demons call into.
pub trait Constraint: 'static {
    /// Registers watchers and allocates this constraint's reversible state. Returning
    /// `Err` here is a precondition violation, not a propagation failure.
    fn post(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), PostError>;

    /// Runs once, after `post`, over every variable in the constraint's scope.
    fn initial_propagate(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), Fail>;

    /// Runs when one of this constraint's demons is popped off the queue.
    fn propagate(&mut self, solver: &mut Solver, me: PropagatorId, payload: crate::queue::Payload) -> Result<(), Fail>;
}
