//! A minimal depth-first labelling driver, kept purely so the properties and
//! end-to-end scenarios in `spec.md` §8 can be exercised without a real search-tree
//! library (out of scope, `spec.md` §1). Not a general search API: first-fail variable
//! ordering, increasing-value branching, no restarts, no search monitors.

use crate::solver::Solver;
use crate::vars::VarId;

/// Picks the unbound variable with the smallest domain, breaking ties by position.
pub fn select_first_fail(solver: &Solver, vars: &[VarId]) -> Option<VarId> {
    vars.iter()
        .copied()
        .filter(|&v| !solver.is_bound(v))
        .min_by_key(|&v| solver.size(v))
}

/// Enumerates every solution (complete assignment satisfying every posted constraint)
/// up to `limit`, appending each as a vector of values in `vars` order.
pub fn enumerate_solutions(solver: &mut Solver, vars: &[VarId], limit: usize) -> Vec<Vec<i32>> {
    let mut out = Vec::new();
    if solver.is_root_infeasible() {
        return out;
    }
    label(solver, vars, limit, &mut out);
    out
}

fn label(solver: &mut Solver, vars: &[VarId], limit: usize, out: &mut Vec<Vec<i32>>) {
    if out.len() >= limit {
        return;
    }
    match select_first_fail(solver, vars) {
        None => out.push(vars.iter().map(|&v| solver.min(v)).collect()),
        Some(v) => {
            let values = solver.domain_values(v);
            for val in values {
                let ck = solver.checkpoint();
                solver.begin_round();
                let ok = solver.set_value(v, val).and_then(|_| solver.run_to_fixpoint()).is_ok();
                if ok {
                    label(solver, vars, limit, out);
                }
                solver.restore(ck);
                if out.len() >= limit {
                    return;
                }
            }
        }
    }
}

/// Counts solutions without materializing them, capped at `limit` to keep fuzz/property
/// tests from running forever on a pathological model.
pub fn count_solutions(solver: &mut Solver, vars: &[VarId], limit: usize) -> usize {
    enumerate_solutions(solver, vars, limit).len()
}
