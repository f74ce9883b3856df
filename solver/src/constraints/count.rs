//! `Count` and `Distribute`: cardinality constraints (`spec.md` §4.4), grounded on the
//! bookkeeping scheme in `examples/original_source/constraint_solver/count_cst.cc`
//! (a reversible undecided-set plus forced-occurrence counters per value).

use crate::constraint::{Constraint, Fail, PostError, PropagatorId};
use crate::queue::{DemonId, Priority};
use crate::solver::Solver;
use crate::trail::{Rev, RevBitMatrix, RevBitSet};
use crate::vars::{EventKind, VarId};
use hashbrown::HashMap;

/// A constraint's cardinality bound: either fixed at construction time, a fixed
/// `[lo, hi]` range (used by `Distribute`'s "bounded" specialisation), or an `IntVar`
/// whose own bounds are tightened by propagation.
#[derive(Clone, Copy, Debug)]
pub enum Cardinality {
    Const(i32),
    Range(i32, i32),
    Var(VarId),
}

impl Cardinality {
    fn min(&self, solver: &Solver) -> i32 {
        match self {
            Cardinality::Const(c) => *c,
            Cardinality::Range(lo, _) => *lo,
            Cardinality::Var(v) => solver.min(*v),
        }
    }

    fn max(&self, solver: &Solver) -> i32 {
        match self {
            Cardinality::Const(c) => *c,
            Cardinality::Range(_, hi) => *hi,
            Cardinality::Var(v) => solver.max(*v),
        }
    }

    fn tighten_min(&self, solver: &mut Solver, lo: i32) -> Result<(), Fail> {
        match self {
            Cardinality::Const(_) | Cardinality::Range(..) => {
                if lo > self.max(solver) {
                    Err(solver.fail())
                } else {
                    Ok(())
                }
            }
            Cardinality::Var(v) => solver.set_min(*v, lo),
        }
    }

    fn tighten_max(&self, solver: &mut Solver, hi: i32) -> Result<(), Fail> {
        match self {
            Cardinality::Const(_) | Cardinality::Range(..) => {
                if hi < self.min(solver) {
                    Err(solver.fail())
                } else {
                    Ok(())
                }
            }
            Cardinality::Var(v) => solver.set_max(*v, hi),
        }
    }

    fn watch(&self, solver: &mut Solver, demon: DemonId) {
        if let Cardinality::Var(v) = self {
            solver.watch(*v, EventKind::WhenRange, demon);
        }
    }
}

/// `Count(vars, value, count)`: `count == |{ i : vars[i] == value }|`.
pub struct Count {
    vars: Vec<VarId>,
    value: i32,
    count: Cardinality,
    undecided: RevBitSet,
    min_occ: Rev<i32>,
    max_occ: Rev<i32>,
}

impl Count {
    pub fn new(vars: &[VarId], value: i32, count: Cardinality) -> Result<Self, PostError> {
        if vars.is_empty() {
            return Err(PostError::EmptyScope);
        }
        Ok(Count {
            vars: vars.to_vec(),
            value,
            count,
            undecided: RevBitSet::new(vars.len(), true),
            min_occ: Rev::new(0),
            max_occ: Rev::new(0),
        })
    }

    fn recheck_and_force(&mut self, solver: &mut Solver) -> Result<(), Fail> {
        let min_occ = self.min_occ.get();
        let max_occ = self.max_occ.get();
        if min_occ > self.count.max(solver) || max_occ < self.count.min(solver) {
            return Err(solver.fail());
        }
        self.count.tighten_min(solver, min_occ)?;
        self.count.tighten_max(solver, max_occ)?;
        if min_occ == self.count.max(solver) {
            // Every remaining undecided variable must NOT take `value`.
            let mut i = self.undecided.get_first_bit(0);
            while let Some(idx) = i {
                solver.remove_value(self.vars[idx], self.value)?;
                i = self.undecided.get_first_bit(idx + 1);
            }
        }
        if max_occ == self.count.min(solver) {
            // Every remaining undecided variable must take `value`.
            let mut i = self.undecided.get_first_bit(0);
            while let Some(idx) = i {
                solver.set_value(self.vars[idx], self.value)?;
                i = self.undecided.get_first_bit(idx + 1);
            }
        }
        Ok(())
    }

    fn on_var_event(&mut self, solver: &mut Solver, idx: usize) -> Result<(), Fail> {
        if !self.undecided.is_set(idx) {
            return Ok(());
        }
        let v = self.vars[idx];
        if solver.is_bound(v) {
            self.undecided.set_to_zero(&mut solver.trail, idx);
            if solver.min(v) == self.value {
                self.min_occ.set(&mut solver.trail, self.min_occ.get() + 1);
            } else {
                self.max_occ.set(&mut solver.trail, self.max_occ.get() - 1);
            }
            self.recheck_and_force(solver)
        } else if !solver.contains(v, self.value) {
            self.undecided.set_to_zero(&mut solver.trail, idx);
            self.max_occ.set(&mut solver.trail, self.max_occ.get() - 1);
            self.recheck_and_force(solver)
        } else {
            Ok(())
        }
    }
}

impl Constraint for Count {
    fn post(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), PostError> {
        for i in 0..self.vars.len() {
            let d = solver.new_demon(me, i as u32, Priority::Normal);
            solver.watch(self.vars[i], EventKind::WhenBound, d);
            solver.watch(self.vars[i], EventKind::WhenDomain, d);
        }
        let d = solver.new_demon(me, self.vars.len() as u32, Priority::Normal);
        self.count.watch(solver, d);
        Ok(())
    }

    fn initial_propagate(&mut self, solver: &mut Solver, _me: PropagatorId) -> Result<(), Fail> {
        for idx in 0..self.vars.len() {
            let v = self.vars[idx];
            if !solver.contains(v, self.value) {
                self.undecided.set_to_zero(&mut solver.trail, idx);
            } else if solver.is_bound(v) {
                self.undecided.set_to_zero(&mut solver.trail, idx);
                self.min_occ.set(&mut solver.trail, self.min_occ.get() + 1);
                self.max_occ.set(&mut solver.trail, self.max_occ.get() + 1);
            } else {
                self.max_occ.set(&mut solver.trail, self.max_occ.get() + 1);
            }
        }
        self.recheck_and_force(solver)
    }

    fn propagate(&mut self, solver: &mut Solver, _me: PropagatorId, payload: crate::queue::Payload) -> Result<(), Fail> {
        let idx = payload as usize;
        if idx == self.vars.len() {
            self.recheck_and_force(solver)
        } else {
            self.on_var_event(solver, idx)
        }
    }
}

/// `Distribute(vars, values, cards)`: generalises `Count` to a vector of distinct
/// values, each with its own cardinality.
///
/// Per the open question noted in `spec.md` §9, `values` is never sorted: the "fast"
/// direct-indexing specialisation only kicks in when `values[j] == j` for every `j`
/// exactly as given, matching the original's input-order-dependent behaviour.
pub struct Distribute {
    vars: Vec<VarId>,
    values: Vec<i32>,
    cards: Vec<Cardinality>,
    /// `None` when the fast direct-index specialisation applies (`values[j] == j`);
    /// otherwise maps a value to its column in `undecided`/`min`/`max`.
    value_index: Option<HashMap<i32, usize>>,
    undecided: RevBitMatrix,
    min: Vec<Rev<i32>>,
    max: Vec<Rev<i32>>,
}

impl Distribute {
    pub fn new(vars: &[VarId], values: &[i32], cards: &[Cardinality]) -> Result<Self, PostError> {
        if vars.is_empty() {
            return Err(PostError::EmptyScope);
        }
        if values.len() != cards.len() {
            return Err(PostError::SizeMismatch {
                expected: values.len(),
                actual: cards.len(),
            });
        }
        let fast = values.iter().enumerate().all(|(j, &v)| v == j as i32);
        let value_index = if fast {
            None
        } else {
            let mut map = HashMap::new();
            for (j, &v) in values.iter().enumerate() {
                map.insert(v, j);
            }
            Some(map)
        };
        Ok(Distribute {
            vars: vars.to_vec(),
            values: values.to_vec(),
            cards: cards.to_vec(),
            value_index,
            undecided: RevBitMatrix::new(vars.len(), values.len(), true),
            min: (0..values.len()).map(|_| Rev::new(0)).collect(),
            max: (0..values.len()).map(|_| Rev::new(0)).collect(),
        })
    }

    /// `Distribute`'s "bounded" specialisation (`spec.md` §4.4): every value in
    /// `0..num_bins` shares the same `[card_min, card_max]` cardinality range.
    pub fn new_bounded(vars: &[VarId], num_bins: i32, card_min: i32, card_max: i32) -> Result<Self, PostError> {
        let values: Vec<i32> = (0..num_bins).collect();
        let cards = vec![Cardinality::Range(card_min, card_max); num_bins as usize];
        Self::new(vars, &values, &cards)
    }

    fn col_of(&self, value: i32) -> Option<usize> {
        match &self.value_index {
            None => {
                if value >= 0 && (value as usize) < self.values.len() {
                    Some(value as usize)
                } else {
                    None
                }
            }
            Some(map) => map.get(&value).copied(),
        }
    }

    fn recheck_and_force(&mut self, solver: &mut Solver, j: usize) -> Result<(), Fail> {
        let lo = self.min[j].get();
        let hi = self.max[j].get();
        if lo > self.cards[j].max(solver) || hi < self.cards[j].min(solver) {
            return Err(solver.fail());
        }
        self.cards[j].tighten_min(solver, lo)?;
        self.cards[j].tighten_max(solver, hi)?;
        // Walk every variable still undecided for value j and force it one way or the
        // other, exactly as in `Count::recheck_and_force`.
        if lo == self.cards[j].max(solver) {
            for vi in 0..self.vars.len() {
                if self.undecided.is_set(vi, j) {
                    solver.remove_value(self.vars[vi], self.values[j])?;
                }
            }
        }
        if hi == self.cards[j].min(solver) {
            for vi in 0..self.vars.len() {
                if self.undecided.is_set(vi, j) {
                    solver.set_value(self.vars[vi], self.values[j])?;
                }
            }
        }
        Ok(())
    }

    fn clear_undecided(&mut self, solver: &mut Solver, vi: usize, j: usize) {
        self.undecided.set_to_zero(&mut solver.trail, vi, j);
    }

    fn on_var_event(&mut self, solver: &mut Solver, vi: usize) -> Result<(), Fail> {
        let v = self.vars[vi];
        if solver.is_bound(v) {
            let val = solver.min(v);
            if let Some(j) = self.col_of(val) {
                if self.undecided.is_set(vi, j) {
                    self.clear_undecided(solver, vi, j);
                    self.min[j].set(&mut solver.trail, self.min[j].get() + 1);
                    self.recheck_and_force(solver, j)?;
                }
            }
            // every other value this variable could have taken is now impossible
            for j in 0..self.values.len() {
                if self.undecided.is_set(vi, j) && self.values[j] != val {
                    self.clear_undecided(solver, vi, j);
                    self.max[j].set(&mut solver.trail, self.max[j].get() - 1);
                    self.recheck_and_force(solver, j)?;
                }
            }
            Ok(())
        } else {
            for j in 0..self.values.len() {
                if self.undecided.is_set(vi, j) && !solver.contains(v, self.values[j]) {
                    self.clear_undecided(solver, vi, j);
                    self.max[j].set(&mut solver.trail, self.max[j].get() - 1);
                    self.recheck_and_force(solver, j)?;
                }
            }
            Ok(())
        }
    }
}

impl Constraint for Distribute {
    fn post(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), PostError> {
        for vi in 0..self.vars.len() {
            let d = solver.new_demon(me, vi as u32, Priority::Normal);
            solver.watch(self.vars[vi], EventKind::WhenBound, d);
            solver.watch(self.vars[vi], EventKind::WhenDomain, d);
        }
        for j in 0..self.values.len() {
            let d = solver.new_demon(me, (self.vars.len() + j) as u32, Priority::Normal);
            self.cards[j].watch(solver, d);
        }
        Ok(())
    }

    fn initial_propagate(&mut self, solver: &mut Solver, _me: PropagatorId) -> Result<(), Fail> {
        for vi in 0..self.vars.len() {
            let v = self.vars[vi];
            for j in 0..self.values.len() {
                let val = self.values[j];
                if !solver.contains(v, val) {
                    self.undecided.set_to_zero(&mut solver.trail, vi, j);
                } else if solver.is_bound(v) {
                    self.undecided.set_to_zero(&mut solver.trail, vi, j);
                    self.min[j].set(&mut solver.trail, self.min[j].get() + 1);
                    self.max[j].set(&mut solver.trail, self.max[j].get() + 1);
                } else {
                    self.max[j].set(&mut solver.trail, self.max[j].get() + 1);
                }
            }
        }
        for j in 0..self.values.len() {
            self.recheck_and_force(solver, j)?;
        }
        Ok(())
    }

    fn propagate(&mut self, solver: &mut Solver, _me: PropagatorId, payload: crate::queue::Payload) -> Result<(), Fail> {
        let idx = payload as usize;
        if idx < self.vars.len() {
            self.on_var_event(solver, idx)
        } else {
            self.recheck_and_force(solver, idx - self.vars.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::enumerate_solutions;

    #[test]
    fn count_exactly_two_ones_among_three_bools() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..3).map(|_| solver.new_bool_var()).collect();
        solver.make_count(&vars, 1, Cardinality::Const(2)).unwrap();
        let sols = enumerate_solutions(&mut solver, &vars, 100);
        let mut sols: Vec<Vec<i32>> = sols;
        sols.sort();
        let mut expected = vec![vec![1, 1, 0], vec![1, 0, 1], vec![0, 1, 1]];
        expected.sort();
        assert_eq!(sols, expected);
    }

    #[test]
    fn distribute_five_vars_three_values_thirty_solutions() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..5).map(|_| solver.new_int_var(0, 2)).collect();
        let cards = [Cardinality::Const(2), Cardinality::Const(2), Cardinality::Const(1)];
        solver.make_distribute(&vars, &[0, 1, 2], &cards).unwrap();
        let sols = enumerate_solutions(&mut solver, &vars, 1000);
        assert_eq!(sols.len(), 30);
        for sol in &sols {
            let mut occ = [0i32; 3];
            for &v in sol {
                occ[v as usize] += 1;
            }
            assert_eq!(occ, [2, 2, 1]);
        }
    }

    #[test]
    fn infeasible_count_fails_at_root() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..2).map(|_| solver.new_int_var(1, 1)).collect();
        solver.make_count(&vars, 1, Cardinality::Const(0)).unwrap();
        assert!(solver.is_root_infeasible());
    }
}
