//! `PositiveTable`: allowed-tuples (extensional) constraint (`spec.md` §4.6), grounded
//! on `examples/original_source/constraint_solver/table.cc`'s dispatch between a
//! single-word bitset, a multi-word "long" bitset, and a hash-map-backed sparse
//! representation, selected by tuple count and value-domain span.
//!
//! All three share the same propagation rule: `actives` is the set of tuples still
//! compatible with every variable's current domain; on a domain change, `actives` is
//! narrowed by clearing the bits of every tuple that supported a just-removed value,
//! and every variable's domain is then rescanned for values that lost all support.

use crate::config;
use crate::constraint::{Constraint, Fail, PostError, PropagatorId};
use crate::queue::Priority;
use crate::solver::Solver;
use crate::trail::{Rev, RevBitSet};
use crate::vars::{EventKind, VarId};
use hashbrown::HashMap;

fn num_words(tuple_count: usize) -> usize {
    tuple_count.div_ceil(64)
}

/// Per-variable `(min, max)` over every tuple's value at that position. `(0, -1)`
/// (an empty range) when `tuples` is empty, so that dense per-variable arrays end up
/// zero-sized instead of computing `i32::MIN - i32::MAX`.
fn value_spans(arity: usize, tuples: &[Vec<i32>]) -> (Vec<i32>, Vec<i32>) {
    if tuples.is_empty() {
        return (vec![0; arity], vec![-1; arity]);
    }
    let mut base_min = vec![i32::MAX; arity];
    let mut base_max = vec![i32::MIN; arity];
    for t in tuples {
        for v in 0..arity {
            base_min[v] = base_min[v].min(t[v]);
            base_max[v] = base_max[v].max(t[v]);
        }
    }
    (base_min, base_max)
}

fn words_or_into(acc: &mut [u64], mask: &[u64]) {
    for (a, m) in acc.iter_mut().zip(mask) {
        *a |= m;
    }
}

fn words_any_set(words: &[u64]) -> bool {
    words.iter().any(|&w| w != 0)
}

/// Single reversible 64-bit word: every mask fits in one word (`spec.md` §4.6,
/// "Bitset form (T ≤ 64)").
struct BitsetRepr {
    actives: Rev<u64>,
    /// `supports[v][value - base_min[v]]`, dense since `T ≤ 64` implies small masks
    /// and the original's bitset form always uses dense per-variable arrays.
    supports: Vec<Vec<u64>>,
    base_min: Vec<i32>,
}

impl BitsetRepr {
    fn new(arity: usize, tuples: &[Vec<i32>]) -> Self {
        let (base_min, base_max) = value_spans(arity, tuples);
        let mut supports: Vec<Vec<u64>> = (0..arity)
            .map(|v| vec![0u64; (base_max[v] - base_min[v] + 1).max(0) as usize])
            .collect();
        for (t_idx, t) in tuples.iter().enumerate() {
            for v in 0..arity {
                let offset = (t[v] - base_min[v]) as usize;
                supports[v][offset] |= 1u64 << t_idx;
            }
        }
        let initial_actives = if tuples.len() >= 64 { u64::MAX } else { (1u64 << tuples.len()) - 1 };
        BitsetRepr {
            actives: Rev::new(initial_actives),
            supports,
            base_min,
        }
    }

    fn mask(&self, v: usize, value: i32) -> u64 {
        let offset = value - self.base_min[v];
        if offset < 0 || offset as usize >= self.supports[v].len() {
            0
        } else {
            self.supports[v][offset as usize]
        }
    }

    fn narrow(&mut self, solver: &mut Solver, union: u64) -> Result<(), Fail> {
        if union == 0 {
            return Ok(());
        }
        let new_actives = self.actives.get() & !union;
        self.actives.set(&mut solver.trail, new_actives);
        if new_actives == 0 {
            return Err(solver.fail());
        }
        Ok(())
    }

    fn rescan(&self, solver: &mut Solver, vars: &[VarId]) -> Result<(), Fail> {
        let actives = self.actives.get();
        for (v, &var) in vars.iter().enumerate() {
            for value in solver.domain_values(var) {
                if self.mask(v, value) & actives == 0 {
                    solver.remove_value(var, value)?;
                }
            }
        }
        Ok(())
    }
}

/// Multi-word reversible bitset: used once `T > 64` (`spec.md` §4.6, "Long-bitset
/// form"). Supports remain dense per-variable arrays, same as [`BitsetRepr`].
struct LongBitsetRepr {
    actives: RevBitSet,
    supports: Vec<Vec<Vec<u64>>>,
    base_min: Vec<i32>,
    words: usize,
}

impl LongBitsetRepr {
    fn new(arity: usize, tuples: &[Vec<i32>]) -> Self {
        let words = num_words(tuples.len());
        let (base_min, base_max) = value_spans(arity, tuples);
        let mut supports: Vec<Vec<Vec<u64>>> = (0..arity)
            .map(|v| vec![vec![0u64; words]; (base_max[v] - base_min[v] + 1).max(0) as usize])
            .collect();
        for (t_idx, t) in tuples.iter().enumerate() {
            for v in 0..arity {
                let offset = (t[v] - base_min[v]) as usize;
                supports[v][offset][t_idx / 64] |= 1u64 << (t_idx % 64);
            }
        }
        LongBitsetRepr {
            actives: RevBitSet::new(tuples.len(), true),
            supports,
            base_min,
            words,
        }
    }

    fn mask(&self, v: usize, value: i32) -> &[u64] {
        let offset = value - self.base_min[v];
        static EMPTY: [u64; 0] = [];
        if offset < 0 || offset as usize >= self.supports[v].len() {
            &EMPTY
        } else {
            &self.supports[v][offset as usize]
        }
    }

    fn narrow(&mut self, solver: &mut Solver, union: &[u64]) -> Result<(), Fail> {
        if !words_any_set(union) {
            return Ok(());
        }
        let mut any_left = false;
        for w in 0..self.words {
            let m = union.get(w).copied().unwrap_or(0);
            if m == 0 {
                if self.actives.word(w) != 0 {
                    any_left = true;
                }
                continue;
            }
            let new_word = self.actives.word(w) & !m;
            self.actives.set_word(&mut solver.trail, w, new_word);
            if new_word != 0 {
                any_left = true;
            }
        }
        if !any_left {
            return Err(solver.fail());
        }
        Ok(())
    }

    fn rescan(&self, solver: &mut Solver, vars: &[VarId]) -> Result<(), Fail> {
        for (v, &var) in vars.iter().enumerate() {
            for value in solver.domain_values(var) {
                let mask = self.mask(v, value);
                let supported = (0..self.words).any(|w| mask.get(w).copied().unwrap_or(0) & self.actives.word(w) != 0);
                if !supported {
                    solver.remove_value(var, value)?;
                }
            }
        }
        Ok(())
    }
}

/// Hash-map-backed form for sparse value domains (`spec.md` §4.6): `supports` is a
/// per-variable map from value to mask rather than a dense array indexed by offset.
struct HashMapRepr {
    actives: RevBitSet,
    supports: Vec<HashMap<i32, Vec<u64>>>,
    words: usize,
}

impl HashMapRepr {
    fn new(arity: usize, tuples: &[Vec<i32>]) -> Self {
        let words = num_words(tuples.len());
        let mut supports: Vec<HashMap<i32, Vec<u64>>> = (0..arity).map(|_| HashMap::new()).collect();
        for (t_idx, t) in tuples.iter().enumerate() {
            for v in 0..arity {
                let entry = supports[v].entry(t[v]).or_insert_with(|| vec![0u64; words]);
                entry[t_idx / 64] |= 1u64 << (t_idx % 64);
            }
        }
        HashMapRepr {
            actives: RevBitSet::new(tuples.len(), true),
            supports,
            words,
        }
    }

    fn mask(&self, v: usize, value: i32) -> Option<&[u64]> {
        self.supports[v].get(&value).map(|m| m.as_slice())
    }

    fn narrow(&mut self, solver: &mut Solver, union: &[u64]) -> Result<(), Fail> {
        if !words_any_set(union) {
            return Ok(());
        }
        let mut any_left = false;
        for w in 0..self.words {
            let m = union.get(w).copied().unwrap_or(0);
            let cur = self.actives.word(w);
            let new_word = if m == 0 { cur } else { cur & !m };
            if new_word != cur {
                self.actives.set_word(&mut solver.trail, w, new_word);
            }
            if new_word != 0 {
                any_left = true;
            }
        }
        if !any_left {
            return Err(solver.fail());
        }
        Ok(())
    }

    fn rescan(&self, solver: &mut Solver, vars: &[VarId]) -> Result<(), Fail> {
        for (v, &var) in vars.iter().enumerate() {
            for value in solver.domain_values(var) {
                let supported = match self.mask(v, value) {
                    None => false,
                    Some(mask) => (0..self.words).any(|w| mask[w] & self.actives.word(w) != 0),
                };
                if !supported {
                    solver.remove_value(var, value)?;
                }
            }
        }
        Ok(())
    }
}

enum Repr {
    Bitset(BitsetRepr),
    LongBitset(LongBitsetRepr),
    HashMap(HashMapRepr),
}

/// `AllowedAssignments(vars, tuples)`: the assignment must be one of `tuples`
/// (`spec.md` §4.6).
pub struct PositiveTable {
    vars: Vec<VarId>,
    repr: Repr,
}

impl PositiveTable {
    pub fn new(vars: &[VarId], tuples: Vec<Vec<i32>>) -> Result<Self, PostError> {
        if vars.is_empty() {
            return Err(PostError::EmptyScope);
        }
        let arity = vars.len();
        for t in &tuples {
            if t.len() != arity {
                return Err(PostError::SizeMismatch {
                    expected: arity,
                    actual: t.len(),
                });
            }
        }
        let tuple_count = tuples.len();
        let span_sum: i64 = (0..arity)
            .map(|v| {
                let mut lo = i64::MAX;
                let mut hi = i64::MIN;
                for t in &tuples {
                    lo = lo.min(t[v] as i64);
                    hi = hi.max(t[v] as i64);
                }
                if tuples.is_empty() { 0 } else { hi - lo + 1 }
            })
            .sum();
        let sparse = span_sum as usize > config::TABLE_SPARSE_DOMAIN_THRESHOLD.get();
        let repr = if sparse {
            Repr::HashMap(HashMapRepr::new(arity, &tuples))
        } else if tuple_count <= config::TABLE_BITSET_MAX_TUPLES.get() {
            Repr::Bitset(BitsetRepr::new(arity, &tuples))
        } else {
            Repr::LongBitset(LongBitsetRepr::new(arity, &tuples))
        };
        Ok(PositiveTable { vars: vars.to_vec(), repr })
    }

    /// Narrows `actives` to exclude every tuple supporting a value in `removed`, then
    /// rescans every variable's domain for values that just lost all support.
    fn narrow_and_rescan(&mut self, solver: &mut Solver, v: usize, removed: &[i32]) -> Result<(), Fail> {
        match &mut self.repr {
            Repr::Bitset(r) => {
                let union = removed.iter().fold(0u64, |acc, &val| acc | r.mask(v, val));
                r.narrow(solver, union)?;
                r.rescan(solver, &self.vars)
            }
            Repr::LongBitset(r) => {
                let mut union = vec![0u64; r.words];
                for &val in removed {
                    words_or_into(&mut union, r.mask(v, val));
                }
                r.narrow(solver, &union)?;
                r.rescan(solver, &self.vars)
            }
            Repr::HashMap(r) => {
                let mut union = vec![0u64; r.words];
                for &val in removed {
                    if let Some(m) = r.mask(v, val) {
                        words_or_into(&mut union, m);
                    }
                }
                r.narrow(solver, &union)?;
                r.rescan(solver, &self.vars)
            }
        }
    }
}

impl Constraint for PositiveTable {
    fn post(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), PostError> {
        for i in 0..self.vars.len() {
            let d = solver.new_demon(me, i as u32, Priority::Delayed);
            solver.watch(self.vars[i], EventKind::WhenDomain, d);
        }
        Ok(())
    }

    fn initial_propagate(&mut self, solver: &mut Solver, _me: PropagatorId) -> Result<(), Fail> {
        for v in 0..self.vars.len() {
            // Values in the variable's current domain that no tuple ever supports must
            // be removed up front, the same way a later domain event would be handled.
            let var = self.vars[v];
            let removed: Vec<i32> = solver
                .domain_values(var)
                .into_iter()
                .filter(|&val| match &self.repr {
                    Repr::Bitset(r) => r.mask(v, val) == 0,
                    Repr::LongBitset(r) => !words_any_set(r.mask(v, val)),
                    Repr::HashMap(r) => r.mask(v, val).is_none(),
                })
                .collect();
            if !removed.is_empty() {
                self.narrow_and_rescan(solver, v, &removed)?;
                for &val in &removed {
                    solver.remove_value(var, val)?;
                }
            }
        }
        // A final pass handles the case where narrowing from one variable's removed
        // values shrinks `actives` enough to invalidate values of another variable that
        // were individually supported but whose only support now lies in dead tuples.
        match &self.repr {
            Repr::Bitset(r) => r.rescan(solver, &self.vars),
            Repr::LongBitset(r) => r.rescan(solver, &self.vars),
            Repr::HashMap(r) => r.rescan(solver, &self.vars),
        }
    }

    fn propagate(&mut self, solver: &mut Solver, _me: PropagatorId, payload: crate::queue::Payload) -> Result<(), Fail> {
        let v = payload as usize;
        let var = self.vars[v];
        let removed = solver.new_holes(var);
        if removed.is_empty() {
            return Ok(());
        }
        self.narrow_and_rescan(solver, v, &removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::enumerate_solutions;

    #[test]
    fn propagation_narrows_to_matching_tuples() {
        let mut solver = Solver::new();
        let x = solver.new_int_var(0, 2);
        let y = solver.new_int_var(0, 2);
        let z = solver.new_int_var(0, 2);
        let tuples = vec![vec![0, 0, 0], vec![1, 1, 1], vec![2, 2, 2], vec![0, 1, 2]];
        solver.make_allowed_assignments(&[x, y, z], tuples).unwrap();
        solver.begin_round();
        solver.set_value(x, 0).unwrap();
        solver.run_to_fixpoint().unwrap();
        assert_eq!(solver.domain_values(y), vec![0, 1]);
        assert_eq!(solver.domain_values(z), vec![0, 2]);
        solver.begin_round();
        solver.set_value(z, 2).unwrap();
        solver.run_to_fixpoint().unwrap();
        assert_eq!(solver.domain_values(y), vec![1]);
    }

    #[test]
    fn enumerates_exactly_the_allowed_tuples() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..3).map(|_| solver.new_int_var(0, 2)).collect();
        let tuples = vec![vec![0, 0, 0], vec![1, 1, 1], vec![2, 2, 2], vec![0, 1, 2]];
        solver.make_allowed_assignments(&vars, tuples.clone()).unwrap();
        let mut sols = enumerate_solutions(&mut solver, &vars, 100);
        sols.sort();
        let mut expected = tuples;
        expected.sort();
        assert_eq!(sols, expected);
    }

    #[test]
    fn long_bitset_form_used_above_64_tuples() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..2).map(|_| solver.new_int_var(0, 99)).collect();
        let tuples: Vec<Vec<i32>> = (0..100).map(|i| vec![i, i]).collect();
        solver.make_allowed_assignments(&vars, tuples).unwrap();
        let sols = enumerate_solutions(&mut solver, &vars, 1000);
        assert_eq!(sols.len(), 100);
    }

    #[test]
    fn infeasible_when_no_tuple_survives() {
        let mut solver = Solver::new();
        let x = solver.new_int_var(0, 1);
        let y = solver.new_int_var(0, 1);
        solver.make_allowed_assignments(&[x, y], vec![vec![0, 0]]).unwrap();
        solver.begin_round();
        solver.set_value(x, 1).unwrap();
        assert!(solver.run_to_fixpoint().is_err());
    }
}
