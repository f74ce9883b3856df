//! The solver object: owns the trail, the variable store, the demon queue and every
//! posted constraint (`spec.md` §6, "External interfaces").

use crate::collections::ref_store::RefVec;
use crate::constraint::{Constraint, Fail, PostError, PropagatorId};
use crate::constraints::count::{Cardinality, Count, Distribute};
use crate::constraints::disjunctive::{Disjunctive, Task};
use crate::constraints::pack::{Dimension, Pack};
use crate::constraints::table::PositiveTable;
use crate::queue::{Payload, Priority, Queue};
use crate::trail::{Checkpoint, Trail};
use crate::vars::{EventKind, IntVar, VarId};
use std::cell::Cell;

/// Owns every trailed structure. A single instance corresponds to one CP model: all
/// `VarId`/`PropagatorId`/`DemonId` handles are only meaningful against the instance
/// that produced them.
pub struct Solver {
    pub(crate) trail: Trail,
    vars: RefVec<VarId, IntVar>,
    pub(crate) queue: Queue,
    constraints: RefVec<PropagatorId, Option<Box<dyn Constraint>>>,
    fails: Cell<u64>,
    /// Set once a constraint's initial propagation proves the model unsatisfiable at
    /// the root. Propagation failures below the root are recovered by `restore`;
    /// failures at the root have nowhere to unwind to (`spec.md` §7).
    root_infeasible: bool,
}

impl Default for Solver {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver {
    pub fn new() -> Self {
        Solver {
            trail: Trail::new(),
            vars: RefVec::new(),
            queue: Queue::new(),
            constraints: RefVec::new(),
            fails: Cell::new(0),
            root_infeasible: false,
        }
    }

    // ---------------------------------------------------------------- variables ----

    pub fn new_int_var(&mut self, min: i32, max: i32) -> VarId {
        self.vars.push(IntVar::new(min, max))
    }

    pub fn new_bool_var(&mut self) -> VarId {
        self.new_int_var(0, 1)
    }

    pub fn new_int_var_from_domain(&mut self, values: &[i32]) -> VarId {
        self.vars.push(IntVar::from_domain(values))
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn min(&self, v: VarId) -> i32 {
        self.vars[v].min()
    }
    pub fn max(&self, v: VarId) -> i32 {
        self.vars[v].max()
    }
    pub fn size(&self, v: VarId) -> u32 {
        self.vars[v].size()
    }
    pub fn contains(&self, v: VarId, value: i32) -> bool {
        self.vars[v].contains(value)
    }
    pub fn is_bound(&self, v: VarId) -> bool {
        self.vars[v].is_bound()
    }
    pub fn old_min(&self, v: VarId) -> i32 {
        self.vars[v].old_min()
    }
    pub fn old_max(&self, v: VarId) -> i32 {
        self.vars[v].old_max()
    }
    pub fn domain_values(&self, v: VarId) -> Vec<i32> {
        self.vars[v].domain_iter().collect()
    }
    pub fn new_holes(&self, v: VarId) -> Vec<i32> {
        self.vars[v].new_holes_iter().collect()
    }

    fn fire(&mut self, v: VarId, change: crate::vars::DomainChange) {
        for &event in change.events() {
            self.queue.notify(v, event);
        }
    }

    pub fn set_min(&mut self, v: VarId, value: i32) -> Result<(), Fail> {
        let change = self.vars[v].set_min(&mut self.trail, value).map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    pub fn set_max(&mut self, v: VarId, value: i32) -> Result<(), Fail> {
        let change = self.vars[v].set_max(&mut self.trail, value).map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    pub fn set_range(&mut self, v: VarId, lo: i32, hi: i32) -> Result<(), Fail> {
        let change = self.vars[v].set_range(&mut self.trail, lo, hi).map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    pub fn set_value(&mut self, v: VarId, value: i32) -> Result<(), Fail> {
        let change = self.vars[v].set_value(&mut self.trail, value).map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    pub fn remove_value(&mut self, v: VarId, value: i32) -> Result<(), Fail> {
        let change = self.vars[v].remove_value(&mut self.trail, value).map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    pub fn remove_values(&mut self, v: VarId, values: &[i32]) -> Result<(), Fail> {
        let change = self.vars[v].remove_values(&mut self.trail, values).map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    pub fn remove_interval(&mut self, v: VarId, lo: i32, hi: i32) -> Result<(), Fail> {
        let change = self.vars[v]
            .remove_interval(&mut self.trail, lo, hi)
            .map_err(|_| self.fail())?;
        self.fire(v, change);
        Ok(())
    }

    // -------------------------------------------------------------- propagation ----

    pub fn fail(&self) -> Fail {
        self.fails.set(self.fails.get() + 1);
        tracing::trace!(fails = self.fails.get(), "propagation failure");
        Fail
    }

    pub fn num_fails(&self) -> u64 {
        self.fails.get()
    }

    pub fn new_demon(&mut self, owner: PropagatorId, payload: Payload, priority: Priority) -> crate::queue::DemonId {
        self.queue.new_demon(owner, payload, priority)
    }

    pub fn watch(&mut self, var: VarId, event: EventKind, demon: crate::queue::DemonId) {
        self.queue.watch(var, event, demon);
    }

    /// Starts a new propagation round: advances the queue's round stamp (so every
    /// demon is eligible to be enqueued again, `spec.md` §4.3) and refreshes every
    /// variable's `OldMin`/`OldMax` to its current bounds (`spec.md` §4.2). Called once
    /// per constraint post and once per search decision, so that each round's demons
    /// see "old" bounds from the start of that round rather than from variable
    /// creation or some earlier round.
    pub fn begin_round(&mut self) {
        self.queue.begin_round();
        for id in self.vars.keys() {
            self.vars[id].refresh_old_bounds();
        }
    }

    /// Drains the demon queue until both sub-queues are empty (a fixed point) or a
    /// propagator fails. On failure, both sub-queues are cleared before returning
    /// (`spec.md` §4.3).
    pub fn run_to_fixpoint(&mut self) -> Result<(), Fail> {
        loop {
            match self.queue.pop() {
                None => return Ok(()),
                Some((pid, payload)) => {
                    let mut c = self.constraints[pid].take().expect("dangling propagator id");
                    let res = c.propagate(self, pid, payload);
                    self.constraints[pid] = Some(c);
                    if let Err(e) = res {
                        self.queue.clear();
                        return Err(e);
                    }
                }
            }
        }
    }

    pub fn checkpoint(&mut self) -> Checkpoint {
        self.trail.checkpoint()
    }

    pub fn restore(&mut self, ck: Checkpoint) {
        self.trail.restore(ck);
    }

    pub fn is_root_infeasible(&self) -> bool {
        self.root_infeasible
    }

    // ------------------------------------------------------------- constraints -----

    /// Posts a constraint and immediately runs its initial propagation to a fixed
    /// point. There is no separate "model specification then search" phase in this
    /// crate (the modelling façade that would drive that split is out of scope), so
    /// each constraint's initial propagation round happens as soon as it is added,
    /// rather than being batched across every constraint in the model the way
    /// `spec.md` §4.3's `InitialPropagate` describes for a full solver.
    pub fn add_constraint<C: Constraint>(&mut self, mut c: C) -> Result<PropagatorId, PostError> {
        let id = self.constraints.push(None);
        c.post(self, id)?;
        self.constraints[id] = Some(Box::new(c));
        if !self.root_infeasible {
            self.begin_round();
            let mut boxed = self.constraints[id].take().expect("just inserted");
            let res = boxed.initial_propagate(self, id).and_then(|_| self.run_to_fixpoint());
            self.constraints[id] = Some(boxed);
            if res.is_err() {
                tracing::debug!("model proven infeasible while posting a constraint");
                self.root_infeasible = true;
                self.queue.clear();
            }
        }
        Ok(id)
    }

    pub fn make_count(&mut self, vars: &[VarId], value: i32, count: Cardinality) -> Result<PropagatorId, PostError> {
        self.add_constraint(Count::new(vars, value, count)?)
    }

    pub fn make_distribute(
        &mut self,
        vars: &[VarId],
        values: &[i32],
        cards: &[Cardinality],
    ) -> Result<PropagatorId, PostError> {
        self.add_constraint(Distribute::new(vars, values, cards)?)
    }

    pub fn make_pack(&mut self, vars: &[VarId], num_bins: i32) -> Result<PropagatorId, PostError> {
        self.add_constraint(Pack::new(vars, num_bins, Vec::<Box<dyn Dimension>>::new())?)
    }

    pub fn make_pack_with_dimensions(
        &mut self,
        vars: &[VarId],
        num_bins: i32,
        dims: Vec<Box<dyn Dimension>>,
    ) -> Result<PropagatorId, PostError> {
        self.add_constraint(Pack::new(vars, num_bins, dims)?)
    }

    pub fn make_allowed_assignments(&mut self, vars: &[VarId], tuples: Vec<Vec<i32>>) -> Result<PropagatorId, PostError> {
        self.add_constraint(PositiveTable::new(vars, tuples)?)
    }

    pub fn make_disjunctive(&mut self, tasks: Vec<Task>) -> Result<PropagatorId, PostError> {
        self.add_constraint(Disjunctive::new(tasks)?)
    }
}
