//! `Disjunctive`: non-overlap on a single resource (`spec.md` §4.7), grounded on
//! `examples/plaans-aries/solver/src/reasoners/cp/disjunctive.rs`'s theta-tree-based
//! overload checking, generalised to the three further propagators `spec.md` §4.7
//! calls for (detectable precedences, not-last, edge-finding), each run in both the
//! "straight" and "mirror" (reflected time) direction.
//!
//! Mirroring is implemented once, generically: `mirror(est, lct) = (-lct, -est)`
//! turns "not-last" into exactly "detectable precedences" run in mirrored time, and
//! the mirrored edge-finder gives the dual tightening of `end_max` instead of
//! `start_min`. This keeps the four-propagators-times-two-directions matrix down to
//! two actual algorithms (`detectable_precedences`, `edge_finder`) plus one
//! direction-agnostic `overload_check` (overload is symmetric under mirroring: the
//! condition `min_est(S) + sum_p(S) > max_lct(S)` is invariant under `(est, lct) ->
//! (-lct, -est)`, so a single pass catches it in both directions).

mod theta_tree;

use crate::constraint::{Constraint, Fail, PostError, PropagatorId};
use crate::queue::Priority;
use crate::solver::Solver;
use crate::vars::{EventKind, VarId};
use theta_tree::{LambdaThetaTree, ThetaTree};

/// One task on the resource: `performed == None` means always present; `Some(v)`
/// means the task only participates while `v` is entailed true (`spec.md` §4.7).
/// `duration` is a variable rather than a constant so that a task with an unresolved
/// processing time can still be posted; propagation only ever reads its current
/// bounds (`min` for the energy a task is guaranteed to demand, `max` for how late it
/// could still finish).
#[derive(Clone, Copy, Debug)]
pub struct Task {
    pub start: VarId,
    pub duration: VarId,
    pub performed: Option<VarId>,
}

impl Task {
    pub fn new(start: VarId, duration: VarId) -> Self {
        Task {
            start,
            duration,
            performed: None,
        }
    }

    pub fn optional(start: VarId, duration: VarId, performed: VarId) -> Self {
        Task {
            start,
            duration,
            performed: Some(performed),
        }
    }
}

/// An abstract `(est, lct, p)` interval used by the direction-agnostic propagators,
/// tagged with the index (into `Disjunctive::tasks`) it came from.
#[derive(Clone, Copy)]
struct Item {
    task: usize,
    est: i64,
    lct: i64,
    p: i64,
}

fn mirror(items: &[Item]) -> Vec<Item> {
    items
        .iter()
        .map(|it| Item {
            task: it.task,
            est: -it.lct,
            lct: -it.est,
            p: it.p,
        })
        .collect()
}

/// The theta-/lambda-theta-tree combine formulas assume that, read left to right, a
/// tree's leaves are in non-decreasing `est` order (`spec.md` §9's design note calls
/// this out as the reason the source pre-sorts activities by EST before building the
/// tree). `items` is addressed by its own local index everywhere else in this module,
/// so every tree built from it must translate that index through this ranking rather
/// than using it as a leaf position directly.
fn est_ranks(items: &[Item]) -> Vec<usize> {
    let n = items.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| items[a].est.cmp(&items[b].est).then(a.cmp(&b)));
    let mut rank = vec![0usize; n];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    rank
}

/// Fails if any subset of `items` demands more processing than its own latest
/// completion time allows, following the teacher's sweep exactly: sort by `lct`
/// ascending, insert one at a time, and check the tree's ECT against the
/// just-inserted task's `lct` after every insertion.
fn overload_check(items: &[Item]) -> Result<(), ()> {
    let n = items.len();
    if n < 2 {
        return Ok(());
    }
    let rank = est_ranks(items);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| items[i].lct);
    let mut tree = ThetaTree::new(n);
    for &i in &order {
        tree.insert(rank[i], items[i].p, items[i].est + items[i].p);
        if tree.ect() > items[i].lct {
            return Err(());
        }
    }
    Ok(())
}

/// For each task `j`, finds the set `Θ` of other tasks `i` that cannot possibly be
/// scheduled after `j` (`est(j) + p(j) + p(i) > lct(i)`, i.e. `i` must run before `j`
/// in every feasible schedule) and tightens `est(j)` to `max(est(j), ect(Θ))`. Rebuilds
/// a fresh tree per task rather than the incremental sweep the literature describes;
/// simpler to verify by inspection and the instance sizes this engine targets do not
/// need the asymptotically tighter version.
fn detectable_precedences(items: &[Item]) -> Vec<(usize, i64)> {
    let n = items.len();
    if n < 2 {
        return Vec::new();
    }
    let rank = est_ranks(items);
    let mut out = Vec::new();
    for j in 0..n {
        let mut tree = ThetaTree::new(n);
        let mut any = false;
        for i in 0..n {
            if i == j {
                continue;
            }
            if items[j].est + items[j].p + items[i].p > items[i].lct {
                tree.insert(rank[i], items[i].p, items[i].est + items[i].p);
                any = true;
            }
        }
        if !any {
            continue;
        }
        let new_est = tree.ect();
        if new_est > items[j].est {
            out.push((items[j].task, new_est));
        }
    }
    out
}

/// Edge-finding via a lambda-theta-tree (`spec.md` §4.7): every task starts black;
/// tasks are greyed one by one in order of decreasing `lct`. Whenever the grey-aware
/// ECT exceeds the `lct` of every task still black, the responsible grey task must
/// come after all of them, so its `est` is tightened to the black-only ECT, and it is
/// removed from further consideration this pass.
fn edge_finder(items: &[Item]) -> Vec<(usize, i64)> {
    let n = items.len();
    if n < 2 {
        return Vec::new();
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        Black,
        Grey,
        Removed,
    }

    let rank = est_ranks(items);
    let mut color = vec![Color::Black; n];
    let mut tree = LambdaThetaTree::new(n);
    for (i, it) in items.iter().enumerate() {
        tree.insert_black(rank[i], it.p, it.est + it.p);
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(items[i].lct));

    let mut out = Vec::new();
    for &j in &order {
        if color[j] == Color::Removed {
            continue;
        }
        tree.make_grey(rank[j], items[j].p, items[j].est + items[j].p);
        color[j] = Color::Grey;
        loop {
            let black_lct_max = (0..n)
                .filter(|&i| color[i] == Color::Black)
                .map(|i| items[i].lct)
                .max();
            let Some(black_lct_max) = black_lct_max else {
                break;
            };
            if tree.ect_opt() <= black_lct_max {
                break;
            }
            let Some(resp) = tree.responsible_opt() else {
                break;
            };
            let new_est = tree.ect();
            if new_est > items[resp].est {
                out.push((items[resp].task, new_est));
            }
            tree.remove(resp);
            color[resp] = Color::Removed;
        }
    }
    out
}

fn clamp_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// `Disjunctive(tasks)`: no two performed tasks may overlap (`spec.md` §4.7).
pub struct Disjunctive {
    tasks: Vec<Task>,
}

impl Disjunctive {
    pub fn new(tasks: Vec<Task>) -> Result<Self, PostError> {
        if tasks.is_empty() {
            return Err(PostError::EmptyScope);
        }
        Ok(Disjunctive { tasks })
    }

    fn is_mandatory(&self, solver: &Solver, i: usize) -> bool {
        match self.tasks[i].performed {
            None => true,
            Some(p) => solver.is_bound(p) && solver.min(p) == 1,
        }
    }

    fn mandatory_items(&self, solver: &Solver) -> Vec<Item> {
        (0..self.tasks.len())
            .filter(|&i| self.is_mandatory(solver, i))
            .map(|i| {
                let t = &self.tasks[i];
                let est = solver.min(t.start) as i64;
                let lct = solver.max(t.start) as i64 + solver.max(t.duration) as i64;
                let p = solver.min(t.duration) as i64;
                Item { task: i, est, lct, p }
            })
            .collect()
    }

    /// Runs all four propagators once, in both directions, over the current mandatory
    /// set. Returns whether any variable was tightened, so the caller can iterate to a
    /// fixed point (`spec.md` §4.7: "one delayed demon that iterates the four
    /// propagators until no change").
    fn propagate_once(&mut self, solver: &mut Solver) -> Result<bool, Fail> {
        let items = self.mandatory_items(solver);
        if overload_check(&items).is_err() {
            return Err(solver.fail());
        }

        let mut changed = false;

        for (task, new_est) in detectable_precedences(&items) {
            let v = self.tasks[task].start;
            if new_est > solver.min(v) as i64 {
                solver.set_min(v, clamp_i32(new_est))?;
                changed = true;
            }
        }
        for (task, new_est) in edge_finder(&items) {
            let v = self.tasks[task].start;
            if new_est > solver.min(v) as i64 {
                solver.set_min(v, clamp_i32(new_est))?;
                changed = true;
            }
        }

        let mirrored = mirror(&items);
        for (task, new_est_mirrored) in detectable_precedences(&mirrored) {
            changed |= self.tighten_end_max(solver, task, new_est_mirrored)?;
        }
        for (task, new_est_mirrored) in edge_finder(&mirrored) {
            changed |= self.tighten_end_max(solver, task, new_est_mirrored)?;
        }

        Ok(changed)
    }

    /// Translates a mirrored-space `est` tightening (`-lct(task) >= new_est_mirrored`)
    /// back into a bound on `start(task)`: `end(task) <= -new_est_mirrored` must hold
    /// for whatever duration value is eventually chosen, which is only guaranteed by
    /// bounding `start` against the duration's current *maximum*.
    fn tighten_end_max(&mut self, solver: &mut Solver, task: usize, new_est_mirrored: i64) -> Result<bool, Fail> {
        let new_lct = -new_est_mirrored;
        let t = self.tasks[task];
        let new_start_max = new_lct - solver.max(t.duration) as i64;
        if new_start_max < solver.max(t.start) as i64 {
            solver.set_max(t.start, clamp_i32(new_start_max))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn run_to_fixpoint(&mut self, solver: &mut Solver) -> Result<(), Fail> {
        while self.propagate_once(solver)? {}
        Ok(())
    }
}

impl Constraint for Disjunctive {
    fn post(&mut self, solver: &mut Solver, me: PropagatorId) -> Result<(), PostError> {
        let demon = solver.new_demon(me, 0, Priority::Delayed);
        for t in &self.tasks {
            solver.watch(t.start, EventKind::WhenRange, demon);
            solver.watch(t.duration, EventKind::WhenRange, demon);
            if let Some(p) = t.performed {
                solver.watch(p, EventKind::WhenBound, demon);
            }
        }
        Ok(())
    }

    fn initial_propagate(&mut self, solver: &mut Solver, _me: PropagatorId) -> Result<(), Fail> {
        self.run_to_fixpoint(solver)
    }

    fn propagate(&mut self, solver: &mut Solver, _me: PropagatorId, _payload: crate::queue::Payload) -> Result<(), Fail> {
        self.run_to_fixpoint(solver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::enumerate_solutions;
    use crate::solver::Solver;

    fn task(solver: &mut Solver, lo: i32, hi: i32, duration: i32) -> (Task, VarId) {
        let start = solver.new_int_var(lo, hi);
        let dur = solver.new_int_var(duration, duration);
        (Task::new(start, dur), start)
    }

    #[test]
    fn three_tasks_permute_freely_in_a_wide_window() {
        let mut solver = Solver::new();
        let (t0, s0) = task(&mut solver, 0, 6, 3);
        let (t1, s1) = task(&mut solver, 0, 6, 2);
        let (t2, s2) = task(&mut solver, 0, 6, 4);
        solver.make_disjunctive(vec![t0, t1, t2]).unwrap();
        let sols = enumerate_solutions(&mut solver, &[s0, s1, s2], 1000);
        assert_eq!(sols.len(), 6, "all 6 orderings of 3 tasks should be feasible");
        for sol in &sols {
            let durations = [3, 2, 4];
            for i in 0..3 {
                for j in (i + 1)..3 {
                    let (si, sj) = (sol[i], sol[j]);
                    let (ei, ej) = (si + durations[i], sj + durations[j]);
                    assert!(ei <= sj || ej <= si, "tasks {i} and {j} overlap in {sol:?}");
                }
            }
        }
    }

    #[test]
    fn overload_fails_a_window_too_narrow_for_every_task() {
        let mut solver = Solver::new();
        let (t0, _) = task(&mut solver, 0, 4, 3);
        let (t1, _) = task(&mut solver, 0, 4, 2);
        let (t2, _) = task(&mut solver, 0, 4, 4);
        // durations sum to 9; every ordering pushes some task's completion past its
        // own latest-start-plus-duration bound, so overload checking must fail at post time.
        let res = solver.make_disjunctive(vec![t0, t1, t2]);
        assert!(res.is_err() || solver.is_root_infeasible());
    }

    #[test]
    fn detectable_precedence_pushes_the_second_task_after_the_first() {
        let mut solver = Solver::new();
        let s0 = solver.new_int_var(0, 0);
        let d0 = solver.new_int_var(5, 5);
        let s1 = solver.new_int_var(0, 10);
        let d1 = solver.new_int_var(3, 3);
        // task 0 is fixed to [0, 5); task 1 has duration 3 and must therefore start
        // at or after 5 once overlap is forbidden, since task 0 cannot move.
        solver
            .make_disjunctive(vec![Task::new(s0, d0), Task::new(s1, d1)])
            .unwrap();
        assert_eq!(solver.min(s0), 0);
        assert_eq!(solver.min(s1), 5);
    }

    #[test]
    fn optional_task_is_ignored_while_unresolved() {
        let mut solver = Solver::new();
        let s0 = solver.new_int_var(0, 0);
        let d0 = solver.new_int_var(5, 5);
        let s1 = solver.new_int_var(0, 10);
        let d1 = solver.new_int_var(3, 3);
        let p1 = solver.new_bool_var();
        solver
            .make_disjunctive(vec![Task::new(s0, d0), Task::optional(s1, d1, p1)])
            .unwrap();
        // presence of task 1 is unresolved, so no precedence is forced on it yet.
        assert_eq!(solver.min(s1), 0);
        solver.begin_round();
        solver.set_value(p1, 1).unwrap();
        solver.run_to_fixpoint().unwrap();
        assert_eq!(solver.min(s1), 5);
    }
}
