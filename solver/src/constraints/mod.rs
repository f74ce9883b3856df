//! Global constraints built on the trail/vars/queue core (`spec.md` §4).

pub mod count;
pub mod disjunctive;
pub mod pack;
pub mod table;
