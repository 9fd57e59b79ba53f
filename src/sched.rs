//! Scheduler core: the four job masks and the transition rules.
//!
//! Pure state, no I/O. The manager feeds it observed transitions and asks
//! what to submit next; everything here is deterministic and unit-testable.
//!
//! A job is runnable iff it is still `todo` and no remaining producer
//! constrains it (its column in the adjacency matrix is all zero). Finishing
//! a producer clears its row; failing a job clears `todo` for every
//! transitive descendant so the rest of the graph can drain (cascade-skip).

use crate::graph::AdjMatrix;

#[derive(Debug)]
pub struct Scheduler {
    graph: AdjMatrix,
    todo: Vec<bool>,
    running: Vec<bool>,
    finished: Vec<bool>,
    failed: Vec<bool>,
    queued: usize,
}

impl Scheduler {
    /// Build the initial state. Jobs already finished by a prior incarnation
    /// (unchanged declarations) start in the finished mask with their
    /// constraint rows pruned; everything else starts as `todo`.
    pub fn new(mut graph: AdjMatrix, already_finished: &[bool]) -> Self {
        let n = graph.len();
        debug_assert_eq!(already_finished.len(), n);
        let mut todo = vec![true; n];
        let mut finished = vec![false; n];
        for j in 0..n {
            if already_finished[j] {
                todo[j] = false;
                finished[j] = true;
                graph.clear_row(j);
            }
        }
        Scheduler {
            graph,
            todo,
            running: vec![false; n],
            finished,
            failed: vec![false; n],
            queued: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.todo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.todo.is_empty()
    }

    /// Number of jobs currently dispatched.
    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn is_running(&self, j: usize) -> bool {
        self.running[j]
    }

    pub fn running_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&j| self.running[j]).collect()
    }

    /// Lowest-index runnable job, for deterministic submission order.
    pub fn next_runnable(&self) -> Option<usize> {
        (0..self.len()).find(|&j| self.todo[j] && self.graph.column_clear(j))
    }

    /// A job was dispatched: `todo → running`.
    pub fn mark_submitted(&mut self, j: usize) {
        debug_assert!(self.todo[j]);
        self.todo[j] = false;
        self.running[j] = true;
        self.queued += 1;
    }

    /// A running job succeeded; its outputs no longer constrain consumers.
    pub fn mark_finished(&mut self, j: usize) {
        debug_assert!(self.running[j]);
        self.running[j] = false;
        self.finished[j] = true;
        self.queued -= 1;
        self.graph.clear_row(j);
    }

    /// A running job failed; every transitive descendant is withdrawn from
    /// `todo`. Returns the indices skipped by this cascade.
    pub fn mark_failed(&mut self, j: usize) -> Vec<usize> {
        debug_assert!(self.running[j]);
        self.running[j] = false;
        self.failed[j] = true;
        self.queued -= 1;
        let mut skipped = Vec::new();
        for k in self.graph.descendants(j) {
            if self.todo[k] {
                self.todo[k] = false;
                skipped.push(k);
            }
        }
        skipped
    }

    /// Terminal condition: nothing left to submit and nothing in flight.
    pub fn is_drained(&self) -> bool {
        !self.todo.iter().any(|&t| t) && !self.running.iter().any(|&r| r)
    }

    pub fn count_finished(&self) -> usize {
        self.finished.iter().filter(|&&f| f).count()
    }

    pub fn count_failed(&self) -> usize {
        self.failed.iter().filter(|&&f| f).count()
    }

    /// Jobs withdrawn without running: in no mask at all.
    pub fn count_skipped(&self) -> usize {
        (0..self.len())
            .filter(|&j| !self.todo[j] && !self.running[j] && !self.finished[j] && !self.failed[j])
            .count()
    }
}
