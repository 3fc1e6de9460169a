use std::collections::VecDeque;

use study_types::{ScenarioId, WorkItem};

/// Ordered backlog of items available for claim.
///
/// Owned by a single control loop; no interior locking.
#[derive(Debug, Default)]
pub struct ScenarioQueue {
    items: VecDeque<WorkItem>,
}

impl ScenarioQueue {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn pop_front(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Return an unconfirmed item so it is the next one handed out.
    pub fn requeue_front(&mut self, item: WorkItem) {
        self.items.push_front(item);
    }

    /// Remove everything, returning what was left.
    pub fn drain(&mut self) -> Vec<WorkItem> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cost(&self) -> u64 {
        self.items.iter().map(|item| item.estimated_cost).sum()
    }

    pub fn ids(&self) -> Vec<ScenarioId> {
        self.items.iter().map(|item| item.scenario_id).collect()
    }
}

/// Accounting for every item the backlog started with.
///
/// Each item ends up retired (acknowledged done) or lost (cleared when the
/// run failed); until then it is queued or pending on a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkLedger {
    pub total_items: usize,
    pub total_cost: u64,
    pub retired: Vec<ScenarioId>,
    pub retired_cost: u64,
    pub lost: Vec<ScenarioId>,
    pub lost_cost: u64,
}

impl WorkLedger {
    pub fn new(items: &[WorkItem]) -> Self {
        Self {
            total_items: items.len(),
            total_cost: items.iter().map(|item| item.estimated_cost).sum(),
            ..Self::default()
        }
    }

    pub fn retire(&mut self, item: &WorkItem) {
        self.retired.push(item.scenario_id);
        self.retired_cost += item.estimated_cost;
    }

    pub fn lose(&mut self, items: &[WorkItem]) {
        for item in items {
            self.lost.push(item.scenario_id);
            self.lost_cost += item.estimated_cost;
        }
    }

    pub fn retired_items(&self) -> usize {
        self.retired.len()
    }

    /// True when every original item is accounted for exactly once.
    pub fn balances(&self, queued: usize, pending: usize) -> bool {
        self.retired.len() + self.lost.len() + queued + pending == self.total_items
    }
}
