//! Work dispatch for one worker phase
//!
//! The pool owns the backlog, the accounting ledger and the phase's worker
//! handles. It is polled from the single control loop: each poll drains the
//! stdout of every worker, answers prompts, and reacts to exits.
//!
//! Recovery rules:
//! - an item only counts as done when the worker acknowledges it
//!   (`??done <id>`); a worker that exits still holding an item, whatever
//!   its exit code, crashed holding it
//! - a crashed worker's item goes back to the head of the queue when another
//!   worker can still claim it; otherwise the backlog is cleared and the
//!   phase fails
//! - in the parallel phase a non-empty backlog with no live worker left is
//!   lost work

use study_types::{FailureKind, RunFailure, ScenarioId, WorkItem};
use tracing::{debug, error, info, warn};

use crate::queue::{ScenarioQueue, WorkLedger};
use crate::worker::protocol::{self, Prompt, WorkerLine, ACK, NO_MORE_WORK, REJECT};
use crate::worker::{WorkerExit, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// One fixed-scenario worker; the rest of the backlog waits
    Baseline,
    /// Interactive workers drain the backlog
    Parallel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolStatus {
    Working,
    /// Every worker has finished and nothing is left to hand out
    Drained,
    Failed(RunFailure),
}

#[derive(Debug)]
pub struct WorkPool {
    phase: PoolPhase,
    queue: ScenarioQueue,
    ledger: WorkLedger,
    workers: Vec<WorkerHandle>,
}

impl Default for WorkPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl WorkPool {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            phase: PoolPhase::Parallel,
            ledger: WorkLedger::new(&items),
            queue: ScenarioQueue::new(items),
            workers: Vec::new(),
        }
    }

    pub fn set_phase(&mut self, phase: PoolPhase) {
        self.phase = phase;
    }

    pub fn queue(&self) -> &ScenarioQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &WorkLedger {
        &self.ledger
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn add_worker(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    /// Claim the head of the backlog outside the prompt protocol (baseline run).
    pub fn take_front(&mut self) -> Option<WorkItem> {
        self.queue.pop_front()
    }

    pub fn requeue_front(&mut self, item: WorkItem) {
        self.queue.requeue_front(item);
    }

    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_live()).count()
    }

    pub fn pending_items(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.pending_item().is_some())
            .count()
    }

    pub fn kill_all(&mut self) {
        for worker in self.workers.iter_mut().filter(|w| w.is_live()) {
            worker.kill();
        }
    }

    /// Remove the phase's workers, ending the phase.
    pub fn take_workers(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.workers)
    }

    /// Clear the backlog into the ledger's lost column.
    pub fn lose_remaining(&mut self) -> usize {
        let items = self.queue.drain();
        self.ledger.lose(&items);
        items.len()
    }

    /// Estimated fraction of total cost completed.
    pub fn progress(&self) -> f64 {
        if self.ledger.total_cost == 0 {
            return if self.ledger.total_items == 0 { 1.0 } else { 0.0 };
        }
        let partial: f64 = self.workers.iter().map(|w| w.pending_progress()).sum();
        ((self.ledger.retired_cost as f64 + partial) / self.ledger.total_cost as f64).min(1.0)
    }

    pub fn poll(&mut self) -> PoolStatus {
        let mut failure = None;

        for i in 0..self.workers.len() {
            while let Some(line) = self.workers[i].try_next_line() {
                self.handle_line(i, &line);
            }
            if let Some(exit) = self.workers[i].try_exit() {
                // Every line precedes the exit notification.
                while let Some(line) = self.workers[i].try_next_line() {
                    self.handle_line(i, &line);
                }
                if let Some(f) = self.handle_exit(i, exit) {
                    failure.get_or_insert(f);
                }
            }
        }

        if let Some(failure) = failure {
            return PoolStatus::Failed(failure);
        }

        let live = self.live_workers();
        if self.phase == PoolPhase::Parallel && live == 0 && !self.queue.is_empty() {
            let lost = self.lose_remaining();
            error!(lost, "backlog left with no worker to run it");
            return PoolStatus::Failed(RunFailure::new(
                FailureKind::LostWork,
                format!("{lost} scenario(s) left in the backlog with no worker to run them"),
            ));
        }

        let finished = match self.phase {
            PoolPhase::Baseline => live == 0,
            PoolPhase::Parallel => live == 0 && self.queue.is_empty(),
        };
        if finished {
            PoolStatus::Drained
        } else {
            PoolStatus::Working
        }
    }

    fn handle_line(&mut self, i: usize, line: &str) {
        match protocol::classify(line) {
            WorkerLine::Prompt(Prompt::Next) => self.hand_out(i),
            WorkerLine::Prompt(Prompt::Done(id)) => self.confirm(i, id),
            WorkerLine::Prompt(Prompt::Unknown(body)) => {
                warn!(worker = %self.workers[i].run_id(), prompt = %body, "unrecognized worker prompt");
                self.reply(i, REJECT);
            }
            WorkerLine::Status(update) => self.workers[i].apply_status(update),
            WorkerLine::Text => {}
        }
    }

    fn hand_out(&mut self, i: usize) {
        if !self.workers[i].is_interactive() {
            self.reply(i, NO_MORE_WORK);
            return;
        }

        if let Some(stale) = self.workers[i].take_pending() {
            warn!(
                worker = %self.workers[i].run_id(),
                scenario = %stale.scenario_id,
                "worker asked for more work without finishing its scenario; requeueing it"
            );
            self.queue.requeue_front(stale);
        }

        let Some(item) = self.queue.pop_front() else {
            self.reply(i, NO_MORE_WORK);
            self.workers[i].mark_drained();
            return;
        };

        let worker = &mut self.workers[i];
        match worker.respond(&item.scenario_id.to_string()) {
            Ok(()) => {
                debug!(worker = %worker.run_id(), scenario = %item.scenario_id, "scenario handed out");
                worker.assign(item);
            }
            Err(e) => {
                warn!(worker = %worker.run_id(), scenario = %item.scenario_id, "could not hand out scenario: {e}");
                self.queue.requeue_front(item);
            }
        }
    }

    fn confirm(&mut self, i: usize, id: ScenarioId) {
        match self.workers[i].confirm(id) {
            Some(item) => {
                self.ledger.retire(&item);
                info!(
                    worker = %self.workers[i].run_id(),
                    scenario = %id,
                    done = self.ledger.retired_items(),
                    total = self.ledger.total_items,
                    "scenario complete"
                );
                self.reply(i, ACK);
            }
            None => {
                warn!(
                    worker = %self.workers[i].run_id(),
                    scenario = %id,
                    "completion acknowledged for a scenario the worker does not hold"
                );
                self.reply(i, REJECT);
            }
        }
    }

    fn reply(&mut self, i: usize, reply: &str) {
        if let Err(e) = self.workers[i].respond(reply) {
            debug!(worker = %self.workers[i].run_id(), reply, "reply not delivered: {e}");
        }
    }

    fn handle_exit(&mut self, i: usize, exit: WorkerExit) -> Option<RunFailure> {
        let pending = self.workers[i].take_pending();
        let ignored = self.workers[i].ignores_next_failure();
        self.workers[i].finish(!exit.success() || pending.is_some());
        let run_id = self.workers[i].run_id().to_string();

        let Some(item) = pending else {
            if exit.success() || ignored {
                info!(worker = %run_id, %exit, "worker finished");
            } else {
                warn!(worker = %run_id, %exit, "worker failed while idle");
            }
            return None;
        };

        self.queue.requeue_front(item);
        if ignored {
            info!(worker = %run_id, scenario = %item.scenario_id, "killed worker's scenario returned to the backlog");
            return None;
        }

        let redistributable = self
            .workers
            .iter()
            .enumerate()
            .any(|(j, w)| j != i && w.can_take_work());
        if redistributable {
            warn!(
                worker = %run_id,
                scenario = %item.scenario_id,
                %exit,
                "worker exited holding a scenario; requeued for another worker"
            );
            return None;
        }

        let abandoned = self.lose_remaining();
        error!(
            worker = %run_id,
            scenario = %item.scenario_id,
            %exit,
            abandoned,
            "worker exited holding a scenario and no other worker can take it"
        );
        Some(RunFailure::new(
            FailureKind::WorkerCrash,
            format!(
                "worker {run_id} exited ({exit}) holding scenario {} and no other worker can take it; {abandoned} scenario(s) abandoned",
                item.scenario_id
            ),
        ))
    }
}
