//! C5 — Control Job Queue: FIFO of control jobs with an immediate-execute
//! fast path, deterministic per-job results, and a bounded result cache.
//! Grounded on `CoreContext::enqueueControl` / `processNextJob`.

pub mod optimizer;

use crate::can::codec::Action;
use std::collections::{BTreeMap, VecDeque};

/// Result of attempting to run a job against its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Ok,
    DeviceNotFound,
    DeviceRejected,
}

/// What the queue needs from the device layer to run a job. Kept separate
/// from [`crate::devices::relay::RelayDevice`] so the queue can be unit
/// tested without a real CAN sink.
pub trait JobExecutor {
    fn node_registered(&self, node: u32) -> bool;
    fn execute(&mut self, node: u32, channel: u8, action: Action) -> ExecOutcome;
}

/// A queued or in-flight control request.
#[derive(Debug, Clone)]
pub struct ControlJob {
    pub id: u64,
    pub node: u32,
    pub channel: u8,
    pub action: Action,
    pub source: String,
    pub enqueued_ms: i64,
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlJobResult {
    pub ok: bool,
    pub message: String,
    pub finished_ms: i64,
}

impl Default for ControlJobResult {
    fn default() -> Self {
        Self {
            ok: false,
            message: String::from("unknown job"),
            finished_ms: 0,
        }
    }
}

/// Result of an `enqueue` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueResult {
    pub job_id: u64,
    pub accepted: bool,
    pub executed_immediately: bool,
    pub success: bool,
    pub error: Option<String>,
}

/// A consistent point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub active: bool,
    pub last_job_id: u64,
}

/// Result cache is trimmed to this many most-recent entries, oldest first.
pub const MAX_JOB_RESULTS: usize = 4096;

/// Single-writer FIFO of control jobs.
pub struct ControlJobQueue {
    next_job_id: u64,
    pending: VecDeque<ControlJob>,
    results: BTreeMap<u64, ControlJobResult>,
    processing: bool,
    max_results: usize,
}

impl Default for ControlJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlJobQueue {
    pub fn new() -> Self {
        Self {
            next_job_id: 1,
            pending: VecDeque::new(),
            results: BTreeMap::new(),
            processing: false,
            max_results: MAX_JOB_RESULTS,
        }
    }

    /// Accept a control request. Runs synchronously (the "fast path") when
    /// the queue is empty, nothing is mid-execution, and the caller didn't
    /// force queuing — this is what gives a single RPC control call a
    /// synchronous result instead of queue latency.
    pub fn enqueue(
        &mut self,
        executor: &mut dyn JobExecutor,
        node: u32,
        channel: u8,
        action: Action,
        source: impl Into<String>,
        force_queue: bool,
        now_ms: i64,
    ) -> EnqueueResult {
        if !executor.node_registered(node) {
            return EnqueueResult {
                job_id: 0,
                accepted: false,
                executed_immediately: false,
                success: false,
                error: Some("unknown node".to_string()),
            };
        }

        let job = ControlJob {
            id: self.next_job_id,
            node,
            channel,
            action,
            source: source.into(),
            enqueued_ms: now_ms,
        };
        self.next_job_id += 1;

        if !force_queue && self.pending.is_empty() && !self.processing {
            let result = self.run(executor, &job, now_ms);
            EnqueueResult {
                job_id: job.id,
                accepted: true,
                executed_immediately: true,
                success: result.ok,
                error: (!result.ok).then_some(result.message),
            }
        } else {
            self.pending.push_back(job.clone());
            EnqueueResult {
                job_id: job.id,
                accepted: true,
                executed_immediately: false,
                success: false,
                error: None,
            }
        }
    }

    /// One queue-processor tick. Dequeues and runs exactly one job. If the
    /// queue is found *already* empty at entry — i.e. one tick after the
    /// last job drained — the result cache and any caller-supplied
    /// tombstones are garbage collected; the tick that runs the last job
    /// does not itself trigger GC.
    pub fn process_tick(&mut self, executor: &mut dyn JobExecutor, now_ms: i64) -> bool {
        let Some(job) = self.pending.pop_front() else {
            self.gc();
            return true;
        };
        self.processing = true;
        self.run(executor, &job, now_ms);
        self.processing = false;
        false
    }

    fn run(&mut self, executor: &mut dyn JobExecutor, job: &ControlJob, now_ms: i64) -> ControlJobResult {
        let outcome = if !executor.node_registered(job.node) {
            ExecOutcome::DeviceNotFound
        } else {
            executor.execute(job.node, job.channel, job.action)
        };
        let (ok, message) = match outcome {
            ExecOutcome::Ok => (true, "ok".to_string()),
            ExecOutcome::DeviceNotFound => (false, "device not found".to_string()),
            ExecOutcome::DeviceRejected => (false, "device rejected".to_string()),
        };
        let result = ControlJobResult {
            ok,
            message,
            finished_ms: now_ms,
        };
        self.results.insert(job.id, result.clone());
        result
    }

    fn gc(&mut self) {
        while self.results.len() > self.max_results {
            if let Some((&oldest, _)) = self.results.iter().next() {
                self.results.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending.len(),
            active: self.processing,
            last_job_id: self.next_job_id.saturating_sub(1),
        }
    }

    pub fn job_result(&self, job_id: u64) -> ControlJobResult {
        self.results.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.processing
    }
}
