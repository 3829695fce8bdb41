//! Parallel stack scheduler.
//!
//! The calling thread owns the state table; it is the only place where a
//! stack's state changes and where events are emitted. A fixed pool of scoped
//! worker threads pulls jobs from a shared channel and sends results back.
//! Each completion re-evaluates the stacks that were waiting on it.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::env::EnvOverlay;
use crate::core::order::InducedOrder;
use crate::core::path::ProjectPath;
use crate::core::state::{RunReport, StackOutcome, StackState};
use crate::io::events::{EventKind, EventSink, StackEvent};
use crate::io::process::OutputMode;
use crate::io::runner::{CommandRunner, RunOutcome, RunRequest};

/// Everything needed to run one selected stack.
#[derive(Debug, Clone)]
pub struct StackJob {
    pub stack: ProjectPath,
    pub id: Option<String>,
    pub workdir: PathBuf,
    pub env: EnvOverlay,
    /// Local dependency issues; a stack with issues fails without running.
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Worker count; 1 runs strictly sequentially with streamed output.
    pub parallel: usize,
    pub continue_on_error: bool,
    pub dry_run: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            continue_on_error: false,
            dry_run: false,
        }
    }
}

/// Cooperative cancellation. Stops dispatching new stacks; running ones finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            canceled: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn reason(&self) -> &'static str {
        if self.canceled.load(Ordering::SeqCst) {
            "run canceled"
        } else {
            "timeout reached"
        }
    }
}

/// Run `command` in every stack of `order`, respecting its edges.
///
/// Every node of `order` must have an entry in `jobs`. The returned report
/// lists each stack exactly once, in linearized order.
#[instrument(
    skip_all,
    fields(stacks = order.len(), parallel = options.parallel, dry_run = options.dry_run)
)]
pub fn execute(
    order: &InducedOrder,
    jobs: &BTreeMap<ProjectPath, StackJob>,
    command: &[String],
    runner: &dyn CommandRunner,
    sink: &mut dyn EventSink,
    options: ScheduleOptions,
    cancel: &CancelToken,
) -> RunReport {
    let linear = order.linear();
    let parallel = options.parallel.max(1);
    let mode = if parallel > 1 {
        OutputMode::Capture
    } else {
        OutputMode::Stream
    };
    let workers = if options.dry_run {
        0
    } else {
        parallel.min(linear.len())
    };
    let capacity = if options.dry_run { usize::MAX } else { workers };

    let mut table = Table::new(order, jobs, sink, options.continue_on_error);

    let (job_tx, job_rx) = mpsc::channel::<&StackJob>();
    let (result_tx, result_rx) = mpsc::channel::<(&ProjectPath, Result<RunOutcome>)>();
    let job_rx = Mutex::new(job_rx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let results = result_tx.clone();
            let job_rx = &job_rx;
            scope.spawn(move || worker(job_rx, &results, runner, command, mode));
        }
        drop(result_tx);

        let mut in_flight = 0usize;
        loop {
            while in_flight < capacity && !cancel.is_canceled() {
                let Some(stack) = table.next_ready(&linear) else {
                    break;
                };
                let Some(job) = jobs.get(stack) else {
                    table.finish(
                        stack,
                        StackState::Failed,
                        None,
                        Some("stack was not prepared for execution".to_string()),
                        &[],
                        &[],
                    );
                    continue;
                };
                if !job.issues.is_empty() {
                    table.finish(
                        stack,
                        StackState::Failed,
                        None,
                        Some(job.issues.join("; ")),
                        &[],
                        &[],
                    );
                    continue;
                }

                table.start(stack);
                if options.dry_run {
                    table.finish(stack, StackState::Ok, None, None, &[], &[]);
                    continue;
                }
                if job_tx.send(job).is_err() {
                    table.finish(
                        stack,
                        StackState::Failed,
                        None,
                        Some("worker pool stopped".to_string()),
                        &[],
                        &[],
                    );
                    continue;
                }
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }
            match result_rx.recv() {
                Ok((stack, result)) => {
                    in_flight -= 1;
                    table.complete(stack, result);
                }
                Err(_) => {
                    warn!("worker threads stopped before reporting");
                    break;
                }
            }
        }
        drop(job_tx);
    });

    if cancel.is_canceled() {
        table.cancel_remaining(&linear, cancel.reason());
    } else {
        table.cancel_remaining(&linear, "not run");
    }
    table.into_report(linear)
}

fn worker<'a>(
    jobs: &Mutex<mpsc::Receiver<&'a StackJob>>,
    results: &mpsc::Sender<(&'a ProjectPath, Result<RunOutcome>)>,
    runner: &dyn CommandRunner,
    command: &[String],
    mode: OutputMode,
) {
    loop {
        let job = match jobs.lock() {
            Ok(rx) => match rx.recv() {
                Ok(job) => job,
                Err(_) => break,
            },
            Err(_) => break,
        };
        let request = RunRequest {
            stack: &job.stack,
            workdir: job.workdir.clone(),
            command,
            env: &job.env,
            mode,
        };
        let result = runner.run(&request);
        if results.send((&job.stack, result)).is_err() {
            break;
        }
    }
}

/// State table owned by the orchestrating thread.
struct Table<'a> {
    order: &'a InducedOrder,
    jobs: &'a BTreeMap<ProjectPath, StackJob>,
    sink: &'a mut dyn EventSink,
    continue_on_error: bool,
    outcomes: BTreeMap<ProjectPath, StackOutcome>,
}

impl<'a> Table<'a> {
    fn new(
        order: &'a InducedOrder,
        jobs: &'a BTreeMap<ProjectPath, StackJob>,
        sink: &'a mut dyn EventSink,
        continue_on_error: bool,
    ) -> Self {
        let outcomes = order
            .nodes()
            .map(|stack| (stack.clone(), StackOutcome::pending()))
            .collect();
        Self {
            order,
            jobs,
            sink,
            continue_on_error,
            outcomes,
        }
    }

    fn state(&self, stack: &ProjectPath) -> StackState {
        self.outcomes
            .get(stack)
            .map(|o| o.state)
            .unwrap_or(StackState::Pending)
    }

    /// First pending stack, in linearized order, whose predecessors are done.
    fn next_ready<'l>(&self, linear: &'l [ProjectPath]) -> Option<&'l ProjectPath> {
        linear.iter().find(|stack| {
            self.state(stack) == StackState::Pending
                && self.order.predecessors(stack).all(|pred| {
                    let state = self.state(pred);
                    if self.continue_on_error {
                        state.is_terminal()
                    } else {
                        state == StackState::Ok
                    }
                })
        })
    }

    fn set(
        &mut self,
        stack: &ProjectPath,
        state: StackState,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> bool {
        let outcome = self
            .outcomes
            .entry(stack.clone())
            .or_insert_with(StackOutcome::pending);
        if !outcome.state.can_become(state) {
            warn!(
                stack = %stack,
                from = %outcome.state,
                to = %state,
                "ignoring illegal transition"
            );
            return false;
        }
        *outcome = StackOutcome {
            state,
            exit_code,
            error,
        };
        true
    }

    fn emit(&mut self, stack: &ProjectPath, kind: EventKind, stdout: &[u8], stderr: &[u8]) {
        let jobs = self.jobs;
        let id = jobs.get(stack).and_then(|job| job.id.as_deref());
        let outcome = self.outcomes.get(stack);
        let event = StackEvent {
            stack,
            id,
            kind,
            exit_code: outcome.and_then(|o| o.exit_code),
            error: outcome.and_then(|o| o.error.as_deref()),
            stdout,
            stderr,
        };
        self.sink.emit(&event);
    }

    fn start(&mut self, stack: &ProjectPath) {
        if self.set(stack, StackState::Running, None, None) {
            debug!(stack = %stack, "started");
            self.emit(stack, EventKind::Started, &[], &[]);
        }
    }

    fn complete(&mut self, stack: &ProjectPath, result: Result<RunOutcome>) {
        match result {
            Ok(outcome) if outcome.success => self.finish(
                stack,
                StackState::Ok,
                outcome.exit_code,
                None,
                &outcome.stdout,
                &outcome.stderr,
            ),
            Ok(outcome) => self.finish(
                stack,
                StackState::Failed,
                outcome.exit_code,
                None,
                &outcome.stdout,
                &outcome.stderr,
            ),
            Err(err) => self.finish(
                stack,
                StackState::Failed,
                None,
                Some(format!("{err:#}")),
                &[],
                &[],
            ),
        }
    }

    fn finish(
        &mut self,
        stack: &ProjectPath,
        state: StackState,
        exit_code: Option<i32>,
        error: Option<String>,
        stdout: &[u8],
        stderr: &[u8],
    ) {
        if !self.set(stack, state, exit_code, error) {
            return;
        }
        debug!(stack = %stack, state = %state, "finished");
        let kind = match state {
            StackState::Ok => EventKind::Succeeded,
            StackState::Canceled => EventKind::Canceled,
            _ => EventKind::Failed,
        };
        self.emit(stack, kind, stdout, stderr);
        if state == StackState::Failed && !self.continue_on_error {
            self.cancel_dependents(stack);
        }
    }

    /// Cancel every pending stack reachable from `failed`.
    fn cancel_dependents(&mut self, failed: &ProjectPath) {
        let order = self.order;
        let mut queue: VecDeque<&ProjectPath> = order.successors(failed).collect();
        while let Some(next) = queue.pop_front() {
            if self.state(next) != StackState::Pending {
                continue;
            }
            let reason = format!("dependency {failed} failed");
            if self.set(next, StackState::Canceled, None, Some(reason)) {
                self.emit(next, EventKind::Canceled, &[], &[]);
            }
            queue.extend(order.successors(next));
        }
    }

    fn cancel_remaining(&mut self, linear: &[ProjectPath], reason: &str) {
        for stack in linear {
            if self.state(stack) == StackState::Pending
                && self.set(stack, StackState::Canceled, None, Some(reason.to_string()))
            {
                self.emit(stack, EventKind::Canceled, &[], &[]);
            }
        }
    }

    fn into_report(self, order: Vec<ProjectPath>) -> RunReport {
        RunReport {
            order,
            outcomes: self.outcomes,
        }
    }
}
