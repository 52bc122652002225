//! Drives a graph to quiescence.
//!
//! The scheduler repeatedly invokes `work()` on every block until an entire
//! round passes in which no block made progress. Single-threaded execution
//! loops on the caller's thread; multi-threaded execution partitions the
//! ordered block list round-robin across pool workers fixed at `init()`
//! time, and coordinates rounds through a packed 64-bit progress word:
//!
//! ```text
//! progress = (generation << 32) | done_count
//! ```
//!
//! A worker that moved samples bumps the generation and zeroes `done`; a
//! worker that found nothing to do increments `done` within the current
//! generation and parks until the word changes. The run ends when
//! `done == workers`: unanimous no-progress within one generation. This is
//! the invariant that makes termination sound — a single straggler with
//! fresh samples resets the count for everyone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::block::{BlockModel, WorkResult, WorkStatus};
use crate::graph::{Graph, GraphError};
use crate::pool::ThreadPool;

/// Scheduler life cycle. `Error` is terminal: construct a fresh scheduler
/// to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Initialised,
    Running,
    RequestedStop,
    RequestedPause,
    Stopped,
    Paused,
    ShuttingDown,
    Error,
}

/// Block execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingPolicy {
    /// Graph-definition order.
    #[default]
    Definition,
    /// Sources first, then breadth-first over edges (back-edges ignored).
    BreadthFirst,
}

/// How many threads drive the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    #[default]
    SingleThreaded,
    MultiThreaded,
}

/// Scheduler failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is not initialised")]
    NotInitialised,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("block '{block}' returned a fatal error")]
    Fatal { block: String },
}

/// The packed progress word plus the condvar workers park on.
struct ProgressWord {
    word: AtomicU64,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl ProgressWord {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    fn store(&self, value: u64) {
        self.word.store(value, Ordering::Release);
    }

    fn compare_exchange(&self, current: u64, new: u64) -> bool {
        self.word
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn notify_all(&self) {
        drop(self.lock.lock().expect("progress lock poisoned"));
        self.condvar.notify_all();
    }

    /// Parks while the word still equals `value` and `stop` is clear.
    fn wait_while_value(&self, value: u64, stop: &AtomicBool) {
        let mut guard = self.lock.lock().expect("progress lock poisoned");
        while self.word.load(Ordering::Acquire) == value && !stop.load(Ordering::Acquire) {
            guard = self.condvar.wait(guard).expect("progress lock poisoned");
        }
    }
}

/// Counter of live workers; `wait_done` parks on it.
struct RunningThreads {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl RunningThreads {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn set(&self, n: usize) {
        *self.count.lock().expect("running lock poisoned") = n;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().expect("running lock poisoned");
        *count = count.saturating_sub(1);
        drop(count);
        self.condvar.notify_all();
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock().expect("running lock poisoned");
        while *count > 0 {
            count = self.condvar.wait(count).expect("running lock poisoned");
        }
    }
}

/// Graph executor.
///
/// # Example
///
/// ```rust,ignore
/// use caudal_core::scheduler::{ExecutionPolicy, Scheduler};
///
/// let mut scheduler = Scheduler::new(graph)
///     .with_execution_policy(ExecutionPolicy::MultiThreaded);
/// scheduler.run_and_wait()?;
/// ```
pub struct Scheduler {
    graph: Graph,
    state: SchedulerState,
    ordering: OrderingPolicy,
    execution: ExecutionPolicy,
    pool: ThreadPool,
    /// Job sets, fixed at init. Workers hold their set's mutex for a whole
    /// run; between runs the sets are parked here for reuse.
    jobs: Vec<Arc<Mutex<Vec<BlockModel>>>>,
    progress: Arc<ProgressWord>,
    running: Arc<RunningThreads>,
    stop_requested: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl Scheduler {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            state: SchedulerState::Idle,
            ordering: OrderingPolicy::default(),
            execution: ExecutionPolicy::default(),
            pool: ThreadPool::with_default_size("caudal-scheduler"),
            jobs: Vec::new(),
            progress: Arc::new(ProgressWord::new()),
            running: Arc::new(RunningThreads::new()),
            stop_requested: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_ordering_policy(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_execution_policy(mut self, execution: ExecutionPolicy) -> Self {
        self.execution = execution;
        self
    }

    /// Replaces the worker pool with one of `threads` workers.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.pool = ThreadPool::new("caudal-scheduler", threads);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Resolves the graph's connections, computes the execution order and
    /// partitions blocks into job sets. A wiring failure leaves the
    /// scheduler in the terminal `Error` state.
    pub fn init(&mut self) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Ok(());
        }
        if let Err(error) = self.graph.init() {
            self.state = SchedulerState::Error;
            return Err(error.into());
        }

        let order = match self.ordering {
            OrderingPolicy::Definition => (0..self.graph.block_count()).collect(),
            OrderingPolicy::BreadthFirst => breadth_first_order(&self.graph),
        };

        let mut blocks = self.graph.drain_blocks();
        // Reorder into execution order, then deal round-robin into job sets.
        let mut ordered: Vec<Option<BlockModel>> = blocks.drain(..).map(Some).collect();
        let ordered: Vec<BlockModel> = order
            .iter()
            .map(|&i| ordered[i].take().expect("order is a permutation"))
            .collect();

        let batches = match self.execution {
            ExecutionPolicy::SingleThreaded => 1,
            ExecutionPolicy::MultiThreaded => {
                self.pool.max_threads().min(ordered.len()).max(1)
            }
        };
        let mut sets: Vec<Vec<BlockModel>> = (0..batches).map(|_| Vec::new()).collect();
        for (index, block) in ordered.into_iter().enumerate() {
            sets[index % batches].push(block);
        }
        self.jobs = sets
            .into_iter()
            .map(|set| Arc::new(Mutex::new(set)))
            .collect();

        debug!(jobs = self.jobs.len(), "scheduler initialised");
        self.state = SchedulerState::Initialised;
        Ok(())
    }

    /// Starts a run. Legal only from `Initialised`; `Idle` auto-inits,
    /// `Stopped` auto-resets and `Paused` re-arms first.
    ///
    /// Single-threaded execution runs to quiescence on the calling thread;
    /// multi-threaded execution returns immediately — use
    /// [`wait_done`](Self::wait_done) or [`run_and_wait`](Self::run_and_wait).
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            SchedulerState::Idle => self.init()?,
            SchedulerState::Stopped => self.reset()?,
            SchedulerState::Paused => self.state = SchedulerState::Initialised,
            _ => {}
        }
        if self.state != SchedulerState::Initialised {
            return Err(SchedulerError::NotInitialised);
        }

        self.stop_requested.store(false, Ordering::Release);
        self.progress.store(0);
        *self.failure.lock().expect("failure lock poisoned") = None;

        match self.execution {
            ExecutionPolicy::SingleThreaded => {
                self.state = SchedulerState::Running;
                let job = Arc::clone(&self.jobs[0]);
                let mut blocks = job.lock().expect("job set poisoned");
                loop {
                    if self.stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    let (result, offender) = work_once(&mut blocks);
                    match result.status {
                        WorkStatus::Ok => continue,
                        WorkStatus::Error => {
                            drop(blocks);
                            self.state = SchedulerState::Error;
                            return Err(SchedulerError::Fatal {
                                block: offender.unwrap_or_default(),
                            });
                        }
                        _ => break,
                    }
                }
                drop(blocks);
                if self.state == SchedulerState::Running {
                    self.state = SchedulerState::Stopped;
                }
                Ok(())
            }
            ExecutionPolicy::MultiThreaded => {
                self.state = SchedulerState::Running;
                let workers = self.jobs.len() as u32;
                self.running.set(workers as usize);
                for job in &self.jobs {
                    let job = Arc::clone(job);
                    let progress = Arc::clone(&self.progress);
                    let running = Arc::clone(&self.running);
                    let stop = Arc::clone(&self.stop_requested);
                    let failure = Arc::clone(&self.failure);
                    self.pool.execute(move || {
                        pool_worker(job, workers, progress, running, stop, failure)
                    });
                }
                Ok(())
            }
        }
    }

    /// Blocks until every worker finished its run, then surfaces any fatal
    /// block error captured on a worker thread.
    pub fn wait_done(&mut self) -> Result<(), SchedulerError> {
        self.running.wait_zero();
        if let Some(block) = self.failure.lock().expect("failure lock poisoned").take() {
            self.state = SchedulerState::Error;
            return Err(SchedulerError::Fatal { block });
        }
        self.state = match self.state {
            SchedulerState::RequestedPause => SchedulerState::Paused,
            SchedulerState::Error => SchedulerState::Error,
            _ => SchedulerState::Stopped,
        };
        Ok(())
    }

    /// [`start`](Self::start) followed by [`wait_done`](Self::wait_done).
    pub fn run_and_wait(&mut self) -> Result<(), SchedulerError> {
        self.start()?;
        self.wait_done()
    }

    /// Requests a stop: a one-way flag workers observe at their next round
    /// boundary. In-flight `work()` calls are not interrupted.
    pub fn request_stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.state = SchedulerState::RequestedStop;
        self.progress.notify_all();
    }

    /// Requests a pause; the job partition stays reusable.
    pub fn request_pause(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.state = SchedulerState::RequestedPause;
        self.progress.notify_all();
    }

    /// Stops the run and waits for the workers.
    pub fn stop(&mut self) -> Result<(), SchedulerError> {
        if matches!(self.state, SchedulerState::Stopped | SchedulerState::Error) {
            return Ok(());
        }
        if self.state == SchedulerState::Running {
            self.request_stop();
        }
        let result = self.wait_done();
        if self.state != SchedulerState::Error {
            self.state = SchedulerState::Stopped;
        }
        result
    }

    /// Pauses the run and waits for the workers.
    pub fn pause(&mut self) -> Result<(), SchedulerError> {
        if matches!(self.state, SchedulerState::Paused | SchedulerState::Error) {
            return Ok(());
        }
        if self.state == SchedulerState::Running {
            self.request_pause();
        }
        let result = self.wait_done();
        if self.state != SchedulerState::Error {
            self.state = SchedulerState::Paused;
        }
        result
    }

    /// Returns the scheduler to `Initialised` so it can run again. The
    /// graph's connections cannot be re-resolved, so this keeps the existing
    /// partition. No-op from `Error` (terminal) and `Initialised`.
    pub fn reset(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            SchedulerState::Idle => self.init(),
            SchedulerState::Running
            | SchedulerState::RequestedStop
            | SchedulerState::RequestedPause => {
                self.pause()?;
                self.state = SchedulerState::Initialised;
                Ok(())
            }
            SchedulerState::Stopped | SchedulerState::Paused => {
                self.state = SchedulerState::Initialised;
                Ok(())
            }
            SchedulerState::ShuttingDown
            | SchedulerState::Initialised
            | SchedulerState::Error => Ok(()),
        }
    }

    /// Runs `f` over every block of every job set (between runs only).
    /// Panics if called while workers hold the job sets.
    pub fn for_each_block<F: FnMut(&mut BlockModel)>(&mut self, mut f: F) {
        for job in &self.jobs {
            let mut blocks = job.try_lock().expect("scheduler is running");
            for block in blocks.iter_mut() {
                f(block);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.stop();
        self.state = SchedulerState::ShuttingDown;
    }
}

/// One pass over a job set. Accumulates the *something happened* flag per
/// the block contract: `Ok`/`InsufficientOutputItems` count as progress,
/// `Done`/`InsufficientInputItems` do not, and a blocking block with queued
/// input on any port forces another round. Returns the offending block's
/// unique name alongside a fatal status.
fn work_once(blocks: &mut [BlockModel]) -> (WorkResult, Option<String>) {
    let requested = u64::MAX;
    let mut something_happened = false;
    let mut performed = 0u64;
    for block in blocks.iter_mut() {
        let result = block.work(requested);
        performed += result.performed_work;
        match result.status {
            WorkStatus::Error => {
                warn!(block = block.unique_name(), "block returned a fatal error");
                return (
                    WorkResult::new(requested, performed, WorkStatus::Error),
                    Some(block.unique_name().to_owned()),
                );
            }
            WorkStatus::Ok | WorkStatus::InsufficientOutputItems => something_happened = true,
            WorkStatus::Done | WorkStatus::InsufficientInputItems => {}
        }
        if block.is_blocking() {
            let queued: usize = block.available_input_samples().iter().sum();
            something_happened |= queued > 0;
        }
    }
    let status = if something_happened {
        WorkStatus::Ok
    } else {
        WorkStatus::Done
    };
    (WorkResult::new(requested, performed, status), None)
}

/// Worker loop for one job set: runs rounds and participates in the
/// generation/done protocol until unanimous no-progress or a stop request.
fn pool_worker(
    job: Arc<Mutex<Vec<BlockModel>>>,
    workers: u32,
    progress: Arc<ProgressWord>,
    running: Arc<RunningThreads>,
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
) {
    let mut blocks = job.lock().expect("job set poisoned");
    let mut done: u32 = 0;
    let mut generation: u32 = 0;

    while done < workers && !stop.load(Ordering::Acquire) {
        let (round, offender) = work_once(&mut blocks);
        if round.status == WorkStatus::Error {
            *failure.lock().expect("failure lock poisoned") = Some(offender.unwrap_or_default());
            stop.store(true, Ordering::Release);
            progress.notify_all();
            break;
        }
        let something_happened = round.status == WorkStatus::Ok;

        if something_happened {
            // Progress: bump the generation, zero the done count.
            loop {
                let current = progress.load();
                generation = (current >> 32) as u32;
                done = (current & u32::MAX as u64) as u32;
                let next = (u64::from(generation) + 1) << 32;
                if progress.compare_exchange(current, next) {
                    break;
                }
            }
            progress.notify_all();
        } else {
            // No progress here: count ourselves done within the current
            // generation, or adopt the newer generation and rerun at once.
            let generation_old = generation;
            let mut next;
            loop {
                let current = progress.load();
                generation = (current >> 32) as u32;
                done = (current & u32::MAX as u64) as u32;
                next = if generation == generation_old {
                    (u64::from(generation) << 32) + u64::from(done) + 1
                } else {
                    current
                };
                if progress.compare_exchange(current, next) {
                    break;
                }
            }
            progress.notify_all();
            if generation == generation_old && done + 1 < workers {
                progress.wait_while_value(next, &stop);
            }
            done = (progress.load() & u32::MAX as u64) as u32;
        }
    }

    drop(blocks);
    running.decrement();
}

/// Sources first (blocks that appear only as edge sources), then
/// breadth-first over the adjacency list. Back-edges are ignored, so cycles
/// do not recurse. Blocks unreachable from any source are appended in
/// definition order so no block is silently dropped.
fn breadth_first_order(graph: &Graph) -> Vec<usize> {
    use std::collections::{BTreeSet, VecDeque};

    let block_count = graph.block_count();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); block_count];
    let mut has_incoming = vec![false; block_count];
    for edge in graph.edges() {
        adjacency[edge.src.index()].push(edge.dst.index());
        has_incoming[edge.dst.index()] = true;
    }

    let mut order = Vec::with_capacity(block_count);
    let mut reached = BTreeSet::new();
    let mut queue = VecDeque::new();
    // Blocks that source an edge and are never a destination seed the
    // traversal.
    for index in 0..block_count {
        if !adjacency[index].is_empty() && !has_incoming[index] && reached.insert(index) {
            queue.push_back(index);
        }
    }

    while let Some(current) = queue.pop_front() {
        order.push(current);
        for &next in &adjacency[current] {
            if reached.insert(next) {
                queue.push_back(next);
            }
        }
    }

    // Isolated or unreachable blocks still execute, after the main order.
    for index in 0..block_count {
        if !reached.contains(&index) {
            order.push(index);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BlockId;

    #[test]
    fn test_progress_word_packing() {
        let progress = ProgressWord::new();
        assert_eq!(progress.load(), 0);
        assert!(progress.compare_exchange(0, (3u64 << 32) | 2));
        assert_eq!(progress.load() >> 32, 3);
        assert_eq!(progress.load() & u32::MAX as u64, 2);
    }

    #[test]
    fn test_bfs_order_linear_chain() {
        use crate::graph::Graph;
        let mut graph = Graph::new();
        let a = graph.add_block(Box::new(test_blocks::Probe::source()));
        let b = graph.add_block(Box::new(test_blocks::Probe::transform()));
        let c = graph.add_block(Box::new(test_blocks::Probe::sink()));
        graph.connect(b, "out", c, "in");
        graph.connect(a, "out", b, "in");
        graph.init().unwrap();

        assert_eq!(
            breadth_first_order(&graph),
            vec![a.index(), b.index(), c.index()]
        );
    }

    #[test]
    fn test_bfs_tolerates_cycles() {
        use crate::graph::Graph;
        let mut graph = Graph::new();
        let a = graph.add_block(Box::new(test_blocks::Probe::loopy()));
        let b = graph.add_block(Box::new(test_blocks::Probe::loopy()));
        graph.connect(a, "out", b, "in");
        graph.connect(b, "out", a, "in");
        graph.init().unwrap();

        let order = breadth_first_order(&graph);
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn test_uninitialised_start_rejected() {
        // A graph whose wiring fails leaves the scheduler in Error; starting
        // again is refused.
        use crate::graph::Graph;
        let mut graph = Graph::new();
        graph.add_block(Box::new(test_blocks::Probe::source()));
        let mut scheduler = Scheduler::new(graph);
        assert!(scheduler.init().is_err());
        assert_eq!(scheduler.state(), SchedulerState::Error);
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::NotInitialised)
        ));
    }

    #[test]
    fn test_block_id_round_trip() {
        assert_eq!(BlockId(4).index(), 4);
    }

    mod test_blocks {
        use crate::block::{Block, WorkIo, WorkResult};
        use crate::fields::{BlockFields, FieldDescriptor};
        use crate::pmt::Pmt;
        use crate::port::PortDescriptor;

        /// Configurable do-nothing block for topology tests.
        pub struct Probe {
            inputs: Vec<PortDescriptor>,
            outputs: Vec<PortDescriptor>,
        }

        impl Probe {
            pub fn source() -> Self {
                Self {
                    inputs: vec![],
                    outputs: vec![PortDescriptor::stream::<f32>("out")],
                }
            }

            pub fn transform() -> Self {
                Self {
                    inputs: vec![PortDescriptor::stream::<f32>("in")],
                    outputs: vec![PortDescriptor::stream::<f32>("out")],
                }
            }

            pub fn sink() -> Self {
                Self {
                    inputs: vec![PortDescriptor::stream::<f32>("in")],
                    outputs: vec![],
                }
            }

            pub fn loopy() -> Self {
                Self {
                    inputs: vec![PortDescriptor::stream::<f32>("in")],
                    outputs: vec![PortDescriptor::stream::<f32>("out")],
                }
            }
        }

        impl BlockFields for Probe {
            fn field_count(&self) -> usize {
                0
            }
            fn field_info(&self, _: usize) -> Option<FieldDescriptor> {
                None
            }
            fn field_value(&self, _: usize) -> Option<Pmt> {
                None
            }
            fn set_field_value(&mut self, _: usize, _: &Pmt) -> bool {
                false
            }
        }

        impl Block for Probe {
            fn type_name(&self) -> &'static str {
                "Probe"
            }
            fn inputs(&self) -> Vec<PortDescriptor> {
                self.inputs.clone()
            }
            fn outputs(&self) -> Vec<PortDescriptor> {
                self.outputs.clone()
            }
            fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
                WorkResult::done(requested)
            }
        }
    }
}
