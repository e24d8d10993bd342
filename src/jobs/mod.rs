//! jobs — кооперативный планировщик задач (scheduler core).
//!
//! Состав:
//! - Job (trait) + JobState: идентичность, dedup по логическому ключу, хуки start/finish.
//! - queue: PriorityJobQueue (приоритет + FIFO) и TimedJobQueue (дедлайн + FIFO), оба с merge.
//! - processor: контракт JobProcessor (queue/queue_at/wait/suspend/resume/finish).
//! - thread: ThreadJobProcessor — один выделенный поток ОС (thread affinity).
//! - delegating: DelegatingJobProcessor — логический процессор поверх чужого потока.
//! - multi: MultiThreadDelegatingJobProcessor — шардирование по хэшу + watchdog.
//! - latch: одноразовые защёлки и LatchJob/SuspendJob.

use anyhow::Result;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use crate::util::now_millis;

pub mod queue;
pub mod latch;
pub mod processor;
pub mod thread;
pub mod delegating;
pub mod multi;

pub use delegating::DelegatingJobProcessor;
pub use latch::{Latch, LatchJob};
pub use multi::MultiThreadDelegatingJobProcessor;
pub use processor::{JobExceptionHandler, JobProcessor, Schedule};
pub use thread::ThreadJobProcessor;

/// Shared handle to a job.
pub type JobRef = Arc<dyn Job>;

/// Hook invoked right before/after a job executes.
pub type JobHandler = Arc<dyn Fn(&dyn Job) + Send + Sync + 'static>;

/// Scheduling priority. Lower numeric value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Highest = 0,
    AboveNormal = 1,
    Normal = 2,
    BelowNormal = 3,
    Lowest = 4,
}

impl Priority {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Logical identity of a job used for queue deduplication.
///
/// Two queued jobs with equal keys are "the same job": pushing the second one
/// merges with the first instead of creating a new queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    /// Уникальная задача: ключ = адрес её JobState (стабилен, пока Arc жив в очереди).
    Identity(usize),
    /// Структурно-равные задачи: (имя класса задач, дискриминатор).
    Logical(&'static str, u64),
}

/// Mutable bookkeeping every job carries.
///
/// The processor fields are filled in when the job is queued and when it starts
/// running; the handler chains are fired by [`run_job`] on both success and
/// failure paths.
#[derive(Default)]
pub struct JobState {
    processor: Mutex<Option<Weak<dyn JobProcessor>>>,
    completed: AtomicBool,
    started_at: AtomicU64,
    thread: Mutex<Option<ThreadId>>,
    started_handlers: Mutex<Vec<JobHandler>>,
    finished_handlers: Mutex<Vec<JobHandler>>,
}

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processor the job was last queued to (None if never queued or dropped).
    pub fn processor(&self) -> Option<Arc<dyn JobProcessor>> {
        self.processor
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    pub(crate) fn processor_weak(&self) -> Option<Weak<dyn JobProcessor>> {
        self.processor.lock().unwrap().clone()
    }

    pub fn set_processor(&self, p: Option<Weak<dyn JobProcessor>>) {
        *self.processor.lock().unwrap() = p;
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Unix millis of the last start, 0 if the job never started.
    pub fn started_at(&self) -> u64 {
        self.started_at.load(Ordering::Acquire)
    }

    /// Thread currently (or last) executing the job.
    pub fn thread(&self) -> Option<ThreadId> {
        *self.thread.lock().unwrap()
    }

    pub fn add_started_handler(&self, h: JobHandler) {
        self.started_handlers.lock().unwrap().push(h);
    }

    pub fn add_finished_handler(&self, h: JobHandler) {
        self.finished_handlers.lock().unwrap().push(h);
    }

    fn fire(handlers: &Mutex<Vec<JobHandler>>, job: &dyn Job) {
        // Копируем список, чтобы хук мог сам добавлять хуки без дедлока.
        let hs: Vec<JobHandler> = handlers.lock().unwrap().clone();
        for h in hs {
            h(job);
        }
    }
}

/// A unit of work executed by a [`JobProcessor`].
pub trait Job: Send + Sync + 'static {
    /// Job bookkeeping.
    fn state(&self) -> &JobState;

    /// Does the actual work. Called on the processor thread.
    fn execute(&self) -> Result<()>;

    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    fn group(&self) -> String {
        "<default job group>".to_string()
    }

    /// Deduplication key. Default: every job instance is unique.
    fn key(&self) -> JobKey {
        JobKey::Identity(self.state() as *const JobState as usize)
    }

    /// Logical equality used by the queues.
    fn is_equal_to(&self, other: &dyn Job) -> bool {
        self.key() == other.key()
    }

    /// Makes the job inert. Jobs without cancellable resources ignore it.
    fn cancel(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Runs `job` on the current thread: stamps start time and thread, fires the
/// started handlers, executes, marks completion and fires the finished
/// handlers. The execution result is returned unchanged.
pub fn run_job(job: &JobRef) -> Result<()> {
    let st = job.state();
    st.completed.store(false, Ordering::Release);
    st.started_at.store(now_millis(), Ordering::Release);
    *st.thread.lock().unwrap() = Some(std::thread::current().id());

    JobState::fire(&st.started_handlers, job.as_ref());
    let res = job.execute();
    st.completed.store(true, Ordering::Release);
    JobState::fire(&st.finished_handlers, job.as_ref());
    res
}

/// Closure-backed job for ad-hoc work.
pub struct FnJob {
    state: JobState,
    name: String,
    key: Option<JobKey>,
    f: Box<dyn Fn() -> Result<()> + Send + Sync + 'static>,
}

impl FnJob {
    pub fn new<F>(name: &str, f: F) -> Arc<Self>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: JobState::new(),
            name: name.to_string(),
            key: None,
            f: Box::new(f),
        })
    }

    /// Job that deduplicates with every other FnJob built with the same key.
    pub fn keyed<F>(name: &str, key: JobKey, f: F) -> Arc<Self>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: JobState::new(),
            name: name.to_string(),
            key: Some(key),
            f: Box::new(f),
        })
    }
}

impl Job for FnJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        (self.f)()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn key(&self) -> JobKey {
        match &self.key {
            Some(k) => k.clone(),
            None => JobKey::Identity(&self.state as *const JobState as usize),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
