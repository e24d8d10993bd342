//! gc/jobs — задачи GC.
//!
//! Каждая задача держит СЛАБУЮ ссылку на GarbageCollector в GcLink:
//! - cancel() обнуляет ссылку — задача, снятая позже с очереди, ничего не делает;
//! - renew() привязывает её снова (перед повторной постановкой);
//! - если процессор очистителя сменился с момента постановки, задача
//!   переставляет себя в новый процессор с наивысшим приоритетом.

use anyhow::Result;
use log::debug;
use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use super::collector::GarbageCollector;
use crate::jobs::processor::same_processor;
use crate::jobs::{Job, JobKey, JobRef, JobState, Priority};

#[derive(Default)]
pub struct GcLink {
    gc: Mutex<Option<Weak<GarbageCollector>>>,
}

impl GcLink {
    fn new(gc: Weak<GarbageCollector>) -> Self {
        Self {
            gc: Mutex::new(Some(gc)),
        }
    }

    pub fn collector(&self) -> Option<Arc<GarbageCollector>> {
        self.gc.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    pub fn cancel(&self) {
        *self.gc.lock().unwrap() = None;
    }

    pub fn renew(&self, gc: Weak<GarbageCollector>) {
        *self.gc.lock().unwrap() = Some(gc);
    }

    pub fn is_cancelled(&self) -> bool {
        self.gc.lock().unwrap().is_none()
    }
}

/// Collector to run against, or None if the job is inert or was moved to the
/// cleaner's current processor.
fn prepare(state: &JobState, link: &GcLink, me: &Weak<dyn Job>) -> Option<Arc<GarbageCollector>> {
    let gc = link.collector()?;
    let expected = gc.cleaner().processor()?;
    let queued_on = state.processor();
    let moved = match queued_on.as_ref() {
        Some(p) => !same_processor(p, &expected),
        None => false,
    };
    if moved {
        if let Some(job) = me.upgrade() {
            debug!("{}: cleaner processor changed, requeueing", job.name());
            expected.queue(job, Priority::Highest);
        }
        return None;
    }
    Some(gc)
}

/// Идентичность коллектора в логических ключах: одинаковые задачи разных
/// коллекторов на общем потоке не сливаются.
fn collector_id(gc: &Weak<GarbageCollector>) -> u64 {
    Weak::as_ptr(gc) as *const () as usize as u64
}

macro_rules! gc_job {
    ($ty:ident) => {
        impl $ty {
            pub fn new(gc: Weak<GarbageCollector>) -> Arc<Self> {
                Arc::new_cyclic(|me: &Weak<$ty>| {
                    let me: Weak<dyn Job> = me.clone();
                    Self {
                        state: JobState::new(),
                        owner_id: collector_id(&gc),
                        link: GcLink::new(gc),
                        me,
                    }
                })
            }

            pub fn link(&self) -> &GcLink {
                &self.link
            }

            pub fn renew(&self, gc: Weak<GarbageCollector>) {
                self.link.renew(gc);
            }

            pub fn as_job(self: &Arc<Self>) -> JobRef {
                let j: JobRef = self.clone();
                j
            }
        }
    };
}

/// The recurring background pass. One instance per cleaner.
pub struct BackgroundCleaningJob {
    state: JobState,
    owner_id: u64,
    link: GcLink,
    me: Weak<dyn Job>,
}

gc_job!(BackgroundCleaningJob);

impl Job for BackgroundCleaningJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        let gc = match prepare(&self.state, &self.link, &self.me) {
            Some(gc) => gc,
            None => return Ok(()),
        };
        let cleaner = gc.cleaner();
        cleaner.set_cleaning(true);
        let res = gc.clean_fragmented_files();
        cleaner.set_cleaning(false);
        res.map(|_| ())
    }

    fn group(&self) -> String {
        "gc".to_string()
    }

    fn key(&self) -> JobKey {
        JobKey::Logical("BackgroundCleaningJob", self.owner_id)
    }

    fn cancel(&self) {
        self.link.cancel();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Full compaction: cleans until the number of files stops decreasing.
pub struct CleanEntireLogJob {
    state: JobState,
    owner_id: u64,
    link: GcLink,
    me: Weak<dyn Job>,
}

gc_job!(CleanEntireLogJob);

impl Job for CleanEntireLogJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        match prepare(&self.state, &self.link, &self.me) {
            Some(gc) => gc.clean_entire_log_now(),
            None => Ok(()),
        }
    }

    fn group(&self) -> String {
        "gc".to_string()
    }

    fn key(&self) -> JobKey {
        JobKey::Logical("CleanEntireLogJob", self.owner_id)
    }

    fn cancel(&self) {
        self.link.cancel();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Rebuilds the utilization profile from live records.
pub struct ComputeUtilizationFromScratchJob {
    state: JobState,
    owner_id: u64,
    link: GcLink,
    me: Weak<dyn Job>,
}

gc_job!(ComputeUtilizationFromScratchJob);

impl Job for ComputeUtilizationFromScratchJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        match prepare(&self.state, &self.link, &self.me) {
            Some(gc) => gc.compute_utilization_from_scratch_now(),
            None => Ok(()),
        }
    }

    fn group(&self) -> String {
        "gc".to_string()
    }

    fn key(&self) -> JobKey {
        JobKey::Logical("ComputeUtilizationFromScratchJob", self.owner_id)
    }

    fn cancel(&self) {
        self.link.cancel();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Physically removes files from the deletion queue.
pub struct DeletePendingFilesJob {
    state: JobState,
    owner_id: u64,
    link: GcLink,
    me: Weak<dyn Job>,
}

gc_job!(DeletePendingFilesJob);

impl Job for DeletePendingFilesJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        match prepare(&self.state, &self.link, &self.me) {
            Some(gc) => gc.delete_pending_files(),
            None => Ok(()),
        }
    }

    fn group(&self) -> String {
        "gc".to_string()
    }

    fn key(&self) -> JobKey {
        JobKey::Logical("DeletePendingFilesJob", self.owner_id)
    }

    fn cancel(&self) {
        self.link.cancel();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Cancels `job` if it is one of the GC jobs.
pub fn cancel_if_gc_job(job: &JobRef) -> bool {
    let any = job.as_any();
    let is_gc = any.is::<BackgroundCleaningJob>()
        || any.is::<CleanEntireLogJob>()
        || any.is::<ComputeUtilizationFromScratchJob>()
        || any.is::<DeletePendingFilesJob>();
    if is_gc {
        job.cancel();
    }
    is_gc
}
