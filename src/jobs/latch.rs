//! jobs/latch — одноразовые защёлки и служебные задачи на их основе.
//!
//! LatchJob    — выполнение отпускает защёлку (барьер "всё поставленное ранее уже выполнено").
//! SuspendJob  — блокирует поток процессора до resume(); ставится с Priority::Highest,
//!               поэтому приостановка наступает только МЕЖДУ задачами.

use anyhow::Result;
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{Job, JobState};

/// One-shot latch: `release` once, any number of waiters.
#[derive(Default)]
pub struct Latch {
    released: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        let mut g = self.released.lock().unwrap();
        *g = true;
        self.cv.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap()
    }

    /// Wait until released. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(d) => d,
            None => {
                self.wait();
                return true;
            }
        };
        let mut g = self.released.lock().unwrap();
        while !*g {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = self.cv.wait_timeout(g, deadline - now).unwrap().0;
        }
        true
    }

    pub fn wait(&self) {
        let mut g = self.released.lock().unwrap();
        while !*g {
            g = self.cv.wait(g).unwrap();
        }
    }
}

/// Job whose execution releases a latch.
pub struct LatchJob {
    state: JobState,
    latch: Arc<Latch>,
}

impl LatchJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: JobState::new(),
            latch: Latch::new(),
        })
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.latch
    }
}

impl Job for LatchJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        self.latch.release();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Parks the processor thread until `resume` is released.
pub(crate) struct SuspendJob {
    state: JobState,
    pub(crate) entered: Arc<Latch>,
    pub(crate) resume: Arc<Latch>,
}

impl SuspendJob {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: JobState::new(),
            entered: Latch::new(),
            resume: Latch::new(),
        })
    }
}

impl Job for SuspendJob {
    fn state(&self) -> &JobState {
        &self.state
    }

    fn execute(&self) -> Result<()> {
        self.entered.release();
        self.resume.wait();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn latch_times_out_then_releases() {
        let l = Latch::new();
        assert!(!l.wait_timeout(Duration::from_millis(10)));
        let l2 = l.clone();
        let h = thread::spawn(move || l2.release());
        assert!(l.wait_timeout(Duration::from_secs(5)));
        h.join().unwrap();
        assert!(l.is_released());
    }
}
