//! Background pool for `afterAsync` triggers.

use crate::error::{TrigxError, TrigxResult};
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the in-flight count when a job finishes, even by panic.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        *in_flight.count.lock() += 1;
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Rayon thread pool running fire-and-forget trigger jobs.
pub struct AsyncRunner {
    pool: rayon::ThreadPool,
    in_flight: Arc<InFlight>,
}

impl AsyncRunner {
    pub fn new(num_threads: usize) -> TrigxResult<Self> {
        if num_threads == 0 {
            return Err(TrigxError::Scheduler(
                "async pool needs at least one thread".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("trigx-async-{}", i))
            .panic_handler(|_| error!("async trigger job panicked"))
            .build()
            .map_err(|e| TrigxError::Scheduler(format!("failed to create async pool: {}", e)))?;

        Ok(Self {
            pool,
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Jobs submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    /// Queue `job`; the caller never waits for it.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = InFlightGuard::enter(&self.in_flight);
        self.pool.spawn(move || {
            let _guard = guard;
            job();
        });
    }

    /// Wait until no job is in flight. Returns false on timeout.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            if self.in_flight.idle.wait_until(&mut count, deadline).timed_out() {
                debug!(in_flight = *count, "async pool did not drain in time");
                return *count == 0;
            }
        }
        true
    }
}
