//! Background workers and the runtime that hosts them.
//!
//! Shell read loops, telemetry collectors and every piece of driver or channel
//! I/O run on one process-wide runtime, independent of whatever scheduler the
//! caller has (or does not have). Connections opened here therefore survive
//! the short-lived schedulers the router builds for conventional hosts.
//!
//! A [`Worker`] is a task with an explicit lifecycle:
//! `Idle -> Running -> StopRequested -> Stopped`. Stopping always waits with
//! an upper bound; a worker that does not exit in time is aborted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SessionError;

static BACKGROUND: Lazy<Runtime> = Lazy::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("rtermtel-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => panic!("failed to start background runtime: {err}"),
    }
});

/// Handle of the background runtime.
pub fn background() -> &'static Handle {
    BACKGROUND.handle()
}

/// Runs `future` on the background runtime and waits for its output.
///
/// The returned future can be awaited from any scheduler, including a
/// throwaway current-thread runtime.
pub async fn run_in_background<F>(future: F) -> Result<F::Output, SessionError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    background()
        .spawn(future)
        .await
        .map_err(|e| SessionError::Runtime(e.to_string()))
}

/// Lifecycle of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    StopRequested,
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::StopRequested,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves forward only; a late `Running` never overwrites a stop request.
    fn advance(&self, to: WorkerState) {
        self.0.fetch_max(to as u8, Ordering::AcqRel);
    }
}

/// Cooperative stop flag handed to a worker body.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn requested(&mut self) {
        // An error means the worker handle is gone, which is a stop as well.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleeps for `duration` unless a stop is requested first.
    ///
    /// Returns `false` if the sleep was cut short by a stop request.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.requested() => {}
        }
        !self.is_requested()
    }
}

/// A named background task with a bounded stop.
#[derive(Debug)]
pub struct Worker {
    name: String,
    state: Arc<StateCell>,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on the background runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let state = Arc::new(StateCell::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let signal = StopSignal { rx: stop_rx };

        let task_state = state.clone();
        let task_name = name.clone();
        let handle = background().spawn(async move {
            task_state.advance(WorkerState::Running);
            debug!("worker {} running", task_name);
            body(signal).await;
            task_state.advance(WorkerState::Stopped);
            debug!("worker {} stopped", task_name);
        });

        Self {
            name,
            state,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// True until a stop has been requested or the body has returned.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), WorkerState::Idle | WorkerState::Running)
    }

    /// Flags the worker to stop at its next check point.
    pub fn request_stop(&self) {
        self.state.advance(WorkerState::StopRequested);
        let _ = self.stop_tx.send(true);
    }

    /// Requests a stop and waits at most `timeout` for the body to return.
    ///
    /// Returns `true` if the worker exited on its own. On timeout the task is
    /// aborted and `false` is returned; the worker is `Stopped` either way.
    pub async fn stop(mut self, timeout: Duration) -> bool {
        self.request_stop();
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        let clean = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("worker {} ended abnormally: {}", self.name, e);
                true
            }
            Err(_) => {
                warn!(
                    "worker {} did not stop within {:?}, aborting",
                    self.name, timeout
                );
                handle.abort();
                false
            }
        };
        self.state.advance(WorkerState::Stopped);
        clean
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn stop_interrupts_a_long_sleep() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let counter = cycles.clone();
        let worker = Worker::spawn("sleeper", move |mut stop| async move {
            while stop.sleep(Duration::from_secs(3600)).await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.is_running());

        let started = std::time::Instant::now();
        assert!(worker.stop(Duration::from_secs(2)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(cycles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stuck_worker_is_aborted_after_timeout() {
        let worker = Worker::spawn("stuck", |_stop| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let state = worker.state.clone();

        assert!(!worker.stop(Duration::from_millis(50)).await);
        assert_eq!(state.get(), WorkerState::Stopped);
    }

    #[test]
    fn state_never_moves_backwards() {
        let cell = StateCell::default();
        cell.advance(WorkerState::StopRequested);
        cell.advance(WorkerState::Running);
        assert_eq!(cell.get(), WorkerState::StopRequested);
    }

    #[test]
    fn run_in_background_works_without_a_caller_runtime() {
        let rt = Builder::new_current_thread().enable_all().build().expect("rt");
        let value = rt
            .block_on(run_in_background(async { 40 + 2 }))
            .expect("background result");
        assert_eq!(value, 42);
    }
}
