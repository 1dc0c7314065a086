//! Helpers for testing the resource cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - A [`FakeService`] stands in for a remote service. Wrap its [`call`](FakeService::call) in
//!    a fetch function, and assert on the number of [`calls`](FakeService::calls) to check
//!    whether the cache actually fetched.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let dir = test::tempdir();`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resource_cache` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resource_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

struct FakeState<T> {
    calls: AtomicUsize,
    response: Mutex<Result<T, String>>,
    latency: Mutex<Duration>,
}

/// A fake remote service, counting its calls.
///
/// Clones share the same state, so a clone can be moved into a fetch function while the test
/// keeps controlling the responses.
pub struct FakeService<T> {
    state: Arc<FakeState<T>>,
}

impl<T> Clone for FakeService<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone> FakeService<T> {
    /// Creates a service responding with `response` immediately.
    pub fn new(response: T) -> Self {
        Self {
            state: Arc::new(FakeState {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Ok(response)),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Delays every response by `latency`.
    ///
    /// This uses tokio timers, so it plays along with paused time.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    /// Succeeds with `response` from now on.
    pub fn respond(&self, response: T) {
        *self.state.response.lock().unwrap() = Ok(response);
    }

    /// Fails with `message` from now on.
    pub fn fail(&self, message: impl Into<String>) {
        *self.state.response.lock().unwrap() = Err(message.into());
    }

    /// The number of calls so far, including the ones still running.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Calls the service.
    ///
    /// The response is the one configured at the time of the call, even if it changes while
    /// the call is delayed.
    pub async fn call(&self) -> Result<T, String> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.state.response.lock().unwrap().clone();
        let latency = *self.state.latency.lock().unwrap();

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        response
    }
}
