//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Producers handed to the cache must be `'static`. Use [`Calls::producer`] and friends to
//!    create producers that count how often they actually ran, and hold on to the [`Calls`]
//!    to assert on that count afterwards.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `flightcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("flightcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error returned by failing test producers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("test producer failed: {0}")]
pub struct TestError(pub String);

/// Counts the invocations of the producers created from it.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often producers created from this counter were invoked.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// A producer returning `value` right away.
    pub fn producer<T>(
        &self,
        value: T,
    ) -> impl FnOnce() -> std::future::Ready<Result<T, TestError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = self.clone();
        move || {
            calls.record();
            std::future::ready(Ok(value))
        }
    }

    /// A producer returning `value` after sleeping for `delay`.
    ///
    /// This stands in for a slow database query.
    pub fn slow_producer<T>(
        &self,
        delay: Duration,
        value: T,
    ) -> impl FnOnce() -> SlowProducer<T> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = self.clone();
        move || {
            calls.record();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })
        }
    }

    /// A producer failing with `message`.
    pub fn failing_producer<T>(
        &self,
        message: &str,
    ) -> impl FnOnce() -> std::future::Ready<Result<T, TestError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = self.clone();
        let message = message.to_owned();
        move || {
            calls.record();
            std::future::ready(Err(TestError(message)))
        }
    }

    /// A producer failing with `message` after sleeping for `delay`.
    pub fn slow_failing_producer<T>(
        &self,
        delay: Duration,
        message: &str,
    ) -> impl FnOnce() -> SlowProducer<T> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = self.clone();
        let message = message.to_owned();
        move || {
            calls.record();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Err(TestError(message))
            })
        }
    }

    /// A producer that fails on its first invocation and returns `value` on every later one.
    ///
    /// Unlike the other producers, this one can be created any number of times from the same
    /// counter, and all of them share the "first invocation" state.
    pub fn flaky_producer<T>(
        &self,
        value: T,
    ) -> impl FnOnce() -> std::future::Ready<Result<T, TestError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = self.clone();
        move || {
            let result = match calls.record() {
                0 => Err(TestError("first invocation always fails".into())),
                _ => Ok(value),
            };
            std::future::ready(result)
        }
    }

    /// A blocking producer returning `value` after blocking the thread for `delay`.
    pub fn blocking_producer<T>(
        &self,
        delay: Duration,
        value: T,
    ) -> impl FnOnce() -> Result<T, TestError> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = self.clone();
        move || {
            calls.record();
            std::thread::sleep(delay);
            Ok(value)
        }
    }
}

/// The future returned by [`Calls::slow_producer`].
pub type SlowProducer<T> =
    std::pin::Pin<Box<dyn Future<Output = Result<T, TestError>> + Send + 'static>>;
