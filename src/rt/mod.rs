/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::fmt::Debug;
use std::{future::Future, pin::Pin, sync::Arc};

#[cfg(feature = "_runtime-tokio")]
pub(crate) mod tokio;

pub(crate) type BoxedTaskHandle = Box<dyn TaskHandle>;

/// A shared handle to the runtime in use.
pub type GrpcRuntime = Arc<dyn Runtime>;

/// An abstraction over an asynchronous runtime.
///
/// The `Runtime` trait defines the functionality the library needs for
/// executing asynchronous tasks and performing time-based operations such as
/// sleeping.  It provides a uniform interface that can be implemented for
/// various async runtimes, enabling pluggable and testable infrastructure.
///
/// LB policies use it for every timer they arm: a timer is a spawned task
/// that sleeps and then re-enters the policy, and its `TaskHandle` is the
/// cancellation handle.
pub trait Runtime: Send + Sync + Debug {
    /// Spawns the given asynchronous task to run in the background.
    fn spawn(&self, task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> BoxedTaskHandle;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: std::time::Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Sync + Future<Output = ()> {}

/// A handle to a spawned task, used to cancel it.  Aborting an already
/// finished task is a no-op, so cancellation is idempotent.
pub trait TaskHandle: Send + Sync {
    /// Abort the associated task.
    fn abort(&self);
}

/// A fake runtime to satisfy the compiler when no runtime is enabled.
///
/// # Panics
///
/// Panics if any of its functions are called.
#[derive(Default, Debug)]
pub(crate) struct NoOpRuntime {}

impl Runtime for NoOpRuntime {
    fn spawn(&self, _task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> BoxedTaskHandle {
        unimplemented!()
    }

    fn sleep(&self, _duration: std::time::Duration) -> Pin<Box<dyn Sleep>> {
        unimplemented!()
    }
}

pub(crate) fn default_runtime() -> GrpcRuntime {
    #[cfg(feature = "_runtime-tokio")]
    {
        return Arc::new(tokio::TokioRuntime {});
    }
    #[allow(unreachable_code)]
    Arc::new(NoOpRuntime::default())
}
