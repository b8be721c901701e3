use std::{
    borrow::Cow,
    fmt::{self, Display},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

use crate::shutdown::Shutdown;

/// Errors that can occur when joining [`Task`]s.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Static task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// The service's standard way of handling structured task concurrency and
/// shutdown.
///
/// - The given tasks are intended to run until the end of the program
///   lifetime (scheduler jobs, the chain monitor, the lease reaper). To
///   prevent partial failures, this helper triggers a shutdown if any task
///   finishes prematurely.
/// - All task handles are polled to ensure that any panics are propagated.
/// - After a shutdown signal is received, this helper waits for all remaining
///   tasks to complete, up to a `shutdown_timeout`.
///
/// # Errors
///
/// - If a task finishes prematurely, an error is returned.
/// - If some tasks hang after the shutdown signal, an error is returned.
///
/// NOTE: To propagate panics beyond this function, the callsite must still
/// poll the future returned here, and so on up to the top-level future!
pub async fn try_join_tasks_and_shutdown(
    tasks: Vec<Task<()>>,
    mut shutdown: Shutdown,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    // We want to return only after the shutdown signal is complete so outer
    // layers don't assume that we finished prematurely.
    if tasks.is_empty() {
        shutdown.recv().await;
        return Ok(());
    }

    let mut tasks = tasks
        .into_iter()
        .map(Task::logged)
        .collect::<FuturesUnordered<_>>();

    let mut result = Ok(());

    // Wait for a shutdown signal while polling all tasks.
    loop {
        tokio::select! {
            // Mitigate possible select! race after a shutdown signal is sent
            biased;
            () = shutdown.recv() => break,
            Some(name) = tasks.next() => {
                // A task finished prematurely. Set our result to an error,
                // initiate a shutdown, and wait on the remaining tasks.
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    let shutdown_timeout_fut = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_timeout_fut);

    while !tasks.is_empty() {
        tokio::select! {
            Some(_name) = tasks.next() => (),
            () = &mut shutdown_timeout_fut => {
                let hung_tasks = tasks
                    .iter()
                    .map(|task| task.name().to_owned())
                    .collect::<Vec<_>>();

                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    result
}

/// Shorthand to call [`try_join_tasks_and_shutdown`] and log any errors,
/// useful when the callsite needs a `Future<Output = ()> + Send + 'static`.
pub async fn join_tasks_and_shutdown(
    name: &str,
    tasks: Vec<Task<()>>,
    shutdown: Shutdown,
    shutdown_timeout: Duration,
) {
    let result =
        try_join_tasks_and_shutdown(tasks, shutdown, shutdown_timeout).await;

    match result {
        Ok(()) => info!("{name} tasks finished."),
        Err(e) => error!("{name} tasks errored: {e:#}"),
    }
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of catching them
/// (2) adds the `#[must_use]` lint to ensure that all spawned tasks are joined
///     or explicitly annotated that no joining is required. Use
///     [`Task::detach`] to make it clear that the spawned task should be
///     detached from the handle. Once detached, a task can't be joined.
///
/// The goal is to encourage structured concurrency by joining all spawned
/// tasks: saner control flow, no zombie tasks, and panics that actually
/// propagate instead of being silently swallowed.
///
/// [`Task`] also includes a task name for improved debuggability.
#[must_use]
pub struct Task<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

/// A [`Future`] that wraps [`Task`] so its result is logged when it finishes.
/// The inner `T` is discarded and the [`Future::Output`] is mapped to its
/// name.
pub struct LoggedTask<T>(Task<T>);

// Provides a [`Display`] impl for the result of a finished task.
struct TaskOutputDisplay<'a> {
    name: &'a str,
    result: Result<(), &'a JoinError>,
}

// --- impl Task --- //

impl<T> Task<T> {
    /// Spawns a named task which inherits from the current span.
    /// This is generally what you want to use.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> Task<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        // Instrument the future so that the current tracing span propagates
        // past spawn boundaries.
        let span = tracing::Span::current();
        let name = name.into();
        debug!("Spawning task: {name}");
        Task {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Spawns a task without a name. Use this primarily for trivial tasks
    /// where you don't care about joining later.
    #[inline]
    pub fn spawn_unnamed<F>(future: F) -> Task<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self::spawn(String::new(), future)
    }

    /// Drop the task handle, detaching it so it continues running in the
    /// background. Without a handle, you can no longer `.await` the task
    /// itself to get the output.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls [`is_finished`] on the underlying [`JoinHandle`].
    ///
    /// [`is_finished`]: tokio::task::JoinHandle::is_finished
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Instrument a [`Task`] so that its result is logged when it finishes.
    /// The [`Task`]'s [`Future::Output`] is also mapped to the task name.
    #[inline]
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // If the inner spawned task panicked, then propagate the panic
                // to the `Task` poller.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

// --- impl LoggedTask --- //

impl<T> LoggedTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl<T> Future for LoggedTask<T> {
    type Output = Cow<'static, str>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let mut log_error = false;
            let mut log_warn = false;

            match &result {
                Ok(_) => (),
                Err(e) if e.is_cancelled() => log_warn = true,
                Err(e) if e.is_panic() => log_error = true,
                _ => log_warn = true,
            };

            let msg = TaskOutputDisplay {
                name: self.name(),
                result: result.as_ref().map(|_| ()),
            };

            if log_error {
                error!("{msg}")
            } else if log_warn {
                warn!("{msg}")
            } else {
                info!("{msg}")
            }

            self.0.name.clone()
        })
    }
}

// --- impl TaskOutputDisplay --- //

impl Display for TaskOutputDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join_label = match &self.result {
            Ok(_) => "finished",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(e) if e.is_panic() => "panicked",
            _ => "(unknown join error)",
        };

        // "Task '<name>' <finished|cancelled|panicked>: [<error>]"
        let name = self.name;
        write!(f, "Task '{name}' {join_label}")?;

        if let Err(e) = self.result {
            write!(f, ": {e:#}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_value() {
        let task = Task::spawn("answer", async { 42 });
        assert_eq!(task.await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn premature_finish_is_an_error() {
        let shutdown = Shutdown::new();
        let tasks = vec![Task::spawn("early bird", async {})];
        let result = try_join_tasks_and_shutdown(
            tasks,
            shutdown,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(Error::PrematureFinish { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_shutdown() {
        let shutdown = Shutdown::new();
        let mut task_shutdown = shutdown.clone();
        let tasks = vec![Task::spawn("well behaved", async move {
            task_shutdown.recv().await;
        })];
        shutdown.send();
        let result = try_join_tasks_and_shutdown(
            tasks,
            shutdown,
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_ok());
    }
}
