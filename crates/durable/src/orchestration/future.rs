//! Join combinators and typed futures for orchestrator code
//!
//! Completions are delivered to the orchestrator one event at a time, in
//! history order, with a poll after each. A join therefore observes its
//! children resolving in the same order on every replay.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::DurableFuture;
use super::{AggregateError, TaskError};
use crate::history::{error_types, FailureDetails};

/// Wait for every future; outputs are returned in input order
pub struct WhenAll<F: Future> {
    futures: Vec<Pin<Box<F>>>,
    outputs: Vec<Option<F::Output>>,
}

impl<F: Future> WhenAll<F> {
    pub(crate) fn new(futures: Vec<F>) -> Self {
        let outputs = futures.iter().map(|_| None).collect();
        Self {
            futures: futures.into_iter().map(Box::pin).collect(),
            outputs,
        }
    }
}

// Children are boxed-pinned and outputs are never pinned, so moving the join is sound
impl<F: Future> Unpin for WhenAll<F> {}

impl<F: Future> Future for WhenAll<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;

        for (fut, slot) in this.futures.iter_mut().zip(this.outputs.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            match fut.as_mut().poll(cx) {
                Poll::Ready(output) => *slot = Some(output),
                Poll::Pending => all_done = false,
            }
        }

        if !all_done {
            return Poll::Pending;
        }

        Poll::Ready(this.outputs.iter_mut().filter_map(Option::take).collect())
    }
}

/// Wait for every task; fail with all task errors if any failed
///
/// Never short-circuits: the join resolves only after every child has.
pub struct TryWhenAll<F: Future> {
    inner: WhenAll<F>,
}

impl<F: Future> TryWhenAll<F> {
    pub(crate) fn new(futures: Vec<F>) -> Self {
        Self {
            inner: WhenAll::new(futures),
        }
    }
}

impl<F, T> Future for TryWhenAll<F>
where
    F: Future<Output = Result<T, TaskError>>,
{
    type Output = Result<Vec<T>, AggregateError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outputs = match Pin::new(&mut self.get_mut().inner).poll(cx) {
            Poll::Ready(outputs) => outputs,
            Poll::Pending => return Poll::Pending,
        };

        let mut values = Vec::with_capacity(outputs.len());
        let mut failures = Vec::new();
        for (index, output) in outputs.into_iter().enumerate() {
            match output {
                Ok(value) => values.push(value),
                Err(err) => failures.push((index, err)),
            }
        }

        if failures.is_empty() {
            Poll::Ready(Ok(values))
        } else {
            Poll::Ready(Err(AggregateError { failures }))
        }
    }
}

/// Wait for the first future to complete
///
/// Yields the index of the winner and its output. If several children are
/// already complete when the join is first polled, the lowest index wins.
/// Losing children are dropped; their completions still land in history.
pub struct WhenAny<F: Future> {
    futures: Vec<Pin<Box<F>>>,
}

impl<F: Future> WhenAny<F> {
    pub(crate) fn new(futures: Vec<F>) -> Self {
        Self {
            futures: futures.into_iter().map(Box::pin).collect(),
        }
    }
}

impl<F: Future> Future for WhenAny<F> {
    type Output = (usize, F::Output);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (index, fut) in this.futures.iter_mut().enumerate() {
            if let Poll::Ready(output) = fut.as_mut().poll(cx) {
                return Poll::Ready((index, output));
            }
        }
        Poll::Pending
    }
}

/// Activity or sub-orchestration future with a deserialized output
pub struct TypedFuture<O> {
    inner: DurableFuture<Result<Value, TaskError>>,
    _output: PhantomData<fn() -> O>,
}

impl<O> TypedFuture<O> {
    pub(crate) fn new(inner: DurableFuture<Result<Value, TaskError>>) -> Self {
        Self {
            inner,
            _output: PhantomData,
        }
    }

    /// Correlation id of the underlying task
    pub fn id(&self) -> Option<u64> {
        self.inner.id()
    }
}

impl<O: DeserializeOwned> Future for TypedFuture<O> {
    type Output = Result<O, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let value = match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(Ok(value)) => value,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        };

        Poll::Ready(serde_json::from_value(value).map_err(|e| TaskError {
            task_id: this.inner.id().unwrap_or_default(),
            name: this.inner.name().to_string(),
            failure: FailureDetails::new(error_types::SERIALIZATION, e.to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(noop_waker_ref());
        Pin::new(fut).poll(&mut cx)
    }

    fn ready<T>(value: T) -> std::future::Ready<T> {
        std::future::ready(value)
    }

    #[test]
    fn test_when_all_preserves_input_order() {
        let mut join = WhenAll::new(vec![ready(1), ready(4), ready(9)]);

        assert_eq!(poll_once(&mut join), Poll::Ready(vec![1, 4, 9]));
    }

    #[test]
    fn test_when_all_waits_for_pending_child() {
        let futures: Vec<Pin<Box<dyn Future<Output = i32> + Send>>> = vec![
            Box::pin(ready(1)),
            Box::pin(std::future::pending()),
        ];
        let mut join = WhenAll::new(futures);

        assert!(poll_once(&mut join).is_pending());
    }

    #[test]
    fn test_try_when_all_collects_every_failure() {
        let failure = |id| TaskError {
            task_id: id,
            name: "square".to_string(),
            failure: FailureDetails::new("Boom", "exploded"),
        };
        let mut join = TryWhenAll::new(vec![
            ready(Err(failure(0))),
            ready(Ok(4)),
            ready(Err(failure(2))),
        ]);

        match poll_once(&mut join) {
            Poll::Ready(Err(err)) => {
                let positions: Vec<usize> = err.failures.iter().map(|(i, _)| *i).collect();
                assert_eq!(positions, vec![0, 2]);
            }
            other => panic!("unexpected poll result: {:?}", other),
        }
    }

    #[test]
    fn test_when_any_returns_first_ready_index() {
        let futures: Vec<Pin<Box<dyn Future<Output = &str> + Send>>> = vec![
            Box::pin(std::future::pending()),
            Box::pin(ready("timer")),
        ];
        let mut race = WhenAny::new(futures);

        assert_eq!(poll_once(&mut race), Poll::Ready((1, "timer")));
    }
}
