//! Async Handle table: bookkeeping for `run_async` dispatch.
//!
//! A task marked `run_async` is spawned rather than awaited inline; the
//! Processor gets back an opaque handle it stores in a variable, and the
//! `wait_for` chip later exchanges that handle for the task's result. The
//! table is owned by one Processor scope: if the scope unwinds (an error,
//! a `return`, a `terminate`) before every handle is waited on, the table's
//! `Drop` aborts whatever is still outstanding rather than leaking it.

use crate::error::{ReasonChipError, Site};
use crate::value::Value;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Opaque token returned to pipeline authors in place of a task's result
/// when `run_async: true`. Serializes to a plain string so it can be
/// stored in the variable context like any other value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncHandleId(Uuid);

impl AsyncHandleId {
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for AsyncHandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AsyncHandleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AsyncHandleId(Uuid::parse_str(s)?))
    }
}

#[derive(Default)]
pub struct AsyncHandleTable {
    running: HashMap<Uuid, JoinHandle<Result<Value, ReasonChipError>>>,
}

impl AsyncHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` and hand back an opaque id for later `wait_for`.
    pub fn spawn<F>(&mut self, fut: F) -> AsyncHandleId
    where
        F: Future<Output = Result<Value, ReasonChipError>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.running.insert(id, tokio::spawn(fut));
        AsyncHandleId(id)
    }

    /// Consume the handle and await its result. Returns `UnknownAsyncHandle`
    /// if `handle` was never spawned here or has already been waited on.
    pub async fn wait_for(&mut self, handle: AsyncHandleId) -> Result<Value, ReasonChipError> {
        let join = self.running.remove(&handle.0).ok_or_else(|| ReasonChipError::UnknownAsyncHandle {
            site: Site::default(),
            handle: handle.to_string(),
        })?;
        match join.await {
            Ok(result) => result,
            Err(join_err) => Err(ReasonChipError::AsyncTaskPanicked {
                site: Site::default(),
                detail: join_err.to_string(),
            }),
        }
    }

    pub fn is_outstanding(&self, handle: &AsyncHandleId) -> bool {
        self.running.contains_key(&handle.0)
    }

    pub fn outstanding_count(&self) -> usize {
        self.running.len()
    }
}

impl Drop for AsyncHandleTable {
    fn drop(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_then_wait_returns_result() {
        let mut table = AsyncHandleTable::new();
        let id = table.spawn(async { Ok(Value::Int(42)) });
        assert_eq!(table.wait_for(id).await.unwrap(), Value::Int(42));
    }

    #[tokio::test]
    async fn waiting_twice_is_an_error() {
        let mut table = AsyncHandleTable::new();
        let id = table.spawn(async { Ok(Value::Int(1)) });
        table.wait_for(id).await.unwrap();
        assert!(table.wait_for(id).await.is_err());
    }

    #[tokio::test]
    async fn drop_aborts_outstanding_handles() {
        let mut table = AsyncHandleTable::new();
        let _id = table.spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        assert_eq!(table.outstanding_count(), 1);
        drop(table);
        // Dropping aborts the join handle; nothing left to assert on
        // beyond the table going out of scope without panicking or hanging.
    }
}
