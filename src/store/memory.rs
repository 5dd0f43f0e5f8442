use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use parking_lot::{Mutex, RwLock};

use super::{Row, RowStream, StoreBackend, StoreMode};
use crate::binder::Arg;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum Scripted {
    Rows(Vec<Row>),
    Error(String),
}

#[derive(Debug, Clone)]
struct Response {
    outcome: Scripted,
    delay: Option<Duration>,
}

/// In-process backend that answers each SQL text with a scripted response.
/// Unscripted SQL returns no rows.
#[derive(Default)]
pub struct MemoryStore {
    responses: RwLock<HashMap<String, Response>>,
    calls: Mutex<HashMap<String, usize>>,
    last_args: Mutex<HashMap<String, Vec<Arg>>>,
    rows_pulled: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_rows(&self, sql: impl Into<String>, rows: Vec<Row>) -> &Self {
        self.script(sql, Scripted::Rows(rows), None)
    }

    pub fn script_error(&self, sql: impl Into<String>, message: impl Into<String>) -> &Self {
        self.script(sql, Scripted::Error(message.into()), None)
    }

    pub fn script(
        &self,
        sql: impl Into<String>,
        outcome: Scripted,
        delay: Option<Duration>,
    ) -> &Self {
        self.responses
            .write()
            .insert(sql.into(), Response { outcome, delay });
        self
    }

    pub fn calls(&self, sql: &str) -> usize {
        self.calls.lock().get(sql).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn last_args(&self, sql: &str) -> Option<Vec<Arg>> {
        self.last_args.lock().get(sql).cloned()
    }

    /// Rows handed out across all streams so far.
    pub fn rows_pulled(&self) -> usize {
        self.rows_pulled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Mock
    }

    fn fetch<'a>(&'a self, sql: &'a str, args: &'a [Arg]) -> RowStream<'a> {
        *self.calls.lock().entry(sql.to_string()).or_insert(0) += 1;
        self.last_args.lock().insert(sql.to_string(), args.to_vec());

        let response = self.responses.read().get(sql).cloned().unwrap_or(Response {
            outcome: Scripted::Rows(Vec::new()),
            delay: None,
        });

        let body: RowStream<'a> = match response.outcome {
            Scripted::Rows(rows) => {
                let pulled = Arc::clone(&self.rows_pulled);
                stream::iter(rows)
                    .map(move |row| {
                        pulled.fetch_add(1, Ordering::Relaxed);
                        Ok(row)
                    })
                    .boxed()
            }
            Scripted::Error(message) => {
                stream::once(future::ready(Err(Error::Execution(message)))).boxed()
            }
        };

        match response.delay {
            Some(delay) => stream::once(tokio::time::sleep(delay))
                .filter_map(|_| future::ready(None))
                .chain(body)
                .boxed(),
            None => body,
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
