mod json;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::binder::{bind, RequestParams};
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::StoreBackend;
use crate::template::Query;

pub(crate) use self::json::rows_to_json;

/// Serialized result rows and how many rows went into them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutput {
    pub json: Vec<u8>,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_timeout: Duration,
    /// Replace store errors with [`Error::Database`].
    pub mute_errors: bool,
    pub filter_in_params: bool,
    pub filter_out_params: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            mute_errors: true,
            filter_in_params: true,
            filter_out_params: true,
        }
    }
}

#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<dyn StoreBackend>,
    settings: ExecutorSettings,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn StoreBackend>, settings: ExecutorSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn StoreBackend> {
        &self.store
    }

    /// Binds `params`, runs the query and converts up to `limit` rows
    /// (0 = unlimited).
    ///
    /// The store call runs on its own task and races caller cancellation and
    /// the query deadline. When it loses, the task is left to finish on its
    /// own and its result is dropped.
    pub async fn execute(
        &self,
        query: &Arc<Query>,
        mut params: RequestParams,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<QueryOutput> {
        if let Some(err) = &query.error {
            return Err(err.clone());
        }

        let args = bind(&query.params, &mut params, self.settings.filter_in_params)?;
        let timeout = query.effective_timeout(self.settings.default_timeout);
        let start = Instant::now();

        let store = Arc::clone(&self.store);
        let task_query = Arc::clone(query);
        let filter_out = self.settings.filter_out_params;
        let handle = tokio::spawn(async move {
            let keep = filter_out.then_some(&task_query.out_params);
            rows_to_json(store.fetch(&task_query.body, &args), limit, keep).await
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
            joined = handle => match joined {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(self.store_error(&query.name, err)),
                Err(join_err) => Err(Error::Internal(format!("Query task failed: {}", join_err))),
            },
        };

        metrics::record_query_executed(&query.name);
        metrics::record_query_duration(&query.name, start);
        if let Err(err) = &outcome {
            metrics::record_query_error(err.kind());
            debug!(query = %query.name, error = %err, "Query failed");
        }

        outcome
    }

    fn store_error(&self, name: &str, err: Error) -> Error {
        if self.settings.mute_errors {
            debug!(query = %name, error = %err, "Muting store error");
            Error::Database
        } else {
            err.with_query(name)
        }
    }
}
