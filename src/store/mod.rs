mod memory;
mod postgres;

pub use self::memory::{MemoryStore, Scripted};
pub use self::postgres::{PgStore, PgStoreConfig};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::binder::Arg;
use crate::error::Result;

/// One result row: column name and value, in select-list order.
pub type Row = Vec<(String, Value)>;

/// Rows are pulled lazily; dropping the stream stops reading.
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreMode {
    #[default]
    Mock,
    Postgres,
}

#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn mode(&self) -> StoreMode;

    /// Runs `sql` with `args` bound to `$1..$N`.
    fn fetch<'a>(&'a self, sql: &'a str, args: &'a [Arg]) -> RowStream<'a>;

    async fn ping(&self) -> Result<()>;
}
