pub mod autotest;
pub mod binder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod loader;
pub mod metrics;
pub mod service;
pub mod session;
pub mod store;
pub mod template;

pub use autotest::{AutotestSettings, AutotestSummary, TEST_MAX_ROWS};
pub use binder::{bind, Arg, RequestParams};
pub use catalog::{DocParam, QueryDescription, TreeNode};
pub use config::{Config, LogFormat};
pub use error::{Error, Result};
pub use executor::{ExecutorSettings, QueryExecutor, QueryOutput};
pub use http::{router, HttpOptions};
pub use loader::{QueryTable, TemplateLoader};
pub use service::Service;
pub use session::{SessionGrant, SessionStore, SessionSweeper};
pub use store::{MemoryStore, PgStore, Row, StoreBackend, StoreMode};
pub use template::{compile, Query, TestPass, TestReport};
