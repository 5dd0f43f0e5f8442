use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autotest::{self, AutotestSettings};
use crate::binder::RequestParams;
use crate::catalog::{QueryDescription, TreeNode};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{ExecutorSettings, QueryExecutor, QueryOutput};
use crate::loader::TemplateLoader;
use crate::session::{SessionGrant, SessionStore, SessionSweeper};
use crate::store::StoreBackend;
use crate::template::Query;

const NO_DATA: &str = "No data";

struct Auth {
    store: Arc<SessionStore>,
    sweeper: tokio::sync::Mutex<SessionSweeper>,
    login_query: String,
    logout_query: Option<String>,
}

/// Everything a request needs: the frozen query table, the executor and,
/// when login is required, the session store.
pub struct Service {
    queries: Arc<HashMap<String, Arc<Query>>>,
    executor: QueryExecutor,
    auth: Option<Auth>,
}

impl Service {
    /// Loads templates, runs the self-test when enabled, starts the session
    /// sweeper when login is required, then freezes the query table.
    pub async fn build(config: &Config, store: Arc<dyn StoreBackend>) -> Result<Self> {
        let executor = QueryExecutor::new(
            store,
            ExecutorSettings {
                default_timeout: config.database.query_timeout(),
                mute_errors: config.database.mute_errors,
                filter_in_params: config.database.filter_in_params,
                filter_out_params: config.database.filter_out_params,
            },
        );

        let mut table = TemplateLoader::new(&config.templates.root)
            .with_extension(&config.templates.extension)
            .lenient(config.templates.ignore_errors)
            .load()?;

        if config.autotest.enabled {
            let settings = AutotestSettings {
                workers: config.autotest.workers,
                ignore_errors: config.templates.ignore_errors,
            };
            autotest::run(&mut table, &executor, &settings).await?;
        }

        let auth = if config.sessions.login_required {
            let store = Arc::new(SessionStore::new(config.sessions.lifetime()));
            let sweeper = SessionSweeper::start(Arc::clone(&store))?;
            Some(Auth {
                store,
                sweeper: tokio::sync::Mutex::new(sweeper),
                login_query: config.sessions.login_query.clone(),
                logout_query: config.sessions.logout_query().map(str::to_string),
            })
        } else {
            None
        };

        if let Some(auth) = &auth {
            if !table.contains_key(&auth.login_query) {
                warn!(query = %auth.login_query, "Login query is not loaded");
            }
        }

        let queries: HashMap<String, Arc<Query>> = table
            .into_iter()
            .map(|(name, query)| (name, Arc::new(query)))
            .collect();
        info!(
            queries = queries.len(),
            login_required = auth.is_some(),
            "Service ready"
        );

        Ok(Self {
            queries: Arc::new(queries),
            executor,
            auth,
        })
    }

    pub fn login_required(&self) -> bool {
        self.auth.is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Query>> {
        self.queries.get(name)
    }

    pub fn query_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn sessions(&self) -> Option<&Arc<SessionStore>> {
        self.auth.as_ref().map(|a| &a.store)
    }

    pub async fn run_query(
        &self,
        name: &str,
        params: RequestParams,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<QueryOutput> {
        let query = self
            .queries
            .get(name)
            .ok_or_else(|| Error::QueryNotFound(name.to_string()))?;
        self.executor.execute(query, params, limit, cancel).await
    }

    /// Gate for direct query calls. Login and logout queries are only
    /// reachable through [`Service::login`] and [`Service::logout`].
    pub fn authorize(&self, name: &str, auth_key: Option<&str>) -> Result<()> {
        let Some(auth) = &self.auth else {
            return Ok(());
        };
        if name == auth.login_query || auth.logout_query.as_deref() == Some(name) {
            return Err(Error::Forbidden(
                "Calling this query directly is prohibited.".to_string(),
            ));
        }
        let key = auth_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Unauthorized("No session key".to_string()))?;
        if !auth.store.check(key) {
            return Err(Error::Unauthorized("Session key is invalid".to_string()));
        }
        Ok(())
    }

    /// Runs the login query and opens a session when it returns any rows.
    pub async fn login(
        &self,
        params: RequestParams,
        cancel: &CancellationToken,
    ) -> Result<(QueryOutput, SessionGrant)> {
        let auth = self.auth_enabled()?;
        let output = self
            .run_query(&auth.login_query, params, 0, cancel)
            .await
            .map_err(|e| Error::Forbidden(e.to_string()))?;
        if output.rows == 0 {
            return Err(Error::Forbidden(NO_DATA.to_string()));
        }

        let grant = auth
            .store
            .create()
            .map_err(|e| Error::Forbidden(e.to_string()))?;
        info!(expires_at = %grant.expires_at, "Session opened");
        Ok((output, grant))
    }

    /// Runs the logout query, if one is configured, then drops the session.
    pub async fn logout(
        &self,
        auth_key: Option<&str>,
        params: RequestParams,
        cancel: &CancellationToken,
    ) -> Result<Option<QueryOutput>> {
        let auth = self.auth_enabled()?;
        let key = auth_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Unauthorized("No session key".to_string()))?;

        let output = match &auth.logout_query {
            Some(name) => {
                let output = self
                    .run_query(name, params, 0, cancel)
                    .await
                    .map_err(|e| Error::Forbidden(e.to_string()))?;
                if output.rows == 0 {
                    return Err(Error::Forbidden(NO_DATA.to_string()));
                }
                Some(output)
            }
            None => None,
        };

        auth.store.logout(key);
        Ok(output)
    }

    fn auth_enabled(&self) -> Result<&Auth> {
        self.auth
            .as_ref()
            .ok_or_else(|| Error::InvalidRequest("Login is not enabled".to_string()))
    }

    pub fn describe(&self) -> TreeNode {
        TreeNode::build(self.queries.values().map(Arc::as_ref))
    }

    pub fn describe_query(&self, name: &str) -> Option<QueryDescription> {
        self.queries
            .get(name)
            .map(|q| QueryDescription::describe(q))
    }

    pub async fn health(&self) -> Result<()> {
        self.executor.store().ping().await
    }

    /// Stops the session sweeper and waits for it to exit.
    pub async fn shutdown(&self) {
        if let Some(auth) = &self.auth {
            auth.sweeper.lock().await.stop().await;
        }
        info!("Service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn templates(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, body).unwrap();
        }
        dir
    }

    fn config(root: &TempDir, login_required: bool) -> Config {
        let mut config = Config::default();
        config.templates.root = root.path().to_path_buf();
        config.sessions.login_required = login_required;
        config
    }

    #[tokio::test]
    async fn test_run_query_not_found() {
        let root = templates(&[("a.sql", "SELECT 1")]);
        let service = Service::build(&config(&root, false), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let err = service
            .run_query("missing", RequestParams::new(), 0, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, Error::QueryNotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_build_rejects_huge_lifetime() {
        let root = templates(&[("login.sql", "SELECT 1")]);
        let mut cfg = config(&root, true);
        cfg.sessions.lifetime_secs = u64::MAX;

        match Service::build(&cfg, Arc::new(MemoryStore::new())).await {
            Err(Error::Config(msg)) => assert!(msg.contains("too large")),
            Err(other) => panic!("Expected Config error, got {:?}", other),
            Ok(_) => panic!("Expected build to fail"),
        }
    }

    #[tokio::test]
    async fn test_authorize_without_login() {
        let root = templates(&[("a.sql", "SELECT 1")]);
        let service = Service::build(&config(&root, false), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        assert!(service.authorize("a", None).is_ok());
        assert!(service.sessions().is_none());
    }

    #[tokio::test]
    async fn test_login_flow() {
        let root = templates(&[
            ("login.sql", "SELECT id FROM users WHERE name = :name"),
            ("data.sql", "SELECT 1"),
        ]);
        let store = Arc::new(MemoryStore::new());
        store.script_rows(
            "SELECT id FROM users WHERE name = $1",
            vec![vec![("id".to_string(), json!(1))]],
        );
        let mut cfg = config(&root, true);
        cfg.database.filter_out_params = false;
        let service = Service::build(&cfg, store).await.unwrap();
        let cancel = CancellationToken::new();

        assert!(matches!(
            service.authorize("login", None),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            service.authorize("data", None),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            service.authorize("data", Some("bogus")),
            Err(Error::Unauthorized(_))
        ));

        let (output, grant) = service
            .login(RequestParams::from_pairs([("name", "ann")]), &cancel)
            .await
            .unwrap();
        assert_eq!(output.rows, 1);
        assert!(service.authorize("data", Some(grant.token.as_str())).is_ok());

        let out = service
            .logout(Some(grant.token.as_str()), RequestParams::new(), &cancel)
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(matches!(
            service.authorize("data", Some(grant.token.as_str())),
            Err(Error::Unauthorized(_))
        ));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_without_rows_is_forbidden() {
        let root = templates(&[("login.sql", "SELECT id FROM users WHERE name = :name")]);
        let service = Service::build(&config(&root, true), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let err = service
            .login(
                RequestParams::from_pairs([("name", "nobody")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err, Error::Forbidden(NO_DATA.to_string()));
        assert_eq!(service.sessions().unwrap().len(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_logout_query_must_return_rows() {
        let root = templates(&[
            ("login.sql", "SELECT 1 AS ok"),
            ("bye.sql", "SELECT nothing"),
        ]);
        let store = Arc::new(MemoryStore::new());
        store.script_rows("SELECT 1 AS ok", vec![vec![("ok".to_string(), json!(1))]]);
        let mut cfg = config(&root, true);
        cfg.sessions.logout_query = "bye".to_string();
        let service = Service::build(&cfg, store).await.unwrap();
        let cancel = CancellationToken::new();

        let (_, grant) = service.login(RequestParams::new(), &cancel).await.unwrap();
        assert!(matches!(
            service.authorize("bye", Some(grant.token.as_str())),
            Err(Error::Forbidden(_))
        ));

        let err = service
            .logout(Some(grant.token.as_str()), RequestParams::new(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Forbidden(NO_DATA.to_string()));
        assert!(service.sessions().unwrap().check(&grant.token));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_disabled() {
        let root = templates(&[("login.sql", "SELECT 1")]);
        let service = Service::build(&config(&root, false), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let err = service
            .login(RequestParams::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_autotest_failure_aborts_build() {
        let root = templates(&[("empty.sql", "-- #testpass: rows ##\nSELECT nothing")]);
        let mut cfg = config(&root, false);
        cfg.autotest.enabled = true;

        let result = Service::build(&cfg, Arc::new(MemoryStore::new())).await;

        assert!(matches!(result, Err(Error::Autotest(_))));
    }

    #[tokio::test]
    async fn test_describe_lists_queries() {
        let root = templates(&[("a.sql", "SELECT 1"), ("dir/b.sql", "SELECT 2")]);
        let service = Service::build(&config(&root, false), Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        assert_eq!(service.query_names(), vec!["a", "dir/b"]);
        let tree = service.describe();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].name, "dir");
        assert!(service.describe_query("dir/b").is_some());
        assert!(service.describe_query("nope").is_none());
        assert!(service.health().await.is_ok());
    }
}
