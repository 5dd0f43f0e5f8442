//! Compiled SQL templates.
//!
//! A template is plain SQL with `:name` parameters and `#directive: ... ##`
//! blocks inside comments. [`compile`] turns one into a [`Query`]: the body is
//! rewritten to positional `$N` placeholders and the directives become
//! structured metadata.

mod directive;
mod duration;
mod lexer;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::binder::RequestParams;
use crate::error::Error;

pub use duration::parse_duration;
pub use lexer::{tokenize, Tokenized};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectiveParam {
    pub key: String,
    pub value: String,
}

/// Ordered key/value list where the first insert of a key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DirectiveParamList(Vec<DirectiveParam>);

impl DirectiveParamList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns false when the key was already present; the stored value is kept.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if key.is_empty() || self.contains(&key) {
            return false;
        }
        self.0.push(DirectiveParam {
            key,
            value: value.into(),
        });
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|p| p.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectiveParam> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_request_params(&self) -> RequestParams {
        let mut params = RequestParams::new();
        for p in &self.0 {
            params.append(p.key.clone(), p.value.clone());
        }
        params
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestPass {
    Ignore,
    #[default]
    NoError,
    Rows,
    OneRowOnly,
}

impl TestPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestPass::Ignore => "ignore",
            TestPass::NoError => "noerror",
            TestPass::Rows => "rows",
            TestPass::OneRowOnly => "onerowonly",
        }
    }
}

impl fmt::Display for TestPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestPass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(TestPass::Ignore),
            "noerror" => Ok(TestPass::NoError),
            "rows" => Ok(TestPass::Rows),
            "onerowonly" => Ok(TestPass::OneRowOnly),
            other => Err(format!("Invalid testpass string: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Vec<u8>,
}

impl TestReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub name: String,
    pub body: String,
    pub params: Vec<String>,
    pub description: String,
    pub in_params: DirectiveParamList,
    pub out_params: DirectiveParamList,
    pub test_params: DirectiveParamList,
    pub test_pass: TestPass,
    pub timeout: Option<Duration>,
    pub loaded_at: DateTime<Utc>,
    pub warnings: Vec<String>,
    pub error: Option<Error>,
    pub test_report: Option<TestReport>,
}

impl Query {
    fn empty(name: String) -> Self {
        Self {
            name,
            body: String::new(),
            params: Vec::new(),
            description: String::new(),
            in_params: DirectiveParamList::new(),
            out_params: DirectiveParamList::new(),
            test_params: DirectiveParamList::new(),
            test_pass: TestPass::default(),
            timeout: None,
            loaded_at: Utc::now(),
            warnings: Vec::new(),
            error: None,
            test_report: None,
        }
    }

    /// A placeholder for a template that could not be read. It is kept in the
    /// table so callers get the load error instead of "not found".
    pub fn failed(name: impl Into<String>, error: Error) -> Self {
        let mut query = Self::empty(name.into());
        query.error = Some(error);
        query
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

pub fn compile(name: impl Into<String>, source: &str) -> Query {
    let mut query = Query::empty(name.into());
    let Tokenized {
        body,
        params,
        comments,
    } = tokenize(source);
    query.body = body;
    query.params = params;
    directive::apply(&comments, &mut query);
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_rewrites_and_reads_directives() {
        let src = "-- #description: List users ##\n\
                   -- #in: id = user id; ##\n\
                   -- #out: id = user id; name = display name; ##\n\
                   -- #test: id = 1; ##\n\
                   -- #testpass: onerowonly ##\n\
                   SELECT id, name FROM users WHERE id = :id::int\n";
        let q = compile("users/get", src);

        assert_eq!(q.name, "users/get");
        assert_eq!(q.params, vec!["id".to_string()]);
        assert!(q.body.contains("WHERE id = $1::int"));
        assert!(!q.body.contains("#description"));
        assert_eq!(q.description, "List users\n");
        assert_eq!(q.in_params.get("id"), Some("user id"));
        assert_eq!(q.out_params.len(), 2);
        assert_eq!(q.test_params.get("id"), Some("1"));
        assert_eq!(q.test_pass, TestPass::OneRowOnly);
        assert!(q.warnings.is_empty());
        assert!(q.error.is_none());
    }

    #[test]
    fn test_compile_defaults() {
        let q = compile("plain", "SELECT 1");
        assert_eq!(q.test_pass, TestPass::NoError);
        assert!(q.timeout.is_none());
        assert!(q.description.is_empty());
        assert_eq!(q.body, "SELECT 1");
    }

    #[test]
    fn test_directive_param_list_first_wins() {
        let mut list = DirectiveParamList::new();
        assert!(list.insert("id", "first"));
        assert!(!list.insert("id", "second"));
        assert_eq!(list.get("id"), Some("first"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_directive_param_list_skips_empty_key() {
        let mut list = DirectiveParamList::new();
        assert!(!list.insert("", "value"));
        assert!(list.is_empty());
    }

    #[test]
    fn test_directive_param_list_to_request_params() {
        let mut list = DirectiveParamList::new();
        list.insert("a", "1");
        list.insert("b", "");
        let params = list.to_request_params();
        assert_eq!(params.first("a"), Some("1"));
        assert_eq!(params.first("b"), Some(""));
    }

    #[test]
    fn test_testpass_parse() {
        assert_eq!("ignore".parse::<TestPass>(), Ok(TestPass::Ignore));
        assert_eq!("noerror".parse::<TestPass>(), Ok(TestPass::NoError));
        assert_eq!("rows".parse::<TestPass>(), Ok(TestPass::Rows));
        assert_eq!("onerowonly".parse::<TestPass>(), Ok(TestPass::OneRowOnly));
        assert!("sometimes".parse::<TestPass>().is_err());
    }

    #[test]
    fn test_testpass_display_roundtrip_names() {
        for tp in [
            TestPass::Ignore,
            TestPass::NoError,
            TestPass::Rows,
            TestPass::OneRowOnly,
        ] {
            assert_eq!(tp.to_string().parse::<TestPass>(), Ok(tp));
        }
    }

    #[test]
    fn test_failed_query_keeps_error() {
        let q = Query::failed("broken", Error::Compile("permission denied".into()));
        assert!(q.is_failed());
        assert!(q.body.is_empty());
    }

    #[test]
    fn test_effective_timeout() {
        let mut q = compile("t", "SELECT 1");
        assert_eq!(
            q.effective_timeout(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
        q.timeout = Some(Duration::from_secs(2));
        assert_eq!(
            q.effective_timeout(Duration::from_secs(60)),
            Duration::from_secs(2)
        );
    }
}
