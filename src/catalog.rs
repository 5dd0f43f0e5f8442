//! JSON introspection of the compiled query table.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::template::{Query, TestPass};

const DECLARED_NOT_USED: &str = "Declared and not used";
const USED_NOT_DECLARED: &str = "Used but not declared";
const FIELD_NOT_FOUND: &str = "Field not found in test request";
const FIELD_NOT_DESCRIBED: &str = "Field found in test request but not described";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocParam {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<&'static str>,
}

impl DocParam {
    fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        warning: Option<&'static str>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            warning,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryDescription {
    pub name: String,
    pub description: String,
    pub in_params: Vec<DocParam>,
    pub out_params: Vec<DocParam>,
    pub load_time: String,
    pub timeout: String,
    pub parse_warnings: Vec<String>,
    pub test_pass: TestPass,
    pub test_params: Vec<DocParam>,
    pub test_duration_ms: Option<i64>,
    pub test_result: Option<Value>,
    pub error: Option<String>,
    pub has_warn: bool,
    pub has_err: bool,
}

impl QueryDescription {
    pub fn describe(query: &Query) -> Self {
        let mut has_warn = query.description.is_empty() || !query.warnings.is_empty();

        let mut in_params = Vec::new();
        for p in query.in_params.iter() {
            let warning = (!query.params.contains(&p.key)).then_some(DECLARED_NOT_USED);
            in_params.push(DocParam::new(&p.key, &p.value, warning));
        }
        for name in query.params.iter().filter(|n| !query.in_params.contains(n)) {
            in_params.push(DocParam::new(name, "", Some(USED_NOT_DECLARED)));
        }

        let test_rows = test_rows(query);
        let first_row = test_rows
            .as_ref()
            .filter(|_| query.error.is_none())
            .and_then(|rows| rows.first());

        let mut out_params = Vec::new();
        for p in query.out_params.iter() {
            let warning = first_row
                .filter(|row| !row.contains_key(&p.key))
                .map(|_| FIELD_NOT_FOUND);
            out_params.push(DocParam::new(&p.key, &p.value, warning));
        }
        if let Some(row) = first_row {
            for column in row.keys().filter(|c| !query.out_params.contains(c)) {
                out_params.push(DocParam::new(column, "", Some(FIELD_NOT_DESCRIBED)));
            }
        }
        has_warn |= in_params
            .iter()
            .chain(out_params.iter())
            .any(|p| p.warning.is_some());

        let test_params = query
            .test_params
            .iter()
            .map(|p| DocParam::new(&p.key, &p.value, None))
            .collect();

        Self {
            name: query.name.clone(),
            description: query.description.clone(),
            in_params,
            out_params,
            load_time: query.loaded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            timeout: query
                .timeout
                .map(|t| format!("{:?}", t))
                .unwrap_or_else(|| "Default".to_string()),
            parse_warnings: query.warnings.clone(),
            test_pass: query.test_pass,
            test_params,
            test_duration_ms: query
                .test_report
                .as_ref()
                .map(|r| r.duration().num_milliseconds()),
            test_result: test_rows
                .map(|rows| Value::Array(rows.into_iter().map(Value::Object).collect())),
            error: query.error.as_ref().map(|e| e.to_string()),
            has_warn,
            has_err: query.error.is_some(),
        }
    }
}

fn test_rows(query: &Query) -> Option<Vec<Map<String, Value>>> {
    let report = query.test_report.as_ref()?;
    serde_json::from_slice(&report.result).ok()
}

/// Queries grouped by path segment. Directories sort before files, then
/// entries sort by name.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub is_file: bool,
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<QueryDescription>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn dir(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            is_file: false,
            name: name.into(),
            path: path.into(),
            description: None,
            children: Vec::new(),
        }
    }

    pub fn build<'a>(queries: impl IntoIterator<Item = &'a Query>) -> Self {
        let mut root = Self::dir("sql", "/");
        for query in queries {
            root.add(query);
        }
        root.sort();
        root
    }

    fn add(&mut self, query: &Query) {
        let segments: Vec<&str> = query.name.split('/').filter(|s| !s.is_empty()).collect();
        let mut node = self;
        let mut path = String::new();

        for (i, segment) in segments.iter().enumerate() {
            path.push('/');
            path.push_str(segment);
            let is_file = i == segments.len() - 1;

            let existing = node
                .children
                .iter()
                .position(|c| c.name == *segment && c.is_file == is_file);
            let index = match existing {
                Some(index) => index,
                None => {
                    let mut child = Self::dir(*segment, path.clone());
                    if is_file {
                        child.is_file = true;
                        child.description = Some(QueryDescription::describe(query));
                    }
                    node.children.push(child);
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index];
        }
    }

    fn sort(&mut self) {
        self.children
            .sort_by(|a, b| a.is_file.cmp(&b.is_file).then_with(|| a.name.cmp(&b.name)));
        for child in &mut self.children {
            child.sort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::template::{compile, TestReport};
    use chrono::{Duration, Utc};

    #[test]
    fn test_in_param_warnings() {
        let q = compile(
            "users/get",
            "-- #description: Get user ##\n\
             -- #in: id = user id; unused = nothing; ##\n\
             SELECT :id, :extra",
        );
        let d = QueryDescription::describe(&q);

        assert_eq!(d.in_params.len(), 3);
        assert_eq!(d.in_params[0], DocParam::new("id", "user id", None));
        assert_eq!(d.in_params[1].warning, Some(DECLARED_NOT_USED));
        assert_eq!(d.in_params[2], DocParam::new("extra", "", Some(USED_NOT_DECLARED)));
        assert!(d.has_warn);
        assert!(!d.has_err);
    }

    #[test]
    fn test_out_params_checked_against_test_result() {
        let mut q = compile(
            "users/list",
            "-- #description: List ##\n\
             -- #out: id = id; email = mail; ##\n\
             SELECT id, name FROM users",
        );
        let now = Utc::now();
        q.test_report = Some(TestReport {
            started_at: now,
            finished_at: now + Duration::milliseconds(12),
            result: br#"[{"id":1,"name":"a"}]"#.to_vec(),
        });
        let d = QueryDescription::describe(&q);

        assert_eq!(d.out_params[0].warning, None);
        assert_eq!(d.out_params[1].warning, Some(FIELD_NOT_FOUND));
        assert_eq!(d.out_params[2], DocParam::new("name", "", Some(FIELD_NOT_DESCRIBED)));
        assert_eq!(d.test_duration_ms, Some(12));
        assert!(d.test_result.is_some());
    }

    #[test]
    fn test_no_test_result_no_out_warnings() {
        let q = compile("q", "-- #description: d ##\n-- #out: id = id; ##\nSELECT 1");
        let d = QueryDescription::describe(&q);
        assert_eq!(d.out_params[0].warning, None);
        assert!(!d.has_warn);
        assert_eq!(d.timeout, "Default");
    }

    #[test]
    fn test_error_and_missing_description() {
        let q = Query::failed("broken", Error::Compile("unreadable".into()));
        let d = QueryDescription::describe(&q);
        assert!(d.has_err);
        assert!(d.has_warn);
        assert_eq!(d.error.as_deref(), Some("Compile error: unreadable"));
    }

    #[test]
    fn test_tree_dirs_before_files() {
        let queries = vec![
            compile("zeta", "SELECT 1"),
            compile("reports/daily", "SELECT 1"),
            compile("alpha", "SELECT 1"),
            compile("reports/archive/old", "SELECT 1"),
            compile("reports/aaa", "SELECT 1"),
        ];
        let tree = TreeNode::build(&queries);

        let top: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(top, vec!["reports", "alpha", "zeta"]);

        let reports = &tree.children[0];
        assert!(!reports.is_file);
        let inner: Vec<&str> = reports.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(inner, vec!["archive", "aaa", "daily"]);
        assert_eq!(reports.children[0].children[0].path, "/reports/archive/old");
        assert!(reports.children[1].description.is_some());
    }

    #[test]
    fn test_tree_file_and_dir_share_name() {
        for queries in [
            vec![compile("a/b", "SELECT 1"), compile("a", "SELECT 2")],
            vec![compile("a", "SELECT 2"), compile("a/b", "SELECT 1")],
        ] {
            let tree = TreeNode::build(&queries);

            assert_eq!(tree.children.len(), 2);
            let dir = &tree.children[0];
            assert_eq!(dir.name, "a");
            assert!(!dir.is_file);
            assert_eq!(dir.children.len(), 1);
            assert_eq!(dir.children[0].path, "/a/b");
            assert!(dir.children[0].is_file);

            let file = &tree.children[1];
            assert_eq!(file.name, "a");
            assert!(file.is_file);
            assert!(file.children.is_empty());
            assert_eq!(file.description.as_ref().unwrap().name, "a");
        }
    }

    #[test]
    fn test_tree_serializes() {
        let queries = vec![compile("a/b", "SELECT 1")];
        let value = serde_json::to_value(TreeNode::build(&queries)).unwrap();
        assert_eq!(value["name"], "sql");
        assert_eq!(value["children"][0]["children"][0]["is_file"], true);
        assert_eq!(value["children"][0]["children"][0]["description"]["test_pass"], "noerror");
    }
}
