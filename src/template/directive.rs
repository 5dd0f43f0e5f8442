use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::{parse_duration, DirectiveParamList, Query, TestPass};

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)#([_0-9a-z]*?):(.*?)##").expect("directive pattern is valid")
});

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)([_a-zA-Z][_0-9a-zA-Z]*)\s*=\s*(.*?)\s*;").expect("entry pattern is valid")
});

/// Reads every `#name: body ##` block out of the collected comment text.
/// Bad values only ever add a warning to the query.
pub(super) fn apply(comments: &str, query: &mut Query) {
    for caps in DIRECTIVE_RE.captures_iter(comments) {
        let name = caps[1].to_ascii_lowercase();
        let body = caps[2].trim();

        match name.as_str() {
            "description" => {
                query.description.push_str(body);
                query.description.push('\n');
            }
            "timeout" => match parse_duration(body) {
                Ok(timeout) => query.timeout = Some(timeout),
                Err(e) => add_warning(query, format!("Can't parse timeout {:?}: {}", body, e)),
            },
            "in" => read_entries(body, &mut query.in_params),
            "out" => read_entries(body, &mut query.out_params),
            "test" => read_entries(body, &mut query.test_params),
            "testpass" => match body.to_lowercase().parse::<TestPass>() {
                Ok(test_pass) => query.test_pass = test_pass,
                Err(e) => add_warning(
                    query,
                    format!("Can't parse testpass value: {}. Using default noerror", e),
                ),
            },
            _ => {}
        }
    }
}

fn read_entries(body: &str, list: &mut DirectiveParamList) {
    for caps in ENTRY_RE.captures_iter(body) {
        let key = caps[1].trim().to_ascii_lowercase();
        let value = caps[2].trim();
        if key.is_empty() {
            continue;
        }
        list.insert(key, value);
    }
}

fn add_warning(query: &mut Query, message: String) {
    warn!(query = %query.name, "{}", message);
    query.warnings.push(message);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::compile;
    use super::*;

    fn directives(comments: &str) -> Query {
        let mut q = compile("t", "");
        apply(comments, &mut q);
        q
    }

    #[test]
    fn test_description_concatenates() {
        let q = directives("#description: first ##\n#DESCRIPTION: second##");
        assert_eq!(q.description, "first\nsecond\n");
    }

    #[test]
    fn test_timeout_valid() {
        let q = directives("#timeout: 1m30s ##");
        assert_eq!(q.timeout, Some(Duration::from_secs(90)));
        assert!(q.warnings.is_empty());
    }

    #[test]
    fn test_timeout_invalid_adds_warning() {
        let q = directives("#timeout: notaduration##");
        assert!(q.timeout.is_none());
        assert_eq!(q.warnings.len(), 1);
        assert!(q.warnings[0].contains("notaduration"));
    }

    #[test]
    fn test_in_entries() {
        let q = directives("#in: id = record id; Name = user name ; ##");
        assert_eq!(q.in_params.get("id"), Some("record id"));
        assert_eq!(q.in_params.get("name"), Some("user name"));
    }

    #[test]
    fn test_entries_first_key_wins() {
        let q = directives("#test: id = 1; id = 2; ##");
        assert_eq!(q.test_params.get("id"), Some("1"));
        assert_eq!(q.test_params.len(), 1);
    }

    #[test]
    fn test_entries_span_multiple_directives() {
        let q = directives("#out: a = first; ##\n#out: a = again; b = second; ##");
        assert_eq!(q.out_params.get("a"), Some("first"));
        assert_eq!(q.out_params.get("b"), Some("second"));
    }

    #[test]
    fn test_entry_value_may_span_lines() {
        let q = directives("#in: note = line one\nline two; ##");
        assert_eq!(q.in_params.get("note"), Some("line one\nline two"));
    }

    #[test]
    fn test_entry_without_semicolon_is_ignored() {
        let q = directives("#in: a = 1; b = 2 ##");
        assert_eq!(q.in_params.len(), 1);
        assert!(!q.in_params.contains("b"));
    }

    #[test]
    fn test_testpass_case_insensitive() {
        let q = directives("#testpass: Rows ##");
        assert_eq!(q.test_pass, TestPass::Rows);
    }

    #[test]
    fn test_testpass_invalid_keeps_default() {
        let q = directives("#testpass: sometimes ##");
        assert_eq!(q.test_pass, TestPass::NoError);
        assert_eq!(q.warnings.len(), 1);
    }

    #[test]
    fn test_unknown_directive_is_ignored() {
        let q = directives("#author: somebody ##");
        assert!(q.warnings.is_empty());
        assert!(q.description.is_empty());
    }

    #[test]
    fn test_unterminated_directive_is_ignored() {
        let q = directives("#description: never closed");
        assert!(q.description.is_empty());
    }

    #[test]
    fn test_body_is_non_greedy() {
        let q = directives("#description: one ## text ##");
        assert_eq!(q.description, "one\n");
    }
}
