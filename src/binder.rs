use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Inbound request parameters: each key maps to every value sent for it, in
/// arrival order. Keys iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams(BTreeMap<String, Vec<String>>);

impl RequestParams {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (k, v) in pairs {
            params.append(k, v);
        }
        params
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Positional argument for `$N`; `None` binds SQL NULL.
pub type Arg = Option<String>;

fn to_arg(values: Option<&[String]>) -> Arg {
    values
        .and_then(|v| v.first())
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Maps `inbound` onto the declared parameter order. With `filter_unknown`
/// every consumed key is removed, and any key left over afterwards fails the
/// bind.
pub fn bind(
    declared: &[String],
    inbound: &mut RequestParams,
    filter_unknown: bool,
) -> Result<Vec<Arg>> {
    let mut args = Vec::with_capacity(declared.len());

    for name in declared {
        if filter_unknown {
            args.push(to_arg(inbound.remove(name).as_deref()));
        } else {
            args.push(to_arg(inbound.0.get(name).map(Vec::as_slice)));
        }
    }

    if filter_unknown && !inbound.is_empty() {
        let unknown: Vec<&str> = inbound.keys().collect();
        return Err(Error::Bind(unknown.join(", ")));
    }

    Ok(args)
}
