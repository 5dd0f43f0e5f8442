use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use glob::{glob_with, MatchOptions, Pattern};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::template::{compile, Query};

/// Compiled templates keyed by logical name (`reports/daily`).
pub type QueryTable = HashMap<String, Query>;

pub struct TemplateLoader {
    root: PathBuf,
    extension: String,
    strict: bool,
}

impl TemplateLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "sql".to_string(),
            strict: true,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// In lenient mode an unreadable template is kept as a failed query
    /// instead of aborting the load.
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.strict = !lenient;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load(&self) -> Result<QueryTable> {
        if let Err(message) = self.check_root() {
            if self.strict {
                return Err(Error::Compile(message));
            }
            warn!(root = %self.root.display(), error = %message, "Template root unusable");
            return Ok(QueryTable::new());
        }

        let pattern = Path::new(&Pattern::escape(&self.root.to_string_lossy()))
            .join(format!("**/*.{}", Pattern::escape(&self.extension)));
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let entries = glob_with(&pattern.to_string_lossy(), options)
            .map_err(|e| Error::Compile(format!("Invalid template pattern: {}", e)))?;

        let mut table = QueryTable::new();
        for entry in entries {
            match entry {
                Ok(path) => {
                    if !path.is_file() {
                        continue;
                    }
                    self.load_file(&path, &mut table)?;
                }
                Err(e) => {
                    let message = format!("Failed to read {}: {}", e.path().display(), e.error());
                    if self.strict {
                        return Err(Error::Compile(message));
                    }
                    warn!(
                        path = %e.path().display(),
                        error = %e.error(),
                        "Skipping unreadable path"
                    );
                    if !self.is_template(e.path()) {
                        continue;
                    }
                    if let Some(name) = self.logical_name(e.path()) {
                        table.insert(name.clone(), Query::failed(name, Error::Compile(message)));
                    }
                }
            }
        }

        let failed = table.values().filter(|q| q.is_failed()).count();
        let warnings: usize = table.values().map(|q| q.warnings.len()).sum();
        info!(
            root = %self.root.display(),
            loaded = table.len() - failed,
            failed,
            warnings,
            "Templates loaded"
        );

        Ok(table)
    }

    fn check_root(&self) -> std::result::Result<(), String> {
        let meta = fs::metadata(&self.root)
            .map_err(|e| format!("Failed to read {}: {}", self.root.display(), e))?;
        if !meta.is_dir() {
            return Err(format!("{} is not a directory", self.root.display()));
        }
        fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|e| format!("Failed to read {}: {}", self.root.display(), e))
    }

    fn is_template(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(&self.extension))
    }

    fn load_file(&self, path: &Path, table: &mut QueryTable) -> Result<()> {
        let name = self
            .logical_name(path)
            .ok_or_else(|| Error::Compile(format!("Invalid template path: {}", path.display())))?;

        let query = match fs::read_to_string(path) {
            Ok(source) => compile(name.clone(), &source),
            Err(e) => {
                let err = Error::Compile(format!("Failed to read {}: {}", path.display(), e));
                if self.strict {
                    return Err(err);
                }
                warn!(query = %name, error = %err, "Template could not be read");
                Query::failed(name.clone(), err)
            }
        };

        debug!(query = %name, params = query.params.len(), "Compiled template");
        if table.insert(name.clone(), query).is_some() {
            debug!(query = %name, "Template replaced an earlier one with the same name");
        }
        Ok(())
    }

    /// Path relative to the root, extension stripped, joined with `/`.
    fn logical_name(&self, path: &Path) -> Option<String> {
        let relative = match path.strip_prefix(&self.root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => {
                let root = self.root.canonicalize().ok()?;
                let path = path.canonicalize().ok()?;
                path.strip_prefix(root).ok()?.to_path_buf()
            }
        };

        let parts: Vec<String> = relative
            .with_extension("")
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}
