use serde::Serialize;
use tracing::{debug, warn};

use crate::storage::BackendTransaction;
use crate::types::{ElementId, KcvError, Result};

use super::{IndexSerializer, Parameter};

/// Prefix marking vertex key references.
pub const VERTEX_PREFIX: &str = "v.";
/// Prefix marking edge key references.
pub const EDGE_PREFIX: &str = "e.";
/// Prefix marking property key references.
pub const PROPERTY_PREFIX: &str = "p.";

/// Kind of element a mixed-index query returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementCategory {
    /// Vertices.
    Vertex,
    /// Edges.
    Edge,
    /// Vertex properties.
    Property,
}

impl ElementCategory {
    /// Default key-reference prefix of the category.
    pub fn prefix(self) -> &'static str {
        match self {
            ElementCategory::Vertex => VERTEX_PREFIX,
            ElementCategory::Edge => EDGE_PREFIX,
            ElementCategory::Property => PROPERTY_PREFIX,
        }
    }
}

/// Query handed to an external index backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawQuery {
    /// Name of the index inside the backend.
    pub store: String,
    /// Query text with key references replaced by storage field names.
    pub query: String,
    /// Backend-specific options.
    pub parameters: Vec<Parameter>,
    /// Results to skip.
    pub offset: usize,
    /// Maximum results, if capped.
    pub limit: Option<usize>,
}

/// One hit returned by an external index backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RawResult {
    /// Element the hit refers to; may already be deleted.
    pub id: ElementId,
    /// Backend relevance score.
    pub score: f64,
}

/// External indexing backend answering mixed-index queries.
pub trait IndexProvider: Send + Sync {
    /// Runs `query` and returns hits in backend order.
    fn query(&self, query: &RawQuery) -> Result<Vec<RawResult>>;
}

/// Validated mixed-index query.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexQuery {
    /// Mixed index name.
    pub index: String,
    /// Query text before key substitution.
    pub query: String,
    /// Key-reference prefix.
    pub prefix: String,
    /// Results to skip.
    pub offset: usize,
    /// Maximum results, if capped.
    pub limit: Option<usize>,
    /// Backend-specific options.
    pub parameters: Vec<Parameter>,
}

/// Builds queries against a mixed index.
#[derive(Clone, Debug, Default)]
pub struct IndexQueryBuilder {
    index: Option<String>,
    query: Option<String>,
    prefix: Option<String>,
    offset: usize,
    limit: Option<usize>,
    parameters: Vec<Parameter>,
}

impl IndexQueryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets mixed index `name`.
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    /// Sets the backend query text.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Overrides the key-reference prefix chosen from the result category.
    pub fn element_identifier(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Skips the first `offset` results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Caps the number of results; must be positive.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Adds a backend option.
    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Validates the builder for a query returning `category` elements.
    pub fn build(&self, category: ElementCategory) -> Result<IndexQuery> {
        let index = non_blank(self.index.as_deref(), "index name")?;
        let query = non_blank(self.query.as_deref(), "query")?;
        let prefix = match self.prefix.as_deref() {
            Some(prefix) => non_blank(Some(prefix), "element identifier")?,
            None => category.prefix().to_string(),
        };
        if self.limit == Some(0) {
            return Err(KcvError::invalid("index query limit must be positive"));
        }
        Ok(IndexQuery {
            index,
            query,
            prefix,
            offset: self.offset,
            limit: self.limit,
            parameters: self.parameters.clone(),
        })
    }

    /// Runs the query and drops hits for which `is_removed` holds; the
    /// external index may lag behind deletions in the graph store.
    pub fn execute<F>(
        &self,
        serializer: &IndexSerializer,
        category: ElementCategory,
        is_removed: F,
    ) -> Result<Vec<RawResult>>
    where
        F: Fn(ElementId) -> bool,
    {
        let query = self.build(category)?;
        let hits = serializer.execute_query(&query)?;
        let total = hits.len();
        let live: Vec<RawResult> = hits.into_iter().filter(|hit| !is_removed(hit.id)).collect();
        debug!(index = %query.index, total, live = live.len(), "index.query.execute");
        Ok(live)
    }

    /// Like [`IndexQueryBuilder::execute`], warning when `tx` holds writes the
    /// external index cannot see yet.
    pub fn execute_in<F>(
        &self,
        tx: &BackendTransaction,
        serializer: &IndexSerializer,
        category: ElementCategory,
        is_removed: F,
    ) -> Result<Vec<RawResult>>
    where
        F: Fn(ElementId) -> bool,
    {
        if tx.has_modifications() {
            warn!(
                tx = tx.id(),
                query = self.query.as_deref().unwrap_or_default(),
                "index.query.uncommitted_writes"
            );
        }
        self.execute(serializer, category, is_removed)
    }
}

fn non_blank(value: Option<&str>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(KcvError::invalid(format!("{what} must not be blank"))),
    }
}

/// Replaces every `prefix + key` reference in `query` by the storage field
/// `resolve` returns for it, or by `unknown` when the key does not resolve.
///
/// A key is either a run of alphanumerics and underscores or a double-quoted
/// string.
pub fn substitute_keys<R>(query: &str, prefix: &str, resolve: R, unknown: &str) -> Result<String>
where
    R: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    let mut offset = 0usize;
    while let Some(pos) = rest.find(prefix) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + prefix.len()..];
        let (name, consumed) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"').ok_or_else(|| {
                    KcvError::invalid(format!(
                        "no closing quote for key at position {}",
                        offset + pos
                    ))
                })?;
                (&quoted[..end], end + 2)
            }
            None => {
                let end = after
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            }
        };
        if name.trim().is_empty() {
            return Err(KcvError::invalid(format!(
                "empty key reference at position {}",
                offset + pos
            )));
        }
        match resolve(name) {
            Some(field) => out.push_str(&field),
            None => {
                debug!(key = name, "index.query.unknown_key");
                out.push_str(unknown);
            }
        }
        let advanced = pos + prefix.len() + consumed;
        offset += advanced;
        rest = &rest[advanced..];
    }
    out.push_str(rest);
    Ok(out)
}
