//! BM25 retrieval index over upstream tools
//!
//! Every visible tool across all upstreams is indexed under its namespaced
//! name (`server:tool`) with its description and annotation labels. Queries
//! rank with Okapi BM25 (tantivy's scorer, k₁ = 1.2, b = 0.75), ties broken
//! by server name then tool name. The index is persisted under
//! `<data_dir>/index`; tantivy's WAL'd commits mean a restart resumes
//! without re-crawling upstreams, and readers search a committed snapshot
//! while the writer works.

pub mod error;

pub use error::{IndexError, IndexResult};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, FAST, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, TantivyDocument, Term};

/// Queries never return more than this many results
pub const MAX_QUERY_LIMIT: usize = 50;

/// Writer heap; tantivy's minimum is 15 MB
const WRITER_HEAP_BYTES: usize = 50 * 1024 * 1024;

/// One tool as fed to the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Upstream server name
    pub server: String,

    /// Bare tool name
    pub name: String,

    /// Tool description
    pub description: String,

    /// Annotation labels ("read-only", "destructive", ...)
    #[serde(default)]
    pub labels: Vec<String>,
}

impl IndexEntry {
    /// Namespaced identity exposed to clients
    pub fn namespaced(&self) -> String {
        format!("{}:{}", self.server, self.name)
    }

    /// Text document the tokenizer sees
    fn search_text(&self) -> String {
        let mut text = String::with_capacity(
            self.server.len() + self.name.len() + self.description.len() + 32,
        );
        text.push_str(&self.server);
        text.push(' ');
        text.push_str(&self.name);
        text.push(' ');
        text.push_str(&self.description);
        for label in &self.labels {
            text.push(' ');
            text.push_str(label);
        }
        text
    }
}

/// A ranked query hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTool {
    /// Namespaced tool name (`server:tool`)
    pub name: String,

    /// Upstream server
    pub server: String,

    /// Bare tool name
    pub tool: String,

    /// Tool description
    pub description: String,

    /// BM25 score
    pub score: f32,
}

struct Fields {
    namespaced: Field,
    server: Field,
    tool: Field,
    description: Field,
    text: Field,
}

/// Persistent BM25 index over all visible tools
pub struct ToolIndex {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
}

impl ToolIndex {
    fn schema() -> (Schema, Fields) {
        let mut builder = Schema::builder();
        let namespaced = builder.add_text_field("namespaced", STRING | STORED);
        let server = builder.add_text_field("server", STRING | STORED | FAST);
        let tool = builder.add_text_field("tool", STRING | STORED);
        let description = builder.add_text_field("description", STORED);
        let text = builder.add_text_field("text", TEXT);
        (
            builder.build(),
            Fields {
                namespaced,
                server,
                tool,
                description,
                text,
            },
        )
    }

    /// Open (or create) the index in a directory
    pub fn open(dir: &Path) -> IndexResult<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = Self::schema();

        let index = match Index::open_in_dir(dir) {
            Ok(index) if index.schema() == schema => index,
            Ok(_) => {
                // Schema changed between versions: rebuild from scratch; the
                // next reconcile repopulates it.
                tracing::warn!(dir = %dir.display(), "Index schema mismatch, rebuilding");
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        std::fs::remove_file(entry.path())?;
                    }
                }
                Index::create_in_dir(dir, schema)?
            }
            Err(_) => Index::create_in_dir(dir, schema)?,
        };

        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index.reader()?;

        Ok(Self {
            index,
            writer: Mutex::new(writer),
            reader,
            fields,
        })
    }

    /// Open an in-memory index (tests)
    pub fn open_in_memory() -> IndexResult<Self> {
        let (schema, fields) = Self::schema();
        let index = Index::create_in_ram(schema);
        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index.reader()?;
        Ok(Self {
            index,
            writer: Mutex::new(writer),
            reader,
            fields,
        })
    }

    /// Replace all entries for the servers named in `entries`
    ///
    /// Atomic from the reader's point of view: delete and re-add commit
    /// together, and searches keep using the previous snapshot until the
    /// commit lands.
    pub fn upsert(&self, entries: &[IndexEntry]) -> IndexResult<()> {
        let mut servers: Vec<&str> = entries.iter().map(|e| e.server.as_str()).collect();
        servers.sort_unstable();
        servers.dedup();

        let mut writer = self.writer.lock();
        for server in servers {
            writer.delete_term(Term::from_field_text(self.fields.server, server));
        }
        for entry in entries {
            writer.add_document(doc!(
                self.fields.namespaced => entry.namespaced(),
                self.fields.server => entry.server.clone(),
                self.fields.tool => entry.name.clone(),
                self.fields.description => entry.description.clone(),
                self.fields.text => entry.search_text(),
            ))?;
        }
        writer.commit()?;
        drop(writer);

        self.reader.reload()?;
        Ok(())
    }

    /// Drop every entry for one server
    pub fn delete_by_server(&self, server: &str) -> IndexResult<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.server, server));
        writer.commit()?;
        drop(writer);

        self.reader.reload()?;
        Ok(())
    }

    /// Ranked retrieval; `limit` is clamped to `MAX_QUERY_LIMIT`
    pub fn query(&self, text: &str, limit: usize) -> IndexResult<Vec<ScoredTool>> {
        let limit = limit.min(MAX_QUERY_LIMIT);
        if limit == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        let (query, _errors) = parser.parse_query_lenient(text);

        // Over-fetch so equal scores can be tie-broken deterministically
        let fetch = (limit * 4).max(limit + 8);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(fetch))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let document: TantivyDocument = searcher.doc(address)?;
            let get = |field: Field| {
                document
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            hits.push(ScoredTool {
                name: get(self.fields.namespaced),
                server: get(self.fields.server),
                tool: get(self.fields.tool),
                description: get(self.fields.description),
                score,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.server.cmp(&b.server))
                .then_with(|| a.tool.cmp(&b.tool))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Number of indexed tools
    pub fn len(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    /// Whether the index holds no tools
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ToolIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolIndex").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(server: &str, name: &str, description: &str) -> IndexEntry {
        IndexEntry {
            server: server.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            labels: Vec::new(),
        }
    }

    fn populated() -> ToolIndex {
        let index = ToolIndex::open_in_memory().unwrap();
        index
            .upsert(&[
                entry("github", "get_file", "Read a file from a repository"),
                entry("github", "create_issue", "Open a new issue"),
                entry("slack", "post_message", "Send a message to a channel"),
                entry("fs", "read_file", "Read a local file from disk"),
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_query_ranks_relevant_tools() {
        let index = populated();
        let hits = index.query("read file", 10).unwrap();
        assert!(!hits.is_empty());
        let names: Vec<&str> = hits.iter().map(|h| h.name.as_str()).collect();
        assert!(names.contains(&"github:get_file"));
        assert!(names.contains(&"fs:read_file"));
        assert!(!names.contains(&"slack:post_message") || hits.len() > 2);
    }

    #[test]
    fn test_limit_zero_returns_empty_success() {
        let index = populated();
        assert!(index.query("file", 0).unwrap().is_empty());
    }

    #[test]
    fn test_limit_clamped_to_maximum() {
        let index = ToolIndex::open_in_memory().unwrap();
        let entries: Vec<IndexEntry> = (0..80)
            .map(|i| entry("bulk", &format!("tool_{}", i), "searchable widget"))
            .collect();
        index.upsert(&entries).unwrap();

        let hits = index.query("widget", 51).unwrap();
        assert_eq!(hits.len(), MAX_QUERY_LIMIT);
    }

    #[test]
    fn test_ties_break_by_server_then_tool() {
        let index = ToolIndex::open_in_memory().unwrap();
        index
            .upsert(&[
                entry("beta", "widget", "widget"),
                entry("alpha", "widget", "widget"),
            ])
            .unwrap();

        let hits = index.query("widget", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].server, "alpha");
        assert_eq!(hits[1].server, "beta");
    }

    #[test]
    fn test_upsert_replaces_server_entries() {
        let index = populated();
        index
            .upsert(&[entry("github", "get_file_v2", "Read a file, second edition")])
            .unwrap();

        let hits = index.query("file repository edition", 20).unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.name.as_str()).collect();
        assert!(names.contains(&"github:get_file_v2"));
        assert!(!names.contains(&"github:get_file"));
        // Other servers untouched
        assert!(index.query("local disk", 10).unwrap().iter().any(|h| h.server == "fs"));
    }

    #[test]
    fn test_delete_by_server() {
        let index = populated();
        index.delete_by_server("github").unwrap();
        assert!(index
            .query("issue repository", 10)
            .unwrap()
            .iter()
            .all(|h| h.server != "github"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = ToolIndex::open(dir.path()).unwrap();
            index
                .upsert(&[entry("fs", "read_file", "Read a local file")])
                .unwrap();
        }

        let reopened = ToolIndex::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        let hits = reopened.query("read", 5).unwrap();
        assert_eq!(hits[0].name, "fs:read_file");
    }
}
