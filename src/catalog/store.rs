//! SQLite-backed tool index store.
//!
//! Read-mostly: searches run against the minimal columns only; the catalog
//! backfill job is the single writer. Vector search is an exact cosine scan
//! over the embedding BLOBs with a platform pre-filter, ties broken by
//! `(similarity desc, id asc)`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::catalog::schema::{initialize_schema, is_initialized};
use crate::catalog::types::{CostHint, FullToolSpec, Platform, ToolIndexEntry};
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};

/// A search result: a minimal entry and its retrieval score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Matched entry (embedding omitted)
    pub entry: ToolIndexEntry,
    /// Cosine similarity for vector hits, token-overlap score for lexical
    pub similarity: f32,
}

/// SQLite-backed tool index.
pub struct SqliteToolIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteToolIndex {
    /// Open or create a tool index at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory index (for testing and embedded deployments).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    // ==================== Writes (backfill job) ====================

    /// Insert or replace a tool by id; `updated_at` advances on every write.
    ///
    /// # Errors
    /// [`Error::Validation`] when the entry carries no embedding: every
    /// stored row must be vector-searchable.
    pub fn upsert(&self, spec: &FullToolSpec) -> Result<()> {
        let embedding = spec
            .entry
            .embedding
            .as_ref()
            .ok_or_else(|| Error::validation(format!("tool {} has no embedding", spec.entry.id)))?;

        let blob: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
        let tags = serde_json::to_string(&spec.entry.tags)?;
        let full_spec = serde_json::to_string(spec)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tools (
                    id, name, desc_short, platform, tags, cost_hint,
                    embedding, always_include, full_spec, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    desc_short = excluded.desc_short,
                    platform = excluded.platform,
                    tags = excluded.tags,
                    cost_hint = excluded.cost_hint,
                    embedding = excluded.embedding,
                    always_include = excluded.always_include,
                    full_spec = excluded.full_spec,
                    updated_at = excluded.updated_at",
                params![
                    spec.entry.id,
                    spec.entry.name,
                    spec.entry.desc_short,
                    spec.entry.platform.to_string(),
                    tags,
                    spec.entry.cost_hint.to_string(),
                    blob,
                    spec.always_include as i32,
                    full_spec,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Upsert a batch of tools; stops at the first failure.
    pub fn bulk_upsert(&self, specs: &[FullToolSpec]) -> Result<usize> {
        for spec in specs {
            self.upsert(spec)?;
        }
        Ok(specs.len())
    }

    // ==================== Reads ====================

    /// Number of entries in the catalog.
    pub fn catalog_size(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM tools", [], |row| {
                row.get::<_, i64>(0).map(|n| n as usize)
            })
        })
    }

    /// Cosine top-K over the catalog, optionally pre-filtered by platform
    /// (an entry passes when its platform matches or is multi-platform).
    pub fn vector_search(
        &self,
        query_vec: &[f32],
        platform: Option<Platform>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let rows = self.load_rows(platform, true)?;
        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|(mut entry, embedding)| {
                let similarity = cosine_similarity(query_vec, &embedding);
                entry.embedding = None;
                SearchHit { entry, similarity }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Case-insensitive substring match over name, tags, and description.
    /// Score: name matches weigh 3, tag matches 2, description matches 1;
    /// ties broken by id. The whole query is always tried as a literal
    /// substring; tokens under 3 characters only contribute through it, so
    /// short searches ("ip", "ps", "du") still hit.
    pub fn lexical_search(
        &self,
        query_text: &str,
        platform: Option<Platform>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let query = query_text.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let tokens: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
            .filter(|t| t.len() >= 3 && *t != query)
            .map(str::to_string)
            .collect();

        let rows = self.load_rows(platform, false)?;
        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .filter_map(|(entry, _)| {
                let name = entry.name.to_lowercase();
                let desc = entry.desc_short.to_lowercase();
                let tags: Vec<String> = entry.tags.iter().map(|t| t.to_lowercase()).collect();
                let mut score = 0u32;
                for needle in std::iter::once(query.as_str())
                    .chain(tokens.iter().map(String::as_str))
                {
                    if name.contains(needle) {
                        score += 3;
                    }
                    if tags.iter().any(|t| t.contains(needle)) {
                        score += 2;
                    }
                    if desc.contains(needle) {
                        score += 1;
                    }
                }
                (score > 0).then_some(SearchHit {
                    entry,
                    similarity: score as f32,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// The catalog-declared allowlist, always present in candidate pools.
    pub fn always_include(&self) -> Result<Vec<ToolIndexEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, desc_short, platform, tags, cost_hint, updated_at
                 FROM tools WHERE always_include = 1 ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| Self::row_to_entry(row))?;
            rows.collect()
        })
    }

    /// Load the full spec for planning or execution. Never used in retrieval.
    pub fn get_full_spec(&self, id: &str) -> Result<FullToolSpec> {
        let raw: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT full_spec FROM tools WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })?;
        let raw = raw.ok_or_else(|| Error::NotFound(format!("tool {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// List minimal entries, optionally filtered, for the tools-list ingress.
    pub fn list_entries(&self, platform: Option<Platform>) -> Result<Vec<ToolIndexEntry>> {
        Ok(self
            .load_rows(platform, false)?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    // Rows with (entry, embedding); loading the vector is skipped for
    // lexical queries.
    fn load_rows(
        &self,
        platform: Option<Platform>,
        with_embedding: bool,
    ) -> Result<Vec<(ToolIndexEntry, Vec<f32>)>> {
        let embedding_col = if with_embedding { "embedding" } else { "NULL" };
        let (filter, platform_value) = match platform {
            Some(p) => (
                "WHERE platform = ?1 OR platform = 'multi-platform'",
                p.to_string(),
            ),
            None => ("", String::new()),
        };
        let sql = format!(
            "SELECT id, name, desc_short, platform, tags, cost_hint, updated_at, {embedding_col}
             FROM tools {filter} ORDER BY id"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let map_row = |row: &Row<'_>| {
                let entry = Self::row_to_entry(row)?;
                let blob: Option<Vec<u8>> = row.get(7)?;
                let embedding = blob.map(|b| decode_embedding(&b)).unwrap_or_default();
                Ok((entry, embedding))
            };
            let rows = if filter.is_empty() {
                stmt.query_map([], map_row)?.collect()
            } else {
                stmt.query_map(params![platform_value], map_row)?.collect()
            };
            rows
        })
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ToolIndexEntry> {
        let platform_raw: String = row.get(3)?;
        let tags_raw: String = row.get(4)?;
        let cost_raw: String = row.get(5)?;
        let updated_raw: String = row.get(6)?;

        Ok(ToolIndexEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            desc_short: row.get(2)?,
            platform: Platform::parse(&platform_raw).unwrap_or(Platform::Custom),
            tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
            cost_hint: match cost_raw.as_str() {
                "med" => CostHint::Med,
                "high" => CostHint::High,
                _ => CostHint::Low,
            },
            embedding: None,
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated_raw)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{ExecutionLocation, PreferenceScores};
    use pretty_assertions::assert_eq;

    fn tool(id: &str, name: &str, desc: &str, platform: Platform, vec: Vec<f32>) -> FullToolSpec {
        let entry = ToolIndexEntry::new(id, name, desc, platform).with_embedding(vec);
        FullToolSpec::new(entry)
    }

    fn seeded_index() -> SqliteToolIndex {
        let index = SqliteToolIndex::in_memory().unwrap();
        index
            .bulk_upsert(&[
                tool(
                    "windows_list_directory",
                    "windows_list_directory",
                    "List directory contents on a Windows host",
                    Platform::Windows,
                    vec![1.0, 0.0, 0.0],
                ),
                tool(
                    "linux_list_directory",
                    "linux_list_directory",
                    "List directory contents on a Linux host",
                    Platform::Linux,
                    vec![0.9, 0.1, 0.0],
                ),
                {
                    let mut spec = tool(
                        "asset-query",
                        "asset-query",
                        "Query the asset inventory",
                        Platform::MultiPlatform,
                        vec![0.0, 1.0, 0.0],
                    );
                    spec.execution_location = ExecutionLocation::Asset;
                    spec.always_include = true;
                    spec
                },
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_upsert_requires_embedding() {
        let index = SqliteToolIndex::in_memory().unwrap();
        let spec = FullToolSpec::new(ToolIndexEntry::new("t", "t", "t", Platform::Linux));
        let err = index.upsert(&spec).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let index = seeded_index();
        assert_eq!(index.catalog_size().unwrap(), 3);

        let mut replacement = tool(
            "asset-query",
            "asset-query",
            "Query and count inventory assets",
            Platform::MultiPlatform,
            vec![0.0, 1.0, 0.0],
        );
        replacement.preferences = PreferenceScores::new(0.9, 0.9, 0.1);
        index.upsert(&replacement).unwrap();

        assert_eq!(index.catalog_size().unwrap(), 3);
        let spec = index.get_full_spec("asset-query").unwrap();
        assert_eq!(spec.entry.desc_short, "Query and count inventory assets");
        assert_eq!(spec.preferences.speed, 0.9);
    }

    #[test]
    fn test_vector_search_orders_by_similarity_then_id() {
        let index = seeded_index();
        let hits = index.vector_search(&[1.0, 0.0, 0.0], None, 10).unwrap();
        assert_eq!(hits[0].entry.id, "windows_list_directory");
        assert_eq!(hits[1].entry.id, "linux_list_directory");
        assert!(hits[0].similarity > hits[1].similarity);
        // Results never carry the stored vector
        assert!(hits[0].entry.embedding.is_none());
    }

    #[test]
    fn test_vector_search_platform_filter_includes_multi() {
        let index = seeded_index();
        let hits = index
            .vector_search(&[1.0, 0.0, 0.0], Some(Platform::Windows), 10)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.id.as_str()).collect();
        assert!(ids.contains(&"windows_list_directory"));
        assert!(ids.contains(&"asset-query")); // multi-platform passes
        assert!(!ids.contains(&"linux_list_directory"));
    }

    #[test]
    fn test_vector_search_tie_breaks_by_id() {
        let index = SqliteToolIndex::in_memory().unwrap();
        index
            .bulk_upsert(&[
                tool("b-tool", "b", "same vector", Platform::Linux, vec![1.0, 0.0]),
                tool("a-tool", "a", "same vector", Platform::Linux, vec![1.0, 0.0]),
            ])
            .unwrap();
        let hits = index.vector_search(&[1.0, 0.0], None, 10).unwrap();
        assert_eq!(hits[0].entry.id, "a-tool");
        assert_eq!(hits[1].entry.id, "b-tool");
    }

    #[test]
    fn test_lexical_search_matches_name_and_desc() {
        let index = seeded_index();
        let hits = index.lexical_search("list directory", None, 10).unwrap();
        assert_eq!(hits.len(), 2);
        // Name matches outrank description-only matches
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[test]
    fn test_lexical_search_short_query_is_literal_substring() {
        let index = SqliteToolIndex::in_memory().unwrap();
        index
            .bulk_upsert(&[
                tool(
                    "ip-scan",
                    "ip-scan",
                    "Scan a subnet for live addresses",
                    Platform::Network,
                    vec![1.0, 0.0],
                ),
                tool(
                    "ps-snapshot",
                    "ps-snapshot",
                    "Capture a process table snapshot",
                    Platform::Linux,
                    vec![0.0, 1.0],
                ),
            ])
            .unwrap();

        let hits = index.lexical_search("ip", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, "ip-scan");

        let hits = index.lexical_search("PS", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, "ps-snapshot");

        assert!(index.lexical_search("  ", None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_lexical_search_is_case_insensitive() {
        let index = seeded_index();
        let hits = index.lexical_search("ASSET Inventory", None, 10).unwrap();
        assert_eq!(hits[0].entry.id, "asset-query");
    }

    #[test]
    fn test_always_include_allowlist() {
        let index = seeded_index();
        let allow = index.always_include().unwrap();
        assert_eq!(allow.len(), 1);
        assert_eq!(allow[0].id, "asset-query");
    }

    #[test]
    fn test_get_full_spec_not_found() {
        let index = seeded_index();
        let err = index.get_full_spec("no-such-tool").unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let index = SqliteToolIndex::open(&path).unwrap();
            index
                .upsert(&tool("t1", "t1", "persisted", Platform::Linux, vec![0.5, 0.5]))
                .unwrap();
        }
        let reopened = SqliteToolIndex::open(&path).unwrap();
        assert_eq!(reopened.catalog_size().unwrap(), 1);
    }
}
