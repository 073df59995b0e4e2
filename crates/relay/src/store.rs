// Durable storage for document snapshots.
//
// Each document is one row: the full CRDT state (`data`) plus the JSON
// rendering derived from it (`content`). Both columns are written by a single
// upsert so readers never observe one without the other.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use folio_common::document::Node;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use tracing::{debug_span, Instrument};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Snapshot persistence keyed by document id.
pub trait SnapshotStore: Send + Sync {
    /// Most recent snapshot for `id`, or `None` if it was never persisted.
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;

    /// Insert or replace the snapshot and rendered content for `id`.
    fn save<'a>(&'a self, id: &'a str, snapshot: &'a [u8], content: &'a [Node])
        -> StoreFuture<'a, ()>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to load snapshot for document {id}: {source}")]
    Load {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to save snapshot for document {id}: {source}")]
    Save {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("snapshot storage unavailable for document {id} during {operation}")]
    Unavailable { id: String, operation: &'static str },
}

/// PostgreSQL-backed store. The pool is shared by every document, so
/// concurrent loads and saves for different ids use separate connections.
#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl SnapshotStore for PgSnapshotStore {
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM documents WHERE id = $1 LIMIT 1")
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(debug_span!("folio.db.query", query = "load_document_snapshot"))
                .await
                .map_err(|source| StoreError::Load { id: id.to_owned(), source })
        })
    }

    fn save<'a>(
        &'a self,
        id: &'a str,
        snapshot: &'a [u8],
        content: &'a [Node],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                "
                INSERT INTO documents (id, data, content)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE
                SET data = EXCLUDED.data,
                    content = EXCLUDED.content
                ",
            )
            .bind(id)
            .bind(snapshot)
            .bind(Json(content))
            .execute(&self.pool)
            .instrument(debug_span!("folio.db.query", query = "upsert_document_snapshot"))
            .await
            .map_err(|source| StoreError::Save { id: id.to_owned(), source })?;

            Ok(())
        })
    }
}

/// A persisted document row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub data: Vec<u8>,
    pub content: Vec<Node>,
}

/// In-process store used for development without a database and in tests.
///
/// Individual ids can be made to fail loads or saves to exercise the
/// gateway's recovery paths.
#[derive(Default)]
pub struct MemorySnapshotStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    save_counts: RwLock<HashMap<String, usize>>,
    failing_loads: RwLock<HashSet<String>>,
    failing_saves: RwLock<HashSet<String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, id: &str) -> Option<StoredDocument> {
        self.documents.read().await.get(id).cloned()
    }

    /// Number of successful saves for `id`.
    pub async fn save_count(&self, id: &str) -> usize {
        self.save_counts.read().await.get(id).copied().unwrap_or(0)
    }

    pub async fn fail_loads_for(&self, id: &str) {
        self.failing_loads.write().await.insert(id.to_owned());
    }

    pub async fn fail_saves_for(&self, id: &str) {
        self.failing_saves.write().await.insert(id.to_owned());
    }

    pub async fn recover(&self, id: &str) {
        self.failing_loads.write().await.remove(id);
        self.failing_saves.write().await.remove(id);
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            if self.failing_loads.read().await.contains(id) {
                return Err(StoreError::Unavailable { id: id.to_owned(), operation: "load" });
            }
            Ok(self.documents.read().await.get(id).map(|document| document.data.clone()))
        })
    }

    fn save<'a>(
        &'a self,
        id: &'a str,
        snapshot: &'a [u8],
        content: &'a [Node],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.failing_saves.read().await.contains(id) {
                return Err(StoreError::Unavailable { id: id.to_owned(), operation: "save" });
            }

            self.documents.write().await.insert(
                id.to_owned(),
                StoredDocument { data: snapshot.to_vec(), content: content.to_vec() },
            );
            *self.save_counts.write().await.entry(id.to_owned()).or_default() += 1;
            Ok(())
        })
    }
}
