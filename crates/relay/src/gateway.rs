// Persistence hooks for live collaborative documents.
//
// `bind_state` hydrates a freshly opened document from its stored snapshot
// and subscribes to its update stream; every update schedules a coalesced
// write of the full state plus its JSON rendering. `write_state` is the
// final, immediate flush when the last collaborator leaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use folio_common::document::serialize_fragment;
use tracing::{debug, error, info, warn};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, TransactionAcqError, Update};

use crate::coalesce::{EffectFuture, UpdateCoalescer};
use crate::store::{SnapshotStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotDecodeError {
    #[error("failed to decode yjs update: {0}")]
    Decode(String),
    #[error("failed to apply yjs update: {0}")]
    Apply(String),
}

/// Owns the persistence hooks for every open document.
///
/// Constructed once at startup and shared behind an `Arc`.
pub struct PersistenceGateway {
    store: Arc<dyn SnapshotStore>,
    coalescer: UpdateCoalescer,
    fragment_name: Arc<str>,
    bindings: Mutex<HashMap<String, Subscription>>,
}

impl PersistenceGateway {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        coalescer: UpdateCoalescer,
        fragment_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            store,
            coalescer,
            fragment_name: fragment_name.into(),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn fragment_name(&self) -> &str {
        &self.fragment_name
    }

    pub fn coalescer(&self) -> &UpdateCoalescer {
        &self.coalescer
    }

    /// Hydrate `doc` from storage and start persisting its updates.
    ///
    /// Calling this again for an already bound id replaces the previous
    /// subscription; re-applying the stored snapshot is a CRDT no-op.
    pub async fn bind_state(self: &Arc<Self>, id: &str, doc: &Doc) {
        doc.get_or_insert_xml_fragment(self.fragment_name.as_ref());

        match self.store.load(id).await {
            Ok(Some(snapshot)) => match apply_update(doc, &snapshot) {
                Ok(()) => info!(doc_id = %id, bytes = snapshot.len(), "applied stored snapshot"),
                Err(error) => {
                    warn!(doc_id = %id, %error, "stored snapshot could not be applied; starting empty")
                }
            },
            Ok(None) => debug!(doc_id = %id, "no stored snapshot"),
            Err(error) => {
                warn!(doc_id = %id, %error, "failed to load snapshot; starting from empty state")
            }
        }

        let subscription = match self.observe_updates(id, doc) {
            Ok(subscription) => subscription,
            Err(error) => {
                error!(doc_id = %id, %error, "failed to subscribe to document updates");
                return;
            }
        };
        self.bindings().insert(id.to_owned(), subscription);
    }

    /// Persist `doc` immediately and stop observing it.
    pub async fn write_state(&self, id: &str, doc: &Doc) {
        let cancelled = self.coalescer.cancel(id);
        let result = self.coalescer.run_exclusive(id, self.persist(id, doc)).await;
        match result {
            Ok(()) => info!(doc_id = %id, superseded_pending = cancelled, "final snapshot persisted"),
            Err(error) => error!(doc_id = %id, %error, "failed to persist final snapshot"),
        }

        self.bindings().remove(id);
        self.coalescer.release(id);
    }

    /// Encode the full state and its JSON rendering from one read
    /// transaction and store both.
    pub async fn persist(&self, id: &str, doc: &Doc) -> Result<(), StoreError> {
        let fragment = doc.get_or_insert_xml_fragment(self.fragment_name.as_ref());
        let (snapshot, content) = {
            let txn = doc.transact();
            let snapshot = txn.encode_state_as_update_v1(&StateVector::default());
            let content = serialize_fragment(&fragment, &txn);
            (snapshot, content)
        };

        debug!(doc_id = %id, bytes = snapshot.len(), nodes = content.len(), "persisting snapshot");
        self.store.save(id, &snapshot, &content).await
    }

    /// Run every pending coalesced write now.
    pub async fn shutdown(&self) {
        let flushed = self.coalescer.flush_all().await;
        info!(flushed, "drained pending snapshot writes");
    }

    pub fn is_bound(&self, id: &str) -> bool {
        self.bindings().contains_key(id)
    }

    fn observe_updates(
        self: &Arc<Self>,
        id: &str,
        doc: &Doc,
    ) -> Result<Subscription, TransactionAcqError> {
        let gateway: Weak<Self> = Arc::downgrade(self);
        let observed = doc.clone();
        let id = id.to_owned();

        doc.observe_update_v1(move |_txn, event| {
            let Some(gateway) = gateway.upgrade() else {
                return;
            };
            debug!(doc_id = %id, bytes = event.update.len(), "document update observed");
            let doc = observed.clone();
            let doc_id = id.clone();
            let update = event.update.clone();
            let runner = Arc::clone(&gateway);

            gateway.coalescer.schedule(
                &id,
                Box::new(move || -> EffectFuture {
                    Box::pin(async move { runner.persist_coalesced(&doc_id, &doc, &update).await })
                }),
            );
        })
    }

    async fn persist_coalesced(&self, id: &str, doc: &Doc, update: &[u8]) {
        // No-op when the update is already integrated.
        if let Err(error) = apply_update(doc, update) {
            warn!(doc_id = %id, %error, "could not re-apply observed update");
        }

        match self.persist(id, doc).await {
            Ok(()) => info!(doc_id = %id, "persisted coalesced snapshot"),
            Err(error) => error!(doc_id = %id, %error, "failed to persist coalesced snapshot"),
        }
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Merge a v1-encoded update into `doc`. Already integrated updates are no-ops.
pub fn apply_update(doc: &Doc, payload: &[u8]) -> Result<(), SnapshotDecodeError> {
    let update =
        Update::decode_v1(payload).map_err(|error| SnapshotDecodeError::Decode(error.to_string()))?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|error| SnapshotDecodeError::Apply(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use folio_common::document::Node;
    use yrs::{GetString, Text, XmlElementPrelim, XmlFragment, XmlTextPrelim};

    use super::*;
    use crate::coalesce::CoalesceConfig;
    use crate::store::MemorySnapshotStore;

    const FRAGMENT: &str = "prosemirror";

    fn gateway(store: &Arc<MemorySnapshotStore>) -> Arc<PersistenceGateway> {
        let coalescer = UpdateCoalescer::new(CoalesceConfig::new(
            Duration::from_millis(3_000),
            Duration::from_millis(10_000),
        ));
        Arc::new(PersistenceGateway::new(
            Arc::clone(store) as Arc<dyn SnapshotStore>,
            coalescer,
            FRAGMENT,
        ))
    }

    fn push_paragraph(doc: &Doc, text: &str) {
        let fragment = doc.get_or_insert_xml_fragment(FRAGMENT);
        let mut txn = doc.transact_mut();
        let paragraph = fragment.push_back(&mut txn, XmlElementPrelim::empty("paragraph"));
        paragraph.push_back(&mut txn, XmlTextPrelim::new(text));
    }

    fn paragraphs(texts: &[&str]) -> Vec<Node> {
        texts
            .iter()
            .map(|text| Node::element("paragraph").with_content(vec![Node::text(*text)]))
            .collect()
    }

    fn rendered(doc: &Doc) -> Vec<Node> {
        let fragment = doc.get_or_insert_xml_fragment(FRAGMENT);
        let txn = doc.transact();
        serialize_fragment(&fragment, &txn)
    }

    fn encoded(doc: &Doc) -> Vec<u8> {
        doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    #[tokio::test(start_paused = true)]
    async fn bind_state_applies_stored_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let source = Doc::new();
        push_paragraph(&source, "from storage");
        store.save("doc", &encoded(&source), &rendered(&source)).await.expect("seed");

        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        assert!(gateway.is_bound("doc"));
        assert_eq!(rendered(&live), paragraphs(&["from storage"]));
    }

    #[tokio::test(start_paused = true)]
    async fn bind_state_on_unknown_document_starts_empty() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();

        gateway.bind_state("fresh", &live).await;

        assert!(rendered(&live).is_empty());
        assert!(live.transact().get_xml_fragment(FRAGMENT).is_some());
        assert_eq!(store.save_count("fresh").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_falls_back_to_empty_editable_document() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.fail_loads_for("doc").await;
        let gateway = gateway(&store);
        let live = Doc::new();

        gateway.bind_state("doc", &live).await;
        assert!(rendered(&live).is_empty());

        push_paragraph(&live, "still editable");
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        assert_eq!(store.save_count("doc").await, 1);
        assert_eq!(
            store.document("doc").await.expect("saved").content,
            paragraphs(&["still editable"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_snapshot_does_not_block_binding() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.save("doc", b"not a yjs update", &[]).await.expect("seed");
        let gateway = gateway(&store);
        let live = Doc::new();

        gateway.bind_state("doc", &live).await;

        assert!(gateway.is_bound("doc"));
        assert!(rendered(&live).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rebinding_does_not_duplicate_content_or_subscriptions() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();

        gateway.bind_state("doc", &live).await;
        push_paragraph(&live, "once");
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(store.save_count("doc").await, 1);

        // Simulated reconnect: the stored snapshot is applied a second time.
        gateway.bind_state("doc", &live).await;
        assert_eq!(rendered(&live), paragraphs(&["once"]));

        push_paragraph(&live, "twice");
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        // One subscription means one coalesced write for the new burst.
        assert_eq!(store.save_count("doc").await, 2);
        assert_eq!(
            store.document("doc").await.expect("saved").content,
            paragraphs(&["once", "twice"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_updates_produces_one_write_with_final_state() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        let texts = ["a", "b", "c", "d", "e"];
        for text in texts {
            push_paragraph(&live, text);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(store.save_count("doc").await, 0);

        tokio::time::sleep(Duration::from_millis(3_000)).await;

        assert_eq!(store.save_count("doc").await, 1);
        let stored = store.document("doc").await.expect("saved");
        assert_eq!(stored.content, paragraphs(&texts));
        assert_eq!(stored.data, encoded(&live));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_editing_is_persisted_within_wait_cap() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        // One edit per second never leaves a three second quiet gap.
        for second in 0..10 {
            push_paragraph(&live, &format!("edit {second}"));
            tokio::time::sleep(Duration::from_millis(1_000)).await;
        }
        // t = 10s: the wait cap forced exactly one write.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.save_count("doc").await, 1);
        assert_eq!(store.document("doc").await.expect("saved").content.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_on_one_document_does_not_delay_another() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.fail_saves_for("broken").await;
        let gateway = gateway(&store);
        let broken = Doc::new();
        let healthy = Doc::new();
        gateway.bind_state("broken", &broken).await;
        gateway.bind_state("healthy", &healthy).await;

        push_paragraph(&broken, "lost for now");
        push_paragraph(&healthy, "kept");
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        assert_eq!(store.save_count("broken").await, 0);
        assert_eq!(store.save_count("healthy").await, 1);

        // The failing document stays editable and the next burst retries.
        store.recover("broken").await;
        push_paragraph(&broken, "recovered");
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(
            store.document("broken").await.expect("saved after recovery").content,
            paragraphs(&["lost for now", "recovered"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_state_persists_immediately_and_cancels_pending_write() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        push_paragraph(&live, "last words");
        assert!(gateway.coalescer().is_pending("doc"));

        gateway.write_state("doc", &live).await;
        assert_eq!(store.save_count("doc").await, 1);
        assert_eq!(store.document("doc").await.expect("saved").content, paragraphs(&["last words"]));
        assert!(!gateway.is_bound("doc"));

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(store.save_count("doc").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_state_without_edits_still_saves() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        gateway.write_state("doc", &live).await;

        let stored = store.document("doc").await.expect("saved");
        assert!(stored.content.is_empty());
        assert_eq!(stored.data, encoded(&live));
    }

    #[tokio::test(start_paused = true)]
    async fn edits_after_unbinding_are_not_observed() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;
        gateway.write_state("doc", &live).await;

        push_paragraph(&live, "nobody listening");
        tokio::time::sleep(Duration::from_millis(11_000)).await;

        assert_eq!(store.save_count("doc").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_pending_writes() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        push_paragraph(&live, "pending");
        gateway.shutdown().await;

        assert_eq!(store.save_count("doc").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_update_is_persisted_through_the_same_path() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway(&store);
        let live = Doc::new();
        gateway.bind_state("doc", &live).await;

        let remote = Doc::new();
        let text = remote.get_or_insert_text("title");
        push_paragraph(&remote, "from a peer");
        {
            let mut txn = remote.transact_mut();
            text.insert(&mut txn, 0, "Notes");
        }
        apply_update(&live, &encoded(&remote)).expect("remote update applies");
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let stored = store.document("doc").await.expect("saved");
        assert_eq!(stored.content, paragraphs(&["from a peer"]));

        let restored = Doc::new();
        apply_update(&restored, &stored.data).expect("stored snapshot decodes");
        let title = restored.get_or_insert_text("title");
        assert_eq!(title.get_string(&restored.transact()), "Notes");
    }

    #[test]
    fn apply_update_rejects_garbage() {
        let doc = Doc::new();
        assert!(matches!(
            apply_update(&doc, b"\xff\xff\xff"),
            Err(SnapshotDecodeError::Decode(_)) | Err(SnapshotDecodeError::Apply(_))
        ));
    }
}
