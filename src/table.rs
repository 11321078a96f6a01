use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};

use crate::log_writer::RotatingWriter;
use crate::record::{ManagedProcess, Target};
use crate::supervisor::SupervisorEvent;

/// Everything the rest of the daemon needs to talk to one supervised record:
/// its immutable id, a sender into its supervisor's FIFO event queue, and the
/// record's own mutable fields behind a per-record lock (SPEC_FULL §4.4:
/// "field updates driven by a record's own supervisor do not need this
/// [table] lock").
pub struct RecordHandle {
    pub id: u32,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
    pub fields: AsyncMutex<ManagedProcess>,
    /// The (stdout, stderr) writers backing the currently running child, if
    /// any. Set by the supervisor around a run so RPC handlers (`flush`) can
    /// truncate through the live writer's own mutex and byte counter instead
    /// of racing it with a bare filesystem truncate (SPEC_FULL §4.1, §4.6
    /// `flush`).
    pub current_writers: AsyncMutex<Option<(Arc<RotatingWriter>, Arc<RotatingWriter>)>>,
}

impl RecordHandle {
    pub async fn snapshot(&self) -> ManagedProcess {
        self.fields.lock().await.clone()
    }
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<u32, Arc<RecordHandle>>,
    names: HashMap<String, u32>,
    next_id: u32,
}

/// Holds every managed record by id and by name, per SPEC_FULL §4.4.
///
/// Grounded on the teacher's `Runner { id: id::Id, list: BTreeMap<usize,
/// Process> }`, generalized to key on a `u32` id and store handles to
/// concurrently-mutable records instead of plain data, since GoPM updates
/// fields from an owning supervisor task rather than a single-threaded CLI.
pub struct ProcessTable {
    inner: RwLock<Inner>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Allocate the next id. Ids are handed out in increasing order and never
    /// reused, even after the record they named is deleted (§4.3 "Tie-breaks").
    pub async fn allocate_id(&self) -> u32 {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Raise the next-id counter so a freshly allocated id never collides
    /// with one loaded from the dump file by `resurrect` (SPEC_FULL §4.5).
    pub async fn ensure_next_id_above(&self, id: u32) {
        let mut inner = self.inner.write().await;
        if inner.next_id <= id {
            inner.next_id = id + 1;
        }
    }

    /// Register a freshly constructed handle under the table-wide lock.
    pub async fn insert(&self, handle: Arc<RecordHandle>) {
        let mut inner = self.inner.write().await;
        let name = handle.fields.lock().await.name.clone();
        inner.names.insert(name, handle.id);
        inner.records.insert(handle.id, handle);
    }

    pub async fn remove(&self, id: u32) -> Option<Arc<RecordHandle>> {
        let mut inner = self.inner.write().await;
        let handle = inner.records.remove(&id)?;
        let name = handle.fields.lock().await.name.clone();
        inner.names.remove(&name);
        Some(handle)
    }

    pub async fn by_id(&self, id: u32) -> Option<Arc<RecordHandle>> {
        self.inner.read().await.records.get(&id).cloned()
    }

    pub async fn by_name(&self, name: &str) -> Option<Arc<RecordHandle>> {
        let inner = self.inner.read().await;
        let id = inner.names.get(name)?;
        inner.records.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<RecordHandle>> {
        self.inner.read().await.records.values().cloned().collect()
    }

    /// Resolve a [`Target`] to the matching handles, per SPEC_FULL §4.4.
    pub async fn resolve(&self, target: &Target) -> Vec<Arc<RecordHandle>> {
        match target {
            Target::All => self.all().await,
            Target::Id(id) => self.by_id(*id).await.into_iter().collect(),
            Target::Name(name) => self.by_name(name).await.into_iter().collect(),
        }
    }

    /// Deep-copy snapshot of every record, for `list`/persistence.
    pub async fn list(&self) -> Vec<ManagedProcess> {
        let handles = self.all().await;
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.snapshot().await);
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RestartPolicy, Status};
    use chrono::Utc;
    use std::collections::BTreeMap as StdBTreeMap;

    fn sample(id: u32, name: &str) -> ManagedProcess {
        ManagedProcess {
            id,
            name: name.to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
            interpreter: None,
            cwd: "/".to_string(),
            env: StdBTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            status: Status::Stopped,
            status_reason: None,
            pid: 0,
            restart_count: 0,
            last_start: None,
            created_at: Utc::now(),
            last_exit_code: None,
            cpu_percent: 0.0,
            memory_rss_bytes: 0,
            log_out_path: format!("/tmp/{name}-out.log"),
            log_err_path: format!("/tmp/{name}-err.log"),
            log_max_size_bytes: 10 * 1024 * 1024,
            log_max_files: 5,
        }
    }

    fn handle(id: u32, name: &str) -> Arc<RecordHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(RecordHandle {
            id,
            events: tx,
            fields: AsyncMutex::new(sample(id, name)),
            current_writers: AsyncMutex::new(None),
        })
    }

    #[tokio::test]
    async fn ids_increase_and_never_reuse_deleted_ones() {
        let table = ProcessTable::new();
        let a = table.allocate_id().await;
        let b = table.allocate_id().await;
        table.insert(handle(a, "a")).await;
        table.remove(a).await;
        let c = table.allocate_id().await;
        assert_eq!([a, b, c], [0, 1, 2]);
    }

    #[tokio::test]
    async fn resolves_by_id_name_and_all() {
        let table = ProcessTable::new();
        table.insert(handle(0, "api")).await;
        table.insert(handle(1, "worker")).await;

        assert_eq!(table.resolve(&Target::Id(0)).await.len(), 1);
        assert_eq!(table.resolve(&Target::Name("worker".to_string())).await.len(), 1);
        assert_eq!(table.resolve(&Target::All).await.len(), 2);
        assert_eq!(table.resolve(&Target::Name("missing".to_string())).await.len(), 0);
    }

    #[tokio::test]
    async fn remove_clears_both_indexes() {
        let table = ProcessTable::new();
        table.insert(handle(0, "api")).await;
        table.remove(0).await;

        assert!(table.by_id(0).await.is_none());
        assert!(table.by_name("api").await.is_none());
    }
}
