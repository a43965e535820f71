//! Durable queue store
//!
//! An append-only JSONL journal: every state change appends a full envelope
//! snapshot, and on open the last snapshot per id wins. Corrupt or torn lines
//! are skipped. Opening also requeues envelopes a crash left in flight and
//! rewrites a compacted journal.
//!
//! After open, the journal file belongs to a dedicated writer thread. Store
//! methods hand it records and await its acknowledgement, so no runtime
//! worker ever blocks on a write or an fsync. The in-memory table only changes
//! once the write is acknowledged. Requests are queued in call order, which
//! keeps the journal in the same order as the table.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{AisbotError, Result};

use super::envelope::{DeliveryState, Envelope};

/// Journal records tolerated per live envelope before compaction is due.
const COMPACTION_FACTOR: usize = 4;
/// Journal records below which compaction is never due.
const COMPACTION_MIN_RECORDS: usize = 1024;

struct Journal {
    path: PathBuf,
    file: File,
    fsync: bool,
}

impl Journal {
    fn open_append(path: &Path, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                AisbotError::Storage(format!("Failed to open journal {}: {}", path.display(), e))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            fsync,
        })
    }

    fn append(&mut self, lines: &str) -> Result<()> {
        self.file
            .write_all(lines.as_bytes())
            .map_err(|e| AisbotError::Storage(format!("Failed to append to journal: {}", e)))?;
        if self.fsync {
            self.file
                .sync_data()
                .map_err(|e| AisbotError::Storage(format!("Failed to sync journal: {}", e)))?;
        }
        Ok(())
    }

    /// Write `content` to a temp file, swap it in and reopen for appends.
    fn rewrite(&mut self, content: &str) -> Result<()> {
        let path = self.path.clone();
        write_atomic(&path, content)?;
        *self = Self::open_append(&path, self.fsync)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        AisbotError::Storage(format!("Failed to compact journal {}: {}", path.display(), e))
    })
}

enum JournalOp {
    /// One or more newline-terminated records
    Append(String),
    /// Replace the whole journal
    Rewrite(String),
}

struct JournalRequest {
    op: JournalOp,
    done: oneshot::Sender<Result<()>>,
}

/// Handle to the thread that owns the journal file.
///
/// The thread exits once the handle is dropped and the queue is drained.
struct JournalWriter {
    tx: mpsc::UnboundedSender<JournalRequest>,
}

impl JournalWriter {
    fn spawn(mut journal: Journal) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalRequest>();
        std::thread::Builder::new()
            .name("aisbot-journal".into())
            .spawn(move || {
                while let Some(request) = rx.blocking_recv() {
                    let result = match &request.op {
                        JournalOp::Append(lines) => journal.append(lines),
                        JournalOp::Rewrite(content) => journal.rewrite(content),
                    };
                    // A dropped receiver means the caller was cancelled; the
                    // record is written regardless.
                    let _ = request.done.send(result);
                }
                debug!(path = %journal.path.display(), "Journal writer stopped");
            })
            .map_err(|e| {
                AisbotError::Storage(format!("Failed to start journal writer: {}", e))
            })?;
        Ok(Self { tx })
    }

    /// Queue `op` and wait until it is on disk.
    ///
    /// The request is queued before the first suspension point, so a caller
    /// cancelled while waiting still gets its record written, in order.
    async fn submit(&self, op: JournalOp) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.tx
            .send(JournalRequest { op, done })
            .map_err(|_| AisbotError::Storage("Journal writer stopped".into()))?;
        ack.await
            .map_err(|_| AisbotError::Storage("Journal writer stopped".into()))?
    }
}

fn render(envelopes: &[&Envelope]) -> Result<String> {
    let mut content = String::new();
    for env in envelopes {
        content.push_str(&serde_json::to_string(env)?);
        content.push('\n');
    }
    Ok(content)
}

/// Envelope table plus its (optional) journal.
pub struct QueueStore {
    envelopes: HashMap<String, Envelope>,
    writer: Option<JournalWriter>,
    /// Records in the journal file, live or superseded
    records: usize,
    /// Envelopes currently `done`
    done: usize,
    next_seq: u64,
    done_retention: usize,
}

impl QueueStore {
    /// In-memory store with no journal. `done` envelopes beyond
    /// `done_retention` are dropped as new ones complete.
    pub fn memory(done_retention: usize) -> Self {
        Self {
            envelopes: HashMap::new(),
            writer: None,
            records: 0,
            done: 0,
            next_seq: 1,
            done_retention,
        }
    }

    /// Open (or create) the journal at `path`.
    ///
    /// Replay and the initial rewrite run on the calling thread; every later
    /// write goes through the writer thread.
    pub fn open(path: &Path, fsync: bool, done_retention: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AisbotError::Storage(format!("Failed to create queue directory: {}", e))
            })?;
        }

        let mut envelopes = replay(path)?;
        let next_seq = envelopes.values().map(|e| e.seq).max().unwrap_or(0) + 1;

        let mut recovered = 0;
        for env in envelopes.values_mut() {
            if env.state == DeliveryState::InFlight {
                env.state = DeliveryState::Pending;
                env.claimed_at = None;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, path = %path.display(), "Requeued in-flight envelopes from journal");
        }

        let mut store = Self {
            envelopes,
            writer: None,
            records: 0,
            done: 0,
            next_seq,
            done_retention,
        };
        store.done = store.count_done();
        for id in store.expired_done() {
            store.remove(&id);
        }

        let content = render(&store.ordered())?;
        write_atomic(path, &content)?;
        store.records = store.envelopes.len();
        debug!(records = store.records, path = %path.display(), "Journal compacted");

        store.writer = Some(JournalWriter::spawn(Journal::open_append(path, fsync)?)?);
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.writer.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.envelopes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Envelope> {
        self.envelopes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.envelopes.values()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Assign the next sequence number and persist a new envelope.
    pub async fn insert(&mut self, mut envelope: Envelope) -> Result<Envelope> {
        envelope.seq = self.next_seq;
        // Consumed even if the write fails, so a seq is never reissued.
        self.next_seq += 1;
        self.persist(std::slice::from_ref(&envelope)).await?;
        self.apply(envelope.clone());
        Ok(envelope)
    }

    /// Persist a changed envelope. Memory is only updated once the journal
    /// write succeeded.
    pub async fn update(&mut self, envelope: Envelope) -> Result<()> {
        self.update_many(vec![envelope]).await
    }

    /// Persist several changed envelopes with a single journal write.
    pub async fn update_many(&mut self, envelopes: Vec<Envelope>) -> Result<()> {
        if let Some(missing) = envelopes.iter().find(|e| !self.contains(&e.id)) {
            return Err(AisbotError::NotFound(format!("envelope {}", missing.id)));
        }
        if envelopes.is_empty() {
            return Ok(());
        }
        self.persist(&envelopes).await?;
        for envelope in envelopes {
            self.apply(envelope);
        }
        if self.writer.is_none() && self.done > self.done_retention {
            for id in self.expired_done() {
                self.remove(&id);
            }
        }
        Ok(())
    }

    async fn persist(&mut self, envelopes: &[Envelope]) -> Result<()> {
        let Some(writer) = self.writer.as_ref() else {
            return Ok(());
        };
        let refs: Vec<&Envelope> = envelopes.iter().collect();
        writer.submit(JournalOp::Append(render(&refs)?)).await?;
        self.records += envelopes.len();
        Ok(())
    }

    fn apply(&mut self, envelope: Envelope) {
        let was_done = self
            .envelopes
            .get(&envelope.id)
            .is_some_and(|e| e.state == DeliveryState::Done);
        let is_done = envelope.state == DeliveryState::Done;
        match (was_done, is_done) {
            (false, true) => self.done += 1,
            (true, false) => self.done -= 1,
            _ => {}
        }
        self.envelopes.insert(envelope.id.clone(), envelope);
    }

    fn remove(&mut self, id: &str) {
        if let Some(env) = self.envelopes.remove(id) {
            if env.state == DeliveryState::Done {
                self.done -= 1;
            }
        }
    }

    /// True once the journal holds many more records than live envelopes,
    /// or, without a journal, once `done` envelopes exceed the retention.
    pub fn needs_compaction(&self) -> bool {
        if self.writer.is_some() {
            self.records > COMPACTION_MIN_RECORDS
                && self.records > self.envelopes.len() * COMPACTION_FACTOR
        } else {
            self.done > self.done_retention
        }
    }

    /// Forget old `done` envelopes beyond the retention window and rewrite
    /// the journal. Returns the number of envelopes dropped.
    pub async fn compact(&mut self) -> Result<usize> {
        let expired = self.expired_done();
        if let Some(writer) = self.writer.as_ref() {
            let kept: Vec<&Envelope> = self
                .ordered()
                .into_iter()
                .filter(|e| !expired.contains(&e.id))
                .collect();
            let records = kept.len();
            writer.submit(JournalOp::Rewrite(render(&kept)?)).await?;
            self.records = records;
            debug!(records, "Journal compacted");
        }
        for id in &expired {
            self.remove(id);
        }
        Ok(expired.len())
    }

    /// Ids of the oldest `done` envelopes beyond the retention window.
    fn expired_done(&self) -> Vec<String> {
        let mut done: Vec<(u64, &str)> = self
            .envelopes
            .values()
            .filter(|e| e.state == DeliveryState::Done)
            .map(|e| (e.seq, e.id.as_str()))
            .collect();
        if done.len() <= self.done_retention {
            return Vec::new();
        }
        done.sort_unstable();
        let excess = done.len() - self.done_retention;
        done.into_iter()
            .take(excess)
            .map(|(_, id)| id.to_string())
            .collect()
    }

    fn count_done(&self) -> usize {
        self.envelopes
            .values()
            .filter(|e| e.state == DeliveryState::Done)
            .count()
    }

    fn ordered(&self) -> Vec<&Envelope> {
        let mut ordered: Vec<&Envelope> = self.envelopes.values().collect();
        ordered.sort_by_key(|e| e.seq);
        ordered
    }
}

/// Load the last snapshot per id from a journal file.
fn replay(path: &Path) -> Result<HashMap<String, Envelope>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(AisbotError::Storage(format!(
                "Failed to read journal {}: {}",
                path.display(),
                e
            )))
        }
    };

    let mut envelopes = HashMap::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(line) {
            Ok(env) => {
                envelopes.insert(env.id.clone(), env);
            }
            Err(e) => warn!(line = index + 1, error = %e, "Skipping corrupt journal line"),
        }
    }
    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tempfile::TempDir;

    fn journal_lines(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    async fn complete(store: &mut QueueStore, content: &str) -> Envelope {
        let mut env = store
            .insert(Envelope::inbound("cli", "u", "1", content))
            .await
            .unwrap();
        env.state = DeliveryState::Done;
        store.update(env.clone()).await.unwrap();
        env
    }

    #[tokio::test]
    async fn test_memory_store_assigns_sequence() {
        let mut store = QueueStore::memory(10);
        let a = store.insert(Envelope::inbound("cli", "u", "1", "a")).await.unwrap();
        let b = store.insert(Envelope::inbound("cli", "u", "1", "b")).await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert!(!store.is_durable());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let mut store = QueueStore::memory(10);
        let env = Envelope::inbound("cli", "u", "1", "a");
        assert!(matches!(store.update(env).await, Err(AisbotError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_prunes_done_beyond_retention() {
        let mut store = QueueStore::memory(2);
        let mut done = Vec::new();
        for i in 0..5 {
            done.push(complete(&mut store, &i.to_string()).await);
        }
        let live = store.insert(Envelope::inbound("cli", "u", "1", "live")).await.unwrap();

        assert_eq!(store.len(), 3);
        assert!(!store.contains(&done[2].id));
        assert!(store.contains(&done[3].id));
        assert!(store.contains(&done[4].id));
        assert!(store.contains(&live.id));
        assert!(!store.needs_compaction());
    }

    #[tokio::test]
    async fn test_reopen_replays_last_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.jsonl");

        let id = {
            let mut store = QueueStore::open(&path, false, 10).unwrap();
            assert!(store.is_durable());
            let mut env = store
                .insert(Envelope::inbound("cli", "u", "1", "a"))
                .await
                .unwrap();
            env.state = DeliveryState::Failed;
            env.attempts = 1;
            store.update(env.clone()).await.unwrap();
            env.id
        };
        assert_eq!(journal_lines(&path), 2);

        let store = QueueStore::open(&path, false, 10).unwrap();
        let env = store.get(&id).unwrap();
        assert_eq!(env.state, DeliveryState::Failed);
        assert_eq!(env.attempts, 1);
        // Reopen compacts to one line per envelope.
        assert_eq!(journal_lines(&path), 1);
    }

    #[tokio::test]
    async fn test_reopen_requeues_in_flight_and_continues_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.jsonl");

        let id = {
            let mut store = QueueStore::open(&path, true, 10).unwrap();
            let mut env = store
                .insert(Envelope::inbound("cli", "u", "1", "a"))
                .await
                .unwrap();
            env.state = DeliveryState::InFlight;
            env.attempts = 1;
            env.claimed_at = Some(chrono::Utc::now());
            store.update(env.clone()).await.unwrap();
            env.id
        };

        let mut store = QueueStore::open(&path, true, 10).unwrap();
        let env = store.get(&id).unwrap();
        assert_eq!(env.state, DeliveryState::Pending);
        assert!(env.claimed_at.is_none());
        assert_eq!(env.attempts, 1);

        let next = store
            .insert(Envelope::inbound("cli", "u", "1", "b"))
            .await
            .unwrap();
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.jsonl");

        let good = serde_json::to_string(&Envelope::inbound("cli", "u", "1", "ok")).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n{{\"id\": \"torn", good)).unwrap();

        let store = QueueStore::open(&path, false, 10).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_compaction_keeps_recent_done() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.jsonl");
        let mut store = QueueStore::open(&path, false, 2).unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(complete(&mut store, &i.to_string()).await.id);
        }
        let pending = store
            .insert(Envelope::inbound("cli", "u", "1", "live"))
            .await
            .unwrap();
        assert_eq!(journal_lines(&path), 11);

        let dropped = store.compact().await.unwrap();
        assert_eq!(dropped, 3);
        assert!(!store.contains(&ids[0]));
        assert!(store.contains(&ids[3]));
        assert!(store.contains(&ids[4]));
        assert!(store.contains(&pending.id));
        assert_eq!(journal_lines(&path), 3);

        // Appends continue on the rewritten file.
        let mut live = pending.clone();
        live.state = DeliveryState::Failed;
        store.update(live).await.unwrap();
        assert_eq!(journal_lines(&path), 4);
    }

    #[tokio::test]
    async fn test_cancelled_write_still_lands_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.jsonl");

        let id = {
            let mut store = QueueStore::open(&path, false, 10).unwrap();
            let env = store
                .insert(Envelope::inbound("cli", "u", "1", "a"))
                .await
                .unwrap();

            let mut claimed = env.clone();
            claimed.state = DeliveryState::InFlight;
            claimed.attempts = 1;
            // Poll once, then drop the write mid-flight.
            let _ = store.update(claimed).now_or_never();

            let mut failed = env.clone();
            failed.state = DeliveryState::Failed;
            failed.attempts = 1;
            store.update(failed).await.unwrap();
            env.id
        };

        let store = QueueStore::open(&path, false, 10).unwrap();
        assert_eq!(store.get(&id).unwrap().state, DeliveryState::Failed);
    }
}
