use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::Kind;
use crate::core::events::TransferEvent;
use crate::core::registry::PeerRecord;

pub const IO_TIMEOUT: Duration = Duration::from_secs(60);
pub const NOTIFY_INTERVAL_MS: u128 = 100;
pub const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// One file's metadata, source or destination side (§3 `FileDescriptor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub uti: Option<String>,
    pub path: Option<PathBuf>,
    pub content_digest: Option<String>,
    pub created_at: Option<u64>,
    pub modified_at: Option<u64>,
    pub is_directory: bool,
    pub archive_relative_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Pending,
    AwaitingApproval,
    Approved,
    Rejected,
    Connecting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Rejected
                | TransferState::Failed
                | TransferState::Completed
                | TransferState::Cancelled
        )
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One in-flight exchange (§3 `TransferRecord`, §4.10 state machine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: Uuid,
    pub source: PeerRecord,
    pub destination: PeerRecord,
    pub direction: Direction,
    pub files: Vec<FileDescriptor>,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub state: TransferState,
    pub initiated_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
    #[serde(skip, default = "CancellationToken::new")]
    pub cancel: CancellationToken,
}

impl TransferRecord {
    fn new(
        source: PeerRecord,
        destination: PeerRecord,
        direction: Direction,
        files: Vec<FileDescriptor>,
        state: TransferState,
    ) -> Self {
        let total_bytes = files.iter().map(|f| f.size_bytes).sum();
        Self {
            transfer_id: Uuid::new_v4(),
            source,
            destination,
            direction,
            files,
            total_bytes,
            bytes_done: 0,
            state,
            initiated_at: now_unix(),
            started_at: None,
            completed_at: None,
            error: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn new_send(local: PeerRecord, peer: PeerRecord, files: Vec<FileDescriptor>) -> Self {
        Self::new(local, peer, Direction::Send, files, TransferState::Pending)
    }

    pub fn new_receive(peer: PeerRecord, local: PeerRecord, files: Vec<FileDescriptor>) -> Self {
        Self::new(peer, local, Direction::Receive, files, TransferState::AwaitingApproval)
    }

    fn transition(&mut self, to: TransferState) -> Result<(), Kind> {
        use TransferState::*;
        let allowed = match (self.state, to) {
            (Pending, Connecting) => true,
            (Pending, AwaitingApproval) => true,
            (AwaitingApproval, Approved) => true,
            (AwaitingApproval, Rejected) => true,
            (AwaitingApproval, Failed) => true,
            (Approved, Transferring) => true,
            (Connecting, Transferring) => true,
            (Connecting, Failed) => true,
            (Transferring, Completed) => true,
            (Transferring, Failed) => true,
            (_, Cancelled) if !self.state.is_terminal() => true,
            _ => false,
        };
        if !allowed {
            return Err(Kind::ProtocolViolation(format!(
                "illegal transfer state transition {:?} -> {:?}",
                self.state, to
            )));
        }
        self.state = to;
        if to.is_terminal() {
            self.completed_at = Some(now_unix());
        }
        Ok(())
    }

    pub fn begin_connecting(&mut self) -> Result<(), Kind> {
        self.transition(TransferState::Connecting)
    }

    pub fn approve(&mut self) -> Result<(), Kind> {
        self.transition(TransferState::Approved)
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<(), Kind> {
        self.transition(TransferState::Rejected)?;
        self.error = reason;
        Ok(())
    }

    pub fn begin_transferring(&mut self) -> Result<(), Kind> {
        self.transition(TransferState::Transferring)?;
        self.started_at = Some(now_unix());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), Kind> {
        self.transition(TransferState::Completed)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), Kind> {
        self.transition(TransferState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Flips the cancellation token and, unless already terminal, settles
    /// the record on `Cancelled` (§4.10, §5).
    pub fn cancel(&mut self) -> Result<(), Kind> {
        self.cancel.cancel();
        if self.state.is_terminal() {
            return Ok(());
        }
        self.transition(TransferState::Cancelled)
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id,
            bytes_done: self.bytes_done,
            total_bytes: self.total_bytes,
            rate_bps: 0.0,
            eta_seconds: None,
        }
    }
}

/// A progress sample reported at most every 100 ms (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transfer_id: Uuid,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub rate_bps: f64,
    pub eta_seconds: Option<f64>,
}

/// Exponentially-weighted moving average of throughput over roughly the
/// last second, used for the client's rate/ETA reporting (§4.9).
pub struct RateEstimator {
    last_sample_at: Instant,
    last_bytes: u64,
    ewma_bps: f64,
}

impl RateEstimator {
    const ALPHA: f64 = 0.3;

    pub fn new() -> Self {
        Self {
            last_sample_at: Instant::now(),
            last_bytes: 0,
            ewma_bps: 0.0,
        }
    }

    pub fn sample(&mut self, bytes_done: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta = bytes_done.saturating_sub(self.last_bytes) as f64;
            let instantaneous = delta / elapsed;
            self.ewma_bps = if self.ewma_bps == 0.0 {
                instantaneous
            } else {
                Self::ALPHA * instantaneous + (1.0 - Self::ALPHA) * self.ewma_bps
            };
        }
        self.last_sample_at = now;
        self.last_bytes = bytes_done;
        self.ewma_bps
    }

    pub fn eta_seconds(&self, bytes_done: u64, total_bytes: u64) -> Option<f64> {
        if self.ewma_bps <= 0.0 {
            return None;
        }
        let remaining = total_bytes.saturating_sub(bytes_done) as f64;
        Some(remaining / self.ewma_bps)
    }
}

/// Streams bytes from `reader` to `writer` in fixed-size chunks, reporting
/// progress at most every `NOTIFY_INTERVAL_MS`, and honoring `cancel` and
/// per-read/write timeouts. Shared by `/Upload` server-side writes and the
/// client's multipart body production.
pub async fn copy_pipeline<R, W, F>(
    mut reader: R,
    mut writer: W,
    total: u64,
    buffer_size: usize,
    cancel: CancellationToken,
    mut on_progress: F,
) -> Result<u64, Kind>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    F: FnMut(u64, u64) + Send + 'static,
{
    let (data_tx, mut data_rx) = mpsc::channel::<Result<Vec<u8>, Kind>>(CHANNEL_CAPACITY);
    let producer_cancel = cancel.clone();

    let producer_handle = tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            if producer_cancel.is_cancelled() {
                break;
            }
            let read_result = tokio::select! {
                _ = producer_cancel.cancelled() => break,
                r = tokio::time::timeout(IO_TIMEOUT, reader.read(&mut buf)) => r,
            };
            match read_result {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if data_tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    let _ = data_tx.send(Err(Kind::IoError(e.to_string()))).await;
                    break;
                }
                Err(_) => {
                    let _ = data_tx.send(Err(Kind::IoError("read timeout".into()))).await;
                    break;
                }
            }
        }
    });

    let mut written = 0u64;
    let mut last_reported = 0u64;
    let mut last_time = Instant::now();

    while let Some(chunk) = data_rx.recv().await {
        if cancel.is_cancelled() {
            producer_handle.abort();
            return Err(Kind::Cancelled);
        }
        let chunk = chunk?;
        tokio::select! {
            _ = cancel.cancelled() => {
                producer_handle.abort();
                return Err(Kind::Cancelled);
            }
            res = tokio::time::timeout(IO_TIMEOUT, writer.write_all(&chunk)) => {
                res.map_err(|_| Kind::IoError("write timeout".into()))?
                    .map_err(|e| Kind::IoError(e.to_string()))?;
            }
        }
        written += chunk.len() as u64;

        let now = Instant::now();
        let elapsed_ms = now.duration_since(last_time).as_millis();
        if written - last_reported >= 64 * 1024 && elapsed_ms as u128 > NOTIFY_INTERVAL_MS || written == total {
            on_progress(written, total);
            last_reported = written;
            last_time = now;
        }
    }

    if let Err(e) = producer_handle.await {
        if e.is_cancelled() {
            return Err(Kind::Cancelled);
        }
        return Err(Kind::IoError(format!("pipeline producer panicked: {}", e)));
    }
    Ok(written)
}

/// Shared transfer table: one mutex per `TransferRecord`, a lock-free
/// top-level map (§5), mirroring `core::registry::DeviceRegistry`'s shape.
pub struct TransferTable {
    transfers: Arc<DashMap<Uuid, Arc<Mutex<TransferRecord>>>>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferTable {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                transfers: Arc::new(DashMap::new()),
                events_tx: tx,
            },
            rx,
        )
    }

    pub fn insert(&self, record: TransferRecord) -> Uuid {
        let id = record.transfer_id;
        let _ = self.events_tx.send(TransferEvent::Requested(record.clone()));
        self.transfers.insert(id, Arc::new(Mutex::new(record)));
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Mutex<TransferRecord>>> {
        self.transfers.get(id).map(|r| r.clone())
    }

    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.transfers.iter().map(|kv| kv.value().lock().unwrap().clone()).collect()
    }

    /// Applies `f` to the record under its own lock, then emits the
    /// matching terminal/progress event based on the resulting state.
    pub fn update<F>(&self, id: &Uuid, f: F) -> Result<(), Kind>
    where
        F: FnOnce(&mut TransferRecord) -> Result<(), Kind>,
    {
        let slot = self.transfers.get(id).map(|r| r.clone()).ok_or_else(|| {
            Kind::ProtocolViolation(format!("unknown transfer {}", id))
        })?;
        let mut record = slot.lock().unwrap();
        f(&mut record)?;
        let snapshot = record.clone();
        drop(record);
        self.emit_for_state(snapshot);
        Ok(())
    }

    pub fn report_progress(&self, id: &Uuid, bytes_done: u64, progress: TransferProgress) {
        if let Some(slot) = self.transfers.get(id) {
            slot.lock().unwrap().bytes_done = bytes_done;
        }
        let _ = self.events_tx.send(TransferEvent::ProgressUpdated(progress));
    }

    fn emit_for_state(&self, record: TransferRecord) {
        let event = match record.state {
            TransferState::Completed => TransferEvent::Completed(record),
            TransferState::Failed => TransferEvent::Failed(record),
            TransferState::Rejected => TransferEvent::Rejected(record),
            TransferState::Cancelled => TransferEvent::Cancelled(record),
            _ => return,
        };
        let _ = self.events_tx.send(event);
        debug!("transfer event emitted");
    }

    pub fn remove(&self, id: &Uuid) {
        if self.transfers.remove(id).is_none() {
            warn!("attempted to remove unknown transfer {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::DeviceClass;

    fn peer(id: &str) -> PeerRecord {
        PeerRecord {
            peer_id: id.to_string(),
            display_name: id.to_string(),
            device_class: DeviceClass::Mac,
            ip: None,
            port: None,
            metadata: Default::default(),
            first_seen: 0,
            last_seen: 0,
        }
    }

    fn file(name: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            name: name.to_string(),
            size_bytes: size,
            mime_type: None,
            uti: None,
            path: None,
            content_digest: None,
            created_at: None,
            modified_at: None,
            is_directory: false,
            archive_relative_path: None,
        }
    }

    #[test]
    fn send_path_follows_pending_connecting_transferring_completed() {
        let mut record = TransferRecord::new_send(peer("me"), peer("them"), vec![file("a.txt", 10)]);
        assert_eq!(record.state, TransferState::Pending);
        record.begin_connecting().unwrap();
        record.transition(TransferState::Transferring).unwrap();
        record.complete().unwrap();
        assert_eq!(record.state, TransferState::Completed);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn receive_path_rejection_is_terminal() {
        let mut record = TransferRecord::new_receive(peer("them"), peer("me"), vec![file("a.txt", 10)]);
        record.reject(Some("no thanks".into())).unwrap();
        assert_eq!(record.state, TransferState::Rejected);
        assert_eq!(record.error.as_deref(), Some("no thanks"));
        assert!(record.approve().is_err());
    }

    #[test]
    fn cancel_after_terminal_is_a_no_op_on_state() {
        let mut record = TransferRecord::new_send(peer("me"), peer("them"), vec![file("a.txt", 10)]);
        record.begin_connecting().unwrap();
        record.transition(TransferState::Transferring).unwrap();
        record.complete().unwrap();
        record.cancel().unwrap();
        assert_eq!(record.state, TransferState::Completed);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut record = TransferRecord::new_send(peer("me"), peer("them"), vec![file("a.txt", 10)]);
        assert!(record.complete().is_err());
        assert_eq!(record.state, TransferState::Pending);
    }

    #[tokio::test]
    async fn table_emits_requested_then_completed() {
        let (table, mut rx) = TransferTable::new();
        let record = TransferRecord::new_send(peer("me"), peer("them"), vec![file("a.txt", 10)]);
        let id = record.transfer_id;
        table.insert(record);
        match rx.recv().await.unwrap() {
            TransferEvent::Requested(r) => assert_eq!(r.transfer_id, id),
            other => panic!("expected Requested, got {:?}", other),
        }

        table.update(&id, |r| r.begin_connecting()).unwrap();
        assert_eq!(table.get(&id).unwrap().lock().unwrap().state, TransferState::Connecting);
    }
}
