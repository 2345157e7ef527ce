use std::future::poll_fn;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use h2::client::SendRequest;
use h2::RecvStream;
use http::{Request, Response, StatusCode};
use log::info;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::Kind;
use crate::core::identity::LocalIdentity;
use crate::core::peerlink::PeerLinkManager;
use crate::core::registry::{DeviceClass, PeerRecord};
use crate::core::transfer::{FileDescriptor, RateEstimator, TransferProgress, TransferRecord, TransferTable};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

const MODEL_NAME: &str = "Windows PC";
const OVERALL_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_INTERVAL_MS: u128 = 100;
const UPLOAD_CHUNK: usize = 64 * 1024;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn local_peer_record(identity: &LocalIdentity) -> PeerRecord {
    PeerRecord {
        peer_id: identity.device_id.to_string(),
        display_name: identity.display_name.clone(),
        device_class: DeviceClass::WindowsPc,
        ip: None,
        port: None,
        metadata: HashMap::new(),
        first_seen: now_unix(),
        last_seen: now_unix(),
    }
}

/// The client-side sink for §4.9's progress reporting: bytes done, EWMA
/// rate, and ETA, ticked at most every 100 ms.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, progress: TransferProgress);
}

async fn read_full_body(body: &mut RecvStream) -> Result<Bytes, Kind> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| Kind::TransportFailure(e.to_string()))?;
        let len = chunk.len();
        buf.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(len);
    }
    Ok(Bytes::from(buf))
}

/// Sends `data` over `send_stream`, honoring h2's flow-control window
/// instead of buffering the whole chunk at once (important for large file
/// bodies).
async fn send_flow_controlled(send_stream: &mut h2::SendStream<Bytes>, mut data: Bytes, end_of_stream: bool) -> Result<(), Kind> {
    loop {
        if data.is_empty() {
            if end_of_stream {
                send_stream.send_data(Bytes::new(), true).map_err(|e| Kind::TransportFailure(e.to_string()))?;
            }
            return Ok(());
        }
        send_stream.reserve_capacity(data.len());
        let capacity = poll_fn(|cx| send_stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Kind::TransportFailure("stream closed while sending".into()))?
            .map_err(|e| Kind::TransportFailure(e.to_string()))?;
        let take = capacity.min(data.len());
        let chunk = data.split_to(take);
        let is_last = data.is_empty() && end_of_stream;
        send_stream.send_data(chunk, is_last).map_err(|e| Kind::TransportFailure(e.to_string()))?;
        if is_last {
            return Ok(());
        }
    }
}

async fn post_json(h2: &mut SendRequest<Bytes>, uri: &str, body: &Value) -> Result<Response<RecvStream>, Kind> {
    let payload = serde_json::to_vec(body).map_err(|e| Kind::ProtocolViolation(e.to_string()))?;
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(())
        .map_err(|e| Kind::ProtocolViolation(e.to_string()))?;
    let (response_fut, mut send_stream) = h2.send_request(request, false).map_err(|e| Kind::TransportFailure(e.to_string()))?;
    send_flow_controlled(&mut send_stream, Bytes::from(payload), true).await?;
    response_fut.await.map_err(|e| Kind::TransportFailure(e.to_string()))
}

/// AirDrop Client: the send-side three-phase orchestration of §4.9
/// (`/Discover` → `/Ask` → `/Upload`).
pub struct AirDropClient {
    identity: Arc<LocalIdentity>,
    peerlink: Arc<PeerLinkManager>,
    transfers: Arc<TransferTable>,
}

impl AirDropClient {
    pub fn new(identity: Arc<LocalIdentity>, peerlink: Arc<PeerLinkManager>, transfers: Arc<TransferTable>) -> Self {
        Self { identity, peerlink, transfers }
    }

    /// Starts a send, returning the `transfer_id` immediately; the transfer
    /// itself runs to completion (or failure) in a spawned task, reporting
    /// through `progress` and the shared transfer table's event stream.
    pub fn send(&self, peer: PeerRecord, files: Vec<FileDescriptor>, progress: Arc<dyn ProgressCallback>) -> Uuid {
        let local = local_peer_record(&self.identity);
        let record = TransferRecord::new_send(local.clone(), peer.clone(), files.clone());
        let transfer_id = record.transfer_id;
        let cancel = record.cancel.clone();
        self.transfers.insert(record);

        let identity = self.identity.clone();
        let peerlink = self.peerlink.clone();
        let transfers = self.transfers.clone();

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                OVERALL_TRANSFER_TIMEOUT,
                run_send(identity, peerlink, transfers.clone(), transfer_id, peer, local, files, progress, cancel),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = transfers.update(&transfer_id, |r| r.fail(e.to_string()));
                }
                Err(_) => {
                    let _ = transfers.update(&transfer_id, |r| r.fail("overall transfer timeout exceeded"));
                }
            }
        });

        transfer_id
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_send(
    identity: Arc<LocalIdentity>,
    peerlink: Arc<PeerLinkManager>,
    transfers: Arc<TransferTable>,
    transfer_id: Uuid,
    peer: PeerRecord,
    local: PeerRecord,
    files: Vec<FileDescriptor>,
    progress: Arc<dyn ProgressCallback>,
    cancel: CancellationToken,
) -> Result<(), Kind> {
    transfers.update(&transfer_id, |r| r.begin_connecting())?;

    let link = peerlink.connect(&peer).await?;
    let remote_addr = link.remote_addr;
    let (mut h2, connection) =
        h2::client::handshake(link.stream).await.map_err(|e| Kind::TransportFailure(e.to_string()))?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    h2.ready().await.map_err(|e| Kind::TransportFailure(e.to_string()))?;

    let discover_body = json!({
        "senderComputerName": local.display_name,
        "senderModelName": MODEL_NAME,
        "senderID": local.peer_id,
    });
    let discover_resp = tokio::time::timeout(DISCOVER_TIMEOUT, post_json(&mut h2, &format!("https://{}/Discover", remote_addr), &discover_body))
        .await
        .map_err(|_| Kind::TransportFailure("Discover timed out".into()))??;
    if !discover_resp.status().is_success() {
        return Err(Kind::TransportFailure(format!("Discover rejected with {}", discover_resp.status())));
    }
    let mut discover_body_stream = discover_resp.into_body();
    let _ = read_full_body(&mut discover_body_stream).await?;

    let files_json: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "fileName": f.name,
                "fileSize": f.size_bytes,
                "fileType": f.mime_type,
                "fileIsDirectory": f.is_directory,
            })
        })
        .collect();
    let ask_body = json!({
        "senderComputerName": local.display_name,
        "senderID": local.peer_id,
        "files": files_json,
    });
    let ask_resp = post_json(&mut h2, &format!("https://{}/Ask", remote_addr), &ask_body).await?;
    match ask_resp.status() {
        StatusCode::OK => {}
        StatusCode::FORBIDDEN => {
            transfers.update(&transfer_id, |r| r.fail("peer rejected the transfer"))?;
            return Err(Kind::PeerRejected);
        }
        StatusCode::REQUEST_TIMEOUT => {
            transfers.update(&transfer_id, |r| r.fail("approval timed out"))?;
            return Err(Kind::ApprovalTimeout);
        }
        other => return Err(Kind::TransportFailure(format!("Ask rejected with {}", other))),
    }
    let mut ask_body_stream = ask_resp.into_body();
    let _ = read_full_body(&mut ask_body_stream).await?;

    transfers.update(&transfer_id, |r| r.begin_transferring())?;

    let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
    let boundary = format!("opendrop-{}", Uuid::new_v4());
    let upload_request = Request::builder()
        .method("POST")
        .uri(format!("https://{}/Upload", remote_addr))
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(())
        .map_err(|e| Kind::ProtocolViolation(e.to_string()))?;
    let (upload_response_fut, mut send_stream) =
        h2.send_request(upload_request, false).map_err(|e| Kind::TransportFailure(e.to_string()))?;

    let mut rate = RateEstimator::new();
    let mut bytes_done = 0u64;
    let mut last_tick = Instant::now();

    for file in &files {
        if cancel.is_cancelled() {
            return Err(Kind::Cancelled);
        }
        let header = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            boundary = boundary,
            name = file.name,
        );
        send_flow_controlled(&mut send_stream, Bytes::from(header), false).await?;

        if let Some(path) = &file.path {
            bytes_done = stream_file(path, &mut send_stream, &cancel, &mut rate, &mut last_tick, bytes_done, total_bytes, &progress, &transfers, &transfer_id).await?;
        }

        send_flow_controlled(&mut send_stream, Bytes::from_static(b"\r\n"), false).await?;
    }
    let trailer = format!("--{}--\r\n", boundary);
    send_flow_controlled(&mut send_stream, Bytes::from(trailer), true).await?;

    let upload_resp = upload_response_fut.await.map_err(|e| Kind::TransportFailure(e.to_string()))?;
    if !upload_resp.status().is_success() {
        return Err(Kind::TransportFailure(format!("Upload failed with {}", upload_resp.status())));
    }
    let mut upload_body_stream = upload_resp.into_body();
    let _ = read_full_body(&mut upload_body_stream).await?;

    transfers.update(&transfer_id, |r| r.complete())?;
    info!("transfer {} completed, {} bytes sent", transfer_id, total_bytes);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn stream_file(
    path: &Path,
    send_stream: &mut h2::SendStream<Bytes>,
    cancel: &CancellationToken,
    rate: &mut RateEstimator,
    last_tick: &mut Instant,
    mut bytes_done: u64,
    total_bytes: u64,
    progress: &Arc<dyn ProgressCallback>,
    transfers: &Arc<TransferTable>,
    transfer_id: &Uuid,
) -> Result<u64, Kind> {
    let file = tokio::fs::File::open(path).await.map_err(|e| Kind::IoError(e.to_string()))?;
    let mut reader = tokio::io::BufReader::with_capacity(UPLOAD_CHUNK, file);
    let mut buf = vec![0u8; UPLOAD_CHUNK];

    loop {
        if cancel.is_cancelled() {
            return Err(Kind::Cancelled);
        }
        let n = reader.read(&mut buf).await.map_err(|e| Kind::IoError(e.to_string()))?;
        if n == 0 {
            break;
        }
        send_flow_controlled(send_stream, Bytes::copy_from_slice(&buf[..n]), false).await?;
        bytes_done += n as u64;

        if last_tick.elapsed().as_millis() >= NOTIFY_INTERVAL_MS {
            let rate_bps = rate.sample(bytes_done);
            let eta_seconds = rate.eta_seconds(bytes_done, total_bytes);
            transfers.report_progress(
                transfer_id,
                bytes_done,
                TransferProgress {
                    transfer_id: *transfer_id,
                    bytes_done,
                    total_bytes,
                    rate_bps,
                    eta_seconds,
                },
            );
            progress.on_progress(TransferProgress {
                transfer_id: *transfer_id,
                bytes_done,
                total_bytes,
                rate_bps,
                eta_seconds,
            });
            *last_tick = Instant::now();
        }
    }
    Ok(bytes_done)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Captured(std::sync::Mutex<Vec<TransferProgress>>);
    impl ProgressCallback for Captured {
        fn on_progress(&self, progress: TransferProgress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    #[test]
    fn local_peer_record_uses_identity_display_name() {
        let identity = LocalIdentity {
            device_id: uuid::Uuid::new_v4(),
            display_name: "My PC".to_string(),
            visibility: crate::core::config::Visibility::Everyone,
            save_dir: std::env::temp_dir(),
            email: String::new(),
            phone: String::new(),
            identity_hash: "deadbeef".to_string(),
            certificate: crate::core::identity::Certificate {
                cert_der: vec![],
                key_der: vec![],
                thumbprint: String::new(),
                not_before: 0,
                not_after: 0,
            },
        };
        let record = local_peer_record(&identity);
        assert_eq!(record.display_name, "My PC");
        assert_eq!(record.device_class, DeviceClass::WindowsPc);
    }

    #[test]
    fn progress_callback_trait_object_is_invokable() {
        let captured = Captured(std::sync::Mutex::new(Vec::new()));
        let cb: Arc<dyn ProgressCallback> = Arc::new(captured);
        cb.on_progress(TransferProgress {
            transfer_id: Uuid::new_v4(),
            bytes_done: 10,
            total_bytes: 100,
            rate_bps: 1.0,
            eta_seconds: Some(90.0),
        });
    }
}
