use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use futures::Stream;
use h2::server::{self, SendResponse};
use h2::RecvStream;
use http::{Request, Response, StatusCode};
use log::{error, warn};
use multer::Multipart;
use serde_json::{json, Value};
use tokio::fs::{self as tokio_fs, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::config::ServerConfig as ServerSettings;
use crate::core::error::Kind;
use crate::core::identity::LocalIdentity;
use crate::core::notification::{request_approval, ApprovalCallback, Decision};
use crate::core::peerlink::{PeerLink, TcpPeerLinkListener};
use crate::core::registry::{DeviceClass, PeerRecord};
use crate::core::transfer::{FileDescriptor, TransferRecord, TransferTable};
use crate::core::utils;

const MODEL_NAME: &str = "Windows PC";
const ASK_CORRELATION_WINDOW: Duration = Duration::from_secs(5 * 60);

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ci_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_object()?.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v)
}

fn ci_str(value: &Value, key: &str) -> String {
    ci_get(value, key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn ci_u64(value: &Value, key: &str) -> u64 {
    ci_get(value, key).and_then(Value::as_u64).unwrap_or(0)
}

fn ci_bool(value: &Value, key: &str) -> bool {
    ci_get(value, key).and_then(Value::as_bool).unwrap_or(false)
}

/// An approved `/Ask`, waiting for its matching `/Upload` from the same
/// TLS connection identity within the correlation window (§4.8).
struct PendingUpload {
    transfer_id: Uuid,
    save_path: Option<PathBuf>,
    approved_at: Instant,
}

async fn read_full_body(body: &mut RecvStream) -> anyhow::Result<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.context("reading request body")?;
        let len = chunk.len();
        buf.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(len);
    }
    Ok(Bytes::from(buf))
}

/// Adapts an h2 body into the `Stream<Item = Result<Bytes, _>>` `multer`
/// expects, releasing flow-control capacity as each chunk is consumed.
fn body_stream(body: RecvStream) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(body, |mut body| async move {
        match body.data().await {
            Some(Ok(chunk)) => {
                let len = chunk.len();
                let _ = body.flow_control().release_capacity(len);
                Some((Ok(chunk), body))
            }
            Some(Err(e)) => Some((Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())), body)),
            None => None,
        }
    })
}

async fn respond_json(mut respond: SendResponse<Bytes>, status: StatusCode, body: Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(&body)?;
    let response = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(())
        .context("building response")?;
    let mut send_stream = respond.send_response(response, false).context("send_response failed")?;
    send_stream
        .send_data(Bytes::from(payload), true)
        .context("send_data failed")?;
    Ok(())
}

/// HTTP/2 listener for the three `/Discover` `/Ask` `/Upload` endpoints
/// (§4.8), served over an already-TLS-wrapped `PeerLink`.
pub struct AirDropServer {
    identity: Arc<LocalIdentity>,
    save_dir: PathBuf,
    auto_accept: bool,
    approval_timeout: Duration,
    buffer_size: usize,
    preserve_timestamps: bool,
    transfers: Arc<TransferTable>,
    approval: Arc<dyn ApprovalCallback>,
    pending_uploads: Mutex<HashMap<String, PendingUpload>>,
    concurrency: Arc<Semaphore>,
}

impl AirDropServer {
    pub fn new(
        identity: Arc<LocalIdentity>,
        save_dir: PathBuf,
        transfers: Arc<TransferTable>,
        approval: Arc<dyn ApprovalCallback>,
        settings: &ServerSettings,
        preserve_timestamps: bool,
        max_concurrent_transfers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            save_dir,
            auto_accept: settings.auto_accept,
            approval_timeout: Duration::from_secs(settings.approval_timeout_s),
            buffer_size: settings.buffer_size,
            preserve_timestamps,
            transfers,
            approval,
            pending_uploads: Mutex::new(HashMap::new()),
            concurrency: Arc::new(Semaphore::new(max_concurrent_transfers.max(1))),
        })
    }

    /// Accepts peer links forever, one task per connection (teacher's
    /// `start_service` accept-loop shape).
    pub async fn serve(self: Arc<Self>, listener: TcpPeerLinkListener) -> Result<(), Kind> {
        loop {
            let link = match listener.accept().await {
                Ok(link) => link,
                Err(e) => {
                    warn!("peer-link accept failed: {}", e);
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(link).await {
                    warn!("connection handling ended: {}", e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, link: PeerLink) -> anyhow::Result<()> {
        let thumbprint = link.peer_cert_thumbprint.clone().unwrap_or_default();
        let remote_addr = link.remote_addr;
        let mut connection = server::handshake(link.stream).await.context("h2 server handshake failed")?;

        while let Some(result) = connection.accept().await {
            let (request, respond) = result.context("h2 accept failed")?;
            let server = self.clone();
            let thumbprint = thumbprint.clone();
            tokio::spawn(async move {
                if let Err(e) = server.route(request, respond, thumbprint, remote_addr).await {
                    error!("request handling failed from {}: {}", remote_addr, e);
                }
            });
        }
        Ok(())
    }

    async fn route(
        self: Arc<Self>,
        request: Request<RecvStream>,
        respond: SendResponse<Bytes>,
        thumbprint: String,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        match request.uri().path() {
            "/Discover" => self.handle_discover(request, respond).await,
            "/Ask" => self.handle_ask(request, respond, thumbprint, remote_addr).await,
            "/Upload" => self.handle_upload(request, respond, thumbprint).await,
            other => {
                respond_json(
                    respond,
                    StatusCode::NOT_FOUND,
                    json!({ "message": format!("unknown endpoint {}", other) }),
                )
                .await
            }
        }
    }

    async fn handle_discover(&self, request: Request<RecvStream>, respond: SendResponse<Bytes>) -> anyhow::Result<()> {
        let mut body = request.into_body();
        let _ = read_full_body(&mut body).await?;
        respond_json(
            respond,
            StatusCode::OK,
            json!({
                "receiverComputerName": self.identity.display_name,
                "receiverModelName": MODEL_NAME,
                "receiverMediaCapabilities": {
                    "Files": true,
                    "Photos": true,
                    "Videos": true,
                    "Contacts": false,
                    "Urls": true,
                }
            }),
        )
        .await
    }

    async fn handle_ask(
        self: Arc<Self>,
        request: Request<RecvStream>,
        respond: SendResponse<Bytes>,
        thumbprint: String,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let mut body = request.into_body();
        let raw = read_full_body(&mut body).await?;
        let value: Value = serde_json::from_slice(&raw).context("invalid /Ask JSON")?;

        let sender_name = ci_str(&value, "senderComputerName");
        let sender_id = ci_str(&value, "senderID");
        let files: Vec<FileDescriptor> = ci_get(&value, "files")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|f| FileDescriptor {
                        name: ci_str(f, "fileName"),
                        size_bytes: ci_u64(f, "fileSize"),
                        mime_type: ci_get(f, "fileType").and_then(Value::as_str).map(str::to_string),
                        uti: None,
                        path: None,
                        content_digest: None,
                        created_at: None,
                        modified_at: None,
                        is_directory: ci_bool(f, "fileIsDirectory"),
                        archive_relative_path: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let sender = PeerRecord {
            peer_id: if sender_id.is_empty() { remote_addr.to_string() } else { sender_id },
            display_name: sender_name,
            device_class: DeviceClass::Unknown,
            ip: Some(remote_addr.ip()),
            port: Some(remote_addr.port()),
            metadata: HashMap::new(),
            first_seen: now_unix(),
            last_seen: now_unix(),
        };
        let local = PeerRecord {
            peer_id: self.identity.device_id.to_string(),
            display_name: self.identity.display_name.clone(),
            device_class: DeviceClass::WindowsPc,
            ip: None,
            port: None,
            metadata: HashMap::new(),
            first_seen: now_unix(),
            last_seen: now_unix(),
        };

        let record = TransferRecord::new_receive(sender, local, files);
        let transfer_id = self.transfers.insert(record.clone());

        let decision = if self.auto_accept {
            Decision::Approve { save_path: None }
        } else {
            match request_approval(self.approval.as_ref(), &record, self.approval_timeout).await {
                Ok(d) => d,
                Err(Kind::ApprovalTimeout) => {
                    let _ = self.transfers.update(&transfer_id, |r| r.fail("approval timed out"));
                    return respond_json(
                        respond,
                        StatusCode::REQUEST_TIMEOUT,
                        json!({ "receiverComputerName": self.identity.display_name, "receiverModelName": MODEL_NAME }),
                    )
                    .await;
                }
                Err(e) => {
                    let _ = self.transfers.update(&transfer_id, |r| r.fail(e.to_string()));
                    return respond_json(respond, StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": e.to_string() })).await;
                }
            }
        };

        match decision {
            Decision::Approve { save_path } => {
                self.transfers.update(&transfer_id, |r| r.approve())?;
                self.pending_uploads.lock().unwrap().insert(
                    thumbprint,
                    PendingUpload {
                        transfer_id,
                        save_path,
                        approved_at: Instant::now(),
                    },
                );
                respond_json(
                    respond,
                    StatusCode::OK,
                    json!({ "receiverComputerName": self.identity.display_name, "receiverModelName": MODEL_NAME }),
                )
                .await
            }
            Decision::Reject { reason } => {
                self.transfers.update(&transfer_id, |r| r.reject(reason))?;
                respond_json(
                    respond,
                    StatusCode::FORBIDDEN,
                    json!({ "receiverComputerName": self.identity.display_name, "receiverModelName": MODEL_NAME }),
                )
                .await
            }
        }
    }

    async fn handle_upload(self: Arc<Self>, request: Request<RecvStream>, respond: SendResponse<Bytes>, thumbprint: String) -> anyhow::Result<()> {
        let pending = self.pending_uploads.lock().unwrap().remove(&thumbprint);
        let pending = match pending {
            Some(p) if p.approved_at.elapsed() <= ASK_CORRELATION_WINDOW => p,
            _ => {
                return respond_json(
                    respond,
                    StatusCode::CONFLICT,
                    json!({ "success": false, "filesReceived": 0, "message": "no approved /Ask precedes this /Upload" }),
                )
                .await;
            }
        };

        let content_type = request
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let boundary = match content_type.as_deref().and_then(|ct| multer::parse_boundary(ct).ok()) {
            Some(b) => b,
            None => {
                let _ = self.transfers.update(&pending.transfer_id, |r| r.fail("missing multipart boundary"));
                return respond_json(
                    respond,
                    StatusCode::BAD_REQUEST,
                    json!({ "success": false, "filesReceived": 0, "message": "missing multipart boundary" }),
                )
                .await;
            }
        };

        let _permit = self.concurrency.acquire().await.ok();
        self.transfers.update(&pending.transfer_id, |r| r.begin_transferring())?;

        let cancel = self
            .transfers
            .get(&pending.transfer_id)
            .map(|r| r.lock().unwrap().cancel.clone())
            .unwrap_or_else(tokio_util::sync::CancellationToken::new);

        let save_dir = pending.save_path.clone().unwrap_or_else(|| self.save_dir.clone());
        tokio_fs::create_dir_all(&save_dir).await.ok();

        let stream = body_stream(request.into_body());
        let mut multipart = Multipart::new(stream, boundary);

        let mut files_received = 0u32;
        let mut written_paths: Vec<(PathBuf, String)> = Vec::new();
        let mut timestamps: HashMap<String, String> = HashMap::new();

        let result: anyhow::Result<()> = async {
            loop {
                let mut field = tokio::select! {
                    _ = cancel.cancelled() => return Err(anyhow::anyhow!("transfer cancelled")),
                    f = multipart.next_field() => match f.context("multipart read failed")? {
                        Some(f) => f,
                        None => break,
                    },
                };
                let field_name = field.name().unwrap_or_default().to_string();

                if field_name.ends_with("_timestamp") {
                    let base = field_name.trim_end_matches("_timestamp").to_string();
                    if let Ok(text) = field.text().await {
                        timestamps.insert(base, text);
                    }
                    continue;
                }

                let raw_name = field.file_name().map(str::to_string).unwrap_or_else(|| field_name.clone());
                if raw_name.is_empty() {
                    continue;
                }

                let target_path = utils::get_unique_path(&save_dir, &raw_name);
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&target_path)
                    .await?;

                let mut written_this_file = 0u64;
                let mut buffer: Vec<u8> = Vec::with_capacity(self.buffer_size);
                let write_result: anyhow::Result<()> = async {
                    loop {
                        let chunk = tokio::select! {
                            _ = cancel.cancelled() => return Err(anyhow::anyhow!("transfer cancelled")),
                            c = field.chunk() => c.context("multipart chunk read failed")?,
                        };
                        let chunk = match chunk {
                            Some(c) => c,
                            None => break,
                        };
                        buffer.extend_from_slice(&chunk);
                        if buffer.len() >= self.buffer_size {
                            file.write_all(&buffer).await?;
                            written_this_file += buffer.len() as u64;
                            buffer.clear();
                        }
                    }
                    if !buffer.is_empty() {
                        file.write_all(&buffer).await?;
                        written_this_file += buffer.len() as u64;
                    }
                    file.flush().await?;
                    Ok(())
                }
                .await;

                if let Err(e) = write_result {
                    drop(file);
                    let _ = tokio_fs::remove_file(&target_path).await;
                    return Err(e);
                }

                if written_this_file == 0 {
                    let _ = tokio_fs::remove_file(&target_path).await;
                    warn!("skipped empty upload part {}", raw_name);
                    continue;
                }

                files_received += 1;
                written_paths.push((target_path, field_name));
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            for (path, _) in &written_paths {
                let _ = tokio_fs::remove_file(path).await;
            }
            if cancel.is_cancelled() {
                let _ = self.transfers.update(&pending.transfer_id, |r| r.cancel());
                return respond_json(
                    respond,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "filesReceived": 0, "message": "transfer cancelled" }),
                )
                .await;
            }
            let _ = self.transfers.update(&pending.transfer_id, |r| r.fail(e.to_string()));
            return respond_json(
                respond,
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "filesReceived": 0, "message": e.to_string() }),
            )
            .await;
        }

        if self.preserve_timestamps {
            for (path, field_name) in &written_paths {
                if let Some(ts) = timestamps.get(field_name) {
                    if let Ok(parsed) = time::OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339) {
                        let secs = parsed.unix_timestamp().max(0) as u64;
                        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
                        if let Ok(std_file) = std::fs::OpenOptions::new().write(true).open(path) {
                            let _ = std_file.set_modified(modified);
                        }
                    }
                }
            }
        }

        self.transfers.update(&pending.transfer_id, |r| r.complete())?;

        respond_json(
            respond,
            StatusCode::OK,
            json!({ "success": true, "filesReceived": files_received, "message": "ok" }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ci_lookup_ignores_key_case() {
        let value = json!({ "SenderComputerName": "Alice's Mac" });
        assert_eq!(ci_str(&value, "senderComputerName"), "Alice's Mac");
    }

    #[test]
    fn ci_lookup_missing_key_yields_default() {
        let value = json!({ "other": 1 });
        assert_eq!(ci_str(&value, "senderComputerName"), "");
        assert_eq!(ci_u64(&value, "fileSize"), 0);
        assert!(!ci_bool(&value, "fileIsDirectory"));
    }
}
