//! One-shot file transfer between nodes
//!
//! A node stages a file under a random handle and hands out a link
//! `host:port/handle`. Whoever holds the link connects, sends the 16 bytes
//! of the handle and reads the file until EOF. Each handle is redeemable
//! once; the source file is deleted after it has been sent. A send that
//! fails part way puts the handle back so the link can be redeemed again.
//! There is no resumption and no integrity check beyond the stream
//! completing, and a staged file nobody fetches stays registered until
//! shutdown. Peers that do not finish the handshake in time are dropped.

mod tls;

use crate::config::{ClusterTlsConfig, TransferConfig};
use crate::error::{ClusterError, Result};
use crate::metrics;
use crate::node::AddressResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tls::{BoxedStream, TransferTls};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handshake length: the handle as a big-endian 128-bit integer
const HANDSHAKE_LEN: usize = 16;

/// Where a staged file can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferLink {
    pub host: String,
    pub port: u16,
    pub handle: Uuid,
}

impl fmt::Display for TransferLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.handle.hyphenated())
    }
}

impl FromStr for TransferLink {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ClusterError::InvalidInput(format!("{}: {:?}", reason, s));

        let (addr, handle) = s
            .rsplit_once('/')
            .ok_or_else(|| invalid("transfer link has no handle"))?;
        if handle.len() != 36 {
            return Err(invalid("transfer handle must be 36 characters"));
        }
        let handle = Uuid::parse_str(handle).map_err(|_| invalid("malformed transfer handle"))?;

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("transfer link has no port"))?;
        if host.is_empty() {
            return Err(invalid("transfer link has no host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("malformed transfer port"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            handle,
        })
    }
}

struct TransferInner {
    files: Mutex<HashMap<Uuid, PathBuf>>,
    tls: TransferTls,
    temp_dir: PathBuf,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Serves staged files and fetches remote ones
pub struct FileTransferService {
    inner: Arc<TransferInner>,
    local_addr: SocketAddr,
    advertised: (String, u16),
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl FileTransferService {
    /// Bind the transfer socket and start serving
    ///
    /// `advertise_host` is used in links when the socket binds a wildcard
    /// address; the result then passes through the address resolver so
    /// links carry the externally reachable data-plane endpoint.
    pub async fn start(
        config: &TransferConfig,
        tls: &ClusterTlsConfig,
        resolver: &AddressResolver,
        advertise_host: &str,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            ClusterError::Connection(format!("Failed to bind {}: {}", config.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let host = if local_addr.ip().is_unspecified() {
            advertise_host.to_string()
        } else {
            local_addr.ip().to_string()
        };
        let advertised = resolver.resolve_data(&host, local_addr.port());

        let inner = Arc::new(TransferInner {
            files: Mutex::new(HashMap::new()),
            tls: TransferTls::from_config(tls)?,
            temp_dir: config.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
            handshake_timeout: config.handshake_timeout(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let accept_loop = tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        info!(
            %local_addr,
            advertised = %format!("{}:{}", advertised.0, advertised.1),
            tls = inner.tls.is_enabled(),
            "File transfer service listening"
        );

        Ok(Self {
            inner,
            local_addr,
            advertised,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Files staged and not yet fetched
    pub fn staged(&self) -> usize {
        self.inner.files.lock().len()
    }

    /// Stage `path` for a single fetch and return its link
    pub async fn add_transfer_file(&self, path: impl AsRef<Path>) -> Result<TransferLink> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            ClusterError::InvalidInput(format!("cannot stage {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(ClusterError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let handle = Uuid::new_v4();
        self.inner.files.lock().insert(handle, path.to_path_buf());
        debug!(%handle, path = %path.display(), bytes = metadata.len(), "Staged file for transfer");

        Ok(TransferLink {
            host: self.advertised.0.clone(),
            port: self.advertised.1,
            handle,
        })
    }

    /// Redeem `link` and return the path of the received file
    ///
    /// A handle staged on this node is handed back directly. Otherwise the
    /// file is streamed into a temporary file that is only kept once the
    /// whole stream has arrived.
    pub async fn get_transfer_file(&self, link: &TransferLink) -> Result<PathBuf> {
        let local = self.inner.files.lock().remove(&link.handle);
        if let Some(path) = local {
            debug!(handle = %link.handle, "Redeemed local transfer handle");
            return Ok(path);
        }

        match self.fetch(link).await {
            Ok(path) => Ok(path),
            Err(e) => {
                metrics::record_transfer_error(e.error_type());
                Err(e)
            }
        }
    }

    async fn fetch(&self, link: &TransferLink) -> Result<PathBuf> {
        let addr = format!("{}:{}", link.host, link.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ClusterError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        let mut stream = self.inner.tls.connect(&link.host, tcp).await?;

        stream
            .write_all(&link.handle.as_u128().to_be_bytes())
            .await?;
        stream.flush().await?;

        let temp = tempfile::Builder::new()
            .prefix("cohort-transfer-")
            .tempfile_in(&self.inner.temp_dir)?;
        let mut out = tokio::fs::File::from_std(temp.reopen()?);
        let received = tokio::io::copy(&mut stream, &mut out).await?;
        out.sync_all().await?;
        drop(out);

        if received == 0 {
            return Err(ClusterError::InvalidInput("unknown transfer handle".into()));
        }

        let (_, path) = temp
            .keep()
            .map_err(|e| ClusterError::Io(format!("Failed to keep received file: {}", e)))?;
        metrics::record_transfer_bytes("received", received);
        debug!(handle = %link.handle, from = %addr, bytes = received, path = %path.display(), "Received file");
        Ok(path)
    }

    /// Stop accepting connections and wait for in-flight sends
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let accept_loop = self.accept_loop.lock().take();
        if let Some(handle) = accept_loop {
            let _ = handle.await;
        }
        self.inner.tracker.close();
        if tokio::time::timeout(Duration::from_secs(5), self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Timed out waiting for transfers to finish");
        }

        let abandoned = {
            let mut files = self.inner.files.lock();
            let count = files.len();
            files.clear();
            count
        };
        info!(abandoned, "File transfer service stopped");
    }
}

async fn accept_loop(inner: Arc<TransferInner>, listener: TcpListener) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Transfer accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let worker = Arc::clone(&inner);
        inner.tracker.spawn(async move {
            if let Err(e) = serve(&worker, stream).await {
                metrics::record_transfer_error(e.error_type());
                warn!(%peer, error = %e, "Transfer connection failed");
            }
        });
    }
    debug!("Transfer accept loop stopped");
}

async fn serve(inner: &TransferInner, stream: TcpStream) -> Result<()> {
    let handshake = async {
        let mut stream: BoxedStream = inner.tls.accept(stream).await?;
        let mut request = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut request).await?;
        Ok::<_, ClusterError>((stream, Uuid::from_u128(u128::from_be_bytes(request))))
    };
    let (mut stream, handle) = tokio::time::timeout(inner.handshake_timeout, handshake)
        .await
        .map_err(|_| {
            ClusterError::Timeout(format!(
                "no transfer handshake within {:?}",
                inner.handshake_timeout
            ))
        })??;

    let staged = inner.files.lock().remove(&handle);
    let Some(path) = staged else {
        warn!(%handle, "Request for unknown transfer handle");
        stream.shutdown().await?;
        return Ok(());
    };

    let sent = match send_file(&path, &mut stream).await {
        Ok(sent) => sent,
        Err(e) => {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                inner.files.lock().insert(handle, path);
                debug!(%handle, "Restored transfer handle after failed send");
            } else {
                warn!(%handle, path = %path.display(), "Staged file vanished before it was sent");
            }
            return Err(e);
        }
    };
    if let Err(e) = stream.shutdown().await {
        debug!(%handle, error = %e, "Transfer peer went away after the last byte");
    }

    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), error = %e, "Failed to delete transferred file");
    }
    metrics::record_transfer_bytes("sent", sent);
    debug!(%handle, bytes = sent, "Sent staged file");
    Ok(())
}

async fn send_file(path: &Path, stream: &mut BoxedStream) -> Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let sent = tokio::io::copy(&mut file, stream).await?;
    stream.flush().await?;
    Ok(sent)
}
