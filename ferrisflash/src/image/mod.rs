//! Firmware images: local validation and hosting for the device to pull.
//!
//! Gateways fetch their image themselves, ADTRAN over HTTP and Comtrend
//! over TFTP. An [`ImageHost`] turns a validated [`FirmwareImage`] into a
//! [`StagedImage`] the driver can point the device at. The image stays
//! reachable for as long as the staged image (and its serve guard) lives.

mod catalog;
mod http;
mod tftp;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, UpgradeError};
use catalog::Catalog;

/// A firmware image file on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareImage {
    /// Path to the image.
    pub path: PathBuf,

    /// Exact size in bytes, when known.
    #[serde(default)]
    pub expected_size: Option<u64>,

    /// SHA-256 of the image as lowercase or uppercase hex, when known.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl FirmwareImage {
    /// Reference an image by path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            expected_size: None,
            sha256: None,
        }
    }

    /// Require the image to be exactly `size` bytes.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Require the image to hash to `digest`.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> UpgradeError {
        UpgradeError::InvalidImage {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Check the image before any device I/O.
    ///
    /// The file must exist, be a regular non-empty file, and match the
    /// expected size and checksum if either is set. Its name goes into
    /// device shell commands and URLs verbatim, so it is limited to
    /// characters neither needs quoted.
    pub async fn validate(&self) -> Result<ValidatedImage> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.invalid("file not found").into());
            }
            Err(e) => return Err(self.invalid(e.to_string()).into()),
        };

        if !metadata.is_file() {
            return Err(self.invalid("not a regular file").into());
        }
        let size = metadata.len();
        if size == 0 {
            return Err(self.invalid("file is empty").into());
        }
        if let Some(expected) = self.expected_size {
            if expected != size {
                return Err(self
                    .invalid(format!("size is {} bytes, expected {}", size, expected))
                    .into());
            }
        }

        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| self.invalid("file name is not valid UTF-8"))?
            .to_string();
        if !is_plain_file_name(&file_name) {
            return Err(self
                .invalid(format!(
                    "file name {:?} must be letters, digits, '.', '_', '+' or '-' and not start with '-'",
                    file_name
                ))
                .into());
        }

        let sha256 = sha256_file(&self.path).await?;
        if let Some(expected) = &self.sha256 {
            if !expected.trim().eq_ignore_ascii_case(&sha256) {
                return Err(self.invalid(format!("sha256 mismatch: got {}", sha256)).into());
            }
        }

        debug!("validated {} ({} bytes, sha256 {})", file_name, size, sha256);

        Ok(ValidatedImage {
            path: self.path.clone(),
            file_name,
            size,
            sha256,
        })
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// An image that passed [`FirmwareImage::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedImage {
    /// Path to the image.
    pub path: PathBuf,

    /// File name the device requests.
    pub file_name: String,

    /// Size in bytes.
    pub size: u64,

    /// SHA-256 as lowercase hex.
    pub sha256: String,
}

/// How a model pulls its firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// `GET http://<host>:<port>/<file>`.
    Http,
    /// TFTP read request for `<file>`.
    Tftp,
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMethod::Http => write!(f, "http"),
            TransferMethod::Tftp => write!(f, "tftp"),
        }
    }
}

/// One running server and the files it hands out.
#[derive(Debug)]
struct Listener {
    port: u16,
    catalog: Catalog,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
        debug!("stopped image listener on port {}", self.port);
    }
}

/// Listeners by protocol; at most one of each per host.
#[derive(Debug, Default)]
struct Listeners {
    http: Option<Listener>,
    tftp: Option<Listener>,
}

impl Listeners {
    fn slot(&mut self, method: TransferMethod) -> &mut Option<Listener> {
        match method {
            TransferMethod::Http => &mut self.http,
            TransferMethod::Tftp => &mut self.tftp,
        }
    }
}

type SharedListeners = Arc<Mutex<Listeners>>;

fn lock(listeners: &SharedListeners) -> MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a published image reachable.
///
/// Dropping the guard withdraws the image; the listener stops once it has
/// nothing left to serve.
pub struct ServeGuard {
    listeners: SharedListeners,
    method: TransferMethod,
    file_name: String,
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        let mut listeners = lock(&self.listeners);
        let slot = listeners.slot(self.method);
        let idle = slot
            .as_ref()
            .is_some_and(|listener| listener.catalog.release(&self.file_name));
        if idle {
            *slot = None;
        }
    }
}

impl fmt::Debug for ServeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeGuard")
            .field("method", &self.method)
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// An image reachable by the device.
#[derive(Debug)]
pub struct StagedImage {
    /// Transfer protocol the device will use.
    pub method: TransferMethod,

    /// Host address the device should fetch from.
    pub host: IpAddr,

    /// Port the image is served on.
    pub port: u16,

    /// File name to request.
    pub file_name: String,

    /// Size in bytes, for post-transfer checks on the device.
    pub size: u64,

    /// SHA-256 as lowercase hex.
    pub sha256: String,

    guard: Option<ServeGuard>,
}

impl StagedImage {
    /// Describe an image served by something else (no guard).
    pub fn external(method: TransferMethod, addr: SocketAddr, image: &ValidatedImage) -> Self {
        Self {
            method,
            host: addr.ip(),
            port: addr.port(),
            file_name: image.file_name.clone(),
            size: image.size,
            sha256: image.sha256.clone(),
            guard: None,
        }
    }

    fn with_guard(mut self, guard: ServeGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// HTTP URL of the image.
    pub fn url(&self) -> String {
        format!("http://{}/{}", SocketAddr::new(self.host, self.port), self.file_name)
    }
}

/// Makes a validated image reachable by a device.
pub trait ImageHost: Send + Sync {
    /// Start serving `image` over `method`.
    fn publish(
        &self,
        image: &ValidatedImage,
        method: TransferMethod,
    ) -> impl Future<Output = Result<StagedImage>> + Send;
}

/// Where the local image host listens and what it tells the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageHostConfig {
    /// Address the servers bind to.
    pub bind: IpAddr,

    /// Address the device is told to fetch from (this machine, as seen
    /// from the device's LAN).
    pub advertise: IpAddr,

    /// HTTP port.
    pub http_port: u16,

    /// TFTP port.
    pub tftp_port: u16,
}

impl Default for ImageHostConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            http_port: 8000,
            tftp_port: 69,
        }
    }
}

/// Serves images from this process over HTTP or TFTP.
///
/// Clones share their listeners, so any number of concurrent runs can
/// publish through one host: each protocol gets a single listener on its
/// configured port, serving every image currently published.
#[derive(Debug, Clone, Default)]
pub struct LocalImageHost {
    config: ImageHostConfig,
    listeners: SharedListeners,
    starting: Arc<tokio::sync::Mutex<()>>,
}

impl LocalImageHost {
    /// Create a host with the given addresses.
    pub fn new(config: ImageHostConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Hosting configuration.
    pub fn config(&self) -> &ImageHostConfig {
        &self.config
    }

    /// Add `image` to the running listener for `method`. Returns its port,
    /// or None if no listener is running.
    fn attach(
        &self,
        listeners: &mut Listeners,
        image: &ValidatedImage,
        method: TransferMethod,
        data: &Bytes,
    ) -> Result<Option<u16>> {
        let Some(listener) = listeners.slot(method).as_ref() else {
            return Ok(None);
        };
        listener
            .catalog
            .add(&image.file_name, &image.sha256, data.clone())
            .map_err(|reason| UpgradeError::InvalidImage {
                path: image.path.display().to_string(),
                reason,
            })?;
        Ok(Some(listener.port))
    }

    async fn start(&self, catalog: Catalog, method: TransferMethod) -> Result<Listener> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (port, task) = match method {
            TransferMethod::Http => {
                let bind = SocketAddr::new(self.config.bind, self.config.http_port);
                http::serve(bind, catalog.clone(), shutdown_rx).await?
            }
            TransferMethod::Tftp => {
                let bind = SocketAddr::new(self.config.bind, self.config.tftp_port);
                tftp::serve(bind, catalog.clone(), shutdown_rx).await?
            }
        };
        Ok(Listener {
            port,
            catalog,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

impl ImageHost for LocalImageHost {
    async fn publish(&self, image: &ValidatedImage, method: TransferMethod) -> Result<StagedImage> {
        let data = Bytes::from(tokio::fs::read(&image.path).await?);

        // One listener per protocol; publishes that would start one queue here
        let _starting = self.starting.lock().await;
        let attached = self.attach(&mut lock(&self.listeners), image, method, &data)?;
        let port = match attached {
            Some(port) => port,
            None => {
                let catalog = Catalog::default();
                catalog
                    .add(&image.file_name, &image.sha256, data)
                    .map_err(|reason| UpgradeError::InvalidImage {
                        path: image.path.display().to_string(),
                        reason,
                    })?;
                let listener = self.start(catalog, method).await?;
                let port = listener.port;
                *lock(&self.listeners).slot(method) = Some(listener);
                port
            }
        };

        let advertised = SocketAddr::new(self.config.advertise, port);
        info!("serving {} over {} at {}", image.file_name, method, advertised);

        Ok(StagedImage::external(method, advertised, image).with_guard(ServeGuard {
            listeners: self.listeners.clone(),
            method,
            file_name: image.file_name.clone(),
        }))
    }
}
