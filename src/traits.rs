use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::types::Server;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;

/// Response body as a stream of chunks; a clean end of stream is `None`.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A response handed back by a [`TransferClient`].
pub struct TransferResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub body: ByteStream,
}

impl TransferResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body into memory.
    pub async fn read_content(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub async fn read_text(self) -> Result<String> {
        let content = self.read_content().await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Fails with [`ProbeError::Status`] unless the status is 2xx.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProbeError::Status {
                url: self.url,
                status: self.status,
            })
        }
    }
}

/// Request body pushed by an upload probe. The body is produced lazily, so a
/// large payload is never held in memory whole.
pub struct Upload {
    pub content_type: &'static str,
    /// Exact number of bytes `body` yields.
    pub size: usize,
    pub body: ByteStream,
}

impl Upload {
    /// A payload that is already in memory.
    pub fn from_bytes(content_type: &'static str, body: Bytes) -> Self {
        Self {
            content_type,
            size: body.len(),
            body: futures::stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Transfer capability shared read-only by every concurrent probe task.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn get(&self, ctx: &ProbeContext, url: &str) -> Result<TransferResponse>;

    async fn post(
        &self,
        ctx: &ProbeContext,
        url: &str,
        upload: Upload,
    ) -> Result<TransferResponse>;
}

/// Source of candidate benchmark servers, already parsed and deduplicated.
#[async_trait]
pub trait ServerDirectory: Sync + Send {
    async fn load_all_servers(&self, ctx: &ProbeContext) -> Result<Vec<Server>>;
}

/// Supplies CDN-style transfer targets (credential + manifest lookups stay
/// behind this seam).
#[async_trait]
pub trait TargetProvider: Sync + Send {
    type Target: TransferTarget;

    async fn targets(&self, ctx: &ProbeContext) -> Result<Vec<Self::Target>>;
}

/// Something a bandwidth probe can move bytes to or from.
pub trait TransferTarget: Send + Sync {
    /// URL serving a payload of roughly `size` bytes.
    fn download_url(&self, size: usize) -> Result<String>;

    /// URL accepting an upload of `size` bytes.
    fn upload_url(&self, size: usize) -> Result<String>;

    /// Filler payload of exactly `size` bytes.
    fn upload_payload(&self, size: usize) -> Upload;

    /// Whether an upload answered with `status` was taken by the target.
    fn accepts(&self, status: u16) -> bool {
        (200..300).contains(&status)
    }
}
