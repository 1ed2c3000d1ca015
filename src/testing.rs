//! In-memory [`TransferClient`] for unit tests.

use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::traits::{TransferClient, TransferResponse, Upload};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    /// Responds after `delay` with `status` and the given body chunks.
    Body {
        delay: Duration,
        status: u16,
        chunks: Vec<Bytes>,
    },
    /// Responds 200, yields `chunks`, then breaks the connection.
    BrokenBody { delay: Duration, chunks: Vec<Bytes> },
    /// Fails at the transport level after `delay`.
    Refused { delay: Duration },
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::Body {
            delay: Duration::ZERO,
            status: 200,
            chunks: vec![Bytes::from(body.to_string())],
        }
    }

    pub fn sized(len: usize) -> Self {
        Reply::Body {
            delay: Duration::ZERO,
            status: 200,
            chunks: vec![Bytes::from(vec![b'x'; len])],
        }
    }

    pub fn status(status: u16) -> Self {
        Reply::Body {
            delay: Duration::ZERO,
            status,
            chunks: Vec::new(),
        }
    }

    pub fn refused() -> Self {
        Reply::Refused {
            delay: Duration::ZERO,
        }
    }

    pub fn after(self, d: Duration) -> Self {
        match self {
            Reply::Body { status, chunks, .. } => Reply::Body {
                delay: d,
                status,
                chunks,
            },
            Reply::BrokenBody { chunks, .. } => Reply::BrokenBody { delay: d, chunks },
            Reply::Refused { .. } => Reply::Refused { delay: d },
        }
    }
}

type Handler = Box<dyn Fn(&str, usize) -> Reply + Send + Sync>;

/// Answers every request through `handler(url, call_index)`.
pub struct FakeClient {
    handler: Handler,
    calls: AtomicUsize,
    uploaded: AtomicU64,
    urls: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new(handler: impl Fn(&str, usize) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            uploaded: AtomicU64::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    async fn respond(&self, ctx: &ProbeContext, url: &str) -> Result<TransferResponse> {
        ctx.check()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let reply = (self.handler)(url, call);
        let delay = match &reply {
            Reply::Body { delay, .. }
            | Reply::BrokenBody { delay, .. }
            | Reply::Refused { delay } => *delay,
        };
        ctx.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;

        match reply {
            Reply::Body { status, chunks, .. } => Ok(TransferResponse {
                url: url.to_string(),
                status,
                body: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            }),
            Reply::BrokenBody { chunks, .. } => {
                let broken = futures::stream::once(async {
                    Err(ProbeError::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )))
                });
                Ok(TransferResponse {
                    url: url.to_string(),
                    status: 200,
                    body: futures::stream::iter(chunks.into_iter().map(Ok))
                        .chain(broken)
                        .boxed(),
                })
            }
            Reply::Refused { .. } => Err(ProbeError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection refused: {url}"),
            ))),
        }
    }
}

#[async_trait]
impl TransferClient for FakeClient {
    async fn get(&self, ctx: &ProbeContext, url: &str) -> Result<TransferResponse> {
        self.respond(ctx, url).await
    }

    async fn post(
        &self,
        ctx: &ProbeContext,
        url: &str,
        upload: Upload,
    ) -> Result<TransferResponse> {
        let res = self.respond(ctx, url).await?;

        let mut body = upload.body;
        let mut received = 0u64;
        while let Some(chunk) = body.next().await {
            received += chunk?.len() as u64;
        }
        self.uploaded.fetch_add(received, Ordering::SeqCst);
        Ok(res)
    }
}
