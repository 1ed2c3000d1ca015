use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::traits::{TransferClient, TransferResponse, Upload};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use std::time::Duration;

const USER_AGENT: &str = concat!("speedprobe/", env!("CARGO_PKG_VERSION"));

/// [`TransferClient`] backed by one shared reqwest connection pool.
///
/// Cloning is cheap and every clone shares the pool, so a single value can be
/// handed to any number of concurrent probe tasks.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    /// Builds the client. `request_timeout` caps a single request end to
    /// end; without it only the caller's context bounds a transfer.
    pub fn new(request_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            inner: builder.build()?,
        })
    }

    fn into_response(res: reqwest::Response) -> TransferResponse {
        TransferResponse {
            url: res.url().to_string(),
            status: res.status().as_u16(),
            body: res.bytes_stream().map_err(ProbeError::from).boxed(),
        }
    }
}

#[async_trait]
impl TransferClient for HttpClient {
    async fn get(&self, ctx: &ProbeContext, url: &str) -> Result<TransferResponse> {
        let res = ctx
            .run(async { Ok::<_, ProbeError>(self.inner.get(url).send().await?) })
            .await?;
        Ok(Self::into_response(res))
    }

    async fn post(
        &self,
        ctx: &ProbeContext,
        url: &str,
        upload: Upload,
    ) -> Result<TransferResponse> {
        let request = self
            .inner
            .post(url)
            .header(CONTENT_TYPE, upload.content_type)
            .header(CONTENT_LENGTH, upload.size)
            .body(Body::wrap_stream(upload.body));
        let res = ctx
            .run(async { Ok::<_, ProbeError>(request.send().await?) })
            .await?;
        Ok(Self::into_response(res))
    }
}
