//! fast.com: scraped API token, target manifest and CDN workloads.

use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::prober::speed::RateSink;
use crate::prober::transfer::{probe_speed, Direction, Workload};
use crate::traits::{ByteStream, TargetProvider, TransferClient, TransferTarget, Upload};
use crate::types::BytesPerSecond;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};
use url::Url;

pub const HOME_URL: &str = "https://fast.com";
pub const MANIFEST_URL: &str = "https://api.fast.com/netflix/speedtest/v2";

const TRANSFER_SIZES: &[usize] = &[
    256, 1024, 4096, 131_072, 1_048_576, 8_388_608, 16_777_216, 33_554_432,
];

const UPLOAD_CHUNK: usize = 64 * 1024;

pub const DOWNLOAD_WORKLOAD: Workload = Workload {
    direction: Direction::Download,
    sizes: TRANSFER_SIZES,
    repeats: 5,
    concurrency: 12,
};

pub const UPLOAD_WORKLOAD: Workload = Workload {
    direction: Direction::Upload,
    sizes: TRANSFER_SIZES,
    repeats: 3,
    concurrency: 8,
};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Location {
    pub city: String,
    pub country: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ManifestClient {
    pub asn: String,
    pub isp: String,
    pub ip: String,
    pub location: Location,
}

/// One CDN endpoint handed out by the manifest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CdnTarget {
    pub name: String,
    pub url: String,
    pub location: Location,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub client: ManifestClient,
    pub targets: Vec<CdnTarget>,
}

fn js_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<script.*"(/app-[[:xdigit:]]+\.js)""#).expect("valid script regex")
    })
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"token:["']([[:alpha:]]+)["']"#).expect("valid token regex")
    })
}

/// Path of the app bundle referenced by the fast.com landing page.
pub fn extract_js_path(html: &str) -> Option<&str> {
    js_path_re()
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub fn extract_token(js: &str) -> Option<&str> {
    token_re()
        .captures(js)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

async fn fetch_text(
    ctx: &ProbeContext,
    client: &dyn TransferClient,
    url: &str,
) -> Result<String> {
    let res = client.get(ctx, url).await?.error_for_status()?;
    ctx.run(res.read_text()).await
}

/// Scrapes the API token out of the fast.com front-end bundle.
pub async fn fetch_token(
    ctx: &ProbeContext,
    client: &dyn TransferClient,
    home: &str,
) -> Result<String> {
    let html = fetch_text(ctx, client, home).await?;
    let js_path =
        extract_js_path(&html).ok_or(ProbeError::Extract("fast.com JS URL from the HTML"))?;

    let js_url = Url::parse(home)
        .and_then(|base| base.join(js_path))
        .map_err(|source| ProbeError::Url {
            url: js_path.to_string(),
            source,
        })?;
    debug!(%js_url, "fetching fast.com bundle");

    let js = fetch_text(ctx, client, js_url.as_str()).await?;
    let token = extract_token(&js).ok_or(ProbeError::Extract("fast.com token from JS"))?;
    Ok(token.to_string())
}

pub fn manifest_url(base: &str, token: &str, url_count: usize) -> Result<String> {
    let mut url = Url::parse(base).map_err(|source| ProbeError::Url {
        url: base.to_string(),
        source,
    })?;
    url.query_pairs_mut()
        .append_pair("https", "true")
        .append_pair("token", token)
        .append_pair("urlCount", &url_count.to_string());
    Ok(url.into())
}

pub fn parse_manifest(json: &str) -> Result<Manifest> {
    Ok(serde_json::from_str(json)?)
}

/// Resolves a fresh set of fast.com targets: token, then manifest.
pub struct FastProvider {
    client: Arc<dyn TransferClient>,
    url_count: usize,
    home_url: String,
    manifest_url: String,
}

impl FastProvider {
    pub fn new(client: Arc<dyn TransferClient>, url_count: usize) -> Self {
        Self {
            client,
            url_count,
            home_url: HOME_URL.to_string(),
            manifest_url: MANIFEST_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoints(
        client: Arc<dyn TransferClient>,
        url_count: usize,
        home: &str,
        manifest: &str,
    ) -> Self {
        Self {
            client,
            url_count,
            home_url: home.to_string(),
            manifest_url: manifest.to_string(),
        }
    }

    pub async fn manifest(&self, ctx: &ProbeContext) -> Result<Manifest> {
        let token = fetch_token(ctx, self.client.as_ref(), &self.home_url).await?;
        let url = manifest_url(&self.manifest_url, &token, self.url_count)?;
        let manifest = parse_manifest(&fetch_text(ctx, self.client.as_ref(), &url).await?)?;
        info!(
            targets = manifest.targets.len(),
            isp = %manifest.client.isp,
            "loaded fast.com manifest"
        );
        Ok(manifest)
    }
}

#[async_trait]
impl TargetProvider for FastProvider {
    type Target = CdnTarget;

    async fn targets(&self, ctx: &ProbeContext) -> Result<Vec<CdnTarget>> {
        Ok(self.manifest(ctx).await?.targets)
    }
}

/// Appends `/range/0-<size>` to the target path. An unparsable URL is
/// returned as is; the transfer itself will then fail.
pub fn put_size_into_url(base: &str, size: usize) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            let path = format!("{}/range/0-{}", url.path().trim_end_matches('/'), size);
            url.set_path(&path);
            url.into()
        }
        Err(_) => base.to_string(),
    }
}

/// `size` random bytes, generated chunk by chunk as the body is sent.
pub fn random_stream(size: usize) -> ByteStream {
    let chunks = (0..size)
        .step_by(UPLOAD_CHUNK)
        .map(move |offset| (size - offset).min(UPLOAD_CHUNK));
    futures::stream::iter(chunks)
        .map(|len| {
            let mut buf = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut buf);
            Ok(Bytes::from(buf))
        })
        .boxed()
}

impl TransferTarget for CdnTarget {
    fn download_url(&self, size: usize) -> Result<String> {
        Ok(put_size_into_url(&self.url, size))
    }

    fn upload_url(&self, size: usize) -> Result<String> {
        Ok(put_size_into_url(&self.url, size))
    }

    fn upload_payload(&self, size: usize) -> Upload {
        Upload {
            content_type: "application/octet-stream",
            size,
            body: random_stream(size),
        }
    }

    // The CDN answers a stored upload with a plain 200.
    fn accepts(&self, status: u16) -> bool {
        status == 200
    }
}

pub async fn probe_download_speed(
    targets: &[CdnTarget],
    ctx: &ProbeContext,
    client: Arc<dyn TransferClient>,
    sink: Option<RateSink>,
) -> Result<BytesPerSecond> {
    probe_speed(ctx, client, targets, &DOWNLOAD_WORKLOAD, sink).await
}

pub async fn probe_upload_speed(
    targets: &[CdnTarget],
    ctx: &ProbeContext,
    client: Arc<dyn TransferClient>,
    sink: Option<RateSink>,
) -> Result<BytesPerSecond> {
    probe_speed(ctx, client, targets, &UPLOAD_WORKLOAD, sink).await
}
