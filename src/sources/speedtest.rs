//! speedtest.net: client config, server directory and per-server workloads.

use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::geo::Coordinates;
use crate::prober::speed::RateSink;
use crate::prober::transfer::{probe_speed, Direction, Workload};
use crate::traits::{ServerDirectory, TransferClient, TransferTarget, Upload};
use crate::types::{dedup_and_sort, BytesPerSecond, Server, ServerId};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub const CONFIG_URL: &str = "https://www.speedtest.net/speedtest-config.php";

pub const SERVER_LIST_URLS: &[&str] = &[
    "https://www.speedtest.net/speedtest-servers-static.php",
    "https://c.speedtest.net/speedtest-servers-static.php",
    "https://www.speedtest.net/speedtest-servers.php",
    "https://c.speedtest.net/speedtest-servers.php",
];

pub const DOWNLOAD_WORKLOAD: Workload = Workload {
    direction: Direction::Download,
    sizes: &[350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000],
    repeats: 5,
    concurrency: 6,
};

pub const UPLOAD_WORKLOAD: Workload = Workload {
    direction: Direction::Upload,
    sizes: &[250_000, 500_000],
    repeats: DOWNLOAD_WORKLOAD.repeats * 25,
    concurrency: DOWNLOAD_WORKLOAD.concurrency,
};

const UPLOAD_FIELD: &[u8] = b"content1=";
// Form-safe alphabet for upload filler.
const SAFE_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

/// What speedtest.net knows about the machine running the test.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientConfig {
    pub ip: String,
    pub isp: String,
    pub coordinates: Coordinates,
}

fn element_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<(client|server)\s+([^>]*?)/?>").expect("valid element regex")
    })
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*"([^"]*)""#).expect("valid attribute regex")
    })
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Attribute maps of every `<tag .../>` element in `xml`.
fn elements<'a>(
    xml: &'a str,
    tag: &'a str,
) -> impl Iterator<Item = HashMap<String, String>> + 'a {
    element_re()
        .captures_iter(xml)
        .filter(move |caps| &caps[1] == tag)
        .map(|caps| {
            attribute_re()
                .captures_iter(&caps[2])
                .map(|a| (a[1].to_string(), unescape(&a[2])))
                .collect()
        })
}

fn coordinates(attrs: &HashMap<String, String>) -> Option<Coordinates> {
    let lat = attrs.get("lat")?.trim().parse().ok()?;
    let lon = attrs.get("lon")?.trim().parse().ok()?;
    Some(Coordinates::new(lat, lon))
}

/// Reads the `<client .../>` element of the speedtest config document.
pub fn parse_client_config(xml: &str) -> Result<ClientConfig> {
    let attrs = elements(xml, "client")
        .next()
        .ok_or(ProbeError::Extract("client element from speedtest config"))?;
    let coordinates = coordinates(&attrs).ok_or(ProbeError::Extract(
        "client coordinates from speedtest config",
    ))?;

    Ok(ClientConfig {
        ip: attrs.get("ip").cloned().unwrap_or_default(),
        isp: attrs.get("isp").cloned().unwrap_or_default(),
        coordinates,
    })
}

/// Reads every `<server .../>` element; entries without a usable id, URL or
/// location are skipped.
pub fn parse_servers(xml: &str) -> Vec<Server> {
    elements(xml, "server")
        .filter_map(|attrs| {
            let id: ServerId = attrs.get("id")?.trim().parse().ok()?;
            let url = attrs.get("url")?.clone();
            let Some(coordinates) = coordinates(&attrs) else {
                debug!(id, "skipping server without coordinates");
                return None;
            };
            let field = |k: &str| attrs.get(k).cloned().unwrap_or_default();
            Some(Server {
                id,
                name: field("name"),
                sponsor: field("sponsor"),
                country: field("country"),
                cc: field("cc"),
                host: field("host"),
                url,
                coordinates,
            })
        })
        .collect()
}

pub async fn fetch_client_config(
    ctx: &ProbeContext,
    client: &dyn TransferClient,
) -> Result<ClientConfig> {
    let res = client.get(ctx, CONFIG_URL).await?.error_for_status()?;
    let xml = ctx.run(res.read_text()).await?;
    parse_client_config(&xml)
}

/// Server directory merged from every speedtest.net list endpoint.
pub struct SpeedtestDirectory {
    client: Arc<dyn TransferClient>,
    urls: Vec<String>,
}

impl SpeedtestDirectory {
    pub fn new(client: Arc<dyn TransferClient>) -> Self {
        Self::with_urls(client, SERVER_LIST_URLS.iter().map(|u| u.to_string()).collect())
    }

    pub fn with_urls(client: Arc<dyn TransferClient>, urls: Vec<String>) -> Self {
        Self { client, urls }
    }

    async fn load_from(&self, ctx: &ProbeContext, url: &str) -> Result<Vec<Server>> {
        let res = self.client.get(ctx, url).await?.error_for_status()?;
        let xml = ctx.run(res.read_text()).await?;
        let servers = parse_servers(&xml);
        debug!(url, count = servers.len(), "loaded server list");
        Ok(servers)
    }
}

#[async_trait]
impl ServerDirectory for SpeedtestDirectory {
    /// Every list must load; duplicates across lists are merged.
    async fn load_all_servers(&self, ctx: &ProbeContext) -> Result<Vec<Server>> {
        let lists =
            futures::future::try_join_all(self.urls.iter().map(|u| self.load_from(ctx, u)))
                .await?;
        let servers = dedup_and_sort(lists.into_iter().flatten().collect());
        info!(count = servers.len(), "loaded speedtest.net servers");
        Ok(servers)
    }
}

/// `content1=` followed by form-safe filler, `size` bytes in total.
pub fn form_filler(size: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_slice(&UPLOAD_FIELD[..UPLOAD_FIELD.len().min(size)]);
    while buf.len() < size {
        buf.put_u8(SAFE_CHARS[rng.gen_range(0..SAFE_CHARS.len())]);
    }
    buf.freeze()
}

impl TransferTarget for Server {
    fn download_url(&self, size: usize) -> Result<String> {
        self.relative_url(&format!("random{size}x{size}.jpg"))
    }

    fn upload_url(&self, _size: usize) -> Result<String> {
        Ok(self.url.clone())
    }

    fn upload_payload(&self, size: usize) -> Upload {
        Upload::from_bytes("application/x-www-form-urlencoded", form_filler(size))
    }
}

/// Probes download speed against `server` until the workload is done or
/// `ctx` expires.
pub async fn probe_download_speed(
    server: &Server,
    ctx: &ProbeContext,
    client: Arc<dyn TransferClient>,
    sink: Option<RateSink>,
) -> Result<BytesPerSecond> {
    probe_speed(ctx, client, std::slice::from_ref(server), &DOWNLOAD_WORKLOAD, sink).await
}

/// Probes upload speed against `server` until the workload is done or
/// `ctx` expires.
pub async fn probe_upload_speed(
    server: &Server,
    ctx: &ProbeContext,
    client: Arc<dyn TransferClient>,
    sink: Option<RateSink>,
) -> Result<BytesPerSecond> {
    probe_speed(ctx, client, std::slice::from_ref(server), &UPLOAD_WORKLOAD, sink).await
}
