use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::geo::{Coordinates, Kilometers};
use crate::traits::TransferClient;
use crate::types::{Server, ServerId};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_LATENCY_SAMPLES: usize = 4;

const LATENCY_PATH: &str = "latency.txt";
const LATENCY_MARKER: &str = "test=test";

// Stand-in ceiling when the context has no deadline. It only has to be
// larger than any sensible measurement.
const UNBOUNDED_SENTINEL: Duration = Duration::from_secs(24 * 60 * 60);

impl Server {
    /// One round trip to the server's latency endpoint.
    ///
    /// The probe only counts when the server answers 200 with the expected
    /// marker payload.
    pub async fn latency(
        &self,
        ctx: &ProbeContext,
        client: &dyn TransferClient,
    ) -> Result<Duration> {
        let url = self.relative_url(LATENCY_PATH)?;
        let start = Instant::now();

        ctx.run(async {
            let res = client.get(ctx, &url).await?;
            if res.status != 200 {
                return Err(ProbeError::Status {
                    url: res.url,
                    status: res.status,
                });
            }

            let url = res.url.clone();
            let body = res.read_text().await?;
            if !body.starts_with(LATENCY_MARKER) {
                return Err(ProbeError::InvalidLatencyResponse {
                    url,
                    body: body.chars().take(64).collect(),
                });
            }
            Ok::<_, ProbeError>(())
        })
        .await?;

        Ok(start.elapsed())
    }

    /// Mean of `samples` sequential latency probes.
    ///
    /// Fails fast: the first failed probe aborts the whole measurement, as a
    /// server that drops even one probe is not a good speed test candidate.
    ///
    /// # Panics
    ///
    /// If `samples` is zero or larger than `u32::MAX`.
    pub async fn average_latency(
        &self,
        ctx: &ProbeContext,
        client: &dyn TransferClient,
        samples: usize,
    ) -> Result<Duration> {
        let divisor = sample_count(samples);

        let mut total = Duration::ZERO;
        for _ in 0..samples {
            total += self.latency(ctx, client).await?;
        }
        Ok(total / divisor)
    }
}

/// Validates a sample count: at least one, at most `u32::MAX`.
fn sample_count(samples: usize) -> u32 {
    assert!(samples > 0, "must take at least one latency sample");
    match u32::try_from(samples) {
        Ok(n) => n,
        Err(_) => panic!("at most u32::MAX latency samples, got {samples}"),
    }
}

/// Outcome of [`rank_by_average_latency`].
#[derive(Debug)]
pub struct LatencyRanking {
    /// Average latency per server; unmeasurable servers hold the sentinel.
    pub latencies: HashMap<ServerId, Duration>,
    /// Most recent failure, kept only when no server could be measured.
    pub error: Option<ProbeError>,
}

impl LatencyRanking {
    pub fn into_result(self) -> Result<HashMap<ServerId, Duration>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.latencies),
        }
    }
}

/// Ceiling assigned to servers whose latency could not be measured.
pub fn sentinel_latency(ctx: &ProbeContext) -> Duration {
    ctx.remaining().unwrap_or(UNBOUNDED_SENTINEL)
}

/// Measures every server concurrently and stable-sorts `servers` ascending by
/// average latency. Servers that fail are ranked with the sentinel, so they
/// end up last without aborting the others.
pub async fn rank_by_average_latency(
    servers: &mut [Server],
    ctx: &ProbeContext,
    client: &dyn TransferClient,
    samples: usize,
) -> LatencyRanking {
    sample_count(samples);

    let ceiling = sentinel_latency(ctx);

    let mut pending: FuturesUnordered<_> = servers
        .iter()
        .map(|s| async move { (s.id, s.average_latency(ctx, client, samples).await) })
        .collect();

    let mut latencies = HashMap::with_capacity(servers.len());
    let mut any_good = false;
    let mut last_err = None;

    while let Some((id, res)) = pending.next().await {
        match res {
            Ok(d) => {
                debug!(server = id, latency_ms = d.as_secs_f64() * 1e3, "measured latency");
                any_good = true;
                latencies.insert(id, d);
            }
            Err(e) => {
                warn!(server = id, error = %e, "latency probe failed");
                latencies.insert(id, ceiling);
                last_err = Some(e);
            }
        }
    }
    drop(pending);

    // slice::sort_by_key is stable.
    servers.sort_by_key(|s| latencies[&s.id]);

    if let Some(best) = servers.first() {
        info!(server = best.id, candidates = servers.len(), "ranked servers by latency");
    }

    LatencyRanking {
        latencies,
        error: if any_good { None } else { last_err },
    }
}

/// Sorts `servers` by great-circle distance from `origin`, nearest first.
pub fn rank_by_distance(
    servers: &mut [Server],
    origin: &Coordinates,
) -> HashMap<ServerId, Kilometers> {
    let mut distances = HashMap::with_capacity(servers.len());
    for s in servers.iter() {
        distances
            .entry(s.id)
            .or_insert_with(|| origin.distance_to(&s.coordinates));
    }

    servers.sort_unstable_by(|a, b| distances[&a.id].0.total_cmp(&distances[&b.id].0));
    distances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClient, Reply};
    use rand::seq::SliceRandom;

    const SCALE: Duration = Duration::from_millis(10);

    /// Server `i` answers after `(i + 1) * SCALE`.
    fn staircase() -> (FakeClient, Vec<Server>) {
        let client = FakeClient::new(|url, _| {
            let host = url.split('/').nth(2).unwrap();
            let i: u32 = host
                .trim_start_matches('s')
                .trim_end_matches(".example")
                .parse()
                .unwrap();
            Reply::ok("test=test").after(SCALE * (i + 1))
        });
        let servers = (0..5)
            .map(|i| Server::new(i, &format!("http://s{i}.example/speedtest/upload.php")))
            .collect();
        (client, servers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_accepts_marker() {
        let client = FakeClient::new(|_, _| Reply::ok("test=test\n").after(SCALE));
        let server = Server::new(1, "http://speed.example/speedtest/upload.php");

        let d = server.latency(&ProbeContext::background(), &client).await.unwrap();
        assert_eq!(d, SCALE);
        assert_eq!(client.urls(), vec!["http://speed.example/speedtest/latency.txt"]);
    }

    #[tokio::test]
    async fn test_latency_rejects_bad_payload_and_status() {
        let server = Server::new(1, "http://speed.example/");
        let ctx = ProbeContext::background();

        let client = FakeClient::new(|_, _| Reply::ok("<html>captive portal</html>"));
        assert!(matches!(
            server.latency(&ctx, &client).await,
            Err(ProbeError::InvalidLatencyResponse { .. })
        ));

        let client = FakeClient::new(|_, _| Reply::status(404));
        assert!(matches!(
            server.latency(&ctx, &client).await,
            Err(ProbeError::Status { status: 404, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_latency_is_mean_of_samples() {
        let client =
            FakeClient::new(|_, call| Reply::ok("test=test").after(SCALE * (call as u32 + 1)));
        let server = Server::new(1, "http://speed.example/");

        let d = server
            .average_latency(&ProbeContext::background(), &client, 3)
            .await
            .unwrap();
        // (10 + 20 + 30) / 3
        assert_eq!(d, Duration::from_millis(20));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_average_latency_fails_fast() {
        let client = FakeClient::new(|_, call| {
            if call == 1 {
                Reply::refused()
            } else {
                Reply::ok("test=test")
            }
        });
        let server = Server::new(1, "http://speed.example/");

        let res = server.average_latency(&ProbeContext::background(), &client, 3).await;
        assert!(matches!(res, Err(ProbeError::Io(_))));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "at least one latency sample")]
    async fn test_average_latency_rejects_zero_samples() {
        let client = FakeClient::new(|_, _| Reply::ok("test=test"));
        let server = Server::new(1, "http://speed.example/");
        let _ = server.average_latency(&ProbeContext::background(), &client, 0).await;
    }

    #[cfg(target_pointer_width = "64")]
    #[tokio::test]
    #[should_panic(expected = "at most u32::MAX latency samples")]
    async fn test_average_latency_rejects_oversized_sample_count() {
        let client = FakeClient::new(|_, _| Reply::ok("test=test"));
        let server = Server::new(1, "http://speed.example/");
        let samples = u32::MAX as usize + 1;
        let _ = server
            .average_latency(&ProbeContext::background(), &client, samples)
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_by_average_latency_sorts_ascending() {
        let (client, expected) = staircase();
        let mut rng = rand::thread_rng();

        for _ in 0..5 {
            let mut shuffled = expected.clone();
            shuffled.shuffle(&mut rng);

            let latencies = rank_by_average_latency(
                &mut shuffled,
                &ProbeContext::background(),
                &client,
                DEFAULT_LATENCY_SAMPLES,
            )
            .await
            .into_result()
            .unwrap();

            assert_eq!(shuffled, expected);
            assert_eq!(latencies[&0], SCALE);
            assert_eq!(latencies[&4], SCALE * 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_by_average_latency_is_stable() {
        let client = FakeClient::new(|url, _| {
            let delay = if url.contains("fast") { SCALE / 2 } else { SCALE };
            Reply::ok("test=test").after(delay)
        });
        let mut servers = vec![
            Server::new(5, "http://a.example/"),
            Server::new(2, "http://b.example/"),
            Server::new(7, "http://fast.example/"),
            Server::new(9, "http://c.example/"),
        ];

        rank_by_average_latency(&mut servers, &ProbeContext::background(), &client, 2)
            .await
            .into_result()
            .unwrap();

        let ids: Vec<_> = servers.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![7, 5, 2, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_failed_server_gets_sentinel() {
        let client = FakeClient::new(|url, _| {
            if url.contains("down") {
                Reply::refused()
            } else {
                Reply::ok("test=test").after(SCALE)
            }
        });
        let mut servers = vec![
            Server::new(1, "http://down.example/"),
            Server::new(2, "http://up.example/"),
        ];
        let ctx = ProbeContext::background().with_timeout(Duration::from_secs(10));

        let ranking = rank_by_average_latency(&mut servers, &ctx, &client, 3).await;
        assert!(ranking.error.is_none());
        assert_eq!(ranking.latencies[&1], Duration::from_secs(10));
        assert_eq!(ranking.latencies[&2], SCALE);
        assert_eq!(servers[0].id, 2);
        assert_eq!(servers[1].id, 1);
    }

    #[tokio::test]
    async fn test_rank_all_failed_keeps_map_and_error() {
        let client = FakeClient::new(|_, _| Reply::status(500));
        let mut servers = vec![
            Server::new(3, "http://x.example/"),
            Server::new(1, "http://y.example/"),
        ];

        let ranking =
            rank_by_average_latency(&mut servers, &ProbeContext::background(), &client, 1).await;
        assert!(matches!(ranking.error, Some(ProbeError::Status { status: 500, .. })));
        assert_eq!(ranking.latencies.len(), 2);
        assert!(ranking.latencies.values().all(|d| *d == UNBOUNDED_SENTINEL));
        // All equal, so the input order survives.
        assert_eq!(servers[0].id, 3);
    }

    #[test]
    fn test_rank_by_distance() {
        let at = |id, lat, lon| {
            let mut s = Server::new(id, "http://example.net/");
            s.coordinates = Coordinates::new(lat, lon);
            s
        };
        let expected = vec![
            at(0, 0.0, 0.0),
            at(1, 1.0, 1.0),
            at(2, -2.0, -2.0),
            at(3, 3.0, -3.0),
            at(4, -4.0, 4.0),
        ];
        let origin = Coordinates::new(0.0, 0.0);
        let mut rng = rand::thread_rng();

        for _ in 0..10 {
            let mut shuffled = expected.clone();
            shuffled.shuffle(&mut rng);

            let distances = rank_by_distance(&mut shuffled, &origin);
            assert_eq!(shuffled, expected);
            assert_eq!(distances[&0], Kilometers(0.0));
            assert!(distances[&1] < distances[&2]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_all_expired_reports_cancellation() {
        let client =
            FakeClient::new(|_, _| Reply::ok("test=test").after(Duration::from_secs(5)));
        let mut servers = vec![
            Server::new(4, "http://a.example/"),
            Server::new(2, "http://b.example/"),
        ];
        let ctx = ProbeContext::background().with_timeout(Duration::from_secs(1));

        let ranking = rank_by_average_latency(&mut servers, &ctx, &client, 2).await;
        assert!(matches!(ranking.error, Some(ProbeError::DeadlineExceeded)));
        assert!(ranking.error.as_ref().is_some_and(ProbeError::is_cancellation));
        assert_eq!(ranking.latencies.len(), 2);
        assert_eq!(ranking.latencies[&4], Duration::from_secs(1));
        assert_eq!(ranking.latencies[&2], Duration::from_secs(1));
        // Equal sentinels keep the input order.
        let ids: Vec<_> = servers.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![4, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_all_cancelled_reports_cancellation() {
        let client =
            FakeClient::new(|_, _| Reply::ok("test=test").after(Duration::from_secs(5)));
        let mut servers = vec![
            Server::new(1, "http://a.example/"),
            Server::new(3, "http://b.example/"),
        ];
        let ctx = ProbeContext::background().with_cancel();

        let (ranking, ()) = tokio::join!(
            rank_by_average_latency(&mut servers, &ctx, &client, 1),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.cancel();
            }
        );

        assert!(matches!(ranking.error, Some(ProbeError::Cancelled)));
        assert_eq!(ranking.latencies[&1], UNBOUNDED_SENTINEL);
        assert_eq!(ranking.latencies[&3], UNBOUNDED_SENTINEL);
        assert!(ranking.into_result().unwrap_err().is_cancellation());
    }
}
