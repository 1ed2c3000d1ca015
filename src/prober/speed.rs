use super::ProbeGroup;
use crate::error::Result;
use crate::types::{BytesPerSecond, BytesTransferred};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Caller-facing sink for live rate estimates. Dropped (and so closed) once
/// the probing run finishes.
pub type RateSink = mpsc::UnboundedSender<BytesPerSecond>;

/// Throughput over the whole run so far.
pub fn rate(bytes: BytesTransferred, elapsed: Duration) -> BytesPerSecond {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        // Nothing measurable yet.
        return BytesPerSecond(0.0);
    }
    BytesPerSecond(bytes as f64 / secs)
}

/// Runs `grp` to completion, turning byte totals into rates measured from the
/// moment this function is called.
///
/// Every incremental total is republished on `sink` as a rate; `sink` is
/// closed when the group's stream closes. On failure the rate is zero and the
/// group's error is passed through untouched.
pub async fn speed_collect(
    mut grp: ProbeGroup,
    sink: Option<RateSink>,
) -> Result<BytesPerSecond> {
    let start = Instant::now();

    let forward = match sink {
        Some(sink) => {
            let mut inc = grp.stream();
            Some(async move {
                while let Some(bytes) = inc.recv().await {
                    let _ = sink.send(rate(bytes, start.elapsed()));
                }
            })
        }
        None => None,
    };

    let (total, ()) = tokio::join!(grp.collect(), async {
        if let Some(forward) = forward {
            forward.await;
        }
    });

    let total = total?;
    Ok(rate(total, start.elapsed()))
}
