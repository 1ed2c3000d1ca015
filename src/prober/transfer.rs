use super::speed::{speed_collect, RateSink};
use super::ProbeGroup;
use crate::context::ProbeContext;
use crate::error::{ProbeError, Result};
use crate::traits::{TransferClient, TransferTarget};
use crate::types::{BytesPerSecond, BytesTransferred};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Shape of one bandwidth probing run: every size, `repeats` times, against
/// every target, at most `concurrency` transfers in flight.
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    pub direction: Direction,
    pub sizes: &'static [usize],
    pub repeats: usize,
    pub concurrency: usize,
}

impl Workload {
    pub fn task_count(&self, targets: usize) -> usize {
        self.sizes.len() * self.repeats * targets
    }
}

/// Fires the full `sizes × repeats × targets` workload and reports the
/// converging speed.
///
/// Live estimates go to `sink` when one is given. Fails with
/// [`ProbeError::EmptyWorkload`] if there is nothing to transfer.
pub async fn probe_speed<T>(
    ctx: &ProbeContext,
    client: Arc<dyn TransferClient>,
    targets: &[T],
    workload: &Workload,
    sink: Option<RateSink>,
) -> Result<BytesPerSecond>
where
    T: TransferTarget + Clone + 'static,
{
    let tasks = workload.task_count(targets.len());
    if tasks == 0 {
        return Err(ProbeError::EmptyWorkload);
    }

    let ctx = ctx.with_cancel();
    let mut grp = ProbeGroup::new(workload.concurrency);

    for &size in workload.sizes {
        for _ in 0..workload.repeats {
            for target in targets {
                let ctx = ctx.clone();
                let client = Arc::clone(&client);
                match workload.direction {
                    Direction::Download => {
                        let url = target.download_url(size)?;
                        grp.submit(async move { download(&ctx, client.as_ref(), &url).await });
                    }
                    Direction::Upload => {
                        let url = target.upload_url(size)?;
                        let target = target.clone();
                        grp.submit(async move {
                            upload(&ctx, client.as_ref(), &url, &target, size).await
                        });
                    }
                }
            }
        }
    }

    info!(
        direction = %workload.direction,
        tasks,
        concurrency = workload.concurrency,
        "probing speed"
    );

    let res = speed_collect(grp, sink).await;
    ctx.cancel();

    match &res {
        Ok(speed) => info!(direction = %workload.direction, %speed, "probe finished"),
        Err(e) => info!(direction = %workload.direction, error = %e, "probe failed"),
    }
    res
}

/// Reads the whole body. Only a clean end of stream counts; a body cut off
/// by an error reports the error and none of its bytes.
async fn download(
    ctx: &ProbeContext,
    client: &dyn TransferClient,
    url: &str,
) -> Result<BytesTransferred> {
    ctx.check()?;

    ctx.run(async {
        let mut body = client.get(ctx, url).await?.error_for_status()?.body;
        let mut read: BytesTransferred = 0;
        while let Some(chunk) = body.next().await {
            read += chunk?.len() as BytesTransferred;
        }
        Ok::<_, ProbeError>(read)
    })
    .await
}

/// Pushes `size` bytes of filler and waits for the target to accept them.
async fn upload<T: TransferTarget>(
    ctx: &ProbeContext,
    client: &dyn TransferClient,
    url: &str,
    target: &T,
    size: usize,
) -> Result<BytesTransferred> {
    ctx.check()?;

    let payload = target.upload_payload(size);
    let sent = payload.size() as BytesTransferred;
    ctx.run(async {
        let res = client.post(ctx, url, payload).await?;
        if !target.accepts(res.status) {
            return Err(ProbeError::Status {
                url: res.url,
                status: res.status,
            });
        }
        res.read_content().await?;
        Ok::<_, ProbeError>(sent)
    })
    .await
}
