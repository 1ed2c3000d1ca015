use crate::error::Result;
use crate::prober::speed::RateSink;
use crate::types::BytesPerSecond;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn format_speed(label: &str, speed: BytesPerSecond, show_bytes: bool) -> String {
    if show_bytes {
        format!("{} speed: {}", label, speed)
    } else {
        format!("{} speed: {}", label, speed.bits_per_second())
    }
}

/// Live observer for one probing run: a spinner redrawn with every rate
/// estimate, finished with the final figure.
pub struct SpeedPrinter {
    bar: ProgressBar,
    label: &'static str,
    show_bytes: bool,
    render: JoinHandle<()>,
}

impl SpeedPrinter {
    /// Starts the spinner and returns the sink to hand to the prober.
    pub fn start(label: &'static str, show_bytes: bool) -> (Self, RateSink) {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format_speed(label, BytesPerSecond::default(), show_bytes));

        let (tx, mut rx) = mpsc::unbounded_channel::<BytesPerSecond>();
        let render = tokio::spawn({
            let bar = bar.clone();
            async move {
                while let Some(speed) = rx.recv().await {
                    bar.set_message(format_speed(label, speed, show_bytes));
                }
            }
        });

        (
            Self {
                bar,
                label,
                show_bytes,
                render,
            },
            tx,
        )
    }

    /// Waits for the live stream to drain, then prints the final figure (or
    /// clears the line on failure) and passes `res` through.
    pub async fn finish(self, res: Result<BytesPerSecond>) -> Result<BytesPerSecond> {
        let _ = self.render.await;
        match &res {
            Ok(speed) => self
                .bar
                .finish_with_message(format_speed(self.label, *speed, self.show_bytes)),
            Err(_) => self.bar.finish_and_clear(),
        }
        res
    }
}
