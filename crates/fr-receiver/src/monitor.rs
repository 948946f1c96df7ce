//! Periodic buffer monitor task.

use fr_decoder::FrameDecoder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Call [`FrameDecoder::monitor_buffers`] every `period` until shutdown.
pub(crate) async fn run_monitor(
    decoder: Arc<FrameDecoder>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_ms = period.as_millis() as u64, "Buffer monitor started");

    let mut last_timedout = decoder.num_frames_timedout();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                decoder.monitor_buffers();
                let timedout = decoder.num_frames_timedout();
                if timedout != last_timedout {
                    debug!(
                        new_timeouts = timedout - last_timedout,
                        total = timedout,
                        "Monitor timed out frames"
                    );
                    last_timedout = timedout;
                }
            }
        }
    }

    info!("Buffer monitor stopped");
}
