use std::time::Duration;

use rand::Rng;

use crate::config::DelayRange;

/// Draw a delay uniformly from the range
pub fn jitter(range: DelayRange) -> Duration {
    if range.max_ms <= range.min_ms {
        return Duration::from_millis(range.min_ms);
    }
    let ms = rand::thread_rng().gen_range(range.min_ms..=range.max_ms);
    Duration::from_millis(ms)
}

/// Sleep for a jittered delay from the range
pub async fn pause(range: DelayRange) {
    let delay = jitter(range);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
