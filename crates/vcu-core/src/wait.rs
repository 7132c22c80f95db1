use std::time::Duration;

use tokio::time::error::Elapsed;

/// Polls `pred` every `poll` until it holds, failing after `timeout`.
pub async fn wait_for<F>(pred: F, timeout: Duration, poll: Duration) -> Result<(), Elapsed>
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !pred() {
            tokio::time::sleep(poll).await;
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_predicate_checked_until_true() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        let res = wait_for(
            move || p.fetch_add(1, Ordering::SeqCst) >= 3,
            Duration::from_millis(5000),
            Duration::from_millis(100),
        )
        .await;
        assert!(res.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let start = tokio::time::Instant::now();
        let res = wait_for(|| false, Duration::from_millis(5000), Duration::from_millis(100)).await;
        assert!(res.is_err());
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
    }
}
