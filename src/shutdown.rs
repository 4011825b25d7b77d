use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
/// Sessions, backoff sleeps and the master's accept loop all race against this
/// token, so cancellation latency is bounded by the slowest in-flight write.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `false` when the sleep was interrupted by cancellation.
pub async fn cancellable_sleep(token: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let token = CancellationToken::new();
        assert!(cancellable_sleep(&token, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn cancellation_interrupts_long_sleep() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let started = std::time::Instant::now();
        assert!(!cancellable_sleep(&token, Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
