use tokio::select;
use tokio_util::sync::CancellationToken;

/// Cancels `cancelation` on Ctrl-C. Returns as soon as anything else cancels it, which is how
/// the host reports that the browser closed the port.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => (),
    };
}
