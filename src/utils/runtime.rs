use anyhow::Result;

/// The host runs every component on one thread; events, timers and round trips share a single
/// queue.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
