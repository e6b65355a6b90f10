//! Process-wide cap on in-flight upstream calls.
//!
//! Every outbound Code-Assist request passes through here so the upstream
//! never sees more than `cap` concurrent connections from this process,
//! regardless of how many client requests are being rotated.

use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct UpstreamGate {
    semaphore: Arc<Semaphore>,
}

impl UpstreamGate {
    pub fn new(cap: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(cap)),
        }
    }

    /// Run `fut` while holding one slot. The permit is released on every
    /// exit path, including panics and cancellation, via RAII.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        // Never closed, so acquire cannot fail.
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore closed");
        fut.await
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
