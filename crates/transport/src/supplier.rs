//! Background pool of pre-generated ephemeral DH keypairs.
//!
//! Handshakes burn one keypair each and 2048-bit exponentiation is slow, so a
//! producer task keeps a bounded queue topped up off the hot path. The
//! channel is the queue: the producer parks when it is full and refills as
//! consumers drain it.

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use veilnet_crypto::DhKeys;

/// Pre-generated keys kept ready.
const DEFAULT_POOL_SIZE: usize = 5;

pub struct DhSupplier {
    queue: Mutex<mpsc::Receiver<DhKeys>>,
}

impl DhSupplier {
    /// Start the generation task and return the consumer side.
    pub fn start() -> Self {
        Self::with_size(DEFAULT_POOL_SIZE)
    }

    pub fn with_size(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size);
        tokio::spawn(async move {
            loop {
                let pair = match tokio::task::spawn_blocking(DhKeys::generate).await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                if tx.send(pair).await.is_err() {
                    break;
                }
            }
            debug!("DH supplier stopped");
        });
        Self {
            queue: Mutex::new(rx),
        }
    }

    /// Take the next pre-generated keypair, falling back to inline
    /// generation if the pool is gone.
    pub async fn acquire(&self) -> DhKeys {
        let mut rx = self.queue.lock().await;
        match rx.recv().await {
            Some(pair) => pair,
            None => tokio::task::spawn_blocking(DhKeys::generate)
                .await
                .unwrap_or_else(|_| DhKeys::generate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_hands_out_distinct_keys() {
        let supplier = DhSupplier::with_size(2);
        let a = supplier.acquire().await;
        let b = supplier.acquire().await;
        assert_ne!(a.public(), b.public());
    }
}
