//! Dedicated threads for BLS signing and verification
//!
//! Pairing checks are too slow for the async runtime. Each worker owns a
//! bounded queue; requests are dispatched round-robin and answered over a
//! oneshot channel. A full queue makes the caller wait.

use crate::{ConsensusError, ConsensusResult};
use chain_core::{BlsPublicKey, BlsSignature, ConsensusSignature, Signer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum CryptoRequest {
    Sign {
        signer: Arc<dyn Signer>,
        message: Vec<u8>,
        respond: oneshot::Sender<BlsSignature>,
    },
    Verify {
        message: Vec<u8>,
        signature: BlsSignature,
        public_key: BlsPublicKey,
        respond: oneshot::Sender<bool>,
    },
    VerifyAggregate {
        message: Vec<u8>,
        signature: BlsSignature,
        public_keys: Vec<BlsPublicKey>,
        respond: oneshot::Sender<bool>,
    },
    Aggregate {
        signatures: Vec<BlsSignature>,
        respond: oneshot::Sender<ConsensusResult<BlsSignature>>,
    },
}

/// Pool of signature worker threads
pub struct CryptoWorkerPool {
    senders: Vec<mpsc::Sender<CryptoRequest>>,
    next: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CryptoWorkerPool {
    pub fn new(
        workers: usize,
        queue_depth: usize,
        signature: Arc<dyn ConsensusSignature>,
    ) -> ConsensusResult<Self> {
        if workers == 0 || queue_depth == 0 {
            return Err(ConsensusError::Config(
                "crypto worker pool needs at least one worker and a non-empty queue".into(),
            ));
        }

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (sender, receiver) = mpsc::channel(queue_depth);
            let signature = signature.clone();
            let handle = std::thread::Builder::new()
                .name(format!("consensus-crypto-{id}"))
                .spawn(move || run_worker(receiver, signature))
                .map_err(|e| ConsensusError::Config(format!("failed to spawn crypto worker: {e}")))?;
            senders.push(sender);
            handles.push(handle);
        }
        debug!("Started {} crypto workers", workers);

        Ok(Self {
            senders,
            next: AtomicUsize::new(0),
            handles: Mutex::new(handles),
        })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    async fn dispatch<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CryptoRequest,
    ) -> ConsensusResult<T> {
        let (respond, response) = oneshot::channel();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index]
            .send(build(respond))
            .await
            .map_err(|_| ConsensusError::Crypto("crypto worker stopped".into()))?;
        response
            .await
            .map_err(|_| ConsensusError::Crypto("crypto worker dropped request".into()))
    }

    pub async fn sign(&self, signer: Arc<dyn Signer>, message: Vec<u8>) -> ConsensusResult<BlsSignature> {
        self.dispatch(|respond| CryptoRequest::Sign {
            signer,
            message,
            respond,
        })
        .await
    }

    pub async fn verify(
        &self,
        message: Vec<u8>,
        signature: BlsSignature,
        public_key: BlsPublicKey,
    ) -> ConsensusResult<bool> {
        self.dispatch(|respond| CryptoRequest::Verify {
            message,
            signature,
            public_key,
            respond,
        })
        .await
    }

    pub async fn verify_aggregate(
        &self,
        message: Vec<u8>,
        signature: BlsSignature,
        public_keys: Vec<BlsPublicKey>,
    ) -> ConsensusResult<bool> {
        self.dispatch(|respond| CryptoRequest::VerifyAggregate {
            message,
            signature,
            public_keys,
            respond,
        })
        .await
    }

    pub async fn aggregate(&self, signatures: Vec<BlsSignature>) -> ConsensusResult<BlsSignature> {
        self.dispatch(|respond| CryptoRequest::Aggregate {
            signatures,
            respond,
        })
        .await?
    }
}

impl Drop for CryptoWorkerPool {
    fn drop(&mut self) {
        // Closing the queues ends the worker loops
        self.senders.clear();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Crypto worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for CryptoWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoWorkerPool")
            .field("workers", &self.senders.len())
            .finish()
    }
}

fn run_worker(mut receiver: mpsc::Receiver<CryptoRequest>, signature: Arc<dyn ConsensusSignature>) {
    while let Some(request) = receiver.blocking_recv() {
        // A dropped response receiver means the caller gave up
        match request {
            CryptoRequest::Sign {
                signer,
                message,
                respond,
            } => {
                let _ = respond.send(signer.sign(&message));
            }
            CryptoRequest::Verify {
                message,
                signature: sig,
                public_key,
                respond,
            } => {
                let _ = respond.send(signature.verify(&message, &sig, &public_key));
            }
            CryptoRequest::VerifyAggregate {
                message,
                signature: sig,
                public_keys,
                respond,
            } => {
                let _ = respond.send(signature.verify_aggregate(&message, &sig, &public_keys));
            }
            CryptoRequest::Aggregate {
                signatures,
                respond,
            } => {
                let _ = respond.send(signature.aggregate(&signatures).map_err(Into::into));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::consensus_key;
    use chain_core::Bls12381;

    fn pool() -> CryptoWorkerPool {
        CryptoWorkerPool::new(2, 4, Arc::new(Bls12381)).unwrap()
    }

    #[tokio::test]
    async fn test_sign_and_verify_on_workers() {
        let pool = pool();
        let key = Arc::new(consensus_key(0));
        let public_key = key.public_key();

        let signature = pool.sign(key, b"vote".to_vec()).await.unwrap();
        assert!(pool
            .verify(b"vote".to_vec(), signature.clone(), public_key.clone())
            .await
            .unwrap());
        assert!(!pool
            .verify(b"other".to_vec(), signature, public_key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_aggregate_on_workers() {
        let pool = pool();
        let keys: Vec<_> = (0..3).map(consensus_key).collect();
        let signatures: Vec<_> = keys.iter().map(|k| k.sign(b"block")).collect();
        let public_keys: Vec<_> = keys.iter().map(|k| k.public_key()).collect();

        let aggregate = pool.aggregate(signatures).await.unwrap();
        assert!(pool
            .verify_aggregate(b"block".to_vec(), aggregate, public_keys)
            .await
            .unwrap());
        assert!(pool.aggregate(vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_many_concurrent_requests() {
        let pool = Arc::new(pool());
        let key = Arc::new(consensus_key(1));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let pool = pool.clone();
                let key = key.clone();
                tokio::spawn(async move { pool.sign(key, vec![i as u8]).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(CryptoWorkerPool::new(0, 4, Arc::new(Bls12381)).is_err());
    }
}
