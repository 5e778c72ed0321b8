use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// key: billing-transaction-gate -> per-account mutual exclusion
#[derive(Clone, Default)]
pub struct TransactionGate {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Held while an account is closed; dropping it reopens the account.
pub struct GateGuard {
    account: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl GateGuard {
    pub fn account(&self) -> Uuid {
        self.account
    }
}

impl TransactionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder has `account` closed.
    pub async fn close(&self, account: Uuid) -> GateGuard {
        let lock = self
            .locks
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        GateGuard {
            account,
            _guard: lock.lock_owned().await,
        }
    }

    pub fn open(&self, guard: GateGuard) {
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn close_serializes_same_account() {
        let gate = TransactionGate::new();
        let account = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let guard = gate.close(account).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                gate.open(guard);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_accounts_do_not_block() {
        let gate = TransactionGate::new();
        let first = gate.close(Uuid::new_v4()).await;
        let second = tokio::time::timeout(Duration::from_millis(50), gate.close(Uuid::new_v4()))
            .await
            .expect("independent account must not wait");
        assert_ne!(first.account(), second.account());
    }
}
