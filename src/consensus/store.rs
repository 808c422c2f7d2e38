use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::common::crypto::Digest;

type StoreValue = Vec<u8>;

#[derive(Default)]
struct StoreInner {
    data: HashMap<Digest, StoreValue>,
    // Readers parked on keys not yet written; fulfilled atomically with the
    // write so no reader can observe a partial value.
    pending: HashMap<Digest, Vec<oneshot::Sender<StoreValue>>>,
}

/// Content-addressed key -> bytes map shared by Core, the mempool driver,
/// the synchronizer and the helper. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, key: Digest, value: StoreValue) {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.data.insert(key, value.clone());
            inner.pending.remove(&key).unwrap_or_default()
        };
        for waiter in waiters {
            // A dropped receiver just means the waiter was cancelled.
            let _ = waiter.send(value.clone());
        }
    }

    pub fn read(&self, key: &Digest) -> Option<StoreValue> {
        self.inner.lock().unwrap().data.get(key).cloned()
    }

    pub fn contains(&self, key: &Digest) -> bool {
        self.inner.lock().unwrap().data.contains_key(key)
    }

    /// Resolve immediately if the key is present, otherwise park until the
    /// matching `write` lands.
    pub async fn notify_read(&self, key: Digest) -> StoreValue {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(value) = inner.data.get(&key) {
                return value.clone();
            }
            let (sender, receiver) = oneshot::channel();
            inner.pending.entry(key).or_default().push(sender);
            receiver
        };
        receiver
            .await
            .expect("store dropped while a notify_read was parked")
    }
}
