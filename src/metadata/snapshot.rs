use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{MetadataError, MetadataSource};

/// Memoising wrapper: each key is fetched at most once per snapshot and
/// never changes afterwards. Failures are not remembered, so a caller
/// polling for a key that is not yet visible keeps hitting the source.
///
/// There is no per-key invalidation. To observe newer metadata, call
/// [`MetadataSnapshot::refresh`], which yields a fresh, empty snapshot.
pub struct MetadataSnapshot<S> {
    source: S,
    values: Mutex<HashMap<String, String>>,
}

impl<S: MetadataSource> MetadataSnapshot<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn refresh(self) -> Self {
        Self::new(self.source)
    }

    fn cached(&self, path: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl<S: MetadataSource> MetadataSource for MetadataSnapshot<S> {
    async fn get(&self, path: &str) -> Result<String, MetadataError> {
        if let Some(value) = self.cached(path) {
            return Ok(value);
        }

        let value = self.source.get(path).await?;

        // First writer wins so a value never changes once observed.
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.entry(path.to_string()).or_insert(value).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicU32>,
        missing_until: u32,
    }

    #[async_trait]
    impl MetadataSource for Counting {
        async fn get(&self, path: &str) -> Result<String, MetadataError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.missing_until {
                return Err(MetadataError::NotFound(path.to_string()));
            }
            Ok(format!("{path}#{n}"))
        }
    }

    #[tokio::test]
    async fn fetches_each_key_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let snap = MetadataSnapshot::new(Counting {
            calls: Arc::clone(&calls),
            missing_until: 0,
        });

        assert_eq!(snap.get("mac").await.unwrap(), "mac#1");
        assert_eq!(snap.get("mac").await.unwrap(), "mac#1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snap = snap.refresh();
        assert_eq!(snap.get("mac").await.unwrap(), "mac#2");
    }

    #[tokio::test]
    async fn not_found_is_not_cached() {
        let calls = Arc::new(AtomicU32::new(0));
        let snap = MetadataSnapshot::new(Counting {
            calls: Arc::clone(&calls),
            missing_until: 2,
        });

        assert!(snap.get("ipv6s").await.unwrap_err().is_not_found());
        assert!(snap.get("ipv6s").await.unwrap_err().is_not_found());
        assert_eq!(snap.get("ipv6s").await.unwrap(), "ipv6s#3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
