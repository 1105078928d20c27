//! Round-robin proxy pool with a deterministic rotation cursor.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::proxy::{ProxyDescriptor, ProxyUrlError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("proxy pool requires at least one proxy url")]
    EmptyPool,
    #[error(transparent)]
    InvalidProxy(#[from] ProxyUrlError),
}

/// Immutable after construction; only the rotation cursor advances.
#[derive(Debug)]
pub struct ProxyPool {
    descriptors: Vec<ProxyDescriptor>,
    cursor: AtomicUsize,
}

impl ProxyPool {
    pub fn new<I, S>(urls: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let descriptors = urls
            .into_iter()
            .map(|u| ProxyDescriptor::parse(u.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if descriptors.is_empty() {
            return Err(PoolError::EmptyPool);
        }
        Ok(Self {
            descriptors,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Returns the descriptor at the cursor and advances it. Across
    /// `n * k` calls every descriptor is produced exactly `k` times, in
    /// fixed order.
    pub fn next(&self) -> &ProxyDescriptor {
        self.next_indexed().1
    }

    pub(crate) fn next_indexed(&self) -> (usize, &ProxyDescriptor) {
        let n = self.descriptors.len();
        let idx = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some((c + 1) % n))
            .unwrap_or(0);
        (idx, &self.descriptors[idx])
    }

    /// The descriptor after `index`, or `None` for a single-proxy pool.
    pub fn alternative(&self, index: usize) -> Option<&ProxyDescriptor> {
        if self.descriptors.len() < 2 {
            return None;
        }
        self.descriptors.get((index + 1) % self.descriptors.len())
    }

    pub fn size(&self) -> usize {
        self.descriptors.len()
    }

    pub fn get(&self, index: usize) -> Option<&ProxyDescriptor> {
        self.descriptors.get(index)
    }

    pub fn all(&self) -> &[ProxyDescriptor] {
        &self.descriptors
    }

    pub fn reset(&self) {
        self.cursor.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ProxyPool {
        ProxyPool::new([
            "http://p1:8080",
            "http://p2:8080",
            "socks5://p3:1080",
        ])
        .unwrap()
    }

    #[test]
    fn empty_input_is_rejected() {
        let urls: Vec<&str> = Vec::new();
        assert!(matches!(ProxyPool::new(urls), Err(PoolError::EmptyPool)));
    }

    #[test]
    fn rotation_is_deterministic() {
        let pool = pool();
        let hosts: Vec<String> = (0..6).map(|_| pool.next().host.clone()).collect();
        assert_eq!(hosts, ["p1", "p2", "p3", "p1", "p2", "p3"]);
    }

    #[test]
    fn distribution_is_uniform() {
        let pool = pool();
        let k = 4;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..pool.size() * k {
            *counts.entry(pool.next().host.clone()).or_insert(0usize) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == k));
    }

    #[test]
    fn alternative_never_matches_current() {
        let pool = pool();
        for i in 0..pool.size() {
            let alt = pool.alternative(i).unwrap();
            assert_ne!(alt, pool.get(i).unwrap());
        }
    }

    #[test]
    fn alternative_is_none_for_single_proxy() {
        let pool = ProxyPool::new(["http://solo:8080"]).unwrap();
        assert!(pool.alternative(0).is_none());
    }

    #[test]
    fn reset_restarts_rotation() {
        let pool = pool();
        pool.next();
        pool.next();
        pool.reset();
        assert_eq!(pool.next().host, "p1");
    }
}
