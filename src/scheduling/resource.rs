//! Resource Limiting
//!
//! Admission control over scarce external capacity: browser instances,
//! gateway connections, memory and CPU. Each resource type owns a counting
//! token pool. Acquiring returns a [`ResourceGuard`] that hands the token
//! back when dropped, so release happens exactly once on every exit path,
//! including errors and task cancellation.
//!
//! Resizing a pool with [`ResourceLimiter::set_limit`] keeps outstanding
//! holds intact. Shrinking below the number of tokens in use records a debt
//! that is paid off as holders release, so the pool never admits more than
//! the new limit.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Category of scarce capacity subject to an admission limit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Browser,
    Gateway,
    Memory,
    Cpu,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [Self::Browser, Self::Gateway, Self::Memory, Self::Cpu];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Gateway => "gateway",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(Self::Browser),
            "gateway" => Ok(Self::Gateway),
            "memory" => Ok(Self::Memory),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("Unknown resource type '{}'", other)),
        }
    }
}

/// Point-in-time view of one pool.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStatus {
    pub limit: usize,
    pub available: usize,
    pub in_use: usize,
}

#[derive(Debug)]
struct PoolCounters {
    limit: usize,
    in_use: usize,
    /// Permits to retire as holders release after a shrink
    debt: usize,
}

#[derive(Debug)]
struct Pool {
    semaphore: Arc<Semaphore>,
    counters: Mutex<PoolCounters>,
}

impl Pool {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            counters: Mutex::new(PoolCounters {
                limit,
                in_use: 0,
                debt: 0,
            }),
        }
    }

    fn resize(&self, new_limit: usize) {
        let mut counters = self.counters.lock();
        let old_limit = counters.limit;

        if new_limit > old_limit {
            let growth = new_limit - old_limit;
            let repaid = growth.min(counters.debt);
            counters.debt -= repaid;
            self.semaphore.add_permits(growth - repaid);
        } else if new_limit < old_limit {
            let mut to_retire = old_limit - new_limit;
            while to_retire > 0 {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        to_retire -= 1;
                    }
                    Err(_) => break,
                }
            }
            counters.debt += to_retire;
        }

        counters.limit = new_limit;
    }

    fn status(&self) -> ResourceStatus {
        let counters = self.counters.lock();
        ResourceStatus {
            limit: counters.limit,
            available: counters.limit.saturating_sub(counters.in_use),
            in_use: counters.in_use,
        }
    }
}

/// Token held for one resource type. Dropping it releases the token.
#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct ResourceGuard {
    resource: ResourceType,
    hold: Option<(Arc<Pool>, OwnedSemaphorePermit)>,
}

impl ResourceGuard {
    /// Returns the resource type this guard holds.
    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    /// Returns true if the guard holds a token from a limited pool.
    pub fn is_limited(&self) -> bool {
        self.hold.is_some()
    }

    /// Releases the token now.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("resource", &self.resource)
            .field("limited", &self.hold.is_some())
            .finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let Some((pool, permit)) = self.hold.take() else {
            return;
        };
        let mut counters = pool.counters.lock();
        counters.in_use = counters.in_use.saturating_sub(1);
        if counters.debt > 0 {
            counters.debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
        debug!(
            "Released {} token ({}/{} in use)",
            self.resource, counters.in_use, counters.limit
        );
    }
}

/// Fixed set of named resource pools with per-type admission limits.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use playrunner::scheduling::{ResourceLimiter, ResourceType};
///
/// # async fn demo() {
/// let limiter = ResourceLimiter::new([(ResourceType::Browser, 1)]);
/// if let Some(guard) = limiter.acquire(ResourceType::Browser, Some(Duration::from_secs(5))).await {
///     // drive the browser
///     guard.release();
/// }
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ResourceLimiter {
    pools: Mutex<HashMap<ResourceType, Arc<Pool>>>,
}

impl ResourceLimiter {
    /// Creates a limiter; resource types without a limit are unlimited.
    pub fn new(limits: impl IntoIterator<Item = (ResourceType, usize)>) -> Self {
        let pools = limits
            .into_iter()
            .map(|(resource, limit)| (resource, Arc::new(Pool::new(limit))))
            .collect();
        Self {
            pools: Mutex::new(pools),
        }
    }

    fn pool(&self, resource: ResourceType) -> Option<Arc<Pool>> {
        self.pools.lock().get(&resource).cloned()
    }

    /// Waits for a token of the given type.
    ///
    /// With a timeout, returns `None` if no token frees up in time. Without
    /// one, waits until a token is available. Unlimited types always succeed.
    pub async fn acquire(
        &self,
        resource: ResourceType,
        timeout: Option<Duration>,
    ) -> Option<ResourceGuard> {
        let Some(pool) = self.pool(resource) else {
            return Some(ResourceGuard {
                resource,
                hold: None,
            });
        };

        let acquisition = pool.semaphore.clone().acquire_owned();
        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquisition).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    debug!("Timed out after {:?} waiting for {} token", limit, resource);
                    return None;
                }
            },
            None => acquisition.await.ok(),
        };

        let Some(permit) = permit else {
            warn!("Token pool for {} was closed", resource);
            return None;
        };

        let mut counters = pool.counters.lock();
        counters.in_use += 1;
        debug!(
            "Acquired {} token ({}/{} in use)",
            resource, counters.in_use, counters.limit
        );
        drop(counters);

        Some(ResourceGuard {
            resource,
            hold: Some((pool, permit)),
        })
    }

    /// Takes a token without waiting, if one is free.
    pub fn try_acquire(&self, resource: ResourceType) -> Option<ResourceGuard> {
        let Some(pool) = self.pool(resource) else {
            return Some(ResourceGuard {
                resource,
                hold: None,
            });
        };
        let permit = pool.semaphore.clone().try_acquire_owned().ok()?;
        pool.counters.lock().in_use += 1;
        Some(ResourceGuard {
            resource,
            hold: Some((pool, permit)),
        })
    }

    /// Acquires several resource types, in a fixed order to avoid deadlock.
    ///
    /// Either every token is acquired or none is held on return.
    pub async fn acquire_all(
        &self,
        resources: &[ResourceType],
        timeout: Option<Duration>,
    ) -> Result<Vec<ResourceGuard>, ResourceType> {
        let mut ordered = resources.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for resource in ordered {
            match self.acquire(resource, timeout).await {
                Some(guard) => guards.push(guard),
                None => return Err(resource),
            }
        }
        Ok(guards)
    }

    /// Returns a token to its pool. Equivalent to dropping the guard.
    pub fn release(&self, guard: ResourceGuard) {
        drop(guard);
    }

    /// Changes the limit of a pool, creating it if the type was unlimited.
    pub fn set_limit(&self, resource: ResourceType, limit: usize) {
        let mut pools = self.pools.lock();
        match pools.get(&resource) {
            Some(pool) => pool.resize(limit),
            None => {
                pools.insert(resource, Arc::new(Pool::new(limit)));
            }
        }
        debug!("Set {} limit to {}", resource, limit);
    }

    /// Returns a snapshot of every limited pool.
    pub fn get_status(&self) -> HashMap<ResourceType, ResourceStatus> {
        let pools: Vec<(ResourceType, Arc<Pool>)> = self
            .pools
            .lock()
            .iter()
            .map(|(r, p)| (*r, Arc::clone(p)))
            .collect();
        pools
            .into_iter()
            .map(|(resource, pool)| (resource, pool.status()))
            .collect()
    }

    /// Returns the snapshot for one type, or `None` if it is unlimited.
    pub fn status_of(&self, resource: ResourceType) -> Option<ResourceStatus> {
        self.pool(resource).map(|pool| pool.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn browser_limiter(limit: usize) -> ResourceLimiter {
        ResourceLimiter::new([(ResourceType::Browser, limit)])
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!("BROWSER".parse::<ResourceType>().unwrap(), ResourceType::Browser);
        assert_eq!(" cpu ".parse::<ResourceType>().unwrap(), ResourceType::Cpu);
        assert!("disk".parse::<ResourceType>().is_err());
    }

    #[tokio::test]
    async fn test_acquire_and_release_updates_status() {
        let limiter = browser_limiter(2);
        let guard = limiter.acquire(ResourceType::Browser, None).await.unwrap();

        let status = limiter.status_of(ResourceType::Browser).unwrap();
        assert_eq!(status, ResourceStatus { limit: 2, available: 1, in_use: 1 });

        limiter.release(guard);
        let status = limiter.status_of(ResourceType::Browser).unwrap();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.available, 2);
    }

    #[tokio::test]
    async fn test_unlimited_type_always_succeeds() {
        let limiter = browser_limiter(1);
        let a = limiter.acquire(ResourceType::Gateway, Some(Duration::ZERO)).await;
        let b = limiter.acquire(ResourceType::Gateway, Some(Duration::ZERO)).await;
        assert!(a.is_some() && b.is_some());
        assert!(!a.unwrap().is_limited());
        assert!(limiter.status_of(ResourceType::Gateway).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let limiter = browser_limiter(1);
        let _held = limiter.acquire(ResourceType::Browser, None).await.unwrap();

        let second = limiter
            .acquire(ResourceType::Browser, Some(Duration::from_millis(100)))
            .await;
        assert!(second.is_none());
        assert_eq!(limiter.status_of(ResourceType::Browser).unwrap().in_use, 1);
    }

    #[tokio::test]
    async fn test_second_acquire_blocks_until_release() {
        let limiter = Arc::new(browser_limiter(1));
        let first = limiter.acquire(ResourceType::Browser, None).await.unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let acquired = Arc::clone(&acquired);
            tokio::spawn(async move {
                let guard = limiter.acquire(ResourceType::Browser, None).await;
                acquired.store(true, Ordering::SeqCst);
                guard.is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        assert!(waiter.await.unwrap());
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_released_when_task_aborted() {
        let limiter = Arc::new(browser_limiter(1));
        let task = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _guard = limiter.acquire(ResourceType::Browser, None).await;
                std::future::pending::<()>().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.status_of(ResourceType::Browser).unwrap().in_use, 1);

        task.abort();
        let _ = task.await;
        assert_eq!(limiter.status_of(ResourceType::Browser).unwrap().in_use, 0);
        assert!(limiter.try_acquire(ResourceType::Browser).is_some());
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let limiter = browser_limiter(1);
        let held = limiter.try_acquire(ResourceType::Browser);
        assert!(held.is_some());
        assert!(limiter.try_acquire(ResourceType::Browser).is_none());
    }

    #[tokio::test]
    async fn test_set_limit_grow() {
        let limiter = browser_limiter(1);
        let _a = limiter.acquire(ResourceType::Browser, None).await.unwrap();
        limiter.set_limit(ResourceType::Browser, 3);

        assert!(limiter.try_acquire(ResourceType::Browser).is_some());
        let status = limiter.status_of(ResourceType::Browser).unwrap();
        assert_eq!(status.limit, 3);
    }

    #[tokio::test]
    async fn test_set_limit_shrink_preserves_holds_without_overadmission() {
        let limiter = browser_limiter(3);
        let a = limiter.acquire(ResourceType::Browser, None).await.unwrap();
        let b = limiter.acquire(ResourceType::Browser, None).await.unwrap();

        limiter.set_limit(ResourceType::Browser, 1);
        // Two holders remain, limit is now one: nothing may be admitted.
        assert!(limiter.try_acquire(ResourceType::Browser).is_none());

        drop(a);
        // Still one holder at limit one.
        assert!(limiter.try_acquire(ResourceType::Browser).is_none());

        drop(b);
        let c = limiter.try_acquire(ResourceType::Browser);
        assert!(c.is_some());
        assert!(limiter.try_acquire(ResourceType::Browser).is_none());

        let status = limiter.status_of(ResourceType::Browser).unwrap();
        assert_eq!(status, ResourceStatus { limit: 1, available: 0, in_use: 1 });
    }

    #[tokio::test]
    async fn test_set_limit_on_unlimited_type_creates_pool() {
        let limiter = browser_limiter(1);
        limiter.set_limit(ResourceType::Memory, 1);
        let _m = limiter.try_acquire(ResourceType::Memory).unwrap();
        assert!(limiter.try_acquire(ResourceType::Memory).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_all_is_all_or_nothing() {
        let limiter = ResourceLimiter::new([(ResourceType::Browser, 1), (ResourceType::Gateway, 1)]);
        let _gw = limiter.acquire(ResourceType::Gateway, None).await.unwrap();

        let result = limiter
            .acquire_all(
                &[ResourceType::Gateway, ResourceType::Browser],
                Some(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(result.unwrap_err(), ResourceType::Gateway);
        // The browser token taken before the gateway timeout was handed back.
        assert_eq!(limiter.status_of(ResourceType::Browser).unwrap().in_use, 0);
    }

    #[test]
    fn test_get_status_lists_limited_pools() {
        let limiter = ResourceLimiter::new([(ResourceType::Browser, 2), (ResourceType::Cpu, 4)]);
        let status = limiter.get_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[&ResourceType::Cpu].available, 4);
    }
}
