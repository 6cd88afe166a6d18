//! The orchestrator's ordered set of resource handles.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{InstanceId, ResourceSnapshot};
use tracing::{error, info};

use super::{Cache, Database, ResourceHandle};
use crate::error::{LifecycleError, ResourceError};

/// Every resource the orchestrator acquires, in acquisition order.
///
/// Acquisition order is database then cache; release order is the exact
/// reverse. Subsystems receive an `Arc<ResourceSet>` and can use every
/// resource, but only the orchestrator can release them.
pub struct ResourceSet {
    instance_id: InstanceId,
    database: ResourceHandle<dyn Database>,
    cache: ResourceHandle<dyn Cache>,
}

impl ResourceSet {
    /// Opens the database, then the cache. Each connect and the cleanup
    /// close are bounded by `timeout`.
    ///
    /// If the cache fails after the database opened, the database is
    /// released before the error is returned so a failed startup leaks
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ResourceAcquisition`] naming the resource
    /// that failed.
    pub async fn acquire(
        instance_id: InstanceId,
        database: Arc<dyn Database>,
        cache: Arc<dyn Cache>,
        timeout: Duration,
    ) -> Result<Self, LifecycleError> {
        let set = Self {
            instance_id,
            database: ResourceHandle::new(database),
            cache: ResourceHandle::new(cache),
        };

        set.database
            .acquire(timeout)
            .await
            .map_err(|source| LifecycleError::ResourceAcquisition {
                resource: "database",
                source,
            })?;

        if let Err(source) = set.cache.acquire(timeout).await {
            if let Err(e) = set.database.release(timeout).await {
                error!(error = %e, "database release after failed cache acquisition");
            }
            return Err(LifecycleError::ResourceAcquisition {
                resource: "cache",
                source,
            });
        }

        info!(instance_id = %set.instance_id, "resources acquired");
        Ok(set)
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    #[must_use]
    pub fn database(&self) -> &ResourceHandle<dyn Database> {
        &self.database
    }

    #[must_use]
    pub fn cache(&self) -> &ResourceHandle<dyn Cache> {
        &self.cache
    }

    /// Snapshots in acquisition order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ResourceSnapshot> {
        vec![self.database.snapshot(), self.cache.snapshot()]
    }

    /// Closes every resource in reverse acquisition order. Failures are
    /// collected and returned; they never stop the remaining closes.
    pub(crate) async fn release_all(&self, per_resource_timeout: Duration) -> Vec<ResourceError> {
        let mut failures = Vec::new();
        if let Err(e) = self.cache.release(per_resource_timeout).await {
            failures.push(e);
        }
        if let Err(e) = self.database.release(per_resource_timeout).await {
            failures.push(e);
        }
        failures
    }
}


#[cfg(test)]
mod tests {
    use keel_core::ResourceState;

    use super::testing::{new_log, RecordingResource};
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn id() -> InstanceId {
        InstanceId::with_prefix("test")
    }

    #[tokio::test]
    async fn acquires_database_before_cache() {
        let log = new_log();
        let set = ResourceSet::acquire(
            id(),
            Arc::new(RecordingResource::new("database", &log)),
            Arc::new(RecordingResource::new("cache", &log)),
            TIMEOUT,
        )
        .await
        .unwrap();

        assert_eq!(*log.lock(), vec!["connect:database", "connect:cache"]);
        assert_eq!(set.database().state(), ResourceState::Ready);
        assert_eq!(set.cache().state(), ResourceState::Ready);
    }

    #[tokio::test]
    async fn releases_in_reverse_acquisition_order() {
        let log = new_log();
        let set = ResourceSet::acquire(
            id(),
            Arc::new(RecordingResource::new("database", &log)),
            Arc::new(RecordingResource::new("cache", &log)),
            TIMEOUT,
        )
        .await
        .unwrap();
        log.lock().clear();

        let failures = set.release_all(TIMEOUT).await;

        assert!(failures.is_empty());
        assert_eq!(*log.lock(), vec!["close:cache", "close:database"]);
        assert_eq!(set.database().state(), ResourceState::Closed);
        assert_eq!(set.cache().state(), ResourceState::Closed);
    }

    #[tokio::test]
    async fn close_failure_does_not_stop_remaining_closes() {
        let log = new_log();
        let mut cache = RecordingResource::new("cache", &log);
        cache.fail_close = true;
        let set = ResourceSet::acquire(
            id(),
            Arc::new(RecordingResource::new("database", &log)),
            Arc::new(cache),
            TIMEOUT,
        )
        .await
        .unwrap();

        let failures = set.release_all(TIMEOUT).await;

        assert_eq!(failures.len(), 1);
        assert!(log.lock().contains(&"close:database".to_string()));
    }

    #[tokio::test]
    async fn database_failure_is_fatal_and_skips_cache() {
        let log = new_log();
        let mut db = RecordingResource::new("database", &log);
        db.fail_connect = true;

        let Err(err) = ResourceSet::acquire(
            id(),
            Arc::new(db),
            Arc::new(RecordingResource::new("cache", &log)),
            TIMEOUT,
        )
        .await
        else {
            panic!("acquire should fail");
        };

        assert!(matches!(
            err,
            LifecycleError::ResourceAcquisition { resource: "database", .. }
        ));
        assert_eq!(*log.lock(), vec!["connect:database"]);
    }

    #[tokio::test]
    async fn cache_failure_releases_the_database() {
        let log = new_log();
        let mut cache = RecordingResource::new("cache", &log);
        cache.fail_connect = true;

        let result = ResourceSet::acquire(
            id(),
            Arc::new(RecordingResource::new("database", &log)),
            Arc::new(cache),
            TIMEOUT,
        )
        .await;

        assert!(matches!(
            result,
            Err(LifecycleError::ResourceAcquisition { resource: "cache", .. })
        ));
        assert_eq!(
            *log.lock(),
            vec!["connect:database", "connect:cache", "close:database"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_database_fails_acquisition_within_the_timeout() {
        let log = new_log();
        let mut db = RecordingResource::new("database", &log);
        db.hang_connect = true;

        let Err(err) = ResourceSet::acquire(
            id(),
            Arc::new(db),
            Arc::new(RecordingResource::new("cache", &log)),
            Duration::from_millis(200),
        )
        .await
        else {
            panic!("acquire should time out");
        };

        assert!(matches!(
            err,
            LifecycleError::ResourceAcquisition {
                resource: "database",
                source: ResourceError::ConnectTimeout { .. },
            }
        ));
        assert_eq!(*log.lock(), vec!["connect:database"]);
    }
}
