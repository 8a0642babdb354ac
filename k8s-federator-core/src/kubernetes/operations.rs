use log::{info, warn};

use crate::helpers::pretty_type_name;

use super::{ObjectStore, StoreError, StoreResource};

pub async fn try_get_resource<K: StoreResource>(
    store: &impl ObjectStore,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>, StoreError> {
    match store.get::<K>(namespace, name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Deletes a resource, returns `false` when there was nothing to delete.
pub async fn try_remove_resource<K: StoreResource>(
    store: &impl ObjectStore,
    namespace: Option<&str>,
    name: &str,
) -> Result<bool, StoreError> {
    info!(
        "Removing '{name}' {} resource from the cluster...",
        pretty_type_name::<K>()
    );

    match store.delete::<K>(namespace, name).await {
        Ok(()) => Ok(true),
        Err(err) if err.is_not_found() => {
            info!("'{name}' {} was already gone", pretty_type_name::<K>());
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Creates `resource` or returns the one already stored under its name.
pub async fn create_or_reuse<K: StoreResource>(
    store: &impl ObjectStore,
    resource: &K,
    error_on_existing: bool,
) -> Result<K, StoreError> {
    let name = resource.meta().name.clone().unwrap_or_default();
    let namespace = resource.meta().namespace.clone();

    info!(
        "Creating '{name}' {} resource on the cluster...",
        pretty_type_name::<K>()
    );

    match store.create(resource).await {
        Ok(created) => Ok(created),
        Err(err) if err.is_already_exists() && !error_on_existing => {
            info!("Reusing existing '{name}' {}", pretty_type_name::<K>());
            store.get(namespace.as_deref(), &name).await
        }
        Err(err) => Err(err),
    }
}

/// Creates `desired` or reconciles the stored copy with it.
///
/// `merge` copies the desired fields onto the stored object and reports
/// whether anything changed; unchanged objects aren't written back.
pub async fn create_or_update_resource<K, F>(
    store: &impl ObjectStore,
    desired: &K,
    error_on_existing: bool,
    merge: F,
) -> Result<K, StoreError>
where
    K: StoreResource,
    F: FnOnce(&mut K, &K) -> bool,
{
    let name = desired.meta().name.clone().unwrap_or_default();
    let namespace = desired.meta().namespace.clone();

    match try_get_resource::<K>(store, namespace.as_deref(), &name).await? {
        None => create_or_reuse(store, desired, error_on_existing).await,
        Some(_) if error_on_existing => Err(StoreError::already_exists::<K>(&name)),
        Some(mut existing) => {
            if !merge(&mut existing, desired) {
                return Ok(existing);
            }

            info!(
                "Updating '{name}' {} resource on the cluster...",
                pretty_type_name::<K>()
            );

            store.update(&existing).await.map_err(|err| {
                if err.is_conflict() {
                    warn!("'{name}' {} changed while updating it", pretty_type_name::<K>());
                }
                err
            })
        }
    }
}
