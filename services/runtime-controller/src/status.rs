//! Optimistic-concurrency writes for status and finalizers.
//!
//! Every write is a read-modify-write: fetch the latest object, apply the
//! change, write it back with the fetched resource version. A conflict means
//! someone else wrote in between, so the loop starts over from a fresh read.

use cachepilot_id::ResourceKey;
use tracing::debug;

use crate::crd::{CacheRuntime, CacheRuntimeStatus, FINALIZER};
use crate::store::{RuntimeStore, StoreError};

/// Maximum re-read-and-retry rounds after a conflicting write.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Apply `mutate` to the latest status and write it back.
///
/// Skips the write when nothing changed. Returns the stored object.
pub async fn update_status<F>(
    store: &dyn RuntimeStore,
    key: &ResourceKey,
    mut mutate: F,
) -> Result<CacheRuntime, StoreError>
where
    F: FnMut(&mut CacheRuntimeStatus),
{
    let mut attempt = 0;
    loop {
        let mut runtime = store.get(key).await?;
        let mut status = runtime.status_or_default();
        mutate(&mut status);

        if runtime.status.as_ref() == Some(&status) {
            return Ok(runtime);
        }
        runtime.status = Some(status);

        match store.replace_status(&runtime).await {
            Err(StoreError::Conflict(_)) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(key = %key, attempt, "status write conflicted, retrying with fresh read");
            }
            result => return result,
        }
    }
}

/// Ensure the teardown finalizer is present.
pub async fn add_finalizer(
    store: &dyn RuntimeStore,
    key: &ResourceKey,
) -> Result<CacheRuntime, StoreError> {
    update_finalizers(store, key, |finalizers| {
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
        }
    })
    .await
}

/// Remove the teardown finalizer. A runtime that is already gone counts as done.
pub async fn remove_finalizer(store: &dyn RuntimeStore, key: &ResourceKey) -> Result<(), StoreError> {
    match update_finalizers(store, key, |finalizers| finalizers.retain(|f| f != FINALIZER)).await {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn update_finalizers<F>(
    store: &dyn RuntimeStore,
    key: &ResourceKey,
    mut mutate: F,
) -> Result<CacheRuntime, StoreError>
where
    F: FnMut(&mut Vec<String>),
{
    let mut attempt = 0;
    loop {
        let mut runtime = store.get(key).await?;
        let mut finalizers = runtime.metadata.finalizers.clone().unwrap_or_default();
        mutate(&mut finalizers);

        if runtime.metadata.finalizers.as_deref().unwrap_or_default() == finalizers.as_slice() {
            return Ok(runtime);
        }
        runtime.metadata.finalizers = Some(finalizers);

        match store.replace_finalizers(&runtime).await {
            Err(StoreError::Conflict(_)) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!(key = %key, attempt, "finalizer write conflicted, retrying with fresh read");
            }
            result => return result,
        }
    }
}
