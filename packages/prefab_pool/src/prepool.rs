use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::create;
use crate::{Provider, Result};

/// A pool that instances can be handed back to.
///
/// Implemented by [`KindPool`] and [`GlobalPool`], so helpers such as [`prepool()`] and
/// [`despawn_after()`] work with either.
///
/// [`KindPool`]: crate::KindPool
/// [`GlobalPool`]: crate::GlobalPool
/// [`despawn_after()`]: crate::despawn_after
pub trait Returnable<T> {
    /// Hands `instance` back to the pool.
    fn return_to_pool(&self, instance: T);
}

/// Creates `provider.prepool_count()` instances and returns each one to `pool`.
///
/// The instances are placed at the provider's placement or, when it has none, at
/// `default_placement`. Instances created before a failure or cancellation stay in the pool.
///
/// # Errors
///
/// [`Error::Cancelled`] on cancellation, or whatever the provider fails with.
///
/// [`Error::Cancelled`]: crate::Error::Cancelled
pub async fn prepool<P, R>(
    provider: &P,
    pool: &R,
    default_placement: Option<P::Placement>,
    cancel: &CancellationToken,
) -> Result<()>
where
    P: Provider,
    R: Returnable<P::Instance>,
{
    let count = provider.prepool_count();

    if count == 0 {
        return Ok(());
    }

    let placement = provider.placement().cloned().or(default_placement);

    for created in 0..count {
        let instance = match create(provider, placement.as_ref(), cancel).await {
            Ok(instance) => instance,
            Err(error) => {
                debug!(created, count, %error, "prepooling stopped early");
                return Err(error);
            }
        };

        pool.return_to_pool(instance);
    }

    Ok(())
}
