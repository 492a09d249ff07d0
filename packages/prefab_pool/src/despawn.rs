use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Returnable;

/// Returns `instance` to `pool` once `delay` has passed.
///
/// If `cancel` is cancelled first, nothing is returned to the pool and the instance is handed
/// back to the caller instead. Otherwise the result is `None`.
///
/// The delay is measured with the Tokio timer, so this must run inside a Tokio runtime with
/// the time driver enabled.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use prefab_pool::{despawn_after, Returnable};
/// # use tokio_util::sync::CancellationToken;
/// # async fn example(pool: &impl Returnable<Arc<String>>, bullet: Arc<String>) {
/// let cancel = CancellationToken::new();
///
/// // The bullet disappears after two seconds unless something else claims it first.
/// let unreturned = despawn_after(pool, bullet, Duration::from_secs(2), &cancel).await;
/// assert!(unreturned.is_none());
/// # }
/// ```
pub async fn despawn_after<T, R>(
    pool: &R,
    instance: T,
    delay: Duration,
    cancel: &CancellationToken,
) -> Option<T>
where
    R: Returnable<T> + ?Sized,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            trace!(?delay, "scheduled despawn was cancelled");
            Some(instance)
        }
        () = time::sleep(delay) => {
            pool.return_to_pool(instance);
            None
        }
    }
}
