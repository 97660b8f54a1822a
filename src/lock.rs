use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Critical sections in this crate never span an `.await`, so a poisoned lock
/// only means a listener-free section panicked midway; the state is still
/// structurally valid.
pub(crate) fn mutex_lock<'a, T>(
  lock: &'a Mutex<T>,
  target: &'static str,
  op: &'static str,
) -> MutexGuard<'a, T> {
  match lock.lock() {
    Ok(guard) => guard,
    Err(poisoned) => {
      warn!(
        op,
        target_module = target,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock"
      );
      poisoned.into_inner()
    }
  }
}
