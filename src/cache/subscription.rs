use std::fmt;

use crate::key::QueryKey;

use super::store::CacheStore;
use super::traits::CacheData;

/// Keeps a listener registered on a key.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// removes the listener and decrements the entry's subscriber count; once it
/// reaches zero the entry starts its garbage-collection window.
pub struct Subscription<T: CacheData> {
  store: CacheStore<T>,
  key: QueryKey,
  id: u64,
  active: bool,
}

impl<T: CacheData> Subscription<T> {
  pub(crate) fn new(store: CacheStore<T>, key: QueryKey, id: u64) -> Self {
    Self {
      store,
      key,
      id,
      active: true,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if self.active {
      self.active = false;
      self.store.unsubscribe(&self.key, self.id);
    }
  }
}

impl<T: CacheData> Drop for Subscription<T> {
  fn drop(&mut self) {
    self.release();
  }
}

impl<T: CacheData> fmt::Debug for Subscription<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("active", &self.active)
      .finish()
  }
}
