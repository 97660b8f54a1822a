//! Background refetching driven by time, connectivity and visibility.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheData, CacheEntry, CacheStore};
use crate::key::QueryKey;
use crate::lock::mutex_lock;

const SOURCE: &str = "sync";

/// Environment changes reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
  Online,
  Offline,
  /// The application became visible
  Foreground,
  /// The application was hidden
  Background,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Period of the stale refetch sweep; `None` disables it
  pub interval: Option<StdDuration>,
  pub refetch_on_reconnect: bool,
  pub refetch_on_focus: bool,
  /// Minimum time hidden before coming back triggers a refetch
  pub idle_threshold: Duration,
  /// Prefixes refetched on every tick, reconnect and foreground transition
  /// regardless of staleness or subscribers
  pub critical_keys: Vec<QueryKey>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval: Some(StdDuration::from_secs(60)),
      refetch_on_reconnect: true,
      refetch_on_focus: true,
      idle_threshold: Duration::seconds(30),
      critical_keys: Vec::new(),
    }
  }
}

#[derive(Debug)]
struct SyncState {
  online: bool,
  hidden_since: Option<DateTime<Utc>>,
}

/// Decides which entries to refetch when the environment changes.
///
/// Every trigger goes through the store's de-duplicated refetch path, so a
/// key with a fetch already in flight never gets a second one.
pub struct SyncScheduler<T: CacheData> {
  store: CacheStore<T>,
  config: SyncConfig,
  state: Arc<Mutex<SyncState>>,
}

impl<T: CacheData> Clone for SyncScheduler<T> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      config: self.config.clone(),
      state: Arc::clone(&self.state),
    }
  }
}

impl<T: CacheData> SyncScheduler<T> {
  pub fn new(store: CacheStore<T>, config: SyncConfig) -> Self {
    Self {
      store,
      config,
      state: Arc::new(Mutex::new(SyncState {
        online: true,
        hidden_since: None,
      })),
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.config
  }

  pub fn is_online(&self) -> bool {
    mutex_lock(&self.state, SOURCE, "is_online").online
  }

  fn is_critical(&self, key: &QueryKey) -> bool {
    self.config.critical_keys.iter().any(|prefix| key.starts_with(prefix))
  }

  /// Refetch entries accepted by `wanted`, plus every critical entry.
  fn sweep<P>(&self, trigger: &'static str, wanted: P) -> Vec<QueryKey>
  where
    P: Fn(&CacheEntry<T>, DateTime<Utc>) -> bool,
  {
    let started = self
      .store
      .refetch_matching(|entry, now| self.is_critical(&entry.key) || wanted(entry, now));
    if !started.is_empty() {
      info!(trigger, started = started.len(), "background refetch");
    }
    started
  }

  /// Periodic tick: refetch stale subscribed entries and collect garbage.
  /// Skipped while offline.
  pub fn on_interval(&self) -> Vec<QueryKey> {
    if !self.is_online() {
      debug!("interval tick skipped: offline");
      return Vec::new();
    }
    let evicted = self.store.collect_garbage();
    if !evicted.is_empty() {
      debug!(evicted = evicted.len(), "idle entries evicted");
    }
    self.sweep("interval", |entry, now| {
      entry.subscriber_count > 0 && entry.is_stale(now)
    })
  }

  /// Connectivity change. Only an offline to online transition refetches:
  /// critical entries always, and every subscribed entry, stale or not, when
  /// reconnect refetching is enabled.
  pub fn on_network(&self, online: bool) -> Vec<QueryKey> {
    let reconnected = {
      let mut state = mutex_lock(&self.state, SOURCE, "on_network");
      let reconnected = online && !state.online;
      state.online = online;
      reconnected
    };
    debug!(online, reconnected, "network status changed");
    if !reconnected {
      return Vec::new();
    }
    let subscribed = self.config.refetch_on_reconnect;
    self.sweep("reconnect", |entry, _| subscribed && entry.subscriber_count > 0)
  }

  /// Visibility change. Returning to the foreground after at least the idle
  /// threshold refetches stale subscribed entries; critical entries are
  /// refetched on every return.
  pub fn on_visibility(&self, visible: bool) -> Vec<QueryKey> {
    let now = self.store.now();
    let (hidden_for, online) = {
      let mut state = mutex_lock(&self.state, SOURCE, "on_visibility");
      if !visible {
        state.hidden_since.get_or_insert(now);
        return Vec::new();
      }
      let Some(since) = state.hidden_since.take() else {
        return Vec::new();
      };
      (now - since, state.online)
    };
    if !online {
      return Vec::new();
    }

    let long_enough = self.config.refetch_on_focus && hidden_for >= self.config.idle_threshold;
    debug!(hidden_ms = hidden_for.num_milliseconds(), long_enough, "returned to foreground");
    self.sweep("foreground", |entry, now| {
      long_enough && entry.subscriber_count > 0 && entry.is_stale(now)
    })
  }

  pub fn handle(&self, signal: SyncSignal) -> Vec<QueryKey> {
    match signal {
      SyncSignal::Online => self.on_network(true),
      SyncSignal::Offline => self.on_network(false),
      SyncSignal::Foreground => self.on_visibility(true),
      SyncSignal::Background => self.on_visibility(false),
    }
  }

  /// Run the scheduler until `shutdown` flips to true or every
  /// [`SyncHandle`] is dropped.
  pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> (SyncHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      let mut ticker = self.config.interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
      });
      debug!(interval = ?self.config.interval, "sync scheduler started");

      loop {
        if *shutdown.borrow() {
          break;
        }
        tokio::select! {
          _ = shutdown.changed() => break,
          signal = rx.recv() => match signal {
            Some(signal) => {
              self.handle(signal);
            }
            None => break,
          },
          _ = async {
            match ticker.as_mut() {
              Some(ticker) => {
                ticker.tick().await;
              }
              None => std::future::pending::<()>().await,
            }
          } => {
            self.on_interval();
          }
        }
      }
      debug!("sync scheduler stopped");
    });

    (SyncHandle { tx }, task)
  }
}

/// Sends environment changes to a running scheduler.
#[derive(Debug, Clone)]
pub struct SyncHandle {
  tx: mpsc::UnboundedSender<SyncSignal>,
}

impl SyncHandle {
  /// Returns false if the scheduler has stopped.
  pub fn send(&self, signal: SyncSignal) -> bool {
    self.tx.send(signal).is_ok()
  }

  pub fn set_online(&self, online: bool) -> bool {
    self.send(if online { SyncSignal::Online } else { SyncSignal::Offline })
  }

  pub fn set_visible(&self, visible: bool) -> bool {
    self.send(if visible { SyncSignal::Foreground } else { SyncSignal::Background })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{keyed_fetcher, SetDataOptions, StorePolicy, Subscription};
  use crate::clock::ManualClock;
  use crate::query_key;
  use chrono::TimeZone;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct Fixture {
    clock: ManualClock,
    store: CacheStore<String>,
    calls: Arc<AtomicU32>,
  }

  fn fixture() -> Fixture {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap());
    let store = CacheStore::with_clock(StorePolicy::default(), Arc::new(clock.clone()));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    store.register_family(
      QueryKey::root(),
      keyed_fetcher(move |key: QueryKey| {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(StdDuration::from_millis(5)).await;
          Ok(key.to_string())
        }
      }),
    );
    Fixture { clock, store, calls }
  }

  fn put(store: &CacheStore<String>, key: &QueryKey) {
    store.set_data(key, "cached".to_string(), SetDataOptions::default());
  }

  fn subscribe_to(store: &CacheStore<String>, key: &QueryKey) -> Subscription<String> {
    store.subscribe(key, |_| {})
  }

  #[tokio::test]
  async fn interval_refetches_stale_subscribed_only() {
    let f = fixture();
    let scheduler = SyncScheduler::new(f.store.clone(), SyncConfig::default());
    let watched = query_key!["position", "list", ""];
    let unwatched = query_key!["position", "detail", 1];
    let fresh = query_key!["interview", "list", ""];
    put(&f.store, &watched);
    put(&f.store, &unwatched);
    let _a = subscribe_to(&f.store, &watched);

    f.clock.advance(Duration::minutes(6));
    put(&f.store, &fresh);
    let _b = subscribe_to(&f.store, &fresh);

    assert_eq!(scheduler.on_interval(), vec![watched]);
  }

  #[tokio::test]
  async fn interval_is_skipped_offline() {
    let f = fixture();
    let scheduler = SyncScheduler::new(f.store.clone(), SyncConfig::default());
    let key = query_key!["position", "list", ""];
    put(&f.store, &key);
    let _s = subscribe_to(&f.store, &key);
    f.clock.advance(Duration::minutes(6));

    assert!(scheduler.on_network(false).is_empty());
    assert!(scheduler.on_interval().is_empty());
  }

  #[tokio::test]
  async fn reconnect_refetches_subscribed_regardless_of_staleness() {
    let f = fixture();
    let scheduler = SyncScheduler::new(f.store.clone(), SyncConfig::default());
    let fresh = query_key!["position", "detail", 1];
    let unwatched = query_key!["position", "detail", 2];
    put(&f.store, &fresh);
    put(&f.store, &unwatched);
    let _s = subscribe_to(&f.store, &fresh);

    // Already online: nothing happens
    assert!(scheduler.on_network(true).is_empty());

    scheduler.on_network(false);
    assert_eq!(scheduler.on_network(true), vec![fresh.clone()]);

    // A fetch is in flight; a second reconnect does not start another
    scheduler.on_network(false);
    assert!(scheduler.on_network(true).is_empty());
    f.store.wait(&fresh).await;
    assert_eq!(f.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn foreground_after_idle_threshold() {
    let f = fixture();
    let scheduler = SyncScheduler::new(f.store.clone(), SyncConfig::default());
    let key = query_key!["statistics", "overview"];
    put(&f.store, &key);
    let _s = subscribe_to(&f.store, &key);
    f.clock.advance(Duration::minutes(6));

    scheduler.on_visibility(false);
    f.clock.advance(Duration::seconds(10));
    assert!(scheduler.on_visibility(true).is_empty());

    scheduler.on_visibility(false);
    f.clock.advance(Duration::seconds(31));
    assert_eq!(scheduler.on_visibility(true), vec![key]);

    // Visible without having been hidden
    assert!(scheduler.on_visibility(true).is_empty());
  }

  #[tokio::test]
  async fn critical_keys_ignore_staleness_and_subscribers() {
    let f = fixture();
    let config = SyncConfig {
      critical_keys: vec![query_key!["auth"]],
      ..SyncConfig::default()
    };
    let scheduler = SyncScheduler::new(f.store.clone(), config);
    let me = query_key!["auth", "me"];
    let other = query_key!["position", "list", ""];
    put(&f.store, &me);
    put(&f.store, &other);

    assert_eq!(scheduler.on_interval(), vec![me.clone()]);
    f.store.wait(&me).await;

    scheduler.on_visibility(false);
    assert_eq!(scheduler.handle(SyncSignal::Foreground), vec![me.clone()]);
    f.store.wait(&me).await;

    scheduler.handle(SyncSignal::Offline);
    assert_eq!(scheduler.handle(SyncSignal::Online), vec![me]);
  }

  #[tokio::test]
  async fn critical_keys_refetch_with_triggers_disabled() {
    let f = fixture();
    let config = SyncConfig {
      refetch_on_reconnect: false,
      refetch_on_focus: false,
      critical_keys: vec![query_key!["schedule"]],
      ..SyncConfig::default()
    };
    let scheduler = SyncScheduler::new(f.store.clone(), config);
    let today = query_key!["schedule", "today"];
    let list = query_key!["position", "list", ""];
    put(&f.store, &today);
    put(&f.store, &list);
    let _watch = subscribe_to(&f.store, &list);

    scheduler.on_network(false);
    assert_eq!(scheduler.on_network(true), vec![today.clone()]);
    f.store.wait(&today).await;

    scheduler.on_visibility(false);
    assert_eq!(scheduler.on_visibility(true), vec![today.clone()]);
    f.store.wait(&today).await;
    assert_eq!(f.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn spawned_scheduler_reacts_to_signals() {
    let f = fixture();
    let config = SyncConfig {
      interval: None,
      ..SyncConfig::default()
    };
    let key = query_key!["position", "list", ""];
    put(&f.store, &key);
    let _s = subscribe_to(&f.store, &key);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = SyncScheduler::new(f.store.clone(), config).spawn(shutdown_rx);

    assert!(handle.set_online(false));
    assert!(handle.set_online(true));
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    assert_eq!(f.calls.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert!(!handle.set_online(false));
  }
}
