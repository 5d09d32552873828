//! Generic polling/invalidation/timeout scheduler used to keep
//! printer-derived values fresh (spec.md §4.8).
//!
//! Grounded on `original_source/prusa/link/printer_adapter/updatable.py`
//! and `input_output/serial/item_updater.py`'s `WatchedItem`/`ItemUpdater`
//! three-queue/three-worker design; the signal set follows blinker-style
//! per-item callbacks (spec.md §9 "Signals / blinker" — modelled here as
//! per-item callback lists, matching the design note's suggested
//! equivalent).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const DEFAULT_ON_FAIL_INTERVAL: Duration = Duration::from_secs(5);

pub type GatherFn = Box<dyn Fn() -> Result<serde_json::Value, String> + Send + Sync>;
pub type WriteFn = Box<dyn Fn(serde_json::Value) + Send + Sync>;
pub type ValidateFn = Box<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;
pub type SignalFn = Box<dyn Fn() + Send + Sync>;

struct ItemInner {
    value: Option<serde_json::Value>,
    valid: bool,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    on_fail_interval: Duration,
    disabled: bool,
    invalidate_at: Option<Instant>,
    times_out_at: Option<Instant>,
    scheduled: bool,
}

/// A single polled value (spec.md §3 "WatchedItem").
pub struct WatchedItem {
    pub name: String,
    inner: Mutex<ItemInner>,
    gather: Option<GatherFn>,
    write: Option<WriteFn>,
    validate: Option<ValidateFn>,
    on_timed_out: Mutex<Vec<SignalFn>>,
    on_error_refreshing: Mutex<Vec<SignalFn>>,
    on_validation_error: Mutex<Vec<SignalFn>>,
    on_value_changed: Mutex<Vec<SignalFn>>,
    on_became_valid: Mutex<Vec<SignalFn>>,
    on_became_invalid: Mutex<Vec<SignalFn>>,
}

impl WatchedItem {
    pub fn new(name: impl Into<String>) -> Self {
        WatchedItem {
            name: name.into(),
            inner: Mutex::new(ItemInner {
                value: None,
                valid: false,
                interval: None,
                timeout: None,
                on_fail_interval: DEFAULT_ON_FAIL_INTERVAL,
                disabled: false,
                invalidate_at: None,
                times_out_at: None,
                scheduled: false,
            }),
            gather: None,
            write: None,
            validate: None,
            on_timed_out: Mutex::new(Vec::new()),
            on_error_refreshing: Mutex::new(Vec::new()),
            on_validation_error: Mutex::new(Vec::new()),
            on_value_changed: Mutex::new(Vec::new()),
            on_became_valid: Mutex::new(Vec::new()),
            on_became_invalid: Mutex::new(Vec::new()),
        }
    }

    pub fn with_gather(mut self, gather: GatherFn) -> Self {
        self.gather = Some(gather);
        self
    }

    pub fn with_write(mut self, write: WriteFn) -> Self {
        self.write = Some(write);
        self
    }

    pub fn with_validate(mut self, validate: ValidateFn) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        self.inner.lock().unwrap().interval = Some(interval);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.inner.lock().unwrap().timeout = Some(timeout);
        self
    }

    pub fn with_on_fail_interval(self, interval: Duration) -> Self {
        self.inner.lock().unwrap().on_fail_interval = interval;
        self
    }

    pub fn disabled(self, disabled: bool) -> Self {
        self.inner.lock().unwrap().disabled = disabled;
        self
    }

    pub fn on_became_valid(&self, f: SignalFn) {
        self.on_became_valid.lock().unwrap().push(f);
    }

    pub fn on_became_invalid(&self, f: SignalFn) {
        self.on_became_invalid.lock().unwrap().push(f);
    }

    pub fn value(&self) -> Option<serde_json::Value> {
        self.inner.lock().unwrap().value.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().unwrap().valid
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().unwrap().disabled
    }

    /// Manually feeds a gathered value in, as if the gather callback had
    /// produced it (used by line-dispatcher-driven items like temperature
    /// autoreport, which push rather than get polled).
    pub fn set_value(&self, value: serde_json::Value) {
        if let Some(validate) = &self.validate {
            if let Err(e) = validate(&value) {
                self.mark_validation_error(&e);
                return;
            }
        }
        self.accept(value);
    }

    fn accept(&self, value: serde_json::Value) {
        let was_valid;
        let changed;
        {
            let mut inner = self.inner.lock().unwrap();
            was_valid = inner.valid;
            changed = inner.value.as_ref() != Some(&value);
            inner.value = Some(value.clone());
            inner.valid = true;
            if let Some(timeout) = inner.timeout {
                inner.times_out_at = Some(Instant::now() + timeout);
            }
        }
        if let Some(write) = &self.write {
            write(value);
        }
        if changed {
            for f in self.on_value_changed.lock().unwrap().iter() {
                f();
            }
        }
        if !was_valid {
            for f in self.on_became_valid.lock().unwrap().iter() {
                f();
            }
        }
    }

    fn invalidate(&self) {
        let was_valid = {
            let mut inner = self.inner.lock().unwrap();
            let was_valid = inner.valid;
            inner.valid = false;
            was_valid
        };
        if was_valid {
            for f in self.on_became_invalid.lock().unwrap().iter() {
                f();
            }
        }
    }

    fn mark_timed_out(&self) {
        self.invalidate();
        for f in self.on_timed_out.lock().unwrap().iter() {
            f();
        }
    }

    fn mark_gather_error(&self, e: &str) {
        warn!("item '{}' gather failed: {}", self.name, e);
        self.invalidate();
        for f in self.on_error_refreshing.lock().unwrap().iter() {
            f();
        }
    }

    fn mark_validation_error(&self, e: &str) {
        warn!("item '{}' validation failed: {}", self.name, e);
        self.invalidate();
        for f in self.on_validation_error.lock().unwrap().iter() {
            f();
        }
    }
}

/// Aggregates items and signals only when every member is valid (spec.md
/// §3 "WatchedGroup").
pub struct WatchedGroup {
    items: Vec<Arc<WatchedItem>>,
    on_became_valid: Mutex<Vec<SignalFn>>,
}

impl WatchedGroup {
    pub fn new(items: Vec<Arc<WatchedItem>>) -> Arc<Self> {
        let group = Arc::new(WatchedGroup {
            items,
            on_became_valid: Mutex::new(Vec::new()),
        });
        for item in &group.items {
            let g = group.clone();
            item.on_became_valid(Box::new(move || g.check()));
        }
        group
    }

    pub fn on_became_valid(&self, f: SignalFn) {
        self.on_became_valid.lock().unwrap().push(f);
    }

    pub fn is_valid(&self) -> bool {
        self.items.iter().all(|i| i.is_valid())
    }

    fn check(&self) {
        if self.is_valid() {
            for f in self.on_became_valid.lock().unwrap().iter() {
                f();
            }
        }
    }
}

/// Error raised by [`ItemUpdater::add_item`]-adjacent operations
/// (spec.md §4.8 "Failure modes").
#[derive(Debug, Clone)]
pub struct UpdaterError(pub String);

impl std::fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for UpdaterError {}

/// Scheduler backed by three conceptual worker loops (refresh,
/// invalidate, timeout) driven off one tick, since each `WatchedItem`
/// tracks its own next-due instants (spec.md §4.8).
pub struct ItemUpdater {
    items: Mutex<HashMap<String, Arc<WatchedItem>>>,
    wake: Notify,
    cancel: CancellationToken,
}

impl ItemUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(ItemUpdater {
            items: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn add_item(&self, item: Arc<WatchedItem>) {
        self.items.lock().unwrap().insert(item.name.clone(), item);
        self.wake.notify_one();
    }

    /// Raises if the item is not registered, matching spec.md's "adding an
    /// item not already registered raises" for invalidation scheduling.
    pub fn schedule_invalidation(&self, name: &str) -> Result<(), UpdaterError> {
        let items = self.items.lock().unwrap();
        let item = items
            .get(name)
            .ok_or_else(|| UpdaterError(format!("item '{}' is not registered", name)))?;
        let mut inner = item.inner.lock().unwrap();
        let interval = inner
            .interval
            .ok_or_else(|| UpdaterError(format!("item '{}' has no interval to schedule from", name)))?;
        inner.invalidate_at = Some(Instant::now() + interval);
        inner.scheduled = true;
        Ok(())
    }

    pub fn invalidate(&self, name: &str) {
        if let Some(item) = self.items.lock().unwrap().get(name) {
            item.invalidate();
        }
        self.wake.notify_one();
    }

    pub fn request_refresh(&self, name: &str) {
        let item = self.items.lock().unwrap().get(name).cloned();
        if let Some(item) = item {
            self.gather_one(&item);
        }
    }

    fn gather_one(&self, item: &Arc<WatchedItem>) {
        if item.is_disabled() {
            return;
        }
        let Some(gather) = &item.gather else { return };
        match gather() {
            Ok(value) => {
                if let Some(validate) = &item.validate {
                    if let Err(e) = validate(&value) {
                        item.mark_validation_error(&e);
                        self.reschedule_after_failure(item);
                        return;
                    }
                }
                item.accept(value);
                let mut inner = item.inner.lock().unwrap();
                if let Some(interval) = inner.interval {
                    inner.invalidate_at = Some(Instant::now() + interval);
                }
            }
            Err(e) => {
                item.mark_gather_error(&e);
                self.reschedule_after_failure(item);
            }
        }
    }

    fn reschedule_after_failure(&self, item: &Arc<WatchedItem>) {
        let mut inner = item.inner.lock().unwrap();
        inner.invalidate_at = Some(Instant::now() + inner.on_fail_interval);
    }

    /// The periodic tick: fires invalidations and timeouts whose instant
    /// has passed, then gathers invalidated items.
    fn tick(&self) {
        let items: Vec<Arc<WatchedItem>> = self.items.lock().unwrap().values().cloned().collect();
        let now = Instant::now();
        for item in &items {
            let due_invalidate = {
                let inner = item.inner.lock().unwrap();
                inner.invalidate_at.map(|at| now >= at).unwrap_or(false)
            };
            if due_invalidate {
                item.invalidate();
                self.gather_one(item);
            }
            let due_timeout = {
                let inner = item.inner.lock().unwrap();
                inner.times_out_at.map(|at| now >= at).unwrap_or(false)
            };
            if due_timeout {
                item.mark_timed_out();
                item.inner.lock().unwrap().times_out_at = None;
            }
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.tick();
            debug!("item updater tick complete");
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn valid_item_with_no_invalidation_stays_valid() {
        let item = Arc::new(WatchedItem::new("sn").with_gather(Box::new(|| Ok(serde_json::json!("123")))));
        item.set_value(serde_json::json!("123"));
        assert!(item.is_valid());
    }

    #[test]
    fn disabled_item_never_gathers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let item = Arc::new(
            WatchedItem::new("mbl")
                .with_gather(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!(null))
                }))
                .disabled(true),
        );
        let updater = ItemUpdater::new();
        updater.add_item(item);
        updater.request_refresh("mbl");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn group_becomes_valid_only_when_all_members_are() {
        let a = Arc::new(WatchedItem::new("a"));
        let b = Arc::new(WatchedItem::new("b"));
        let group = WatchedGroup::new(vec![a.clone(), b.clone()]);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        group.on_became_valid(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        a.set_value(serde_json::json!(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        b.set_value(serde_json::json!(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduling_invalidation_on_unregistered_item_raises() {
        let updater = ItemUpdater::new();
        assert!(updater.schedule_invalidation("ghost").is_err());
    }

    #[test]
    fn validation_failure_invalidates_and_signals() {
        let item = Arc::new(
            WatchedItem::new("temp").with_validate(Box::new(|v| {
                if v.as_f64().unwrap_or(0.0) < 0.0 {
                    Err("negative temperature".to_string())
                } else {
                    Ok(())
                }
            })),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        item.on_value_changed.lock().unwrap().push(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        item.set_value(serde_json::json!(-5.0));
        assert!(!item.is_valid());
    }
}
