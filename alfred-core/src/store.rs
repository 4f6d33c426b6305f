//! The state document store.
//!
//! Owns the document, answers role-projected reads, fans updates out to
//! subscribers, and keeps the backing file current through a coalescing
//! saver: a save is never scheduled sooner than `MinSaveInterval` after the
//! previous one, so bursts of mutations collapse into at most the armed save
//! plus one follow-up.
//!
//! The single mutex covers only in-memory work; subscriber callbacks and the
//! initial subscription delivery always run with the lock released. Deferred
//! save callbacks capture the store generation and no-op when a
//! demobilize/mobilize cycle has happened in between.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::Configuration;
use crate::error::StoreError;
use crate::policy::{self, RoleSet};
use crate::schedule::{ScheduleToken, Scheduler};
use crate::time::Clock;

type UpdateCallback = Arc<dyn Fn(Value) + Send + Sync>;

struct Subscriber {
    path: Vec<String>,
    held: RoleSet,
    deliver: UpdateCallback,
}

#[derive(Default)]
struct State {
    document: Value,
    file_path: PathBuf,
    mobilized: bool,
    generation: u64,
    dirty: bool,
    saving: bool,
    min_save_interval: f64,
    next_save_time: f64,
    save_token: Option<ScheduleToken>,
    next_subscription: u64,
    subscribers: HashMap<u64, Subscriber>,
    saves_completed: u64,
}

struct Shared {
    state: Mutex<State>,
    scheduler: Scheduler,
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Completed writes of the backing file.
    pub saves_completed: u64,
    /// Live subscriptions.
    pub subscriptions: usize,
}

/// Cancels a subscription created by [`Store::subscribe`].
pub struct SubscriptionHandle {
    shared: Weak<Shared>,
    token: u64,
}

impl SubscriptionHandle {
    /// Erases the subscription; later mutations no longer reach its
    /// callback. Safe to call after the store is gone.
    pub fn cancel(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().subscribers.remove(&self.token);
        }
    }
}

/// The hierarchical state document with role-projected access and coalesced
/// persistence.
#[derive(Default)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            scheduler: Scheduler::new(),
        }
    }
}

impl Store {
    /// Creates an un-mobilized store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the document from `file_path`, binds the clock, and marks the
    /// store mobilized. Idempotent: a mobilized store returns `Ok` without
    /// reloading.
    pub fn mobilize(&self, file_path: &Path, clock: Arc<dyn Clock>) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        if state.mobilized {
            return Ok(());
        }
        let encoded = fs::read_to_string(file_path).map_err(|source| StoreError::Unreadable {
            path: file_path.to_owned(),
            source,
        })?;
        let document: Value =
            serde_json::from_str(&encoded).map_err(|source| StoreError::Undecodable {
                path: file_path.to_owned(),
                source,
            })?;
        let configuration = Configuration::from_document(&document);
        state.document = document;
        state.file_path = file_path.to_owned();
        state.min_save_interval = configuration.min_save_interval;
        state.dirty = false;
        state.saving = false;
        state.next_save_time = 0.0;
        state.save_token = None;
        self.shared.scheduler.set_clock(Some(clock));
        state.mobilized = true;
        state.generation += 1;
        info!(path = %file_path.display(), "store loaded");
        Ok(())
    }

    /// Cancels any pending save, detaches the clock, and marks the store
    /// un-mobilized. Safe to call on an un-mobilized store.
    pub fn demobilize(&self) {
        let mut state = self.shared.state.lock();
        if !state.mobilized {
            return;
        }
        if state.saving {
            if let Some(token) = state.save_token.take() {
                self.shared.scheduler.cancel(token);
            }
            state.saving = false;
        }
        state.dirty = false;
        self.shared.scheduler.set_clock(None);
        state.mobilized = false;
    }

    /// Projects the subtree at `path` for a caller holding `held`.
    #[must_use]
    pub fn get(&self, path: &[&str], held: &RoleSet) -> Value {
        let state = self.shared.state.lock();
        policy::get(&state.document, path, held)
    }

    /// Registers an update subscription at `path` with the visibility of
    /// `held`. The initial projection is delivered synchronously before this
    /// returns, outside the store lock; later overlapping mutations deliver
    /// fresh projections the same way.
    pub fn subscribe<F>(&self, path: Vec<String>, held: RoleSet, deliver: F) -> SubscriptionHandle
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let deliver: UpdateCallback = Arc::new(deliver);
        let (token, initial) = {
            let mut state = self.shared.state.lock();
            let token = state.next_subscription;
            state.next_subscription += 1;
            let initial = policy::get(&state.document, &as_keys(&path), &held);
            state.subscribers.insert(
                token,
                Subscriber {
                    path,
                    held,
                    deliver: Arc::clone(&deliver),
                },
            );
            (token, initial)
        };
        deliver(initial);
        SubscriptionHandle {
            shared: Arc::downgrade(&self.shared),
            token,
        }
    }

    /// Replaces the value at `path`, enforcing `write_data` /
    /// `create_data`. Writing through a policy wrapper replaces its `data`
    /// child and preserves the descriptor. Arms the coalesced saver and
    /// re-projects overlapping subscriptions.
    ///
    /// Not exposed over the public network APIs in this revision.
    pub fn set(&self, path: &[&str], held: &RoleSet, value: Value) -> Result<(), StoreError> {
        let deliveries = {
            let mut state = self.shared.state.lock();
            if !state.mobilized {
                return Err(StoreError::NotMobilized);
            }
            policy::check_write(&state.document, path, held)?;
            apply_set(&mut state.document, path, value)?;
            Shared::schedule_save(&self.shared, &mut state);
            state
                .subscribers
                .values()
                .filter(|subscriber| paths_overlap(&subscriber.path, path))
                .map(|subscriber| {
                    let view =
                        policy::get(&state.document, &as_keys(&subscriber.path), &subscriber.held);
                    (Arc::clone(&subscriber.deliver), view)
                })
                .collect::<Vec<_>>()
        };
        for (deliver, view) in deliveries {
            deliver(view);
        }
        Ok(())
    }

    /// Snapshot of the store's counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let state = self.shared.state.lock();
        StoreStats {
            saves_completed: state.saves_completed,
            subscriptions: state.subscribers.len(),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.demobilize();
    }
}

impl Shared {
    /// Arms the coalesced saver. Must be called with `state` locked.
    fn schedule_save(shared: &Arc<Self>, state: &mut State) {
        if state.saving {
            state.dirty = true;
            return;
        }
        let Some(now) = shared.scheduler.now() else {
            return;
        };
        state.saving = true;
        state.dirty = false;
        if state.next_save_time < now {
            state.next_save_time = now;
        }
        let due = state.next_save_time;
        let generation = state.generation;
        let weak = Arc::downgrade(shared);
        state.save_token = shared.scheduler.schedule(due, move || {
            if let Some(shared) = weak.upgrade() {
                Shared::on_save_due(&shared, generation);
            }
        });
        // Successive saves stay at least one interval apart, even under
        // bursty writes.
        state.next_save_time = due + state.min_save_interval;
    }

    fn on_save_due(shared: &Arc<Self>, generation: u64) {
        let mut state = shared.state.lock();
        if !state.mobilized || state.generation != generation {
            return;
        }
        state.save_token = None;
        match write_document(&state.file_path, &state.document) {
            Ok(()) => {
                state.saves_completed += 1;
                debug!(path = %state.file_path.display(), "store saved");
            }
            Err(save_error) => {
                error!(
                    path = %state.file_path.display(),
                    error = %save_error,
                    "unable to save store"
                );
            }
        }
        state.saving = false;
        if state.dirty {
            Shared::schedule_save(shared, &mut state);
        }
    }
}

/// Serializes the document pretty-printed to a sibling temporary file, then
/// renames it over the backing file so a crash mid-write cannot truncate it.
fn write_document(path: &Path, document: &Value) -> io::Result<()> {
    let encoded = serde_json::to_string_pretty(document).map_err(io::Error::other)?;
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, encoded)?;
    fs::rename(&staging, path)
}

fn apply_set(document: &mut Value, path: &[&str], value: Value) -> Result<(), StoreError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(StoreError::InvalidPath(
            "the document root is not writable".into(),
        ));
    };
    let mut node = &mut *document;
    for key in parents {
        node = unwrap_mut(node);
        node = node
            .as_object_mut()
            .and_then(|entries| entries.get_mut(*key))
            .ok_or_else(|| StoreError::InvalidPath(format!("no node at {}", parents.join("/"))))?;
    }
    node = unwrap_mut(node);
    let Some(entries) = node.as_object_mut() else {
        return Err(StoreError::InvalidPath(format!(
            "parent of {} is not an object",
            path.join("/")
        )));
    };
    match entries.get_mut(*last) {
        Some(existing) if is_wrapper(existing) => {
            if let Some(slot) = existing
                .as_object_mut()
                .and_then(|wrapper| wrapper.get_mut("data"))
            {
                *slot = value;
            }
        }
        Some(existing) => *existing = value,
        None => {
            entries.insert((*last).to_owned(), value);
        }
    }
    Ok(())
}

fn is_wrapper(node: &Value) -> bool {
    node.as_object().is_some_and(|entries| entries.contains_key("data"))
}

/// Steps a mutable reference through any wrapper layers to the logical node.
fn unwrap_mut(mut node: &mut Value) -> &mut Value {
    loop {
        if !is_wrapper(node) {
            return node;
        }
        node = node
            .as_object_mut()
            .and_then(|entries| entries.get_mut("data"))
            .expect("is_wrapper confirmed the \"data\" key exists");
    }
}

fn paths_overlap(subscribed: &[String], mutated: &[&str]) -> bool {
    subscribed
        .iter()
        .zip(mutated.iter())
        .all(|(lhs, rhs)| lhs == rhs)
}

fn as_keys(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex as TestMutex;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::policy::roles;
    use crate::time::ManualClock;

    fn store_file(contents: &Value) -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("Alfred.json");
        fs::write(&path, serde_json::to_string_pretty(contents).unwrap()).unwrap();
        (dir, path)
    }

    fn mobilized(contents: &Value) -> (Store, Arc<ManualClock>, TempDir, PathBuf) {
        let (dir, path) = store_file(contents);
        let clock = Arc::new(ManualClock::new(0.0));
        let store = Store::new();
        store.mobilize(&path, clock.clone()).expect("mobilize");
        (store, clock, dir, path)
    }

    fn document_on_disk(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn mobilize_reads_save_interval_and_is_idempotent() {
        let (store, clock, _dir, path) = mobilized(&json!({
            "Configuration": {"MinSaveInterval": 10},
            "Counter": 0
        }));
        {
            let state = store.shared.state.lock();
            assert!((state.min_save_interval - 10.0).abs() < f64::EPSILON);
            assert_eq!(state.generation, 1);
        }
        store.mobilize(&path, clock).expect("idempotent mobilize");
        assert_eq!(store.shared.state.lock().generation, 1);
    }

    #[test]
    fn mobilize_rejects_missing_and_malformed_files() {
        let store = Store::new();
        let clock = Arc::new(ManualClock::new(0.0));
        let missing = store.mobilize(Path::new("/nonexistent/Alfred.json"), clock.clone());
        assert!(matches!(missing, Err(StoreError::Unreadable { .. })));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Alfred.json");
        fs::write(&path, "not json").unwrap();
        let garbled = store.mobilize(&path, clock);
        assert!(matches!(garbled, Err(StoreError::Undecodable { .. })));
    }

    #[test]
    fn get_projects_through_roles() {
        let (store, _clock, _dir, _path) = mobilized(&json!({
            "Public": "hello",
            "Secret": {
                "meta": {"require": {"read_data": ["admin"]}},
                "data": 42
            }
        }));
        assert_eq!(
            store.get(&[], &roles::public()),
            json!({"Public": "hello"})
        );
        assert_eq!(store.get(&["Secret"], &roles::admin()), json!(42));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_mutations_coalesces_saves() {
        let (store, clock, _dir, path) = mobilized(&json!({
            "Configuration": {"MinSaveInterval": 60},
            "Counter": 0
        }));
        for step in 0u64..10 {
            clock.set(step as f64);
            store
                .set(&["Counter"], &roles::admin(), json!(step))
                .expect("mutation");
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // First mutation saved immediately; the rest are still pending.
        assert_eq!(store.stats().saves_completed, 1);

        tokio::time::advance(Duration::from_secs(51)).await;
        assert_eq!(store.stats().saves_completed, 2);
        assert_eq!(document_on_disk(&path)["Counter"], json!(9));
    }

    #[tokio::test(start_paused = true)]
    async fn demobilize_cancels_pending_save() {
        let (store, clock, _dir, path) = mobilized(&json!({
            "Configuration": {"MinSaveInterval": 60},
            "Counter": 0
        }));
        store
            .set(&["Counter"], &roles::admin(), json!(1))
            .expect("mutation");
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.stats().saves_completed, 1);

        clock.set(1.0);
        store
            .set(&["Counter"], &roles::admin(), json!(2))
            .expect("mutation");
        store.demobilize();
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(store.stats().saves_completed, 1);
        assert_eq!(document_on_disk(&path)["Counter"], json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_callbacks_are_no_ops() {
        let (store, _clock, _dir, path) = mobilized(&json!({"Counter": 0}));
        let generation = store.shared.state.lock().generation;
        Shared::on_save_due(&store.shared, generation.wrapping_sub(1));
        assert_eq!(store.stats().saves_completed, 0);

        Shared::on_save_due(&store.shared, generation);
        assert_eq!(store.stats().saves_completed, 1);
        assert_eq!(document_on_disk(&path)["Counter"], json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn save_leaves_no_staging_file_behind() {
        let (store, _clock, dir, path) = mobilized(&json!({"Counter": 0}));
        store
            .set(&["Counter"], &roles::admin(), json!(7))
            .expect("mutation");
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.stats().saves_completed, 1);
        assert_eq!(document_on_disk(&path)["Counter"], json!(7));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty(), "staging file left behind");
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_deliver_initial_and_updates() {
        let (store, _clock, _dir, _path) = mobilized(&json!({"Counter": 0}));
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = store.subscribe(vec!["Counter".into()], roles::public(), move |view| {
            sink.lock().push(view);
        });
        assert_eq!(*seen.lock(), vec![json!(0)]);
        assert_eq!(store.stats().subscriptions, 1);

        store
            .set(&["Counter"], &roles::admin(), json!(5))
            .expect("mutation");
        assert_eq!(*seen.lock(), vec![json!(0), json!(5)]);

        handle.cancel();
        assert_eq!(store.stats().subscriptions, 0);
        store
            .set(&["Counter"], &roles::admin(), json!(6))
            .expect("mutation");
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_updates_respect_visibility() {
        let (store, _clock, _dir, _path) = mobilized(&json!({
            "Secret": {
                "meta": {"require": {"read_data": ["admin"], "write_data": ["admin"]}},
                "data": 1
            }
        }));
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = store.subscribe(vec!["Secret".into()], roles::public(), move |view| {
            sink.lock().push(view);
        });
        store
            .set(&["Secret"], &roles::admin(), json!(2))
            .expect("mutation");
        assert_eq!(*seen.lock(), vec![Value::Null, Value::Null]);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_paths_fan_out_and_unrelated_do_not() {
        let (store, _clock, _dir, _path) = mobilized(&json!({
            "a": {"b": 1},
            "c": 2
        }));
        let root_seen = Arc::new(TestMutex::new(0usize));
        let other_seen = Arc::new(TestMutex::new(0usize));
        let root_sink = Arc::clone(&root_seen);
        let other_sink = Arc::clone(&other_seen);
        let _root = store.subscribe(Vec::new(), roles::public(), move |_| {
            *root_sink.lock() += 1;
        });
        let _other = store.subscribe(vec!["c".into()], roles::public(), move |_| {
            *other_sink.lock() += 1;
        });
        store
            .set(&["a", "b"], &roles::admin(), json!(9))
            .expect("mutation");
        assert_eq!(*root_seen.lock(), 2, "root subscription overlaps everything");
        assert_eq!(*other_seen.lock(), 1, "unrelated path got only the initial");
    }

    #[tokio::test(start_paused = true)]
    async fn set_enforces_write_roles() {
        let (store, _clock, _dir, _path) = mobilized(&json!({
            "Thing": {
                "meta": {"require": {"write_data": ["editor"]}},
                "data": "old"
            }
        }));
        let denied = store.set(&["Thing"], &roles::public(), json!("new"));
        assert!(matches!(denied, Err(StoreError::AccessDenied { .. })));

        store
            .set(&["Thing"], &roles::held(["editor"]), json!("new"))
            .expect("editor may write");
        // The descriptor survives the write.
        assert_eq!(store.get(&["Thing"], &roles::admin()), json!("new"));
        assert_eq!(
            store.get(&["Thing"], &roles::held(["editor"])),
            json!("new")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_requires_a_mobilized_store() {
        let store = Store::new();
        let refused = store.set(&["x"], &roles::admin(), json!(1));
        assert!(matches!(refused, Err(StoreError::NotMobilized)));
    }
}
