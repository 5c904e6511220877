//! Authoritative state for every `(application, environment)` pair.
//!
//! Each key has its own lock. A mutation is evaluated against a copy of the
//! current entry, the result is persisted to the discovery directory, and only
//! then is it stored; a failed write leaves the previous entry in place, so the
//! registry and the files agree whenever the lock is released.

use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::Error;
use crate::payload::{valid_label_text, validate_label, validate_target, Payload};
use crate::sd::{DiscoveryDir, TargetGroup, WriteError};

const JOB_LABEL: &str = "job";
const ENV_LABEL: &str = "env";

fn is_reserved(label_name: &str) -> bool {
    label_name == JOB_LABEL || label_name == ENV_LABEL
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    application: String,
    environment: String,
}

impl Key {
    pub fn new(application: &str, environment: &str) -> Result<Self, Error> {
        for (what, value) in [("application", application), ("environment", environment)] {
            if !valid_label_text(value) {
                return Err(Error::validation(format!("invalid {} {:?}", what, value)));
            }
        }

        Ok(Self::unchecked(application, environment))
    }

    /// Builds a key without checking either part.
    pub fn unchecked(application: &str, environment: &str) -> Self {
        Key {
            application: application.to_string(),
            environment: environment.to_string(),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.environment)
    }
}

/// Targets and labels registered for one key.
///
/// `labels` always holds `job` and `env`, whether defaulted or overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    targets: IndexSet<String>,
    labels: BTreeMap<String, String>,
}

impl Entry {
    /// What an unregistered pair looks like: no targets, default labels only.
    pub fn vacant(key: &Key) -> Self {
        Entry {
            targets: IndexSet::new(),
            labels: BTreeMap::from([
                (JOB_LABEL.to_string(), key.application().to_string()),
                (ENV_LABEL.to_string(), key.environment().to_string()),
            ]),
        }
    }

    pub fn to_group(&self) -> TargetGroup {
        TargetGroup {
            targets: self.targets.iter().cloned().collect(),
            labels: self.labels.clone(),
        }
    }

    /// Any label beyond the defaults of `key`, including an overridden
    /// `job` or `env` value.
    fn has_custom_labels(&self, key: &Key) -> bool {
        self.labels.iter().any(|(name, value)| match name.as_str() {
            JOB_LABEL => value != key.application(),
            ENV_LABEL => value != key.environment(),
            _ => true,
        })
    }

    /// Nothing left worth keeping: the key goes back to being absent.
    fn is_vacant(&self, key: &Key) -> bool {
        self.targets.is_empty() && !self.has_custom_labels(key)
    }

    fn from_group(key: &Key, group: TargetGroup) -> Result<Self, Error> {
        let mut entry = Self::vacant(key);

        for target in group.targets {
            validate_target(&target)?;
            entry.targets.insert(target);
        }

        for (name, value) in group.labels {
            validate_label(&name, &value)?;
            entry.labels.insert(name, value);
        }

        Ok(entry)
    }

    fn replaced(key: &Key, payload: &Payload) -> Self {
        let mut entry = Self::vacant(key);

        if let Some(targets) = &payload.targets {
            entry.targets = targets.clone();
        }

        if let Some(labels) = &payload.labels {
            entry.labels.extend(labels.clone());
        }

        entry
    }

    fn merged(&self, payload: &Payload) -> Result<Self, Error> {
        let mut next = self.clone();

        if let Some(targets) = &payload.targets {
            let existing = targets
                .iter()
                .filter(|target| self.targets.contains(*target))
                .map(String::as_str)
                .collect::<Vec<_>>();

            if !existing.is_empty() {
                return Err(Error::Conflict(format!(
                    "targets already registered: {}",
                    existing.join(", ")
                )));
            }

            next.targets.extend(targets.iter().cloned());
        }

        if let Some(labels) = &payload.labels {
            let unchanged = labels
                .iter()
                .all(|(name, value)| self.labels.get(name) == Some(value));

            if unchanged {
                return Err(Error::Conflict("labels are already set to these values".into()));
            }

            next.labels.extend(labels.clone());
        }

        Ok(next)
    }

    fn without(&self, key: &Key, payload: &Payload) -> Result<Self, Error> {
        let mut next = self.clone();

        if let Some(labels) = &payload.labels {
            if labels.keys().any(|name| is_reserved(name)) {
                return Err(Error::validation(
                    "the job and env labels can only be removed by deleting everything",
                ));
            }

            let missing = labels
                .iter()
                .filter(|(name, value)| self.labels.get(*name) != Some(*value))
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>();

            if !missing.is_empty() {
                return Err(Error::NotFound(format!(
                    "labels not registered: {}",
                    missing.join(", ")
                )));
            }

            for name in labels.keys() {
                next.labels.remove(name);
            }
        }

        if let Some(targets) = &payload.targets {
            let missing = targets
                .iter()
                .filter(|target| !self.targets.contains(*target))
                .map(String::as_str)
                .collect::<Vec<_>>();

            if !missing.is_empty() {
                return Err(Error::NotFound(format!(
                    "targets not registered: {}",
                    missing.join(", ")
                )));
            }

            next.targets.retain(|target| !targets.contains(target));

            if next.targets.is_empty() && next.has_custom_labels(key) {
                return Err(Error::Integrity(
                    "cannot delete all targets without also deleting all labels".into(),
                ));
            }
        }

        Ok(next)
    }
}

#[derive(Debug)]
enum Mutation {
    Replace(Payload),
    Merge(Payload),
    Remove(Payload),
}

/// Result of evaluating a mutation: the entry to respond with, and whether
/// it is kept or the key becomes absent.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Store(Entry),
    Drop(Entry),
}

impl Mutation {
    fn evaluate(&self, key: &Key, current: Option<&Entry>) -> Result<Outcome, Error> {
        match self {
            Mutation::Replace(payload) => Ok(settle(key, Entry::replaced(key, payload))),
            Mutation::Merge(payload) => {
                if payload.is_empty() {
                    return Err(Error::validation("must provide either targets or labels"));
                }

                let base = current.cloned().unwrap_or_else(|| Entry::vacant(key));
                Ok(settle(key, base.merged(payload)?))
            }
            Mutation::Remove(payload) => {
                let current = current
                    .ok_or_else(|| Error::NotFound(format!("no targets registered for {}", key)))?;

                if payload.is_empty() {
                    return Ok(Outcome::Drop(current.clone()));
                }

                let next = current.without(key, payload)?;
                if next.is_vacant(key) {
                    Ok(Outcome::Drop(current.clone()))
                } else {
                    Ok(Outcome::Store(next))
                }
            }
        }
    }
}

fn settle(key: &Key, entry: Entry) -> Outcome {
    if entry.is_vacant(key) {
        Outcome::Drop(entry)
    } else {
        Outcome::Store(entry)
    }
}

type Slot = Arc<RwLock<Option<Entry>>>;

struct Inner {
    dir: DiscoveryDir,
    slots: Mutex<HashMap<Key, Slot>>,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    fn with_slots(dir: DiscoveryDir, slots: HashMap<Key, Slot>) -> Self {
        Registry {
            inner: Arc::new(Inner {
                dir,
                slots: Mutex::new(slots),
            }),
        }
    }

    /// Rebuilds the registry from the files previously written to `dir`.
    pub fn load(dir: DiscoveryDir) -> Result<Self, WriteError> {
        let mut slots = HashMap::new();

        for (key, group) in dir.load()? {
            let entry = Entry::from_group(&key, group).map_err(|err| WriteError::Malformed {
                path: dir.file_path(&key),
                reason: err.to_string(),
            })?;
            debug!("Loaded {} with {} targets", key, entry.targets.len());
            slots.insert(key, Arc::new(RwLock::new(Some(entry))));
        }

        info!(
            "Loaded {} target groups from {}",
            slots.len(),
            dir.path().display()
        );
        Ok(Self::with_slots(dir, slots))
    }

    pub fn dir(&self) -> &DiscoveryDir {
        &self.inner.dir
    }

    pub async fn get(&self, key: &Key) -> Entry {
        let slot = self.inner.slots.lock().get(key).cloned();
        let entry = match slot {
            Some(slot) => slot.read().await.clone(),
            None => None,
        };

        entry.unwrap_or_else(|| Entry::vacant(key))
    }

    /// Every key currently holding an entry, sorted.
    pub async fn keys(&self) -> Vec<Key> {
        let slots = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect::<Vec<_>>();

        let mut keys = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            if slot.read().await.is_some() {
                keys.push(key);
            }
        }

        keys.sort();
        keys
    }

    #[instrument(skip(self, key, payload), fields(key = %key))]
    pub async fn put(&self, key: Key, payload: Payload) -> Result<Entry, Error> {
        self.commit(key, Mutation::Replace(payload)).await
    }

    #[instrument(skip(self, key, payload), fields(key = %key))]
    pub async fn post(&self, key: Key, payload: Payload) -> Result<Entry, Error> {
        self.commit(key, Mutation::Merge(payload)).await
    }

    #[instrument(skip(self, key, payload), fields(key = %key))]
    pub async fn delete(&self, key: Key, payload: Payload) -> Result<Entry, Error> {
        self.commit(key, Mutation::Remove(payload)).await
    }

    // Runs detached so that a dropped request cannot stop a mutation between
    // the file rename and the in-memory update.
    async fn commit(&self, key: Key, mutation: Mutation) -> Result<Entry, Error> {
        let registry = self.clone();
        tokio::spawn(async move { registry.apply(key, mutation).await }).await?
    }

    async fn apply(&self, key: Key, mutation: Mutation) -> Result<Entry, Error> {
        let slot = self.inner.slots.lock().entry(key.clone()).or_default().clone();
        let mut current = slot.write().await;

        let result = self.transition(&key, mutation, &mut current).await;
        if current.is_none() {
            self.release(&key, &slot);
        }

        result
    }

    // Drops the slot of an absent key unless another request is holding or
    // waiting for it. New references are only handed out under the map lock.
    fn release(&self, key: &Key, slot: &Slot) {
        let mut slots = self.inner.slots.lock();
        if Arc::strong_count(slot) == 2 {
            slots.remove(key);
        }
    }

    async fn transition(
        &self,
        key: &Key,
        mutation: Mutation,
        current: &mut Option<Entry>,
    ) -> Result<Entry, Error> {
        let outcome = mutation.evaluate(key, current.as_ref())?;
        let dir = self.inner.dir.clone();

        match outcome {
            Outcome::Store(entry) => {
                let group = entry.to_group();
                let file_key = key.clone();
                tokio::task::spawn_blocking(move || dir.write(&file_key, &group)).await??;

                info!(
                    "Stored {} targets and {} labels for {}",
                    entry.targets.len(),
                    entry.labels.len(),
                    key
                );
                *current = Some(entry.clone());
                Ok(entry)
            }
            Outcome::Drop(entry) => {
                let file_key = key.clone();
                tokio::task::spawn_blocking(move || dir.remove(&file_key)).await??;

                if current.take().is_some() {
                    info!("Removed all targets for {}", key);
                }
                Ok(entry)
            }
        }
    }
}
