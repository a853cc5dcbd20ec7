//! Watermarked incremental collection.
//!
//! Keeps a local copy of a server-side record collection by repeatedly
//! fetching everything changed strictly after a watermark timestamp.
//!
//! - The watermark only moves forward: it becomes the max of its previous
//!   value and every `updated_at` in the batch, deletes included.
//! - Upserts and deletes are applied before the observer's `on_batch`.
//! - A truncated batch reports [`PollOutcome::More`] so the caller polls
//!   again right away instead of waiting for the next interval.
//! - A failed fetch or decode leaves the collection untouched and reports
//!   [`PollOutcome::Retry`].

use crate::error::CollectionError;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

/// A record that can live in a [`WatermarkedCollection`].
pub trait CollectionRecord {
    fn key(&self) -> &str;
    /// Server timestamp of the last change to this record.
    fn updated_at(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub key: String,
    pub updated_at: u64,
}

/// One page of changes as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBatch {
    pub upserts: Vec<serde_json::Value>,
    pub deletes: Vec<Deletion>,
    /// Server truncated the batch; more changes are waiting.
    pub more: bool,
}

/// Where batches come from (usually an HTTP endpoint).
pub trait CollectionSource {
    fn fetch(
        &mut self,
        collection: &str,
        since: u64,
    ) -> impl Future<Output = Result<RawBatch, CollectionError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Keep the record, flagged as deleted.
    Tombstone,
    /// Drop the record.
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not connected; nothing was requested.
    Idle,
    /// Batch applied, nothing more waiting.
    Done,
    /// Batch applied and truncated; poll again now.
    More,
    /// Fetch or decode failed; try again next interval.
    Retry,
}

/// Change notifications. Every method has an empty default.
pub trait CollectionObserver<T> {
    fn added(&mut self, _record: &T) {}
    fn updated(&mut self, _record: &T) {}
    fn removed(&mut self, _key: &str) {}
    /// Called once per applied batch, after every record change.
    fn on_batch(&mut self, _collection: &str, _changes: usize) {}
}

impl<T> CollectionObserver<T> for () {}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub value: T,
    pub tombstoned: bool,
}

type Decoder<T> = Box<dyn Fn(serde_json::Value) -> Result<T, CollectionError> + Send + Sync>;

pub struct WatermarkedCollection<T> {
    name: String,
    policy: DeletePolicy,
    watermark: u64,
    records: BTreeMap<String, Entry<T>>,
    decoder: Decoder<T>,
}

impl<T> std::fmt::Debug for WatermarkedCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkedCollection")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("watermark", &self.watermark)
            .field("records", &self.records.len())
            .finish()
    }
}

impl<T> WatermarkedCollection<T>
where
    T: CollectionRecord + DeserializeOwned,
{
    /// Collection decoded with `serde_json::from_value`.
    pub fn new(name: impl Into<String>, policy: DeletePolicy) -> Self {
        Self::with_decoder(name, policy, |v| {
            serde_json::from_value(v).map_err(|e| CollectionError::Decode(e.to_string()))
        })
    }
}

impl<T> WatermarkedCollection<T>
where
    T: CollectionRecord,
{
    pub fn with_decoder(
        name: impl Into<String>,
        policy: DeletePolicy,
        decoder: impl Fn(serde_json::Value) -> Result<T, CollectionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            watermark: 0,
            records: BTreeMap::new(),
            decoder: Box::new(decoder),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Fetch and apply one batch.
    pub async fn poll<S, O>(&mut self, source: &mut S, connected: bool, observer: &mut O) -> PollOutcome
    where
        S: CollectionSource,
        O: CollectionObserver<T>,
    {
        if !connected {
            return PollOutcome::Idle;
        }
        let batch = match source.fetch(&self.name, self.watermark).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Polling {} failed: {}", self.name, e);
                return PollOutcome::Retry;
            }
        };
        match self.apply_batch(batch, observer) {
            Ok(true) => PollOutcome::More,
            Ok(false) => PollOutcome::Done,
            Err(e) => {
                warn!("Polling {} failed: {}", self.name, e);
                PollOutcome::Retry
            }
        }
    }

    /// Poll until the server stops reporting truncation, at most
    /// `max_rounds` times. Returns the last outcome.
    pub async fn poll_all<S, O>(
        &mut self,
        source: &mut S,
        connected: bool,
        observer: &mut O,
        max_rounds: usize,
    ) -> PollOutcome
    where
        S: CollectionSource,
        O: CollectionObserver<T>,
    {
        let mut outcome = PollOutcome::Idle;
        for _ in 0..max_rounds {
            outcome = self.poll(source, connected, observer).await;
            if outcome != PollOutcome::More {
                break;
            }
        }
        outcome
    }

    /// Apply a batch. Returns the server's truncation flag.
    ///
    /// Every upsert is decoded before anything is applied, so a decode
    /// failure leaves records and watermark unchanged.
    pub fn apply_batch<O>(&mut self, batch: RawBatch, observer: &mut O) -> Result<bool, CollectionError>
    where
        O: CollectionObserver<T>,
    {
        let upserts = batch
            .upserts
            .into_iter()
            .map(|v| (self.decoder)(v))
            .collect::<Result<Vec<T>, _>>()?;

        let newest = upserts
            .iter()
            .map(|r| r.updated_at())
            .chain(batch.deletes.iter().map(|d| d.updated_at))
            .max()
            .unwrap_or(0);

        let changes = upserts.len() + batch.deletes.len();
        for record in upserts {
            self.upsert(record, observer);
        }
        for deletion in batch.deletes {
            self.delete(&deletion.key, observer);
        }
        self.watermark = self.watermark.max(newest);
        debug!(
            "{}: applied {} changes, watermark {}",
            self.name, changes, self.watermark
        );
        observer.on_batch(&self.name, changes);
        Ok(batch.more)
    }

    fn upsert<O: CollectionObserver<T>>(&mut self, record: T, observer: &mut O) {
        let key = record.key().to_string();
        match self.records.get_mut(&key) {
            Some(entry) if !entry.tombstoned => {
                entry.value = record;
                observer.updated(&entry.value);
            }
            Some(entry) => {
                entry.value = record;
                entry.tombstoned = false;
                observer.added(&entry.value);
            }
            None => {
                let entry = self.records.entry(key).or_insert(Entry {
                    value: record,
                    tombstoned: false,
                });
                observer.added(&entry.value);
            }
        }
    }

    fn delete<O: CollectionObserver<T>>(&mut self, key: &str, observer: &mut O) {
        match self.policy {
            DeletePolicy::Remove => {
                if self.records.remove(key).is_some() {
                    observer.removed(key);
                }
            }
            DeletePolicy::Tombstone => match self.records.get_mut(key) {
                Some(entry) if !entry.tombstoned => {
                    entry.tombstoned = true;
                    observer.removed(key);
                }
                Some(_) => {}
                None => debug!("{}: delete for unknown key {}", self.name, key),
            },
        }
    }

    /// Live (non-tombstoned) record for `key`.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.records
            .get(key)
            .filter(|e| !e.tombstoned)
            .map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&Entry<T>> {
        self.records.get(key)
    }

    /// Live records in key order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records
            .values()
            .filter(|e| !e.tombstoned)
            .map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.records.values().filter(|e| !e.tombstoned).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every record and restart from watermark 0.
    pub fn reset(&mut self) {
        self.records.clear();
        self.watermark = 0;
    }
}
