//! Persisted client state with change broadcast, plus HTTP fetch utilities.
//!
//! Storage is the single source of truth. Broadcast signals carry no payload;
//! observers re-read storage when woken.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use volmatch_core::{OpportunityId, Profile, ProfileTags, TagSet};

pub const CRATE_NAME: &str = "volmatch-storage";

pub const FAVORITES_KEY: &str = "favorites";
pub const PROFILE_KEY: &str = "userProfile";

const SIGNAL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding {key}: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// String-valued persistence backend addressed by key.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, key: &str, value: &str) -> Self {
        self.entries
            .get_mut()
            .insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One JSON document per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// Replaces the document via temp-file write and atomic rename, so readers
    /// never observe a half-written value.
    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;

        let path = self.path_for(key);
        let temp_path = self.root.join(format!(".{key}.{}.tmp", Uuid::new_v4()));

        if let Err(source) = write_then_rename(&temp_path, &path, value.as_bytes()).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io { path, source });
        }
        Ok(())
    }
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(temp_path, path).await
}

/// Named, payload-less wake-up signals shared by every store built on the bus,
/// each paired with the lock that serializes writes to that key.
#[derive(Debug, Clone, Default)]
pub struct SignalBus {
    channels: Arc<std::sync::Mutex<HashMap<String, Channel>>>,
}

#[derive(Debug, Clone)]
struct Channel {
    signal: broadcast::Sender<()>,
    write_lock: Arc<Mutex<()>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> Channel {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| Channel {
                signal: broadcast::channel(SIGNAL_CAPACITY).0,
                write_lock: Arc::new(Mutex::new(())),
            })
            .clone()
    }

    pub fn sender(&self, name: &str) -> broadcast::Sender<()> {
        self.channel(name).signal
    }

    /// Held across a read-modify-write of `name`.
    pub fn write_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.channel(name).write_lock
    }
}

/// A value with a storage key, a documented default and a codec that never
/// fails on read.
pub trait Persisted: Clone + Send + Sync + 'static {
    const KEY: &'static str;

    fn fallback() -> Self;

    /// `None` means the stored document is unusable and the default applies.
    fn decode(raw: &str) -> Option<Self>;

    fn encode(&self) -> Result<String, serde_json::Error>;
}

/// get/set/subscribe over one persisted value.
#[derive(Debug, Clone)]
pub struct SharedState<T> {
    backend: Arc<dyn KeyValueStore>,
    signal: broadcast::Sender<()>,
    write_lock: Arc<Mutex<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persisted> SharedState<T> {
    pub fn new(backend: Arc<dyn KeyValueStore>, bus: &SignalBus) -> Self {
        let channel = bus.channel(T::KEY);
        Self {
            backend,
            signal: channel.signal,
            write_lock: channel.write_lock,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self) -> T {
        match self.backend.read(T::KEY).await {
            Ok(Some(raw)) => T::decode(&raw).unwrap_or_else(|| {
                warn!(key = T::KEY, "persisted value is malformed; using default");
                T::fallback()
            }),
            Ok(None) => T::fallback(),
            Err(err) => {
                warn!(key = T::KEY, error = %err, "reading persisted value failed; using default");
                T::fallback()
            }
        }
    }

    /// Persists `value` and then wakes every subscriber.
    pub async fn set(&self, value: &T) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.persist(value).await
    }

    /// Read, modify, persist and signal as one step; concurrent updates of
    /// the same key through any store on the bus queue behind each other.
    pub async fn update<F>(&self, apply: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut T),
    {
        let _guard = self.write_lock.lock().await;
        let mut value = self.get().await;
        apply(&mut value);
        self.persist(&value).await?;
        Ok(value)
    }

    async fn persist(&self, value: &T) -> Result<(), StorageError> {
        let raw = value
            .encode()
            .map_err(|source| StorageError::Encode { key: T::KEY, source })?;
        self.backend.write(T::KEY, &raw).await?;
        let _ = self.signal.send(());
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal.subscribe()
    }
}

/// Favorited opportunity ids with set semantics over an ordered list.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct FavoriteSet {
    ids: Vec<OpportunityId>,
}

impl FavoriteSet {
    pub fn contains(&self, id: OpportunityId) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert(&mut self, id: OpportunityId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove(&mut self, id: OpportunityId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|existing| *existing != id);
        self.ids.len() != before
    }

    /// Flips membership and returns whether `id` is now a favorite.
    pub fn toggle(&mut self, id: OpportunityId) -> bool {
        if self.remove(id) {
            false
        } else {
            self.ids.push(id);
            true
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[OpportunityId] {
        &self.ids
    }
}

impl PartialEq for FavoriteSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.ids.iter().all(|id| other.contains(*id))
    }
}

impl Eq for FavoriteSet {}

impl FromIterator<OpportunityId> for FavoriteSet {
    fn from_iter<I: IntoIterator<Item = OpportunityId>>(iter: I) -> Self {
        let mut set = Self::default();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl Persisted for FavoriteSet {
    const KEY: &'static str = FAVORITES_KEY;

    fn fallback() -> Self {
        Self::default()
    }

    fn decode(raw: &str) -> Option<Self> {
        let value: JsonValue = serde_json::from_str(raw).ok()?;
        let items = value.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|item| {
                    let id = OpportunityId::from_json(item);
                    if id.is_none() {
                        debug!(%item, "dropping unreadable favorite entry");
                    }
                    id
                })
                .collect(),
        )
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone)]
pub struct FavoritesStore {
    state: SharedState<FavoriteSet>,
}

impl FavoritesStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, bus: &SignalBus) -> Self {
        Self {
            state: SharedState::new(backend, bus),
        }
    }

    /// Never fails: missing or malformed data reads as an empty set.
    pub async fn load(&self) -> FavoriteSet {
        self.state.get().await
    }

    /// Reads storage, flips membership of `id` once, persists the full set and
    /// wakes every observer.
    pub async fn toggle(&self, id: OpportunityId) -> Result<FavoriteSet, StorageError> {
        let mut now_favorited = false;
        let favorites = self
            .state
            .update(|set| now_favorited = set.toggle(id))
            .await?;
        info!(%id, now_favorited, total = favorites.len(), "favorite toggled");
        Ok(favorites)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.state.subscribe()
    }

    pub async fn mount(&self) -> FavoritesView {
        let signal = self.subscribe();
        let snapshot = self.load().await;
        FavoritesView {
            store: self.clone(),
            signal,
            snapshot,
        }
    }
}

/// One mounted observer of the favorites. Its snapshot is only a render
/// cache; storage is re-read whenever a signal arrives.
#[derive(Debug)]
pub struct FavoritesView {
    store: FavoritesStore,
    signal: broadcast::Receiver<()>,
    snapshot: FavoriteSet,
}

impl FavoritesView {
    pub fn favorites(&self) -> &FavoriteSet {
        &self.snapshot
    }

    pub fn is_favorite(&self, id: OpportunityId) -> bool {
        self.snapshot.contains(id)
    }

    pub async fn toggle(&mut self, id: OpportunityId) -> Result<bool, StorageError> {
        self.snapshot = self.store.toggle(id).await?;
        Ok(self.snapshot.contains(id))
    }

    /// Drains pending signals without waiting; reloads from storage if any
    /// arrived. Returns whether a reload happened.
    pub async fn sync(&mut self) -> bool {
        let mut pending = false;
        loop {
            match self.signal.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) => pending = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if pending {
            self.snapshot = self.store.load().await;
        }
        pending
    }

    /// Waits for the next signal, then reloads. Returns false once the
    /// channel is closed.
    pub async fn changed(&mut self) -> bool {
        match self.signal.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {
                self.snapshot = self.store.load().await;
                true
            }
            Err(RecvError::Closed) => false,
        }
    }
}

impl Persisted for Profile {
    const KEY: &'static str = PROFILE_KEY;

    fn fallback() -> Self {
        Profile::default()
    }

    /// Field-by-field validation: a field with the wrong shape falls back to
    /// its default without discarding the rest of the profile.
    fn decode(raw: &str) -> Option<Self> {
        let value: JsonValue = serde_json::from_str(raw).ok()?;
        let object = value.as_object()?;
        let defaults = Profile::default();

        let name = object
            .get("name")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.name);
        let interests = string_array(object.get("interests")).unwrap_or(defaults.tags.interests);
        let skills = string_array(object.get("skills")).unwrap_or(defaults.tags.skills);

        Some(Profile {
            name,
            tags: ProfileTags { interests, skills },
        })
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn string_array(value: Option<&JsonValue>) -> Option<TagSet> {
    value?
        .as_array()?
        .iter()
        .map(JsonValue::as_str)
        .collect::<Option<Vec<_>>>()
        .map(|labels| labels.into_iter().collect())
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    state: SharedState<Profile>,
}

impl ProfileStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, bus: &SignalBus) -> Self {
        Self {
            state: SharedState::new(backend, bus),
        }
    }

    pub async fn load(&self) -> Profile {
        self.state.get().await
    }

    pub async fn save(&self, profile: &Profile) -> Result<(), StorageError> {
        self.state.set(profile).await
    }

    pub async fn add_interest(&self, label: &str) -> Result<Profile, StorageError> {
        self.state
            .update(|p| {
                p.tags.interests.insert(label);
            })
            .await
    }

    pub async fn remove_interest(&self, label: &str) -> Result<Profile, StorageError> {
        self.state
            .update(|p| {
                p.tags.interests.remove(label);
            })
            .await
    }

    pub async fn add_skill(&self, label: &str) -> Result<Profile, StorageError> {
        self.state
            .update(|p| {
                p.tags.skills.insert(label);
            })
            .await
    }

    pub async fn remove_skill(&self, label: &str) -> Result<Profile, StorageError> {
        self.state
            .update(|p| {
                p.tags.skills.remove(label);
            })
            .await
    }

    /// Set union of quiz results into the profile; returns the updated
    /// profile and how many tags were new.
    pub async fn merge_tags(&self, tags: &ProfileTags) -> Result<(Profile, usize), StorageError> {
        let mut added = 0;
        let profile = self.state.update(|p| added = p.tags.merge(tags)).await?;
        info!(added, "merged tags into profile");
        Ok((profile, added))
    }

    pub async fn clear_tags(&self) -> Result<Profile, StorageError> {
        self.state.update(|p| p.tags.clear()).await
    }

    pub async fn reset(&self) -> Result<Profile, StorageError> {
        let profile = Profile::default();
        self.state.set(&profile).await?;
        Ok(profile)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.state.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// POSTs `body` as JSON, retrying transient failures with backoff. Only a
    /// 2xx response is returned as `Ok`.
    pub async fn post_json<B>(&self, url: &str, body: &B) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        self.send_with_retry(url, body)
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn send_with_retry<B>(&self, url: &str, body: &B) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let mut attempt = 0usize;
        loop {
            match self.client.post(url).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn memory_stores(raw_favorites: Option<&str>) -> (FavoritesStore, Arc<dyn KeyValueStore>) {
        let mut store = MemoryStore::new();
        if let Some(raw) = raw_favorites {
            store = store.with_entry(FAVORITES_KEY, raw);
        }
        let backend: Arc<dyn KeyValueStore> = Arc::new(store);
        (FavoritesStore::new(backend.clone(), &SignalBus::new()), backend)
    }

    #[tokio::test]
    async fn load_normalizes_mixed_and_duplicate_ids() {
        let (favorites, _) = memory_stores(Some(r#"[1, "1", 2, "two", null]"#));
        let loaded = favorites.load().await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.ids(), &[OpportunityId(1), OpportunityId(2)]);
    }

    #[tokio::test]
    async fn load_falls_back_to_empty_on_garbage() {
        for raw in ["", "not json", "{\"a\": 1}", "42"] {
            let (favorites, _) = memory_stores(Some(raw));
            assert!(favorites.load().await.is_empty(), "input {raw:?}");
        }
        let (favorites, _) = memory_stores(None);
        assert!(favorites.load().await.is_empty());
    }

    #[tokio::test]
    async fn toggle_twice_restores_membership() {
        let (favorites, _) = memory_stores(Some("[5]"));
        let original = favorites.load().await;
        for id in [OpportunityId(5), OpportunityId(9)] {
            favorites.toggle(id).await.unwrap();
            let restored = favorites.toggle(id).await.unwrap();
            assert_eq!(restored, original);
        }
    }

    #[tokio::test]
    async fn toggle_treats_string_ids_like_numbers_and_writes_numbers() {
        let (favorites, backend) = memory_stores(Some(r#"["1", 2]"#));
        let id: OpportunityId = "1".parse().unwrap();
        let after = favorites.toggle(id).await.unwrap();
        assert!(!after.contains(OpportunityId(1)));
        assert_eq!(backend.read(FAVORITES_KEY).await.unwrap().as_deref(), Some("[2]"));

        favorites.toggle(OpportunityId(3)).await.unwrap();
        assert_eq!(backend.read(FAVORITES_KEY).await.unwrap().as_deref(), Some("[2,3]"));
    }

    #[tokio::test]
    async fn views_observe_each_other_without_double_flips() {
        let (favorites, _) = memory_stores(None);
        let mut detail = favorites.mount().await;
        let mut listing = favorites.mount().await;

        assert!(detail.toggle(OpportunityId(3)).await.unwrap());
        assert!(listing.sync().await);
        assert!(listing.is_favorite(OpportunityId(3)));

        // The toggling view also hears its own signal; re-reading must not flip it back.
        assert!(detail.sync().await);
        assert!(detail.is_favorite(OpportunityId(3)));
        assert!(!detail.sync().await);

        assert!(!listing.toggle(OpportunityId(3)).await.unwrap());
        assert!(detail.changed().await);
        assert!(!detail.is_favorite(OpportunityId(3)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_toggles_are_never_lost() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let bus = SignalBus::new();
        let stores = [
            FavoritesStore::new(backend.clone(), &bus),
            FavoritesStore::new(backend.clone(), &bus),
        ];

        let handles = (0..64u64)
            .map(|i| {
                let store = stores[(i % 2) as usize].clone();
                tokio::spawn(async move { store.toggle(OpportunityId(i)).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let persisted = stores[0].load().await;
        assert_eq!(persisted.len(), 64);
        assert!((0..64).all(|i| persisted.contains(OpportunityId(i))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_profile_edits_are_never_lost() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let profiles = ProfileStore::new(backend, &SignalBus::new());
        profiles.clear_tags().await.unwrap();

        let handles = (0..32)
            .map(|i| {
                let profiles = profiles.clone();
                tokio::spawn(async move { profiles.add_skill(&format!("skill {i}")).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(profiles.load().await.tags.skills.len(), 32);
    }

    #[tokio::test]
    async fn stores_sharing_a_bus_and_backend_see_each_other() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let bus = SignalBus::new();
        let a = FavoritesStore::new(backend.clone(), &bus);
        let b = FavoritesStore::new(backend, &bus);

        let mut view = b.mount().await;
        a.toggle(OpportunityId(8)).await.unwrap();
        assert!(view.sync().await);
        assert!(view.is_favorite(OpportunityId(8)));
    }

    #[tokio::test]
    async fn profile_decode_falls_back_per_field() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new().with_entry(
            PROFILE_KEY,
            r#"{"name": "Ana", "interests": "Health", "skills": ["Teamwork", "teamwork"]}"#,
        ));
        let profiles = ProfileStore::new(backend, &SignalBus::new());
        let profile = profiles.load().await;
        assert_eq!(profile.name, "Ana");
        assert_eq!(profile.tags.interests, Profile::default().tags.interests);
        assert_eq!(profile.tags.skills.labels(), &["Teamwork".to_string()]);
    }

    #[tokio::test]
    async fn profile_arrays_with_wrong_element_types_use_defaults() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(
            MemoryStore::new().with_entry(PROFILE_KEY, r#"{"interests": [1, "Youth"]}"#),
        );
        let profiles = ProfileStore::new(backend, &SignalBus::new());
        assert_eq!(profiles.load().await, Profile::default());
    }

    #[tokio::test]
    async fn profile_mutations_persist_and_notify() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let profiles = ProfileStore::new(backend, &SignalBus::new());
        let mut signal = profiles.subscribe();

        let quiz: ProfileTags = ProfileTags {
            interests: ["Environment", "Youth"].into_iter().collect(),
            skills: ["Mentoring"].into_iter().collect(),
        };
        let (profile, added) = profiles.merge_tags(&quiz).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(profile.tags.interests.len(), 2);
        assert!(signal.try_recv().is_ok());

        profiles.remove_interest("YOUTH").await.unwrap();
        let cleared = profiles.clear_tags().await.unwrap();
        assert!(cleared.tags.is_empty());
        assert!(profiles.load().await.tags.is_empty());
        assert_eq!(profiles.reset().await.unwrap(), Profile::default());
    }

    #[tokio::test]
    async fn file_store_replaces_documents_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("state"));

        assert_eq!(store.read("favorites").await.unwrap(), None);
        store.write("favorites", "[1]").await.unwrap();
        store.write("favorites", "[1,2]").await.unwrap();
        assert_eq!(store.read("favorites").await.unwrap().as_deref(), Some("[1,2]"));

        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }
}
