//! Parameter store persistence.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use funnel_common::{FunnelError, ParameterStore, Result};

/// Loads and saves one parameter's cached series. A `save` replaces the
/// whole store; implementations must never leave a half-written store behind.
#[async_trait]
pub trait ParameterRepository: Send + Sync {
    async fn load(&self, parameter_id: &str) -> Result<Option<ParameterStore>>;
    async fn save(&self, store: &ParameterStore) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JsonFileRepository (one JSON document per parameter)
// ---------------------------------------------------------------------------

pub struct JsonFileRepository {
    root: PathBuf,
}

impl JsonFileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, parameter_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_stem(parameter_id)))
    }
}

/// Parameter ids are free-form. The readable part keeps a safe alphabet;
/// the digest suffix keeps distinct ids in distinct files.
fn file_stem(parameter_id: &str) -> String {
    let readable: String = parameter_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let readable = match readable.trim_start_matches('.') {
        "" => "_",
        trimmed => trimmed,
    };
    let digest = hex::encode(Sha256::digest(parameter_id.as_bytes()));
    format!("{readable}-{}", &digest[..12])
}

fn persistence(context: &str, path: &Path, err: impl std::fmt::Display) -> FunnelError {
    FunnelError::Persistence(format!("{context} {}: {err}", path.display()))
}

#[async_trait]
impl ParameterRepository for JsonFileRepository {
    async fn load(&self, parameter_id: &str) -> Result<Option<ParameterStore>> {
        let path = self.path_for(parameter_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence("reading", &path, e)),
        };
        let store: ParameterStore =
            serde_json::from_str(&raw).map_err(|e| persistence("parsing", &path, e))?;
        if store.parameter_id != parameter_id {
            return Err(persistence(
                "loading",
                &path,
                format!(
                    "holds parameter '{}', expected '{parameter_id}'",
                    store.parameter_id
                ),
            ));
        }
        debug!(parameter = parameter_id, entries = store.entries.len(), "Loaded parameter store");
        Ok(Some(store))
    }

    async fn save(&self, store: &ParameterStore) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| persistence("creating", &self.root, e))?;

        let path = self.path_for(&store.parameter_id);
        let tmp = path.with_extension("json.tmp");
        let body =
            serde_json::to_vec_pretty(store).map_err(|e| persistence("encoding", &path, e))?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| persistence("writing", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence("replacing", &path, e))?;
        debug!(
            parameter = %store.parameter_id,
            entries = store.entries.len(),
            "Saved parameter store"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryParameterRepository (tests — no filesystem required)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryParameterRepository {
    stores: Mutex<HashMap<String, ParameterStore>>,
    saves: AtomicUsize,
}

impl MemoryParameterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store directly, bypassing the save counter.
    pub async fn insert(&self, store: ParameterStore) {
        self.stores
            .lock()
            .await
            .insert(store.parameter_id.clone(), store);
    }

    pub async fn snapshot(&self, parameter_id: &str) -> Option<ParameterStore> {
        self.stores.lock().await.get(parameter_id).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterRepository for MemoryParameterRepository {
    async fn load(&self, parameter_id: &str) -> Result<Option<ParameterStore>> {
        Ok(self.snapshot(parameter_id).await)
    }

    async fn save(&self, store: &ParameterStore) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(store.clone()).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Arc<R> blanket — lets tests share the repository for assertions
// ---------------------------------------------------------------------------

#[async_trait]
impl<R: ParameterRepository + ?Sized> ParameterRepository for Arc<R> {
    async fn load(&self, parameter_id: &str) -> Result<Option<ParameterStore>> {
        (**self).load(parameter_id).await
    }

    async fn save(&self, store: &ParameterStore) -> Result<()> {
        (**self).save(store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use chrono::{NaiveDate, TimeZone, Utc};
    use funnel_common::{DateRange, LagStats, QuerySignature, SliceKind, TimeSeriesEntry};

    fn sample_store(id: &str) -> ParameterStore {
        let d = |day| NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        let range = DateRange::new(d(1), d(3)).unwrap();
        let entry = TimeSeriesEntry::new(
            SliceKind::Window,
            range,
            range.days().collect(),
            vec![10, 20, 30],
            vec![1, 2, 3],
            QuerySignature::new("abc"),
            Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap(),
            LagStats::default(),
        );
        let mut store = ParameterStore::new(id);
        store.entries.push(entry);
        store
    }

    #[tokio::test]
    async fn file_repository_round_trips_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        let store = sample_store("landing-signup");

        repo.save(&store).await.unwrap();
        let loaded = repo.load("landing-signup").await.unwrap().unwrap();
        assert_eq!(loaded, store);
        assert!(!repo.path_for("landing-signup").with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path().join("nested"));
        assert!(repo.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        tokio::fs::write(repo.path_for("broken"), b"{not json").await.unwrap();
        let err = repo.load("broken").await.unwrap_err();
        assert!(matches!(err, FunnelError::Persistence(_)));
    }

    #[test]
    fn file_names_are_sanitized() {
        assert!(file_stem("a/b c").starts_with("a_b_c-"));
        assert!(file_stem("../etc").starts_with("_etc-"));
        assert!(file_stem("").starts_with("_-"));
        assert_eq!(file_stem("landing-signup"), file_stem("landing-signup"));
    }

    #[tokio::test]
    async fn colliding_readable_names_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        let ids = ["funnel/a", "funnel a", "funnel_a"];

        let paths: HashSet<PathBuf> = ids.iter().map(|id| repo.path_for(id)).collect();
        assert_eq!(paths.len(), ids.len());

        let mut first = sample_store("funnel/a");
        first.entries[0].n_daily = vec![100, 100, 100];
        first.entries[0].n_total = 300;
        let second = sample_store("funnel_a");
        repo.save(&first).await.unwrap();
        repo.save(&second).await.unwrap();

        assert_eq!(repo.load("funnel/a").await.unwrap().unwrap(), first);
        assert_eq!(repo.load("funnel_a").await.unwrap().unwrap(), second);
        assert!(repo.load("funnel a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_rejects_a_store_saved_for_another_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        let body = serde_json::to_vec(&sample_store("someone-else")).unwrap();
        tokio::fs::write(repo.path_for("landing-signup"), body)
            .await
            .unwrap();

        let err = repo.load("landing-signup").await.unwrap_err();
        assert!(matches!(err, FunnelError::Persistence(_)));
    }

    #[tokio::test]
    async fn memory_repository_counts_saves() {
        let repo = MemoryParameterRepository::new();
        repo.insert(sample_store("seeded")).await;
        assert_eq!(repo.save_count(), 0);

        repo.save(&sample_store("p")).await.unwrap();
        assert_eq!(repo.save_count(), 1);
        assert!(repo.load("p").await.unwrap().is_some());
        assert!(repo.snapshot("seeded").await.is_some());
    }
}
