//! src/services/object_store.rs
//!
//! ObjectStore: identifier-addressed payload storage on local disk. Objects
//! live at `base_path/{shard}/{id}` where the shard is the first two characters
//! of the id. Ids are claimed with an exclusive create, so uniqueness is
//! enforced by the filesystem rather than an in-memory registry.

use bytes::Bytes;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object id `{0}`")]
    InvalidObjectId(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("could not allocate a unique object id in {0} attempts")]
    AllocationExhausted(usize),
    #[error("object write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Produces candidate object ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Ids shorter than this cannot name a shard.
pub const MIN_OBJECT_ID_LEN: usize = 2;
const SHARD_LEN: usize = 2;

pub const DEFAULT_MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Sharded on-disk store for immutable payloads.
#[derive(Clone)]
pub struct ObjectStore {
    /// Root directory holding the shard directories.
    base_path: PathBuf,

    /// Upper bound on id candidates tried per allocation.
    max_attempts: usize,

    id_generator: IdGenerator,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("base_path", &self.base_path)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Create a store rooted at `base_path` that hands out random UUIDs.
    pub fn new(base_path: impl Into<PathBuf>, max_attempts: usize) -> Self {
        Self {
            base_path: base_path.into(),
            max_attempts: max_attempts.max(1),
            id_generator: Arc::new(|| Uuid::new_v4().to_string()),
        }
    }

    /// Replace the id source. Mostly useful to provoke collisions in tests.
    pub fn with_id_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.id_generator = Arc::new(generator);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Reject ids that are too short to shard or that could escape the root.
    pub fn validate_id(id: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectId(id.to_string());

        if id.chars().count() < MIN_OBJECT_ID_LEN {
            return Err(invalid());
        }
        if id.starts_with('.') || id.contains("..") {
            return Err(invalid());
        }
        if id
            .chars()
            .any(|c| c.is_control() || c == '/' || c == '\\' || c == '\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    fn shard_dir(&self, id: &str) -> PathBuf {
        let shard: String = id.chars().take(SHARD_LEN).collect();
        self.base_path.join(shard)
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.shard_dir(id).join(id)
    }

    /// Claim a fresh id and write `data` under it.
    ///
    /// The write runs on its own task: once started it completes even if the
    /// caller is dropped, so a cancelled request cannot leave a torn object.
    pub async fn allocate_and_write(&self, data: Bytes) -> StorageResult<String> {
        let store = self.clone();
        tokio::spawn(async move { store.write_new(data).await }).await?
    }

    async fn write_new(&self, data: Bytes) -> StorageResult<String> {
        for attempt in 1..=self.max_attempts {
            let id = (self.id_generator)();
            Self::validate_id(&id)?;

            let Some(mut file) = self.create_exclusive(&id).await? else {
                warn!(%id, attempt, "object id unavailable, retrying");
                continue;
            };

            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;

            debug!(%id, size = data.len(), "stored object");
            return Ok(id);
        }

        Err(StorageError::AllocationExhausted(self.max_attempts))
    }

    /// Exclusively create the file for `id`, creating its shard on demand.
    ///
    /// `None` means this id cannot be used: it is taken, or its shard was
    /// pruned again between mkdir and create.
    async fn create_exclusive(&self, id: &str) -> io::Result<Option<File>> {
        let shard = self.shard_dir(id);
        let path = shard.join(id);

        match create_new(&path).await {
            Ok(file) => return Ok(Some(file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        debug!(shard = %shard.display(), "creating shard");
        fs::create_dir_all(&shard).await?;
        match create_new(&path).await {
            Ok(file) => Ok(Some(file)),
            Err(err)
                if matches!(err.kind(), ErrorKind::AlreadyExists | ErrorKind::NotFound) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Read a whole object.
    pub async fn read(&self, id: &str) -> StorageResult<Bytes> {
        Self::validate_id(id)?;
        let data = fs::read(self.object_path(id))
            .await
            .map_err(|err| not_found_or_io(err, id))?;
        Ok(Bytes::from(data))
    }

    /// Size in bytes of a stored object.
    pub async fn size(&self, id: &str) -> StorageResult<u64> {
        Self::validate_id(id)?;
        let meta = fs::metadata(self.object_path(id))
            .await
            .map_err(|err| not_found_or_io(err, id))?;
        if !meta.is_file() {
            return Err(StorageError::ObjectNotFound(id.to_string()));
        }
        Ok(meta.len())
    }

    /// Permanently delete an object, then drop its shard if it became empty.
    pub async fn remove(&self, id: &str) -> StorageResult<()> {
        Self::validate_id(id)?;
        let path = self.object_path(id);
        fs::remove_file(&path)
            .await
            .map_err(|err| not_found_or_io(err, id))?;
        debug!("removed object file {}", path.display());

        self.prune_shard(&self.shard_dir(id)).await;
        Ok(())
    }

    /// Remove a shard directory only if it is empty.
    ///
    /// Races with allocations landing in the same shard are tolerated: either
    /// the directory is no longer empty and stays, or the allocation retries.
    async fn prune_shard(&self, shard: &Path) {
        match fs::remove_dir(shard).await {
            Ok(_) => debug!("pruned empty shard {}", shard.display()),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(err) => debug!("failed to prune shard {}: {}", shard.display(), err),
        }
    }
}

async fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

fn not_found_or_io(err: io::Error, id: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::ObjectNotFound(id.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ObjectStore {
        ObjectStore::new(dir.path(), DEFAULT_MAX_ALLOCATION_ATTEMPTS)
    }

    fn scripted_ids(ids: &'static [&'static str]) -> impl Fn() -> String + Send + Sync + 'static {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(ids.iter().map(|id| id.to_string()).collect());
        move || queue.lock().pop_front().unwrap_or_else(|| "zz-spare".into())
    }

    #[tokio::test]
    async fn round_trips_arbitrary_bytes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        let id = store
            .allocate_and_write(Bytes::from(payload.clone()))
            .await
            .unwrap();

        assert_eq!(store.read(&id).await.unwrap(), Bytes::from(payload));
        assert_eq!(store.size(&id).await.unwrap(), 4096);
        assert!(dir.path().join(&id[..2]).join(&id).is_file());
    }

    #[tokio::test]
    async fn missing_and_malformed_ids_are_distinguished() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(matches!(
            store.read("abcdef").await,
            Err(StorageError::ObjectNotFound(_))
        ));
        assert!(matches!(
            store.read("a").await,
            Err(StorageError::InvalidObjectId(_))
        ));
        assert!(matches!(
            store.remove("../etc").await,
            Err(StorageError::InvalidObjectId(_))
        ));
        assert!(matches!(
            store.size("ab/cd").await,
            Err(StorageError::InvalidObjectId(_))
        ));
    }

    #[tokio::test]
    async fn removing_last_object_prunes_its_shard() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let id = store
            .allocate_and_write(Bytes::from_static(b"payload"))
            .await
            .unwrap();
        store.remove(&id).await.unwrap();

        assert!(!dir.path().join(&id[..2]).exists());
        assert!(matches!(
            store.remove(&id).await,
            Err(StorageError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn shard_with_remaining_objects_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).with_id_generator(scripted_ids(&["aa-one", "aa-two"]));

        let first = store
            .allocate_and_write(Bytes::from_static(b"1"))
            .await
            .unwrap();
        let second = store
            .allocate_and_write(Bytes::from_static(b"2"))
            .await
            .unwrap();
        store.remove(&first).await.unwrap();

        assert!(dir.path().join("aa").is_dir());
        assert_eq!(store.read(&second).await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn allocation_recreates_a_pruned_shard() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).with_id_generator(scripted_ids(&["aa-one", "aa-two"]));

        let first = store
            .allocate_and_write(Bytes::from_static(b"1"))
            .await
            .unwrap();
        store.remove(&first).await.unwrap();
        assert!(!dir.path().join("aa").exists());

        let second = store
            .allocate_and_write(Bytes::from_static(b"2"))
            .await
            .unwrap();

        assert_eq!(second, "aa-two");
        assert_eq!(store.read(&second).await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn collision_is_retried_with_a_new_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).with_id_generator(scripted_ids(&["abc", "abc", "abd"]));

        let first = store
            .allocate_and_write(Bytes::from_static(b"first"))
            .await
            .unwrap();
        let second = store
            .allocate_and_write(Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert_eq!(first, "abc");
        assert_eq!(second, "abd");
        assert_eq!(store.read("abc").await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn allocation_gives_up_after_the_attempt_budget() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path(), 3).with_id_generator(|| "same-id".to_string());

        store
            .allocate_and_write(Bytes::from_static(b"kept"))
            .await
            .unwrap();
        let err = store
            .allocate_and_write(Bytes::from_static(b"lost"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::AllocationExhausted(3)));
        assert_eq!(store.read("same-id").await.unwrap(), Bytes::from_static(b"kept"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut join_set = tokio::task::JoinSet::new();
        for i in 0..64u32 {
            let store = store.clone();
            join_set.spawn(async move {
                let payload = Bytes::from(i.to_be_bytes().to_vec());
                let id = store.allocate_and_write(payload.clone()).await.unwrap();
                (id, payload)
            });
        }

        let mut ids = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            let (id, payload) = joined.unwrap();
            assert_eq!(store.read(&id).await.unwrap(), payload);
            ids.insert(id);
        }
        assert_eq!(ids.len(), 64);
    }
}
