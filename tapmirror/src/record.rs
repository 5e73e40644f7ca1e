//! Durable record store.
//!
//! Every registry (operations, NBD client bindings, mirror processes, tapdisk
//! metadata) is a directory holding one JSON file per record. There is no
//! in-memory cache: each read rescans the directory, so the on-disk state is
//! the only source of truth shared between invocations.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Name of the advisory lock file inside each registry directory.
const LOCK_FILE: &str = ".lock";

/// A value persisted in a [`RecordStore`].
pub trait Record: Serialize + DeserializeOwned {
    /// Registry name used in errors and logs.
    const REGISTRY: &'static str;

    /// Prefix for generated record ids.
    const PREFIX: &'static str = "";

    /// Id derived from the record itself, if the registry names files that way.
    fn natural_id(&self) -> Option<String> {
        None
    }

    fn record_id(&self) -> Option<&str> {
        None
    }

    fn set_record_id(&mut self, _id: String) {}
}

/// File-backed registry of records of one kind.
pub struct RecordStore<T> {
    dir: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for RecordStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").field("dir", &self.dir).finish()
    }
}

/// Exclusive hold on a registry, released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    _lock: Flock<File>,
}

impl<T: Record> RecordStore<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _record: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn ensure_dir(&self) -> Result<()> {
        // create_dir_all tolerates an existing directory
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn not_found(id: &str) -> Error {
        Error::RecordNotFound {
            registry: T::REGISTRY,
            id: id.to_string(),
        }
    }

    /// Persist `record`, returning its id.
    ///
    /// A record that already carries an id is overwritten in place. Otherwise
    /// it is written to a fresh file named by its natural id, or by a
    /// generated `<prefix><uuid>` name, and the id is stored back on it.
    pub fn save(&self, record: &mut T) -> Result<String> {
        self.ensure_dir()?;

        if let Some(id) = record.record_id() {
            let id = id.to_string();
            self.write(&id, record, false)?;
            return Ok(id);
        }

        let (id, fresh) = match record.natural_id() {
            Some(id) => (id, false),
            None => (format!("{}{}", T::PREFIX, Uuid::new_v4().simple()), true),
        };
        self.write(&id, record, fresh)?;
        record.set_record_id(id.clone());
        debug!(registry = T::REGISTRY, id, "record saved");
        Ok(id)
    }

    /// Persist `record` under an explicit id, replacing any previous record.
    pub fn save_as(&self, id: &str, record: &T) -> Result<()> {
        self.ensure_dir()?;
        self.write(id, record, false)
    }

    fn write(&self, id: &str, record: &T, fresh: bool) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        let path = self.path(id);
        let mut file = if fresh {
            OpenOptions::new().write(true).create_new(true).open(&path)?
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?
        };
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(())
    }

    fn read(&self, id: &str, path: &Path) -> Result<T> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Self::not_found(id)),
            Err(e) => return Err(e.into()),
        };
        let mut record: T = serde_json::from_slice(&data).map_err(|e| Error::InvalidRecord {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        record.set_record_id(id.to_string());
        Ok(record)
    }

    /// Load one record by id.
    pub fn load(&self, id: &str) -> Result<T> {
        self.read(id, &self.path(id))
    }

    /// Load every record in the registry, ordered by id.
    ///
    /// A missing directory is an empty registry. Records that cannot be read
    /// or decoded are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<T>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if id.starts_with('.') {
                continue;
            }
            ids.push(id);
        }
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(e) => warn!(registry = T::REGISTRY, id, error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// First record matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Result<Option<T>> {
        Ok(self.load_all()?.into_iter().find(|r| predicate(r)))
    }

    /// Remove a record. A missing record is an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => {
                debug!(registry = T::REGISTRY, id, "record deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Self::not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the whole registry directory.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the registry's exclusive advisory lock.
    ///
    /// Held across scan-then-write sequences so two invocations cannot both
    /// claim the same free slot.
    pub async fn lock(&self) -> Result<RegistryLock> {
        self.ensure_dir()?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;

        let lock = tokio::task::spawn_blocking(move || Flock::lock(file, FlockArg::LockExclusive))
            .await
            .map_err(|e| Error::Io(io::Error::other(format!("task join error: {e}"))))?
            .map_err(|(_, errno)| Error::Io(io::Error::from(errno)))?;

        Ok(RegistryLock { _lock: lock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
        #[serde(skip)]
        id: Option<String>,
    }

    impl Note {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                id: None,
            }
        }
    }

    impl Record for Note {
        const REGISTRY: &'static str = "note";
        const PREFIX: &'static str = "note";

        fn record_id(&self) -> Option<&str> {
            self.id.as_deref()
        }

        fn set_record_id(&mut self, id: String) {
            self.id = Some(id);
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Named {
        name: String,
    }

    impl Record for Named {
        const REGISTRY: &'static str = "named";

        fn natural_id(&self) -> Option<String> {
            Some(self.name.clone())
        }
    }

    fn store(dir: &TempDir) -> RecordStore<Note> {
        RecordStore::new(dir.path().join("notes"))
    }

    #[test]
    fn save_creates_directory_and_assigns_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut note = Note::new("a");

        let id = store.save(&mut note).unwrap();

        assert!(id.starts_with("note"));
        assert_eq!(note.id.as_deref(), Some(id.as_str()));
        assert!(store.dir().join(&id).is_file());
    }

    #[test]
    fn save_tolerates_existing_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.dir()).unwrap();

        assert!(store.save(&mut Note::new("a")).is_ok());
    }

    #[test]
    fn save_with_known_id_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut note = Note::new("first");
        let id = store.save(&mut note).unwrap();

        note.text = "second".to_string();
        let again = store.save(&mut note).unwrap();

        assert_eq!(id, again);
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "second");
    }

    #[test]
    fn load_all_returns_saved_records() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut a = Note::new("a");
        let mut b = Note::new("b");
        store.save(&mut a).unwrap();
        store.save(&mut b).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|x, y| x.text.cmp(&y.text));

        assert_eq!(loaded, vec![a, b]);
    }

    #[test]
    fn load_all_on_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load_all().unwrap().is_empty());
    }

    #[test]
    fn load_all_skips_corrupt_records_and_lock_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&mut Note::new("good")).unwrap();
        fs::write(store.dir().join("garbage"), b"not json").unwrap();
        fs::write(store.dir().join(LOCK_FILE), b"").unwrap();

        let all = store.load_all().unwrap();

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "good");
    }

    #[test]
    fn natural_id_names_the_file() {
        let dir = TempDir::new().unwrap();
        let store: RecordStore<Named> = RecordStore::new(dir.path());
        let mut record = Named {
            name: "nbd3".to_string(),
        };

        let id = store.save(&mut record).unwrap();

        assert_eq!(id, "nbd3");
        assert_eq!(store.load("nbd3").unwrap(), record);
    }

    #[test]
    fn load_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).load("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = store.save(&mut Note::new("a")).unwrap();

        store.delete(&id).unwrap();

        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn delete_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&mut Note::new("a")).unwrap();

        let err = store.delete("nope").unwrap_err();

        assert!(matches!(err, Error::RecordNotFound { registry: "note", .. }));
    }

    #[test]
    fn clear_removes_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&mut Note::new("a")).unwrap();

        store.clear().unwrap();
        store.clear().unwrap();

        assert!(!store.dir().exists());
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = store.lock().await.unwrap();
        drop(first);
        let _second = store.lock().await.unwrap();

        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_excludes_a_second_holder() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let other = RecordStore::<Note>::new(store.dir().to_path_buf());

        let held = store.lock().await.unwrap();
        let contended = tokio::time::timeout(Duration::from_millis(200), other.lock()).await;
        assert!(contended.is_err(), "second lock granted while the first is held");

        drop(held);
        let reacquired = tokio::time::timeout(Duration::from_secs(5), other.lock()).await;
        assert!(matches!(reacquired, Ok(Ok(_))));
    }
}
