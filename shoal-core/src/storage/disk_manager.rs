//! Quota-enforcing file store for managed directories.
//!
//! Each registered directory keeps an in-memory ledger of its files and
//! their accounted sizes. Writes and deletes in one directory are serialized
//! by that directory's async mutex, so the ledger is current before the next
//! write is admitted.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use tokio::fs;
use tokio::sync::Mutex;

use super::{DirectoryConfig, MAX_EVICTIONS_PER_WRITE, QuotaPolicy, StorageError, size_kib};

/// Source of host free-space figures.
pub trait FreeSpaceSource: Send + Sync {
    /// Free KiB on the filesystem holding `path`, if known.
    fn free_kib(&self, path: &Path) -> Option<u64>;
}

/// Source backed by the operating system's disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpaceSource for SystemFreeSpace {
    fn free_kib(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // Longest mount point containing the path
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space() / 1024)
    }
}

#[derive(Debug, Clone, Copy)]
struct FileRecord {
    size_kib: u64,
    modified: SystemTime,
    /// Ledger insertion order, breaks mtime ties
    sequence: u64,
}

#[derive(Debug)]
struct Directory {
    path: PathBuf,
    config: DirectoryConfig,
    files: HashMap<String, FileRecord>,
    used_kib: u64,
    next_sequence: u64,
}

impl Directory {
    fn insert(&mut self, name: String, size_kib: u64, modified: SystemTime) {
        let record = FileRecord {
            size_kib,
            modified,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        if let Some(previous) = self.files.insert(name, record) {
            self.used_kib -= previous.size_kib;
        }
        self.used_kib += size_kib;
    }

    fn remove(&mut self, name: &str) -> Option<FileRecord> {
        let record = self.files.remove(name)?;
        self.used_kib -= record.size_kib;
        Some(record)
    }

    fn quota_left(&self) -> u64 {
        self.config.max_kib.saturating_sub(self.used_kib)
    }

    /// Next file to delete under the directory's policy, never `keep`.
    fn victim(&self, keep: &str) -> Option<String> {
        let candidates = self
            .files
            .iter()
            .filter(|(name, _)| name.as_str() != keep);

        match self.config.policy {
            QuotaPolicy::Reject => None,
            QuotaPolicy::DeleteOldest => candidates
                .min_by_key(|(_, record)| (record.modified, record.sequence))
                .map(|(name, _)| name.clone()),
            QuotaPolicy::DeleteNewest => candidates
                .max_by_key(|(_, record)| (record.modified, record.sequence))
                .map(|(name, _)| name.clone()),
            QuotaPolicy::DeleteRandom => candidates
                .choose(&mut rand::rng())
                .map(|(name, _)| name.clone()),
        }
    }
}

/// Mediates file I/O for managed directories under per-directory quotas.
pub struct DiskManager {
    min_free_space_kib: u64,
    space_source: Arc<dyn FreeSpaceSource>,
    directories: RwLock<HashMap<PathBuf, Arc<Mutex<Directory>>>>,
}

impl DiskManager {
    /// Creates a manager reading host free space from the operating system.
    pub fn new(min_free_space_kib: u64) -> Self {
        Self::with_space_source(min_free_space_kib, Arc::new(SystemFreeSpace))
    }

    pub fn with_space_source(min_free_space_kib: u64, space_source: Arc<dyn FreeSpaceSource>) -> Self {
        Self {
            min_free_space_kib,
            space_source,
            directories: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `dir` under `config`, creating it and accounting existing files.
    ///
    /// Registering an already managed directory replaces its config and
    /// rescans it.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the directory cannot be created or listed
    pub async fn register(&self, dir: &Path, config: DirectoryConfig) -> Result<(), StorageError> {
        fs::create_dir_all(dir).await?;

        let mut existing = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            existing.push((name, metadata.len(), modified));
        }
        existing.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let mut directory = Directory {
            path: dir.to_path_buf(),
            config,
            files: HashMap::new(),
            used_kib: 0,
            next_sequence: 0,
        };
        for (name, len, modified) in existing {
            directory.insert(name, size_kib(len as usize), modified);
        }

        tracing::debug!(
            dir = %dir.display(),
            files = directory.files.len(),
            used_kib = directory.used_kib,
            max_kib = directory.config.max_kib,
            "Registered managed directory"
        );
        self.directories
            .write()
            .insert(dir.to_path_buf(), Arc::new(Mutex::new(directory)));
        Ok(())
    }

    /// Writes `bytes` as `dir/name`, evicting per policy when over quota.
    ///
    /// Returns the path written.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnregisteredDirectory` - If `dir` is not managed
    /// - `StorageError::InvalidName` - If `name` is not a plain file name
    /// - `StorageError::DiskFull` - If the policy cannot make room
    /// - `StorageError::Io` - If the write itself fails
    pub async fn write(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        let directory = self.directory(dir)?;
        let mut directory = directory.lock().await;

        let encoded = directory.config.encoding.encode(bytes);
        let needed_kib = size_kib(encoded.len());
        let current_kib = directory.files.get(name).map_or(0, |record| record.size_kib);

        let mut evictions = 0;
        loop {
            let available_kib = self.available_kib(&directory);
            if available_kib + current_kib >= needed_kib {
                break;
            }

            let victim = if evictions < MAX_EVICTIONS_PER_WRITE {
                directory.victim(name)
            } else {
                None
            };
            let Some(victim) = victim else {
                tracing::debug!(
                    dir = %dir.display(),
                    name,
                    needed_kib,
                    available_kib,
                    "Write refused, no room"
                );
                return Err(StorageError::DiskFull {
                    drive: dir.to_path_buf(),
                    needed_kib,
                    available_kib: available_kib + current_kib,
                });
            };

            remove_file(&directory.path.join(&victim)).await?;
            directory.remove(&victim);
            evictions += 1;
            tracing::debug!(dir = %dir.display(), victim, "Evicted file for quota");
        }

        let path = directory.path.join(name);
        fs::write(&path, &encoded).await?;
        let modified = fs::metadata(&path)
            .await
            .and_then(|metadata| metadata.modified())
            .unwrap_or_else(|_| SystemTime::now());
        directory.insert(name.to_string(), needed_kib, modified);

        Ok(path)
    }

    /// Reads `dir/name`.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` - If the file does not exist
    /// - `StorageError::Io` - If the read fails
    pub async fn read(&self, dir: &Path, name: &str) -> Result<Vec<u8>, StorageError> {
        validate_name(name)?;
        let directory = self.directory(dir)?;
        let directory = directory.lock().await;
        let path = directory.path.join(name);

        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { path })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Deletes `dir/name`; returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnregisteredDirectory` - If `dir` is not managed
    /// - `StorageError::Io` - If removal fails for a reason other than absence
    pub async fn delete(&self, dir: &Path, name: &str) -> Result<bool, StorageError> {
        validate_name(name)?;
        let directory = self.directory(dir)?;
        let mut directory = directory.lock().await;

        let removed = remove_file(&directory.path.join(name)).await?;
        directory.remove(name);
        Ok(removed)
    }

    /// Host free space in KiB after the reserve.
    pub fn free_space(&self) -> u64 {
        self.free_space_at(Path::new("."))
    }

    /// Accounted KiB used in `dir`.
    ///
    /// # Errors
    ///
    /// - `StorageError::UnregisteredDirectory` - If `dir` is not managed
    pub async fn used_kib(&self, dir: &Path) -> Result<u64, StorageError> {
        Ok(self.directory(dir)?.lock().await.used_kib)
    }

    /// Whether the ledger of `dir` holds `name`.
    pub async fn contains(&self, dir: &Path, name: &str) -> bool {
        match self.directory(dir) {
            Ok(directory) => directory.lock().await.files.contains_key(name),
            Err(_) => false,
        }
    }

    fn free_space_at(&self, path: &Path) -> u64 {
        self.space_source
            .free_kib(path)
            .map_or(u64::MAX, |free| free.saturating_sub(self.min_free_space_kib))
    }

    fn available_kib(&self, directory: &Directory) -> u64 {
        directory
            .quota_left()
            .min(self.free_space_at(&directory.path))
    }

    fn directory(&self, dir: &Path) -> Result<Arc<Mutex<Directory>>, StorageError> {
        self.directories
            .read()
            .get(dir)
            .cloned()
            .ok_or_else(|| StorageError::UnregisteredDirectory {
                dir: dir.to_path_buf(),
            })
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StorageError::InvalidName {
            name: name.to_string(),
        }),
    }
}

async fn remove_file(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}
