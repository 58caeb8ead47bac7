use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use demo_archive_core::codec::{decode_field, encode_field, EncodedBlock};
use demo_archive_core::{
    validate_identifier, ArchiveEntry, ArchiveError, DType, DemonstrationRecord, FieldKind, Page,
    PageRequest, StorageContext, Timestamp,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const LATEST_SCHEMA_VERSION: i64 = 1;
const TASK_FILE_EXTENSION: &str = "sqlite3";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS demonstrations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL UNIQUE,
  steps INTEGER NOT NULL CHECK (steps >= 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS demonstration_fields (
  demonstration_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('text','numeric','array','dict')),
  text_value TEXT,
  PRIMARY KEY (demonstration_id, name),
  FOREIGN KEY (demonstration_id) REFERENCES demonstrations(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS field_blocks (
  demonstration_id INTEGER NOT NULL,
  block_key TEXT NOT NULL,
  field_name TEXT NOT NULL,
  dtype TEXT NOT NULL CHECK (dtype IN ('u8','i32','i64','f32','f64','bool')),
  element_shape TEXT NOT NULL,
  steps INTEGER NOT NULL CHECK (steps >= 0),
  raw_len INTEGER NOT NULL CHECK (raw_len >= 0),
  sha256 TEXT NOT NULL,
  payload BLOB NOT NULL,
  PRIMARY KEY (demonstration_id, block_key),
  FOREIGN KEY (demonstration_id, field_name)
    REFERENCES demonstration_fields(demonstration_id, name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_field_blocks_field ON field_blocks(demonstration_id, field_name);
";

/// Archive settings, usually read from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub root: PathBuf,
    pub compression_level: i32,
    pub busy_timeout_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/demonstrations"),
            compression_level: 3,
            busy_timeout_ms: 5000,
        }
    }
}

impl ArchiveConfig {
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Self::default() }
    }

    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML for this shape.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ArchiveError> {
        let body = fs::read_to_string(path)
            .with_storage_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&body)
    }

    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] when the YAML does not describe a config.
    pub fn from_yaml_str(body: &str) -> Result<Self, ArchiveError> {
        serde_yaml::from_str(body)
            .map_err(|err| ArchiveError::InvalidArgument(format!("invalid archive config: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorruptBlock {
    pub timestamp: String,
    pub block_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_version: i64,
    pub demonstrations: usize,
    pub blocks_checked: usize,
    pub corrupt_blocks: Vec<CorruptBlock>,
}

/// Compressed form of one encoded block, ready to insert.
struct StoredBlock {
    field_name: String,
    key: String,
    dtype: DType,
    element_shape: String,
    steps: i64,
    raw_len: i64,
    sha256: String,
    payload: Vec<u8>,
}

impl StoredBlock {
    fn compress(field_name: &str, block: &EncodedBlock, level: i32) -> Result<Self, ArchiveError> {
        let payload = zstd::encode_all(block.bytes.as_slice(), level)
            .with_storage_context(|| format!("failed to compress block {}", block.key))?;
        Ok(Self {
            field_name: field_name.to_string(),
            key: block.key.clone(),
            dtype: block.dtype,
            element_shape: serde_json::to_string(&block.element_shape)
                .storage_context("failed to serialize element shape")?,
            steps: to_i64(block.steps)?,
            raw_len: to_i64(block.bytes.len())?,
            sha256: sha256_hex(&block.bytes),
            payload,
        })
    }
}

/// A normalized record laid out as rows, ready for one insert transaction.
struct PreparedDemonstration {
    steps: i64,
    fields: Vec<(String, FieldKind, Option<String>)>,
    blocks: Vec<StoredBlock>,
}

impl PreparedDemonstration {
    fn prepare(record: &DemonstrationRecord, level: i32) -> Result<Self, ArchiveError> {
        let (normalized, steps) = record.normalized()?;
        let mut fields = Vec::with_capacity(normalized.len());
        let mut blocks = Vec::new();
        for (name, value) in normalized.fields() {
            let encoded = encode_field(name, value);
            for block in &encoded.blocks {
                blocks.push(StoredBlock::compress(name, block, level)?);
            }
            fields.push((encoded.name, encoded.kind, encoded.text));
        }
        Ok(Self { steps: to_i64(steps)?, fields, blocks })
    }
}

/// One (environment, task) storage unit backed by a single `SQLite` file.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    /// Open (creating if needed) a task file and configure connection pragmas.
    ///
    /// Nothing is written to the file until [`TaskStore::migrate`] runs.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self, ArchiveError> {
        let conn = Connection::open(path)
            .with_storage_context(|| format!("failed to open task file {}", path.display()))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .storage_context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .storage_context("failed to configure sqlite busy timeout")?;

        debug!(path = %path.display(), "opened task file");
        Ok(Self { conn })
    }

    /// Switch the file to WAL and apply forward migrations up to the latest schema version.
    ///
    /// # Errors
    /// Returns an error when bootstrapping fails or the file was written by a newer schema.
    pub fn migrate(&mut self) -> Result<(), ArchiveError> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL;")
            .storage_context("failed to enable WAL journal")?;
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .storage_context("failed to apply schema_migrations table")?;

        let version = self.schema_version()?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(ArchiveError::storage(
                "unsupported schema version",
                format!("found {version}, expected at most {LATEST_SCHEMA_VERSION}"),
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().storage_context("failed to start migration")?;
            tx.execute_batch(MIGRATION_001_SQL).storage_context("failed to apply migration 1")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .storage_context("failed to record migration version 1")?;
            tx.commit().storage_context("failed to commit migration 1")?;
        }

        Ok(())
    }

    /// Whether the file already carries a readable schema; read paths never create one.
    ///
    /// # Errors
    /// Returns an error when the file is not a database or was written by a newer schema.
    pub fn has_schema(&self) -> Result<bool, ArchiveError> {
        let tables: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('schema_migrations', 'demonstrations')",
                [],
                |row| row.get(0),
            )
            .storage_context("failed to inspect task file schema")?;
        if tables < 2 {
            return Ok(false);
        }
        let version = self.schema_version()?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(ArchiveError::storage(
                "unsupported schema version",
                format!("found {version}, expected at most {LATEST_SCHEMA_VERSION}"),
            ));
        }
        Ok(version >= 1)
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64, ArchiveError> {
        self.conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .storage_context("failed to read schema version")
    }

    /// Insert a prepared demonstration under the first free key derived from `at`.
    fn insert(
        &mut self,
        at: &Timestamp,
        prepared: &PreparedDemonstration,
    ) -> Result<Timestamp, ArchiveError> {
        let tx = self.conn.transaction().storage_context("failed to start transaction")?;

        let mut placed = None;
        for candidate in at.candidates() {
            if !timestamp_taken(&tx, &candidate)? {
                placed = Some(candidate);
                break;
            }
        }
        let Some(timestamp) = placed else {
            return Err(ArchiveError::storage(
                "failed to place demonstration",
                format!("every collision suffix for {} is taken", at.base()),
            ));
        };

        tx.execute(
            "INSERT INTO demonstrations(timestamp, steps, created_at) VALUES (?1, ?2, ?3)",
            params![timestamp.as_str(), prepared.steps, now_rfc3339()?],
        )
        .storage_context("failed to insert demonstration")?;
        let demonstration_id = tx.last_insert_rowid();

        for (name, kind, text) in &prepared.fields {
            tx.execute(
                "INSERT INTO demonstration_fields(demonstration_id, name, kind, text_value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![demonstration_id, name, kind.as_str(), text],
            )
            .with_storage_context(|| format!("failed to insert field {name}"))?;
        }

        for block in &prepared.blocks {
            tx.execute(
                "INSERT INTO field_blocks(
                    demonstration_id, block_key, field_name, dtype, element_shape,
                    steps, raw_len, sha256, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    demonstration_id,
                    block.key,
                    block.field_name,
                    block.dtype.as_str(),
                    block.element_shape,
                    block.steps,
                    block.raw_len,
                    block.sha256,
                    block.payload,
                ],
            )
            .with_storage_context(|| format!("failed to insert block {}", block.key))?;
        }

        tx.commit().storage_context("failed to commit demonstration")?;
        Ok(timestamp)
    }

    /// Load one demonstration, verifying every block digest.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read, blocks fail verification, or decoding fails.
    pub fn read(&self, timestamp: &Timestamp) -> Result<Option<DemonstrationRecord>, ArchiveError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, steps FROM demonstrations WHERE timestamp = ?1",
                params![timestamp.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .storage_context("failed to look up demonstration")?;
        let Some((demonstration_id, steps)) = row else {
            return Ok(None);
        };
        let steps = to_usize(steps)?;

        let mut blocks_by_field: BTreeMap<String, Vec<EncodedBlock>> = BTreeMap::new();
        for block in self.read_blocks(demonstration_id)? {
            blocks_by_field.entry(block.field_name).or_default().push(block.result?);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, kind, text_value FROM demonstration_fields
                 WHERE demonstration_id = ?1 ORDER BY name ASC",
            )
            .storage_context("failed to prepare field query")?;
        let mut rows = stmt.query(params![demonstration_id]).storage_context("failed to query fields")?;

        let mut record = DemonstrationRecord::new();
        while let Some(row) = rows.next().storage_context("failed to read field row")? {
            let name: String = row.get(0).storage_context("failed to read field name")?;
            let kind_raw: String = row.get(1).storage_context("failed to read field kind")?;
            let text: Option<String> = row.get(2).storage_context("failed to read field text")?;
            let kind = FieldKind::parse(&kind_raw).ok_or_else(|| {
                ArchiveError::storage("failed to decode field", format!("unknown kind {kind_raw}"))
            })?;
            let blocks = blocks_by_field.remove(&name).unwrap_or_default();
            let value = decode_field(&name, kind, steps, text, blocks)?;
            record.insert(name, value);
        }

        Ok(Some(record))
    }

    /// Read, decompress and verify every block of one demonstration.
    ///
    /// Verification failures are returned per block so integrity checks can report them all.
    fn read_blocks(
        &self,
        demonstration_id: i64,
    ) -> Result<Vec<BlockRead>, ArchiveError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT field_name, block_key, dtype, element_shape, steps, raw_len, sha256, payload
                 FROM field_blocks WHERE demonstration_id = ?1 ORDER BY block_key ASC",
            )
            .storage_context("failed to prepare block query")?;
        let mut rows = stmt.query(params![demonstration_id]).storage_context("failed to query blocks")?;

        let mut blocks = Vec::new();
        while let Some(row) = rows.next().storage_context("failed to read block row")? {
            let raw = RawBlockRow {
                field_name: row.get(0).storage_context("failed to read block field")?,
                key: row.get(1).storage_context("failed to read block key")?,
                dtype: row.get(2).storage_context("failed to read block dtype")?,
                element_shape: row.get(3).storage_context("failed to read block shape")?,
                steps: row.get(4).storage_context("failed to read block steps")?,
                raw_len: row.get(5).storage_context("failed to read block length")?,
                sha256: row.get(6).storage_context("failed to read block digest")?,
                payload: row.get(7).storage_context("failed to read block payload")?,
            };
            blocks.push(BlockRead {
                field_name: raw.field_name.clone(),
                key: raw.key.clone(),
                result: raw.verify(),
            });
        }
        Ok(blocks)
    }

    /// # Errors
    /// Returns an error when the page cannot be queried.
    pub fn list(&self, request: PageRequest) -> Result<(Vec<Timestamp>, usize), ArchiveError> {
        let total_count = self.count()?;
        if request.offset() >= total_count {
            return Ok((Vec::new(), total_count));
        }
        let mut stmt = self
            .conn
            .prepare("SELECT timestamp FROM demonstrations ORDER BY timestamp ASC LIMIT ?1 OFFSET ?2")
            .storage_context("failed to prepare listing query")?;
        let rows = stmt
            .query_map(
                params![to_i64(request.page_size)?, to_i64(request.offset())?],
                |row| row.get::<_, String>(0),
            )
            .storage_context("failed to list demonstrations")?;

        let mut timestamps = Vec::new();
        for row in rows {
            let raw = row.storage_context("failed to read timestamp row")?;
            let timestamp = Timestamp::parse(&raw).map_err(|err| {
                ArchiveError::storage(format!("stored timestamp `{raw}` is invalid"), err)
            })?;
            timestamps.push(timestamp);
        }
        Ok((timestamps, total_count))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self) -> Result<usize, ArchiveError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM demonstrations", [], |row| row.get(0))
            .storage_context("failed to count demonstrations")?;
        to_usize(count)
    }

    /// Delete one demonstration with its fields and blocks; `false` when it was absent.
    ///
    /// # Errors
    /// Returns an error when the delete transaction fails.
    pub fn delete(&mut self, timestamp: &Timestamp) -> Result<bool, ArchiveError> {
        let tx = self.conn.transaction().storage_context("failed to start transaction")?;
        let removed = tx
            .execute("DELETE FROM demonstrations WHERE timestamp = ?1", params![timestamp.as_str()])
            .storage_context("failed to delete demonstration")?;
        tx.commit().storage_context("failed to commit delete")?;
        Ok(removed > 0)
    }

    /// Run `PRAGMA quick_check` and re-verify every stored block digest.
    ///
    /// # Errors
    /// Returns an error when an integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, ArchiveError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .storage_context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("SELECT id, timestamp FROM demonstrations ORDER BY timestamp ASC")
            .storage_context("failed to prepare demonstration scan")?;
        let demonstrations = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .storage_context("failed to scan demonstrations")?
            .collect::<Result<Vec<_>, _>>()
            .storage_context("failed to read demonstration row")?;

        let mut blocks_checked = 0;
        let mut corrupt_blocks = Vec::new();
        for (demonstration_id, timestamp) in &demonstrations {
            for block in self.read_blocks(*demonstration_id)? {
                blocks_checked += 1;
                if let Err(err) = block.result {
                    corrupt_blocks.push(CorruptBlock {
                        timestamp: timestamp.clone(),
                        block_key: block.key,
                        reason: error_chain(&err),
                    });
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_version: self.schema_version()?,
            demonstrations: demonstrations.len(),
            blocks_checked,
            corrupt_blocks,
        })
    }
}

struct BlockRead {
    field_name: String,
    key: String,
    result: Result<EncodedBlock, ArchiveError>,
}

struct RawBlockRow {
    field_name: String,
    key: String,
    dtype: String,
    element_shape: String,
    steps: i64,
    raw_len: i64,
    sha256: String,
    payload: Vec<u8>,
}

impl RawBlockRow {
    fn verify(self) -> Result<EncodedBlock, ArchiveError> {
        let context = || format!("block {} failed verification", self.key);
        let dtype = DType::parse(&self.dtype)
            .ok_or_else(|| ArchiveError::storage(context(), format!("unknown dtype {}", self.dtype)))?;
        let element_shape: Vec<usize> =
            serde_json::from_str(&self.element_shape).with_storage_context(context)?;
        let bytes = zstd::decode_all(self.payload.as_slice()).with_storage_context(context)?;
        if bytes.len() != to_usize(self.raw_len)? {
            return Err(ArchiveError::storage(
                context(),
                format!("decompressed {} bytes, expected {}", bytes.len(), self.raw_len),
            ));
        }
        let digest = sha256_hex(&bytes);
        if digest != self.sha256 {
            return Err(ArchiveError::storage(
                context(),
                format!("sha256 mismatch: stored {}, computed {digest}", self.sha256),
            ));
        }
        Ok(EncodedBlock {
            key: self.key,
            dtype,
            element_shape,
            steps: to_usize(self.steps)?,
            bytes,
        })
    }
}

/// The demonstration archive: one task file per (environment, task) under a root directory.
///
/// Every public operation runs under one process-wide lock, including opening and closing
/// the task file. Share one instance by reference (for example behind an `Arc`).
pub struct Archive {
    config: ArchiveConfig,
    lock: Mutex<()>,
}

impl Archive {
    /// Create the root directory if missing and validate the configuration.
    ///
    /// # Errors
    /// Returns an error when the compression level is out of range or the root cannot be created.
    pub fn open(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        if !zstd::compression_level_range().contains(&config.compression_level) {
            return Err(ArchiveError::InvalidArgument(format!(
                "compression_level {} is outside {:?}",
                config.compression_level,
                zstd::compression_level_range()
            )));
        }
        fs::create_dir_all(&config.root).with_storage_context(|| {
            format!("failed to create archive root {}", config.root.display())
        })?;
        info!(root = %config.root.display(), "opened demonstration archive");
        Ok(Self { config, lock: Mutex::new(()) })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[must_use]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Location of the task file for one (environment, task) pair.
    ///
    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] for unusable identifiers.
    pub fn task_path(&self, environment: &str, task: &str) -> Result<PathBuf, ArchiveError> {
        validate_identifier("environment", environment)?;
        validate_identifier("task", task)?;
        Ok(self.config.root.join(environment).join(format!("{task}.{TASK_FILE_EXTENSION}")))
    }

    /// Persist a record under the current local time.
    ///
    /// # Errors
    /// Returns [`ArchiveError::MalformedRecord`] for records that cannot be stored, and
    /// [`ArchiveError::Storage`] when the write fails.
    pub fn save(
        &self,
        environment: &str,
        task: &str,
        record: &DemonstrationRecord,
    ) -> Result<ArchiveEntry, ArchiveError> {
        self.save_with(environment, task, record, Timestamp::now)
    }

    /// Persist a record at an explicit timestamp, disambiguating it if already taken.
    ///
    /// # Errors
    /// Same as [`Archive::save`].
    pub fn save_at(
        &self,
        environment: &str,
        task: &str,
        record: &DemonstrationRecord,
        timestamp: Timestamp,
    ) -> Result<ArchiveEntry, ArchiveError> {
        self.save_with(environment, task, record, move || Ok(timestamp))
    }

    fn save_with<F>(
        &self,
        environment: &str,
        task: &str,
        record: &DemonstrationRecord,
        clock: F,
    ) -> Result<ArchiveEntry, ArchiveError>
    where
        F: FnOnce() -> Result<Timestamp, ArchiveError>,
    {
        let path = self.task_path(environment, task)?;
        let _guard = self.lock.lock();
        let prepared = PreparedDemonstration::prepare(record, self.config.compression_level)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_storage_context(|| {
                format!("failed to create environment directory {}", parent.display())
            })?;
        }
        let mut store = TaskStore::open(&path, self.config.busy_timeout_ms)?;
        store.migrate()?;

        let requested = clock()?;
        let timestamp = store.insert(&requested, &prepared)?;
        if timestamp != requested {
            warn!(
                environment,
                task,
                requested = %requested,
                placed = %timestamp,
                "timestamp already taken; stored under a suffixed key"
            );
        }
        info!(
            environment,
            task,
            timestamp = %timestamp,
            steps = prepared.steps,
            blocks = prepared.blocks.len(),
            "saved demonstration"
        );

        Ok(ArchiveEntry::new(environment, task, timestamp))
    }

    /// Load one demonstration in the shape it was saved in, truncated to its common length.
    ///
    /// # Errors
    /// Returns [`ArchiveError::NotFound`] when the task file or timestamp does not exist.
    pub fn load(
        &self,
        environment: &str,
        task: &str,
        timestamp: &Timestamp,
    ) -> Result<DemonstrationRecord, ArchiveError> {
        let path = self.task_path(environment, task)?;
        let _guard = self.lock.lock();
        let store = self.open_existing(&path)?.ok_or_else(|| {
            ArchiveError::NotFound(format!("no demonstrations recorded for {environment}/{task}"))
        })?;
        let record = store.read(timestamp)?.ok_or_else(|| {
            ArchiveError::NotFound(format!("{environment}/{task}/{timestamp}"))
        })?;
        debug!(environment, task, timestamp = %timestamp, fields = record.len(), "loaded demonstration");
        Ok(record)
    }

    /// One page of entries in timestamp order; a never-written task yields one empty page.
    ///
    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] for a zero page or page size.
    pub fn list(
        &self,
        environment: &str,
        task: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ArchiveEntry>, ArchiveError> {
        let request = PageRequest::new(page, page_size)?;
        let path = self.task_path(environment, task)?;
        let _guard = self.lock.lock();
        let Some(store) = self.open_existing(&path)? else {
            debug!(environment, task, "no task file; returning empty listing");
            return Ok(Page::empty(request));
        };
        let (timestamps, total_count) = store.list(request)?;
        let entries = timestamps
            .into_iter()
            .map(|timestamp| ArchiveEntry::new(environment, task, timestamp))
            .collect();
        Ok(Page::new(request, entries, total_count))
    }

    /// Remove one demonstration permanently.
    ///
    /// # Errors
    /// Returns [`ArchiveError::NotFound`] when the entry does not exist.
    pub fn delete(
        &self,
        environment: &str,
        task: &str,
        timestamp: &Timestamp,
    ) -> Result<(), ArchiveError> {
        let path = self.task_path(environment, task)?;
        let _guard = self.lock.lock();
        let mut store = self.open_existing(&path)?.ok_or_else(|| {
            ArchiveError::NotFound(format!("no demonstrations recorded for {environment}/{task}"))
        })?;
        if !store.delete(timestamp)? {
            return Err(ArchiveError::NotFound(format!("{environment}/{task}/{timestamp}")));
        }
        info!(environment, task, timestamp = %timestamp, "deleted demonstration");
        Ok(())
    }

    /// Number of stored demonstrations for one task; zero when nothing was recorded.
    ///
    /// # Errors
    /// Returns an error when the task file cannot be read.
    pub fn count(&self, environment: &str, task: &str) -> Result<usize, ArchiveError> {
        let path = self.task_path(environment, task)?;
        let _guard = self.lock.lock();
        match self.open_existing(&path)? {
            Some(store) => store.count(),
            None => Ok(0),
        }
    }

    /// Environments that have at least one task file, sorted by name.
    ///
    /// # Errors
    /// Returns an error when the root directory cannot be read.
    pub fn environments(&self) -> Result<Vec<String>, ArchiveError> {
        let _guard = self.lock.lock();
        let mut environments = Vec::new();
        for environment in list_dir_names(&self.config.root, |path| path.is_dir())? {
            if !task_file_names(&self.config.root.join(&environment))?.is_empty() {
                environments.push(environment);
            }
        }
        Ok(environments)
    }

    /// Tasks with a storage file under one environment, sorted by name.
    ///
    /// # Errors
    /// Returns an error when the environment directory cannot be read.
    pub fn tasks(&self, environment: &str) -> Result<Vec<String>, ArchiveError> {
        validate_identifier("environment", environment)?;
        let _guard = self.lock.lock();
        task_file_names(&self.config.root.join(environment))
    }

    /// Run storage health probes over one task file.
    ///
    /// # Errors
    /// Returns [`ArchiveError::NotFound`] when the task file does not exist.
    pub fn integrity_check(&self, environment: &str, task: &str) -> Result<IntegrityReport, ArchiveError> {
        let path = self.task_path(environment, task)?;
        let _guard = self.lock.lock();
        let store = self.open_existing(&path)?.ok_or_else(|| {
            ArchiveError::NotFound(format!("no demonstrations recorded for {environment}/{task}"))
        })?;
        store.integrity_check()
    }

    fn open_existing(&self, path: &Path) -> Result<Option<TaskStore>, ArchiveError> {
        if !path.is_file() {
            return Ok(None);
        }
        let store = TaskStore::open(path, self.config.busy_timeout_ms)?;
        if !store.has_schema()? {
            debug!(path = %path.display(), "task file has no schema yet; treating as empty");
            return Ok(None);
        }
        Ok(Some(store))
    }
}

fn timestamp_taken(tx: &Transaction<'_>, timestamp: &Timestamp) -> Result<bool, ArchiveError> {
    let found = tx
        .query_row(
            "SELECT 1 FROM demonstrations WHERE timestamp = ?1",
            params![timestamp.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .storage_context("failed to check timestamp")?;
    Ok(found.is_some())
}

fn task_file_names(dir: &Path) -> Result<Vec<String>, ArchiveError> {
    list_dir_names(dir, |path| {
        path.is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some(TASK_FILE_EXTENSION)
    })
    .map(|names| {
        names
            .into_iter()
            .filter_map(|name| {
                name.strip_suffix(&format!(".{TASK_FILE_EXTENSION}")).map(str::to_string)
            })
            .collect()
    })
}

fn list_dir_names<F>(dir: &Path, keep: F) -> Result<Vec<String>, ArchiveError>
where
    F: Fn(&Path) -> bool,
{
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir)
        .with_storage_context(|| format!("failed to read directory {}", dir.display()))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry =
            entry.with_storage_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if !keep(&path) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn now_rfc3339() -> Result<String, ArchiveError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .storage_context("failed to format RFC3339 timestamp")
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn to_i64(value: usize) -> Result<i64, ArchiveError> {
    i64::try_from(value).storage_context("value does not fit in a sqlite integer")
}

fn to_usize(value: i64) -> Result<usize, ArchiveError> {
    usize::try_from(value).storage_context("stored integer is negative or too large")
}

fn error_chain(err: &ArchiveError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}
