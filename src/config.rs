use crate::bucket::validate_bucket_count;
use crate::codec::Codec;
use crate::error::CfmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Default limit on serialized bytes read by one processing pass (4 MiB).
pub const DEFAULT_BUFFER_SIZE: u64 = 1 << 22;

const MAP_PREFIX: &str = "recipes.cfm.";
const QUEUE_PREFIX: &str = "recipes.exportQueue.";

/// Application properties persisted alongside the store's own metadata.
///
/// Map and queue options are saved here when configured so that a restarted
/// process can rebuild identical instances from the id alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    properties: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.properties.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub fn require(&self, key: &str) -> Result<&str, CfmError> {
        self.get(key)
            .ok_or_else(|| CfmError::invalid_config(format!("missing property '{key}'")))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, CfmError> {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<u64>().map_err(|e| {
                    CfmError::invalid_config(format!("property '{key}'='{raw}': {e}"))
                })
            })
            .transpose()
    }

    pub fn require_i64(&self, key: &str) -> Result<i64, CfmError> {
        let raw = self.require(key)?;
        raw.trim()
            .parse::<i64>()
            .map_err(|e| CfmError::invalid_config(format!("property '{key}'='{raw}': {e}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn load_json(path: &Path) -> Result<Self, CfmError> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| CfmError::Decode(e.to_string()))
    }

    /// Writes to a fresh temp file in the same directory, syncs it and
    /// persists it over `path`, then syncs the directory.
    pub fn save_json(&self, path: &Path) -> Result<(), CfmError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|e| CfmError::Encode(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CfmError::Io(e.error))?;
        fsync_dir(dir)
    }
}

fn fsync_dir(path: &Path) -> Result<(), CfmError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

fn check_id(kind: &str, id: &str) -> Result<(), CfmError> {
    if id.is_empty() || id.contains(':') {
        return Err(CfmError::invalid_config(format!(
            "{kind} id must be non-empty and must not contain ':', got '{id}'"
        )));
    }
    Ok(())
}

fn check_buffer_size(buffer_size: u64) -> Result<u64, CfmError> {
    if buffer_size == 0 {
        return Err(CfmError::invalid_config("buffer size must be positive"));
    }
    Ok(buffer_size)
}

fn check_type(configured: &str, actual: &'static str) -> Result<(), CfmError> {
    if configured != actual {
        return Err(CfmError::CodecMismatch {
            expected: configured.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Options of one collision-free map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    pub map_id: String,
    pub buckets: u32,
    pub combiner: String,
    pub update_observer: Option<String>,
    pub key_type: String,
    pub value_type: String,
    pub key_codec: Codec,
    pub value_codec: Codec,
    buffer_size: Option<u64>,
}

impl MapOptions {
    pub fn new<K, V>(
        map_id: impl Into<String>,
        combiner: impl Into<String>,
        buckets: i64,
    ) -> Result<Self, CfmError> {
        let map_id = map_id.into();
        check_id("map", &map_id)?;
        Ok(Self {
            map_id,
            buckets: validate_bucket_count(buckets)?,
            combiner: combiner.into(),
            update_observer: None,
            key_type: std::any::type_name::<K>().to_string(),
            value_type: std::any::type_name::<V>().to_string(),
            key_codec: Codec::default(),
            value_codec: Codec::default(),
            buffer_size: None,
        })
    }

    pub fn with_update_observer(mut self, update_observer: impl Into<String>) -> Self {
        self.update_observer = Some(update_observer.into());
        self
    }

    /// Limits the serialized bytes (keys once per key, plus values) a single
    /// processing pass reads. Work left over is picked up by a later pass.
    pub fn with_buffer_size(mut self, buffer_size: u64) -> Result<Self, CfmError> {
        self.buffer_size = Some(check_buffer_size(buffer_size)?);
        Ok(self)
    }

    pub fn with_codecs(mut self, key_codec: Codec, value_codec: Codec) -> Self {
        self.key_codec = key_codec;
        self.value_codec = value_codec;
        self
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    pub fn check_types<K, V>(&self) -> Result<(), CfmError> {
        check_type(&self.key_type, std::any::type_name::<K>())?;
        check_type(&self.value_type, std::any::type_name::<V>())
    }

    fn key(map_id: &str, name: &str) -> String {
        format!("{MAP_PREFIX}{map_id}.{name}")
    }

    pub fn save(&self, app_config: &mut AppConfig) {
        let id = &self.map_id;
        app_config.set(Self::key(id, "buckets"), self.buckets);
        app_config.set(Self::key(id, "combiner"), &self.combiner);
        app_config.set(Self::key(id, "key_type"), &self.key_type);
        app_config.set(Self::key(id, "value_type"), &self.value_type);
        app_config.set(Self::key(id, "key_codec"), self.key_codec.id());
        app_config.set(Self::key(id, "value_codec"), self.value_codec.id());
        match &self.update_observer {
            Some(observer) => app_config.set(Self::key(id, "update_observer"), observer),
            None => {
                app_config.remove(&Self::key(id, "update_observer"));
            }
        }
        match self.buffer_size {
            Some(size) => app_config.set(Self::key(id, "buffer_size"), size),
            None => {
                app_config.remove(&Self::key(id, "buffer_size"));
            }
        }
    }

    pub fn load(map_id: &str, app_config: &AppConfig) -> Result<Self, CfmError> {
        check_id("map", map_id)?;
        let buckets = validate_bucket_count(app_config.require_i64(&Self::key(map_id, "buckets"))?)?;
        let buffer_size = app_config
            .get_u64(&Self::key(map_id, "buffer_size"))?
            .map(check_buffer_size)
            .transpose()?;
        Ok(Self {
            map_id: map_id.to_string(),
            buckets,
            combiner: app_config.require(&Self::key(map_id, "combiner"))?.to_string(),
            update_observer: app_config
                .get(&Self::key(map_id, "update_observer"))
                .map(str::to_string),
            key_type: app_config.require(&Self::key(map_id, "key_type"))?.to_string(),
            value_type: app_config.require(&Self::key(map_id, "value_type"))?.to_string(),
            key_codec: Codec::from_id(app_config.require(&Self::key(map_id, "key_codec"))?)?,
            value_codec: Codec::from_id(app_config.require(&Self::key(map_id, "value_codec"))?)?,
            buffer_size,
        })
    }
}

/// Options of one export queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub queue_id: String,
    pub buckets: u32,
    pub exporter: String,
    pub key_type: String,
    pub value_type: String,
    pub key_codec: Codec,
    pub value_codec: Codec,
    buffer_size: Option<u64>,
}

impl QueueOptions {
    pub fn new<K, V>(
        queue_id: impl Into<String>,
        exporter: impl Into<String>,
        buckets: i64,
    ) -> Result<Self, CfmError> {
        let queue_id = queue_id.into();
        check_id("queue", &queue_id)?;
        Ok(Self {
            queue_id,
            buckets: validate_bucket_count(buckets)?,
            exporter: exporter.into(),
            key_type: std::any::type_name::<K>().to_string(),
            value_type: std::any::type_name::<V>().to_string(),
            key_codec: Codec::default(),
            value_codec: Codec::default(),
            buffer_size: None,
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: u64) -> Result<Self, CfmError> {
        self.buffer_size = Some(check_buffer_size(buffer_size)?);
        Ok(self)
    }

    pub fn with_codecs(mut self, key_codec: Codec, value_codec: Codec) -> Self {
        self.key_codec = key_codec;
        self.value_codec = value_codec;
        self
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    pub fn check_types<K, V>(&self) -> Result<(), CfmError> {
        check_type(&self.key_type, std::any::type_name::<K>())?;
        check_type(&self.value_type, std::any::type_name::<V>())
    }

    fn key(queue_id: &str, name: &str) -> String {
        format!("{QUEUE_PREFIX}{queue_id}.{name}")
    }

    pub fn save(&self, app_config: &mut AppConfig) {
        let id = &self.queue_id;
        app_config.set(Self::key(id, "buckets"), self.buckets);
        app_config.set(Self::key(id, "exporter"), &self.exporter);
        app_config.set(Self::key(id, "key_type"), &self.key_type);
        app_config.set(Self::key(id, "value_type"), &self.value_type);
        app_config.set(Self::key(id, "key_codec"), self.key_codec.id());
        app_config.set(Self::key(id, "value_codec"), self.value_codec.id());
        match self.buffer_size {
            Some(size) => app_config.set(Self::key(id, "buffer_size"), size),
            None => {
                app_config.remove(&Self::key(id, "buffer_size"));
            }
        }
    }

    pub fn load(queue_id: &str, app_config: &AppConfig) -> Result<Self, CfmError> {
        check_id("queue", queue_id)?;
        let buckets =
            validate_bucket_count(app_config.require_i64(&Self::key(queue_id, "buckets"))?)?;
        let buffer_size = app_config
            .get_u64(&Self::key(queue_id, "buffer_size"))?
            .map(check_buffer_size)
            .transpose()?;
        Ok(Self {
            queue_id: queue_id.to_string(),
            buckets,
            exporter: app_config.require(&Self::key(queue_id, "exporter"))?.to_string(),
            key_type: app_config.require(&Self::key(queue_id, "key_type"))?.to_string(),
            value_type: app_config.require(&Self::key(queue_id, "value_type"))?.to_string(),
            key_codec: Codec::from_id(app_config.require(&Self::key(queue_id, "key_codec"))?)?,
            value_codec: Codec::from_id(app_config.require(&Self::key(queue_id, "value_codec"))?)?,
            buffer_size,
        })
    }
}

/// Runtime configuration for a [`crate::storage::memory::MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStoreConfig {
    /// Times a conflicting transaction is re-run before the conflict is surfaced.
    pub max_commit_retries: usize,
    /// Upper bound on delivery rounds of one `process_notifications` call.
    pub max_notification_rounds: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 16,
            max_notification_rounds: 100_000,
        }
    }
}

impl MemoryStoreConfig {
    /// Surfaces every conflict to the caller instead of retrying.
    pub fn no_retry() -> Self {
        Self {
            max_commit_retries: 0,
            ..Self::default()
        }
    }

    /// Many retries for heavily contended multi-threaded workloads.
    pub fn contended() -> Self {
        Self {
            max_commit_retries: 1_000,
            ..Self::default()
        }
    }
}
