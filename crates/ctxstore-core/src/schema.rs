// ============================================================================
// Context Storage Core - Context Schema
// File: crates/ctxstore-core/src/schema.rs
// Description: Per-field read/write orchestration over a storage driver
// ============================================================================
//! Context schema: one [`FieldConfig`] per logical field plus the policy
//! logic that turns a [`Context`] into driver calls and back.
//!
//! Reads fetch only what each field's subscript selects and record a content
//! hash for every entry of a `hash_update` field. Writes compare against
//! those hashes so unchanged entries are never rewritten.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ctxstore_shared::config::{FieldSettings, KeySetting, StorageSettings, SubscriptSetting};
use futures::future::try_join_all;
use tracing::debug;

use crate::domain::{
    next_timestamp, Context, FieldConfig, FieldKey, FieldKind, FieldName, MainInfo, ReadPolicy,
    Subscript, SyncState, WritePolicy,
};
use crate::error::{StorageError, StorageResult};
use crate::repositories::{DbDriver, FieldItems};
use crate::serializer::{content_hash, JsonSerializer, Serializer};

pub use crate::domain::{Baseline, KnownKeys};

/// What a write actually sent to the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub main_updated: bool,
    pub written: BTreeMap<FieldName, usize>,
    pub deleted: BTreeMap<FieldName, usize>,
}

impl WriteReport {
    pub fn written(&self, field: FieldName) -> usize {
        self.written.get(&field).copied().unwrap_or(0)
    }

    pub fn deleted(&self, field: FieldName) -> usize {
        self.deleted.get(&field).copied().unwrap_or(0)
    }

    pub fn total_written(&self) -> usize {
        self.written.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct ContextSchema {
    fields: BTreeMap<FieldName, FieldConfig>,
    framework_data: WritePolicy,
    serializer: Arc<dyn Serializer>,
}

impl Default for ContextSchema {
    fn default() -> Self {
        Self::new(Arc::new(JsonSerializer))
    }
}

impl ContextSchema {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        let fields = FieldName::ALL
            .iter()
            .map(|name| (*name, FieldConfig::new(*name)))
            .collect();
        Self {
            fields,
            framework_data: WritePolicy::Update,
            serializer,
        }
    }

    /// Build and validate a schema from raw settings.
    pub fn from_settings(settings: &StorageSettings) -> StorageResult<Self> {
        let mut schema = Self::default();
        for (name, field) in &settings.fields {
            let name = FieldName::from_str(name).ok_or_else(|| {
                StorageError::invalid_config(format!(
                    "unknown field '{}', expected one of: labels, requests, responses, misc",
                    name
                ))
            })?;
            schema = schema.with_field(field_config(name, field)?)?;
        }
        if let Some(write) = &settings.framework_data.write {
            schema = schema.with_framework_data(parse_write_policy("framework_data", write)?)?;
        }
        Ok(schema)
    }

    pub fn with_field(mut self, config: FieldConfig) -> StorageResult<Self> {
        config.validate()?;
        self.fields.insert(config.name(), config);
        Ok(self)
    }

    pub fn with_framework_data(mut self, policy: WritePolicy) -> StorageResult<Self> {
        match policy {
            WritePolicy::Update | WritePolicy::Ignore | WritePolicy::UpdateOnce => {
                self.framework_data = policy;
                Ok(self)
            }
            other => Err(StorageError::invalid_config(format!(
                "framework_data is a scalar field, write policy '{}' is not applicable",
                other.as_str()
            ))),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn field(&self, name: FieldName) -> &FieldConfig {
        &self.fields[&name]
    }

    pub fn framework_data_policy(&self) -> WritePolicy {
        self.framework_data
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    fn is_active(config: &FieldConfig) -> bool {
        config.read != ReadPolicy::Ignore || config.write != WritePolicy::Ignore
    }

    /// Keys stored for every active turn field.
    pub async fn load_known_keys(&self, driver: &dyn DbDriver, id: &str) -> StorageResult<KnownKeys> {
        let mut known = KnownKeys::new();
        for config in self.fields.values() {
            if config.name().kind() == FieldKind::Turn && Self::is_active(config) {
                known.set(config.name(), driver.load_field_keys(id, config.name()).await?);
            }
        }
        Ok(known)
    }

    /// Adopt the stored counterpart of a context that was never read.
    ///
    /// Afterwards the context writes as if it had been read first: the
    /// stored `created_at` is kept, stored entries count as known, and
    /// hashed fields only rewrite entries whose content differs. Nothing
    /// is loaded into the caller's maps and nothing is scheduled for
    /// deletion.
    pub async fn attach_stored(&self, driver: &dyn DbDriver, ctx: &mut Context) -> StorageResult<()> {
        let Some(main) = driver.load_main_info(&ctx.id).await? else {
            return Ok(());
        };

        let mut known = self.load_known_keys(driver, &ctx.id).await?;
        let mut baseline = Baseline::new();
        for config in self.fields.values() {
            let name = config.name();
            if !Self::is_active(config) {
                continue;
            }
            if name.kind() == FieldKind::Keyed {
                known.extend(name, driver.load_field_keys(&ctx.id, name).await?);
            }
            if !matches!(config.write, WritePolicy::HashUpdate | WritePolicy::UpdateOnce) {
                continue;
            }
            let overlap: BTreeSet<FieldKey> = known
                .get(name)
                .intersection(&ctx.field_keys(name))
                .cloned()
                .collect();
            if overlap.is_empty() {
                continue;
            }
            for (key, bytes) in driver.load_field_items(&ctx.id, name, &overlap).await? {
                baseline.insert(name, key, content_hash(&bytes));
            }
        }

        debug!(
            "Context {} already stored in {}, keeping created_at {}",
            ctx.id,
            driver.backend(),
            main.created_at
        );
        ctx.created_at = main.created_at;
        ctx.updated_at = ctx.updated_at.max(main.updated_at);
        ctx.current_turn_id = ctx.current_turn_id.max(main.current_turn_id);
        ctx.sync = SyncState {
            stored: Some(main),
            known_keys: known,
            loaded: KnownKeys::new(),
            baseline,
        };
        Ok(())
    }

    /// Materialise a context.
    ///
    /// Returns a fresh, unpersisted context when `id` has no MAIN record.
    pub async fn read(
        &self,
        driver: &dyn DbDriver,
        known_keys: &KnownKeys,
        id: &str,
    ) -> StorageResult<(Context, Baseline)> {
        let Some(main) = driver.load_main_info(id).await? else {
            debug!("Context {} not found in {}, starting empty", id, driver.backend());
            return Ok((Context::new(id), Baseline::new()));
        };

        let mut ctx = Context::new(id);
        ctx.current_turn_id = main.current_turn_id;
        ctx.created_at = main.created_at;
        ctx.updated_at = main.updated_at;
        ctx.framework_data = self.serializer.decode(&main.framework_data)?;

        let mut known = known_keys.clone();
        let mut loaded = KnownKeys::new();
        let mut baseline = Baseline::new();

        for config in self.fields.values() {
            let name = config.name();
            if name.kind() == FieldKind::Keyed && Self::is_active(config) {
                let reported = driver.load_field_keys(id, name).await?;
                known.extend(name, reported);
            }
            if config.read == ReadPolicy::Ignore {
                continue;
            }

            let items = self.fetch_field(driver, id, config, &known).await?;
            let tracks_hash = matches!(config.write, WritePolicy::HashUpdate | WritePolicy::UpdateOnce);
            for (key, bytes) in items {
                if tracks_hash {
                    baseline.insert(name, key.clone(), content_hash(&bytes));
                }
                let value = self.serializer.decode(&bytes)?;
                known.insert(name, key.clone());
                loaded.insert(name, key.clone());
                ctx.insert_field(name, key, value)?;
            }
        }

        debug!(
            "Read context {} from {} (turn {})",
            id,
            driver.backend(),
            ctx.current_turn_id
        );
        ctx.sync = SyncState {
            stored: Some(main),
            known_keys: known,
            loaded,
            baseline: baseline.clone(),
        };
        Ok((ctx, baseline))
    }

    async fn fetch_field(
        &self,
        driver: &dyn DbDriver,
        id: &str,
        config: &FieldConfig,
        known: &KnownKeys,
    ) -> StorageResult<FieldItems> {
        let name = config.name();
        if let (FieldKind::Turn, Subscript::Last(n)) = (name.kind(), &config.subscript) {
            if *n == 0 {
                return Ok(Vec::new());
            }
            return driver.load_field_latest(id, name, Some(*n)).await;
        }
        let keys = config.subscript.select(known.get(name));
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        driver.load_field_items(id, name, &keys).await
    }

    /// Persist a context, writing only what the field policies demand.
    ///
    /// The MAIN record is always upserted so timestamps stay consistent,
    /// even when no field entry changed.
    pub async fn write(
        &self,
        driver: &dyn DbDriver,
        ctx: &mut Context,
        baseline: &Baseline,
        known_keys: &KnownKeys,
    ) -> StorageResult<WriteReport> {
        let stored = ctx.sync.stored.clone();

        let now = next_timestamp(ctx.updated_at);
        ctx.updated_at = now;
        if stored.is_none() {
            ctx.created_at = now;
        }
        let next_turn = ctx.max_turn_key().map_or(0, |k| k + 1);
        ctx.current_turn_id = ctx.current_turn_id.max(next_turn);

        let framework_data = match (&stored, self.framework_data) {
            (Some(stored), WritePolicy::Ignore | WritePolicy::UpdateOnce) => {
                stored.framework_data.clone()
            }
            _ => self.serializer.encode(&ctx.framework_data)?,
        };
        let main = MainInfo {
            current_turn_id: ctx.current_turn_id,
            created_at: ctx.created_at,
            updated_at: ctx.updated_at,
            framework_data,
        };

        let mut patch: BTreeMap<FieldName, Vec<(FieldKey, Option<Vec<u8>>)>> = BTreeMap::new();
        let mut hashes = baseline.clone();
        for config in self.fields.values() {
            let items = self.field_patch(ctx, config, baseline, known_keys, &mut hashes)?;
            if !items.is_empty() {
                patch.insert(config.name(), items);
            }
        }

        driver.update_main_info(&ctx.id, &main).await?;
        try_join_all(
            patch
                .iter()
                .map(|(field, items)| driver.update_field_items(&ctx.id, *field, items)),
        )
        .await?;

        let mut report = WriteReport {
            main_updated: true,
            ..WriteReport::default()
        };
        let mut known = known_keys.clone();
        let mut loaded = ctx.sync.loaded.clone();
        for (field, items) in &patch {
            for (key, value) in items {
                if value.is_some() {
                    *report.written.entry(*field).or_default() += 1;
                    known.insert(*field, key.clone());
                    loaded.insert(*field, key.clone());
                } else {
                    *report.deleted.entry(*field).or_default() += 1;
                    known.remove(*field, key);
                    loaded.remove(*field, key);
                    hashes.remove(*field, key);
                }
            }
        }

        debug!(
            "Wrote context {} to {}: {} entries written, {} deleted",
            ctx.id,
            driver.backend(),
            report.total_written(),
            report.deleted.values().sum::<usize>()
        );
        ctx.sync = SyncState {
            stored: Some(main),
            known_keys: known,
            loaded,
            baseline: hashes,
        };
        Ok(report)
    }

    fn field_patch(
        &self,
        ctx: &Context,
        config: &FieldConfig,
        baseline: &Baseline,
        known_keys: &KnownKeys,
        hashes: &mut Baseline,
    ) -> StorageResult<Vec<(FieldKey, Option<Vec<u8>>)>> {
        let name = config.name();
        let in_memory = ctx.field_keys(name);
        let known = known_keys.get(name);
        let selected = config.subscript.select(&in_memory);

        let mut items = Vec::new();
        let candidates: BTreeSet<FieldKey> = match config.write {
            WritePolicy::Ignore => return Ok(items),
            WritePolicy::Append => selected.difference(known).cloned().collect(),
            WritePolicy::Update => selected,
            WritePolicy::UpdateOnce => selected
                .into_iter()
                .filter(|k| !known.contains(k) && !baseline.contains(name, k))
                .collect(),
            WritePolicy::HashUpdate => selected
                .union(&known.intersection(&in_memory).cloned().collect())
                .cloned()
                .collect(),
        };

        for key in candidates {
            let Some(value) = ctx.field_value(name, &key) else {
                continue;
            };
            let bytes = self.serializer.encode(value)?;
            match config.write {
                WritePolicy::HashUpdate => {
                    let hash = content_hash(&bytes);
                    if baseline.get(name, &key) == Some(hash.as_str()) {
                        continue;
                    }
                    hashes.insert(name, key.clone(), hash);
                }
                WritePolicy::UpdateOnce => {
                    hashes.insert(name, key.clone(), content_hash(&bytes));
                }
                _ => {}
            }
            items.push((key, Some(bytes)));
        }

        if matches!(config.write, WritePolicy::Update | WritePolicy::HashUpdate) {
            for key in ctx.sync.loaded.get(name).difference(&in_memory) {
                items.push((key.clone(), None));
            }
        }
        Ok(items)
    }
}

fn field_config(name: FieldName, settings: &FieldSettings) -> StorageResult<FieldConfig> {
    let mut config = FieldConfig::new(name);
    if let Some(subscript) = &settings.subscript {
        config = config.with_subscript(parse_subscript(name, subscript)?)?;
    }
    if let Some(read) = &settings.read {
        let policy = ReadPolicy::from_str(read).ok_or_else(|| {
            StorageError::invalid_config(format!("unknown read policy '{}' for field '{}'", read, name))
        })?;
        config = config.with_read(policy);
    }
    if let Some(write) = &settings.write {
        config = config.with_write(parse_write_policy(name.as_str(), write)?);
    }
    Ok(config)
}

fn parse_write_policy(field: &str, raw: &str) -> StorageResult<WritePolicy> {
    WritePolicy::from_str(raw).ok_or_else(|| {
        StorageError::invalid_config(format!("unknown write policy '{}' for field '{}'", raw, field))
    })
}

fn parse_subscript(name: FieldName, setting: &SubscriptSetting) -> StorageResult<Subscript> {
    match setting {
        SubscriptSetting::Count(n) => Ok(Subscript::from_count(*n)),
        SubscriptSetting::Keyword(word) if word == "all" || word == "__all__" => Ok(Subscript::All),
        SubscriptSetting::Keyword(word) => Err(StorageError::invalid_config(format!(
            "malformed subscript '{}' for field '{}'",
            word, name
        ))),
        SubscriptSetting::Keys(keys) => keys
            .iter()
            .map(|key| match (name.kind(), key) {
                (FieldKind::Turn, KeySetting::Turn(k)) => Ok(FieldKey::Turn(*k)),
                (FieldKind::Turn, KeySetting::Name(k)) => k.parse().map(FieldKey::Turn).map_err(|_| {
                    StorageError::invalid_config(format!(
                        "key '{}' is not a turn index for field '{}'",
                        k, name
                    ))
                }),
                (FieldKind::Keyed, KeySetting::Turn(k)) => Ok(FieldKey::Name(k.to_string())),
                (FieldKind::Keyed, KeySetting::Name(k)) => Ok(FieldKey::Name(k.clone())),
            })
            .collect::<StorageResult<BTreeSet<_>>>()
            .map(Subscript::Keys),
    }
}
