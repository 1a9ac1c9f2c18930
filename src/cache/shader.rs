//! Shader Cache
//!
//! Caches the result of building a shader combination: the generated source
//! code and the compiled native shader. Keyed by the shader combination ID
//! derived in [`super::signature`].
//!
//! Different property combinations frequently collapse to byte-identical
//! generated source (a property only gates a piece that was not inserted, a
//! `@property` branch that evaluated the same way, ...). The manager hashes
//! every generated source and redirects later combinations to the first
//! *master* cache that produced it, so identical source is compiled exactly
//! once per process.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::asset::{AssetId, ShaderBlueprintResourceId};
use crate::blueprint::ShaderRepository;
use crate::builder::ShaderBuilder;
use crate::cache::signature::{
    ComputePipelineStateSignature, GraphicsPipelineStateSignature, ShaderCombinationId,
};
use crate::error::{CrucibleError, Result};
use crate::hash::Fnv1a64;
use crate::persist::{BlobReader, BlobWriter};
use crate::properties::ShaderProperties;
use crate::rhi::{ShaderHandle, ShaderLanguage, ShaderStage};

const SHADER_CACHE_MAGIC: [u8; 4] = *b"CSHC";

/// xxh3 hash of one built shader's final source code. The master redirect key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderSourceCodeId(pub u64);

/// One cached shader combination: the built source identity plus the compiled
/// native shader.
///
/// A redirected entry shares its master's native handle; it still records its
/// own combination ID and asset dependencies so hot reload invalidation can
/// reason about it independently.
#[derive(Debug)]
pub struct ShaderCache {
    shader_cache_id: ShaderCombinationId,
    shader_blueprint_resource_id: ShaderBlueprintResourceId,
    stage: ShaderStage,
    source_code_id: ShaderSourceCodeId,
    /// Combination this entry redirects to, `None` for a master.
    master_shader_cache_id: Option<ShaderCombinationId>,
    shader: ShaderHandle,
    bytecode: Vec<u8>,
    /// Blueprint and piece assets the generated source depends on.
    asset_ids: SmallVec<[AssetId; 8]>,
    /// Rolling hash over the contributing assets' file hashes at build time.
    /// Persisted entries whose assets changed on disk are detected through it.
    combined_asset_file_hash: u64,
}

impl ShaderCache {
    #[inline]
    #[must_use]
    pub fn shader_cache_id(&self) -> ShaderCombinationId {
        self.shader_cache_id
    }

    #[inline]
    #[must_use]
    pub fn shader_blueprint_resource_id(&self) -> ShaderBlueprintResourceId {
        self.shader_blueprint_resource_id
    }

    #[inline]
    #[must_use]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    #[must_use]
    pub fn source_code_id(&self) -> ShaderSourceCodeId {
        self.source_code_id
    }

    /// Whether this entry owns its compile or shares a master's.
    #[inline]
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.master_shader_cache_id.is_none()
    }

    /// The combination that owns the actual compile: the master's ID for a
    /// redirected entry, this entry's own ID otherwise. Program caching folds
    /// this, so redirected combinations share their master's linked programs.
    #[inline]
    #[must_use]
    pub fn effective_shader_cache_id(&self) -> ShaderCombinationId {
        self.master_shader_cache_id.unwrap_or(self.shader_cache_id)
    }

    #[inline]
    #[must_use]
    pub fn shader(&self) -> &ShaderHandle {
        &self.shader
    }

    #[must_use]
    pub fn depends_on_asset(&self, asset_id: AssetId) -> bool {
        self.asset_ids.contains(&asset_id)
    }

    #[inline]
    #[must_use]
    pub fn combined_asset_file_hash(&self) -> u64 {
        self.combined_asset_file_hash
    }
}

/// Process-global owner of all [`ShaderCache`] entries.
#[derive(Default)]
pub struct ShaderCacheManager {
    caches: RwLock<FxHashMap<ShaderCombinationId, Arc<ShaderCache>>>,
    /// Source-code hash to master combination, for redirect dedup.
    masters_by_source: RwLock<FxHashMap<ShaderSourceCodeId, ShaderCombinationId>>,
}

impl ShaderCacheManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shader cache for one graphics stage of a signature.
    ///
    /// `Ok(None)` when the material blueprint has no shader for that stage.
    /// On a miss this builds the stage's source code and either redirects to
    /// an existing master with identical source or compiles a new master.
    pub fn get_graphics_shader_cache(
        &self,
        repository: &ShaderRepository,
        shader_language: &dyn ShaderLanguage,
        signature: &GraphicsPipelineStateSignature,
        stage: ShaderStage,
    ) -> Result<Option<Arc<ShaderCache>>> {
        let Some(combination_id) = signature.shader_combination_id(stage) else {
            return Ok(None);
        };
        let blueprint_id = repository
            .material_blueprint(signature.material_blueprint_resource_id())
            .ok_or(CrucibleError::MaterialBlueprintNotFound(
                signature.material_blueprint_resource_id(),
            ))?
            .graphics_shader_blueprint(stage)
            .ok_or(CrucibleError::NoShaderStages)?;
        self.get_shader_cache(
            repository,
            shader_language,
            blueprint_id,
            combination_id,
            stage,
            signature.shader_properties(),
        )
        .map(Some)
    }

    /// Shader cache for a compute signature. `Ok(None)` when the material
    /// blueprint is graphics-only.
    pub fn get_compute_shader_cache(
        &self,
        repository: &ShaderRepository,
        shader_language: &dyn ShaderLanguage,
        signature: &ComputePipelineStateSignature,
    ) -> Result<Option<Arc<ShaderCache>>> {
        let Some(combination_id) = signature.shader_combination_id() else {
            return Ok(None);
        };
        let blueprint_id = repository
            .material_blueprint(signature.material_blueprint_resource_id())
            .ok_or(CrucibleError::MaterialBlueprintNotFound(
                signature.material_blueprint_resource_id(),
            ))?
            .compute_shader_blueprint()
            .ok_or(CrucibleError::NoShaderStages)?;
        self.get_shader_cache(
            repository,
            shader_language,
            blueprint_id,
            combination_id,
            ShaderStage::Compute,
            signature.shader_properties(),
        )
        .map(Some)
    }

    fn get_shader_cache(
        &self,
        repository: &ShaderRepository,
        shader_language: &dyn ShaderLanguage,
        blueprint_id: ShaderBlueprintResourceId,
        combination_id: ShaderCombinationId,
        stage: ShaderStage,
        properties: &ShaderProperties,
    ) -> Result<Arc<ShaderCache>> {
        if let Some(cache) = self.caches.read().get(&combination_id) {
            debug_assert_eq!(cache.shader_blueprint_resource_id, blueprint_id);
            return Ok(Arc::clone(cache));
        }

        // Build and compile outside the lock; a lost race below just means
        // the other thread's identical entry wins.
        let blueprint = repository
            .shader_blueprint(blueprint_id)
            .ok_or(CrucibleError::ShaderBlueprintNotFound(blueprint_id))?;
        let pieces = repository.shader_pieces_for_blueprint(&blueprint)?;
        let built = ShaderBuilder::new().build(&blueprint, &pieces, properties)?;
        let source_code_id = ShaderSourceCodeId(xxh3_64(built.source_code.as_bytes()));

        // Copy the master ID out before touching `caches`; lock order is
        // always `caches` before `masters_by_source`.
        let master_id = self.masters_by_source.read().get(&source_code_id).copied();
        let master = master_id.and_then(|id| self.caches.read().get(&id).cloned());

        let cache = if let Some(master) = master {
            log::trace!(
                "shader cache {combination_id:?}: redirecting to master {:?}",
                master.shader_cache_id
            );
            Arc::new(ShaderCache {
                shader_cache_id: combination_id,
                shader_blueprint_resource_id: blueprint_id,
                stage,
                source_code_id,
                master_shader_cache_id: Some(master.shader_cache_id),
                shader: Arc::clone(&master.shader),
                bytecode: Vec::new(),
                asset_ids: built.asset_ids,
                combined_asset_file_hash: built.combined_asset_file_hash,
            })
        } else {
            log::debug!("shader cache {combination_id:?}: compiling {stage:?} shader");
            let compiled = shader_language.create_shader_from_source_code(stage, &built.source_code)?;
            Arc::new(ShaderCache {
                shader_cache_id: combination_id,
                shader_blueprint_resource_id: blueprint_id,
                stage,
                source_code_id,
                master_shader_cache_id: None,
                shader: compiled.handle,
                bytecode: compiled.bytecode,
                asset_ids: built.asset_ids,
                combined_asset_file_hash: built.combined_asset_file_hash,
            })
        };

        let mut caches = self.caches.write();
        match caches.entry(combination_id) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                if cache.is_master() {
                    self.masters_by_source
                        .write()
                        .entry(source_code_id)
                        .or_insert(combination_id);
                }
                Ok(Arc::clone(slot.insert(cache)))
            }
        }
    }

    /// Number of cached combinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    /// Drop every cache generated from the given shader blueprint.
    ///
    /// Returns the removed combination IDs so callers can invalidate the
    /// caches layered above. Redirect entries of unaffected blueprints keep
    /// their shared native handle; only the source-hash index entry of a
    /// removed master goes away, so the next identical source compiles fresh.
    pub fn invalidate_shader_blueprint(
        &self,
        blueprint_id: ShaderBlueprintResourceId,
    ) -> Vec<ShaderCombinationId> {
        let mut caches = self.caches.write();
        let removed: Vec<ShaderCombinationId> = caches
            .values()
            .filter(|cache| cache.shader_blueprint_resource_id == blueprint_id)
            .map(|cache| cache.shader_cache_id)
            .collect();
        for id in &removed {
            caches.remove(id);
        }
        if !removed.is_empty() {
            self.masters_by_source
                .write()
                .retain(|_, master_id| !removed.contains(master_id));
            log::debug!(
                "invalidated {} shader cache(s) of blueprint {blueprint_id:?}",
                removed.len()
            );
        }
        removed
    }

    pub fn clear(&self) {
        self.caches.write().clear();
        self.masters_by_source.write().clear();
    }

    /// Serialize every master cache that has backend bytecode.
    ///
    /// Redirect entries are not persisted; they are cheap to rebuild and
    /// their master may not survive a reload anyway.
    pub fn save_cache(
        &self,
        shader_language: &dyn ShaderLanguage,
        writer: &mut dyn std::io::Write,
    ) -> Result<()> {
        let caches = self.caches.read();
        let masters: Vec<&Arc<ShaderCache>> = caches
            .values()
            .filter(|cache| cache.is_master() && !cache.bytecode.is_empty())
            .collect();

        let mut writer = BlobWriter::new(writer);
        writer.write_header(SHADER_CACHE_MAGIC, shader_language.name())?;
        writer.write_u32(masters.len() as u32)?;
        for cache in masters {
            writer.write_u32(cache.shader_cache_id.0)?;
            writer.write_u32(cache.shader_blueprint_resource_id.0)?;
            writer.write_u8(stage_to_u8(cache.stage))?;
            writer.write_u64(cache.source_code_id.0)?;
            writer.write_u64(cache.combined_asset_file_hash)?;
            writer.write_u32(cache.asset_ids.len() as u32)?;
            for asset_id in &cache.asset_ids {
                writer.write_u32(asset_id.0)?;
            }
            writer.write_bytes(&cache.bytecode)?;
        }
        Ok(())
    }

    /// Restore persisted master caches by re-creating shaders from bytecode.
    ///
    /// Returns the number of restored entries; zero with a stale header. A
    /// record is skipped, not fatal, when its bytecode is rejected by the
    /// backend or its contributing assets changed on disk since it was saved
    /// (detected by the combined asset file hash) — it will be rebuilt from
    /// the current source on first use.
    pub fn load_cache(
        &self,
        repository: &ShaderRepository,
        shader_language: &dyn ShaderLanguage,
        reader: &mut dyn std::io::Read,
    ) -> Result<usize> {
        let mut reader = BlobReader::new(reader);
        if !reader.read_header(SHADER_CACHE_MAGIC, shader_language.name())? {
            log::info!("shader cache blob is stale, rebuilding from scratch");
            return Ok(0);
        }

        let count = reader.read_u32()?;
        let mut restored = 0;
        for _ in 0..count {
            let shader_cache_id = ShaderCombinationId(reader.read_u32()?);
            let shader_blueprint_resource_id = ShaderBlueprintResourceId(reader.read_u32()?);
            let stage = stage_from_u8(reader.read_u8()?)?;
            let source_code_id = ShaderSourceCodeId(reader.read_u64()?);
            let combined_asset_file_hash = reader.read_u64()?;
            let asset_count = reader.read_u32()?;
            let mut asset_ids = SmallVec::with_capacity(asset_count as usize);
            for _ in 0..asset_count {
                asset_ids.push(AssetId(reader.read_u32()?));
            }
            let bytecode = reader.read_bytes()?;

            if current_combined_asset_file_hash(repository, shader_blueprint_resource_id)
                != Some(combined_asset_file_hash)
            {
                log::info!(
                    "dropping persisted shader cache {shader_cache_id:?}: source assets changed"
                );
                continue;
            }

            let shader = match shader_language.create_shader_from_bytecode(stage, &bytecode) {
                Ok(shader) => shader,
                Err(error) => {
                    log::warn!(
                        "dropping persisted shader cache {shader_cache_id:?}: {error}"
                    );
                    continue;
                }
            };
            let cache = Arc::new(ShaderCache {
                shader_cache_id,
                shader_blueprint_resource_id,
                stage,
                source_code_id,
                master_shader_cache_id: None,
                shader,
                bytecode,
                asset_ids,
                combined_asset_file_hash,
            });
            self.caches.write().insert(shader_cache_id, cache);
            self.masters_by_source
                .write()
                .insert(source_code_id, shader_cache_id);
            restored += 1;
        }
        log::debug!("restored {restored} shader cache(s) from disk");
        Ok(restored)
    }
}

/// Combined file hash of a blueprint's current assets, folded the same way
/// the builder folds them: included pieces in order, then the blueprint.
/// `None` when the blueprint or one of its pieces is not registered.
fn current_combined_asset_file_hash(
    repository: &ShaderRepository,
    blueprint_id: ShaderBlueprintResourceId,
) -> Option<u64> {
    let blueprint = repository.shader_blueprint(blueprint_id)?;
    let mut combined_hash = Fnv1a64::new();
    for asset_id in &blueprint.include_piece_asset_ids {
        combined_hash.write_u64(repository.shader_piece(*asset_id)?.file_hash);
    }
    combined_hash.write_u64(blueprint.file_hash);
    Some(combined_hash.finish())
}

fn stage_to_u8(stage: ShaderStage) -> u8 {
    match stage {
        ShaderStage::Vertex => 0,
        ShaderStage::TessellationControl => 1,
        ShaderStage::TessellationEvaluation => 2,
        ShaderStage::Geometry => 3,
        ShaderStage::Fragment => 4,
        ShaderStage::Compute => 5,
    }
}

fn stage_from_u8(value: u8) -> Result<ShaderStage> {
    Ok(match value {
        0 => ShaderStage::Vertex,
        1 => ShaderStage::TessellationControl,
        2 => ShaderStage::TessellationEvaluation,
        3 => ShaderStage::Geometry,
        4 => ShaderStage::Fragment,
        5 => ShaderStage::Compute,
        other => {
            return Err(CrucibleError::CorruptCacheBlob(format!(
                "invalid shader stage tag {other}"
            )));
        }
    })
}
