//! Cache hierarchy behavior against a counting mock backend: deduplication,
//! fallbacks, asynchronous installs, hot reload invalidation and persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crucible::cache::program::GraphicsProgramCacheManager;
use crucible::cache::shader::ShaderCacheManager;
use crucible::rhi::{NativeGraphicsProgram, NativePipelineState, NativeShader};
use crucible::{
    AssetId, CompileJob, CompiledShader, GraphicsShaderSet, ImmediatePipelineStateCompiler,
    MaterialBlueprintResource, MaterialBlueprintResourceId, PipelineEnvironment,
    PipelineStateCompiler, PipelineStateSystem, Result, SerializedGraphicsPipelineStateHash,
    ShaderBlueprintResource, ShaderBlueprintResourceId, ShaderLanguage, ShaderProperties,
    ShaderRepository, ShaderStage,
};

#[derive(Debug)]
struct MockShader;
impl NativeShader for MockShader {}

#[derive(Debug)]
struct MockProgram;
impl NativeGraphicsProgram for MockProgram {}

#[derive(Debug)]
struct MockPipelineState;
impl NativePipelineState for MockPipelineState {}

#[derive(Default)]
struct Counters {
    source_compiles: AtomicUsize,
    bytecode_compiles: AtomicUsize,
    program_links: AtomicUsize,
    graphics_pipelines: AtomicUsize,
    compute_pipelines: AtomicUsize,
}

struct MockShaderLanguage {
    name: &'static str,
    counters: Counters,
}

impl MockShaderLanguage {
    fn new() -> Arc<Self> {
        Self::named("mock")
    }

    fn named(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            counters: Counters::default(),
        })
    }

    fn source_compiles(&self) -> usize {
        self.counters.source_compiles.load(Ordering::SeqCst)
    }

    fn bytecode_compiles(&self) -> usize {
        self.counters.bytecode_compiles.load(Ordering::SeqCst)
    }

    fn program_links(&self) -> usize {
        self.counters.program_links.load(Ordering::SeqCst)
    }

    fn graphics_pipelines(&self) -> usize {
        self.counters.graphics_pipelines.load(Ordering::SeqCst)
    }

    fn compute_pipelines(&self) -> usize {
        self.counters.compute_pipelines.load(Ordering::SeqCst)
    }
}

impl ShaderLanguage for MockShaderLanguage {
    fn name(&self) -> &str {
        self.name
    }

    fn create_shader_from_source_code(
        &self,
        _stage: ShaderStage,
        source_code: &str,
    ) -> Result<CompiledShader> {
        self.counters.source_compiles.fetch_add(1, Ordering::SeqCst);
        Ok(CompiledShader {
            handle: Arc::new(MockShader),
            bytecode: source_code.as_bytes().to_vec(),
        })
    }

    fn create_shader_from_bytecode(
        &self,
        _stage: ShaderStage,
        _bytecode: &[u8],
    ) -> Result<crucible::rhi::ShaderHandle> {
        self.counters.bytecode_compiles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockShader))
    }

    fn create_graphics_program(
        &self,
        _shaders: &GraphicsShaderSet,
    ) -> Result<crucible::rhi::GraphicsProgramHandle> {
        self.counters.program_links.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockProgram))
    }

    fn create_graphics_pipeline_state(
        &self,
        _program: &crucible::rhi::GraphicsProgramHandle,
        _serialized_state: SerializedGraphicsPipelineStateHash,
    ) -> Result<crucible::rhi::PipelineStateHandle> {
        self.counters.graphics_pipelines.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPipelineState))
    }

    fn create_compute_pipeline_state(
        &self,
        _compute_shader: &crucible::rhi::ShaderHandle,
    ) -> Result<crucible::rhi::PipelineStateHandle> {
        self.counters.compute_pipelines.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPipelineState))
    }
}

/// Captures queued jobs so tests control exactly when async compiles land.
struct DeferredCompiler {
    inner: ImmediatePipelineStateCompiler,
    jobs: Mutex<Vec<CompileJob>>,
}

impl DeferredCompiler {
    fn new(environment: PipelineEnvironment) -> Self {
        Self {
            inner: ImmediatePipelineStateCompiler::new(environment),
            jobs: Mutex::new(Vec::new()),
        }
    }

    fn flush(&self) {
        let jobs: Vec<CompileJob> = self.jobs.lock().unwrap().drain(..).collect();
        for job in jobs {
            self.inner.queue(job);
        }
    }
}

impl PipelineStateCompiler for DeferredCompiler {
    fn queue(&self, job: CompileJob) {
        self.jobs.lock().unwrap().push(job);
    }

    fn wait_idle(&self) {}
}

fn make_repository() -> (Arc<ShaderRepository>, MaterialBlueprintResourceId) {
    make_repository_with_fragment(
        "@property(USE_NORMAL_MAP)vec3 n = nm();@end\nvoid fs_main() {}",
    )
}

fn make_repository_with_fragment(
    fragment_source: &str,
) -> (Arc<ShaderRepository>, MaterialBlueprintResourceId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let repository = ShaderRepository::new();
    let vertex_id = ShaderBlueprintResourceId::from_name("cache_tests/vertex");
    let fragment_id = ShaderBlueprintResourceId::from_name("cache_tests/fragment");
    repository.add_shader_blueprint(ShaderBlueprintResource::new(
        vertex_id,
        AssetId::from_name("cache_tests/vertex.blueprint"),
        "void vs_main() {}",
        Vec::new(),
        Vec::new(),
    ));
    // DECOY is declared as referenced but never read by the template, so
    // flipping it changes the combination ID without changing the source.
    repository.add_shader_blueprint(ShaderBlueprintResource::new(
        fragment_id,
        AssetId::from_name("cache_tests/fragment.blueprint"),
        fragment_source,
        Vec::new(),
        ShaderBlueprintResource::referenced_from_names(&["USE_NORMAL_MAP", "DECOY"]),
    ));
    let material_id = MaterialBlueprintResourceId::from_name("cache_tests/material");
    repository.add_material_blueprint(MaterialBlueprintResource::graphics(
        material_id,
        [Some(vertex_id), None, None, None, Some(fragment_id)],
    ));
    (Arc::new(repository), material_id)
}

fn state_hash() -> SerializedGraphicsPipelineStateHash {
    SerializedGraphicsPipelineStateHash::from_state_blob(b"opaque-forward")
}

#[test]
fn repeated_requests_hit_every_cache_level() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository, language.clone());

    let first = system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    assert!(first.pipeline_state().is_some());
    assert!(!first.is_using_fallback());
    assert_eq!(language.source_compiles(), 2);
    assert_eq!(language.program_links(), 1);
    assert_eq!(language.graphics_pipelines(), 1);

    let second = system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(language.source_compiles(), 2);
    assert_eq!(language.program_links(), 1);
    assert_eq!(language.graphics_pipelines(), 1);
}

#[test]
fn identical_generated_source_is_compiled_once() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository, language.clone());

    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    // DECOY changing forces new combination and signature IDs but produces
    // byte-identical source; the shader cache must redirect, not recompile,
    // and the redirected stages must share the already linked program.
    system
        .get_graphics_pipeline_state(
            material_id,
            state_hash(),
            ShaderProperties::from([("DECOY", 1)].as_slice()),
            false,
        )
        .unwrap();

    assert_eq!(language.source_compiles(), 2);
    assert_eq!(language.program_links(), 1);
    assert_eq!(language.graphics_pipelines(), 2);
    assert_eq!(system.shader_cache_manager().len(), 3);
    assert_eq!(system.graphics_program_cache_manager().len(), 1);
}

#[test]
fn referenced_property_change_forces_new_shader() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository, language.clone());

    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    system
        .get_graphics_pipeline_state(
            material_id,
            state_hash(),
            ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice()),
            false,
        )
        .unwrap();

    // Vertex shader is unaffected, fragment shader recompiles.
    assert_eq!(language.source_compiles(), 3);
    assert_eq!(language.program_links(), 2);
}

#[test]
fn miss_serves_fallback_until_async_compile_lands() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let environment = PipelineEnvironment {
        repository: repository.clone(),
        shader_language: language.clone(),
        shader_cache_manager: Arc::new(ShaderCacheManager::new()),
        graphics_program_cache_manager: Arc::new(GraphicsProgramCacheManager::new()),
    };
    let compiler = DeferredCompiler::new(environment.clone());
    let material = repository.material_blueprint(material_id).unwrap();
    let manager = material.graphics_pipeline_state_cache_manager();

    // Emergency sync: no fallback exists yet, so the first request stalls
    // and comes back ready.
    let base = manager
        .get_pipeline_state_cache(
            &environment,
            &compiler,
            &material,
            state_hash(),
            ShaderProperties::new(),
            true,
        )
        .unwrap();
    assert!(!base.is_using_fallback());
    let base_state = base.pipeline_state().unwrap();

    let specialized = manager
        .get_pipeline_state_cache(
            &environment,
            &compiler,
            &material,
            state_hash(),
            ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice()),
            false,
        )
        .unwrap();
    assert!(specialized.is_using_fallback());
    assert!(Arc::ptr_eq(&specialized.pipeline_state().unwrap(), &base_state));
    let pipelines_before = language.graphics_pipelines();

    compiler.flush();
    assert!(!specialized.is_using_fallback());
    assert!(!Arc::ptr_eq(&specialized.pipeline_state().unwrap(), &base_state));
    assert_eq!(language.graphics_pipelines(), pipelines_before + 1);
}

#[test]
fn async_results_from_before_a_clear_are_discarded() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let environment = PipelineEnvironment {
        repository: repository.clone(),
        shader_language: language.clone(),
        shader_cache_manager: Arc::new(ShaderCacheManager::new()),
        graphics_program_cache_manager: Arc::new(GraphicsProgramCacheManager::new()),
    };
    let compiler = DeferredCompiler::new(environment.clone());
    let material = repository.material_blueprint(material_id).unwrap();
    let manager = material.graphics_pipeline_state_cache_manager();

    let entry = manager
        .get_pipeline_state_cache(
            &environment,
            &compiler,
            &material,
            state_hash(),
            ShaderProperties::new(),
            false,
        )
        .unwrap();
    assert!(entry.pipeline_state().is_none());

    manager.clear_cache();
    compiler.flush();
    // The compile finished against a cleared cache; nothing may reappear.
    assert!(manager.is_empty());
    assert!(entry.pipeline_state().is_none());

    // A request after the clear compiles and installs normally.
    let fresh = manager
        .get_pipeline_state_cache(
            &environment,
            &compiler,
            &material,
            state_hash(),
            ShaderProperties::new(),
            false,
        )
        .unwrap();
    compiler.flush();
    assert!(fresh.pipeline_state().is_some());
    assert!(!fresh.is_using_fallback());
}

#[test]
fn blueprint_reload_invalidates_dependent_caches_only() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository.clone(), language.clone());

    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    assert_eq!(language.source_compiles(), 2);

    let fragment_id = ShaderBlueprintResourceId::from_name("cache_tests/fragment");
    system.on_shader_blueprint_reloaded(fragment_id);

    let material = repository.material_blueprint(material_id).unwrap();
    assert_eq!(material.shader_combination_generation(), 1);
    assert_eq!(system.shader_cache_manager().len(), 1);
    assert!(system.graphics_program_cache_manager().is_empty());
    assert!(material.graphics_pipeline_state_cache_manager().is_empty());

    let rebuilt = system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    assert!(rebuilt.pipeline_state().is_some());
    // Only the fragment shader recompiles; the vertex cache survived.
    assert_eq!(language.source_compiles(), 3);
    assert_eq!(language.program_links(), 2);
}

#[test]
fn piece_reload_walks_up_to_including_blueprints() {
    let (repository, material_id) = make_repository();
    let piece_asset = AssetId::from_name("cache_tests/common.piece");
    let compute_id = ShaderBlueprintResourceId::from_name("cache_tests/compute");
    repository.add_shader_piece(crucible::ShaderPieceResource::new(
        piece_asset,
        "@piece(Tile)const uint TILE = 8;@end",
    ));
    repository.add_shader_blueprint(ShaderBlueprintResource::new(
        compute_id,
        AssetId::from_name("cache_tests/compute.blueprint"),
        "@insertpiece(Tile)\nvoid cs_main() {}",
        vec![piece_asset],
        Vec::new(),
    ));
    let compute_material_id = MaterialBlueprintResourceId::from_name("cache_tests/compute_material");
    repository.add_material_blueprint(MaterialBlueprintResource::compute(
        compute_material_id,
        compute_id,
    ));

    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository.clone(), language.clone());

    let entry = system
        .get_compute_pipeline_state(compute_material_id, ShaderProperties::new(), false)
        .unwrap();
    assert!(entry.pipeline_state().is_some());
    assert_eq!(language.compute_pipelines(), 1);

    // Graphics material does not include the piece; its caches must survive.
    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    let shader_caches_before = system.shader_cache_manager().len();

    system.on_shader_piece_reloaded(piece_asset);

    let compute_material = repository.material_blueprint(compute_material_id).unwrap();
    let graphics_material = repository.material_blueprint(material_id).unwrap();
    assert_eq!(compute_material.shader_combination_generation(), 1);
    assert_eq!(graphics_material.shader_combination_generation(), 0);
    assert_eq!(system.shader_cache_manager().len(), shader_caches_before - 1);
    assert!(!graphics_material.graphics_pipeline_state_cache_manager().is_empty());

    system
        .get_compute_pipeline_state(compute_material_id, ShaderProperties::new(), false)
        .unwrap();
    assert_eq!(language.compute_pipelines(), 2);
}

#[test]
fn saved_cache_restores_without_source_compiles() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository, language.clone());

    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    system
        .get_graphics_pipeline_state(
            material_id,
            state_hash(),
            ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice()),
            false,
        )
        .unwrap();

    let mut blob = Vec::new();
    system.save_cache(&mut blob).unwrap();

    let (fresh_repository, _) = make_repository();
    let fresh_language = MockShaderLanguage::new();
    let restored_system =
        PipelineStateSystem::with_immediate_compiler(fresh_repository, fresh_language.clone());
    let restored = restored_system.load_cache(&mut blob.as_slice()).unwrap();

    assert_eq!(restored, 2);
    assert_eq!(fresh_language.source_compiles(), 0);
    assert!(fresh_language.bytecode_compiles() >= 2);
    assert_eq!(fresh_language.graphics_pipelines(), 2);

    // Warm start: the same request is a pure cache hit.
    let entry = restored_system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    assert!(entry.pipeline_state().is_some());
    assert!(!entry.is_using_fallback());
    assert_eq!(fresh_language.source_compiles(), 0);
}

#[test]
fn stale_cache_blob_restores_nothing() {
    let (repository, material_id) = make_repository();
    let system = PipelineStateSystem::with_immediate_compiler(
        repository,
        MockShaderLanguage::new(),
    );
    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    let mut blob = Vec::new();
    system.save_cache(&mut blob).unwrap();

    let (fresh_repository, _) = make_repository();
    let other_language = MockShaderLanguage::named("mock-v2");
    let restored_system =
        PipelineStateSystem::with_immediate_compiler(fresh_repository, other_language.clone());
    assert_eq!(restored_system.load_cache(&mut blob.as_slice()).unwrap(), 0);
    assert_eq!(other_language.bytecode_compiles(), 0);

    // Garbage input is corrupt, not stale.
    assert!(restored_system.load_cache(&mut &b"not a cache blob"[..]).is_err());
}

#[test]
fn edited_blueprint_is_not_served_from_stale_cache() {
    let (repository, material_id) = make_repository();
    let language = MockShaderLanguage::new();
    let system = PipelineStateSystem::with_immediate_compiler(repository, language.clone());
    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    let mut blob = Vec::new();
    system.save_cache(&mut blob).unwrap();

    // The fragment blueprint was edited on disk between runs; its persisted
    // compile must be dropped, not served.
    let (edited_repository, _) = make_repository_with_fragment(
        "@property(USE_NORMAL_MAP)vec3 n = nm();@end\nvoid fs_main() { edited(); }",
    );
    let fresh_language = MockShaderLanguage::new();
    let restored_system =
        PipelineStateSystem::with_immediate_compiler(edited_repository, fresh_language.clone());
    let restored = restored_system.load_cache(&mut blob.as_slice()).unwrap();

    // The unchanged vertex shader restores from bytecode; the fragment
    // recompiles from the edited source while the pipeline state is rebuilt.
    assert_eq!(restored, 1);
    assert_eq!(fresh_language.bytecode_compiles(), 1);
    assert_eq!(fresh_language.source_compiles(), 1);

    let entry = restored_system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    assert!(entry.pipeline_state().is_some());
    assert_eq!(fresh_language.source_compiles(), 1);
}

#[test]
fn missing_blueprint_skips_persisted_pipeline_states() {
    let (repository, material_id) = make_repository();
    let system =
        PipelineStateSystem::with_immediate_compiler(repository, MockShaderLanguage::new());
    system
        .get_graphics_pipeline_state(material_id, state_hash(), ShaderProperties::new(), false)
        .unwrap();
    let mut blob = Vec::new();
    system.save_cache(&mut blob).unwrap();

    // Same material, but the fragment blueprint never got registered.
    let repository = ShaderRepository::new();
    let vertex_id = ShaderBlueprintResourceId::from_name("cache_tests/vertex");
    repository.add_shader_blueprint(ShaderBlueprintResource::new(
        vertex_id,
        AssetId::from_name("cache_tests/vertex.blueprint"),
        "void vs_main() {}",
        Vec::new(),
        Vec::new(),
    ));
    repository.add_material_blueprint(MaterialBlueprintResource::graphics(
        material_id,
        [
            Some(vertex_id),
            None,
            None,
            None,
            Some(ShaderBlueprintResourceId::from_name("cache_tests/fragment")),
        ],
    ));
    let language = MockShaderLanguage::new();
    let restored_system =
        PipelineStateSystem::with_immediate_compiler(Arc::new(repository), language.clone());

    // Loading skips the unrestorable records and keeps going; the vertex
    // shader bytecode still comes back.
    assert_eq!(restored_system.load_cache(&mut blob.as_slice()).unwrap(), 0);
    assert_eq!(language.bytecode_compiles(), 1);
}

#[test]
fn compute_pipeline_states_are_cached() {
    let repository = ShaderRepository::new();
    let compute_id = ShaderBlueprintResourceId::from_name("cache_tests/cull");
    repository.add_shader_blueprint(ShaderBlueprintResource::new(
        compute_id,
        AssetId::from_name("cache_tests/cull.blueprint"),
        "@property(FINE_CULLING)fine();@end\nvoid cs_main() {}",
        Vec::new(),
        ShaderBlueprintResource::referenced_from_names(&["FINE_CULLING"]),
    ));
    let material_id = MaterialBlueprintResourceId::from_name("cache_tests/cull_material");
    repository.add_material_blueprint(MaterialBlueprintResource::compute(
        material_id,
        compute_id,
    ));

    let language = MockShaderLanguage::new();
    let system =
        PipelineStateSystem::with_immediate_compiler(Arc::new(repository), language.clone());

    let first = system
        .get_compute_pipeline_state(material_id, ShaderProperties::new(), false)
        .unwrap();
    let second = system
        .get_compute_pipeline_state(material_id, ShaderProperties::new(), false)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(language.compute_pipelines(), 1);

    system
        .get_compute_pipeline_state(
            material_id,
            ShaderProperties::from([("FINE_CULLING", 1)].as_slice()),
            false,
        )
        .unwrap();
    assert_eq!(language.compute_pipelines(), 2);
    assert_eq!(language.source_compiles(), 2);
}
