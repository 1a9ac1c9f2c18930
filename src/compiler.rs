//! Asynchronous Pipeline State Compiler
//!
//! Cache misses queue [`CompileJob`]s instead of blocking the render thread.
//! [`BackgroundPipelineStateCompiler`] runs them on a worker thread and
//! installs the finished pipeline states back into the owning material
//! blueprint's cache manager; [`ImmediatePipelineStateCompiler`] runs them
//! inline, for tools and deterministic tests.
//!
//! A job failure is terminal for that job only: it is logged and the cache
//! entry keeps serving its fallback. The next explicit cache clear gives the
//! combination another chance.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::blueprint::MaterialBlueprintResource;
use crate::cache::compute::compile_compute_pipeline_state;
use crate::cache::graphics::compile_graphics_pipeline_state;
use crate::cache::signature::{ComputePipelineStateSignature, GraphicsPipelineStateSignature};
use crate::cache::PipelineEnvironment;

/// One queued pipeline state compile.
///
/// Jobs own everything they need: the material blueprint keeps the target
/// cache manager alive, and the generation stamp lets the manager discard
/// results that were overtaken by a cache clear.
pub enum CompileJob {
    Graphics {
        material_blueprint: Arc<MaterialBlueprintResource>,
        signature: GraphicsPipelineStateSignature,
        generation: u32,
    },
    Compute {
        material_blueprint: Arc<MaterialBlueprintResource>,
        signature: ComputePipelineStateSignature,
        generation: u32,
    },
}

impl CompileJob {
    pub(crate) fn execute(self, environment: &PipelineEnvironment) {
        match self {
            CompileJob::Graphics {
                material_blueprint,
                signature,
                generation,
            } => match compile_graphics_pipeline_state(environment, &signature) {
                Ok(pipeline_state) => {
                    material_blueprint
                        .graphics_pipeline_state_cache_manager()
                        .install_async_result(signature.signature_id(), generation, pipeline_state);
                }
                Err(error) => {
                    log::error!(
                        "asynchronous graphics pipeline state compile {:?} failed: {error}",
                        signature.signature_id()
                    );
                }
            },
            CompileJob::Compute {
                material_blueprint,
                signature,
                generation,
            } => match compile_compute_pipeline_state(environment, &signature) {
                Ok(pipeline_state) => {
                    material_blueprint
                        .compute_pipeline_state_cache_manager()
                        .install_async_result(signature.signature_id(), generation, pipeline_state);
                }
                Err(error) => {
                    log::error!(
                        "asynchronous compute pipeline state compile {:?} failed: {error}",
                        signature.signature_id()
                    );
                }
            },
        }
    }
}

/// Accepts compile jobs from the cache managers.
pub trait PipelineStateCompiler: Send + Sync {
    fn queue(&self, job: CompileJob);

    /// Block until every queued job has finished. Immediate implementations
    /// are always idle.
    fn wait_idle(&self);
}

/// Runs every job inline on the calling thread.
pub struct ImmediatePipelineStateCompiler {
    environment: PipelineEnvironment,
}

impl ImmediatePipelineStateCompiler {
    #[must_use]
    pub fn new(environment: PipelineEnvironment) -> Self {
        Self { environment }
    }
}

impl PipelineStateCompiler for ImmediatePipelineStateCompiler {
    fn queue(&self, job: CompileJob) {
        job.execute(&self.environment);
    }

    fn wait_idle(&self) {}
}

enum WorkerMessage {
    Job(Box<CompileJob>),
    Shutdown,
}

#[derive(Default)]
struct PendingJobs {
    count: Mutex<usize>,
    became_idle: Condvar,
}

/// Runs jobs on a dedicated worker thread, in queue order.
pub struct BackgroundPipelineStateCompiler {
    sender: flume::Sender<WorkerMessage>,
    pending: Arc<PendingJobs>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BackgroundPipelineStateCompiler {
    #[must_use]
    pub fn new(environment: PipelineEnvironment) -> Self {
        let (sender, receiver) = flume::unbounded::<WorkerMessage>();
        let pending = Arc::new(PendingJobs::default());
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name("pipeline-state-compiler".into())
            .spawn(move || {
                for message in receiver.iter() {
                    match message {
                        WorkerMessage::Job(job) => {
                            job.execute(&environment);
                            let mut count = worker_pending.count.lock();
                            *count -= 1;
                            if *count == 0 {
                                worker_pending.became_idle.notify_all();
                            }
                        }
                        WorkerMessage::Shutdown => break,
                    }
                }
            })
            .ok();
        if worker.is_none() {
            log::error!("failed to spawn pipeline state compiler thread, jobs will be dropped");
        }
        Self {
            sender,
            pending,
            worker,
        }
    }

    /// Number of jobs queued or running.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        *self.pending.count.lock()
    }
}

impl PipelineStateCompiler for BackgroundPipelineStateCompiler {
    fn queue(&self, job: CompileJob) {
        *self.pending.count.lock() += 1;
        if self.sender.send(WorkerMessage::Job(Box::new(job))).is_err() {
            let mut count = self.pending.count.lock();
            *count -= 1;
            if *count == 0 {
                self.pending.became_idle.notify_all();
            }
            log::warn!("pipeline state compiler is shut down, dropping compile job");
        }
    }

    fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.became_idle.wait(&mut count);
        }
    }
}

impl Drop for BackgroundPipelineStateCompiler {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
