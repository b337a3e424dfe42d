//! Generation manager: keeps a pipeline resident and queues requests.
//!
//! The manager owns one [`Pipeline`] on a dedicated worker thread. Callers
//! submit parameters through a cloneable handle and await the reply; requests
//! to the same pipeline are processed one at a time.
//!
//! Every invocation runs inside an [`InvocationScope`], whose `Drop` calls
//! [`Pipeline::release`]. Release therefore happens on success, on error and
//! while unwinding from a panic. Panics are caught at the invocation boundary
//! and reported as [`Error::Generation`] so the worker keeps serving.
//!
//! # Example
//!
//! ```no_run
//! use musicgen_api::manager::{GenerationManager, preferred_device};
//! use musicgen_api::pipeline::{AudioParams, MusicGenPipeline};
//!
//! #[tokio::main]
//! async fn main() -> musicgen_api::Result<()> {
//!     let device = preferred_device(0);
//!     let manager = GenerationManager::start("music", move || {
//!         MusicGenPipeline::load("facebook/musicgen-small", &device)
//!     })
//!     .await?;
//!     let audio = manager
//!         .generate(AudioParams {
//!             prompt: "lofi piano".into(),
//!             seed: 42,
//!             max_length: 500,
//!             guidance_scale: 3.0,
//!             top_k: 250,
//!         })
//!         .await?;
//!     println!("{} samples", audio.samples.len());
//!     Ok(())
//! }
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use candle_core::Device;
use tokio::sync::{mpsc, oneshot};

use crate::pipeline::Pipeline;
use crate::{Error, Result};

/// Queue depth per pipeline before `generate` starts waiting for capacity.
const QUEUE_CAPACITY: usize = 64;

/// A submitted generation request.
struct PendingRequest<Params, Output> {
    params: Params,
    reply: oneshot::Sender<Result<Output>>,
}

/// Handle for submitting generation requests to a running manager.
pub struct GenerationManager<Params, Output> {
    name: &'static str,
    tx: mpsc::Sender<PendingRequest<Params, Output>>,
}

impl<Params, Output> Clone for GenerationManager<Params, Output> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<Params, Output> std::fmt::Debug for GenerationManager<Params, Output> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationManager")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<Params, Output> GenerationManager<Params, Output>
where
    Params: Send + 'static,
    Output: Send + 'static,
{
    /// Load a pipeline and start the worker that serves it.
    ///
    /// Loading runs on the blocking pool because it does synchronous I/O and
    /// heavy compute. Returns an error if the load fails; nothing is retried.
    pub async fn start<P, F>(name: &'static str, load: F) -> Result<Self>
    where
        P: Pipeline<Params = Params, Output = Output>,
        F: FnOnce() -> Result<P> + Send + 'static,
    {
        let started = Instant::now();
        let pipeline = tokio::task::spawn_blocking(move || {
            tracing::info!(pipeline = name, "loading pipeline");
            load()
        })
        .await
        .map_err(|join_error| {
            Error::Manager(format!("{name} pipeline load task panicked: {join_error}"))
        })??;
        tracing::info!(
            pipeline = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline loaded"
        );
        Self::spawn(name, pipeline)
    }

    /// Start a worker for an already-loaded pipeline.
    pub fn spawn<P>(name: &'static str, pipeline: P) -> Result<Self>
    where
        P: Pipeline<Params = Params, Output = Output>,
    {
        let (tx, rx) = mpsc::channel::<PendingRequest<Params, Output>>(QUEUE_CAPACITY);
        std::thread::Builder::new()
            .name(format!("{name}-pipeline"))
            .spawn(move || run_manager(name, pipeline, rx))?;
        Ok(Self { name, tx })
    }

    /// Submit a generation request and wait for the result.
    pub async fn generate(&self, params: Params) -> Result<Output> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<Output>>();
        self.tx
            .send(PendingRequest {
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager(format!("{} manager has shut down", self.name)))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager(format!("{} manager dropped reply channel", self.name)))?
    }
}

/// The manager loop. Runs on the pipeline's own thread until every handle is dropped.
fn run_manager<P: Pipeline>(
    name: &'static str,
    mut pipeline: P,
    mut rx: mpsc::Receiver<PendingRequest<P::Params, P::Output>>,
) {
    while let Some(request) = rx.blocking_recv() {
        let result = invoke(name, &mut pipeline, &request.params);
        // Ignore send errors, the caller may have gone away.
        let _ = request.reply.send(result);
    }
    tracing::info!(pipeline = name, "generation manager shut down");
}

/// Run one invocation inside a release scope, converting panics to errors.
pub fn invoke<P: Pipeline>(name: &str, pipeline: &mut P, params: &P::Params) -> Result<P::Output> {
    let mut scope = InvocationScope::enter(name, pipeline);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| scope.pipeline().generate(params)));
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(pipeline = name, panic = %message, "pipeline panicked");
            Err(Error::Generation(format!("pipeline panicked: {message}")))
        }
    }
}

/// Scoped acquisition of a pipeline for one invocation.
///
/// Dropping the scope releases per-invocation resources.
pub struct InvocationScope<'a, P: Pipeline> {
    name: &'a str,
    pipeline: &'a mut P,
    started: Instant,
}

impl<'a, P: Pipeline> InvocationScope<'a, P> {
    pub fn enter(name: &'a str, pipeline: &'a mut P) -> Self {
        tracing::debug!(pipeline = name, "invocation started");
        Self {
            name,
            pipeline,
            started: Instant::now(),
        }
    }

    pub fn pipeline(&mut self) -> &mut P {
        self.pipeline
    }
}

impl<P: Pipeline> Drop for InvocationScope<'_, P> {
    fn drop(&mut self) {
        self.pipeline.release();
        tracing::debug!(
            pipeline = self.name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "invocation released"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Return the preferred device: CUDA if available, then Metal, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(cuda_ordinal) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    Device::Cpu
}

/// True when the device is a GPU rather than the host CPU.
pub fn is_accelerator(device: &Device) -> bool {
    !matches!(device, Device::Cpu)
}

/// Wait for queued accelerator work and let the allocator reclaim it.
pub fn release_device(device: &Device) {
    if !is_accelerator(device) {
        return;
    }
    if let Err(error) = device.synchronize() {
        tracing::warn!(%error, "device synchronize failed during release");
    }
}
