//! Frame Loop Demo
//!
//! A simulated GL backend driven by several worker threads:
//!
//! - Workers upload textures through a [`Reclaimer`] and append draw calls
//!   to the back half of a [`DoubleBuffered`] command list.
//! - A per-cycle "present" task on the GL thread swaps the list and executes
//!   the front half, once per frame.
//! - Every few frames a worker inserts a fence and waits for the simulated
//!   GPU to catch up.
//! - Textures are never deleted explicitly; dropped handles are reclaimed by
//!   the background sweep.
//!
//! Run with `RUST_LOG=debug` to see sweeps and fence pool activity.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use rustc_hash::FxHashMap;

use glthread::{
    DoubleBuffered, ManagedHandle, NativeContext, NativeHandle, NativeResource, OwningThread, RawFence, Reclaimer,
    Settings, ThreadContext, UnitResult,
};

const WORKERS: usize = 3;
const FRAMES: usize = 40;
const FENCE_EVERY: usize = 8;
const IN_FLIGHT: usize = 2;
const GPU_LATENCY: Duration = Duration::from_millis(3);

// ============================================================================
// Simulated backend
// ============================================================================

#[derive(Debug, Default)]
struct GpuStats {
    draws: AtomicU64,
    textures_created: AtomicU64,
    textures_deleted: AtomicU64,
    fences_deleted: AtomicU64,
}

/// Pretends to be a GL context; fences signal a fixed time after creation.
struct SoftGl {
    next_name: u64,
    fences: FxHashMap<u64, Instant>,
    stats: Arc<GpuStats>,
}

impl SoftGl {
    fn new(stats: Arc<GpuStats>) -> Self {
        Self {
            next_name: 0,
            fences: FxHashMap::default(),
            stats,
        }
    }

    fn gen_name(&mut self) -> u64 {
        self.next_name += 1;
        self.next_name
    }

    fn draw(&mut self, call: &DrawCall) {
        log::trace!("draw {} vertices with texture {}", call.vertices, call.texture);
        self.stats.draws.fetch_add(1, Ordering::Relaxed);
    }
}

impl NativeContext for SoftGl {
    fn create_fence(&mut self) -> Option<RawFence> {
        let name = self.gen_name();
        self.fences.insert(name, Instant::now() + GPU_LATENCY);
        Some(RawFence(name))
    }

    fn poll_fence(&mut self, fence: RawFence) -> bool {
        self.fences
            .get(&fence.0)
            .is_none_or(|ready_at| Instant::now() >= *ready_at)
    }

    fn delete_fence(&mut self, fence: RawFence) {
        self.fences.remove(&fence.0);
        self.stats.fences_deleted.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Texture {
    name: NativeHandle,
    bytes: usize,
}

impl Texture {
    fn upload(ctx: &mut ThreadContext, bytes: usize) -> UnitResult<Self> {
        let gl = ctx.native::<SoftGl>().ok_or("texture upload needs a SoftGl context")?;
        let name = gl.gen_name();
        gl.stats.textures_created.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            name: NativeHandle::new(name),
            bytes,
        })
    }
}

impl NativeResource for Texture {
    fn is_valid(&self) -> bool {
        self.name.is_valid()
    }

    fn release(&self, ctx: &mut ThreadContext) -> UnitResult<()> {
        let gl = ctx.native::<SoftGl>().ok_or("texture delete needs a SoftGl context")?;
        if let Some(name) = self.name.take() {
            log::trace!("delete texture {name} ({} bytes)", self.bytes);
            gl.stats.textures_deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct DrawCall {
    texture: u64,
    vertices: u32,
}

// ============================================================================
// Workers
// ============================================================================

fn run_worker(
    id: usize,
    thread: &OwningThread,
    reclaimer: &Reclaimer,
    lists: &DoubleBuffered<Vec<DrawCall>>,
) -> anyhow::Result<()> {
    // Recent textures stay alive until their draws have been presented.
    let mut in_flight: VecDeque<ManagedHandle<Texture>> = VecDeque::with_capacity(IN_FLIGHT + 1);

    for frame in 0..FRAMES {
        let bytes = 256 * (id + 1);
        let texture = reclaimer.manage(thread, move |ctx| Texture::upload(ctx, bytes))?;
        lists.back().push(DrawCall {
            texture: texture.name.get().unwrap_or_default(),
            vertices: 6,
        });

        if frame % FENCE_EVERY == 0 {
            thread.fence()?.get_timeout(Duration::from_secs(1))?;
            log::debug!("worker-{id} frame {frame}: GPU caught up");
        }

        in_flight.push_back(texture);
        if in_flight.len() > IN_FLIGHT {
            in_flight.pop_front();
        }
        std::thread::sleep(Duration::from_millis(4));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings {
        sweep_interval: Duration::from_millis(100),
        ..Settings::from_env()?
    };
    log::info!("Settings: {settings:?}");

    let stats = Arc::new(GpuStats::default());
    let gl_stats = Arc::clone(&stats);
    let thread = OwningThread::spawn("gl", &settings, move || Ok(SoftGl::new(gl_stats)))?;
    let reclaimer = Arc::new(Reclaimer::new(&settings)?);
    let lists = Arc::new(DoubleBuffered::from_factory(Vec::<DrawCall>::new));

    let frame_lists = Arc::clone(&lists);
    let present = thread.on_cycle("present frame", move |ctx| {
        frame_lists.swap();
        let mut front = frame_lists.front();
        let gl = ctx.native::<SoftGl>().ok_or("present needs a SoftGl context")?;
        for call in front.drain(..) {
            gl.draw(&call);
        }
        Ok(())
    })?;

    let started = Instant::now();
    let workers = (0..WORKERS)
        .map(|id| {
            let thread = thread.clone();
            let reclaimer = Arc::clone(&reclaimer);
            let lists = Arc::clone(&lists);
            std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || run_worker(id, &thread, &reclaimer, &lists))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    for worker in workers {
        worker.join().map_err(|_| anyhow!("worker thread panicked"))??;
    }
    log::info!("Workers finished after {:?}", started.elapsed());

    // Two more cycles so the last draws are presented.
    std::thread::sleep(settings.cycle_interval * 2);
    thread.cancel_cycle_task(present)?;

    let enqueued = reclaimer.sweep_now();
    thread.fence()?.get()?;
    log::info!("Final sweep enqueued {enqueued} deletion(s)");

    log::info!(
        "Draws: {}, textures created: {}, deleted: {}, fences released: {}, still pooled: {}",
        stats.draws.load(Ordering::Relaxed),
        stats.textures_created.load(Ordering::Relaxed),
        stats.textures_deleted.load(Ordering::Relaxed),
        stats.fences_deleted.load(Ordering::Relaxed),
        thread.outstanding_fences()?,
    );

    thread.shutdown();
    Ok(())
}
