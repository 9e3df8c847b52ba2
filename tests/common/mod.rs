//! Shared fixtures: a recording stand-in for a native graphics context and a
//! texture type managed through it.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use glthread::{
    IdlePolicy, IdleReclaim, NativeContext, NativeHandle, NativeResource, OwningThread, RawFence, Settings,
    ThreadContext, UnitResult,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Counters shared between a [`FakeGl`] and the test thread.
#[derive(Debug, Default)]
pub struct GlStats {
    pub fences_created: AtomicUsize,
    pub fences_polled: AtomicUsize,
    pub deleted_fences: Mutex<Vec<u64>>,
    pub textures_created: AtomicUsize,
    pub deleted_textures: Mutex<Vec<u64>>,
    /// Whether the "GPU" has reached every fence issued so far.
    pub gpu_idle: AtomicBool,
}

impl GlStats {
    pub fn fences_deleted(&self) -> usize {
        self.deleted_fences.lock().len()
    }

    pub fn textures_deleted(&self) -> usize {
        self.deleted_textures.lock().len()
    }

    pub fn set_gpu_idle(&self, idle: bool) {
        self.gpu_idle.store(idle, Ordering::Release);
    }
}

/// Recording backend with native fences.
pub struct FakeGl {
    pub stats: Arc<GlStats>,
    next_name: u64,
}

impl FakeGl {
    pub fn new(stats: Arc<GlStats>) -> Self {
        Self { stats, next_name: 0 }
    }

    pub fn gen_texture(&mut self) -> u64 {
        self.next_name += 1;
        self.stats.textures_created.fetch_add(1, Ordering::Relaxed);
        self.next_name
    }

    pub fn delete_texture(&mut self, name: u64) {
        self.stats.deleted_textures.lock().push(name);
    }
}

impl NativeContext for FakeGl {
    fn create_fence(&mut self) -> Option<RawFence> {
        self.next_name += 1;
        self.stats.fences_created.fetch_add(1, Ordering::Relaxed);
        Some(RawFence(self.next_name))
    }

    fn poll_fence(&mut self, _fence: RawFence) -> bool {
        self.stats.fences_polled.fetch_add(1, Ordering::Relaxed);
        self.stats.gpu_idle.load(Ordering::Acquire)
    }

    fn delete_fence(&mut self, fence: RawFence) {
        let mut deleted = self.stats.deleted_fences.lock();
        assert!(!deleted.contains(&fence.0), "fence {} deleted twice", fence.0);
        deleted.push(fence.0);
    }
}

/// Backend without fence support; every trait method keeps its default.
pub struct FencelessGl;

impl NativeContext for FencelessGl {}

/// Settings with short cycles and sweeps that never fire on their own.
pub fn test_settings() -> Settings {
    Settings {
        cycle_interval: Duration::from_millis(2),
        sweep_interval: Duration::from_secs(3600),
        idle_check_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// Spawns an owning thread over a fresh [`FakeGl`]; the GPU starts idle.
pub fn spawn_gl(name: &str) -> (OwningThread, Arc<GlStats>) {
    spawn_gl_with(name, &test_settings())
}

pub fn spawn_gl_with(name: &str, settings: &Settings) -> (OwningThread, Arc<GlStats>) {
    let stats = Arc::new(GlStats::default());
    stats.set_gpu_idle(true);
    let backend_stats = Arc::clone(&stats);
    let thread = OwningThread::spawn(name, settings, move || Ok(FakeGl::new(backend_stats))).unwrap();
    (thread, stats)
}

// ============================================================================
// Textures
// ============================================================================

#[derive(Debug)]
pub struct FakeTexture {
    pub name: NativeHandle,
    pub releases: Arc<AtomicU64>,
}

impl FakeTexture {
    /// Generates a texture name; must run on the owning thread.
    pub fn create(ctx: &mut ThreadContext, releases: Arc<AtomicU64>) -> UnitResult<Self> {
        let gl = ctx.native::<FakeGl>().ok_or("not a FakeGl context")?;
        Ok(Self {
            name: NativeHandle::new(gl.gen_texture()),
            releases,
        })
    }
}

impl NativeResource for FakeTexture {
    fn is_valid(&self) -> bool {
        self.name.is_valid()
    }

    fn release(&self, ctx: &mut ThreadContext) -> UnitResult<()> {
        let gl = ctx.native::<FakeGl>().ok_or("not a FakeGl context")?;
        if let Some(raw) = self.name.take() {
            gl.delete_texture(raw);
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl IdleReclaim for FakeTexture {
    fn idle_policy(settings: &Settings) -> IdlePolicy {
        IdlePolicy::After(settings.idle_timeout)
    }
}
