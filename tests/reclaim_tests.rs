//! Reclamation Tests
//!
//! Tests for:
//! - Reclaimer: manage/adopt, sweep after the last handle drops, exactly one
//!   deletion, explicit delete racing the sweep
//! - deletion_unit: second run is a no-op
//! - IdleReclaimer: eviction after the timeout, rehydration on get,
//!   StaleRestore, disabled policy, native resources, cleanup on drop
//! - Native restores from the owning thread, and concurrent restores from the
//!   owning thread and another thread

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use glthread::{
    Command, Error, IdleManaged, IdlePolicy, IdleReclaimer, NativeResource, OwningThread, Query, Reclaimer, Settings,
    ThreadContext, deletion_unit,
};

use common::{FakeTexture, init_logger, spawn_gl, test_settings};

fn short_idle_settings() -> Settings {
    Settings {
        idle_timeout: Duration::from_millis(20),
        ..test_settings()
    }
}

/// Creates a texture on `thread` and hands it to `reclaimer`, then waits
/// until the idle check has evicted it.
fn evicted_texture(thread: &OwningThread, reclaimer: &IdleReclaimer) -> IdleManaged<FakeTexture> {
    let releases = Arc::new(AtomicU64::new(0));
    let first = {
        let releases = Arc::clone(&releases);
        thread
            .submit(Query::new("create", move |ctx: &mut ThreadContext| {
                FakeTexture::create(ctx, releases)
            }))
            .unwrap()
    };
    let texture =
        reclaimer.make_managed_native(thread, first, move |ctx| FakeTexture::create(ctx, Arc::clone(&releases)));

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(reclaimer.check_now(), 1);
    assert!(!texture.is_resident());
    texture
}

// ============================================================================
// Reachability
// ============================================================================

#[test]
fn dropped_handle_is_deleted_exactly_once() {
    init_logger();
    let (thread, stats) = spawn_gl("reclaim-drop");
    let reclaimer = Reclaimer::new(&test_settings()).unwrap();
    let releases = Arc::new(AtomicU64::new(0));

    let texture = {
        let releases = Arc::clone(&releases);
        reclaimer
            .manage(&thread, move |ctx| FakeTexture::create(ctx, releases))
            .unwrap()
    };
    let copy = texture.clone();
    assert!(texture.is_valid());
    assert_eq!(reclaimer.tracked(), 1);

    // A live clone keeps the resource reachable.
    drop(texture);
    assert_eq!(reclaimer.sweep_now(), 0);

    drop(copy);
    assert_eq!(reclaimer.sweep_now(), 1);
    assert_eq!(reclaimer.tracked(), 0);
    assert_eq!(reclaimer.sweep_now(), 0);
    assert_eq!(reclaimer.enqueued(), 1);

    // The deletion was scheduled; a blocking submit queued behind it syncs.
    thread.submit(Command::noop()).unwrap();
    assert_eq!(stats.textures_deleted(), 1);
    assert_eq!(releases.load(Ordering::Relaxed), 1);
}

#[test]
fn explicit_delete_makes_sweep_a_no_op() {
    let (thread, stats) = spawn_gl("reclaim-explicit");
    let reclaimer = Reclaimer::new(&test_settings()).unwrap();
    let releases = Arc::new(AtomicU64::new(0));

    let texture = {
        let releases = Arc::clone(&releases);
        reclaimer
            .manage(&thread, move |ctx| FakeTexture::create(ctx, releases))
            .unwrap()
    };
    texture.delete().unwrap();
    assert!(!texture.is_valid());
    drop(texture);

    assert_eq!(reclaimer.sweep_now(), 1);
    thread.submit(Command::noop()).unwrap();
    assert_eq!(stats.textures_deleted(), 1);
    assert_eq!(releases.load(Ordering::Relaxed), 1);
}

#[test]
fn deletion_unit_twice_is_harmless() {
    let (thread, stats) = spawn_gl("reclaim-twice");
    let releases = Arc::new(AtomicU64::new(0));
    let texture = {
        let releases = Arc::clone(&releases);
        Arc::new(
            thread
                .submit(Query::new("create", move |ctx| FakeTexture::create(ctx, releases)))
                .unwrap(),
        )
    };

    thread.submit(deletion_unit(Arc::clone(&texture))).unwrap();
    thread.submit(deletion_unit(Arc::clone(&texture))).unwrap();
    assert_eq!(stats.textures_deleted(), 1);
    assert_eq!(releases.load(Ordering::Relaxed), 1);
}

#[test]
fn adopt_tracks_existing_resource() {
    let (thread, stats) = spawn_gl("reclaim-adopt");
    let reclaimer = Reclaimer::new(&test_settings()).unwrap();
    let releases = Arc::new(AtomicU64::new(0));

    let raw = {
        let releases = Arc::clone(&releases);
        thread
            .submit(Query::new("create", move |ctx| FakeTexture::create(ctx, releases)))
            .unwrap()
    };
    let handle = reclaimer.adopt(&thread, raw);
    assert_eq!(handle.thread().name(), "reclaim-adopt");

    handle.delete_later().unwrap();
    drop(handle);
    assert_eq!(reclaimer.sweep_now(), 1);
    thread.submit(Command::noop()).unwrap();
    assert_eq!(stats.textures_deleted(), 1);
}

#[test]
fn background_sweep_reclaims_without_help() {
    let settings = Settings {
        sweep_interval: Duration::from_millis(10),
        ..test_settings()
    };
    let (thread, stats) = spawn_gl("reclaim-background");
    let reclaimer = Reclaimer::new(&settings).unwrap();
    let releases = Arc::new(AtomicU64::new(0));

    let texture = reclaimer
        .manage(&thread, move |ctx| FakeTexture::create(ctx, releases))
        .unwrap();
    drop(texture);

    for _ in 0..100 {
        if stats.textures_deleted() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(stats.textures_deleted(), 1);
    assert_eq!(reclaimer.enqueued(), 1);
}

#[test]
fn constructor_failure_is_not_tracked() {
    let (thread, _) = spawn_gl("reclaim-fail");
    let reclaimer = Reclaimer::new(&test_settings()).unwrap();
    let result = reclaimer.manage::<FakeTexture, _>(&thread, |_| Err("out of names".into()));
    assert!(matches!(result, Err(Error::SubmissionFailure { .. })));
    assert_eq!(reclaimer.tracked(), 0);
}

// ============================================================================
// Idle Reclamation
// ============================================================================

#[test]
fn idle_instance_is_evicted_and_restored() {
    init_logger();
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let cleanups = Arc::new(AtomicU64::new(0));
    let builds = Arc::new(AtomicU64::new(0));

    let atlas = {
        let cleanups = Arc::clone(&cleanups);
        let builds = Arc::clone(&builds);
        reclaimer.make_managed(
            vec![0u8; 16],
            IdlePolicy::After(Duration::from_millis(20)),
            move |_| {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1u8; 16])
            },
        )
    };
    assert_eq!(reclaimer.monitored(), 1);

    // Fresh: kept.
    assert_eq!(reclaimer.check_now(), 0);
    assert!(atlas.is_resident());

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(reclaimer.check_now(), 1);
    assert!(!atlas.is_resident());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(reclaimer.monitored(), 0);

    let restored = atlas.get().unwrap();
    assert_eq!(*restored, vec![1u8; 16]);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(atlas.restores(), 1);
    assert_eq!(atlas.evictions(), 1);
    assert_eq!(reclaimer.monitored(), 1);

    // Second access hits the resident instance.
    atlas.get().unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn access_resets_idle_clock() {
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let atlas = reclaimer.make_managed(1u32, IdlePolicy::After(Duration::from_millis(40)), |_| {}, || Ok(1));

    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(15));
        atlas.get().unwrap();
        assert_eq!(reclaimer.check_now(), 0);
    }
    assert!(atlas.is_resident());
}

#[test]
fn failing_restore_is_stale_and_retried() {
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let attempts = Arc::new(AtomicU64::new(0));
    let cache = {
        let attempts = Arc::clone(&attempts);
        reclaimer.make_managed(
            String::from("warm"),
            IdlePolicy::After(Duration::ZERO),
            |_| {},
            move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("device lost".into())
                } else {
                    Ok(String::from("rebuilt"))
                }
            },
        )
    };

    assert_eq!(reclaimer.check_now(), 1);
    assert!(matches!(cache.get(), Err(Error::StaleRestore { .. })));
    assert!(!cache.is_resident());
    assert_eq!(*cache.get().unwrap(), "rebuilt");
}

#[test]
fn disabled_policy_never_evicts() {
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let cleanups = Arc::new(AtomicU64::new(0));
    let pinned = {
        let cleanups = Arc::clone(&cleanups);
        reclaimer.make_managed(
            5u64,
            IdlePolicy::Disabled,
            move |_| {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
            || Ok(5),
        )
    };
    assert_eq!(reclaimer.monitored(), 0);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(reclaimer.check_now(), 0);
    assert!(pinned.is_resident());
    assert_eq!(pinned.policy(), IdlePolicy::Disabled);

    // Dropping the wrapper still cleans up the resident instance.
    drop(pinned);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn dropped_wrapper_leaves_monitoring() {
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let atlas = reclaimer.make_managed(0u8, IdlePolicy::After(Duration::ZERO), |_| {}, || Ok(0));
    assert_eq!(reclaimer.monitored(), 1);
    drop(atlas);
    assert_eq!(reclaimer.check_now(), 0);
    assert_eq!(reclaimer.monitored(), 0);
}

#[test]
fn native_resource_is_deleted_on_owner_and_restored() {
    init_logger();
    let (thread, stats) = spawn_gl("idle-native");
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let releases = Arc::new(AtomicU64::new(0));

    let first = {
        let releases = Arc::clone(&releases);
        thread
            .submit(Query::new("create", move |ctx| FakeTexture::create(ctx, releases)))
            .unwrap()
    };
    let texture = {
        let releases = Arc::clone(&releases);
        reclaimer.make_managed_native(&thread, first, move |ctx| FakeTexture::create(ctx, Arc::clone(&releases)))
    };
    assert_eq!(texture.policy(), IdlePolicy::After(Duration::from_millis(20)));
    let name = texture.get().unwrap().name.get();

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(reclaimer.check_now(), 1);
    thread.submit(Command::noop()).unwrap();
    assert_eq!(stats.textures_deleted(), 1);
    assert_eq!(*stats.deleted_textures.lock(), vec![name.unwrap()]);

    let restored = texture.get().unwrap();
    assert!(restored.is_valid());
    assert_ne!(restored.name.get(), name);
    assert_eq!(stats.textures_created.load(Ordering::Relaxed), 2);
}

#[test]
fn invalid_native_restore_is_stale() {
    let (thread, stats) = spawn_gl("idle-invalid");
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let releases = Arc::new(AtomicU64::new(0));

    let first = {
        let releases = Arc::clone(&releases);
        thread
            .submit(Query::new("create", move |ctx| FakeTexture::create(ctx, releases)))
            .unwrap()
    };
    let texture = {
        let releases = Arc::clone(&releases);
        reclaimer.make_managed_native(&thread, first, move |_| {
            Ok(FakeTexture {
                name: glthread::NativeHandle::new(0),
                releases: Arc::clone(&releases),
            })
        })
    };

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(reclaimer.check_now(), 1);
    assert!(matches!(texture.get(), Err(Error::StaleRestore { .. })));
    thread.submit(Command::noop()).unwrap();
    assert_eq!(stats.textures_deleted(), 1);
}

// ============================================================================
// Restores Across Threads
// ============================================================================

#[test]
fn owning_thread_restores_inline() {
    init_logger();
    let (thread, stats) = spawn_gl("idle-owner");
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let texture = evicted_texture(&thread, &reclaimer);

    // Plain get cannot submit to the thread it runs on.
    let t = texture.clone();
    let plain = thread
        .submit(Query::new("plain get", move |_: &mut ThreadContext| {
            Ok(matches!(t.get(), Err(Error::StaleRestore { .. })))
        }))
        .unwrap();
    assert!(plain);
    assert!(!texture.is_resident());

    let t = texture.clone();
    let name = thread
        .submit(Query::new("draw with texture", move |ctx: &mut ThreadContext| {
            Ok(t.get_in(ctx)?.name.get())
        }))
        .unwrap();
    assert!(name.is_some());
    assert!(texture.is_resident());
    assert_eq!(texture.restores(), 1);
    assert_eq!(stats.textures_created.load(Ordering::Relaxed), 2);

    // Later accesses from other threads see the same instance.
    assert_eq!(texture.get().unwrap().name.get(), name);
}

#[test]
fn owner_and_foreign_restores_do_not_deadlock() {
    init_logger();
    let (thread, stats) = spawn_gl("idle-race");
    let reclaimer = IdleReclaimer::new(&short_idle_settings()).unwrap();
    let texture = evicted_texture(&thread, &reclaimer);

    // The owning thread is busy when the foreign restore is submitted, so
    // that restore queues behind the unit that restores inline.
    let (owner_tx, owner_rx) = flume::bounded(1);
    let t = texture.clone();
    thread
        .schedule(Command::new("late draw", move |ctx: &mut ThreadContext| {
            std::thread::sleep(Duration::from_millis(50));
            let _ = owner_tx.send(t.get_in(ctx).map_err(|e| e.to_string()));
            Ok(())
        }))
        .unwrap();

    let (foreign_tx, foreign_rx) = flume::bounded(1);
    let t = texture.clone();
    std::thread::spawn(move || {
        let _ = foreign_tx.send(t.get().map_err(|e| e.to_string()));
    });

    let owner = owner_rx.recv_timeout(Duration::from_secs(5)).expect("owning thread deadlocked").unwrap();
    let foreign = foreign_rx.recv_timeout(Duration::from_secs(5)).expect("foreign thread deadlocked").unwrap();
    assert!(Arc::ptr_eq(&owner, &foreign));
    assert!(owner.is_valid());

    // A duplicate built by the losing restore is deleted on the owner.
    thread.submit(Command::noop()).unwrap();
    let created = stats.textures_created.load(Ordering::Relaxed);
    assert!((2..=3).contains(&created));
    assert_eq!(stats.textures_deleted(), created - 1);
    assert_eq!(texture.restores(), 1);
}
