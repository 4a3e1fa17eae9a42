//! End-to-end tests of the code cache against the in-memory host.

use std::sync::Arc;

use kiln_jit::blob::{self, BlobHeader};
use kiln_jit::jni::{JniStubKey, JniStubTable};
use kiln_jit::testing::FakeHost;
use kiln_jit::{
    AotImage, AotMethod, ClassInfo, CodeCacheConfig, CommitRequest, CompilationKind, Frame, Host,
    JitCodeCache, JniPrepare, MethodFlags, MethodHandle, ObjectRef, PackageId, ProfiledClass,
    RootKind, ZygoteCompilationState,
};

fn setup(config: CodeCacheConfig) -> (Arc<FakeHost>, Arc<JitCodeCache>) {
    let host = Arc::new(FakeHost::new());
    let cache = JitCodeCache::new(config, host.clone()).expect("cache creation failed");
    (host, cache)
}

fn compile(cache: &JitCodeCache, method: MethodHandle, size: usize, kind: CompilationKind) -> usize {
    let code = vec![0xC3; size];
    let reservation = cache.reserve(size, 0, 0).expect("reserve failed");
    let entry = reservation.entry();
    assert!(cache.commit(reservation, &CommitRequest::new(method, &code, kind)));
    entry
}

fn frame(pc: usize, method: MethodHandle) -> Frame {
    Frame {
        pc,
        method: Some(method),
        is_inlined: false,
    }
}

// =============================================================================
// Publication and lookup
// =============================================================================

#[test]
fn test_lookup_covers_exactly_the_committed_code() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x1000, "V", MethodFlags::empty());

    let code = vec![0x90; 4096];
    let stack_map = vec![0xAB; 1024];
    let reservation = cache.reserve(4096, 1024, 0).unwrap();
    assert!(reservation.data_capacity() >= 1024);
    let entry = reservation.entry();
    let request =
        CommitRequest::new(method, &code, CompilationKind::Optimized).with_stack_map(&stack_map);
    assert!(cache.commit(reservation, &request));

    let end = entry + 4096;
    let info = cache.lookup_header(end - 1, None).expect("last byte must resolve");
    assert_eq!(info.entry, entry);
    assert_eq!(info.code_size, 4096);
    assert_eq!(info.method, Some(method));
    assert!(cache.lookup_header(end, None).is_none());

    let header = unsafe { BlobHeader::read(entry) };
    assert_ne!(header.side_table, 0);
    assert_eq!(unsafe { blob::stack_map(header.side_table) }, &stack_map[..]);
    assert!(unsafe { blob::debug_info(header.side_table) }.is_empty());
}

#[test]
fn test_every_pc_resolves_to_its_own_blob() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let blobs: Vec<(usize, usize)> = (1..=16)
        .map(|i| {
            let method = host.add_method(0x1000 * i, "V", MethodFlags::empty());
            let size = 24 * i;
            (compile(&cache, method, size, CompilationKind::Baseline), size)
        })
        .collect();
    for &(entry, size) in &blobs {
        for pc in [entry, entry + size / 2, entry + size - 1] {
            assert_eq!(cache.lookup_header(pc, None).map(|i| i.entry), Some(entry));
        }
        assert!(cache.contains(entry));
    }
}

#[test]
fn test_jni_stub_table_order_and_removal() {
    let host = FakeHost::new();
    let mut table = JniStubTable::new();
    let mut keys = Vec::new();
    for (i, shorty) in ["VV", "ILJ", "V"].into_iter().enumerate() {
        let method = host.add_method(0x100 * (i + 1), shorty, MethodFlags::NATIVE | MethodFlags::STATIC);
        let key = JniStubKey::new(&host.method_info(method));
        table.add_method(&key, method);
        table.set_code(&key, 0x10_000 * (i + 1));
        keys.push((method, key));
    }
    let order: Vec<String> = table.iter().map(|(k, _)| k.shorty().to_string()).collect();
    assert_eq!(order, ["V", "ILJ", "VV"]);

    let (ilj, ilj_key) = &keys[1];
    table.remove_method(ilj_key, *ilj);
    let order: Vec<String> = table.iter().map(|(k, _)| k.shorty().to_string()).collect();
    assert_eq!(order, ["V", "VV"]);
}

#[test]
fn test_jni_stub_retired_with_its_last_method() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let flags = MethodFlags::NATIVE | MethodFlags::STATIC;
    let first = host.add_method(0x100, "ILJ", flags);
    let second = host.add_method(0x200, "ILJ", flags);
    let other = host.add_method(0x300, "V", flags);

    assert_eq!(cache.prepare_jni_compilation(first), JniPrepare::Compile);
    let stub = compile(&cache, first, 32, CompilationKind::Optimized);
    assert_eq!(cache.prepare_jni_compilation(second), JniPrepare::Installed(stub));
    assert_eq!(cache.prepare_jni_compilation(other), JniPrepare::Compile);
    compile(&cache, other, 32, CompilationKind::Optimized);
    assert_eq!(cache.stats().jni_entries, 2);

    cache.invalidate_compiled_code_for(first);
    assert_eq!(cache.jni_stub_for(second), Some(stub));
    assert_eq!(host.entry_point(first), FakeHost::INTERPRETER_ENTRY);
    assert_eq!(cache.stats().zombies, 0);

    cache.invalidate_compiled_code_for(second);
    assert_eq!(cache.jni_stub_for(second), None);
    assert_eq!(cache.stats().jni_entries, 1);
    assert_eq!(cache.stats().zombies, 1);
}

// =============================================================================
// Retirement and collection
// =============================================================================

#[test]
fn test_single_collection_task_for_many_retirements() {
    let config = CodeCacheConfig {
        collection_threshold: 1000,
        ..CodeCacheConfig::for_testing()
    };
    let (host, cache) = setup(config);
    let methods: Vec<MethodHandle> = (1..=1002)
        .map(|i| host.add_method(0x100 * i, "V", MethodFlags::empty()))
        .collect();
    for &method in &methods {
        compile(&cache, method, 16, CompilationKind::Baseline);
    }

    for &method in &methods[..999] {
        cache.invalidate_compiled_code_for(method);
    }
    assert_eq!(host.enqueued_tasks(), 0);

    cache.invalidate_compiled_code_for(methods[999]);
    cache.invalidate_compiled_code_for(methods[1000]);
    assert_eq!(host.enqueued_tasks(), 1);
    assert!(cache.is_collection_scheduled());

    cache.invalidate_compiled_code_for(methods[1001]);
    assert_eq!(host.enqueued_tasks(), 1);

    assert_eq!(host.run_pending_tasks(), 1);
    let stats = cache.stats();
    assert_eq!(stats.collections, 1);
    assert_eq!(stats.blobs_freed, 1002);
    assert_eq!(stats.zombies, 0);
    assert!(!cache.is_collection_scheduled());
}

#[test]
fn test_collection_keeps_code_on_stacks() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let busy = host.add_method(0x100, "V", MethodFlags::empty());
    let idle = host.add_method(0x200, "V", MethodFlags::empty());
    let busy_old = compile(&cache, busy, 64, CompilationKind::Baseline);
    let idle_old = compile(&cache, idle, 64, CompilationKind::Baseline);
    compile(&cache, busy, 64, CompilationKind::Optimized);
    compile(&cache, idle, 64, CompilationKind::Optimized);
    assert_eq!(cache.stats().zombies, 2);

    host.set_thread_stacks(vec![vec![frame(busy_old + 8, busy)], vec![]]);
    cache.collect();

    let stats = cache.stats();
    assert_eq!(stats.blobs_freed, 1);
    assert_eq!(stats.blobs_kept, 1);
    assert_eq!(stats.zombies, 1);
    assert_eq!(cache.lookup_header(busy_old + 8, Some(busy)).map(|i| i.entry), Some(busy_old));
    assert!(cache.lookup_header(idle_old, None).is_none());

    host.set_thread_stacks(Vec::new());
    cache.collect();
    assert_eq!(cache.stats().zombies, 0);
    assert!(cache.lookup_header(busy_old, None).is_none());
}

#[test]
fn test_retired_jni_stub_on_stack_survives_collection() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::NATIVE | MethodFlags::STATIC);
    assert_eq!(cache.prepare_jni_compilation(method), JniPrepare::Compile);
    let stub = compile(&cache, method, 32, CompilationKind::Optimized);
    cache.invalidate_compiled_code_for(method);
    assert_eq!(cache.jni_stub_for(method), None);
    assert_eq!(cache.stats().zombies, 1);

    host.set_thread_stacks(vec![vec![frame(stub + 8, method)]]);
    cache.collect();
    let stats = cache.stats();
    assert_eq!(stats.blobs_freed, 0);
    assert_eq!(stats.blobs_kept, 1);
    assert_eq!(stats.zombies, 1);
    assert_eq!(cache.lookup_header(stub + 8, Some(method)).map(|i| i.entry), Some(stub));

    host.set_thread_stacks(Vec::new());
    cache.collect();
    assert_eq!(cache.stats().blobs_freed, 1);
    assert_eq!(cache.stats().zombies, 0);
    assert!(cache.lookup_header(stub, None).is_none());
}

#[test]
fn test_replaced_jni_stub_on_stack_survives_collection() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "IJ", MethodFlags::NATIVE | MethodFlags::STATIC);
    cache.prepare_jni_compilation(method);
    let old = compile(&cache, method, 32, CompilationKind::Baseline);
    let new = compile(&cache, method, 32, CompilationKind::Optimized);
    assert_eq!(cache.jni_stub_for(method), Some(new));
    assert_eq!(host.entry_point(method), new);

    host.set_thread_stacks(vec![vec![frame(old + 4, method)]]);
    cache.collect();
    assert_eq!(cache.stats().blobs_kept, 1);
    assert_eq!(cache.lookup_header(old + 4, None).map(|i| i.entry), Some(old));
}

#[test]
fn test_code_retired_while_marking_schedules_next_collection() {
    let config = CodeCacheConfig {
        collection_threshold: 2,
        ..CodeCacheConfig::for_testing()
    };
    let (host, cache) = setup(config);
    let methods: Vec<MethodHandle> = (1..=4)
        .map(|i| host.add_method(0x100 * i, "V", MethodFlags::empty()))
        .collect();
    for &method in &methods {
        compile(&cache, method, 16, CompilationKind::Baseline);
    }
    cache.invalidate_compiled_code_for(methods[0]);
    cache.invalidate_compiled_code_for(methods[1]);
    assert_eq!(host.enqueued_tasks(), 1);

    let during = Arc::clone(&cache);
    let late = [methods[2], methods[3]];
    host.before_next_checkpoint(move || {
        for method in late {
            during.invalidate_compiled_code_for(method);
        }
    });
    assert_eq!(host.run_pending_tasks(), 1);
    assert_eq!(cache.stats().blobs_freed, 2);
    assert_eq!(cache.stats().zombies, 2);
    assert_eq!(host.enqueued_tasks(), 1);
    assert!(cache.is_collection_scheduled());

    assert_eq!(host.run_pending_tasks(), 1);
    assert_eq!(cache.stats().blobs_freed, 4);
    assert_eq!(host.enqueued_tasks(), 0);
}

#[test]
fn test_inlined_frames_do_not_keep_code_alive() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let old = compile(&cache, method, 64, CompilationKind::Baseline);
    compile(&cache, method, 64, CompilationKind::Optimized);

    host.set_thread_stacks(vec![vec![Frame {
        pc: old + 4,
        method: Some(method),
        is_inlined: true,
    }]]);
    cache.collect();
    assert_eq!(cache.stats().blobs_freed, 1);
}

#[test]
fn test_still_installed_zombie_is_requeued() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let entry = compile(&cache, method, 32, CompilationKind::Optimized);
    cache.invalidate_compiled_code_for(method);
    // A racing updater swung the entry back before the collection ran.
    host.set_entry_point(method, entry);

    cache.collect();
    let stats = cache.stats();
    assert_eq!(stats.blobs_requeued, 1);
    assert_eq!(stats.blobs_freed, 0);
    assert_eq!(stats.zombies, 1);
    assert!(cache.lookup_header(entry, None).is_some());

    host.reinitialize_to_default(method);
    cache.collect();
    assert_eq!(cache.stats().blobs_freed, 1);
}

#[test]
fn test_osr_code_is_retired_by_each_collection() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let osr = compile(&cache, method, 32, CompilationKind::Osr);
    assert_eq!(cache.osr_entry_for(method), Some(osr));

    cache.collect();
    assert_eq!(cache.osr_entry_for(method), None);
    assert!(cache.lookup_header(osr, None).is_none());
}

#[test]
fn test_invalidate_all_is_idempotent() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let methods: Vec<MethodHandle> = (1..=4)
        .map(|i| host.add_method(0x100 * i, "V", MethodFlags::empty()))
        .collect();
    for &method in &methods {
        compile(&cache, method, 32, CompilationKind::Optimized);
    }

    cache.invalidate_all_compiled();
    let first = cache.stats();
    assert_eq!(first.invalidations, 4);
    assert_eq!(first.zombies, 4);
    for &method in &methods {
        assert_eq!(host.entry_point(method), FakeHost::INTERPRETER_ENTRY);
    }

    cache.invalidate_all_compiled();
    let second = cache.stats();
    assert_eq!(second.invalidations, first.invalidations);
    assert_eq!(second.zombies, first.zombies);
    for &method in &methods {
        assert_eq!(host.entry_point(method), FakeHost::INTERPRETER_ENTRY);
    }
}

#[test]
fn test_remove_methods_in_frees_everything_in_range() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let unloaded: Vec<MethodHandle> = (0..4)
        .map(|i| host.add_method(0x10_000 + 0x40 * i, "V", MethodFlags::empty()))
        .collect();
    let kept = host.add_method(0x90_000, "V", MethodFlags::empty());
    for &method in &unloaded {
        compile(&cache, method, 48, CompilationKind::Baseline);
        cache.add_profiling_record(method, &[1, 2], &[3]);
    }
    let kept_entry = compile(&cache, kept, 48, CompilationKind::Baseline);

    cache.remove_methods_in(0x10_000..0x20_000);

    let mut remaining = Vec::new();
    cache.visit_all(|entry, method| remaining.push((entry, method)));
    assert_eq!(remaining, [(kept_entry, kept)]);
    for &method in &unloaded {
        assert!(cache.profiling_record(method).is_none());
    }
    assert_eq!(cache.stats().indexed_blobs, 1);
}

// =============================================================================
// GC roots
// =============================================================================

#[test]
fn test_weak_sweep_updates_strings_and_clears_classes() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let string = ObjectRef::from_addr(0x5000);
    let moved_string = ObjectRef::from_addr(0x6000);
    let class = ObjectRef::from_addr(0x7000);
    host.set_root_kind(string, RootKind::String);
    host.set_root_kind(class, RootKind::Class);

    let roots = [string, class];
    let reservation = cache.reserve(32, 0, roots.len()).unwrap();
    let entry = reservation.entry();
    let code = [0x90; 32];
    let request = CommitRequest::new(method, &code, CompilationKind::Optimized).with_roots(&roots);
    assert!(cache.commit(reservation, &request));

    cache.sweep_weak(&mut |obj| if obj == string { Some(moved_string) } else { None });

    let header = unsafe { BlobHeader::read(entry) };
    let swept = unsafe { blob::roots_mut(header.side_table) };
    assert_eq!(swept, &[moved_string, ObjectRef::WEAK_SENTINEL]);
}

#[test]
fn test_visit_roots_reports_strong_roots_only() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let class = ObjectRef::from_addr(0x7000);
    let method_type = ObjectRef::from_addr(0x7100);
    let other = ObjectRef::from_addr(0x7200);
    host.set_root_kind(class, RootKind::Class);
    host.set_root_kind(method_type, RootKind::MethodType);

    let roots = [class, method_type, other];
    let reservation = cache.reserve(16, 0, roots.len()).unwrap();
    let code = [0x90; 16];
    let request = CommitRequest::new(method, &code, CompilationKind::Optimized).with_roots(&roots);
    assert!(cache.commit(reservation, &request));

    let mut visited = Vec::new();
    cache.visit_roots(&mut |root: &mut ObjectRef| visited.push(*root));
    assert_eq!(visited, [method_type, other]);
    assert_eq!(host.write_barriers(), [host.method_info(method).declaring_class]);
}

// =============================================================================
// Profiling
// =============================================================================

#[test]
fn test_profiled_methods_export_hot_compiled_methods() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let hot = host.add_method(0x100, "V", MethodFlags::empty());
    let cold = host.add_method(0x200, "V", MethodFlags::empty());
    let interpreted = host.add_method(0x300, "V", MethodFlags::empty());

    let local = ObjectRef::from_addr(0x9000);
    let array = ObjectRef::from_addr(0x9100);
    let foreign = ObjectRef::from_addr(0x9200);
    let class = |descriptor: &str, package: u32, type_index: u32, is_array: bool| ClassInfo {
        descriptor: Arc::from(descriptor),
        package: PackageId(package),
        type_index,
        is_array,
    };
    host.add_class(local, class("Lapp/Local;", 0, 4, false));
    host.add_class(array, class("[Lapp/Local;", 1, 2, true));
    host.add_class(foreign, class("Lother/Foreign;", 1, 7, false));
    host.add_type_index(PackageId(0), "[Lapp/Local;", 11);

    for (method, hotness) in [(hot, 10), (cold, u16::MAX), (interpreted, 0)] {
        let record = cache.add_profiling_record(method, &[5, 9], &[]).unwrap();
        unsafe { record.as_ref() }.set_baseline_hotness(hotness);
    }
    compile(&cache, hot, 32, CompilationKind::Baseline);
    compile(&cache, cold, 32, CompilationKind::Baseline);

    let record = unsafe { cache.profiling_record(hot).unwrap().as_ref() };
    let ic = record.inline_cache(5).unwrap();
    for receiver in [local, array, foreign] {
        ic.update(receiver);
    }

    let profiles = cache.get_profiled_methods(100);
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].method, hot);
    let exported = &profiles[0].inline_caches[0];
    assert_eq!(exported.dex_pc, 5);
    assert_eq!(
        exported.classes,
        [
            ProfiledClass { package: PackageId(0), type_index: 4 },
            ProfiledClass { package: PackageId(0), type_index: 11 },
        ]
    );
    assert!(exported.is_missing_types);
    assert!(!exported.is_megamorphic);
    let untouched = &profiles[0].inline_caches[1];
    assert!(untouched.classes.is_empty() && !untouched.is_missing_types);

    cache.invalidate_compiled_code_for(hot);
    assert!(cache.get_profiled_methods(100).is_empty());
}

// =============================================================================
// AOT images
// =============================================================================

#[test]
fn test_executable_aot_image_installs_entry_points() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let jitted = host.add_method(0x100, "V", MethodFlags::empty());
    let precompiled = host.add_method(0x200, "V", MethodFlags::empty());
    let jit_entry = compile(&cache, jitted, 32, CompilationKind::Optimized);

    let methods = vec![
        AotMethod { method: jitted, entry: 0x7000_1000, code_size: 0x40 },
        AotMethod { method: precompiled, entry: 0x7000_1100, code_size: 0x40 },
    ];
    let inspected = AotImage::new("/data/app/inspect.oat", 0x7000_0000..0x7000_2000, methods.clone(), 0..0);
    let id = cache.register_aot_image(inspected);
    assert_eq!(host.entry_point(precompiled), FakeHost::INTERPRETER_ENTRY);
    assert!(cache.unregister_aot_image(id));

    let image = AotImage::new("/data/app/base.oat", 0x7000_0000..0x7000_2000, methods, 0..0)
        .executable(true);
    let id = cache.register_aot_image(image);
    assert_eq!(host.entry_point(jitted), jit_entry);
    assert_eq!(host.entry_point(precompiled), 0x7000_1100);

    assert!(cache.unregister_aot_image(id));
    assert!(!cache.unregister_aot_image(id));
    assert_eq!(host.entry_point(precompiled), FakeHost::INTERPRETER_ENTRY);
    assert_eq!(host.entry_point(jitted), jit_entry);
}

// =============================================================================
// Zygote and fork
// =============================================================================

#[test]
fn test_zygote_rejects_movable_roots() {
    let config = CodeCacheConfig {
        is_zygote: true,
        ..CodeCacheConfig::for_testing()
    };
    let (host, cache) = setup(config);
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let pinned = ObjectRef::from_addr(0x5000);
    let movable = ObjectRef::from_addr(0x6000);
    host.set_moving(movable, true);

    let roots = [pinned, movable];
    let code = [0x90; 16];
    let request = CommitRequest::new(method, &code, CompilationKind::Optimized).with_roots(&roots);
    let reservation = cache.reserve(code.len(), 0, roots.len()).unwrap();
    let entry = reservation.entry();
    assert!(!cache.commit(reservation, &request));
    assert_eq!(cache.stats().commits_discarded, 1);
    assert!(cache.lookup_header(entry, None).is_none());
    assert_eq!(host.entry_point(method), FakeHost::INTERPRETER_ENTRY);

    host.set_moving(movable, false);
    let reservation = cache.reserve(code.len(), 0, roots.len()).unwrap();
    let entry = reservation.entry();
    assert!(cache.commit(reservation, &request));
    assert_eq!(host.entry_point(method), entry);
}

#[test]
fn test_private_region_accepts_movable_roots() {
    let (host, cache) = setup(CodeCacheConfig::for_testing());
    let method = host.add_method(0x100, "V", MethodFlags::empty());
    let movable = ObjectRef::from_addr(0x6000);
    host.set_moving(movable, true);

    let roots = [movable];
    let code = [0x90; 16];
    let reservation = cache.reserve(code.len(), 0, roots.len()).unwrap();
    let request = CommitRequest::new(method, &code, CompilationKind::Optimized).with_roots(&roots);
    assert!(cache.commit(reservation, &request));
}

#[test]
fn test_child_reads_zygote_code_and_compiles_privately() {
    let config = CodeCacheConfig {
        is_zygote: true,
        ..CodeCacheConfig::for_testing()
    };
    let (host, cache) = setup(config);
    let methods: Vec<MethodHandle> = (1..=8)
        .map(|i| host.add_method(0x100 * i, "V", MethodFlags::empty()))
        .collect();
    let entries: Vec<usize> = methods
        .iter()
        .map(|&m| compile(&cache, m, 32, CompilationKind::Optimized))
        .collect();

    assert_eq!(cache.publish_zygote_map(), 8);
    assert_eq!(cache.zygote_compilation_state(), ZygoteCompilationState::Done);
    cache.pre_fork();
    assert_eq!(cache.zygote_compilation_state(), ZygoteCompilationState::NotifiedChildren);

    cache.post_fork_child(false, false);
    assert_eq!(cache.code_for(methods[3]), Some(entries[3]));
    assert!(cache.in_shared_region(entries[3]));
    assert!(!cache.in_private_region(entries[3]));
    assert_eq!(cache.lookup_header(entries[3] + 4, None).map(|i| i.entry), Some(entries[3]));

    let fresh = host.add_method(0x10_000, "V", MethodFlags::empty());
    let fresh_entry = compile(&cache, fresh, 32, CompilationKind::Baseline);
    assert!(cache.in_private_region(fresh_entry));
    assert!(!cache.in_shared_region(fresh_entry));
    assert!(cache.contains(fresh_entry) && cache.contains(entries[0]));
}

#[test]
fn test_safe_mode_child_has_no_private_region() {
    let config = CodeCacheConfig {
        is_zygote: true,
        ..CodeCacheConfig::for_testing()
    };
    let (_host, cache) = setup(config);
    cache.post_fork_child(false, true);
    assert!(matches!(cache.reserve(16, 0, 0), Err(kiln_jit::CacheError::Disabled)));
}
