//! Thread-local storage.
//!
//! Each TLS-bearing file owns a module index; each thread owns a TCB and a
//! DTV mapping module indices to that thread's block addresses. Static
//! blocks live below the thread pointer at offsets fixed before the
//! program starts (variant II); dynamic blocks are allocated lazily by the
//! first access from each thread. A global generation counter, bumped on
//! every module (de)registration, tells a thread when its DTV is stale.
//!
//! The fast path of [`get_addr_fast`] takes no lock: it only reads the
//! generation atomically and the calling thread's own DTV.

use crate::arch::{
    TCB_DTV_OFFSET, TCB_SELF_OFFSET, TCB_SIZE, TCB_SYSINFO_OFFSET, TCB_TCB_OFFSET,
};
use crate::engine::Rtld;
use crate::file::{ImageId, TlsTemplate};
use crate::segment::roundup;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};
use elf::abi::PT_TLS;

/// The process-wide TLS generation. Lives outside the engine record so the
/// access fast path can read it without the lock.
pub(crate) static TLS_GEN: AtomicUsize = AtomicUsize::new(0);

const WORD: usize = core::mem::size_of::<usize>();

/// One DTV slot. The layout must stay compatible with what libc debugging
/// tools expect: a value word followed by a word whose low bit flags a
/// static block and whose remaining bits hold the generation.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct DtvEntry {
    value: usize,
    meta: usize,
}

impl DtvEntry {
    #[inline]
    fn generation(&self) -> usize {
        self.meta >> 1
    }

    #[inline]
    fn is_static(&self) -> bool {
        self.meta & 1 == 1
    }

    #[inline]
    fn set(&mut self, value: usize, is_static: bool, generation: usize) {
        self.value = value;
        self.meta = (generation << 1) | usize::from(is_static);
    }
}

/// Smallest positive module index no initialized TLS file is using.
fn allocate_tls_index(rtld: &Rtld) -> usize {
    let mut index = 1;
    loop {
        let used = rtld.link_map.iter().any(|id| {
            let file = rtld.file(*id);
            file.tls_initialized && file.tls.map(|tls| tls.index) == Some(index)
        });
        if !used {
            return index;
        }
        index += 1;
    }
}

/// Record one file's TLS template and assign its module index. A file
/// without a PT_TLS segment is still marked initialized so the closure
/// walks terminate.
pub(crate) fn file_initialize(rtld: &mut Rtld, id: ImageId) {
    if rtld.file(id).tls_initialized {
        return;
    }
    let pt_tls = rtld
        .file(id)
        .phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_TLS)
        .copied();
    let Some(pt_tls) = pt_tls else {
        rtld.file_mut(id).tls_initialized = true;
        return;
    };
    // the index scan must happen before the flag flips
    let index = allocate_tls_index(rtld);
    let generation = TLS_GEN.load(Ordering::Relaxed);
    let file = rtld.file_mut(id);
    let is_static = file.dynamic.wants_static_tls();
    file.tls = Some(TlsTemplate {
        tmpl_start: file.load_base + pt_tls.p_vaddr as usize,
        tmpl_size: pt_tls.p_filesz as usize,
        zero_size: (pt_tls.p_memsz - pt_tls.p_filesz) as usize,
        align: pt_tls.p_align as usize,
        index,
        offset: 0,
        is_static,
        r#gen: generation,
    });
    file.tls_initialized = true;
    log::debug!(
        "tls module {} for {:?}, static={}",
        index,
        rtld.file(id).name,
        is_static
    );
    // template generation is visible before the global counter moves
    TLS_GEN.fetch_add(1, Ordering::Release);
    rtld.tls_n_dtv += 1;
}

/// Initialize TLS for a set of files. The main executable must end up
/// with module index 1 when it has TLS at all.
pub(crate) fn files_initialize(rtld: &mut Rtld, files: &[ImageId]) {
    for &id in files {
        if rtld.file(id).is_executable {
            file_initialize(rtld, id);
            break;
        }
    }
    for &id in files {
        if !rtld.file(id).is_executable {
            file_initialize(rtld, id);
        }
    }
}

/// Retire one file's TLS template. The module index is free for reuse and
/// every thread's DTV entry for it dies at its next update.
pub(crate) fn file_deinitialize(rtld: &mut Rtld, id: ImageId) {
    if !rtld.file(id).tls_initialized {
        return;
    }
    rtld.file_mut(id).tls_initialized = false;
    if rtld.file(id).tls.is_some() {
        TLS_GEN.fetch_add(1, Ordering::Release);
        rtld.tls_n_dtv -= 1;
    }
}

pub(crate) fn files_deinitialize(rtld: &mut Rtld, files: &[ImageId]) {
    for &id in files {
        file_deinitialize(rtld, id);
    }
}

/// Whether any of `files` asks for a static TLS block.
pub(crate) fn any_static_tls(rtld: &Rtld, files: &[ImageId]) -> bool {
    files.iter().any(|id| {
        rtld.file(*id)
            .tls
            .map(|tls| tls.is_static)
            .unwrap_or(false)
    })
}

/// Compute the static TLS layout, once, before the program runs.
///
/// Walks `files` in load order; for every static-TLS file the running size
/// advances by its block and aligns up, and the file's offset from the
/// thread pointer is the negative of the running size (variant II).
pub(crate) fn initialize_static(rtld: &mut Rtld, files: &[ImageId]) {
    TLS_GEN.store(1, Ordering::Release);
    files_initialize(rtld, files);

    let mut tcb_size = 0usize;
    let mut max_align = 1usize;
    for &id in files {
        let Some(mut tls) = rtld.file(id).tls else {
            continue;
        };
        if tls.is_static {
            tcb_size += tls.tmpl_size + tls.zero_size;
            tcb_size = roundup(tcb_size, tls.align);
            tls.offset = -(tcb_size as isize);
            max_align = max_align.max(tls.align);
            rtld.file_mut(id).tls = Some(tls);
        }
    }
    rtld.tls_static_size = roundup(tcb_size, max_align);
    rtld.tls_static_align = max_align;
}

/// Allocate the static TLS area plus the TCB for one thread and link the
/// TCB's self pointers. Returns the thread pointer value.
pub(crate) fn tcb_allocate(rtld: &Rtld) -> usize {
    let total = rtld.tls_static_size + TCB_SIZE;
    let align = rtld.tls_static_align.max(WORD);
    let layout = Layout::from_size_align(total, align).unwrap();
    let buffer = unsafe { alloc_zeroed(layout) } as usize;
    let tcb = buffer + rtld.tls_static_size;
    unsafe {
        ((tcb + TCB_TCB_OFFSET) as *mut usize).write(tcb);
        ((tcb + TCB_SELF_OFFSET) as *mut usize).write(tcb);
    }
    tcb
}

/// Store the vDSO syscall gate in the TCB.
pub(crate) fn tcb_initialize(tcb: usize, sysinfo: usize) {
    unsafe {
        ((tcb + TCB_SYSINFO_OFFSET) as *mut usize).write(sysinfo);
    }
}

pub(crate) fn tcb_deallocate(rtld: &Rtld, tcb: usize) {
    let total = rtld.tls_static_size + TCB_SIZE;
    let align = rtld.tls_static_align.max(WORD);
    let layout = Layout::from_size_align(total, align).unwrap();
    unsafe {
        dealloc((tcb - rtld.tls_static_size) as *mut u8, layout);
    }
}

fn dtv_layout(capacity: usize) -> Layout {
    Layout::array::<DtvEntry>(2 + capacity).unwrap()
}

/// Allocate a DTV sized for the current module count and install it in the
/// TCB. Slot `[-1]` keeps the capacity so the array can be walked and
/// freed later; slot 0 carries the generation.
pub(crate) fn dtv_allocate(rtld: &Rtld, tcb: usize) {
    let capacity = rtld.tls_n_dtv;
    let raw = unsafe { alloc_zeroed(dtv_layout(capacity)) } as *mut DtvEntry;
    unsafe {
        (*raw).set(capacity, false, 0);
        let dtv = raw.add(1);
        (*dtv).set(0, false, TLS_GEN.load(Ordering::Acquire));
        ((tcb + TCB_DTV_OFFSET) as *mut *mut DtvEntry).write(dtv);
    }
}

/// Fill the calling-out thread's DTV from the link map: static modules
/// point into the static area and get their template copied now, dynamic
/// modules stay empty until first access.
pub(crate) fn dtv_initialize(rtld: &Rtld, tcb: usize) {
    let dtv = unsafe { ((tcb + TCB_DTV_OFFSET) as *const *mut DtvEntry).read() };
    for &id in &rtld.link_map {
        let Some(tls) = rtld.file(id).tls else {
            continue;
        };
        unsafe {
            let entry = &mut *dtv.add(tls.index);
            if tls.is_static {
                let block = (tcb as isize + tls.offset) as usize;
                entry.set(block, true, tls.r#gen);
                core::ptr::copy_nonoverlapping(
                    tls.tmpl_start as *const u8,
                    block as *mut u8,
                    tls.tmpl_size,
                );
                core::ptr::write_bytes((block + tls.tmpl_size) as *mut u8, 0, tls.zero_size);
            } else {
                entry.set(0, false, tls.r#gen);
            }
        }
    }
    unsafe {
        (*dtv).set(0, false, TLS_GEN.load(Ordering::Acquire));
    }
}

/// Free every dynamic block of a thread's DTV plus the DTV itself.
pub(crate) fn dtv_deallocate(tcb: usize) {
    let dtv = unsafe { ((tcb + TCB_DTV_OFFSET) as *const *mut DtvEntry).read() };
    unsafe {
        let capacity = (*dtv.sub(1)).value;
        for module in 1..=capacity {
            let entry = &*dtv.add(module);
            if entry.value == 0 || entry.is_static() {
                continue;
            }
            free_module_block(entry.value);
        }
        dealloc(dtv.sub(1) as *mut u8, dtv_layout(capacity));
    }
}

/// Allocate one module's dynamic block for the calling thread: a size
/// header word followed by template plus zero tail.
unsafe fn allocate_module_block(tls: &TlsTemplate) -> usize {
    let size = WORD + tls.tmpl_size + tls.zero_size;
    let layout = Layout::from_size_align(size, WORD).unwrap();
    unsafe {
        let raw = alloc_zeroed(layout) as *mut usize;
        raw.write(size);
        let block = raw.add(1) as usize;
        core::ptr::copy_nonoverlapping(
            tls.tmpl_start as *const u8,
            block as *mut u8,
            tls.tmpl_size,
        );
        core::ptr::write_bytes((block + tls.tmpl_size) as *mut u8, 0, tls.zero_size);
        block
    }
}

unsafe fn free_module_block(block: usize) {
    unsafe {
        let raw = (block as *mut usize).sub(1);
        let size = raw.read();
        dealloc(raw as *mut u8, Layout::from_size_align(size, WORD).unwrap());
    }
}

fn current_dtv() -> *mut DtvEntry {
    let tp = crate::arch::thread_pointer();
    unsafe { ((tp + TCB_DTV_OFFSET) as *const *mut DtvEntry).read() }
}

/// The lock-free fast path: if this thread's DTV is current and the module
/// block exists, return its address; zero means take the slow path.
pub(crate) fn get_addr_fast(module: usize, offset: usize) -> usize {
    let dtv = current_dtv();
    unsafe {
        if (*dtv).generation() == TLS_GEN.load(Ordering::Acquire) && (*dtv.add(module)).value != 0
        {
            return (*dtv.add(module)).value + offset;
        }
    }
    0
}

/// The slow path, entered with the engine lock held: bring the DTV up to
/// date and/or allocate the module's block for this thread.
pub(crate) fn get_addr_slow(rtld: &mut Rtld, module: usize, offset: usize) -> usize {
    loop {
        let addr = get_addr_fast(module, offset);
        if addr != 0 {
            return addr;
        }
        let dtv = current_dtv();
        let current = unsafe { (*dtv).generation() } == TLS_GEN.load(Ordering::Acquire);
        if current {
            // up to date, the entry just has not been materialized yet
            let id = rtld
                .find_by_module(module)
                .expect("tls access to an unloaded module");
            let tls = rtld.file(id).tls.unwrap();
            unsafe {
                let block = allocate_module_block(&tls);
                (*dtv.add(module)).set(block, false, tls.r#gen);
                return block + offset;
            }
        }
        update_dtv(rtld);
    }
}

/// Reconcile the calling thread's DTV with the link map: free blocks of
/// unloaded modules, reset reloaded ones, and grow the vector when new
/// modules exceed its capacity.
fn update_dtv(rtld: &Rtld) {
    let tp = crate::arch::thread_pointer();
    let dtv = current_dtv();
    let capacity = unsafe { (*dtv.sub(1)).value };
    let global_gen = TLS_GEN.load(Ordering::Acquire);
    debug_assert!(
        unsafe { (*dtv).generation() } != global_gen,
        "dtv update without a stale dtv"
    );

    unsafe {
        for module in 1..=capacity {
            let entry = &mut *dtv.add(module);
            if entry.value == 0 {
                continue;
            }
            let file = rtld.find_by_module(module);
            let template_gen = file.and_then(|id| rtld.file(id).tls.map(|tls| tls.r#gen));
            if template_gen == Some(entry.generation()) {
                // entry is current
                continue;
            }
            // the module was unloaded, or unloaded and replaced
            if !entry.is_static() {
                free_module_block(entry.value);
            }
            entry.set(0, false, 0);
        }
    }

    if rtld.tls_n_dtv <= capacity {
        unsafe {
            (*dtv).set((*dtv).value, (*dtv).is_static(), global_gen);
        }
        return;
    }

    // grow: allocate the right-sized vector and carry the live slots over
    dtv_allocate(rtld, tp);
    let new_dtv = current_dtv();
    unsafe {
        for module in 1..=capacity {
            *new_dtv.add(module) = *dtv.add(module);
        }
        (*new_dtv).set(0, false, global_gen);
        dealloc(dtv.sub(1) as *mut u8, dtv_layout(capacity));
    }
}

/// Total thread TLS footprint handed to the pthread library: static area
/// plus the thread control block, and its alignment.
pub(crate) fn static_info(rtld: &Rtld) -> (usize, usize) {
    (rtld.tls_static_size + TCB_SIZE, rtld.tls_static_align)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn module_indices_are_distinct_and_start_at_one() {
        let (mut rtld, ctx) = testutil::engine();
        let exec = rtld.insert_file(testutil::image_with_tls(
            ctx, "main", 0x100000, 0x40, 0x80, 8, true,
        ));
        rtld.file_mut(exec).is_executable = true;
        let liba = rtld.insert_file(testutil::image_with_tls(
            ctx, "liba", 0x200000, 0x10, 0x10, 8, true,
        ));
        let plain = rtld.insert_file(testutil::image(ctx, "plain", 0x300000, &[]));

        files_initialize(&mut rtld, &[liba, exec, plain]);
        // the executable claims module 1 even when listed later
        assert_eq!(rtld.file(exec).tls.unwrap().index, 1);
        assert_eq!(rtld.file(liba).tls.unwrap().index, 2);
        assert!(rtld.file(plain).tls.is_none());
        assert!(rtld.file(plain).tls_initialized);
        assert_eq!(rtld.tls_n_dtv, 2);
    }

    #[test]
    fn retired_indices_are_reused() {
        let (mut rtld, ctx) = testutil::engine();
        let a = rtld.insert_file(testutil::image_with_tls(
            ctx, "a", 0x100000, 0x10, 0x10, 8, false,
        ));
        let b = rtld.insert_file(testutil::image_with_tls(
            ctx, "b", 0x200000, 0x10, 0x10, 8, false,
        ));
        files_initialize(&mut rtld, &[a, b]);
        assert_eq!(rtld.file(a).tls.unwrap().index, 1);
        assert_eq!(rtld.file(b).tls.unwrap().index, 2);

        file_deinitialize(&mut rtld, a);
        let c = rtld.insert_file(testutil::image_with_tls(
            ctx, "c", 0x300000, 0x10, 0x10, 8, false,
        ));
        file_initialize(&mut rtld, c);
        assert_eq!(rtld.file(c).tls.unwrap().index, 1);
        assert_eq!(rtld.tls_n_dtv, 2);
    }

    #[test]
    fn static_layout_accumulates_aligned_blocks() {
        let (mut rtld, ctx) = testutil::engine();
        let exec = rtld.insert_file(testutil::image_with_tls(
            ctx, "main", 0x100000, 0x30, 0x50, 0x20, true,
        ));
        rtld.file_mut(exec).is_executable = true;
        let liba = rtld.insert_file(testutil::image_with_tls(
            ctx, "liba", 0x200000, 0x08, 0x10, 0x10, true,
        ));
        let dynamic_only = rtld.insert_file(testutil::image_with_tls(
            ctx, "libd", 0x300000, 0x08, 0x08, 8, false,
        ));

        initialize_static(&mut rtld, &[exec, liba, dynamic_only]);

        // exec: 0x50 bytes aligned to 0x20 -> running size 0x60
        let exec_tls = rtld.file(exec).tls.unwrap();
        assert_eq!(exec_tls.offset, -0x60);
        // liba: 0x60 + 0x10 aligned to 0x10 -> 0x70
        let liba_tls = rtld.file(liba).tls.unwrap();
        assert_eq!(liba_tls.offset, -0x70);
        // total rounded to the max alignment
        assert_eq!(rtld.tls_static_size, 0x80);
        assert_eq!(rtld.tls_static_align, 0x20);
        // the dynamic module takes no static space but owns a dtv slot
        assert_eq!(rtld.tls_n_dtv, 3);
        assert_eq!(rtld.file(dynamic_only).tls.unwrap().offset, 0);
    }
}
