//! The process-wide linker state.
//!
//! One [`Rtld`] value owns every mapped file and namespace. Files live in
//! an arena keyed by [`ImageId`]; the ordered link map is a separate list
//! of ids with the main executable pinned at the head for debugger
//! compatibility. The single global instance sits behind the engine futex,
//! accessed through [`GlobalRtld::lock`].

use crate::context::Namespace;
use crate::file::{ContextId, ElfImage, Event, ImageId};
use crate::futex::Futex;
use alloc::ffi::CString;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ffi::CStr;
use core::ops::{Deref, DerefMut};
use hashbrown::HashMap;

pub struct Rtld {
    files: HashMap<ImageId, ElfImage>,
    next_file: u32,
    /// Ordered link map. Head is the main executable, when there is one.
    pub link_map: Vec<ImageId>,
    contexts: HashMap<ContextId, Namespace>,
    next_context: u32,

    /// Resolve every relocation at load time (LD_BIND_NOW).
    pub bind_now: bool,
    /// Load base of the interpreter itself.
    pub ldso_base: usize,
    /// The interpreter's own entry on the link map, shared by every
    /// namespace.
    pub ldso: Option<ImageId>,
    /// Set once the program has been handed control; from then on the
    /// static TLS area cannot grow.
    pub startup_done: bool,

    /// Total size of the static TLS block, fixed at startup.
    pub tls_static_size: usize,
    /// Alignment of the static TLS block.
    pub tls_static_align: usize,
    /// Number of DTV slots currently spoken for.
    pub tls_n_dtv: usize,

    /// Counters handed out through dl_iterate_phdr so callers can cache.
    pub n_added: u64,
    pub n_removed: u64,

    /// LD_LIBRARY_PATH captured from the kernel handoff.
    pub ld_library_path: Option<CString>,
    /// Top of the main stack, exported to libc.
    pub stack_end: usize,
    /// vDSO syscall gate from the aux vector.
    pub sysinfo: usize,

    /// Per-thread dlerror strings, keyed by thread pointer. The bool marks
    /// a string already handed out; it stays allocated so the pointer the
    /// caller got remains valid until the next error replaces it.
    errors: HashMap<usize, (CString, bool)>,
}

impl Rtld {
    pub fn new() -> Rtld {
        Rtld {
            files: HashMap::new(),
            next_file: 1,
            link_map: Vec::new(),
            contexts: HashMap::new(),
            next_context: 1,
            bind_now: false,
            ldso_base: 0,
            ldso: None,
            startup_done: false,
            tls_static_size: 0,
            tls_static_align: 1,
            tls_n_dtv: 0,
            n_added: 0,
            n_removed: 0,
            ld_library_path: None,
            stack_end: 0,
            sysinfo: 0,
            errors: HashMap::new(),
        }
    }

    /// Register a freshly mapped file: assign its id and append it to the
    /// link map tail.
    pub fn insert_file(&mut self, file: ElfImage) -> ImageId {
        let id = ImageId(self.next_file);
        self.next_file += 1;
        self.files.insert(id, file);
        self.link_map.push(id);
        self.n_added += 1;
        id
    }

    /// Take a file off the ordered link map while keeping its record in
    /// the arena; the unload path still needs it for destructors and
    /// unmapping.
    pub fn unlink_file(&mut self, id: ImageId) {
        if let Some(pos) = self.link_map.iter().position(|cur| *cur == id) {
            self.link_map.remove(pos);
            self.n_removed += 1;
        }
    }

    /// Drop a file from the arena and the link map. The caller has already
    /// unmapped its segments.
    pub fn remove_file(&mut self, id: ImageId) -> Option<ElfImage> {
        self.unlink_file(id);
        self.files.remove(&id)
    }

    #[inline]
    pub fn file(&self, id: ImageId) -> &ElfImage {
        self.files.get(&id).expect("stale image id")
    }

    #[inline]
    pub fn file_mut(&mut self, id: ImageId) -> &mut ElfImage {
        self.files.get_mut(&id).expect("stale image id")
    }

    #[inline]
    pub fn try_file(&self, id: ImageId) -> Option<&ElfImage> {
        self.files.get(&id)
    }

    pub fn new_context(&mut self, namespace: Namespace) -> ContextId {
        let id = ContextId(self.next_context);
        self.next_context += 1;
        self.contexts.insert(id, namespace);
        id
    }

    #[inline]
    pub fn context(&self, id: ContextId) -> &Namespace {
        self.contexts.get(&id).expect("stale context id")
    }

    #[inline]
    pub fn context_mut(&mut self, id: ContextId) -> &mut Namespace {
        self.contexts.get_mut(&id).expect("stale context id")
    }

    /// A namespace dies with its last file. The interpreter is shared and
    /// does not keep a namespace alive.
    pub fn delete_context_if_empty(&mut self, id: ContextId) {
        let in_use = self.link_map.iter().any(|cur| {
            self.file(*cur).context == id && Some(*cur) != self.ldso
        });
        if !in_use {
            self.contexts.remove(&id);
        }
    }

    /// Find a loaded file by display name within one namespace.
    pub fn find_by_name(&self, context: ContextId, name: &CStr) -> Option<ImageId> {
        self.link_map
            .iter()
            .copied()
            .find(|id| {
                let file = self.file(*id);
                file.context == context && file.name.as_c_str() == name
            })
    }

    /// Find a loaded file by device and inode within one namespace.
    pub fn find_by_dev_ino(&self, context: ContextId, dev: u64, ino: u64) -> Option<ImageId> {
        self.link_map.iter().copied().find(|id| {
            let file = self.file(*id);
            file.context == context && file.dev == dev && file.ino == ino
        })
    }

    /// Find the file whose mapped span contains `addr`.
    pub fn find_by_addr(&self, addr: usize) -> Option<ImageId> {
        self.link_map
            .iter()
            .copied()
            .find(|id| self.file(*id).spans(addr))
    }

    /// Find the TLS-bearing file owning a module index.
    pub fn find_by_module(&self, module: usize) -> Option<ImageId> {
        self.link_map.iter().copied().find(|id| {
            self.file(*id)
                .tls
                .map(|tls| tls.index == module)
                .unwrap_or(false)
        })
    }

    /// The main executable, if this process has one on the link map.
    pub fn executable(&self) -> Option<ImageId> {
        self.link_map
            .iter()
            .copied()
            .find(|id| self.file(*id).is_executable)
    }

    /// Deliver an event to the file's namespace observers.
    pub fn notify(&self, id: ImageId, event: Event) {
        let context = self.file(id).context;
        self.context(context).notify(id, event);
    }

    /// Record the calling thread's error string.
    pub fn set_error(&mut self, msg: CString) {
        let key = crate::arch::thread_pointer();
        self.errors.insert(key, (msg, false));
    }

    /// Return-and-clear the calling thread's error string. The returned
    /// pointer stays valid until the thread's next error.
    pub fn consume_error(&mut self) -> Option<*const core::ffi::c_char> {
        let key = crate::arch::thread_pointer();
        let (msg, consumed) = self.errors.get_mut(&key)?;
        if *consumed {
            return None;
        }
        *consumed = true;
        Some(msg.as_ptr())
    }

    /// The calling thread's pending error, for in-process callers.
    pub fn take_error(&mut self) -> Option<CString> {
        let key = crate::arch::thread_pointer();
        let (msg, consumed) = self.errors.get_mut(&key)?;
        if *consumed {
            return None;
        }
        *consumed = true;
        Some(msg.clone())
    }
}

impl Default for Rtld {
    fn default() -> Self {
        Rtld::new()
    }
}

/// The single engine instance plus the futex serializing access to it.
pub struct GlobalRtld {
    mutex: Futex,
    inner: UnsafeCell<Option<Rtld>>,
}

// All access to `inner` happens through `lock`.
unsafe impl Sync for GlobalRtld {}

pub static RTLD: GlobalRtld = GlobalRtld::new();

impl GlobalRtld {
    const fn new() -> GlobalRtld {
        GlobalRtld {
            mutex: Futex::new(),
            inner: UnsafeCell::new(None),
        }
    }

    /// Install the engine state. Called once during bootstrap, before any
    /// other thread can exist.
    pub fn init(&self, rtld: Rtld) {
        self.mutex.lock();
        unsafe {
            *self.inner.get() = Some(rtld);
        }
        self.mutex.unlock();
    }

    /// Take the engine lock and hand out the state.
    pub fn lock(&self) -> RtldGuard<'_> {
        self.mutex.lock();
        RtldGuard { global: self }
    }
}

pub struct RtldGuard<'a> {
    global: &'a GlobalRtld,
}

impl Deref for RtldGuard<'_> {
    type Target = Rtld;

    fn deref(&self) -> &Rtld {
        unsafe {
            (*self.global.inner.get())
                .as_ref()
                .expect("engine used before bootstrap")
        }
    }
}

impl DerefMut for RtldGuard<'_> {
    fn deref_mut(&mut self) -> &mut Rtld {
        unsafe {
            (*self.global.inner.get())
                .as_mut()
                .expect("engine used before bootstrap")
        }
    }
}

impl Drop for RtldGuard<'_> {
    fn drop(&mut self) {
        self.global.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn link_map_keeps_insertion_order_and_counters() {
        let (mut rtld, ctx) = testutil::engine();
        let a = rtld.insert_file(testutil::image(ctx, "a", 0x100000, &[]));
        let b = rtld.insert_file(testutil::image(ctx, "b", 0x200000, &[]));
        assert_eq!(rtld.link_map, alloc::vec![a, b]);
        assert_eq!(rtld.n_added, 2);
        rtld.remove_file(a);
        assert_eq!(rtld.link_map, alloc::vec![b]);
        assert_eq!(rtld.n_removed, 1);
        assert!(rtld.try_file(a).is_none());
    }

    #[test]
    fn files_are_found_by_name_and_identity() {
        let (mut rtld, ctx) = testutil::engine();
        let a = rtld.insert_file(testutil::image(ctx, "liba.so", 0x100000, &[]));
        assert_eq!(rtld.find_by_name(ctx, c"liba.so"), Some(a));
        assert_eq!(rtld.find_by_name(ctx, c"libz.so"), None);
        let (dev, ino) = {
            let file = rtld.file(a);
            (file.dev, file.ino)
        };
        assert_eq!(rtld.find_by_dev_ino(ctx, dev, ino), Some(a));
        // identity lookups are per-namespace
        let other = rtld.new_context(crate::context::Namespace::new(
            0,
            core::ptr::null(),
            core::ptr::null(),
        ));
        assert_eq!(rtld.find_by_dev_ino(other, dev, ino), None);
    }

    #[test]
    fn executable_is_the_link_map_head() {
        let (mut rtld, ctx) = testutil::engine();
        let exec = rtld.insert_file(testutil::image(ctx, "main", 0x100000, &[]));
        rtld.file_mut(exec).is_executable = true;
        rtld.insert_file(testutil::image(ctx, "liba", 0x200000, &[]));
        assert_eq!(rtld.executable(), Some(exec));
        assert_eq!(rtld.link_map[0], exec);
    }
}
