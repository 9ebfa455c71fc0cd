//! Constructor / destructor sequencing.
//!
//! Constructors run dependencies-first (increasing depth, reversed),
//! destructors in the opposite order. Both are invoked without the engine
//! lock held, since arbitrary user code may re-enter the API; the lock is
//! taken only around flag updates and observer notification.

use crate::dynamic::{FiniFn, InitFn};
use crate::engine::{Rtld, RTLD};
use crate::file::{Event, ImageId};
use alloc::vec;
use alloc::vec::Vec;
use core::ffi::c_char;

/// Stable depth-bucket sort: files of equal depth keep their relative
/// order.
pub(crate) fn sort_increasing_depth(rtld: &Rtld, files: &[ImageId]) -> Vec<ImageId> {
    let max_depth = files
        .iter()
        .map(|id| rtld.file(*id).depth)
        .max()
        .unwrap_or(0);
    let mut output = Vec::with_capacity(files.len());
    for depth in 0..=max_depth {
        for &id in files {
            if rtld.file(id).depth == depth {
                output.push(id);
            }
        }
    }
    output
}

/// The order constructors run in for `files`.
pub(crate) fn constructor_order(rtld: &Rtld, files: &[ImageId]) -> Vec<ImageId> {
    let mut order = sort_increasing_depth(rtld, files);
    order.reverse();
    order
}

/// The order destructors run in for `files`.
pub(crate) fn destructor_order(rtld: &Rtld, files: &[ImageId]) -> Vec<ImageId> {
    sort_increasing_depth(rtld, files)
}

/// Breadth-first walk of the dependency DAG starting at `root`, the root
/// itself first. This is the deterministic order of a file's local scope.
pub(crate) fn deps_breadth_first(rtld: &Rtld, root: ImageId) -> Vec<ImageId> {
    let mut list = vec![root];
    let mut i = 0;
    while i < list.len() {
        let deps = rtld.file(list[i]).deps.clone();
        for dep in deps {
            if !list.contains(&dep) {
                list.push(dep);
            }
        }
        i += 1;
    }
    list
}

/// Everything needed to run one file's constructors outside the lock.
struct PendingInit {
    init_fn: Option<InitFn>,
    init_array: Option<&'static [InitFn]>,
    argc: i32,
    argv: *const *const c_char,
    envp: *const *const c_char,
}

impl PendingInit {
    fn run(&self) {
        // DT_INIT first, then DT_INIT_ARRAY in forward order
        if let Some(init) = self.init_fn {
            init(self.argc, self.argv, self.envp);
        }
        if let Some(array) = self.init_array {
            for init in array {
                init(self.argc, self.argv, self.envp);
            }
        }
    }
}

/// Mark one file initialized and collect its constructor data. Marking
/// happens before the call so dependency cycles terminate. The main
/// executable is marked but never run here: its own startup code drives
/// its constructors.
fn prepare_init(rtld: &mut Rtld, id: ImageId) -> Option<PendingInit> {
    let context = rtld.file(id).context;
    let (argc, argv, envp) = {
        let ns = rtld.context(context);
        (ns.argc, ns.argv, ns.envp)
    };
    let file = rtld.file_mut(id);
    if file.init_called {
        return None;
    }
    file.init_called = true;
    if file.is_executable {
        return None;
    }
    log::trace!(target: "function", "constructing {:?}", file.name);
    Some(PendingInit {
        init_fn: file.dynamic.init_fn,
        init_array: file.dynamic.init_array,
        argc,
        argv,
        envp,
    })
}

struct PendingFini {
    fini_fn: Option<FiniFn>,
    fini_array: Option<&'static [FiniFn]>,
}

impl PendingFini {
    fn run(&self) {
        // DT_FINI_ARRAY in reverse order, then DT_FINI
        if let Some(array) = self.fini_array {
            for fini in array.iter().rev() {
                fini();
            }
        }
        if let Some(fini) = self.fini_fn {
            fini();
        }
    }
}

/// Mark one file finalized and collect its destructor data. A file whose
/// constructors never ran has nothing to undo.
fn prepare_fini(rtld: &mut Rtld, id: ImageId) -> Option<PendingFini> {
    let file = rtld.file_mut(id);
    assert!(!file.fini_called, "file finalized twice");
    if !file.init_called {
        return None;
    }
    file.fini_called = true;
    log::trace!(target: "function", "destroying {:?}", file.name);
    Some(PendingFini {
        fini_fn: file.dynamic.fini_fn,
        fini_array: file.dynamic.fini_array,
    })
}

/// Run constructors for `files`, which must already be in constructor
/// order. Takes and releases the engine lock around each file.
pub(crate) fn run_constructors(files: &[ImageId]) {
    for &id in files {
        let pending = {
            let mut rtld = RTLD.lock();
            prepare_init(&mut rtld, id)
        };
        if let Some(pending) = pending {
            pending.run();
            let rtld = RTLD.lock();
            rtld.notify(id, Event::Constructed);
        }
    }
}

/// Run destructors for `files`, which must already be in destructor order.
pub(crate) fn run_destructors(files: &[ImageId]) {
    for &id in files {
        let pending = {
            let mut rtld = RTLD.lock();
            prepare_fini(&mut rtld, id)
        };
        if let Some(pending) = pending {
            pending.run();
            let rtld = RTLD.lock();
            rtld.notify(id, Event::Destroyed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn depth_sort_is_stable_within_a_level() {
        let (mut rtld, ctx) = testutil::engine();
        let a = rtld.insert_file(testutil::image(ctx, "a", 0x100000, &[]));
        let b = rtld.insert_file(testutil::image(ctx, "b", 0x200000, &[]));
        let c = rtld.insert_file(testutil::image(ctx, "c", 0x300000, &[]));
        rtld.file_mut(b).depth = 1;
        rtld.file_mut(c).depth = 1;
        let sorted = sort_increasing_depth(&rtld, &[c, a, b]);
        assert_eq!(sorted, alloc::vec![a, c, b]);
    }

    #[test]
    fn constructors_reverse_destructors() {
        let (mut rtld, ctx) = testutil::engine();
        let ids = testutil::chain(&mut rtld, ctx, &["main", "liba", "libb"]);
        let ctors = constructor_order(&rtld, &ids);
        let mut dtors = destructor_order(&rtld, &ids);
        dtors.reverse();
        assert_eq!(ctors, dtors);
        // dependencies first: libb before liba before main
        assert_eq!(ctors, alloc::vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn breadth_first_walk_dedups_shared_deps() {
        let (mut rtld, ctx) = testutil::engine();
        // root -> {a, b}, both -> common
        let root = rtld.insert_file(testutil::image(ctx, "root", 0x100000, &[]));
        let a = rtld.insert_file(testutil::image(ctx, "a", 0x200000, &[]));
        let b = rtld.insert_file(testutil::image(ctx, "b", 0x300000, &[]));
        let common = rtld.insert_file(testutil::image(ctx, "common", 0x400000, &[]));
        rtld.file_mut(root).deps.extend([a, b]);
        rtld.file_mut(a).deps.push(common);
        rtld.file_mut(b).deps.push(common);
        let scope = deps_breadth_first(&rtld, root);
        assert_eq!(scope, alloc::vec![root, a, b, common]);
    }
}
