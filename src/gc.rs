//! Unload garbage collection.
//!
//! Tri-color reachability over the union of dependency edges and symbol
//! back-references: files with a positive reference count are roots. The
//! sweep re-runs until it finds nothing, because detaching one batch can
//! orphan files that were only held alive by the batch's back-references.

use crate::engine::Rtld;
use crate::file::{GcColor, ImageId};
use alloc::vec::Vec;

/// One mark pass. Returns the unreachable files in link-map order.
fn sweep_white(rtld: &mut Rtld) -> Vec<ImageId> {
    let ids: Vec<ImageId> = rtld.link_map.clone();
    let mut grey: Vec<ImageId> = Vec::new();
    for &id in &ids {
        let file = rtld.file_mut(id);
        if file.refcount > 0 {
            file.gc_color = GcColor::Grey;
            grey.push(id);
        } else {
            file.gc_color = GcColor::White;
        }
    }

    while let Some(id) = grey.pop() {
        let targets: Vec<ImageId> = {
            let file = rtld.file(id);
            file.deps
                .iter()
                .chain(file.symbols_resolved_in.iter())
                .copied()
                .collect()
        };
        for target in targets {
            if rtld.try_file(target).map(|f| f.gc_color) == Some(GcColor::White) {
                rtld.file_mut(target).gc_color = GcColor::Grey;
                grey.push(target);
            }
        }
        rtld.file_mut(id).gc_color = GcColor::Black;
    }

    ids.into_iter()
        .filter(|id| rtld.file(*id).gc_color == GcColor::White)
        .collect()
}

/// Pull one unreachable file out of the link map and out of every
/// surviving scope. Its arena record stays until the unload path has run
/// destructors and unmapped it.
pub(crate) fn detach(rtld: &mut Rtld, id: ImageId) {
    rtld.unlink_file(id);
    let survivors: Vec<ImageId> = rtld.link_map.clone();
    for other in survivors {
        rtld.file_mut(other).local_scope.retain(|cur| *cur != id);
    }
    rtld.file_mut(id).local_scope.retain(|cur| *cur != id);
    let context = rtld.file(id).context;
    rtld.context_mut(context).global_scope.retain(|cur| *cur != id);
}

/// Compute and detach the full unreachable set, re-running the sweep until
/// it fixes. Returns every collected file, in the order the rounds found
/// them.
pub(crate) fn collect_unreachable(rtld: &mut Rtld) -> Vec<ImageId> {
    let mut all: Vec<ImageId> = Vec::new();
    loop {
        let white = sweep_white(rtld);
        if white.is_empty() {
            break;
        }
        for &id in &white {
            detach(rtld, id);
        }
        all.extend(white);
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn referenced_files_survive() {
        let (mut rtld, ctx) = testutil::engine();
        let ids = testutil::chain(&mut rtld, ctx, &["main", "liba", "libb"]);
        rtld.file_mut(ids[0]).refcount = 1;
        let collected = collect_unreachable(&mut rtld);
        assert!(collected.is_empty());
        assert_eq!(rtld.link_map.len(), 3);
    }

    #[test]
    fn dropping_the_root_collects_the_chain() {
        let (mut rtld, ctx) = testutil::engine();
        let ids = testutil::chain(&mut rtld, ctx, &["main", "liba", "libb"]);
        rtld.file_mut(ids[0]).refcount = 1;
        // liba was dlopened too, then closed: only main pins anything now
        rtld.file_mut(ids[0]).refcount = 0;
        let collected = collect_unreachable(&mut rtld);
        assert_eq!(collected, ids);
        assert!(rtld.link_map.is_empty());
    }

    #[test]
    fn symbol_backrefs_keep_a_file_alive() {
        let (mut rtld, ctx) = testutil::engine();
        let ids = testutil::chain(&mut rtld, ctx, &["main", "liba"]);
        let loner = rtld.insert_file(testutil::image(ctx, "libx", 0x900_0000, &[]));
        rtld.file_mut(ids[0]).refcount = 1;
        // liba resolved a symbol inside libx
        rtld.file_mut(ids[1]).symbols_resolved_in.push(loner);
        assert!(collect_unreachable(&mut rtld).is_empty());

        // once liba stops existing, libx has no one holding it
        rtld.file_mut(ids[0]).deps.clear();
        rtld.file_mut(ids[1]).symbols_resolved_in.clear();
        let collected = collect_unreachable(&mut rtld);
        assert_eq!(collected, alloc::vec![ids[1], loner]);
    }

    #[test]
    fn unreferenced_graph_collects_entirely() {
        let (mut rtld, ctx) = testutil::engine();
        // a -> b, and c is only held by b's back-reference
        let ids = testutil::chain(&mut rtld, ctx, &["a", "b"]);
        let c = rtld.insert_file(testutil::image(ctx, "c", 0x900_0000, &[]));
        rtld.file_mut(ids[1]).symbols_resolved_in.push(c);
        let collected = collect_unreachable(&mut rtld);
        assert_eq!(collected.len(), 3);
        // collection scrubbed every scope
        assert!(rtld.link_map.is_empty());
    }
}
