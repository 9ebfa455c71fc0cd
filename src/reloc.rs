//! The relocation engine.
//!
//! Non-PLT relocations are applied eagerly; PLT relocations are either
//! applied eagerly (bind-now) or primed for lazy binding by pointing
//! `GOT[1]`/`GOT[2]` at the file handle and the resolve trampoline.
//! Files are processed leaves first so copy relocations observe fully
//! relocated definitions in their dependencies.

use crate::arch::{self, ElfRelType, RelocModule};
use crate::engine::{Rtld, RTLD};
use crate::file::{ElfImage, ImageId};
use crate::init_fini::sort_increasing_depth;
use crate::lookup::{lookup, LookupFlags};
use crate::Result;
use elf::abi::{STB_WEAK, STT_TLS};

fn reloc_module(file: &ElfImage) -> RelocModule {
    RelocModule {
        load_base: file.load_base,
        has_tls: file.tls.is_some(),
        tls_offset: file.tls.map(|tls| tls.offset).unwrap_or(0),
        tls_index: file.tls.map(|tls| tls.index).unwrap_or(0),
    }
}

/// Relocate a set of files in dependency order: increasing depth,
/// reversed, so leaves come first and roots last.
pub(crate) fn relocate_files(rtld: &mut Rtld, files: &[ImageId], now: bool) -> Result<()> {
    let mut ordered = sort_increasing_depth(rtld, files);
    ordered.reverse();
    for id in ordered {
        relocate_single(rtld, id, now)?;
    }
    Ok(())
}

/// Relocate one file.
pub(crate) fn relocate_single(rtld: &mut Rtld, id: ImageId, now: bool) -> Result<()> {
    if rtld.file(id).relocated {
        return Ok(());
    }
    log::trace!(target: "reloc", "relocating {:?}", rtld.file(id).name);

    let (base, dynrel, pltrel, bind_now) = {
        let file = rtld.file(id);
        (
            file.load_base,
            file.dynamic.dynrel,
            file.dynamic.pltrel,
            now || file.dynamic.bind_now || rtld.bind_now,
        )
    };

    if let Some(rels) = dynrel {
        for rel in rels {
            apply_one(rtld, id, rel, base)?;
        }
    }
    if let Some(rels) = pltrel {
        if bind_now {
            for rel in rels {
                apply_one(rtld, id, rel, base)?;
            }
        } else {
            lazy_setup(rtld, id);
        }
    }

    rtld.file_mut(id).relocated = true;
    Ok(())
}

/// Apply one relocation entry of `id`.
fn apply_one(rtld: &mut Rtld, id: ImageId, rel: &ElfRelType, base: usize) -> Result<()> {
    let r_type = rel.r_type();
    let r_sym = rel.r_symbol();
    let reloc_addr = (base + rel.r_offset()) as *mut usize;
    let addend = rel.r_addend(base);

    if r_sym == 0 || arch::reloc_is_relative(r_type) {
        let (sym_value, module) = {
            let file = rtld.file(id);
            let sym_value = if r_sym != 0 {
                file.symbols.symbol(r_sym).st_value()
            } else {
                0
            };
            (sym_value, reloc_module(file))
        };
        return unsafe {
            arch::apply_reloc_without_match(reloc_addr, r_type, addend, sym_value, &module)
        };
    }

    let (name, ver, is_weak, dst_size) = {
        let file = rtld.file(id);
        let sym = file.symbols.symbol(r_sym);
        (
            file.symbols.symbol_name(r_sym),
            file.symbols.requirement(r_sym),
            sym.st_bind() == STB_WEAK,
            sym.st_size(),
        )
    };

    if arch::reloc_is_copy(r_type) {
        // The copy source must come from outside the executable, which is
        // where the placeholder slot lives.
        let Some(found) = lookup(rtld, id, name, ver.as_ref(), LookupFlags::NO_EXEC)? else {
            if !is_weak {
                log::warn!(target: "symbol-fail",
                    "cannot resolve copy relocation against {:?} in {:?}",
                    name, rtld.file(id).name);
            }
            return Ok(());
        };
        assert!(
            found.symbol.st_size() == dst_size,
            "copy relocation size mismatch for {:?}",
            name
        );
        let src = found.address(rtld) as *const u8;
        unsafe {
            core::ptr::copy_nonoverlapping(src, reloc_addr as *mut u8, dst_size);
        }
        return Ok(());
    }

    match lookup(rtld, id, name, ver.as_ref(), LookupFlags::empty())? {
        Some(found) => {
            let def = reloc_module(rtld.file(found.file));
            unsafe {
                arch::apply_reloc_with_match(
                    reloc_addr,
                    r_type,
                    addend,
                    &def,
                    found.symbol.st_value(),
                    found.symbol.st_type() == STT_TLS,
                )
            }?;
        }
        None => {
            // A missing weak symbol legitimately leaves the slot alone. A
            // missing strong symbol is diagnosed but not fatal; the slot
            // keeps its prior value, matching what libc users expect.
            if !is_weak {
                log::warn!(target: "symbol-fail",
                    "cannot resolve {:?} ({}) in {:?}",
                    name,
                    arch::reloc_name(r_type),
                    rtld.file(id).name);
            }
        }
    }
    Ok(())
}

/// Prime one file for lazy binding instead of resolving its PLT now.
///
/// `GOT[1]` gets the file handle, `GOT[2]` the resolve trampoline. The PLT
/// slots themselves are rebased (or, when the prelinker already resolved
/// them, rebuilt to point back at their own PLT entry).
fn lazy_setup(rtld: &mut Rtld, id: ImageId) {
    let file = rtld.file(id);
    let (Some(got), Some(pltrel)) = (file.dynamic.got, file.dynamic.pltrel) else {
        return;
    };
    let base = file.load_base;
    let got_ptr = got.as_ptr();
    unsafe {
        let plt = arch::lazy_got_install(got_ptr, id.0 as usize);
        for rel in pltrel {
            let reloc_addr = base + rel.r_offset();
            let slot = reloc_addr as *mut usize;
            if plt == 0 {
                slot.write(slot.read().wrapping_add(base));
            } else {
                slot.write(arch::prelinked_plt_entry(base, plt, reloc_addr, got_ptr as usize));
            }
        }
    }
}

/// Resolve one lazy PLT slot. Entered from the architecture trampoline
/// with the module handle from `GOT[1]` and the argument the PLT stub
/// pushed. The slot is rewritten before the address is returned, so the
/// next call goes direct.
pub(crate) unsafe extern "C" fn dl_fixup(handle: usize, reloc_arg: usize) -> usize {
    let mut rtld = RTLD.lock();
    let id = ImageId(handle as u32);
    let index = if arch::PLT_RELOC_ARG_IS_OFFSET {
        reloc_arg / core::mem::size_of::<ElfRelType>()
    } else {
        reloc_arg
    };
    let (base, rel) = {
        let file = rtld.file(id);
        (file.load_base, file.dynamic.pltrel.expect("no jmprel table")[index])
    };
    let r_sym = rel.r_symbol();
    let (name, ver) = {
        let file = rtld.file(id);
        (
            file.symbols.symbol_name(r_sym),
            file.symbols.requirement(r_sym),
        )
    };
    let found = lookup(&mut rtld, id, name, ver.as_ref(), LookupFlags::empty())
        .expect("symbol lookup failed")
        .expect("lazy binding failed");
    let addr = found.address(&rtld);
    let slot = (base + rel.r_offset()) as *mut usize;
    unsafe { slot.write(addr) };
    log::trace!(target: "symbol-ok", "lazily bound {:?} to 0x{:x}", name, addr);
    addr
}
