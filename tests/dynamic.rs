use elf_rtld::abi::*;
use elf_rtld::arch::ElfDyn;
use elf_rtld::dynamic::{ElfDynamic, ElfDynamicHashTab};
use rstest::rstest;

fn entry(tag: i64, val: usize) -> ElfDyn {
    ElfDyn {
        d_tag: tag as isize,
        d_un: val,
    }
}

fn leak_dyn(entries: Vec<ElfDyn>) -> &'static [ElfDyn] {
    Box::leak(entries.into_boxed_slice())
}

#[rstest]
fn parse_extracts_tables_and_flags() {
    let strtab: &'static [u8] = Box::leak(Box::new(*b"\0libm.so.6\0"));
    let symtab: &'static [u64] = Box::leak(vec![0u64; 8].into_boxed_slice());
    let hash: &'static [u32] = Box::leak(vec![1u32, 1, 0, 0].into_boxed_slice());

    let entries = leak_dyn(vec![
        entry(DT_STRTAB, strtab.as_ptr() as usize),
        entry(DT_SYMTAB, symtab.as_ptr() as usize),
        entry(DT_HASH, hash.as_ptr() as usize),
        entry(DT_NEEDED, 1),
        entry(DT_FLAGS, (DF_STATIC_TLS | DF_BIND_NOW) as usize),
        entry(DT_NULL, 0),
    ]);

    let dynamic = ElfDynamic::parse(entries.as_ptr(), 0).unwrap();
    assert!(dynamic.bind_now);
    assert!(dynamic.wants_static_tls());
    assert_eq!(dynamic.strtab, strtab.as_ptr() as usize);
    assert_eq!(dynamic.symtab, symtab.as_ptr() as usize);
    assert!(matches!(dynamic.hashtab, Some(ElfDynamicHashTab::Sysv(_))));
    assert_eq!(dynamic.needed_libs.len(), 1);
    assert_eq!(dynamic.needed_libs[0].get(), 1);
    assert!(dynamic.got.is_none());
    assert!(dynamic.pltrel.is_none());
}

#[rstest]
fn gnu_hash_wins_over_sysv() {
    let table: &'static [u32] = Box::leak(vec![0u32; 16].into_boxed_slice());
    let entries = leak_dyn(vec![
        entry(DT_HASH, table.as_ptr() as usize),
        entry(DT_GNU_HASH, table.as_ptr().wrapping_add(4) as usize),
        entry(DT_NULL, 0),
    ]);
    let dynamic = ElfDynamic::parse(entries.as_ptr(), 0).unwrap();
    match dynamic.hashtab {
        Some(ElfDynamicHashTab::Gnu(addr)) => {
            assert_eq!(addr, table.as_ptr().wrapping_add(4) as usize)
        }
        other => panic!("expected the gnu table, got {:?}", other),
    }
}

#[rstest]
fn debug_slot_points_into_the_dynamic_array() {
    let entries = leak_dyn(vec![entry(DT_DEBUG, 0), entry(DT_NULL, 0)]);
    let dynamic = ElfDynamic::parse(entries.as_ptr(), 0).unwrap();
    let slot = dynamic.debug_slot.expect("DT_DEBUG slot not captured");
    unsafe { slot.as_ptr().write(0xdead_beef) };
    assert_eq!(entries[0].d_un, 0xdead_beef);
}

#[rstest]
fn offsets_are_rebased() {
    let base = 0x7f00_0000_0000usize;
    let entries = leak_dyn(vec![
        entry(DT_STRTAB, 0x1000),
        entry(DT_SYMTAB, 0x2000),
        entry(DT_NULL, 0),
    ]);
    let dynamic = ElfDynamic::parse(entries.as_ptr(), base).unwrap();
    assert_eq!(dynamic.strtab, base + 0x1000);
    assert_eq!(dynamic.symtab, base + 0x2000);
    assert!(dynamic.hashtab.is_none());
}
