//! Debugger rendezvous.
//!
//! A fixed-layout structure at the well-known symbol `_r_debug` exposes
//! the link map to debuggers, with a state flag flipped around every map /
//! unmap transaction and a breakpoint function the debugger hooks. The
//! main executable's DT_DEBUG slot is rewritten to point here so a
//! debugger can find it knowing nothing but the process start address.
//!
//! Debuggers walk a conventional chain of `{l_addr, l_name, l_ld, l_next,
//! l_prev}` nodes; the engine mirrors its link map into such nodes on
//! every transaction.

// the rendezvous symbol name is part of the protocol
#![allow(non_upper_case_globals)]

use crate::engine::Rtld;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ffi::c_char;
use core::ptr::null_mut;

pub const RT_CONSISTENT: i32 = 0;
pub const RT_ADD: i32 = 1;
pub const RT_DELETE: i32 = 2;

/// One node of the debugger-visible link map chain.
#[repr(C)]
pub struct LinkMapNode {
    pub l_addr: usize,
    pub l_name: *const c_char,
    pub l_ld: usize,
    pub l_next: *mut LinkMapNode,
    pub l_prev: *mut LinkMapNode,
}

/// The rendezvous structure. Field order is part of the protocol.
#[repr(C)]
pub struct RDebug {
    pub r_version: i32,
    pub r_map: *mut LinkMapNode,
    pub r_brk: extern "C" fn(),
    pub r_state: i32,
    pub r_ldbase: usize,
}

#[repr(transparent)]
pub struct RDebugCell(UnsafeCell<RDebug>);

// Mutated only under the engine lock; debuggers read it from outside the
// process.
unsafe impl Sync for RDebugCell {}

/// The name is the protocol: gdb looks this symbol up by name.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub static _r_debug: RDebugCell = RDebugCell(UnsafeCell::new(RDebug {
    r_version: 1,
    r_map: null_mut(),
    r_brk: _r_debug_state,
    r_state: RT_CONSISTENT,
    r_ldbase: 0,
}));

/// The debugger plants its breakpoint here; gdb hardcodes this name
/// rather than reading `r_brk`, so the symbol must exist under exactly
/// this name.
#[cfg_attr(feature = "export-abi", unsafe(no_mangle))]
pub extern "C" fn _r_debug_state() {
    // the debugger puts a breakpoint here
}

fn r_debug() -> *mut RDebug {
    _r_debug.0.get()
}

/// Mirror the engine's link map into the debugger-visible chain.
fn rebuild_chain(rtld: &mut Rtld) {
    let ids = rtld.link_map.clone();
    let mut prev: *mut LinkMapNode = null_mut();
    let mut head: *mut LinkMapNode = null_mut();
    for id in ids {
        let node = {
            let file = rtld.file_mut(id);
            if file.debug_node.is_null() {
                file.debug_node = Box::into_raw(Box::new(LinkMapNode {
                    l_addr: 0,
                    l_name: core::ptr::null(),
                    l_ld: 0,
                    l_next: null_mut(),
                    l_prev: null_mut(),
                }));
            }
            let node = file.debug_node;
            unsafe {
                (*node).l_addr = file.load_base;
                (*node).l_name = file.path.as_ptr();
                (*node).l_ld = file.dyn_ptr as usize;
                (*node).l_next = null_mut();
                (*node).l_prev = prev;
            }
            node
        };
        if prev.is_null() {
            head = node;
        } else {
            unsafe { (*prev).l_next = node };
        }
        prev = node;
    }
    unsafe {
        (*r_debug()).r_map = head;
    }
}

/// Free the chain node of a file leaving the link map for good.
pub(crate) fn drop_node(node: *mut LinkMapNode) {
    if !node.is_null() {
        drop(unsafe { Box::from_raw(node) });
    }
}

/// Install the rendezvous at startup: fill in the interpreter base, mirror
/// the initial link map, and write the structure's address through the
/// executable's DT_DEBUG slot.
pub(crate) fn initialize(rtld: &mut Rtld) {
    unsafe {
        (*r_debug()).r_ldbase = rtld.ldso_base;
        (*r_debug()).r_state = RT_CONSISTENT;
    }
    rebuild_chain(rtld);
    let debug_slot = rtld
        .executable()
        .and_then(|exec| rtld.file(exec).dynamic.debug_slot);
    if let Some(slot) = debug_slot {
        unsafe {
            slot.as_ptr().write(r_debug() as usize);
        }
    }
}

/// Flip the state to `add` or `delete` before a transaction.
pub(crate) fn set_state(state: i32) {
    unsafe {
        (*r_debug()).r_state = state;
    }
}

/// Close a transaction: remirror the chain, mark the map consistent and
/// ring the breakpoint.
pub(crate) fn notify(rtld: &mut Rtld) {
    rebuild_chain(rtld);
    let brk = unsafe {
        (*r_debug()).r_state = RT_CONSISTENT;
        (*r_debug()).r_brk
    };
    brk();
}
