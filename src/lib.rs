//! `elf_rtld` is the engine of a user-space dynamic linker for ELF
//! binaries on Linux (x86 and x86-64): image mapping, DT_NEEDED closure
//! resolution, versioned symbol lookup, eager and lazy relocation,
//! thread-local storage, the dlopen family with garbage-collected unload,
//! the debugger rendezvous, and the libc compatibility layer.
//!
//! The `ldso` workspace member wraps this library into the actual
//! PT_INTERP binary; the library itself stays `no_std + alloc` so it can
//! run before any libc exists in the process.

#![cfg_attr(not(feature = "std"), no_std)]
extern crate alloc;

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("unsupported architecture");

pub mod api;
pub mod arch;
pub mod bootstrap;
pub mod context;
mod deps;
pub mod dynamic;
pub mod engine;
mod error;
pub mod file;
mod futex;
mod gc;
pub mod gdb;
pub mod glibc;
mod hash;
mod init_fini;
mod ldlog;
pub mod lookup;
mod map;
pub mod mmap;
pub mod os;
mod reloc;
pub mod segment;
mod symbol;
#[cfg(test)]
mod testutil;
pub mod tls;
pub mod version;

pub use error::{Error, Result};

pub use elf::abi;
