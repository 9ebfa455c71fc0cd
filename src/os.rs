//! Thin wrappers over the kernel surface the engine needs outside of
//! memory mapping: file access, futex, and the environment block handed
//! over by the kernel.

use crate::error::{io_error, not_found_error};
use crate::Result;
use alloc::borrow::ToOwned;
use alloc::ffi::CString;
use core::ffi::CStr;
use core::sync::atomic::AtomicU32;

const FUTEX_WAIT: usize = 0;
const FUTEX_WAKE: usize = 1;

/// An open file descriptor plus the name it was opened under.
pub struct RawFile {
    name: CString,
    fd: i32,
}

impl RawFile {
    pub fn open(path: &CStr) -> Result<RawFile> {
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(not_found_error(alloc::format!(
                "cannot open {}",
                path.to_str().unwrap_or("<non-utf8>")
            )));
        }
        Ok(RawFile {
            name: path.to_owned(),
            fd,
        })
    }

    #[inline]
    pub fn name(&self) -> &CStr {
        &self.name
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Read exactly `buf.len()` bytes at the given file offset.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let ret = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr().cast(),
                    buf.len() - done,
                    (offset + done) as _,
                )
            };
            if ret <= 0 {
                return Err(io_error("short read"));
            }
            done += ret as usize;
        }
        Ok(())
    }

    /// The (device, inode) pair identifying the underlying file, used to
    /// de-duplicate the same binary reached through different names.
    pub fn dev_ino(&self) -> Result<(u64, u64)> {
        let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
        let ret = unsafe { libc::fstat(self.fd, st.as_mut_ptr()) };
        if ret != 0 {
            return Err(io_error("fstat failed"));
        }
        let st = unsafe { st.assume_init() };
        Ok((st.st_dev as u64, st.st_ino as u64))
    }

    /// Check whether a file exists and is openable without keeping it open.
    pub fn exists(path: &CStr) -> bool {
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return false;
        }
        unsafe { libc::close(fd) };
        true
    }
}

/// Stat a path without opening it; used to de-duplicate files reached
/// through different names before mapping them a second time.
pub fn stat_dev_ino(path: &CStr) -> Option<(u64, u64)> {
    let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
    let ret = unsafe { libc::stat(path.as_ptr(), st.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    let st = unsafe { st.assume_init() };
    Some((st.st_dev as u64, st.st_ino as u64))
}

impl Drop for RawFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Block until `*addr != val` or a wake-up arrives.
pub fn futex_wait(addr: &AtomicU32, val: u32) {
    unsafe {
        let _ = syscalls::raw_syscall!(
            syscalls::Sysno::futex,
            addr.as_ptr(),
            FUTEX_WAIT,
            val as usize,
            0,
            0,
            0
        );
    }
}

/// Wake up to `count` waiters blocked on `addr`.
pub fn futex_wake(addr: &AtomicU32, count: u32) {
    unsafe {
        let _ = syscalls::raw_syscall!(
            syscalls::Sysno::futex,
            addr.as_ptr(),
            FUTEX_WAKE,
            count as usize,
            0,
            0,
            0
        );
    }
}

/// Look up `name` in a kernel-supplied `envp` block.
///
/// Returns the value part of the first `name=value` entry. The engine cannot
/// use a libc getenv: there is no libc yet when this runs.
pub unsafe fn env_get(
    envp: *const *const core::ffi::c_char,
    name: &str,
) -> Option<&'static CStr> {
    if envp.is_null() {
        return None;
    }
    let mut cur = envp;
    unsafe {
        while !(*cur).is_null() {
            let entry = CStr::from_ptr(*cur);
            let bytes = entry.to_bytes();
            if bytes.len() > name.len()
                && &bytes[..name.len()] == name.as_bytes()
                && bytes[name.len()] == b'='
            {
                return Some(CStr::from_ptr((*cur).add(name.len() + 1)));
            }
            cur = cur.add(1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::null;

    #[test]
    fn env_get_finds_value() {
        let a = c"LD_BIND_NOW=1";
        let b = c"PATH=/bin";
        let envp = [a.as_ptr(), b.as_ptr(), null()];
        let found = unsafe { env_get(envp.as_ptr(), "PATH") }.unwrap();
        assert_eq!(found, c"/bin");
        assert!(unsafe { env_get(envp.as_ptr(), "PAT") }.is_none());
        assert_eq!(
            unsafe { env_get(envp.as_ptr(), "LD_BIND_NOW") }.unwrap(),
            c"1"
        );
    }
}
