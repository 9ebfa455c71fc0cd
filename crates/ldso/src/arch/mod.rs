cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
    } else if #[cfg(target_arch = "x86")] {
        mod x86;
    } else {
        compile_error!("unsupported architecture");
    }
}

unsafe extern "C" {
    /// Switch to the (possibly shifted) program stack and jump to the
    /// entry point, with the atexit register cleared.
    pub fn jump_to_entry(entry: usize, sp: *const usize) -> !;
}
