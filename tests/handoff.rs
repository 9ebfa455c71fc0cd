use elf_rtld::bootstrap::{KernelHandoff, AT_BASE, AT_PHDR, AT_PHNUM};
use rstest::rstest;

/// Lay out a kernel-style handoff block: `argc :: argv... :: NULL ::
/// envp... :: NULL :: auxv`.
fn build_block(argv: &[&'static str], envp: &[&'static str], auxv: &[(usize, usize)]) -> Vec<usize> {
    let mut block = Vec::new();
    block.push(argv.len());
    for arg in argv {
        block.push(arg.as_ptr() as usize);
    }
    block.push(0);
    for env in envp {
        block.push(env.as_ptr() as usize);
    }
    block.push(0);
    for (tag, val) in auxv {
        block.push(*tag);
        block.push(*val);
    }
    block.push(0); // AT_NULL
    block.push(0);
    block
}

#[rstest]
fn parses_argc_argv_env_and_aux() {
    let argv = ["/bin/true\0", "--version\0"];
    let envp = ["LD_BIND_NOW=1\0", "HOME=/root\0"];
    let mut block = build_block(
        &argv,
        &envp,
        &[(AT_PHDR, 0x1000), (AT_PHNUM, 9), (AT_BASE, 0x7f00)],
    );
    let handoff = unsafe { KernelHandoff::parse(block.as_mut_ptr()) }.unwrap();

    assert_eq!(handoff.argc, 2);
    let argv0 = unsafe { core::ffi::CStr::from_ptr(handoff.argv.read()) };
    assert_eq!(argv0.to_str().unwrap(), "/bin/true");

    assert_eq!(handoff.aux(AT_PHDR), Some(0x1000));
    assert_eq!(handoff.aux(AT_PHNUM), Some(9));
    assert_eq!(handoff.aux(AT_BASE), Some(0x7f00));
    assert_eq!(handoff.aux(0x999), None);

    let bind_now = unsafe { handoff.env("LD_BIND_NOW") }.unwrap();
    assert_eq!(bind_now.to_str().unwrap(), "1");
    assert!(unsafe { handoff.env("LD_PRELOAD") }.is_none());
}

#[rstest]
fn aux_walk_stops_at_the_terminator() {
    let argv = ["prog\0"];
    let mut block = build_block(&argv, &[], &[]);
    let handoff = unsafe { KernelHandoff::parse(block.as_mut_ptr()) }.unwrap();
    assert_eq!(handoff.aux(AT_BASE), None);
}
