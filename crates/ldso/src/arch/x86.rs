use core::arch::global_asm;

// The kernel enters here with the handoff block at esp. The address of
// _DYNAMIC is recovered with the classic call/pop trick since nothing is
// relocated yet.
global_asm!(
    "
	.text
	.globl	_start
	.hidden	_start
	.type	_start,@function
_start:
	movl	%esp, %eax
.weak _DYNAMIC
.hidden _DYNAMIC
	call	1f
1:	popl	%ebx
	addl	$_DYNAMIC-1b, %ebx
	pushl	%ebx
	pushl	%eax
	call	rust_main
	hlt",
    options(att_syntax)
);

global_asm!(
    "
	.text
	.align	4
	.globl	jump_to_entry
	.type	jump_to_entry,@function
jump_to_entry:
	movl	4(%esp), %ecx
	movl	8(%esp), %esp
	/* edx carries the atexit function; we have none to register */
	xorl	%edx, %edx
	jmpl	*%ecx
	hlt",
    options(att_syntax)
);
