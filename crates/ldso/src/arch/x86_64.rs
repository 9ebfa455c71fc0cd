use core::arch::global_asm;

// The kernel enters here with the handoff block at rsp. Stage 1 needs the
// block and the address of our own _DYNAMIC before any relocation has
// happened, so both are computed purely PC-relative.
global_asm!(
    "
	.text
	.globl	_start
	.hidden	_start
	.type	_start,@function
_start:
	mov	rdi, rsp
.weak _DYNAMIC
.hidden _DYNAMIC
	lea rsi, [rip + _DYNAMIC]
	call rust_main
	hlt"
);

global_asm!(
    "
	.text
	.align	4
	.globl	jump_to_entry
	.type	jump_to_entry,@function
jump_to_entry:
	// rdx carries the atexit function; we have none to register
	xor rdx, rdx
	mov	rsp, rsi
	jmp rdi
	hlt"
);
