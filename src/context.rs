//! Stack allocation and the raw register-context switch (component A).
//!
//! A fiber's [`Context`] is nothing more than a saved stack pointer: all
//! other registers live *on* the stack it points to. [`Context::swap`] saves
//! the callee-saved registers of the calling context onto its own stack,
//! swaps the stack pointer, and restores the callee-saved registers of the
//! target context from its stack — the same technique used by
//! `boost::context`, `ucontext`'s `swapcontext`, and every stackful
//! coroutine library in this corpus.
//!
//! The switch itself is written in `global_asm!` rather than an inline
//! `asm!`-bodied function: a plain `unsafe fn` gets a compiler-generated
//! prologue/epilogue that may itself touch `rsp` in ways that conflict with
//! the hand-rolled stack pivot, and `#[naked]` functions are not stable
//! across every toolchain version this crate targets. `global_asm!` sits
//! entirely outside normal function codegen, sidestepping both problems.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

use crate::error::{Error, Result};

#[cfg(not(target_arch = "x86_64"))]
compile_error!(
    "fiber-rt's context switch (src/context.rs) is only implemented for x86_64; \
     porting it to another architecture means writing and wiring up both a \
     matching Context::new seeding routine and a fiber_rt_swap_context \
     global_asm! body for that architecture's callee-saved registers, not \
     just the asm! block alone"
);

/// Guard margin subtracted from both ends of a fiber's stack allocation,
/// matching the original's `uc_stack.ss_sp = stack + 8; ss_size = size - 64`.
const STACK_HEAD_GUARD: usize = 8;
const STACK_TAIL_GUARD: usize = 64;
const STACK_ALIGN: usize = 16;

/// An owned, fixed-size, non-relocatable fiber stack.
///
/// The backing allocation is never moved or resized after creation; only
/// the fiber that owns it (plus the trampoline, at creation time) ever
/// reads or writes through its pointer.
pub struct Stack {
    base: *mut u8,
    layout: Layout,
    size: usize,
}

impl Stack {
    /// Allocates a new stack of `size` bytes (rounded up to 16-byte
    /// alignment). Returns [`Error::StackAlloc`] if the allocator fails.
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, STACK_ALIGN)
            .map_err(|_| Error::StackAlloc { size })?;
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return Err(Error::StackAlloc { size });
        }
        Ok(Stack { base, layout, size })
    }

    /// The highest usable address of the guarded region, 16-byte aligned,
    /// suitable as the initial stack pointer for a freshly seeded context.
    fn top(&self) -> *mut u8 {
        let usable_end = (self.base as usize) + self.size - STACK_TAIL_GUARD;
        let aligned = usable_end & !(STACK_ALIGN - 1);
        aligned as *mut u8
    }

    /// The lowest usable address, mirroring the original's `stack + 8`
    /// head guard (kept for documentation / potential overflow checks;
    /// this implementation does not place a guard page there).
    #[allow(dead_code)]
    fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(STACK_HEAD_GUARD) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

/// A saved CPU register snapshot sufficient to resume a fiber.
///
/// Only the stack pointer is stored explicitly; the callee-saved general
/// purpose registers live on the stack itself, pushed there by
/// [`Context::swap`] (or pre-seeded by [`Context::new`] for a fiber that has
/// never run).
#[repr(C)]
pub struct Context {
    rsp: *mut u8,
}

// A `Context` only ever points at memory owned by its `Stack`; moving it
// between threads is the scheduler's responsibility (single-threaded by
// contract, see spec 5).
unsafe impl Send for Context {}

impl Context {
    /// An empty context, used as the scheduler's own "return to me" slot.
    /// Never resumed via `to`; only ever a `from` target.
    pub fn empty() -> Self {
        Context { rsp: ptr::null_mut() }
    }

    /// Seeds a context so that its first resume jumps to `trampoline`
    /// with the stack pivoted onto `stack`.
    ///
    /// # Safety
    /// `trampoline` must never return via a normal `ret` to its caller; it
    /// must end by calling into the scheduler's exit path. `stack` must
    /// outlive every [`Context::swap`] call that resumes this context.
    // The register layout below matches the x86_64 `fiber_rt_swap_context`
    // defined further down: 6 callee-saved slots (rbp, rbx, r12-r15) below
    // the return address `swap` will `ret` into on first resume.
    pub unsafe fn new(stack: &Stack, trampoline: extern "C" fn() -> !) -> Self {
        let top = stack.top() as usize;
        // Reserve 6 saved-register slots (rbp, rbx, r12-r15) below the
        // return-address slot at `top`.
        let regs = (top - 6 * 8) as *mut usize;
        ptr::write(top as *mut usize, trampoline as usize);
        for i in 0..6 {
            ptr::write(regs.add(i), 0);
        }
        Context { rsp: regs as *mut u8 }
    }

    /// Saves the current register state into `from` and resumes `to`.
    ///
    /// Returns when some later `swap` call resumes `from` again.
    #[inline(always)]
    pub fn swap(from: &mut Context, to: &Context) {
        unsafe { fiber_rt_swap_context(&mut from.rsp, to.rsp) }
    }
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".global fiber_rt_swap_context",
    "fiber_rt_swap_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn fiber_rt_swap_context(from_rsp_out: *mut *mut u8, to_rsp: *mut u8);
}
