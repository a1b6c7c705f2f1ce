//! Calling-convention data for the two supported ABIs.
//!
//! **SysV AMD64** (Linux): integer arguments in RDI, RSI, RDX, RCX, R8, R9;
//! floats in XMM0-7; 128-byte red zone; struct return by hidden pointer
//! above 128 bytes; callee-saved RBX, RBP, R12-R15.
//!
//! **Win64**: integer arguments in RCX, RDX, R8, R9 (argument slots are
//! positional across int/float); floats in XMM0-3; 32-byte shadow space
//! reserved by the caller; struct return by hidden pointer above 64 bytes;
//! callee-saved RBX, RBP, RDI, RSI, R12-R15.

use fcpp_ir::CallConv;

use crate::encode::Reg;

/// Calling-convention description used by the emitter.
pub struct Abi {
    /// Integer/pointer argument registers in order.
    pub int_args: &'static [Reg],
    /// Number of XMM argument registers.
    pub float_arg_count: usize,
    /// Caller-reserved shadow space in bytes.
    pub shadow_space: u32,
    /// Red zone below RSP the callee may use without adjusting RSP.
    pub red_zone: u32,
    /// Registers the callee must preserve.
    pub callee_saved: &'static [Reg],
    /// Struct-return-by-hidden-pointer threshold in bytes.
    pub sret_threshold: u32,
    /// True when int/float arguments share position slots (Win64).
    pub positional_args: bool,
}

const SYSV_INT_ARGS: &[Reg] = &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
const SYSV_CALLEE_SAVED: &[Reg] = &[Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

const WIN64_INT_ARGS: &[Reg] = &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
const WIN64_CALLEE_SAVED: &[Reg] = &[
    Reg::Rbx,
    Reg::Rbp,
    Reg::Rdi,
    Reg::Rsi,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// The ABI description for a calling convention.
pub fn abi_for(conv: CallConv) -> Abi {
    match conv {
        CallConv::SysV => Abi {
            int_args: SYSV_INT_ARGS,
            float_arg_count: 8,
            shadow_space: 0,
            red_zone: 128,
            callee_saved: SYSV_CALLEE_SAVED,
            sret_threshold: 128,
            positional_args: false,
        },
        CallConv::Win64 => Abi {
            int_args: WIN64_INT_ARGS,
            float_arg_count: 4,
            shadow_space: 32,
            red_zone: 0,
            callee_saved: WIN64_CALLEE_SAVED,
            sret_threshold: 64,
            positional_args: true,
        },
    }
}

/// Allocatable scratch pool per convention. Only caller-saved registers are
/// handed out, so the prologue never needs callee-saved spills for
/// temporaries. RAX stays out of the pool: division, returns and the
/// exception pointer all clobber it.
pub fn scratch_pool(conv: CallConv) -> &'static [Reg] {
    match conv {
        CallConv::SysV => &[
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rsi,
            Reg::Rdi,
            Reg::R8,
            Reg::R9,
            Reg::R10,
            Reg::R11,
        ],
        // RSI/RDI are callee-saved on Win64 and stay out of the pool.
        CallConv::Win64 => &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9, Reg::R10, Reg::R11],
    }
}

/// SysV `va_list` layout: `{ u32 gp_offset; u32 fp_offset;
/// void* overflow_arg_area; void* reg_save_area; }`. The register save area
/// holds the six GPRs then eight XMMs.
pub mod va_list {
    /// Offset of `gp_offset` within `va_list`.
    pub const GP_OFFSET: u32 = 0;
    /// Offset of `fp_offset`.
    pub const FP_OFFSET: u32 = 4;
    /// Offset of `overflow_arg_area`.
    pub const OVERFLOW_ARG_AREA: u32 = 8;
    /// Offset of `reg_save_area`.
    pub const REG_SAVE_AREA: u32 = 16;
    /// Total size of the register save area (6 GPRs + 8 XMM * 16).
    pub const REG_SAVE_AREA_SIZE: u32 = 176;
    /// `fp_offset` initial value (floats start after the 6 GPR slots).
    pub const FP_OFFSET_START: u32 = 48;
}

/// Stack offset (relative to RBP after the standard prologue) of the i-th
/// stack-passed argument.
pub fn stack_arg_offset(conv: CallConv, stack_index: usize) -> i32 {
    let base = match conv {
        // [rbp+16] is the first stack argument after saved RBP + return
        // address.
        CallConv::SysV => 16,
        // Win64 callers also reserve 32 bytes of shadow space.
        CallConv::Win64 => 16 + 32,
    };
    base + (stack_index as i32) * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_argument_order() {
        let abi = abi_for(CallConv::SysV);
        assert_eq!(abi.int_args[0], Reg::Rdi);
        assert_eq!(abi.int_args[5], Reg::R9);
        assert_eq!(abi.float_arg_count, 8);
        assert_eq!(abi.shadow_space, 0);
        assert_eq!(abi.red_zone, 128);
        assert_eq!(abi.sret_threshold, 128);
    }

    #[test]
    fn test_win64_argument_order() {
        let abi = abi_for(CallConv::Win64);
        assert_eq!(abi.int_args, &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9]);
        assert_eq!(abi.shadow_space, 32);
        assert_eq!(abi.sret_threshold, 64);
        assert!(abi.positional_args);
        assert!(abi.callee_saved.contains(&Reg::Rdi));
        assert!(abi.callee_saved.contains(&Reg::Rsi));
    }

    #[test]
    fn test_scratch_pool_is_caller_saved() {
        for conv in [CallConv::SysV, CallConv::Win64] {
            let abi = abi_for(conv);
            for reg in scratch_pool(conv) {
                assert!(
                    !abi.callee_saved.contains(reg),
                    "{reg:?} is callee-saved under {conv:?}"
                );
            }
        }
    }

    #[test]
    fn test_stack_arg_offsets() {
        assert_eq!(stack_arg_offset(CallConv::SysV, 0), 16);
        assert_eq!(stack_arg_offset(CallConv::SysV, 1), 24);
        assert_eq!(stack_arg_offset(CallConv::Win64, 0), 48);
    }

    #[test]
    fn test_va_list_layout() {
        assert_eq!(va_list::REG_SAVE_AREA_SIZE, 176);
        assert_eq!(va_list::FP_OFFSET_START, 48);
    }
}
