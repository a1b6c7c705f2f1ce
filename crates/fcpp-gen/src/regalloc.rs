//! Register allocation with an explicit flush discipline.
//!
//! A compact state record per physical register tracks whether it is
//! allocated, whether its value is newer than its stack slot (`dirty`), and
//! which frame slot it mirrors (`SLOT_NONE` when unmapped). Policies:
//!
//! - **Acquire** prefers a free register, then evicts the least-recently-used
//!   clean one, then spills the least-recently-used dirty one.
//! - **Flush** at suspension points (calls, branches, labels that can be
//!   reached by back edges) writes *every* dirty register to its slot —
//!   regardless of the slot's alignment — and then clears every mapping so
//!   subsequent reads re-load from memory. A register whose mapping survived
//!   a flush would no longer reflect memory after the other control-flow
//!   path runs.
//! - **Loads** are sized: `MOVSX` for signed values narrower than 64 bits,
//!   `MOVZX` (or the implicit 32-bit zero extension) for unsigned, plain
//!   `MOV` for 64-bit. A 64-bit load for a narrower value would read the
//!   neighboring slot's bytes.

use fcpp_ir::TempVar;
use fcpp_util::FxHashMap;

use crate::encode::{self, Reg};

/// Sentinel for "no slot mapped".
pub const SLOT_NONE: i32 = i32::MIN;

/// Per-register allocation state.
#[derive(Clone, Copy, Debug)]
pub struct RegState {
    pub reg: Reg,
    pub is_allocated: bool,
    pub is_dirty: bool,
    /// RBP-relative frame slot this register mirrors, or [`SLOT_NONE`].
    pub stack_slot_offset: i32,
    /// Width of the held value.
    pub value_bits: u8,
    /// Signedness of the held value (drives the re-load extension).
    pub value_signed: bool,
    lru: u64,
}

/// The allocator over a fixed scratch pool.
pub struct RegAlloc {
    regs: Vec<RegState>,
    /// Which register currently holds a temp's value.
    temp_map: FxHashMap<TempVar, usize>,
    tick: u64,
}

impl RegAlloc {
    pub fn new(pool: &[Reg]) -> Self {
        Self {
            regs: pool
                .iter()
                .map(|&reg| RegState {
                    reg,
                    is_allocated: false,
                    is_dirty: false,
                    stack_slot_offset: SLOT_NONE,
                    value_bits: 64,
                    value_signed: false,
                    lru: 0,
                })
                .collect(),
            temp_map: FxHashMap::default(),
            tick: 0,
        }
    }

    fn touch(&mut self, index: usize) {
        self.tick += 1;
        self.regs[index].lru = self.tick;
    }

    fn index_of(&self, reg: Reg) -> Option<usize> {
        self.regs.iter().position(|r| r.reg == reg)
    }

    /// Acquire a register: free, else LRU clean, else spill LRU dirty.
    pub fn acquire(&mut self, buf: &mut Vec<u8>) -> Reg {
        if let Some(i) = self.regs.iter().position(|r| !r.is_allocated) {
            self.touch(i);
            self.regs[i].is_allocated = true;
            self.regs[i].is_dirty = false;
            self.regs[i].stack_slot_offset = SLOT_NONE;
            return self.regs[i].reg;
        }
        // LRU among clean registers first.
        let victim = self
            .regs
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_dirty)
            .min_by_key(|(_, r)| r.lru)
            .map(|(i, _)| i)
            .unwrap_or_else(|| {
                self.regs
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| r.lru)
                    .map(|(i, _)| i)
                    .expect("pool is never empty")
            });
        self.evict(buf, victim);
        self.touch(victim);
        self.regs[victim].is_allocated = true;
        self.regs[victim].is_dirty = false;
        self.regs[victim].stack_slot_offset = SLOT_NONE;
        self.regs[victim].reg
    }

    fn evict(&mut self, buf: &mut Vec<u8>, index: usize) {
        let state = self.regs[index];
        if state.is_dirty && state.stack_slot_offset != SLOT_NONE {
            encode::mov_store(buf, state.value_bits, Reg::Rbp, state.stack_slot_offset, state.reg);
        }
        self.forget_mappings_to(index);
        self.regs[index].is_dirty = false;
        self.regs[index].stack_slot_offset = SLOT_NONE;
    }

    fn forget_mappings_to(&mut self, index: usize) {
        self.temp_map.retain(|_, &mut i| i != index);
    }

    /// Bind a register to a temp and its spill slot.
    pub fn bind_temp(&mut self, reg: Reg, temp: TempVar, slot: i32, bits: u8, signed: bool, dirty: bool) {
        let index = self.index_of(reg).expect("register from this pool");
        self.forget_mappings_to(index);
        self.touch(index);
        let state = &mut self.regs[index];
        state.is_allocated = true;
        state.is_dirty = dirty;
        state.stack_slot_offset = slot;
        state.value_bits = bits;
        state.value_signed = signed;
        self.temp_map.insert(temp, index);
    }

    /// The register currently holding a temp, if its mapping survived.
    pub fn reg_of(&mut self, temp: TempVar) -> Option<Reg> {
        let index = *self.temp_map.get(&temp)?;
        self.touch(index);
        Some(self.regs[index].reg)
    }

    /// Load a temp from its frame slot with a sized move, unless a register
    /// already holds it.
    pub fn load_temp(
        &mut self,
        buf: &mut Vec<u8>,
        temp: TempVar,
        slot: i32,
        bits: u8,
        signed: bool,
    ) -> Reg {
        if let Some(reg) = self.reg_of(temp) {
            return reg;
        }
        let reg = self.acquire(buf);
        encode::mov_load(buf, bits, signed, reg, Reg::Rbp, slot);
        self.bind_temp(reg, temp, slot, bits, signed, false);
        reg
    }

    /// Mark a register free without spilling (its value is dead).
    pub fn release(&mut self, reg: Reg) {
        if let Some(index) = self.index_of(reg) {
            self.forget_mappings_to(index);
            self.regs[index].is_allocated = false;
            self.regs[index].is_dirty = false;
            self.regs[index].stack_slot_offset = SLOT_NONE;
        }
    }

    /// Flush every dirty register to its slot and clear all mappings.
    ///
    /// Every dirty register is written regardless of how its slot offset is
    /// aligned; after the walk no register keeps a `stack_slot_offset`
    /// other than the sentinel, so the next read of any value re-loads from
    /// memory.
    pub fn flush_all_dirty(&mut self, buf: &mut Vec<u8>) {
        for index in 0..self.regs.len() {
            let state = self.regs[index];
            if state.is_allocated && state.is_dirty && state.stack_slot_offset != SLOT_NONE {
                encode::mov_store(
                    buf,
                    state.value_bits,
                    Reg::Rbp,
                    state.stack_slot_offset,
                    state.reg,
                );
            }
            self.regs[index].is_allocated = false;
            self.regs[index].is_dirty = false;
            self.regs[index].stack_slot_offset = SLOT_NONE;
        }
        self.temp_map.clear();
    }

    /// State snapshot for tests and assertions.
    pub fn states(&self) -> &[RegState] {
        &self.regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::scratch_pool;
    use fcpp_ir::CallConv;

    fn alloc() -> RegAlloc {
        RegAlloc::new(scratch_pool(CallConv::SysV))
    }

    #[test]
    fn test_acquire_prefers_free() {
        let mut a = alloc();
        let mut buf = Vec::new();
        let r1 = a.acquire(&mut buf);
        let r2 = a.acquire(&mut buf);
        assert_ne!(r1, r2);
        assert!(buf.is_empty(), "no spill while registers are free");
    }

    #[test]
    fn test_spill_emits_store_for_dirty_lru() {
        let mut a = alloc();
        let mut buf = Vec::new();
        let pool_len = a.states().len();
        // Fill the pool with dirty bindings.
        for i in 0..pool_len {
            let r = a.acquire(&mut buf);
            a.bind_temp(r, TempVar(i as u32), -8 * (i as i32 + 1), 64, true, true);
        }
        assert!(buf.is_empty());
        // The next acquire must spill something.
        let _ = a.acquire(&mut buf);
        assert!(!buf.is_empty(), "dirty eviction writes the slot");
    }

    #[test]
    fn test_flush_clears_every_mapping() {
        let mut a = alloc();
        let mut buf = Vec::new();
        let r1 = a.acquire(&mut buf);
        // Deliberately non-8-byte-aligned slot: -12. The flush must write
        // it anyway.
        a.bind_temp(r1, TempVar(0), -12, 32, true, true);
        let r2 = a.acquire(&mut buf);
        a.bind_temp(r2, TempVar(1), -16, 64, false, true);
        buf.clear();
        a.flush_all_dirty(&mut buf);
        assert!(!buf.is_empty(), "dirty registers written");
        for state in a.states() {
            assert_eq!(state.stack_slot_offset, SLOT_NONE);
            assert!(!state.is_dirty);
            assert!(!state.is_allocated);
        }
        // Subsequent reads re-load from memory.
        assert!(a.reg_of(TempVar(0)).is_none());
        assert!(a.reg_of(TempVar(1)).is_none());
    }

    #[test]
    fn test_load_reuses_live_register() {
        let mut a = alloc();
        let mut buf = Vec::new();
        let r = a.load_temp(&mut buf, TempVar(3), -24, 32, true);
        let len_after_first = buf.len();
        let r2 = a.load_temp(&mut buf, TempVar(3), -24, 32, true);
        assert_eq!(r, r2);
        assert_eq!(buf.len(), len_after_first, "second load is free");
    }

    #[test]
    fn test_sized_load_uses_movsx() {
        let mut a = alloc();
        let mut buf = Vec::new();
        let _ = a.load_temp(&mut buf, TempVar(0), -4, 8, true);
        // movsx r64, byte ptr: REX .. 0f be.
        assert!(buf.windows(2).any(|w| w == [0x0f, 0xbe]));
        buf.clear();
        a.flush_all_dirty(&mut buf);
        buf.clear();
        let _ = a.load_temp(&mut buf, TempVar(1), -8, 16, false);
        assert!(buf.windows(2).any(|w| w == [0x0f, 0xb7]), "movzx for unsigned");
    }

    #[test]
    fn test_release_frees_without_store() {
        let mut a = alloc();
        let mut buf = Vec::new();
        let r = a.acquire(&mut buf);
        a.bind_temp(r, TempVar(9), -8, 64, false, true);
        a.release(r);
        assert!(a.reg_of(TempVar(9)).is_none());
        assert!(buf.is_empty());
    }
}
