//! Itanium-ABI unwind tables: `.eh_frame` and `.gcc_except_table`.
//!
//! One shared CIE with augmentation `"zPLR"` carries the PC-relative pointer
//! to `__gxx_personality_v0`, the LSDA encoding, and the initial CFI rows
//! (CFA = RSP+8, return address at CFA-8). Each function gets an FDE whose
//! CFI instructions replay the prologue log: `push rbp` moves the CFA offset
//! to 16 and saves RBP at CFA-16, `mov rbp, rsp` re-bases the CFA on RBP.
//!
//! The LSDA layout follows `__gxx_personality_v0`'s reader: header byte
//! pair, ULEB call-site table covering the whole function (gap entries carry
//! action 0), SLEB action chains (one per try region, linking its handlers
//! in order), and the type table read backwards — the entry for filter `f`
//! sits `f` slots before TTBase, so `filter = type_table_size - type_index`
//! over forward indices. A `catch (...)` is a positive filter whose type
//! entry is NULL, not filter zero.

use crate::emit::FuncRecord;
use crate::obj::{ObjectModule, RelocKind, SectionId, SectionKind, SymbolBinding, SymbolClass};
use crate::CodegenError;

use super::{sleb128, uleb128, uleb_len};

// DWARF EH pointer encodings.
const DW_EH_PE_PCREL_SDATA4: u8 = 0x1b;
const DW_EH_PE_OMIT: u8 = 0xff;
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_ULEB128: u8 = 0x01;

// CFA opcodes.
const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_NOP: u8 = 0x00;

const RBP_DWARF: u64 = 6;
const RSP_DWARF: u64 = 7;
const RA_DWARF: u64 = 16;

/// Emit `.eh_frame` and `.gcc_except_table` for all functions.
pub fn emit(
    module: &mut ObjectModule,
    records: &[FuncRecord],
    _text: SectionId,
    types: &fcpp_sem::TypeRegistry,
    strings: &fcpp_util::StringTable,
) -> Result<(), CodegenError> {
    let eh_frame = module.add_section(".eh_frame", SectionKind::EhFrame, 8);
    let except_table = module.add_section(".gcc_except_table", SectionKind::GccExceptTable, 8);

    // LSDAs first so FDEs can reference their symbols.
    for (index, record) in records.iter().enumerate() {
        if record.tries.is_empty() {
            continue;
        }
        let lsda = build_lsda(module, except_table, record, types, strings)?;
        let at = module.len(except_table);
        module.append_bytes(except_table, &lsda);
        module.add_symbol(
            &lsda_symbol(index),
            except_table,
            at,
            lsda.len() as u64,
            SymbolClass::Data,
            SymbolBinding::Local,
        );
    }

    let cie_offset = emit_cie(module, eh_frame);
    for (index, record) in records.iter().enumerate() {
        emit_fde(module, eh_frame, cie_offset, index, record);
    }
    // Terminator.
    module.append_bytes(eh_frame, &[0, 0, 0, 0]);
    Ok(())
}

fn lsda_symbol(index: usize) -> String {
    format!(".LLSDA{index}")
}

/// The shared CIE; returns its section offset.
fn emit_cie(module: &mut ObjectModule, eh_frame: SectionId) -> u64 {
    let start = module.len(eh_frame);
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // CIE id
    body.push(1); // version
    body.extend_from_slice(b"zPLR\0");
    uleb128(&mut body, 1); // code alignment
    sleb128(&mut body, -8); // data alignment
    uleb128(&mut body, RA_DWARF); // return address register

    // Augmentation data: P (personality encoding + pointer), L, R.
    let mut aug = Vec::new();
    aug.push(DW_EH_PE_PCREL_SDATA4);
    let personality_field = aug.len();
    aug.extend_from_slice(&0i32.to_le_bytes());
    aug.push(DW_EH_PE_PCREL_SDATA4); // LSDA encoding
    aug.push(DW_EH_PE_PCREL_SDATA4); // FDE encoding
    uleb128(&mut body, aug.len() as u64);
    let aug_at = body.len();
    body.extend_from_slice(&aug);

    // Initial instructions: CFA = RSP+8, RA saved at CFA-8.
    body.push(DW_CFA_DEF_CFA);
    uleb128(&mut body, RSP_DWARF);
    uleb128(&mut body, 8);
    body.push(DW_CFA_OFFSET | RA_DWARF as u8);
    uleb128(&mut body, 1);
    while (body.len() + 4) % 8 != 0 {
        body.push(DW_CFA_NOP);
    }

    let mut full = Vec::with_capacity(body.len() + 4);
    full.extend_from_slice(&(body.len() as u32).to_le_bytes());
    full.extend_from_slice(&body);
    module.append_bytes(eh_frame, &full);

    // Personality pointer relocation (PC-relative against the field).
    let personality = module.symbol_ref("__gxx_personality_v0");
    let field_offset = start + 4 + aug_at as u64 + personality_field as u64;
    module.add_relocation(eh_frame, field_offset, personality, RelocKind::Pc32, 0);
    start
}

fn emit_fde(
    module: &mut ObjectModule,
    eh_frame: SectionId,
    cie_offset: u64,
    index: usize,
    record: &FuncRecord,
) {
    let start = module.len(eh_frame);
    let mut body = Vec::new();

    // CIE pointer: distance from this field back to the CIE.
    let cie_ptr_field = start + 4;
    body.extend_from_slice(&((cie_ptr_field - cie_offset) as u32).to_le_bytes());

    // pc_begin (pcrel sdata4, relocated) and pc_range.
    let pc_begin_field = body.len();
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(record.len as u32).to_le_bytes());

    // Augmentation: 4-byte LSDA pointer (0 = none).
    uleb128(&mut body, 4);
    let lsda_field = body.len();
    body.extend_from_slice(&0i32.to_le_bytes());

    // CFI program from the prologue log.
    let mut loc = 0u32;
    for event in &record.cfi.events {
        advance_loc(&mut body, &mut loc, event.code_offset());
        match event {
            crate::cfi::CfiEvent::PushRbp { .. } => {
                body.push(DW_CFA_DEF_CFA_OFFSET);
                uleb128(&mut body, 16);
                body.push(DW_CFA_OFFSET | RBP_DWARF as u8);
                uleb128(&mut body, 2); // CFA-16 with data alignment -8
            }
            crate::cfi::CfiEvent::MovRbpRsp { .. } => {
                body.push(DW_CFA_DEF_CFA_REGISTER);
                uleb128(&mut body, RBP_DWARF);
            }
            // Frame allocation does not move the CFA once it is RBP-based.
            crate::cfi::CfiEvent::SubRsp { .. } => {}
        }
    }
    while (body.len() + 4) % 8 != 0 {
        body.push(DW_CFA_NOP);
    }

    let mut full = Vec::with_capacity(body.len() + 4);
    full.extend_from_slice(&(body.len() as u32).to_le_bytes());
    full.extend_from_slice(&body);
    module.append_bytes(eh_frame, &full);

    let fn_symbol = module.symbol_ref(&record.mangled);
    module.add_relocation(
        eh_frame,
        start + 4 + pc_begin_field as u64,
        fn_symbol,
        RelocKind::Pc32,
        0,
    );
    if !record.tries.is_empty() {
        let lsda = module.symbol_ref(&lsda_symbol(index));
        module.add_relocation(
            eh_frame,
            start + 4 + lsda_field as u64,
            lsda,
            RelocKind::Pc32,
            0,
        );
    }
}

fn advance_loc(body: &mut Vec<u8>, loc: &mut u32, to: u32) {
    let delta = to.saturating_sub(*loc);
    *loc = to.max(*loc);
    if delta == 0 {
        return;
    }
    if delta < 0x40 {
        body.push(DW_CFA_ADVANCE_LOC | delta as u8);
    } else if delta <= 0xff {
        body.push(DW_CFA_ADVANCE_LOC1);
        body.push(delta as u8);
    } else {
        body.push(DW_CFA_ADVANCE_LOC2);
        body.extend_from_slice(&(delta as u16).to_le_bytes());
    }
}

/// Build one function's LSDA bytes; type-table relocations are added
/// against the final section offset, so the caller must append the returned
/// buffer at `module.len(section)` unchanged.
fn build_lsda(
    module: &mut ObjectModule,
    section: SectionId,
    record: &FuncRecord,
    types: &fcpp_sem::TypeRegistry,
    strings: &fcpp_util::StringTable,
) -> Result<Vec<u8>, CodegenError> {
    // Call-site table: sorted try regions plus gap entries with action 0.
    let mut sites: Vec<(u32, u32, u32, u64)> = Vec::new(); // start, len, pad, action
    let mut tries = record.tries.clone();
    tries.sort_by_key(|t| t.start);

    // Action table: per region, a chain of (filter, next) records. Records
    // are two bytes each; the call-site action index is offset+1.
    let mut actions: Vec<u8> = Vec::new();
    let mut region_action: Vec<u64> = Vec::new();
    let mut type_count = 0usize;
    for t in &tries {
        region_action.push(actions.len() as u64 + 1);
        type_count = type_count.max(t.handlers.len());
        for (i, handler) in t.handlers.iter().enumerate() {
            sleb128(&mut actions, handler.filter as i64);
            if i + 1 == t.handlers.len() {
                sleb128(&mut actions, 0);
            } else {
                // Next record starts right after this displacement byte.
                sleb128(&mut actions, 1);
            }
        }
    }

    let mut cursor = 0u32;
    for (i, t) in tries.iter().enumerate() {
        if t.start > cursor {
            sites.push((cursor, t.start - cursor, 0, 0));
        }
        sites.push((t.start, t.end - t.start, t.pad, region_action[i]));
        cursor = t.end;
    }
    if cursor < record.len as u32 {
        sites.push((cursor, record.len as u32 - cursor, 0, 0));
    }

    let mut cs_table = Vec::new();
    for &(start, len, pad, action) in &sites {
        uleb128(&mut cs_table, start as u64);
        uleb128(&mut cs_table, len as u64);
        uleb128(&mut cs_table, pad as u64);
        uleb128(&mut cs_table, action);
    }

    // The largest filter across regions bounds the type table.
    let type_table_size = record
        .tries
        .iter()
        .flat_map(|t| t.handlers.iter())
        .map(|h| h.filter as usize)
        .max()
        .unwrap_or(0)
        .max(type_count);

    // Header + tables. The TType base offset counts from just after its own
    // ULEB to TTBase (the end of the type table); it therefore includes the
    // call-site encoding byte, the call-site length ULEB, both tables, and
    // the type table itself. Getting this sum wrong shifts every filter.
    let cs_header = 1 + uleb_len(cs_table.len() as u64); // encoding byte + length
    let ttype_offset = cs_header + cs_table.len() + actions.len() + type_table_size * 8;

    let mut body = Vec::new();
    body.push(DW_EH_PE_OMIT); // LPStart: landing pads relative to fn start
    body.push(DW_EH_PE_ABSPTR); // TType encoding: absolute 8-byte pointers
    uleb128(&mut body, ttype_offset as u64);
    body.push(DW_EH_PE_ULEB128); // call-site table encoding
    uleb128(&mut body, cs_table.len() as u64);
    body.extend_from_slice(&cs_table);
    body.extend_from_slice(&actions);

    // Type table, written so the entry for filter f is f slots before
    // TTBase: highest filter first.
    let table_start_in_body = body.len();
    let base = module.len(section);
    for f in (1..=type_table_size).rev() {
        let handler = record
            .tries
            .iter()
            .flat_map(|t| t.handlers.iter())
            .find(|h| h.filter as usize == f);
        let catch_ty = handler.and_then(|h| h.catch_ty);
        body.extend_from_slice(&[0u8; 8]);
        if let Some(ty) = catch_ty {
            let entry_at = base + table_start_in_body as u64 + ((type_table_size - f) * 8) as u64;
            let symbol = fcpp_ir::mangle::type_info_symbol(
                ty,
                types,
                strings,
                fcpp_ir::Target::Linux64,
            );
            let id = module.symbol_ref(&symbol);
            module.add_relocation(section, entry_at, id, RelocKind::Abs64, 0);
        }
        // catch (...) keeps a NULL entry at a positive filter.
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_formula() {
        // For type table size N, the runtime reads the entry at position
        // N - filter (forward index). Handler i carries filter i+1, so
        // forward index = N - 1 - i: handlers in reverse.
        let n = 3usize;
        for (i, filter) in (0..n).map(|i| (i, i as i32 + 1)) {
            assert_eq!(n - filter as usize, n - 1 - i);
        }
    }
}
