//! Win64 unwind and C++ exception tables.
//!
//! Every function gets a `RUNTIME_FUNCTION` in `.pdata` and an
//! `UNWIND_INFO` in `.xdata` whose codes are derived from the CFI prologue
//! log (`UWOP_PUSH_NONVOL rbp`, `UWOP_SET_FPREG`, `UWOP_ALLOC_*`). Functions
//! with try regions additionally get a `__CxxFrameHandler3` FuncInfo in
//! `.rdata`: magic `0x19930522`, the unwind map, the try-block map with
//! handler entries (catch funclets, establisher frame passed in RDX), and
//! the IP-to-state map. Type descriptors and ThrowInfo records for thrown
//! types are materialized alongside.

use fcpp_sem::{TypeIndex, TypeRegistry};
use fcpp_util::StringTable;

use crate::cfi::CfiEvent;
use crate::emit::FuncRecord;
use crate::obj::{ObjectModule, RelocKind, SectionId, SectionKind, SymbolBinding, SymbolClass};
use crate::CodegenError;

const FUNC_INFO_MAGIC: u32 = 0x1993_0522;

const UNW_FLAG_EHANDLER: u8 = 0x01;
const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const RBP_WIN: u8 = 5;

/// Emit `.pdata`, `.xdata` and FuncInfo structures.
pub fn emit(
    module: &mut ObjectModule,
    records: &[FuncRecord],
    _text: SectionId,
    types: &TypeRegistry,
    strings: &StringTable,
) -> Result<(), CodegenError> {
    let pdata = module.add_section(".pdata", SectionKind::Pdata, 4);
    let xdata = module.add_section(".xdata", SectionKind::Xdata, 4);
    let existing_rdata = module
        .sections()
        .find(|(_, s)| s.name == ".rdata")
        .map(|(id, _)| id);
    let rdata = match existing_rdata {
        Some(id) => id,
        None => module.add_section(".rdata", SectionKind::ROData, 8),
    };

    // Type descriptors for every thrown or caught type, deduplicated.
    let mut descriptor_types: Vec<TypeIndex> = Vec::new();
    for record in records {
        for ty in &record.thrown_types {
            if !descriptor_types.contains(ty) {
                descriptor_types.push(*ty);
            }
        }
        for t in &record.tries {
            for h in &t.handlers {
                if let Some(ty) = h.catch_ty {
                    if !descriptor_types.contains(&ty) {
                        descriptor_types.push(ty);
                    }
                }
            }
        }
    }
    for &ty in &descriptor_types {
        emit_type_descriptor(module, rdata, ty, types, strings);
    }
    for record in records {
        for &ty in &record.thrown_types {
            emit_throw_info(module, rdata, ty, types, strings);
        }
    }

    for (index, record) in records.iter().enumerate() {
        let func_info = if record.tries.is_empty() {
            None
        } else {
            Some(emit_func_info(module, rdata, index, record, types, strings)?)
        };
        emit_unwind_info(module, xdata, index, record, func_info)?;
        emit_runtime_function(module, pdata, record, index);

        // Catch funclets get their own RUNTIME_FUNCTION entries.
        for t in &record.tries {
            for h in &t.handlers {
                let fn_sym = module.symbol_ref(&record.mangled);
                let at = module.len(pdata);
                module.append_bytes(pdata, &[0u8; 12]);
                module.add_relocation(pdata, at, fn_sym, RelocKind::Rva32, h.body_offset as i64);
                module.add_relocation(
                    pdata,
                    at + 4,
                    fn_sym,
                    RelocKind::Rva32,
                    record.len as i64,
                );
                let unwind_sym = module.symbol_ref(&unwind_symbol(index));
                module.add_relocation(pdata, at + 8, unwind_sym, RelocKind::Rva32, 0);
            }
        }
    }
    Ok(())
}

fn unwind_symbol(index: usize) -> String {
    format!("$unwind${index}")
}

fn func_info_symbol(index: usize) -> String {
    format!("$cppxdata${index}")
}

fn emit_runtime_function(
    module: &mut ObjectModule,
    pdata: SectionId,
    record: &FuncRecord,
    index: usize,
) {
    let fn_sym = module.symbol_ref(&record.mangled);
    let at = module.len(pdata);
    module.append_bytes(pdata, &[0u8; 12]);
    module.add_relocation(pdata, at, fn_sym, RelocKind::Rva32, 0);
    module.add_relocation(pdata, at + 4, fn_sym, RelocKind::Rva32, record.len as i64);
    let unwind_sym = module.symbol_ref(&unwind_symbol(index));
    module.add_relocation(pdata, at + 8, unwind_sym, RelocKind::Rva32, 0);
}

/// Emit one UNWIND_INFO; returns its `.xdata` offset.
fn emit_unwind_info(
    module: &mut ObjectModule,
    xdata: SectionId,
    index: usize,
    record: &FuncRecord,
    func_info: Option<u64>,
) -> Result<u64, CodegenError> {
    // Unwind codes in reverse chronological order.
    let mut codes: Vec<(u8, u8, Option<u32>)> = Vec::new(); // (offset, op|info<<4, extra)
    let mut prologue_size = 0u8;
    for event in &record.cfi.events {
        let off = event.code_offset().min(255) as u8;
        prologue_size = prologue_size.max(off);
        match *event {
            CfiEvent::PushRbp { .. } => {
                codes.push((off, UWOP_PUSH_NONVOL | (RBP_WIN << 4), None));
            }
            CfiEvent::MovRbpRsp { .. } => {
                codes.push((off, UWOP_SET_FPREG, None));
            }
            CfiEvent::SubRsp { amount, .. } => {
                if amount <= 128 {
                    let info = ((amount / 8).saturating_sub(1)) as u8;
                    codes.push((off, UWOP_ALLOC_SMALL | (info << 4), None));
                } else {
                    codes.push((off, UWOP_ALLOC_LARGE, Some(amount / 8)));
                }
            }
        }
    }
    codes.reverse();

    let mut body: Vec<u8> = Vec::new();
    let flags = if func_info.is_some() { UNW_FLAG_EHANDLER } else { 0 };
    body.push(1 | (flags << 3)); // version 1 + flags
    body.push(prologue_size);
    // Slot count: ALLOC_LARGE takes an extra 16-bit slot.
    let slot_count: u8 = codes
        .iter()
        .map(|(_, _, extra)| if extra.is_some() { 2u8 } else { 1 })
        .sum();
    body.push(slot_count);
    body.push(RBP_WIN); // frame register RBP, frame offset 0
    for (off, op, extra) in &codes {
        body.push(*off);
        body.push(*op);
        if let Some(size) = extra {
            body.extend_from_slice(&(*size as u16).to_le_bytes());
        }
    }
    if slot_count % 2 == 1 {
        body.extend_from_slice(&[0, 0]); // even-slot padding
    }

    let at = align4(module, xdata);
    module.append_bytes(xdata, &body);

    if let Some(fi_offset) = func_info {
        // Language-specific handler + FuncInfo RVA.
        let handler_at = module.len(xdata);
        module.append_bytes(xdata, &[0u8; 8]);
        let handler = module.symbol_ref("__CxxFrameHandler3");
        module.add_relocation(xdata, handler_at, handler, RelocKind::Rva32, 0);
        let fi_sym = module.symbol_ref(&func_info_symbol(index));
        module.add_relocation(xdata, handler_at + 4, fi_sym, RelocKind::Rva32, fi_offset as i64);
    }

    let size = module.len(xdata) - at;
    module.add_symbol(
        &unwind_symbol(index),
        xdata,
        at,
        size,
        SymbolClass::Data,
        SymbolBinding::Local,
    );
    Ok(at)
}

/// Emit the `__CxxFrameHandler3` FuncInfo and its maps; returns the offset
/// of the FuncInfo within the `.rdata` symbol (always 0 — the symbol points
/// at the structure).
fn emit_func_info(
    module: &mut ObjectModule,
    rdata: SectionId,
    index: usize,
    record: &FuncRecord,
    types: &TypeRegistry,
    strings: &StringTable,
) -> Result<u64, CodegenError> {
    let fn_sym = module.symbol_ref(&record.mangled);

    // Unwind map: one state per try region plus the base state -1.
    // State s = region index; toState = -1.
    let unwind_map_at = align4(module, rdata);
    for _ in &record.tries {
        module.append_bytes(rdata, &(-1i32).to_le_bytes());
        module.append_bytes(rdata, &0u32.to_le_bytes()); // no cleanup action
    }
    let max_state = record.tries.len() as i32;

    // Handler arrays per try block.
    let mut handler_arrays = Vec::new();
    for t in &record.tries {
        let at = align4(module, rdata);
        for h in &t.handlers {
            // HandlerType { adjectives, dispType, dispCatchObj, dispOfHandler, dispFrame }
            let adjectives: u32 = if h.catch_ty.is_none() { 0x40 } else { 0 }; // catch-all
            module.append_bytes(rdata, &adjectives.to_le_bytes());
            let ty_at = module.len(rdata);
            module.append_bytes(rdata, &0u32.to_le_bytes());
            if let Some(ty) = h.catch_ty {
                let td = module.symbol_ref(&descriptor_symbol(ty, types, strings));
                module.add_relocation(rdata, ty_at, td, RelocKind::Rva32, 0);
            }
            module.append_bytes(rdata, &0i32.to_le_bytes()); // dispCatchObj
            let handler_at = module.len(rdata);
            module.append_bytes(rdata, &0u32.to_le_bytes());
            module.add_relocation(
                rdata,
                handler_at,
                fn_sym,
                RelocKind::Rva32,
                h.body_offset as i64,
            );
            module.append_bytes(rdata, &0u32.to_le_bytes()); // dispFrame
        }
        handler_arrays.push(at);
    }

    // Try-block map.
    let try_map_at = align4(module, rdata);
    for (i, t) in record.tries.iter().enumerate() {
        module.append_bytes(rdata, &(i as i32).to_le_bytes()); // tryLow
        module.append_bytes(rdata, &(i as i32).to_le_bytes()); // tryHigh
        module.append_bytes(rdata, &(i as i32 + 1).to_le_bytes()); // catchHigh
        module.append_bytes(rdata, &(t.handlers.len() as i32).to_le_bytes());
        let arr_at = module.len(rdata);
        module.append_bytes(rdata, &0u32.to_le_bytes());
        // RVA into .rdata through the section-start symbol.
        let rdata_sym = rdata_start_symbol(module, rdata);
        module.add_relocation(rdata, arr_at, rdata_sym, RelocKind::Rva32, handler_arrays[i] as i64);
    }

    // IP-to-state map: before the first try = -1, each try start enters its
    // state, each try end returns to -1.
    let mut ip_entries: Vec<(u32, i32)> = vec![(0, -1)];
    let mut tries_sorted = record.tries.clone();
    tries_sorted.sort_by_key(|t| t.start);
    for t in &tries_sorted {
        ip_entries.push((t.start, t.region as i32));
        ip_entries.push((t.end, -1));
    }
    let ip_map_at = align4(module, rdata);
    for (off, state) in &ip_entries {
        let at = module.len(rdata);
        module.append_bytes(rdata, &0u32.to_le_bytes());
        module.add_relocation(rdata, at, fn_sym, RelocKind::Rva32, *off as i64);
        module.append_bytes(rdata, &state.to_le_bytes());
    }

    // FuncInfo itself.
    let rdata_sym = rdata_start_symbol(module, rdata);
    let fi_at = align4(module, rdata);
    module.append_bytes(rdata, &FUNC_INFO_MAGIC.to_le_bytes());
    module.append_bytes(rdata, &max_state.to_le_bytes());
    let unwind_field = module.len(rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes());
    module.add_relocation(rdata, unwind_field, rdata_sym, RelocKind::Rva32, unwind_map_at as i64);
    module.append_bytes(rdata, &(record.tries.len() as u32).to_le_bytes());
    let try_field = module.len(rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes());
    module.add_relocation(rdata, try_field, rdata_sym, RelocKind::Rva32, try_map_at as i64);
    module.append_bytes(rdata, &(ip_entries.len() as u32).to_le_bytes());
    let ip_field = module.len(rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes());
    module.add_relocation(rdata, ip_field, rdata_sym, RelocKind::Rva32, ip_map_at as i64);
    module.append_bytes(rdata, &0i32.to_le_bytes()); // dispUnwindHelp
    module.append_bytes(rdata, &0u32.to_le_bytes()); // dispESTypeList
    module.append_bytes(rdata, &1u32.to_le_bytes()); // EHFlags: EHs

    let size = module.len(rdata) - fi_at;
    module.add_symbol(
        &func_info_symbol(index),
        rdata,
        fi_at,
        size,
        SymbolClass::Data,
        SymbolBinding::Local,
    );
    Ok(0)
}

/// A local symbol at `.rdata` offset 0, so RVA fields inside FuncInfo can
/// relocate section-relative.
fn rdata_start_symbol(module: &mut ObjectModule, rdata: SectionId) -> crate::obj::SymbolId {
    if module.lookup("$rdata$base").is_none() {
        return module.add_symbol(
            "$rdata$base",
            rdata,
            0,
            0,
            SymbolClass::Data,
            SymbolBinding::Local,
        );
    }
    module.symbol_ref("$rdata$base")
}

fn descriptor_symbol(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable) -> String {
    fcpp_ir::mangle::msvc::type_descriptor_symbol(ty, types, strings)
}

/// TypeDescriptor: `{ &type_info vftable, spare, name[] }`.
fn emit_type_descriptor(
    module: &mut ObjectModule,
    rdata: SectionId,
    ty: TypeIndex,
    types: &TypeRegistry,
    strings: &StringTable,
) {
    let symbol = descriptor_symbol(ty, types, strings);
    if module.lookup(&symbol).is_some() {
        return;
    }
    let at = align8(module, rdata);
    let vft = module.symbol_ref("??_7type_info@@6B@");
    module.append_bytes(rdata, &[0u8; 8]);
    module.add_relocation(rdata, at, vft, RelocKind::Abs64, 0);
    module.append_bytes(rdata, &[0u8; 8]); // spare
    let name = msvc_raw_name(ty, types, strings);
    module.append_bytes(rdata, name.as_bytes());
    module.append_bytes(rdata, &[0]);
    module.add_symbol(
        &symbol,
        rdata,
        at,
        16 + name.len() as u64 + 1,
        SymbolClass::Data,
        SymbolBinding::Global,
    );
}

/// The decorated name stored inside a TypeDescriptor (`.H` for int,
/// `.?AUPoint@@` for a struct).
fn msvc_raw_name(ty: TypeIndex, types: &TypeRegistry, strings: &StringTable) -> String {
    let canon = types.canonical(ty);
    if types.is_class(canon) {
        format!(".?AU{}@@", strings.view(types.info(canon).name))
    } else {
        let b = types.builtins;
        let code = if canon == b.int {
            "H"
        } else if canon == b.uint {
            "I"
        } else if canon == b.char_ {
            "D"
        } else if canon == b.bool_ {
            "_N"
        } else if canon == b.double {
            "N"
        } else if canon == b.float {
            "M"
        } else if canon == b.llong || canon == b.long {
            "_J"
        } else {
            "H"
        };
        format!(".{code}")
    }
}

/// ThrowInfo + CatchableTypeArray + CatchableType for a thrown type.
fn emit_throw_info(
    module: &mut ObjectModule,
    rdata: SectionId,
    ty: TypeIndex,
    types: &TypeRegistry,
    strings: &StringTable,
) {
    let symbol = fcpp_ir::mangle::msvc::throw_info_symbol(ty, types, strings);
    if module.lookup(&symbol).is_some() {
        return;
    }
    emit_type_descriptor(module, rdata, ty, types, strings);
    let rdata_sym = rdata_start_symbol(module, rdata);
    let size = (types.size_bits(types.canonical(ty)) / 8).max(1);

    // CatchableType.
    let ct_at = align4(module, rdata);
    module.append_bytes(rdata, &1u32.to_le_bytes()); // properties: simple type
    let td_field = module.len(rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes());
    let td = module.symbol_ref(&descriptor_symbol(ty, types, strings));
    module.add_relocation(rdata, td_field, td, RelocKind::Rva32, 0);
    module.append_bytes(rdata, &0i32.to_le_bytes()); // this displacement: mdisp
    module.append_bytes(rdata, &(-1i32).to_le_bytes()); // pdisp
    module.append_bytes(rdata, &0i32.to_le_bytes()); // vdisp
    module.append_bytes(rdata, &size.to_le_bytes()); // sizeOrOffset
    module.append_bytes(rdata, &0u32.to_le_bytes()); // copyFunction

    // CatchableTypeArray with one entry.
    let cta_at = align4(module, rdata);
    module.append_bytes(rdata, &1u32.to_le_bytes());
    let entry_field = module.len(rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes());
    module.add_relocation(rdata, entry_field, rdata_sym, RelocKind::Rva32, ct_at as i64);

    // ThrowInfo.
    let ti_at = align4(module, rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes()); // attributes
    module.append_bytes(rdata, &0u32.to_le_bytes()); // pmfnUnwind
    module.append_bytes(rdata, &0u32.to_le_bytes()); // pForwardCompat
    let cta_field = module.len(rdata);
    module.append_bytes(rdata, &0u32.to_le_bytes());
    module.add_relocation(rdata, cta_field, rdata_sym, RelocKind::Rva32, cta_at as i64);
    module.add_symbol(
        &symbol,
        rdata,
        ti_at,
        16,
        SymbolClass::Data,
        SymbolBinding::Local,
    );
}

fn align4(module: &mut ObjectModule, section: SectionId) -> u64 {
    align_len(module, section, 4)
}

fn align8(module: &mut ObjectModule, section: SectionId) -> u64 {
    align_len(module, section, 8)
}

fn align_len(module: &mut ObjectModule, section: SectionId, align: u64) -> u64 {
    let len = module.len(section);
    let aligned = len.div_ceil(align) * align;
    if aligned > len {
        module.append_bytes(section, &vec![0u8; (aligned - len) as usize]);
    }
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_funcinfo_magic() {
        assert_eq!(FUNC_INFO_MAGIC, 0x19930522);
    }

    #[test]
    fn test_unwind_op_encoding() {
        // push rbp => offset, op 0 | reg 5 << 4.
        assert_eq!(UWOP_PUSH_NONVOL | (RBP_WIN << 4), 0x50);
        assert_eq!(UWOP_SET_FPREG, 3);
        assert_eq!(UWOP_ALLOC_SMALL, 2);
        assert_eq!(UWOP_ALLOC_LARGE, 1);
    }
}
