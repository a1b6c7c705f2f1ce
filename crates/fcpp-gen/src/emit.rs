//! IR-to-machine emission.
//!
//! [`FnEmitter`] walks one function's IR in order, allocating registers
//! through [`crate::regalloc::RegAlloc`], emitting encoded bytes, recording
//! relocations against symbol names, and logging CFI events for the
//! prologue. Suspension points — calls, branches, jumps, labels — flush all
//! dirty registers first, so memory is the single source of truth wherever
//! control flow can merge.
//!
//! [`emit_module`] drives all functions, then lays out data: globals,
//! pooled string literals, float constants, switch jump tables, vtables and
//! RTTI objects, `.init_array`, and finally the per-target EH metadata.

use fcpp_ir::{
    CallArg, Callee, CastKind, FunctionIr, IrBinOp, IrCmpOp, IrOp, IrUnOp, LabelId, Operand,
    Target, TempVar,
};
use fcpp_par::ast::{GlobalDef, Linkage};
use fcpp_sem::{ConstValue, TypeIndex, TypeRegistry};
use fcpp_util::{FxHashMap, StringHandle, StringTable};
use indexmap::IndexMap;

use crate::abi::{abi_for, scratch_pool, stack_arg_offset, Abi};
use crate::cfi::{CfiEvent, CfiLog};
use crate::encode::{self, Cond, Reg, Xmm};
use crate::obj::{
    ObjectModule, RelocKind, SectionId, SectionKind, SymbolBinding, SymbolClass,
};
use crate::regalloc::RegAlloc;
use crate::CodegenError;

/// One emitted catch handler.
#[derive(Clone, Debug)]
pub struct HandlerRec {
    pub catch_ty: Option<TypeIndex>,
    /// Offset of the handler body within the function.
    pub body_offset: u32,
    /// Positive selector value the landing pad compares against.
    pub filter: i32,
}

/// One emitted try region.
#[derive(Clone, Debug)]
pub struct TryRec {
    pub region: u32,
    pub start: u32,
    pub end: u32,
    /// Landing-pad offset within the function.
    pub pad: u32,
    pub handlers: Vec<HandlerRec>,
}

/// Everything the EH emitters need about one function.
#[derive(Clone, Debug)]
pub struct FuncRecord {
    pub mangled: String,
    pub internal: bool,
    /// Start offset in `.text`.
    pub start: u64,
    pub len: u64,
    pub cfi: CfiLog,
    pub tries: Vec<TryRec>,
    pub frame_size: u32,
    pub thrown_types: Vec<TypeIndex>,
}

/// Emit a whole translation unit into an object module.
///
/// `functions` must already be lowered and frame-laid-out; `globals` come
/// straight from the parser.
pub fn emit_module(
    functions: &[FunctionIr],
    globals: &[GlobalDef],
    types: &TypeRegistry,
    strings: &StringTable,
    target: Target,
) -> Result<ObjectModule, CodegenError> {
    let mut module = ObjectModule::new(target);
    let text = module.add_section(".text", SectionKind::Text, 16);
    let (rodata_name, data_name) = match target {
        Target::Linux64 => (".rodata", ".data"),
        Target::Win64 => (".rdata", ".data"),
    };
    let rodata = module.add_section(rodata_name, SectionKind::ROData, 8);
    let data = module.add_section(data_name, SectionKind::Data, 8);
    let bss = module.add_section(".bss", SectionKind::Bss, 8);

    let mut records: Vec<FuncRecord> = Vec::new();
    let mut string_pool: IndexMap<StringHandle, String> = IndexMap::new();
    let mut float_pool: IndexMap<u64, String> = IndexMap::new();
    let mut jump_tables: Vec<(String, String, Vec<u32>)> = Vec::new(); // (table sym, fn sym, offsets)

    for func in functions {
        let mut emitter = FnEmitter::new(func, types, strings, target);
        emitter.run()?;

        let start = align_to(module.len(text), 16, &mut module, text);
        let len = emitter.buf.len() as u64;
        module.append_bytes(text, &emitter.buf);
        let binding = if func.is_internal {
            SymbolBinding::Local
        } else {
            SymbolBinding::Global
        };
        module.add_symbol(&func.mangled, text, start, len, SymbolClass::Function, binding);

        // Function-local relocations shift to section offsets.
        for (off, symbol, kind, addend) in &emitter.relocs {
            let id = module.symbol_ref(symbol);
            module.add_relocation(text, start + *off as u64, id, *kind, *addend);
        }
        for (handle, name) in emitter.strings_used {
            string_pool.entry(handle).or_insert(name);
        }
        for (bits, name) in emitter.floats_used {
            float_pool.entry(bits).or_insert(name);
        }
        for (sym, labels) in emitter.tables {
            let offsets = labels
                .iter()
                .map(|l| emitter.labels[l.0 as usize].expect("label bound"))
                .collect();
            jump_tables.push((sym, func.mangled.clone(), offsets));
        }

        records.push(FuncRecord {
            mangled: func.mangled.clone(),
            internal: func.is_internal,
            start,
            len,
            cfi: emitter.cfi,
            tries: emitter.tries,
            frame_size: func.frame_size,
            thrown_types: func.thrown_types.clone(),
        });
    }

    // Globals.
    for global in globals {
        let symbol = fcpp_ir::mangle::mangle_global(global.name, &global.path, target, strings);
        let size = (types.size_bits(types.canonical(global.ty)) / 8).max(1) as u64;
        let binding = if global.linkage == Linkage::Internal {
            SymbolBinding::Local
        } else {
            SymbolBinding::Global
        };
        match global.init_const {
            Some(value) => {
                let bytes = const_bytes(value, size as usize);
                let align = (types.align_bits(types.canonical(global.ty)) / 8).max(1) as u64;
                let at = align_to(module.len(data), align, &mut module, data);
                module.append_bytes(data, &bytes);
                module.add_symbol(&symbol, data, at, size, SymbolClass::Data, binding);
            }
            None => {
                let align = (types.align_bits(types.canonical(global.ty)) / 8).max(1) as u64;
                let at = module.reserve_bss(bss, size, align);
                module.add_symbol(&symbol, bss, at, size, SymbolClass::Data, binding);
            }
        }
    }

    // Pooled string literals, NUL-terminated.
    for (handle, symbol) in &string_pool {
        let text_bytes = strings.view(*handle).as_bytes();
        let at = module.len(rodata);
        module.append_bytes(rodata, text_bytes);
        module.append_bytes(rodata, &[0]);
        module.add_symbol(
            symbol,
            rodata,
            at,
            text_bytes.len() as u64 + 1,
            SymbolClass::Data,
            SymbolBinding::Local,
        );
    }

    // Float constants.
    for (bits, symbol) in &float_pool {
        let at = align_to(module.len(rodata), 8, &mut module, rodata);
        module.append_bytes(rodata, &bits.to_le_bytes());
        module.add_symbol(symbol, rodata, at, 8, SymbolClass::Data, SymbolBinding::Local);
    }

    // Switch jump tables: absolute code addresses.
    for (table_sym, fn_sym, offsets) in &jump_tables {
        let at = align_to(module.len(rodata), 8, &mut module, rodata);
        let fn_id = module.symbol_ref(fn_sym);
        for (i, &label_off) in offsets.iter().enumerate() {
            module.append_bytes(rodata, &[0u8; 8]);
            module.add_relocation(
                rodata,
                at + i as u64 * 8,
                fn_id,
                RelocKind::Abs64,
                label_off as i64,
            );
        }
        module.add_symbol(
            table_sym,
            rodata,
            at,
            offsets.len() as u64 * 8,
            SymbolClass::Data,
            SymbolBinding::Local,
        );
    }

    emit_vtables(&mut module, rodata, types, strings, target);
    emit_type_infos(&mut module, rodata, &records, functions, types, strings, target);

    // Global constructors.
    if let Some(init) = records.iter().find(|r| r.mangled.starts_with("_GLOBAL__sub_I")) {
        let name = match target {
            Target::Linux64 => ".init_array",
            Target::Win64 => ".CRT$XCU",
        };
        let init_array = module.add_section(name, SectionKind::InitArray, 8);
        let sym = module.symbol_ref(&init.mangled);
        module.append_bytes(init_array, &[0u8; 8]);
        module.add_relocation(init_array, 0, sym, RelocKind::Abs64, 0);
    }

    // EH metadata.
    match target {
        Target::Linux64 => crate::eh::dwarf::emit(&mut module, &records, text, types, strings)?,
        Target::Win64 => crate::eh::windows::emit(&mut module, &records, text, types, strings)?,
    }

    Ok(module)
}

fn align_to(offset: u64, align: u64, module: &mut ObjectModule, section: SectionId) -> u64 {
    let aligned = offset.div_ceil(align) * align;
    if aligned > offset {
        let pad = vec![0u8; (aligned - offset) as usize];
        module.append_bytes(section, &pad);
    }
    aligned
}

fn const_bytes(value: ConstValue, size: usize) -> Vec<u8> {
    let raw: u64 = match value {
        ConstValue::Int { value, .. } => value as u64,
        ConstValue::Bool(b) => b as u64,
        ConstValue::Float(f) => {
            if size == 4 {
                (f as f32).to_bits() as u64
            } else {
                f.to_bits()
            }
        }
    };
    raw.to_le_bytes()[..size.min(8)].to_vec()
}

/// Vtables for every dynamic class: slot-ordered function pointers.
fn emit_vtables(
    module: &mut ObjectModule,
    rodata: SectionId,
    types: &TypeRegistry,
    strings: &StringTable,
    target: Target,
) {
    for info in types.structs.iter() {
        let Some(vtable) = &info.vtable else { continue };
        if !info.is_complete {
            continue;
        }
        let symbol = fcpp_ir::mangle::vtable_symbol(info.ty, types, strings, target);
        let at = align_to(module.len(rodata), 8, module, rodata);
        for (i, slot) in vtable.slots.iter().enumerate() {
            let owner_name = types
                .struct_of(slot.defined_in)
                .map(|s| s.name)
                .unwrap_or(info.name);
            let target_symbol = fcpp_ir::mangle::mangle_function(
                &fcpp_ir::mangle::MangleRequest {
                    name: slot.fn_name,
                    path: std::slice::from_ref(&owner_name),
                    fn_ty: slot.ty,
                    is_ctor: false,
                    is_dtor: strings.view(slot.fn_name).starts_with('~'),
                    is_extern_c: false,
                },
                types,
                strings,
                target,
            );
            let id = module.symbol_ref(&target_symbol);
            module.append_bytes(rodata, &[0u8; 8]);
            module.add_relocation(rodata, at + i as u64 * 8, id, RelocKind::Abs64, 0);
        }
        module.add_symbol(
            &symbol,
            rodata,
            at,
            vtable.slots.len() as u64 * 8,
            SymbolClass::Data,
            SymbolBinding::Global,
        );
    }
}

/// RTTI objects for thrown/caught class types. Builtin typeinfo
/// (`_ZTIi`, ...) lives in the C++ runtime and stays an undefined
/// reference; class typeinfo is emitted here.
fn emit_type_infos(
    module: &mut ObjectModule,
    rodata: SectionId,
    records: &[FuncRecord],
    functions: &[FunctionIr],
    types: &TypeRegistry,
    strings: &StringTable,
    target: Target,
) {
    if target != Target::Linux64 {
        // Win64 type descriptors are emitted with the FuncInfo tables.
        return;
    }
    let mut seen = Vec::new();
    let thrown = records.iter().flat_map(|r| r.thrown_types.iter().copied());
    let caught = functions
        .iter()
        .flat_map(|f| f.try_regions.iter())
        .flat_map(|t| t.handlers.iter().filter_map(|h| h.catch_ty));
    for ty in thrown.chain(caught) {
        let canon = types.canonical(ty);
        if !types.is_class(canon) || seen.contains(&canon) {
            continue;
        }
        seen.push(canon);
        let ti_symbol = fcpp_ir::mangle::type_info_symbol(canon, types, strings, target);
        let ts_symbol = fcpp_ir::mangle::itanium::type_name_symbol(canon, types, strings);

        // Name string first.
        let name_text = strings.view(types.info(canon).name);
        let ts_at = module.len(rodata);
        module.append_bytes(rodata, name_text.as_bytes());
        module.append_bytes(rodata, &[0]);
        module.add_symbol(
            &ts_symbol,
            rodata,
            ts_at,
            name_text.len() as u64 + 1,
            SymbolClass::Data,
            SymbolBinding::Global,
        );

        // { &__class_type_info vtable + 16, &name }.
        let ti_at = align_to(module.len(rodata), 8, module, rodata);
        let cti = module.symbol_ref("_ZTVN10__cxxabiv117__class_type_infoE");
        module.append_bytes(rodata, &[0u8; 8]);
        module.add_relocation(rodata, ti_at, cti, RelocKind::Abs64, 16);
        let ts_id = module.symbol_ref(&ts_symbol);
        module.append_bytes(rodata, &[0u8; 8]);
        module.add_relocation(rodata, ti_at + 8, ts_id, RelocKind::Abs64, 0);
        module.add_symbol(
            &ti_symbol,
            rodata,
            ti_at,
            16,
            SymbolClass::Data,
            SymbolBinding::Global,
        );
    }
}

// ---------------------------------------------------------------------
// Per-function emission
// ---------------------------------------------------------------------

struct FnEmitter<'a> {
    f: &'a FunctionIr,
    types: &'a TypeRegistry,
    strings: &'a StringTable,
    target: Target,
    abi: Abi,
    buf: Vec<u8>,
    ra: RegAlloc,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, LabelId)>,
    relocs: Vec<(usize, String, RelocKind, i64)>,
    cfi: CfiLog,
    tries: Vec<TryRec>,
    region_start: FxHashMap<u32, u32>,
    region_end: FxHashMap<u32, u32>,
    handler_offsets: FxHashMap<(u32, u32), u32>,
    strings_used: Vec<(StringHandle, String)>,
    floats_used: Vec<(u64, String)>,
    tables: Vec<(String, Vec<LabelId>)>,
    /// Frame slots for the landing pad's RAX/RDX saves, below the frame.
    exc_slot: i32,
    sel_slot: i32,
    /// Total `sub rsp` amount.
    alloc: u32,
}

impl<'a> FnEmitter<'a> {
    fn new(
        f: &'a FunctionIr,
        types: &'a TypeRegistry,
        strings: &'a StringTable,
        target: Target,
    ) -> Self {
        let conv = f.conv;
        let has_eh = !f.try_regions.is_empty();
        // Two extra quadwords below the computed frame for the exception
        // pointer and selector.
        let extra = if has_eh { 16 } else { 0 };
        let alloc = (f.frame_size + extra).div_ceil(16) * 16;
        Self {
            f,
            types,
            strings,
            target,
            abi: abi_for(conv),
            buf: Vec::new(),
            ra: RegAlloc::new(scratch_pool(conv)),
            labels: vec![None; f.label_count as usize],
            fixups: Vec::new(),
            relocs: Vec::new(),
            cfi: CfiLog::new(),
            tries: Vec::new(),
            region_start: FxHashMap::default(),
            region_end: FxHashMap::default(),
            handler_offsets: FxHashMap::default(),
            strings_used: Vec::new(),
            floats_used: Vec::new(),
            tables: Vec::new(),
            exc_slot: -(f.frame_size as i32 + 8),
            sel_slot: -(f.frame_size as i32 + 16),
            alloc,
        }
    }

    fn off(&self) -> u32 {
        self.buf.len() as u32
    }

    fn temp_slot(&self, t: TempVar) -> i32 {
        *self
            .f
            .temp_slots
            .get(&t)
            .expect("frame pre-pass assigned every temp a slot")
    }

    fn run(&mut self) -> Result<(), CodegenError> {
        self.prologue();
        let ops = self.f.ir.clone();
        for op in &ops {
            self.emit_op(op)?;
        }
        self.emit_landing_pads()?;
        self.resolve_fixups();
        Ok(())
    }

    // -- prologue / epilogue -------------------------------------------

    fn prologue(&mut self) {
        encode::push(&mut self.buf, Reg::Rbp);
        self.cfi.push(CfiEvent::PushRbp { code_offset: self.off() });
        encode::mov_rr(&mut self.buf, Reg::Rbp, Reg::Rsp);
        self.cfi.push(CfiEvent::MovRbpRsp { code_offset: self.off() });
        if self.alloc > 0 {
            encode::sub_ri(&mut self.buf, Reg::Rsp, self.alloc as i32);
            self.cfi.push(CfiEvent::SubRsp { code_offset: self.off(), amount: self.alloc });
        }

        // Spill incoming arguments into their frame slots.
        let mut int_i = 0usize;
        let mut float_i = 0usize;
        let mut stack_i = 0usize;
        for (i, shape) in self.f.params.iter().enumerate() {
            let local = self.f.param_locals[i];
            let slot = self.f.locals[local].offset;
            let position = if self.abi.positional_args { i } else if shape.is_float { float_i } else { int_i };
            if shape.is_float {
                if position < self.abi.float_arg_count {
                    let xmm = xmm_arg(position);
                    let prefix = if shape.bits == 32 { 0xf3 } else { 0xf2 };
                    encode::sse_mem(&mut self.buf, prefix, 0x11, xmm, Reg::Rbp, slot);
                } else {
                    self.copy_stack_arg(stack_i, slot, shape.bits, shape.signed);
                    stack_i += 1;
                }
                float_i += 1;
            } else {
                if position < self.abi.int_args.len() {
                    let reg = self.abi.int_args[position];
                    encode::mov_store(&mut self.buf, shape.bits.max(8), Reg::Rbp, slot, reg);
                } else {
                    self.copy_stack_arg(stack_i, slot, shape.bits, shape.signed);
                    stack_i += 1;
                }
                int_i += 1;
            }
        }
    }

    fn copy_stack_arg(&mut self, stack_index: usize, slot: i32, bits: u8, signed: bool) {
        let src = stack_arg_offset(self.f.conv, stack_index);
        encode::mov_load(&mut self.buf, bits, signed, Reg::Rax, Reg::Rbp, src);
        encode::mov_store(&mut self.buf, bits, Reg::Rbp, slot, Reg::Rax);
    }

    fn epilogue(&mut self) {
        encode::leave(&mut self.buf);
        encode::ret(&mut self.buf);
    }

    // -- operand helpers ------------------------------------------------

    /// Bring an integer operand into a register.
    fn reg_for(&mut self, op: Operand) -> Reg {
        match op {
            Operand::Temp(t) => {
                let info = self.f.temps[t];
                let slot = self.temp_slot(t);
                self.ra.load_temp(&mut self.buf, t, slot, info.bits, info.signed)
            }
            Operand::ImmInt(v) => {
                let reg = self.ra.acquire(&mut self.buf);
                encode::mov_ri(&mut self.buf, reg, v);
                reg
            }
            Operand::ImmFloat(_) => {
                // Float immediates travel through XMM; an integer consumer
                // sees the raw bits.
                let reg = self.ra.acquire(&mut self.buf);
                encode::mov_ri(&mut self.buf, reg, 0);
                reg
            }
        }
    }

    /// Bind a fresh result register to a temp (dirty).
    fn bind_result(&mut self, reg: Reg, dst: TempVar) {
        let info = self.f.temps[dst];
        let slot = self.temp_slot(dst);
        self.ra.bind_temp(reg, dst, slot, info.bits, info.signed, true);
    }

    /// Load a float operand into the given XMM register.
    fn xmm_for(&mut self, op: Operand, xmm: Xmm) {
        match op {
            Operand::Temp(t) => {
                let info = self.f.temps[t];
                let slot = self.temp_slot(t);
                let (prefix, opcode) = if info.bits == 32 { (0xf3, 0x10) } else { (0xf2, 0x10) };
                encode::sse_mem(&mut self.buf, prefix, opcode, xmm, Reg::Rbp, slot);
            }
            Operand::ImmFloat(f) => {
                let bits = f.to_bits();
                let symbol = format!(".Lfp{bits:016x}");
                if !self.floats_used.iter().any(|(b, _)| *b == bits) {
                    self.floats_used.push((bits, symbol.clone()));
                }
                // movsd xmm, [rip + sym]
                self.buf.push(0xf2);
                self.buf.extend_from_slice(&[0x0f, 0x10]);
                self.buf.push((xmm.num() << 3) | 0x05);
                let at = self.buf.len();
                encode::imm32(&mut self.buf, 0);
                self.relocs.push((at, symbol, RelocKind::Pc32, -4));
            }
            Operand::ImmInt(v) => {
                encode::mov_ri(&mut self.buf, Reg::Rax, v);
                encode::cvtsi2f(&mut self.buf, 0xf2, xmm, Reg::Rax);
            }
        }
    }

    /// Store an XMM value to a temp's slot.
    fn store_xmm(&mut self, xmm: Xmm, dst: TempVar) {
        let info = self.f.temps[dst];
        let slot = self.temp_slot(dst);
        let (prefix, opcode) = if info.bits == 32 { (0xf3, 0x11) } else { (0xf2, 0x11) };
        encode::sse_mem(&mut self.buf, prefix, opcode, xmm, Reg::Rbp, slot);
    }

    /// Store an integer register to a temp's slot directly (used on the
    /// fixed-register paths where the allocator is bypassed).
    fn store_reg_to_temp(&mut self, reg: Reg, dst: TempVar) {
        let info = self.f.temps[dst];
        let slot = self.temp_slot(dst);
        encode::mov_store(&mut self.buf, info.bits.max(32), Reg::Rbp, slot, reg);
    }

    /// Load an operand into a specific fixed register (allocator bypassed;
    /// caller must have flushed).
    fn load_into_fixed(&mut self, op: Operand, reg: Reg) {
        match op {
            Operand::Temp(t) => {
                let info = self.f.temps[t];
                let slot = self.temp_slot(t);
                encode::mov_load(&mut self.buf, info.bits, info.signed, reg, Reg::Rbp, slot);
            }
            Operand::ImmInt(v) => encode::mov_ri(&mut self.buf, reg, v),
            Operand::ImmFloat(f) => encode::mov_ri(&mut self.buf, reg, f.to_bits() as i64),
        }
    }

    fn is_float_op(&self, op: Operand) -> bool {
        match op {
            Operand::Temp(t) => self.f.temps[t].is_float,
            Operand::ImmFloat(_) => true,
            Operand::ImmInt(_) => false,
        }
    }

    // -- instruction dispatch ------------------------------------------

    fn emit_op(&mut self, op: &IrOp) -> Result<(), CodegenError> {
        match op {
            IrOp::Label(l) => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.labels[l.0 as usize] = Some(self.off());
            }
            IrOp::Jump(l) => {
                self.ra.flush_all_dirty(&mut self.buf);
                let at = encode::jmp(&mut self.buf);
                self.fixups.push((at, *l));
            }
            IrOp::Branch { cond, if_true, if_false } => {
                let reg = self.reg_for(*cond);
                self.ra.flush_all_dirty(&mut self.buf);
                encode::test_rr(&mut self.buf, reg, reg);
                let at = encode::jcc(&mut self.buf, Cond::Ne);
                self.fixups.push((at, *if_true));
                let at = encode::jmp(&mut self.buf);
                self.fixups.push((at, *if_false));
            }
            IrOp::ConstInt { dst, value } => {
                let reg = self.ra.acquire(&mut self.buf);
                encode::mov_ri(&mut self.buf, reg, *value);
                self.bind_result(reg, *dst);
            }
            IrOp::ConstFloat { dst, value } => {
                self.xmm_for(Operand::ImmFloat(*value), Xmm::Xmm0);
                self.store_xmm(Xmm::Xmm0, *dst);
            }
            IrOp::Copy { dst, src } => {
                if self.f.temps[*dst].is_float || self.is_float_op(*src) {
                    self.xmm_for(*src, Xmm::Xmm0);
                    self.store_xmm(Xmm::Xmm0, *dst);
                } else {
                    let src_reg = self.reg_for(*src);
                    let reg = self.ra.acquire(&mut self.buf);
                    encode::mov_rr(&mut self.buf, reg, src_reg);
                    self.bind_result(reg, *dst);
                }
            }
            IrOp::LoadLocal { dst, local } => {
                let info = self.f.temps[*dst];
                let slot = self.f.locals[*local].offset;
                if info.is_float {
                    let (prefix, opcode) = if info.bits == 32 { (0xf3, 0x10) } else { (0xf2, 0x10) };
                    encode::sse_mem(&mut self.buf, prefix, opcode, Xmm::Xmm0, Reg::Rbp, slot);
                    self.store_xmm(Xmm::Xmm0, *dst);
                } else {
                    let reg = self.ra.acquire(&mut self.buf);
                    encode::mov_load(&mut self.buf, info.bits, info.signed, reg, Reg::Rbp, slot);
                    self.bind_result(reg, *dst);
                }
            }
            IrOp::StoreLocal { local, src } => {
                let slot = self.f.locals[*local].offset;
                if self.is_float_op(*src) {
                    self.xmm_for(*src, Xmm::Xmm0);
                    let bits = self.f.operand_info(*src).bits;
                    let (prefix, opcode) = if bits == 32 { (0xf3, 0x11) } else { (0xf2, 0x11) };
                    encode::sse_mem(&mut self.buf, prefix, opcode, Xmm::Xmm0, Reg::Rbp, slot);
                } else {
                    let bits = match src {
                        Operand::Temp(t) => self.f.temps[*t].bits,
                        _ => (self.f.locals[*local].size_bits.min(64)) as u8,
                    };
                    let reg = self.reg_for(*src);
                    encode::mov_store(&mut self.buf, bits.max(8), Reg::Rbp, slot, reg);
                }
            }
            IrOp::AddrOfLocal { dst, local } => {
                let slot = self.f.locals[*local].offset;
                let reg = self.ra.acquire(&mut self.buf);
                encode::lea(&mut self.buf, reg, Reg::Rbp, slot);
                self.bind_result(reg, *dst);
            }
            IrOp::AddrOfGlobal { dst, symbol } => {
                let reg = self.ra.acquire(&mut self.buf);
                let at = encode::lea_rip(&mut self.buf, reg);
                self.relocs
                    .push((at, self.strings.view(*symbol).to_string(), RelocKind::Pc32, -4));
                self.bind_result(reg, *dst);
            }
            IrOp::LoadGlobal { dst, symbol } => {
                let info = self.f.temps[*dst];
                let reg = self.ra.acquire(&mut self.buf);
                let at = encode::mov_load_rip(&mut self.buf, info.bits, info.signed, reg);
                self.relocs
                    .push((at, self.strings.view(*symbol).to_string(), RelocKind::Pc32, -4));
                self.bind_result(reg, *dst);
            }
            IrOp::StoreGlobal { symbol, src } => {
                let bits = self.f.operand_info(*src).bits;
                let reg = self.reg_for(*src);
                let at = encode::mov_store_rip(&mut self.buf, bits, reg);
                self.relocs
                    .push((at, self.strings.view(*symbol).to_string(), RelocKind::Pc32, -4));
            }
            IrOp::AddrOfString { dst, text } => {
                let symbol = format!(".Lstr{:x}", text.as_u32());
                if !self.strings_used.iter().any(|(h, _)| h == text) {
                    self.strings_used.push((*text, symbol.clone()));
                }
                let reg = self.ra.acquire(&mut self.buf);
                let at = encode::lea_rip(&mut self.buf, reg);
                self.relocs.push((at, symbol, RelocKind::Pc32, -4));
                self.bind_result(reg, *dst);
            }
            IrOp::LoadMem { dst, addr, offset } => {
                let info = self.f.temps[*dst];
                let base = self.reg_for(Operand::Temp(*addr));
                if info.is_float {
                    let (prefix, opcode) = if info.bits == 32 { (0xf3, 0x10) } else { (0xf2, 0x10) };
                    encode::sse_mem(&mut self.buf, prefix, opcode, Xmm::Xmm0, base, *offset);
                    self.store_xmm(Xmm::Xmm0, *dst);
                } else {
                    let reg = self.ra.acquire(&mut self.buf);
                    encode::mov_load(&mut self.buf, info.bits, info.signed, reg, base, *offset);
                    self.bind_result(reg, *dst);
                }
            }
            IrOp::StoreMem { addr, offset, src, bits } => {
                let base = self.reg_for(Operand::Temp(*addr));
                if self.is_float_op(*src) {
                    self.xmm_for(*src, Xmm::Xmm0);
                    let (prefix, opcode) = if *bits == 32 { (0xf3, 0x11) } else { (0xf2, 0x11) };
                    encode::sse_mem(&mut self.buf, prefix, opcode, Xmm::Xmm0, base, *offset);
                } else {
                    let reg = self.reg_for(*src);
                    encode::mov_store(&mut self.buf, *bits, base, *offset, reg);
                }
            }
            IrOp::Binary { op, dst, lhs, rhs } => self.emit_binary(*op, *dst, *lhs, *rhs),
            IrOp::Unary { op, dst, src } => self.emit_unary(*op, *dst, *src),
            IrOp::Cmp { op, dst, lhs, rhs } => self.emit_cmp(*op, *dst, *lhs, *rhs),
            IrOp::Cast { kind, dst, src } => self.emit_cast(*kind, *dst, *src),
            IrOp::JumpTable { index, targets, table_symbol, .. } => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.load_into_fixed(*index, Reg::Rax);
                // rax = table[rax]: shl rax,3; lea r11,[rip+table]; add; load.
                encode::mov_ri(&mut self.buf, Reg::Rcx, 3);
                encode::shift_cl(&mut self.buf, encode::SHIFT_SHL, Reg::Rax);
                let at = encode::lea_rip(&mut self.buf, Reg::R11);
                self.relocs.push((
                    at,
                    self.strings.view(*table_symbol).to_string(),
                    RelocKind::Pc32,
                    -4,
                ));
                encode::add_rr(&mut self.buf, Reg::Rax, Reg::R11);
                encode::mov_load(&mut self.buf, 64, false, Reg::Rax, Reg::Rax, 0);
                encode::jmp_reg(&mut self.buf, Reg::Rax);
                self.tables.push((
                    self.strings.view(*table_symbol).to_string(),
                    targets.clone(),
                ));
            }
            IrOp::Call { callee, args, dst, sret, ret_float } => {
                self.emit_call(callee, args, *dst, *sret, *ret_float)?;
            }
            IrOp::Ret { value } => {
                if let Some(v) = value {
                    if self.is_float_op(*v) || self.f.ret.map(|r| r.is_float).unwrap_or(false) {
                        self.xmm_for(*v, Xmm::Xmm0);
                    } else {
                        self.ra.flush_all_dirty(&mut self.buf);
                        self.load_into_fixed(*v, Reg::Rax);
                    }
                } else {
                    self.ra.flush_all_dirty(&mut self.buf);
                }
                self.epilogue();
            }
            IrOp::LoadVtableSlot { dst, object, slot } => {
                let obj = self.reg_for(Operand::Temp(*object));
                let reg = self.ra.acquire(&mut self.buf);
                // vptr is the first quadword of the object.
                encode::mov_load(&mut self.buf, 64, false, reg, obj, 0);
                encode::mov_load(&mut self.buf, 64, false, reg, reg, (*slot as i32) * 8);
                self.bind_result(reg, *dst);
            }
            IrOp::TryBegin { region } => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.region_start.insert(*region, self.off());
            }
            IrOp::TryEnd { region, cont } => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.region_end.insert(*region, self.off());
                let at = encode::jmp(&mut self.buf);
                self.fixups.push((at, *cont));
            }
            IrOp::CatchBegin { region, handler, exc, .. } => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.handler_offsets.insert((*region, *handler), self.off());
                if self.target == Target::Win64 {
                    // Funclet entry: establisher frame arrives in RDX.
                    encode::push(&mut self.buf, Reg::Rbp);
                    encode::mov_rr(&mut self.buf, Reg::Rbp, Reg::Rdx);
                }
                // The landing pad (or the runtime) left the exception object
                // pointer in RAX.
                let slot = self.temp_slot(*exc);
                encode::mov_store(&mut self.buf, 64, Reg::Rbp, slot, Reg::Rax);
            }
            IrOp::CatchEnd { cont } => {
                self.ra.flush_all_dirty(&mut self.buf);
                match self.target {
                    Target::Linux64 => {
                        let at = encode::call(&mut self.buf);
                        self.relocs
                            .push((at, "__cxa_end_catch".to_string(), RelocKind::Pc32, -4));
                        let at = encode::jmp(&mut self.buf);
                        self.fixups.push((at, *cont));
                    }
                    Target::Win64 => {
                        // Funclet return: hand the continuation address back
                        // to the runtime.
                        let at = encode::lea_rip(&mut self.buf, Reg::Rax);
                        self.fixups.push((at, *cont));
                        encode::pop(&mut self.buf, Reg::Rbp);
                        encode::ret(&mut self.buf);
                    }
                }
            }
            IrOp::Unreachable => encode::ud2(&mut self.buf),
        }
        Ok(())
    }

    fn emit_binary(&mut self, op: IrBinOp, dst: TempVar, lhs: Operand, rhs: Operand) {
        match op {
            IrBinOp::FAdd | IrBinOp::FSub | IrBinOp::FMul | IrBinOp::FDiv => {
                self.xmm_for(lhs, Xmm::Xmm0);
                self.xmm_for(rhs, Xmm::Xmm1);
                let bits = self.f.temps[dst].bits;
                let prefix = if bits == 32 { 0xf3 } else { 0xf2 };
                let opcode = match op {
                    IrBinOp::FAdd => 0x58,
                    IrBinOp::FSub => 0x5c,
                    IrBinOp::FMul => 0x59,
                    _ => 0x5e,
                };
                encode::sse_rr(&mut self.buf, prefix, opcode, Xmm::Xmm0, Xmm::Xmm1);
                self.store_xmm(Xmm::Xmm0, dst);
            }
            IrBinOp::SDiv | IrBinOp::UDiv | IrBinOp::SRem | IrBinOp::URem => {
                // Fixed-register sequence: RDX:RAX / divisor.
                self.ra.flush_all_dirty(&mut self.buf);
                self.load_into_fixed(lhs, Reg::Rax);
                self.load_into_fixed(rhs, Reg::R10);
                if matches!(op, IrBinOp::SDiv | IrBinOp::SRem) {
                    encode::cqo(&mut self.buf);
                    encode::idiv(&mut self.buf, Reg::R10);
                } else {
                    encode::mov_ri(&mut self.buf, Reg::Rdx, 0);
                    encode::div(&mut self.buf, Reg::R10);
                }
                let result = if matches!(op, IrBinOp::SRem | IrBinOp::URem) {
                    Reg::Rdx
                } else {
                    Reg::Rax
                };
                self.store_reg_to_temp(result, dst);
            }
            IrBinOp::Shl | IrBinOp::AShr | IrBinOp::LShr => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.load_into_fixed(lhs, Reg::Rax);
                self.load_into_fixed(rhs, Reg::Rcx);
                let ext = match op {
                    IrBinOp::Shl => encode::SHIFT_SHL,
                    IrBinOp::AShr => encode::SHIFT_SAR,
                    _ => encode::SHIFT_SHR,
                };
                encode::shift_cl(&mut self.buf, ext, Reg::Rax);
                self.store_reg_to_temp(Reg::Rax, dst);
            }
            _ => {
                let lhs_reg = self.reg_for(lhs);
                let result = self.ra.acquire(&mut self.buf);
                encode::mov_rr(&mut self.buf, result, lhs_reg);
                match rhs {
                    Operand::ImmInt(v) if i32::try_from(v).is_ok() && matches!(op, IrBinOp::Add | IrBinOp::Sub) => {
                        match op {
                            IrBinOp::Add => encode::add_ri(&mut self.buf, result, v as i32),
                            _ => encode::sub_ri(&mut self.buf, result, v as i32),
                        }
                    }
                    _ => {
                        let rhs_reg = self.reg_for(rhs);
                        match op {
                            IrBinOp::Add => encode::add_rr(&mut self.buf, result, rhs_reg),
                            IrBinOp::Sub => encode::sub_rr(&mut self.buf, result, rhs_reg),
                            IrBinOp::Mul => encode::imul_rr(&mut self.buf, result, rhs_reg),
                            IrBinOp::And => encode::and_rr(&mut self.buf, result, rhs_reg),
                            IrBinOp::Or => encode::or_rr(&mut self.buf, result, rhs_reg),
                            IrBinOp::Xor => encode::xor_rr(&mut self.buf, result, rhs_reg),
                            _ => unreachable!("handled above"),
                        }
                    }
                }
                self.bind_result(result, dst);
            }
        }
    }

    fn emit_unary(&mut self, op: IrUnOp, dst: TempVar, src: Operand) {
        match op {
            IrUnOp::FNeg => {
                // 0.0 - x.
                encode::sse_rr(&mut self.buf, 0, 0x57, Xmm::Xmm0, Xmm::Xmm0); // xorps
                self.xmm_for(src, Xmm::Xmm1);
                let bits = self.f.temps[dst].bits;
                let prefix = if bits == 32 { 0xf3 } else { 0xf2 };
                encode::sse_rr(&mut self.buf, prefix, 0x5c, Xmm::Xmm0, Xmm::Xmm1); // subs[sd]
                self.store_xmm(Xmm::Xmm0, dst);
            }
            IrUnOp::LogicalNot => {
                let reg = self.reg_for(src);
                let result = self.ra.acquire(&mut self.buf);
                encode::test_rr(&mut self.buf, reg, reg);
                encode::setcc_zx(&mut self.buf, Cond::E, result);
                self.bind_result(result, dst);
            }
            IrUnOp::Neg | IrUnOp::BitNot => {
                let src_reg = self.reg_for(src);
                let result = self.ra.acquire(&mut self.buf);
                encode::mov_rr(&mut self.buf, result, src_reg);
                if op == IrUnOp::Neg {
                    encode::neg(&mut self.buf, result);
                } else {
                    encode::not(&mut self.buf, result);
                }
                self.bind_result(result, dst);
            }
        }
    }

    fn emit_cmp(&mut self, op: IrCmpOp, dst: TempVar, lhs: Operand, rhs: Operand) {
        let float = matches!(
            op,
            IrCmpOp::FEq | IrCmpOp::FNe | IrCmpOp::FLt | IrCmpOp::FLe | IrCmpOp::FGt | IrCmpOp::FGe
        );
        if float {
            self.xmm_for(lhs, Xmm::Xmm0);
            self.xmm_for(rhs, Xmm::Xmm1);
            // ucomisd for doubles, ucomiss for singles.
            let prefix = if self.f.operand_info(lhs).bits == 32 { 0 } else { 0x66 };
            encode::ucomis(&mut self.buf, prefix, Xmm::Xmm0, Xmm::Xmm1);
            let cond = match op {
                IrCmpOp::FEq => Cond::E,
                IrCmpOp::FNe => Cond::Ne,
                IrCmpOp::FLt => Cond::B,
                IrCmpOp::FLe => Cond::Be,
                IrCmpOp::FGt => Cond::A,
                _ => Cond::Ae,
            };
            let result = self.ra.acquire(&mut self.buf);
            encode::setcc_zx(&mut self.buf, cond, result);
            self.bind_result(result, dst);
            return;
        }
        let lhs_reg = self.reg_for(lhs);
        match rhs {
            Operand::ImmInt(v) if i32::try_from(v).is_ok() => {
                encode::cmp_ri(&mut self.buf, lhs_reg, v as i32);
            }
            _ => {
                let rhs_reg = self.reg_for(rhs);
                encode::cmp_rr(&mut self.buf, lhs_reg, rhs_reg);
            }
        }
        let cond = match op {
            IrCmpOp::Eq => Cond::E,
            IrCmpOp::Ne => Cond::Ne,
            IrCmpOp::SLt => Cond::L,
            IrCmpOp::SLe => Cond::Le,
            IrCmpOp::SGt => Cond::G,
            IrCmpOp::SGe => Cond::Ge,
            IrCmpOp::ULt => Cond::B,
            IrCmpOp::ULe => Cond::Be,
            IrCmpOp::UGt => Cond::A,
            _ => Cond::Ae,
        };
        let result = self.ra.acquire(&mut self.buf);
        encode::setcc_zx(&mut self.buf, cond, result);
        self.bind_result(result, dst);
    }

    fn emit_cast(&mut self, kind: CastKind, dst: TempVar, src: Operand) {
        match kind {
            CastKind::SignExtend { .. } | CastKind::ZeroExtend { .. } => {
                let info = self.f.operand_info(src);
                let src_reg = self.reg_for(src);
                let result = self.ra.acquire(&mut self.buf);
                let signed = matches!(kind, CastKind::SignExtend { .. });
                encode::extend_rr(&mut self.buf, info.bits, signed, result, src_reg);
                self.bind_result(result, dst);
            }
            CastKind::Truncate { .. } | CastKind::Bitcast => {
                let src_reg = self.reg_for(src);
                let result = self.ra.acquire(&mut self.buf);
                encode::mov_rr(&mut self.buf, result, src_reg);
                self.bind_result(result, dst);
            }
            CastKind::IntToFloat { to_bits, .. } => {
                self.ra.flush_all_dirty(&mut self.buf);
                self.load_into_fixed(src, Reg::Rax);
                let prefix = if to_bits == 32 { 0xf3 } else { 0xf2 };
                encode::cvtsi2f(&mut self.buf, prefix, Xmm::Xmm0, Reg::Rax);
                self.store_xmm(Xmm::Xmm0, dst);
            }
            CastKind::FloatToInt { .. } => {
                self.xmm_for(src, Xmm::Xmm0);
                self.ra.flush_all_dirty(&mut self.buf);
                let prefix = if self.f.operand_info(src).bits == 32 { 0xf3 } else { 0xf2 };
                encode::cvtf2si(&mut self.buf, prefix, Reg::Rax, Xmm::Xmm0);
                self.store_reg_to_temp(Reg::Rax, dst);
            }
            CastKind::FloatExtend => {
                self.xmm_for(src, Xmm::Xmm0);
                // cvtss2sd xmm0, xmm0
                encode::sse_rr(&mut self.buf, 0xf3, 0x5a, Xmm::Xmm0, Xmm::Xmm0);
                self.store_xmm(Xmm::Xmm0, dst);
            }
            CastKind::FloatTruncate => {
                self.xmm_for(src, Xmm::Xmm0);
                // cvtsd2ss xmm0, xmm0
                encode::sse_rr(&mut self.buf, 0xf2, 0x5a, Xmm::Xmm0, Xmm::Xmm0);
                self.store_xmm(Xmm::Xmm0, dst);
            }
        }
    }

    fn emit_call(
        &mut self,
        callee: &Callee,
        args: &[CallArg],
        dst: Option<TempVar>,
        sret: Option<TempVar>,
        ret_float: bool,
    ) -> Result<(), CodegenError> {
        // All dirty state reaches memory before the call.
        self.ra.flush_all_dirty(&mut self.buf);

        // Integer/float register assignment (positional on Win64).
        let mut int_i = 0usize;
        let mut float_i = 0usize;
        let mut reg_moves: Vec<(CallArg, Reg)> = Vec::new();
        let mut xmm_moves: Vec<(CallArg, usize)> = Vec::new();
        let mut stack_args: Vec<CallArg> = Vec::new();
        let mut position = 0usize;

        let mut assign = |arg: CallArg,
                          position: usize,
                          int_i: &mut usize,
                          float_i: &mut usize,
                          reg_moves: &mut Vec<(CallArg, Reg)>,
                          xmm_moves: &mut Vec<(CallArg, usize)>,
                          stack_args: &mut Vec<CallArg>| {
            let slot = if self.abi.positional_args { position } else if arg.is_float { *float_i } else { *int_i };
            if arg.is_float {
                if slot < self.abi.float_arg_count {
                    xmm_moves.push((arg, slot));
                } else {
                    stack_args.push(arg);
                }
                *float_i += 1;
            } else {
                if slot < self.abi.int_args.len() {
                    reg_moves.push((arg, self.abi.int_args[slot]));
                } else {
                    stack_args.push(arg);
                }
                *int_i += 1;
            }
        };

        if let Some(sret_ptr) = sret {
            assign(
                CallArg { value: Operand::Temp(sret_ptr), bits: 64, is_float: false },
                position,
                &mut int_i,
                &mut float_i,
                &mut reg_moves,
                &mut xmm_moves,
                &mut stack_args,
            );
            position += 1;
        }
        for &arg in args {
            assign(
                arg,
                position,
                &mut int_i,
                &mut float_i,
                &mut reg_moves,
                &mut xmm_moves,
                &mut stack_args,
            );
            position += 1;
        }

        // Stack area: shadow space plus spilled arguments, 16-aligned.
        let stack_bytes = self.abi.shadow_space + (stack_args.len() as u32) * 8;
        let stack_bytes = stack_bytes.div_ceil(16) * 16;
        if stack_bytes > 0 {
            encode::sub_ri(&mut self.buf, Reg::Rsp, stack_bytes as i32);
        }
        for (i, arg) in stack_args.iter().enumerate() {
            self.load_into_fixed(arg.value, Reg::Rax);
            encode::mov_store(
                &mut self.buf,
                64,
                Reg::Rsp,
                (self.abi.shadow_space + i as u32 * 8) as i32,
                Reg::Rax,
            );
        }
        // Indirect callee loads into R10 before the argument registers are
        // live.
        let indirect_reg = match callee {
            Callee::Indirect(t) => {
                let slot = self.temp_slot(*t);
                encode::mov_load(&mut self.buf, 64, false, Reg::R10, Reg::Rbp, slot);
                Some(Reg::R10)
            }
            Callee::Direct(_) => None,
        };
        for (arg, xmm_slot) in &xmm_moves {
            self.xmm_for(arg.value, xmm_arg(*xmm_slot));
        }
        for (arg, reg) in &reg_moves {
            self.load_into_fixed(arg.value, *reg);
        }

        match callee {
            Callee::Direct(symbol) => {
                let at = encode::call(&mut self.buf);
                self.relocs.push((
                    at,
                    self.strings.view(*symbol).to_string(),
                    RelocKind::Pc32,
                    -4,
                ));
            }
            Callee::Indirect(_) => {
                encode::call_reg(&mut self.buf, indirect_reg.expect("loaded above"));
            }
        }

        if stack_bytes > 0 {
            encode::add_ri(&mut self.buf, Reg::Rsp, stack_bytes as i32);
        }

        if let Some(dst) = dst {
            if ret_float {
                self.store_xmm(Xmm::Xmm0, dst);
            } else {
                self.store_reg_to_temp(Reg::Rax, dst);
            }
        }
        Ok(())
    }

    // -- landing pads ---------------------------------------------------

    /// One landing pad per try region: save RAX (exception pointer) and RDX
    /// (selector), then compare the selector against each handler's filter
    /// in order. The catch-all, if present, is last and needs no compare.
    fn emit_landing_pads(&mut self) -> Result<(), CodegenError> {
        let regions: Vec<_> = self.f.try_regions.clone();
        for region in &regions {
            let start = *self
                .region_start
                .get(&region.region)
                .ok_or_else(|| CodegenError::Internal("try region missing a start".into()))?;
            let end = *self
                .region_end
                .get(&region.region)
                .ok_or_else(|| CodegenError::Internal("try region missing an end".into()))?;

            let pad = self.off();
            let mut handlers = Vec::new();

            // Dispatch order: typed handlers in source order, the catch-all
            // last. A source-order catch-all would shadow later typed
            // handlers, so ordering is normalized here and mirrored by the
            // action chain the LSDA builder writes.
            let mut ordered: Vec<(usize, &fcpp_ir::HandlerInfo)> = region
                .handlers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.catch_ty.is_some())
                .collect();
            ordered.extend(
                region
                    .handlers
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.catch_ty.is_none()),
            );

            if self.target == Target::Linux64 {
                // The personality delivers the exception pointer in RAX and
                // the selector in RDX before transferring here.
                encode::mov_store(&mut self.buf, 64, Reg::Rbp, self.exc_slot, Reg::Rax);
                encode::mov_store(&mut self.buf, 32, Reg::Rbp, self.sel_slot, Reg::Rdx);

                for (pos, (orig, handler)) in ordered.iter().enumerate() {
                    let filter = pos as i32 + 1;
                    let body_offset = *self
                        .handler_offsets
                        .get(&(region.region, *orig as u32))
                        .ok_or_else(|| {
                            CodegenError::Internal("catch handler body missing".into())
                        })?;
                    handlers.push(HandlerRec {
                        catch_ty: handler.catch_ty,
                        body_offset,
                        filter,
                    });

                    let is_catch_all = handler.catch_ty.is_none();
                    let is_last = pos + 1 == ordered.len();
                    let skip_at = if !(is_catch_all && is_last) {
                        encode::mov_load(&mut self.buf, 32, true, Reg::Rax, Reg::Rbp, self.sel_slot);
                        encode::cmp_ri(&mut self.buf, Reg::Rax, filter);
                        Some(encode::jcc(&mut self.buf, Cond::Ne))
                    } else {
                        None
                    };

                    // Matched: begin the catch and enter the handler body.
                    encode::mov_load(&mut self.buf, 64, false, Reg::Rdi, Reg::Rbp, self.exc_slot);
                    let at = encode::call(&mut self.buf);
                    self.relocs
                        .push((at, "__cxa_begin_catch".to_string(), RelocKind::Pc32, -4));
                    let jmp_at = encode::jmp(&mut self.buf);
                    // Patch directly to the handler offset.
                    let target = body_offset as i64 - (jmp_at as i64 + 4);
                    self.buf[jmp_at..jmp_at + 4]
                        .copy_from_slice(&(target as i32).to_le_bytes());

                    if let Some(skip) = skip_at {
                        let here = self.off() as i64;
                        let rel = here - (skip as i64 + 4);
                        self.buf[skip..skip + 4].copy_from_slice(&(rel as i32).to_le_bytes());
                    }
                }

                // No handler matched (no catch-all): resume unwinding.
                if ordered.last().map(|(_, h)| h.catch_ty.is_some()).unwrap_or(true) {
                    encode::mov_load(&mut self.buf, 64, false, Reg::Rdi, Reg::Rbp, self.exc_slot);
                    let at = encode::call(&mut self.buf);
                    self.relocs
                        .push((at, "_Unwind_Resume".to_string(), RelocKind::Pc32, -4));
                    encode::ud2(&mut self.buf);
                }
            } else {
                // Win64: the runtime dispatches through the FuncInfo tables;
                // the handlers are funclets and no pad code is required.
                for (pos, (orig, handler)) in ordered.iter().enumerate() {
                    let body_offset = *self
                        .handler_offsets
                        .get(&(region.region, *orig as u32))
                        .ok_or_else(|| {
                            CodegenError::Internal("catch handler body missing".into())
                        })?;
                    handlers.push(HandlerRec {
                        catch_ty: handler.catch_ty,
                        body_offset,
                        filter: pos as i32 + 1,
                    });
                }
            }

            self.tries.push(TryRec {
                region: region.region,
                start,
                end,
                pad,
                handlers,
            });
        }
        Ok(())
    }

    fn resolve_fixups(&mut self) {
        for &(at, label) in &self.fixups {
            let target = self.labels[label.0 as usize].expect("every label is bound") as i64;
            let rel = target - (at as i64 + 4);
            self.buf[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
    }
}

fn xmm_arg(index: usize) -> Xmm {
    match index {
        0 => Xmm::Xmm0,
        1 => Xmm::Xmm1,
        2 => Xmm::Xmm2,
        3 => Xmm::Xmm3,
        4 => Xmm::Xmm4,
        5 => Xmm::Xmm5,
        6 => Xmm::Xmm6,
        _ => Xmm::Xmm7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcpp_par::Parser;
    use fcpp_sem::TemplateRegistry;
    use fcpp_util::diagnostic::Handler;
    use fcpp_util::FileId;

    fn compile(src: &str, target: Target) -> (ObjectModule, Vec<String>) {
        let mut strings = StringTable::new();
        let mut types = TypeRegistry::new(&mut strings);
        let mut templates = TemplateRegistry::new();
        let handler = Handler::new();
        let tokens = fcpp_lex::Lexer::tokenize(src, FileId::DUMMY, &mut strings).expect("lex");
        let parser = Parser::new(tokens, &mut strings, &mut types, &mut templates, &handler);
        let output = parser.parse().expect("parse");
        assert!(!handler.has_errors(), "{:?}", handler.take());
        let mut functions = Vec::new();
        for f in &output.functions {
            functions.push(
                fcpp_ir::lower_function(f, &output.ast, &mut types, &mut strings, target)
                    .expect("lower"),
            );
        }
        if let Some(init) = fcpp_ir::lower_static_initializers(
            &output.globals,
            &output.ast,
            &mut types,
            &mut strings,
            target,
        )
        .expect("static init")
        {
            functions.push(init);
        }
        let module =
            emit_module(&functions, &output.globals, &types, &strings, target).expect("emit");
        let names = module
            .symbols()
            .map(|(_, s)| s.name.clone())
            .collect::<Vec<_>>();
        (module, names)
    }

    #[test]
    fn test_empty_main_is_linkable() {
        let (module, names) = compile("int main() { return 0; }", Target::Linux64);
        assert!(names.contains(&"main".to_string()));
        let bytes = module.to_bytes().expect("serialize");
        assert_eq!(&bytes[..4], b"\x7fELF");
        // .eh_frame exists with a CIE even for a minimal function.
        let eh = module
            .sections()
            .find(|(_, s)| s.name == ".eh_frame")
            .expect("eh_frame present");
        assert!(!eh.1.bytes.is_empty());
    }

    #[test]
    fn test_return_42_contains_mov_42() {
        let (module, _) = compile("int main() { return 42; }", Target::Linux64);
        let text = module
            .sections()
            .find(|(_, s)| s.kind == SectionKind::Text)
            .expect("text");
        // mov rax, 42 => 48 c7 c0 2a 00 00 00
        assert!(text
            .1
            .bytes
            .windows(7)
            .any(|w| w == [0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00]));
        // Standard prologue at function start.
        assert_eq!(&text.1.bytes[..4], &[0x55, 0x48, 0x89, 0xe5]);
    }

    #[test]
    fn test_call_gets_pc32_relocation() {
        let (module, _) = compile(
            "int f() { return 21; } int main() { return f() + f(); }",
            Target::Linux64,
        );
        let text = module
            .sections()
            .find(|(_, s)| s.kind == SectionKind::Text)
            .expect("text");
        assert!(
            text.1.relocs.iter().filter(|r| r.kind == RelocKind::Pc32).count() >= 2,
            "two calls, two PC32 relocations"
        );
    }

    #[test]
    fn test_eh_sections_on_linux() {
        let (module, names) = compile(
            "int main() { try { throw 42; } catch (int e) { return e; } }",
            Target::Linux64,
        );
        let section_names: Vec<&str> = module.sections().map(|(_, s)| s.name.as_str()).collect();
        assert!(section_names.contains(&".eh_frame"));
        assert!(section_names.contains(&".gcc_except_table"));
        assert!(names.iter().any(|n| n == "__cxa_throw"));
        assert!(names.iter().any(|n| n == "__cxa_begin_catch"));
        assert!(names.iter().any(|n| n == "__gxx_personality_v0"));
        assert!(names.iter().any(|n| n == "_ZTIi"), "typeinfo for int referenced");
    }

    #[test]
    fn test_eh_sections_on_win64() {
        let (module, names) = compile(
            "int main() { try { throw 42; } catch (int e) { return e; } }",
            Target::Win64,
        );
        let section_names: Vec<&str> = module.sections().map(|(_, s)| s.name.as_str()).collect();
        assert!(section_names.contains(&".pdata"));
        assert!(section_names.contains(&".xdata"));
        assert!(names.iter().any(|n| n == "__CxxFrameHandler3"));
        assert!(names.iter().any(|n| n == "_CxxThrowException"));
        let bytes = module.to_bytes().expect("serialize");
        assert_eq!(&bytes[..2], &[0x64, 0x86]);
    }

    #[test]
    fn test_string_literal_pooled() {
        let (module, _) = compile(
            "extern \"C\" int puts(const char* s);\n             int main() { puts(\"hello\"); puts(\"hello\"); return 0; }",
            Target::Linux64,
        );
        let rodata = module
            .sections()
            .find(|(_, s)| s.kind == SectionKind::ROData)
            .expect("rodata");
        // One pooled copy of the bytes.
        let hay = &rodata.1.bytes;
        let count = hay
            .windows(6)
            .filter(|w| *w == b"hello\0")
            .count();
        assert_eq!(count, 1, "string literal interned once");
    }

    #[test]
    fn test_global_symbols_emitted() {
        let (_, names) = compile(
            "int counter = 42; namespace n { int inner = 7; } int main() { return counter; }",
            Target::Linux64,
        );
        assert!(names.contains(&"counter".to_string()));
        assert!(names.contains(&"_ZN1n5innerE".to_string()));
    }

    #[test]
    fn test_vtable_emitted_for_dynamic_class() {
        let (module, names) = compile(
            "struct B { virtual int f() { return 1; } };\n             int main() { B b; B* p = &b; return p->f(); }",
            Target::Linux64,
        );
        assert!(names.iter().any(|n| n.starts_with("_ZTV")), "vtable symbol");
        let rodata = module
            .sections()
            .find(|(_, s)| s.kind == SectionKind::ROData)
            .expect("rodata");
        assert!(
            rodata.1.relocs.iter().any(|r| r.kind == RelocKind::Abs64),
            "vtable slots are absolute pointers"
        );
    }

    #[test]
    fn test_jump_table_in_rodata() {
        let (module, _) = compile(
            "int main() { int x = 2; switch (x) { case 0: return 1; case 1: return 2; case 2: return 3; case 3: return 4; } return 0; }",
            Target::Linux64,
        );
        let rodata = module
            .sections()
            .find(|(_, s)| s.kind == SectionKind::ROData)
            .expect("rodata");
        // Four absolute entries pointing back into .text.
        assert!(rodata.1.relocs.len() >= 4);
    }

    #[test]
    fn test_static_initializer_registered() {
        let (module, names) = compile(
            "int f() { return 42; } int g = f(); int main() { return g; }",
            Target::Linux64,
        );
        assert!(names.iter().any(|n| n.starts_with("_GLOBAL__sub_I")));
        assert!(module.sections().any(|(_, s)| s.name == ".init_array"));
    }
}
