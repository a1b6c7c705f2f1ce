//! Object module: sections, symbols, relocations, and serialization.
//!
//! The code generator appends bytes and relocations into named sections and
//! declares symbols; `finalize` lowers everything through
//! `object::write::Object` into a COFF or ELF file. Section byte buffers are
//! append-only; relocations are `(offset, symbol, kind, addend)` tuples
//! pointing into a section.

use fcpp_ir::Target;
use fcpp_util::{define_idx, FxHashMap, IndexVec};
use object::write::{Object, Relocation as ObjRelocation, Symbol as ObjSymbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind as ObjSectionKind, SymbolFlags, SymbolKind as ObjSymbolKind, SymbolScope,
};

use crate::CodegenError;

define_idx! {
    /// Section handle.
    pub struct SectionId;
}

define_idx! {
    /// Symbol handle.
    pub struct SymbolId;
}

/// Logical section classes the code generator emits into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Data,
    ROData,
    Bss,
    EhFrame,
    GccExceptTable,
    Pdata,
    Xdata,
    InitArray,
}

/// Relocation kinds, mapped per container at finalize:
/// `Pc32` → `R_X86_64_PC32` / `IMAGE_REL_AMD64_REL32`,
/// `Abs64` → `R_X86_64_64` / `IMAGE_REL_AMD64_ADDR64`,
/// `Abs32` → `R_X86_64_32`,
/// `Rva32` → `IMAGE_REL_AMD64_ADDR32NB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    Pc32,
    Abs64,
    Abs32,
    Rva32,
}

/// Symbol binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolBinding {
    Global,
    Local,
}

/// Symbol classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolClass {
    Function,
    Data,
    Undefined,
}

#[derive(Clone, Debug)]
pub struct Relocation {
    pub offset: u64,
    pub symbol: SymbolId,
    pub kind: RelocKind,
    pub addend: i64,
}

#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub align: u64,
    pub bytes: Vec<u8>,
    pub relocs: Vec<Relocation>,
    /// Virtual size for `.bss`.
    pub bss_size: u64,
}

#[derive(Clone, Debug)]
pub struct SymbolDef {
    pub name: String,
    pub section: Option<SectionId>,
    pub offset: u64,
    pub size: u64,
    pub class: SymbolClass,
    pub binding: SymbolBinding,
}

/// The in-memory object under construction.
pub struct ObjectModule {
    pub target: Target,
    sections: IndexVec<SectionId, Section>,
    symbols: IndexVec<SymbolId, SymbolDef>,
    by_name: FxHashMap<String, SymbolId>,
}

impl ObjectModule {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            sections: IndexVec::new(),
            symbols: IndexVec::new(),
            by_name: FxHashMap::default(),
        }
    }

    /// Create a section.
    pub fn add_section(&mut self, name: &str, kind: SectionKind, align: u64) -> SectionId {
        self.sections.push(Section {
            name: name.to_string(),
            kind,
            align,
            bytes: Vec::new(),
            relocs: Vec::new(),
            bss_size: 0,
        })
    }

    /// Append bytes, returning the offset they start at.
    pub fn append_bytes(&mut self, section: SectionId, bytes: &[u8]) -> u64 {
        let s = &mut self.sections[section];
        let offset = s.bytes.len() as u64;
        s.bytes.extend_from_slice(bytes);
        offset
    }

    /// Reserve zero-initialized space (`.bss`).
    pub fn reserve_bss(&mut self, section: SectionId, size: u64, align: u64) -> u64 {
        let s = &mut self.sections[section];
        let offset = s.bss_size.div_ceil(align) * align;
        s.bss_size = offset + size;
        offset
    }

    /// Current length of a section.
    pub fn len(&self, section: SectionId) -> u64 {
        self.sections[section].bytes.len() as u64
    }

    /// Define a symbol.
    pub fn add_symbol(
        &mut self,
        name: &str,
        section: SectionId,
        offset: u64,
        size: u64,
        class: SymbolClass,
        binding: SymbolBinding,
    ) -> SymbolId {
        if let Some(&existing) = self.by_name.get(name) {
            // Defining a previously referenced (undefined) symbol.
            let def = &mut self.symbols[existing];
            def.section = Some(section);
            def.offset = offset;
            def.size = size;
            def.class = class;
            def.binding = binding;
            return existing;
        }
        let id = self.symbols.push(SymbolDef {
            name: name.to_string(),
            section: Some(section),
            offset,
            size,
            class,
            binding,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Reference a symbol by name, creating an undefined entry on first
    /// sight (external references like `__cxa_throw`).
    pub fn symbol_ref(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.symbols.push(SymbolDef {
            name: name.to_string(),
            section: None,
            offset: 0,
            size: 0,
            class: SymbolClass::Undefined,
            binding: SymbolBinding::Global,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Look up a defined symbol.
    pub fn lookup(&self, name: &str) -> Option<&SymbolDef> {
        self.by_name.get(name).map(|&id| &self.symbols[id])
    }

    /// Append a relocation against a section offset.
    pub fn add_relocation(
        &mut self,
        section: SectionId,
        offset: u64,
        symbol: SymbolId,
        kind: RelocKind,
        addend: i64,
    ) {
        self.sections[section]
            .relocs
            .push(Relocation { offset, symbol, kind, addend });
    }

    /// All symbols in definition order.
    pub fn symbols(&self) -> impl Iterator<Item = (SymbolId, &SymbolDef)> {
        self.symbols.iter_enumerated()
    }

    /// All sections in creation order.
    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections.iter_enumerated()
    }

    /// Serialize to COFF/ELF bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodegenError> {
        let format = match self.target {
            Target::Linux64 => BinaryFormat::Elf,
            Target::Win64 => BinaryFormat::Coff,
        };
        let mut obj = Object::new(format, Architecture::X86_64, Endianness::Little);

        // Sections.
        let mut section_map = Vec::with_capacity(self.sections.len());
        for (_, section) in self.sections.iter_enumerated() {
            let kind = match section.kind {
                SectionKind::Text => ObjSectionKind::Text,
                SectionKind::Data => ObjSectionKind::Data,
                SectionKind::ROData
                | SectionKind::EhFrame
                | SectionKind::GccExceptTable
                | SectionKind::Pdata
                | SectionKind::Xdata => ObjSectionKind::ReadOnlyData,
                SectionKind::Bss => ObjSectionKind::UninitializedData,
                SectionKind::InitArray => ObjSectionKind::Data,
            };
            let id = obj.add_section(Vec::new(), section.name.clone().into_bytes(), kind);
            if section.kind == SectionKind::Bss {
                obj.append_section_bss(id, section.bss_size, section.align.max(1));
            } else {
                obj.section_mut(id)
                    .set_data(section.bytes.clone(), section.align.max(1));
            }
            section_map.push(id);
        }

        // Symbols.
        let mut symbol_map = Vec::with_capacity(self.symbols.len());
        for (_, sym) in self.symbols.iter_enumerated() {
            let kind = match sym.class {
                SymbolClass::Function => ObjSymbolKind::Text,
                SymbolClass::Data => ObjSymbolKind::Data,
                SymbolClass::Undefined => ObjSymbolKind::Unknown,
            };
            let section = match sym.section {
                Some(s) => SymbolSection::Section(section_map[s.0 as usize]),
                None => SymbolSection::Undefined,
            };
            let scope = match sym.binding {
                SymbolBinding::Global => SymbolScope::Linkage,
                SymbolBinding::Local => SymbolScope::Compilation,
            };
            let id = obj.add_symbol(ObjSymbol {
                name: sym.name.clone().into_bytes(),
                value: sym.offset,
                size: sym.size,
                kind,
                scope,
                weak: false,
                section,
                flags: SymbolFlags::None,
            });
            symbol_map.push(id);
        }

        // Relocations.
        for (sid, section) in self.sections.iter_enumerated() {
            let obj_section = section_map[sid.0 as usize];
            for reloc in &section.relocs {
                let (kind, size) = match reloc.kind {
                    RelocKind::Pc32 => (RelocationKind::Relative, 32),
                    RelocKind::Abs64 => (RelocationKind::Absolute, 64),
                    RelocKind::Abs32 => (RelocationKind::Absolute, 32),
                    RelocKind::Rva32 => (RelocationKind::ImageOffset, 32),
                };
                obj.add_relocation(
                    obj_section,
                    ObjRelocation {
                        offset: reloc.offset,
                        symbol: symbol_map[reloc.symbol.0 as usize],
                        addend: reloc.addend,
                        flags: RelocationFlags::Generic {
                            kind,
                            encoding: RelocationEncoding::Generic,
                            size,
                        },
                    },
                )
                .map_err(|e| CodegenError::Object(e.to_string()))?;
            }
        }

        obj.write().map_err(|e| CodegenError::Object(e.to_string()))
    }

    /// Serialize and write the object file.
    pub fn finalize(&self, path: &std::path::Path) -> Result<(), CodegenError> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_ref_then_define() {
        let mut m = ObjectModule::new(Target::Linux64);
        let text = m.add_section(".text", SectionKind::Text, 16);
        let r = m.symbol_ref("f");
        let d = m.add_symbol("f", text, 0, 4, SymbolClass::Function, SymbolBinding::Global);
        assert_eq!(r, d, "reference and definition unify");
        assert!(m.lookup("f").unwrap().section.is_some());
    }

    #[test]
    fn test_append_returns_offsets() {
        let mut m = ObjectModule::new(Target::Linux64);
        let data = m.add_section(".data", SectionKind::Data, 8);
        assert_eq!(m.append_bytes(data, &[1, 2, 3]), 0);
        assert_eq!(m.append_bytes(data, &[4]), 3);
        assert_eq!(m.len(data), 4);
    }

    #[test]
    fn test_elf_serialization_roundtrip() {
        let mut m = ObjectModule::new(Target::Linux64);
        let text = m.add_section(".text", SectionKind::Text, 16);
        // ret
        m.append_bytes(text, &[0xc3]);
        m.add_symbol("noop", text, 0, 1, SymbolClass::Function, SymbolBinding::Global);
        let bytes = m.to_bytes().expect("serialize");
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn test_coff_serialization() {
        let mut m = ObjectModule::new(Target::Win64);
        let text = m.add_section(".text", SectionKind::Text, 16);
        m.append_bytes(text, &[0xc3]);
        m.add_symbol("noop", text, 0, 1, SymbolClass::Function, SymbolBinding::Global);
        let bytes = m.to_bytes().expect("serialize");
        // COFF machine type for x86-64.
        assert_eq!(&bytes[..2], &[0x64, 0x86]);
    }

    #[test]
    fn test_relocation_recorded() {
        let mut m = ObjectModule::new(Target::Linux64);
        let text = m.add_section(".text", SectionKind::Text, 16);
        m.append_bytes(text, &[0xe8, 0, 0, 0, 0]); // call rel32
        let callee = m.symbol_ref("external_fn");
        m.add_relocation(text, 1, callee, RelocKind::Pc32, -4);
        let bytes = m.to_bytes().expect("serialize");
        assert!(!bytes.is_empty());
        let (_, section) = m.sections().next().unwrap();
        assert_eq!(section.relocs.len(), 1);
        assert_eq!(section.relocs[0].kind, RelocKind::Pc32);
    }
}
