//! Struct/class and enum metadata, layout computation and vtable assignment.
//!
//! Class types reference themselves and each other through [`TypeIndex`]
//! values only; the registry owns all metadata, so cyclic types
//! (`struct S { S* next; }`) need no owning pointers.

use fcpp_util::{NodeId, StringHandle};

use crate::consteval::ConstValue;
use crate::types::{StructId, TypeIndex, TypeKind, TypeRegistry};

/// C++ member access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
    Private,
}

/// Virtual-ness of a member function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Virtuality {
    None,
    Virtual,
    Override,
    Pure,
}

impl Virtuality {
    /// True for any flavor that occupies a vtable slot.
    pub fn is_virtual(self) -> bool {
        !matches!(self, Virtuality::None)
    }
}

/// A non-static data member.
#[derive(Clone, Debug)]
pub struct Member {
    pub name: StringHandle,
    pub ty: TypeIndex,
    /// Bit offset from the start of the object; filled by layout.
    pub offset_bits: u32,
    /// Bit-field width, if declared as one.
    pub bit_width: Option<u8>,
}

/// A member function.
#[derive(Clone, Debug)]
pub struct MemberFunction {
    pub name: StringHandle,
    /// Function type (without the implicit object parameter).
    pub ty: TypeIndex,
    /// Body node, if defined.
    pub body: Option<NodeId>,
    pub virtuality: Virtuality,
    pub access: Access,
    pub is_static: bool,
    pub is_const: bool,
    pub is_ctor: bool,
    pub is_dtor: bool,
    /// Assigned vtable slot, for virtual functions, after layout.
    pub vtable_slot: Option<u32>,
}

/// A static data member.
#[derive(Clone, Debug)]
pub struct StaticMember {
    pub name: StringHandle,
    pub ty: TypeIndex,
    pub initializer: Option<NodeId>,
    /// Value, when the initializer is a constant expression. Template
    /// metaprogramming (`is_same<T,T>::value`) reads this during parsing.
    pub const_value: Option<ConstValue>,
}

/// A base class entry.
#[derive(Clone, Debug)]
pub struct BaseClass {
    pub ty: TypeIndex,
    /// Offset of the base subobject; filled by layout.
    pub offset_bits: u32,
    pub is_virtual: bool,
    pub access: Access,
}

/// One virtual function slot.
#[derive(Clone, Debug)]
pub struct VtableSlot {
    pub fn_name: StringHandle,
    /// Function type of the final overrider.
    pub ty: TypeIndex,
    /// Class that provides the final overrider.
    pub defined_in: TypeIndex,
}

/// Explicit vtable layout record for a dynamic class.
#[derive(Clone, Debug, Default)]
pub struct VTable {
    pub slots: Vec<VtableSlot>,
}

/// Metadata for one struct/class.
#[derive(Clone, Debug)]
pub struct StructInfo {
    pub name: StringHandle,
    /// Back link to the owning type index.
    pub ty: TypeIndex,
    pub members: Vec<Member>,
    pub member_fns: Vec<MemberFunction>,
    pub statics: Vec<StaticMember>,
    pub bases: Vec<BaseClass>,
    pub friends: Vec<StringHandle>,
    pub vtable: Option<VTable>,
    /// Virtual-base offset table; one entry per virtual base.
    pub vbtable: Vec<(TypeIndex, u32)>,
    /// Class-scope `using name = type;` aliases (`X<T>::type` lookups).
    pub type_aliases: Vec<(StringHandle, TypeIndex)>,
    /// Originating template pattern, for instantiations.
    pub from_template: Option<StringHandle>,
    pub is_complete: bool,
}

impl Default for StructInfo {
    fn default() -> Self {
        Self {
            name: StringHandle::DUMMY,
            ty: TypeIndex(0),
            members: Vec::new(),
            member_fns: Vec::new(),
            statics: Vec::new(),
            bases: Vec::new(),
            friends: Vec::new(),
            vtable: None,
            vbtable: Vec::new(),
            type_aliases: Vec::new(),
            from_template: None,
            is_complete: false,
        }
    }
}

/// Metadata for one enum.
#[derive(Clone, Debug)]
pub struct EnumInfo {
    pub name: StringHandle,
    pub underlying: TypeIndex,
    pub is_scoped: bool,
    pub enumerators: Vec<(StringHandle, i64)>,
}

impl StructInfo {
    /// Find a data member by name.
    pub fn member(&self, name: StringHandle) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Find a static member by name.
    pub fn static_member(&self, name: StringHandle) -> Option<&StaticMember> {
        self.statics.iter().find(|m| m.name == name)
    }

    /// Find member functions by name (an overload set).
    pub fn member_fns_named(&self, name: StringHandle) -> Vec<&MemberFunction> {
        self.member_fns.iter().filter(|f| f.name == name).collect()
    }

    /// True if this class (not counting bases) declares a virtual function.
    pub fn declares_virtual(&self) -> bool {
        self.member_fns.iter().any(|f| f.virtuality.is_virtual())
    }
}

impl TypeRegistry {
    /// Compute layout for a completed class body: base placement, member
    /// offsets with alignment padding, vtable slot assignment, final size.
    ///
    /// Called exactly once, when the parser reaches the closing brace of the
    /// class definition.
    pub fn complete_struct(&mut self, id: StructId) {
        let mut info = std::mem::take(&mut self.structs[id]);
        debug_assert!(!info.is_complete, "layout computed twice");

        let mut offset: u32 = 0;
        let mut align: u32 = 8;

        // Vtable: inherit the primary base's slots, then apply overrides and
        // append new virtuals.
        let has_dynamic_base = info
            .bases
            .iter()
            .any(|b| self.struct_of(b.ty).map(|s| s.vtable.is_some()).unwrap_or(false));
        let needs_vtable = info.declares_virtual() || has_dynamic_base;
        if needs_vtable {
            let mut slots: Vec<VtableSlot> = info
                .bases
                .first()
                .and_then(|b| self.struct_of(b.ty))
                .and_then(|s| s.vtable.as_ref())
                .map(|v| v.slots.clone())
                .unwrap_or_default();
            for func in info.member_fns.iter_mut().filter(|f| f.virtuality.is_virtual()) {
                if let Some(existing) = slots.iter().position(|s| s.fn_name == func.name) {
                    slots[existing] = VtableSlot {
                        fn_name: func.name,
                        ty: func.ty,
                        defined_in: info.ty,
                    };
                    func.vtable_slot = Some(existing as u32);
                } else {
                    func.vtable_slot = Some(slots.len() as u32);
                    slots.push(VtableSlot {
                        fn_name: func.name,
                        ty: func.ty,
                        defined_in: info.ty,
                    });
                }
            }
            info.vtable = Some(VTable { slots });
            // The vptr occupies the first quadword.
            offset = 64;
            align = 64;
        }

        // Non-virtual bases in declaration order.
        for base in info.bases.iter_mut().filter(|b| !b.is_virtual) {
            let (bsize, balign) = (self.size_bits(base.ty), self.align_bits(base.ty));
            // A dynamic primary base shares its vptr with us.
            let skip = if needs_vtable
                && self.struct_of(base.ty).map(|s| s.vtable.is_some()).unwrap_or(false)
                && offset == 64
            {
                64
            } else {
                0
            };
            offset = round_up(offset.max(skip), balign.max(8)).max(skip);
            base.offset_bits = offset.saturating_sub(skip);
            offset += bsize.saturating_sub(skip);
            align = align.max(balign);
        }

        // Data members, with bit-field packing.
        let mut bit_cursor: Option<(u32, u32, u32)> = None; // (unit_start, unit_bits, used)
        for member in info.members.iter_mut() {
            let msize = self.size_bits(member.ty);
            let malign = self.align_bits(member.ty).max(8);
            match member.bit_width {
                Some(width) => {
                    let width = width as u32;
                    let unit_bits = msize.max(8);
                    let fits = matches!(bit_cursor, Some((_, ub, used)) if ub == unit_bits && used + width <= ub);
                    if !fits {
                        offset = round_up(offset, malign);
                        bit_cursor = Some((offset, unit_bits, 0));
                        offset += unit_bits;
                        align = align.max(malign);
                    }
                    let (unit_start, _, used) = bit_cursor.expect("cursor just set");
                    member.offset_bits = unit_start + used;
                    bit_cursor = Some((unit_start, unit_bits, used + width));
                }
                None => {
                    bit_cursor = None;
                    offset = round_up(offset, malign);
                    member.offset_bits = offset;
                    offset += msize;
                    align = align.max(malign);
                }
            }
        }

        // Virtual bases go after all members; record their offsets in the
        // virtual-base table.
        for base in info.bases.iter_mut().filter(|b| b.is_virtual) {
            let (bsize, balign) = (self.size_bits(base.ty), self.align_bits(base.ty));
            offset = round_up(offset, balign.max(8));
            base.offset_bits = offset;
            info.vbtable.push((base.ty, offset));
            offset += bsize;
            align = align.max(balign);
        }

        let size = round_up(offset, align).max(8);
        info.is_complete = true;

        let ty = info.ty;
        self.structs[id] = info;
        let type_info = self.info_mut(ty);
        type_info.size_bits = size;
        type_info.align_bits = align;
        type_info.is_incomplete_instantiation = false;

        // offset + size <= parent size for every member.
        #[cfg(debug_assertions)]
        {
            let info = &self.structs[id];
            for member in &info.members {
                let msize = member
                    .bit_width
                    .map(|w| w as u32)
                    .unwrap_or_else(|| self.size_bits(member.ty));
                debug_assert!(member.offset_bits + msize <= size);
            }
        }
    }

    /// Walk this class and its bases for a data member, returning the
    /// member and its total offset from the start of the object.
    pub fn find_member(&self, ty: TypeIndex, name: StringHandle) -> Option<(Member, u32)> {
        let s = self.struct_of(ty)?;
        if let Some(m) = s.member(name) {
            return Some((m.clone(), m.offset_bits));
        }
        for base in &s.bases {
            if let Some((m, off)) = self.find_member(base.ty, name) {
                return Some((m, base.offset_bits + off));
            }
        }
        None
    }

    /// Walk this class and its bases for a member function.
    pub fn find_member_fn(&self, ty: TypeIndex, name: StringHandle) -> Option<(MemberFunction, TypeIndex)> {
        let s = self.struct_of(ty)?;
        if let Some(f) = s.member_fns.iter().find(|f| f.name == name) {
            return Some((f.clone(), self.canonical(ty)));
        }
        for base in &s.bases {
            if let Some(found) = self.find_member_fn(base.ty, name) {
                return Some(found);
            }
        }
        None
    }

    /// Destructor of a class, if declared.
    pub fn find_dtor(&self, ty: TypeIndex) -> Option<MemberFunction> {
        self.struct_of(ty)?
            .member_fns
            .iter()
            .find(|f| f.is_dtor)
            .cloned()
    }

    /// True if the type (or any member/base) has a non-trivial destructor.
    pub fn needs_destruction(&self, ty: TypeIndex) -> bool {
        let canon = self.canonical(ty);
        match self.info(canon).kind {
            TypeKind::Struct { .. } => {
                let Some(s) = self.struct_of(canon) else { return false };
                if s.member_fns.iter().any(|f| f.is_dtor) {
                    return true;
                }
                s.members.iter().any(|m| self.needs_destruction(m.ty))
                    || s.bases.iter().any(|b| self.needs_destruction(b.ty))
            }
            TypeKind::Array { element, .. } => self.needs_destruction(element),
            _ => false,
        }
    }
}

#[inline]
fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two() || align % 8 == 0);
    let align = align.max(1);
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeInfo, TypeRegistry};
    use fcpp_util::StringTable;

    fn new_struct(
        strings: &mut StringTable,
        registry: &mut TypeRegistry,
        name: &str,
    ) -> (StructId, TypeIndex) {
        let handle = strings.intern(name);
        let id = registry.structs.push(StructInfo {
            name: handle,
            ..Default::default()
        });
        let ty = registry.register_named(
            handle,
            TypeInfo {
                name: handle,
                kind: TypeKind::Struct { id },
                size_bits: 0,
                align_bits: 8,
                is_incomplete_instantiation: false,
            },
        );
        registry.structs[id].ty = ty;
        (id, ty)
    }

    #[test]
    fn test_point_layout() {
        let mut strings = StringTable::new();
        let mut registry = TypeRegistry::new(&mut strings);
        let int = registry.builtins.int;
        let (id, ty) = new_struct(&mut strings, &mut registry, "Point");
        let x = strings.intern("x");
        let y = strings.intern("y");
        registry.structs[id].members = vec![
            Member { name: x, ty: int, offset_bits: 0, bit_width: None },
            Member { name: y, ty: int, offset_bits: 0, bit_width: None },
        ];
        registry.complete_struct(id);
        assert_eq!(registry.size_bits(ty), 64);
        assert_eq!(registry.align_bits(ty), 32);
        assert_eq!(registry.structs[id].members[0].offset_bits, 0);
        assert_eq!(registry.structs[id].members[1].offset_bits, 32);
    }

    #[test]
    fn test_padding_inserted() {
        let mut strings = StringTable::new();
        let mut registry = TypeRegistry::new(&mut strings);
        let (id, ty) = new_struct(&mut strings, &mut registry, "Mixed");
        let c = registry.builtins.char_;
        let l = registry.builtins.llong;
        let a = strings.intern("a");
        let b = strings.intern("b");
        registry.structs[id].members = vec![
            Member { name: a, ty: c, offset_bits: 0, bit_width: None },
            Member { name: b, ty: l, offset_bits: 0, bit_width: None },
        ];
        registry.complete_struct(id);
        // char at 0, padding to 8 bytes, long long at 64 bits.
        assert_eq!(registry.structs[id].members[1].offset_bits, 64);
        assert_eq!(registry.size_bits(ty), 128);
        assert_eq!(registry.align_bits(ty), 64);
    }

    #[test]
    fn test_empty_struct_has_size_one() {
        let mut strings = StringTable::new();
        let mut registry = TypeRegistry::new(&mut strings);
        let (id, ty) = new_struct(&mut strings, &mut registry, "Empty");
        registry.complete_struct(id);
        assert_eq!(registry.size_bits(ty), 8);
    }

    #[test]
    fn test_vtable_slot_assignment() {
        let mut strings = StringTable::new();
        let mut registry = TypeRegistry::new(&mut strings);
        let int = registry.builtins.int;
        let void = registry.builtins.void;
        let fn_ty = registry.function_type(void, vec![], false, &mut strings);
        let fn_int_ty = registry.function_type(int, vec![], false, &mut strings);

        let (base_id, base_ty) = new_struct(&mut strings, &mut registry, "Base");
        let f = strings.intern("f");
        let g = strings.intern("g");
        registry.structs[base_id].member_fns = vec![
            MemberFunction {
                name: f,
                ty: fn_ty,
                body: None,
                virtuality: Virtuality::Virtual,
                access: Access::Public,
                is_static: false,
                is_const: false,
                is_ctor: false,
                is_dtor: false,
                vtable_slot: None,
            },
            MemberFunction {
                name: g,
                ty: fn_int_ty,
                body: None,
                virtuality: Virtuality::Virtual,
                access: Access::Public,
                is_static: false,
                is_const: false,
                is_ctor: false,
                is_dtor: false,
                vtable_slot: None,
            },
        ];
        registry.complete_struct(base_id);
        assert_eq!(registry.structs[base_id].member_fns[0].vtable_slot, Some(0));
        assert_eq!(registry.structs[base_id].member_fns[1].vtable_slot, Some(1));
        // vptr makes the object pointer-sized.
        assert_eq!(registry.size_bits(base_ty), 64);

        // Derived overrides f: same slot, vtable inherited.
        let (derived_id, _) = new_struct(&mut strings, &mut registry, "Derived");
        registry.structs[derived_id].bases = vec![BaseClass {
            ty: base_ty,
            offset_bits: 0,
            is_virtual: false,
            access: Access::Public,
        }];
        registry.structs[derived_id].member_fns = vec![MemberFunction {
            name: f,
            ty: fn_ty,
            body: None,
            virtuality: Virtuality::Override,
            access: Access::Public,
            is_static: false,
            is_const: false,
            is_ctor: false,
            is_dtor: false,
            vtable_slot: None,
        }];
        registry.complete_struct(derived_id);
        assert_eq!(registry.structs[derived_id].member_fns[0].vtable_slot, Some(0));
        let vt = registry.structs[derived_id].vtable.as_ref().unwrap();
        assert_eq!(vt.slots.len(), 2);
        assert_eq!(vt.slots[0].defined_in, registry.structs[derived_id].ty);
        assert_eq!(vt.slots[1].defined_in, base_ty);
    }

    #[test]
    fn test_member_lookup_through_base() {
        let mut strings = StringTable::new();
        let mut registry = TypeRegistry::new(&mut strings);
        let int = registry.builtins.int;
        let (base_id, base_ty) = new_struct(&mut strings, &mut registry, "B");
        let v = strings.intern("v");
        registry.structs[base_id].members =
            vec![Member { name: v, ty: int, offset_bits: 0, bit_width: None }];
        registry.complete_struct(base_id);

        let (derived_id, derived_ty) = new_struct(&mut strings, &mut registry, "D");
        let w = strings.intern("w");
        registry.structs[derived_id].bases = vec![BaseClass {
            ty: base_ty,
            offset_bits: 0,
            is_virtual: false,
            access: Access::Public,
        }];
        registry.structs[derived_id].members =
            vec![Member { name: w, ty: int, offset_bits: 0, bit_width: None }];
        registry.complete_struct(derived_id);

        let (_, v_off) = registry.find_member(derived_ty, v).unwrap();
        let (_, w_off) = registry.find_member(derived_ty, w).unwrap();
        assert_eq!(v_off, 0);
        assert_eq!(w_off, 32);
    }

    #[test]
    fn test_bitfield_packing() {
        let mut strings = StringTable::new();
        let mut registry = TypeRegistry::new(&mut strings);
        let int = registry.builtins.int;
        let (id, ty) = new_struct(&mut strings, &mut registry, "Flags");
        let a = strings.intern("a");
        let b = strings.intern("b");
        let c = strings.intern("c");
        registry.structs[id].members = vec![
            Member { name: a, ty: int, offset_bits: 0, bit_width: Some(3) },
            Member { name: b, ty: int, offset_bits: 0, bit_width: Some(5) },
            Member { name: c, ty: int, offset_bits: 0, bit_width: Some(30) },
        ];
        registry.complete_struct(id);
        let members = &registry.structs[id].members;
        assert_eq!(members[0].offset_bits, 0);
        assert_eq!(members[1].offset_bits, 3);
        // 30 bits do not fit in the remaining 24, so a new unit starts.
        assert_eq!(members[2].offset_bits, 32);
        assert_eq!(registry.size_bits(ty), 64);
    }
}
