use std::collections::HashMap;

use crate::compiler::CompileError;
use crate::vm::ValueType;

/// Size of every scalar field (int, float and pointer are all 32 bits wide).
pub const SCALAR_BYTES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub u32);

impl StructId {
    pub fn tag(self) -> i32 {
        self.0 as i32
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        u32::try_from(tag).ok().map(StructId)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutAlignment {
    pub structs: usize,
    pub ints: usize,
    pub floats: usize,
}

impl Default for LayoutAlignment {
    fn default() -> Self {
        Self {
            structs: 16,
            ints: 16,
            floats: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub ty: ValueType,
    pub offset: usize,
}

/// A contiguous run of same-typed scalars inside a struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructBlock {
    pub offset: usize,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
    pub int_blocks: Vec<StructBlock>,
    pub float_blocks: Vec<StructBlock>,
    pub size_bytes: usize,
}

impl StructType {
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Number of scalars touched by struct-wide arithmetic.
    pub fn block_elements(&self) -> usize {
        self.int_blocks
            .iter()
            .chain(self.float_blocks.iter())
            .map(|block| block.count)
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct StructTable {
    types: Vec<StructType>,
    ids: HashMap<String, StructId>,
    alignment: LayoutAlignment,
}

impl StructTable {
    pub fn new(alignment: LayoutAlignment) -> Self {
        Self {
            types: Vec::new(),
            ids: HashMap::new(),
            alignment,
        }
    }

    pub fn alignment(&self) -> LayoutAlignment {
        self.alignment
    }

    pub fn id(&self, name: &str) -> Option<StructId> {
        self.ids.get(name).copied()
    }

    pub fn get(&self, id: StructId) -> Option<&StructType> {
        self.types.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StructId, &StructType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(index, ty)| (StructId(index as u32), ty))
    }

    /// Lays out and registers a struct. Field types that name structs must
    /// already be registered.
    pub fn declare(
        &mut self,
        name: &str,
        fields: &[(String, ValueType)],
    ) -> Result<StructId, CompileError> {
        if self.ids.contains_key(name) {
            return Err(CompileError::DuplicateStruct {
                name: name.to_string(),
                line: 0,
            });
        }
        for (index, (field, _)) in fields.iter().enumerate() {
            if fields[..index].iter().any(|(prev, _)| prev == field) {
                return Err(CompileError::DuplicateSymbol {
                    name: format!("{name}.{field}"),
                    line: 0,
                });
            }
        }
        let layout = self.layout(name, fields)?;
        let id = StructId(self.types.len() as u32);
        self.types.push(layout);
        self.ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Computes field offsets: embedded structs first (each behind a tag
    /// prefix), then all ints, then all floats, then all pointers.
    pub fn layout(
        &self,
        name: &str,
        fields: &[(String, ValueType)],
    ) -> Result<StructType, CompileError> {
        let align = self.alignment;
        let mut consumed = 0usize;
        let mut placed: Vec<Option<StructField>> = vec![None; fields.len()];
        let mut int_blocks = Vec::new();
        let mut float_blocks = Vec::new();

        for (index, (field, ty)) in fields.iter().enumerate() {
            let ValueType::Struct(sub_id) = ty else {
                continue;
            };
            let sub = self.get(*sub_id).ok_or_else(|| CompileError::UnknownSymbol {
                name: format!("struct #{}", sub_id.0),
                line: 0,
            })?;
            consumed += SCALAR_BYTES;
            consumed = crate::heap::align_up(consumed, align.structs);
            placed[index] = Some(StructField {
                name: field.clone(),
                ty: *ty,
                offset: consumed,
            });
            int_blocks.extend(sub.int_blocks.iter().map(|block| StructBlock {
                offset: consumed + block.offset,
                count: block.count,
            }));
            float_blocks.extend(sub.float_blocks.iter().map(|block| StructBlock {
                offset: consumed + block.offset,
                count: block.count,
            }));
            consumed += sub.size_bytes;
        }

        consumed = crate::heap::align_up(consumed, align.ints);
        let mut own_ints = StructBlock {
            offset: consumed,
            count: 0,
        };
        for (index, (field, ty)) in fields.iter().enumerate() {
            if *ty == ValueType::Int {
                placed[index] = Some(StructField {
                    name: field.clone(),
                    ty: *ty,
                    offset: consumed,
                });
                own_ints.count += 1;
                consumed += SCALAR_BYTES;
            }
        }
        if own_ints.count > 0 {
            int_blocks.push(own_ints);
        }

        consumed = crate::heap::align_up(consumed, align.floats);
        let mut own_floats = StructBlock {
            offset: consumed,
            count: 0,
        };
        for (index, (field, ty)) in fields.iter().enumerate() {
            if *ty == ValueType::Float {
                placed[index] = Some(StructField {
                    name: field.clone(),
                    ty: *ty,
                    offset: consumed,
                });
                own_floats.count += 1;
                consumed += SCALAR_BYTES;
            }
        }
        if own_floats.count > 0 {
            float_blocks.push(own_floats);
        }

        consumed = crate::heap::align_up(consumed, align.ints);
        for (index, (field, ty)) in fields.iter().enumerate() {
            if *ty == ValueType::Ptr {
                placed[index] = Some(StructField {
                    name: field.clone(),
                    ty: *ty,
                    offset: consumed,
                });
                consumed += SCALAR_BYTES;
            }
        }

        Ok(StructType {
            name: name.to_string(),
            fields: placed.into_iter().flatten().collect(),
            int_blocks,
            float_blocks,
            size_bytes: consumed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[(&str, ValueType)]) -> Vec<(String, ValueType)> {
        list.iter()
            .map(|(name, ty)| (name.to_string(), *ty))
            .collect()
    }

    #[test]
    fn ints_then_floats_then_pointers() {
        let mut table = StructTable::new(LayoutAlignment::default());
        let id = table
            .declare(
                "Mixed",
                &fields(&[
                    ("p", ValueType::Ptr),
                    ("f", ValueType::Float),
                    ("a", ValueType::Int),
                    ("b", ValueType::Int),
                ]),
            )
            .expect("layout should succeed");
        let ty = table.get(id).expect("struct should be registered");
        assert_eq!(ty.field("a").map(|f| f.offset), Some(0));
        assert_eq!(ty.field("b").map(|f| f.offset), Some(4));
        assert_eq!(ty.field("f").map(|f| f.offset), Some(16));
        assert_eq!(ty.field("p").map(|f| f.offset), Some(32));
        assert_eq!(ty.int_blocks, vec![StructBlock { offset: 0, count: 2 }]);
        assert_eq!(ty.float_blocks, vec![StructBlock { offset: 16, count: 1 }]);
        assert_eq!(ty.size_bytes, 36);
        assert_eq!(
            ty.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["p", "f", "a", "b"]
        );
    }

    #[test]
    fn nested_structs_splice_blocks_behind_a_prefix() {
        let mut table = StructTable::new(LayoutAlignment::default());
        let point = table
            .declare(
                "Point",
                &fields(&[("x", ValueType::Int), ("w", ValueType::Float)]),
            )
            .expect("inner layout should succeed");
        let outer = table
            .declare(
                "Outer",
                &fields(&[
                    ("n", ValueType::Int),
                    ("pos", ValueType::Struct(point)),
                    ("scale", ValueType::Float),
                ]),
            )
            .expect("outer layout should succeed");
        let inner = table.get(point).expect("inner registered").clone();
        let ty = table.get(outer).expect("outer registered");

        let pos = ty.field("pos").expect("pos field").offset;
        assert_eq!(pos, 16);
        assert_eq!(ty.int_blocks[0], StructBlock { offset: 16, count: 1 });
        assert_eq!(ty.float_blocks[0], StructBlock { offset: 32, count: 1 });

        let n = ty.field("n").expect("n field").offset;
        assert!(n >= pos + inner.size_bytes);
        assert_eq!(ty.int_blocks[1], StructBlock { offset: n, count: 1 });
        assert_eq!(ty.block_elements(), 4);
    }

    #[test]
    fn zero_field_struct_is_empty() {
        let mut table = StructTable::new(LayoutAlignment::default());
        let id = table.declare("Empty", &[]).expect("layout should succeed");
        let ty = table.get(id).expect("registered");
        assert_eq!(ty.size_bytes, 0);
        assert!(ty.int_blocks.is_empty());
        assert!(ty.float_blocks.is_empty());
    }

    #[test]
    fn layout_is_alignment_correct_for_every_field() {
        let align = LayoutAlignment {
            structs: 8,
            ints: 8,
            floats: 4,
        };
        let mut table = StructTable::new(align);
        let inner = table
            .declare(
                "Inner",
                &fields(&[("a", ValueType::Float), ("b", ValueType::Int)]),
            )
            .expect("inner");
        let outer_fields = fields(&[
            ("i", ValueType::Int),
            ("s", ValueType::Struct(inner)),
            ("f", ValueType::Float),
            ("t", ValueType::Struct(inner)),
            ("p", ValueType::Ptr),
        ]);
        let first = table.layout("Outer", &outer_fields).expect("layout");
        let second = table.layout("Outer", &outer_fields).expect("layout");
        assert_eq!(first, second);
        for block in &first.int_blocks {
            assert_eq!(block.offset % align.ints, 0);
        }
        for block in &first.float_blocks {
            assert_eq!(block.offset % align.floats, 0);
        }
        for field in &first.fields {
            let size = match field.ty {
                ValueType::Struct(id) => table.get(id).expect("inner").size_bytes,
                _ => SCALAR_BYTES,
            };
            assert!(first.size_bytes >= field.offset + size);
        }
    }

    #[test]
    fn duplicate_struct_is_rejected() {
        let mut table = StructTable::new(LayoutAlignment::default());
        table
            .declare("P", &fields(&[("x", ValueType::Int)]))
            .expect("first declaration");
        let err = table
            .declare("P", &fields(&[("y", ValueType::Int)]))
            .expect_err("second declaration should fail");
        assert!(matches!(err, CompileError::DuplicateStruct { ref name, .. } if name == "P"));
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let mut table = StructTable::new(LayoutAlignment::default());
        let err = table
            .declare(
                "P",
                &fields(&[("x", ValueType::Int), ("x", ValueType::Float)]),
            )
            .expect_err("duplicate field should fail");
        assert!(matches!(err, CompileError::DuplicateSymbol { ref name, .. } if name == "P.x"));
    }
}
