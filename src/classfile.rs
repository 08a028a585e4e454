//! Class-file decoding.
//!
//! Parses the parts of a `.class` file the detector needs: the constant pool
//! (resolved into a [`LiteralTable`]), access flags, the type hierarchy,
//! method headers with their `Code` bodies, and class/method annotations.
//! Fields and all other attributes are skipped over.

use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bytecode;
use crate::errors::DecodeError;
use crate::model::{
    CompiledUnit, InstructionStream, Literal, LiteralTable, MemberRef, MetadataTag,
    MethodDescriptor, Modifiers, TagValue, UnitKind, descriptor_type_name, internal_to_dotted,
};

const MAGIC: u32 = 0xCAFE_BABE;

const VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
const INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";
const CODE: &str = "Code";

#[derive(Debug, Clone)]
pub struct RawMethod {
    pub access_flags: Modifiers,
    pub name: String,
    pub descriptor: String,
    pub code: Option<Vec<u8>>,
    pub annotations: Vec<MetadataTag>,
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub literals: Arc<LiteralTable>,
    pub access_flags: Modifiers,
    /// Internal form (`a/b/C`).
    pub this_class: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub methods: Vec<RawMethod>,
    pub annotations: Vec<MetadataTag>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        r.skip(4)?; // minor and major version
        let literals = Arc::new(read_constant_pool(&mut r)?);

        let access_flags = Modifiers::from_bits(r.u16()?);
        let this_class = literals.class_name(r.u16()?)?.to_string();
        let super_index = r.u16()?;
        let super_class = if super_index == 0 {
            None
        } else {
            Some(literals.class_name(super_index)?.to_string())
        };

        let interface_count = r.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(literals.class_name(r.u16()?)?.to_string());
        }

        let field_count = r.u16()?;
        for _ in 0..field_count {
            r.skip(6)?;
            skip_attributes(&mut r)?;
        }

        let method_count = r.u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(read_method(&mut r, &literals)?);
        }

        let mut annotations = Vec::new();
        let attribute_count = r.u16()?;
        for _ in 0..attribute_count {
            let name = literals.utf8(r.u16()?)?;
            let len = r.u32()? as usize;
            let data = r.bytes(len)?;
            if name == VISIBLE_ANNOTATIONS || name == INVISIBLE_ANNOTATIONS {
                annotations.extend(parse_annotations(data, &literals)?);
            }
        }

        Ok(Self {
            literals,
            access_flags,
            this_class,
            super_class,
            interfaces,
            methods,
            annotations,
        })
    }

    pub fn name(&self) -> String {
        internal_to_dotted(&self.this_class)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&RawMethod> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    /// Decodes one method body; `Ok(None)` for abstract and native methods.
    pub fn decode_method(&self, method: &RawMethod) -> Result<Option<InstructionStream>, DecodeError> {
        method
            .code
            .as_deref()
            .map(|code| bytecode::decode(code, Arc::clone(&self.literals)))
            .transpose()
    }

    /// Builds the immutable descriptor. With `deep`, method bodies are decoded
    /// too; a body that fails to decode is left empty and logged.
    pub fn to_unit(&self, deep: bool) -> Result<CompiledUnit, DecodeError> {
        let mut unit = CompiledUnit::new(self.name(), UnitKind::from_access_flags(self.access_flags))
            .with_super(self.super_class.as_deref().map(internal_to_dotted))
            .with_interfaces(self.interfaces.iter().map(|i| internal_to_dotted(i)).collect());
        unit.modifiers = self.access_flags;

        for tag in &self.annotations {
            unit = unit.with_tag(tag.clone());
        }

        for raw in &self.methods {
            let mut method = MethodDescriptor::new(&raw.name, &raw.descriptor, raw.access_flags)?
                .with_tags(dedupe_tags(&raw.annotations));
            if deep {
                match self.decode_method(raw) {
                    Ok(Some(stream)) => method = method.with_instructions(stream),
                    Ok(None) => {}
                    Err(e) => warn!("{}.{}: body not decoded: {e}", unit.name, raw.name),
                }
            }
            unit = unit.with_method(method);
        }

        Ok(unit)
    }
}

fn dedupe_tags(tags: &[MetadataTag]) -> Vec<MetadataTag> {
    let mut out: Vec<MetadataTag> = Vec::with_capacity(tags.len());
    for tag in tags {
        out.retain(|t| t.type_name != tag.type_name);
        out.push(tag.clone());
    }
    out
}

fn read_method(r: &mut Reader<'_>, literals: &LiteralTable) -> Result<RawMethod, DecodeError> {
    let access_flags = Modifiers::from_bits(r.u16()?);
    let name = literals.utf8(r.u16()?)?.to_string();
    let descriptor = literals.utf8(r.u16()?)?.to_string();

    let mut code = None;
    let mut annotations = Vec::new();
    let attribute_count = r.u16()?;
    for _ in 0..attribute_count {
        let attr_name = literals.utf8(r.u16()?)?;
        let len = r.u32()? as usize;
        let data = r.bytes(len)?;
        match attr_name {
            CODE => code = Some(read_code_body(data)?),
            VISIBLE_ANNOTATIONS | INVISIBLE_ANNOTATIONS => {
                annotations.extend(parse_annotations(data, literals)?)
            }
            _ => {}
        }
    }

    Ok(RawMethod {
        access_flags,
        name,
        descriptor,
        code,
        annotations,
    })
}

fn read_code_body(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut r = Reader::new(data);
    r.skip(4)?; // max_stack, max_locals
    let len = r.u32()? as usize;
    Ok(r.bytes(len)?.to_vec())
}

fn skip_attributes(r: &mut Reader<'_>) -> Result<(), DecodeError> {
    let count = r.u16()?;
    for _ in 0..count {
        r.skip(2)?;
        let len = r.u32()? as usize;
        r.skip(len)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum RawConstant {
    Empty,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    Str(u16),
    Field(u16, u16),
    Method(u16, u16),
    InterfaceMethod(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
}

fn read_constant_pool(r: &mut Reader<'_>) -> Result<LiteralTable, DecodeError> {
    let count = r.u16()?;
    let mut raw = vec![RawConstant::Empty; count.max(1) as usize];

    let mut index = 1u16;
    while index < count {
        let tag = r.u8()?;
        let entry = match tag {
            1 => {
                let len = r.u16()? as usize;
                let bytes = r.bytes(len)?;
                RawConstant::Utf8(
                    decode_modified_utf8(bytes).ok_or(DecodeError::InvalidUtf8 { index })?,
                )
            }
            3 => RawConstant::Integer(r.u32()? as i32),
            4 => RawConstant::Float(f32::from_bits(r.u32()?)),
            5 => RawConstant::Long(r.u64()? as i64),
            6 => RawConstant::Double(f64::from_bits(r.u64()?)),
            7 => RawConstant::Class(r.u16()?),
            8 => RawConstant::Str(r.u16()?),
            9 => RawConstant::Field(r.u16()?, r.u16()?),
            10 => RawConstant::Method(r.u16()?, r.u16()?),
            11 => RawConstant::InterfaceMethod(r.u16()?, r.u16()?),
            12 => RawConstant::NameAndType(r.u16()?, r.u16()?),
            15 => RawConstant::MethodHandle(r.u8()?, r.u16()?),
            16 => RawConstant::MethodType(r.u16()?),
            17 => RawConstant::Dynamic(r.u16()?, r.u16()?),
            18 => RawConstant::InvokeDynamic(r.u16()?, r.u16()?),
            19 => RawConstant::Module(r.u16()?),
            20 => RawConstant::Package(r.u16()?),
            _ => return Err(DecodeError::UnknownConstantTag { tag, index }),
        };
        let wide = matches!(entry, RawConstant::Long(_) | RawConstant::Double(_));
        raw[index as usize] = entry;
        // Longs and doubles take two slots; the second is unusable.
        index = index.saturating_add(if wide { 2 } else { 1 });
    }

    let pool = RawPool(&raw);
    let mut slots = Vec::with_capacity(raw.len());
    for (i, entry) in raw.iter().enumerate() {
        slots.push(pool.resolve(i as u16, entry)?);
    }
    Ok(LiteralTable::new(slots))
}

struct RawPool<'a>(&'a [RawConstant]);

impl RawPool<'_> {
    fn get(&self, index: u16) -> Result<&RawConstant, DecodeError> {
        self.0
            .get(index as usize)
            .ok_or(DecodeError::LiteralOutOfBounds {
                index,
                len: self.0.len(),
            })
    }

    fn utf8(&self, index: u16) -> Result<String, DecodeError> {
        match self.get(index)? {
            RawConstant::Utf8(s) => Ok(s.clone()),
            _ => Err(DecodeError::UnexpectedLiteral {
                index,
                expected: "utf8 constant",
            }),
        }
    }

    fn class(&self, index: u16) -> Result<String, DecodeError> {
        match self.get(index)? {
            RawConstant::Class(name) => self.utf8(*name),
            _ => Err(DecodeError::UnexpectedLiteral {
                index,
                expected: "class constant",
            }),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(String, String), DecodeError> {
        match self.get(index)? {
            RawConstant::NameAndType(n, d) => Ok((self.utf8(*n)?, self.utf8(*d)?)),
            _ => Err(DecodeError::UnexpectedLiteral {
                index,
                expected: "name-and-type constant",
            }),
        }
    }

    fn member(&self, class: u16, nat: u16) -> Result<MemberRef, DecodeError> {
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef {
            owner: self.class(class)?,
            name,
            descriptor,
        })
    }

    fn resolve(&self, index: u16, entry: &RawConstant) -> Result<Literal, DecodeError> {
        let literal = match entry {
            RawConstant::Empty => Literal::Reserved,
            RawConstant::Utf8(s) => Literal::Utf8(s.clone()),
            RawConstant::Integer(v) => Literal::Integer(*v),
            RawConstant::Float(v) => Literal::Float(*v),
            RawConstant::Long(v) => Literal::Long(*v),
            RawConstant::Double(v) => Literal::Double(*v),
            RawConstant::Class(_) => Literal::Class(self.class(index)?),
            RawConstant::Str(s) => Literal::Str(self.utf8(*s)?),
            RawConstant::Field(c, n) => Literal::Field(self.member(*c, *n)?),
            RawConstant::Method(c, n) => Literal::Method(self.member(*c, *n)?),
            RawConstant::InterfaceMethod(c, n) => Literal::InterfaceMethod(self.member(*c, *n)?),
            RawConstant::NameAndType(n, d) => Literal::NameAndType {
                name: self.utf8(*n)?,
                descriptor: self.utf8(*d)?,
            },
            RawConstant::MethodHandle(kind, reference) => Literal::MethodHandle {
                kind: *kind,
                reference: *reference,
            },
            RawConstant::MethodType(d) => Literal::MethodType(self.utf8(*d)?),
            RawConstant::Dynamic(bootstrap, nat) => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Literal::Dynamic {
                    bootstrap: *bootstrap,
                    name,
                    descriptor,
                }
            }
            RawConstant::InvokeDynamic(bootstrap, nat) => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Literal::InvokeDynamic {
                    bootstrap: *bootstrap,
                    name,
                    descriptor,
                }
            }
            RawConstant::Module(n) => Literal::Module(self.utf8(*n)?),
            RawConstant::Package(n) => Literal::Package(self.utf8(*n)?),
        };
        Ok(literal)
    }
}

/// Decodes the JVM's modified UTF-8 (`C0 80` for NUL, surrogate pairs for
/// supplementary characters).
fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Some(s.to_string());
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1)?;
            units.push((u16::from(b & 0x1F) << 6) | u16::from(b2 & 0x3F));
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1)?;
            let b3 = *bytes.get(i + 2)?;
            units.push(
                (u16::from(b & 0x0F) << 12) | (u16::from(b2 & 0x3F) << 6) | u16::from(b3 & 0x3F),
            );
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

fn parse_annotations(data: &[u8], literals: &LiteralTable) -> Result<Vec<MetadataTag>, DecodeError> {
    let mut r = Reader::new(data);
    let count = r.u16()?;
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tags.push(parse_annotation(&mut r, literals)?);
    }
    Ok(tags)
}

fn parse_annotation(r: &mut Reader<'_>, literals: &LiteralTable) -> Result<MetadataTag, DecodeError> {
    let type_descriptor = literals.utf8(r.u16()?)?;
    let type_name =
        descriptor_type_name(type_descriptor).unwrap_or_else(|| type_descriptor.to_string());
    let attributes = parse_element_pairs(r, literals)?;
    Ok(MetadataTag {
        type_name,
        attributes,
    })
}

fn parse_element_pairs(
    r: &mut Reader<'_>,
    literals: &LiteralTable,
) -> Result<BTreeMap<String, TagValue>, DecodeError> {
    let pairs = r.u16()?;
    let mut attributes = BTreeMap::new();
    for _ in 0..pairs {
        let key = literals.utf8(r.u16()?)?.to_string();
        let value = parse_element_value(r, literals)?;
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn parse_element_value(r: &mut Reader<'_>, literals: &LiteralTable) -> Result<TagValue, DecodeError> {
    let tag = r.u8()?;
    let value = match tag {
        b'B' | b'C' | b'I' | b'S' | b'Z' => {
            let index = r.u16()?;
            let v = match literals.get(index)? {
                Literal::Integer(v) => i64::from(*v),
                _ => {
                    return Err(DecodeError::UnexpectedLiteral {
                        index,
                        expected: "integer constant",
                    });
                }
            };
            if tag == b'Z' {
                TagValue::Bool(v != 0)
            } else {
                TagValue::Int(v)
            }
        }
        b'J' => {
            let index = r.u16()?;
            match literals.get(index)? {
                Literal::Long(v) => TagValue::Int(*v),
                _ => {
                    return Err(DecodeError::UnexpectedLiteral {
                        index,
                        expected: "long constant",
                    });
                }
            }
        }
        b'F' | b'D' => {
            let index = r.u16()?;
            match literals.get(index)? {
                Literal::Float(v) => TagValue::Float(f64::from(*v)),
                Literal::Double(v) => TagValue::Float(*v),
                _ => {
                    return Err(DecodeError::UnexpectedLiteral {
                        index,
                        expected: "floating constant",
                    });
                }
            }
        }
        b's' => TagValue::Str(literals.utf8(r.u16()?)?.to_string()),
        b'e' => {
            let type_descriptor = literals.utf8(r.u16()?)?;
            let constant = literals.utf8(r.u16()?)?;
            let type_name =
                descriptor_type_name(type_descriptor).unwrap_or_else(|| type_descriptor.to_string());
            TagValue::Str(format!("{type_name}.{constant}"))
        }
        b'c' => {
            let descriptor = literals.utf8(r.u16()?)?;
            let name = if descriptor == "V" {
                "void".to_string()
            } else {
                descriptor_type_name(descriptor).unwrap_or_else(|| descriptor.to_string())
            };
            TagValue::Str(name)
        }
        b'@' => {
            r.skip(2)?; // nested annotation type
            TagValue::Map(parse_element_pairs(r, literals)?)
        }
        b'[' => {
            let count = r.u16()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(parse_element_value(r, literals)?.to_string());
            }
            TagValue::StrList(items)
        }
        other => {
            return Err(DecodeError::Malformed {
                what: "annotation element",
                detail: format!("unknown tag {:?}", other as char),
            });
        }
    };
    Ok(value)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.bytes.len());
        match end {
            Some(end) => {
                let out = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n - (self.bytes.len() - self.pos).min(n),
            }),
        }
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let hi = u64::from(self.u32()?);
        let lo = u64::from(self.u32()?);
        Ok((hi << 32) | lo)
    }
}
