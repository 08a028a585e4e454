//! Immutable descriptors extracted from compiled classes.
//!
//! A [`CompiledUnit`] is built once during archive ingestion and shared as
//! `Arc<CompiledUnit>` for the rest of the session. Method bodies are only
//! decoded into an [`InstructionStream`] when deep inspection was requested;
//! otherwise the scanner materializes them on demand through the cache.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bytecode::opcodes;
use crate::errors::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Class,
    Interface,
    Enum,
    /// Annotation type (`@interface`).
    Marker,
}

impl UnitKind {
    pub fn from_access_flags(flags: Modifiers) -> Self {
        if flags.contains(Modifiers::ANNOTATION) {
            UnitKind::Marker
        } else if flags.contains(Modifiers::INTERFACE) {
            UnitKind::Interface
        } else if flags.contains(Modifiers::ENUM) {
            UnitKind::Enum
        } else {
            UnitKind::Class
        }
    }
}

/// Attribute value of a [`MetadataTag`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
    Map(BTreeMap<String, TagValue>),
}

impl TagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Strings and string lists both flatten to a list.
    pub fn as_str_list(&self) -> Vec<&str> {
        match self {
            TagValue::Str(s) => vec![s.as_str()],
            TagValue::StrList(items) => items.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Float(x) => write!(f, "{x}"),
            TagValue::Str(s) => f.write_str(s),
            TagValue::StrList(items) => write!(f, "[{}]", items.join(", ")),
            TagValue::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// A declarative marker (annotation) attached to a unit or method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataTag {
    pub type_name: String,
    pub attributes: BTreeMap<String, TagValue>,
}

impl MetadataTag {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: TagValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.attributes.get(key)
    }
}

/// JVM access flags of a class or method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Modifiers(u16);

impl Modifiers {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const BRIDGE: u16 = 0x0040;
    pub const VARARGS: u16 = 0x0080;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const STRICT: u16 = 0x0800;
    pub const SYNTHETIC: u16 = 0x1000;
    pub const ANNOTATION: u16 = 0x2000;
    pub const ENUM: u16 = 0x4000;

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub const fn is_public(self) -> bool {
        self.contains(Self::PUBLIC)
    }

    pub const fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

}

/// Symbolic reference to a field or method: `owner` is in internal form
/// (`a/b/C`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn owner_name(&self) -> String {
        internal_to_dotted(&self.owner)
    }
}

/// One resolved slot of a class's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Slot 0 and the upper half of a long/double.
    Reserved,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    /// Class reference in internal form.
    Class(String),
    Str(String),
    Field(MemberRef),
    Method(MemberRef),
    InterfaceMethod(MemberRef),
    NameAndType { name: String, descriptor: String },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(String),
    Dynamic { bootstrap: u16, name: String, descriptor: String },
    InvokeDynamic { bootstrap: u16, name: String, descriptor: String },
    Module(String),
    Package(String),
}

/// Index-addressable table of literals referenced by instruction operands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiteralTable {
    slots: Vec<Literal>,
}

impl LiteralTable {
    pub fn new(slots: Vec<Literal>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: u16) -> Result<&Literal, DecodeError> {
        self.slots
            .get(index as usize)
            .ok_or(DecodeError::LiteralOutOfBounds {
                index,
                len: self.slots.len(),
            })
    }

    pub fn utf8(&self, index: u16) -> Result<&str, DecodeError> {
        match self.get(index)? {
            Literal::Utf8(s) => Ok(s),
            _ => Err(DecodeError::UnexpectedLiteral {
                index,
                expected: "utf8 constant",
            }),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str, DecodeError> {
        match self.get(index)? {
            Literal::Class(s) => Ok(s),
            _ => Err(DecodeError::UnexpectedLiteral {
                index,
                expected: "class constant",
            }),
        }
    }
}

/// One decoded operation. `literal` is the constant-pool operand, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: u8,
    pub literal: Option<u16>,
}

impl Instruction {
    pub fn is_static_invoke(&self) -> bool {
        self.opcode == opcodes::INVOKESTATIC
    }

    pub fn is_literal_load(&self) -> bool {
        matches!(self.opcode, opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W)
    }
}

/// Ordered, randomly indexable operations plus the literal table they index.
///
/// Construction validates that every operand resolves inside the table, so
/// later lookups through [`InstructionStream::resolve`] cannot go out of
/// bounds for streams built here.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionStream {
    ops: Vec<Instruction>,
    literals: Arc<LiteralTable>,
}

impl InstructionStream {
    pub fn new(ops: Vec<Instruction>, literals: Arc<LiteralTable>) -> Result<Self, DecodeError> {
        for op in &ops {
            if let Some(index) = op.literal {
                literals.get(index)?;
            }
        }
        Ok(Self { ops, literals })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.ops.get(index)
    }

    pub fn ops(&self) -> &[Instruction] {
        &self.ops
    }

    pub fn literals(&self) -> &LiteralTable {
        &self.literals
    }

    pub fn resolve(&self, op: &Instruction) -> Result<Option<&Literal>, DecodeError> {
        op.literal.map(|i| self.literals.get(i)).transpose()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Raw JVM descriptor, e.g. `([Ljava/lang/String;)V`.
    pub descriptor: String,
    pub return_type: String,
    pub parameter_types: Vec<String>,
    pub modifiers: Modifiers,
    pub tags: Vec<MetadataTag>,
    pub instructions: Option<InstructionStream>,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        descriptor: impl Into<String>,
        modifiers: Modifiers,
    ) -> Result<Self, DecodeError> {
        let descriptor = descriptor.into();
        let (parameter_types, return_type) = parse_method_descriptor(&descriptor)?;
        Ok(Self {
            name: name.into(),
            descriptor,
            return_type,
            parameter_types,
            modifiers,
            tags: Vec::new(),
            instructions: None,
        })
    }

    pub fn with_tags(mut self, tags: Vec<MetadataTag>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_instructions(mut self, stream: InstructionStream) -> Self {
        self.instructions = Some(stream);
        self
    }

    /// `name(Type, Type)` form used in evidence.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.parameter_types.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    /// Fully qualified, dotted name.
    pub name: String,
    pub kind: UnitKind,
    pub modifiers: Modifiers,
    pub tags: Vec<MetadataTag>,
    pub methods: Vec<MethodDescriptor>,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

impl CompiledUnit {
    pub fn new(name: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            name: name.into(),
            kind,
            modifiers: Modifiers::from_bits(Modifiers::PUBLIC),
            tags: Vec::new(),
            methods: Vec::new(),
            super_name: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
        }
    }

    /// Adds a tag; a later tag of the same type replaces the earlier one.
    pub fn with_tag(mut self, tag: MetadataTag) -> Self {
        self.tags.retain(|t| t.type_name != tag.type_name);
        self.tags.push(tag);
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_super(mut self, super_name: Option<String>) -> Self {
        self.super_name = super_name;
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<String>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn tag(&self, type_name: &str) -> Option<&MetadataTag> {
        self.tags.iter().find(|t| t.type_name == type_name)
    }

    pub fn has_tag(&self, type_name: &str) -> bool {
        self.tag(type_name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveLocation {
    pub path: PathBuf,
    pub display_name: String,
}

impl ArchiveLocation {
    pub fn from_path(path: &Path) -> Self {
        let display_name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            path: path.to_path_buf(),
            display_name,
        }
    }
}

/// `META-INF/MANIFEST.MF` main attributes. Simple key lookup only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    /// Parses the main section. Continuation lines start with a single space.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut current: Option<(String, String)> = None;

        for line in text.replace("\r\n", "\n").lines() {
            if let Some(rest) = line.strip_prefix(' ') {
                if let Some((_, value)) = current.as_mut() {
                    value.push_str(rest);
                }
                continue;
            }
            if let Some((k, v)) = current.take() {
                entries.entry(k).or_insert(v);
            }
            if line.trim().is_empty() {
                // End of the main section.
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                current = Some((k.trim().to_string(), v.trim_start().to_string()));
            }
        }
        if let Some((k, v)) = current.take() {
            entries.entry(k).or_insert(v);
        }

        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The input of one detection run.
#[derive(Debug, Clone)]
pub struct Archive {
    pub location: ArchiveLocation,
    pub units: Vec<Arc<CompiledUnit>>,
    pub manifest: Manifest,
}

impl Archive {
    pub fn new(location: ArchiveLocation, units: Vec<CompiledUnit>, manifest: Manifest) -> Self {
        Self {
            location,
            units: units.into_iter().map(Arc::new).collect(),
            manifest,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, name: &str) -> Option<&Arc<CompiledUnit>> {
        self.units.iter().find(|u| u.name == name)
    }
}

pub fn internal_to_dotted(internal: &str) -> String {
    internal.replace('/', ".")
}

/// Splits a method descriptor into Java parameter type names and return type.
pub fn parse_method_descriptor(descriptor: &str) -> Result<(Vec<String>, String), DecodeError> {
    let malformed = || DecodeError::Malformed {
        what: "method descriptor",
        detail: descriptor.to_string(),
    };

    let rest = descriptor.strip_prefix('(').ok_or_else(malformed)?;
    let (params, ret) = rest.split_once(')').ok_or_else(malformed)?;

    let mut parameter_types = Vec::new();
    let mut cursor = params;
    while !cursor.is_empty() {
        let (ty, remaining) = parse_field_type(cursor).ok_or_else(malformed)?;
        parameter_types.push(ty);
        cursor = remaining;
    }

    let return_type = if ret == "V" {
        "void".to_string()
    } else {
        match parse_field_type(ret) {
            Some((ty, "")) => ty,
            _ => return Err(malformed()),
        }
    };

    Ok((parameter_types, return_type))
}

/// Java name of a field descriptor such as `Lorg/example/App;`.
pub fn descriptor_type_name(descriptor: &str) -> Option<String> {
    match parse_field_type(descriptor) {
        Some((ty, "")) => Some(ty),
        _ => None,
    }
}

fn parse_field_type(input: &str) -> Option<(String, &str)> {
    let mut dims = 0usize;
    let mut rest = input;
    while let Some(r) = rest.strip_prefix('[') {
        dims += 1;
        rest = r;
    }

    let first = rest.chars().next()?;
    let (base, remaining) = match first {
        'B' => ("byte".to_string(), &rest[1..]),
        'C' => ("char".to_string(), &rest[1..]),
        'D' => ("double".to_string(), &rest[1..]),
        'F' => ("float".to_string(), &rest[1..]),
        'I' => ("int".to_string(), &rest[1..]),
        'J' => ("long".to_string(), &rest[1..]),
        'S' => ("short".to_string(), &rest[1..]),
        'Z' => ("boolean".to_string(), &rest[1..]),
        'L' => {
            let end = rest.find(';')?;
            (internal_to_dotted(&rest[1..end]), &rest[end + 1..])
        }
        _ => return None,
    };

    Some((format!("{base}{}", "[]".repeat(dims)), remaining))
}
