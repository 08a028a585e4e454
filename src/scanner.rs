//! Static-call detection over decoded method bodies.
//!
//! Only methods shaped like a program entry point
//! (`public static void m(String[])`) are walked. Each `invokestatic` operand
//! is resolved through the literal table and compared with the target symbol;
//! for every match the preceding operations are searched for literal loads
//! that look like type names. That argument list is advisory: it is not a
//! stack simulation and may both over- and under-collect.

use log::{debug, warn};
use serde::Serialize;

use crate::cache::UnitCache;
use crate::config::ScannerConfig;
use crate::errors::{DecodeError, ScanError};
use crate::model::{Archive, CompiledUnit, Literal, MemberRef, MethodDescriptor, InstructionStream};

const ENTRY_PARAMETERS: [&str; 1] = ["java.lang.String[]"];

/// Fully qualified static method being looked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSymbol {
    /// Dotted owner name.
    pub owner: String,
    pub method: String,
}

impl TargetSymbol {
    pub fn new(owner: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            owner: owner.into().replace('/', "."),
            method: method.into(),
        }
    }

    pub fn matches(&self, member: &MemberRef) -> bool {
        member.name == self.method && member.owner_name() == self.owner
    }
}

impl std::fmt::Display for TargetSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.owner, self.method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSite {
    /// Index of the invoke within the method's operation sequence.
    pub location: usize,
    /// Byte offset of the invoke within the method body.
    pub offset: u32,
    pub descriptor: String,
    /// Best-effort type names loaded shortly before the call.
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodScan {
    pub unit: String,
    pub method: String,
    pub descriptor: String,
    pub has_call: bool,
    /// Location of the first matching call.
    pub call_location: Option<usize>,
    pub calls: Vec<CallSite>,
}

impl MethodScan {
    fn new(unit: &CompiledUnit, method: &MethodDescriptor, calls: Vec<CallSite>) -> Self {
        Self {
            unit: unit.name.clone(),
            method: method.signature(),
            descriptor: method.descriptor.clone(),
            has_call: !calls.is_empty(),
            call_location: calls.first().map(|c| c.location),
            calls,
        }
    }
}

/// Per-method results across an archive, plus the units that failed.
#[derive(Debug, Default)]
pub struct ArchiveScan {
    pub methods: Vec<MethodScan>,
    pub errors: Vec<ScanError>,
}

impl ArchiveScan {
    pub fn matches(&self) -> impl Iterator<Item = &MethodScan> {
        self.methods.iter().filter(|m| m.has_call)
    }
}

#[derive(Debug, Clone)]
pub struct InstructionScanner {
    target: TargetSymbol,
    window: usize,
}

impl InstructionScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            target: TargetSymbol::new(&config.target_owner, &config.target_method),
            window: config.argument_window,
        }
    }

    pub fn target(&self) -> &TargetSymbol {
        &self.target
    }

    pub fn is_candidate(&self, method: &MethodDescriptor) -> bool {
        method.modifiers.is_public()
            && method.modifiers.is_static()
            && method.return_type == "void"
            && method.parameter_types == ENTRY_PARAMETERS
    }

    /// Every call to the target in `stream`, in operation order.
    pub fn scan_stream(&self, stream: &InstructionStream) -> Result<Vec<CallSite>, DecodeError> {
        let mut calls = Vec::new();
        for (index, op) in stream.ops().iter().enumerate() {
            if !op.is_static_invoke() {
                continue;
            }
            let Some(literal) = stream.resolve(op)? else {
                continue;
            };
            let member = match literal {
                Literal::Method(m) | Literal::InterfaceMethod(m) => m,
                _ => {
                    return Err(DecodeError::UnexpectedLiteral {
                        index: op.literal.unwrap_or_default(),
                        expected: "method reference",
                    });
                }
            };
            if !self.target.matches(member) {
                continue;
            }
            calls.push(CallSite {
                location: index,
                offset: op.offset,
                descriptor: member.descriptor.clone(),
                arguments: self.recover_arguments(stream, index)?,
            });
        }
        Ok(calls)
    }

    fn recover_arguments(
        &self,
        stream: &InstructionStream,
        call: usize,
    ) -> Result<Vec<String>, DecodeError> {
        let start = call.saturating_sub(self.window);
        let mut found: Vec<String> = Vec::new();
        for op in &stream.ops()[start..call] {
            if !op.is_literal_load() {
                continue;
            }
            let text = match stream.resolve(op)? {
                Some(Literal::Str(s)) => s.clone(),
                Some(Literal::Class(internal)) => internal.clone(),
                _ => continue,
            };
            if looks_like_type_name(&text) {
                let dotted = text.replace('/', ".");
                if !found.contains(&dotted) {
                    found.push(dotted);
                }
            }
        }
        Ok(found)
    }

    /// Scans the candidate methods of one unit.
    ///
    /// Methods decoded at load time are scanned directly; otherwise the body
    /// is read through the cache. Any failure abandons the whole unit.
    pub fn scan_unit(
        &self,
        unit: &CompiledUnit,
        cache: &UnitCache,
    ) -> Result<Vec<MethodScan>, ScanError> {
        let mut scans = Vec::new();
        for method in unit.methods.iter().filter(|m| self.is_candidate(m)) {
            let calls = match &method.instructions {
                Some(stream) => self.scan_stream(stream),
                None => self.scan_stream(&self.load_body(unit, method, cache)?),
            }
            .map_err(|source| ScanError::Decode {
                unit: unit.name.clone(),
                source,
            })?;
            scans.push(MethodScan::new(unit, method, calls));
        }
        Ok(scans)
    }

    fn load_body(
        &self,
        unit: &CompiledUnit,
        method: &MethodDescriptor,
        cache: &UnitCache,
    ) -> Result<InstructionStream, ScanError> {
        let unavailable = || ScanError::HandleUnavailable {
            unit: unit.name.clone(),
        };
        let handle = cache.get(&unit.name).ok_or_else(unavailable)?;
        let decoded = handle
            .with(|res| {
                let class = res.class_file();
                class
                    .method(&method.name, &method.descriptor)
                    .map(|raw| class.decode_method(raw))
            })
            .ok_or_else(unavailable)?;

        match decoded {
            Some(Ok(Some(stream))) => Ok(stream),
            Some(Ok(None)) | None => Err(ScanError::MissingCode {
                unit: unit.name.clone(),
                method: method.signature(),
            }),
            Some(Err(source)) => Err(ScanError::Decode {
                unit: unit.name.clone(),
                source,
            }),
        }
    }

    /// Scans every unit; a failing unit is recorded and the rest continue.
    pub fn scan_archive(&self, archive: &Archive, cache: &UnitCache) -> ArchiveScan {
        let mut out = ArchiveScan::default();
        for unit in &archive.units {
            match self.scan_unit(unit, cache) {
                Ok(scans) => out.methods.extend(scans),
                Err(e) => {
                    warn!("scanner: {e}");
                    out.errors.push(e);
                }
            }
        }
        debug!(
            "scanner: {} candidate methods, {} with calls to {}, {} unit errors",
            out.methods.len(),
            out.matches().count(),
            self.target,
            out.errors.len()
        );
        out
    }
}

/// `a.b.Type` or `a/b/Type`: has a separator and the last segment starts
/// with an uppercase letter.
pub fn looks_like_type_name(text: &str) -> bool {
    let Some((head, last)) = text.rsplit_once(['.', '/']) else {
        return false;
    };
    !head.is_empty()
        && !text.contains(char::is_whitespace)
        && last.chars().next().is_some_and(char::is_uppercase)
}
