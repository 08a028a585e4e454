//! Test-only class-file and JAR assembly.
//!
//! Depends on std and zip only, so integration tests can include it by path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;

const ACONST_NULL: u8 = 0x01;
const LDC_W: u8 = 0x13;
const ALOAD_0: u8 = 0x2a;
const POP: u8 = 0x57;
const RETURN: u8 = 0xb1;
const INVOKESTATIC: u8 = 0xb8;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
const ACC_SUPER: u16 = 0x0020;

pub const RUN_DESCRIPTOR: &str =
    "(Ljava/lang/Class;[Ljava/lang/String;)Lorg/springframework/context/ConfigurableApplicationContext;";

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "boot_finder_test_{}_{}_{}_{}",
        std::process::id(),
        nanos,
        n,
        name
    ))
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// Constant pool under construction; indices are returned as entries are added.
#[derive(Default)]
pub struct Pool {
    bytes: Vec<u8>,
    next: u16,
}

impl Pool {
    fn push(&mut self, entry: &[u8]) -> u16 {
        if self.next == 0 {
            self.next = 1;
        }
        self.bytes.extend_from_slice(entry);
        let index = self.next;
        self.next += 1;
        index
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(s.len() as u16).to_be_bytes());
        entry.extend_from_slice(s.as_bytes());
        self.push(&entry)
    }

    pub fn class(&mut self, internal: &str) -> u16 {
        let name = self.utf8(internal);
        let mut entry = vec![7];
        entry.extend_from_slice(&name.to_be_bytes());
        self.push(&entry)
    }

    pub fn string(&mut self, s: &str) -> u16 {
        let text = self.utf8(s);
        let mut entry = vec![8];
        entry.extend_from_slice(&text.to_be_bytes());
        self.push(&entry)
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(owner);
        let n = self.utf8(name);
        let d = self.utf8(descriptor);
        let mut nat = vec![12];
        nat.extend_from_slice(&n.to_be_bytes());
        nat.extend_from_slice(&d.to_be_bytes());
        let nat = self.push(&nat);
        let mut entry = vec![10];
        entry.extend_from_slice(&class.to_be_bytes());
        entry.extend_from_slice(&nat.to_be_bytes());
        self.push(&entry)
    }
}

struct Method {
    flags: u16,
    name: u16,
    descriptor: u16,
    code: Option<Vec<u8>>,
}

/// Builds a minimal but valid class file.
pub struct ClassBuilder {
    pool: Pool,
    flags: u16,
    this_class: u16,
    super_class: u16,
    methods: Vec<Method>,
    annotations: Vec<u8>,
    annotation_count: u16,
    code_attr: u16,
}

impl ClassBuilder {
    pub fn new(internal_name: &str) -> Self {
        let mut pool = Pool::default();
        let this_class = pool.class(internal_name);
        let super_class = pool.class("java/lang/Object");
        let code_attr = pool.utf8("Code");
        Self {
            pool,
            flags: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            methods: Vec::new(),
            annotations: Vec::new(),
            annotation_count: 0,
            code_attr,
        }
    }

    pub fn access(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Class-level annotation with string-valued elements.
    pub fn annotation(mut self, type_internal: &str, elements: &[(&str, &str)]) -> Self {
        let ty = self.pool.utf8(&format!("L{type_internal};"));
        self.annotations.extend_from_slice(&ty.to_be_bytes());
        self.annotations
            .extend_from_slice(&(elements.len() as u16).to_be_bytes());
        for (key, value) in elements {
            let k = self.pool.utf8(key);
            let v = self.pool.utf8(value);
            self.annotations.extend_from_slice(&k.to_be_bytes());
            self.annotations.push(b's');
            self.annotations.extend_from_slice(&v.to_be_bytes());
        }
        self.annotation_count += 1;
        self
    }

    pub fn method(
        mut self,
        name: &str,
        descriptor: &str,
        flags: u16,
        code: impl FnOnce(&mut Pool) -> Option<Vec<u8>>,
    ) -> Self {
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        let code = code(&mut self.pool);
        self.methods.push(Method {
            flags,
            name,
            descriptor,
            code,
        });
        self
    }

    /// `public static void main(String[])` whose body calls `owner.name`
    /// statically, passing `class_arg.class` (or null) and the args array.
    pub fn main_calling(self, owner: &str, name: &str, class_arg: Option<&str>) -> Self {
        let owner = owner.to_string();
        let name = name.to_string();
        let class_arg = class_arg.map(str::to_string);
        self.method(
            "main",
            "([Ljava/lang/String;)V",
            ACC_PUBLIC | ACC_STATIC,
            move |pool| {
                let mut code = Vec::new();
                match class_arg {
                    Some(arg) => {
                        let c = pool.class(&arg);
                        code.extend_from_slice(&[LDC_W, (c >> 8) as u8, c as u8]);
                    }
                    None => code.push(ACONST_NULL),
                }
                code.push(ALOAD_0);
                let m = pool.method_ref(&owner, &name, RUN_DESCRIPTOR);
                code.extend_from_slice(&[INVOKESTATIC, (m >> 8) as u8, m as u8]);
                code.push(POP);
                code.push(RETURN);
                Some(code)
            },
        )
    }

    pub fn build(mut self) -> Vec<u8> {
        let annotations_attr = if self.annotation_count > 0 {
            Some(self.pool.utf8("RuntimeVisibleAnnotations"))
        } else {
            None
        };

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&self.pool.next.max(1).to_be_bytes());
        out.extend_from_slice(&self.pool.bytes);
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // interfaces
        out.extend_from_slice(&0u16.to_be_bytes()); // fields

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend_from_slice(&m.flags.to_be_bytes());
            out.extend_from_slice(&m.name.to_be_bytes());
            out.extend_from_slice(&m.descriptor.to_be_bytes());
            match &m.code {
                Some(code) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&self.code_attr.to_be_bytes());
                    out.extend_from_slice(&(12 + code.len() as u32).to_be_bytes());
                    out.extend_from_slice(&4u16.to_be_bytes()); // max_stack
                    out.extend_from_slice(&2u16.to_be_bytes()); // max_locals
                    out.extend_from_slice(&(code.len() as u32).to_be_bytes());
                    out.extend_from_slice(code);
                    out.extend_from_slice(&0u16.to_be_bytes()); // exception table
                    out.extend_from_slice(&0u16.to_be_bytes()); // attributes
                }
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        match annotations_attr {
            Some(attr) => {
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&attr.to_be_bytes());
                out.extend_from_slice(&(2 + self.annotations.len() as u32).to_be_bytes());
                out.extend_from_slice(&self.annotation_count.to_be_bytes());
                out.extend_from_slice(&self.annotations);
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }
}
