//! JVM instruction decoding.
//!
//! Only the shape of each instruction is decoded: its offset, opcode and,
//! for instructions that index the constant pool, the literal index. Branch
//! targets and local-variable slots are skipped over.

use std::sync::Arc;

use crate::errors::DecodeError;
use crate::model::{Instruction, InstructionStream, LiteralTable};

/// Opcodes the scanner and decoder refer to by name.
pub mod opcodes {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const ALOAD: u8 = 0x19;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ISTORE: u8 = 0x36;
    pub const ASTORE: u8 = 0x3a;
    pub const AASTORE: u8 = 0x53;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const IINC: u8 = 0x84;
    pub const IFEQ: u8 = 0x99;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const NEWARRAY: u8 = 0xbc;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
    pub const CHECKCAST: u8 = 0xc0;
    pub const INSTANCEOF: u8 = 0xc1;
    pub const MONITOREXIT: u8 = 0xc3;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
    pub const BREAKPOINT: u8 = 0xca;
    pub const IMPDEP1: u8 = 0xfe;
    pub const IMPDEP2: u8 = 0xff;
}

use opcodes::*;

/// Decodes a `Code` attribute body into an [`InstructionStream`].
pub fn decode(code: &[u8], literals: Arc<LiteralTable>) -> Result<InstructionStream, DecodeError> {
    let ops = decode_ops(code, &literals)?;
    InstructionStream::new(ops, literals)
}

fn decode_ops(code: &[u8], literals: &LiteralTable) -> Result<Vec<Instruction>, DecodeError> {
    let mut ops = Vec::with_capacity(code.len() / 2);
    let mut pc = 0usize;

    while pc < code.len() {
        let opcode = code[pc];
        let (len, literal) = match opcode {
            LDC => (2, Some(u16::from(byte_at(code, pc + 1)?))),
            LDC_W | LDC2_W | GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST
            | INSTANCEOF => (3, Some(u16_at(code, pc + 1)?)),
            INVOKEINTERFACE | INVOKEDYNAMIC => (5, Some(u16_at(code, pc + 1)?)),
            MULTIANEWARRAY => (4, Some(u16_at(code, pc + 1)?)),
            TABLESWITCH => (tableswitch_len(code, pc)?, None),
            LOOKUPSWITCH => (lookupswitch_len(code, pc)?, None),
            WIDE => {
                let len = if byte_at(code, pc + 1)? == IINC { 6 } else { 4 };
                (len, None)
            }
            _ => (fixed_len(opcode, pc)?, None),
        };

        if pc + len > code.len() {
            return Err(DecodeError::Truncated {
                offset: code.len(),
                needed: pc + len - code.len(),
            });
        }
        if let Some(index) = literal {
            literals.get(index)?;
        }

        ops.push(Instruction {
            offset: pc as u32,
            opcode,
            literal,
        });
        pc += len;
    }

    Ok(ops)
}

/// Length of instructions without constant-pool operands or variable size.
fn fixed_len(opcode: u8, offset: usize) -> Result<usize, DecodeError> {
    let len = match opcode {
        NOP..=0x0f => 1,
        BIPUSH => 2,
        SIPUSH => 3,
        ILOAD..=ALOAD => 2,
        0x1a..=0x35 => 1,
        ISTORE..=ASTORE => 2,
        0x3b..=0x83 => 1,
        IINC => 3,
        0x85..=0x98 => 1,
        IFEQ..=JSR => 3,
        RET => 2,
        IRETURN..=RETURN => 1,
        NEWARRAY => 2,
        ARRAYLENGTH | ATHROW | 0xc2 | MONITOREXIT => 1,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        BREAKPOINT | IMPDEP1 | IMPDEP2 => 1,
        _ => return Err(DecodeError::UnknownOpcode { opcode, offset }),
    };
    Ok(len)
}

fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

fn tableswitch_len(code: &[u8], pc: usize) -> Result<usize, DecodeError> {
    let base = pc + 1 + switch_padding(pc);
    let low = i32_at(code, base + 4)?;
    let high = i32_at(code, base + 8)?;
    if high < low {
        return Err(DecodeError::Malformed {
            what: "tableswitch",
            detail: format!("high {high} < low {low} at offset {pc}"),
        });
    }
    let entries = (i64::from(high) - i64::from(low) + 1) as usize;
    Ok(base + 12 + entries * 4 - pc)
}

fn lookupswitch_len(code: &[u8], pc: usize) -> Result<usize, DecodeError> {
    let base = pc + 1 + switch_padding(pc);
    let npairs = i32_at(code, base + 4)?;
    if npairs < 0 {
        return Err(DecodeError::Malformed {
            what: "lookupswitch",
            detail: format!("negative pair count at offset {pc}"),
        });
    }
    Ok(base + 8 + npairs as usize * 8 - pc)
}

fn byte_at(code: &[u8], at: usize) -> Result<u8, DecodeError> {
    code.get(at).copied().ok_or(DecodeError::Truncated {
        offset: at,
        needed: 1,
    })
}

fn u16_at(code: &[u8], at: usize) -> Result<u16, DecodeError> {
    Ok(u16::from_be_bytes([byte_at(code, at)?, byte_at(code, at + 1)?]))
}

fn i32_at(code: &[u8], at: usize) -> Result<i32, DecodeError> {
    match code.get(at..at + 4) {
        Some(b) => Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(DecodeError::Truncated {
            offset: at,
            needed: 4,
        }),
    }
}
