//! Loadable code unit wire format
//!
//! A code unit is a self-contained block of compiled words, placed in shared
//! memory by whatever compiled it and installed into the shared dispatch
//! table by the loader. Layout:
//!
//! ```text
//! magic "\0vmu" | version u8 | word count u16 LE
//! per word: code byte length u16 LE | instruction stream
//! ```
//!
//! Instructions are a single opcode byte followed by a little-endian operand:
//! `Lit` (i32), `Call` (u32 table index), `Prim` (u8 primitive number).

use crate::error::LoadError;
use crate::vm::Cell;

/// Leading magic bytes of every code unit
pub const UNIT_MAGIC: [u8; 4] = *b"\0vmu";

/// Current code unit format version
pub const UNIT_VERSION: u8 = 1;

const OP_LIT: u8 = 0x01;
const OP_CALL: u8 = 0x02;
const OP_PRIM: u8 = 0x03;

/// A single decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push a literal cell onto the data stack
    Lit(Cell),

    /// Execute the table entry at this index
    Call(u32),

    /// Execute a VM primitive by number
    Prim(u8),
}

/// One executable word: a decoded instruction sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBlock {
    pub ops: Vec<Op>,
}

impl CodeBlock {
    pub fn new(ops: Vec<Op>) -> Self {
        CodeBlock { ops }
    }
}

/// A parsed code unit, ready to be appended to the dispatch table
#[derive(Debug, Clone, Default)]
pub struct CodeUnit {
    pub words: Vec<CodeBlock>,
}

impl CodeUnit {
    pub fn new(words: Vec<CodeBlock>) -> Self {
        CodeUnit { words }
    }

    /// Parse a unit from its byte representation.
    ///
    /// Structural validation only: magic, version, exact operand lengths, no
    /// trailing bytes. Call targets are range-checked by the loader at
    /// install time (only it knows the table length); primitive numbers are
    /// checked by the VM at execution time.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < UNIT_MAGIC.len() || bytes[..UNIT_MAGIC.len()] != UNIT_MAGIC {
            return Err(LoadError::BadMagic);
        }
        let mut cursor = UNIT_MAGIC.len();

        let version = read_u8(bytes, &mut cursor)?;
        if version != UNIT_VERSION {
            return Err(LoadError::UnsupportedVersion(version));
        }

        let count = read_u16(bytes, &mut cursor)? as usize;
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u16(bytes, &mut cursor)? as usize;
            if cursor + len > bytes.len() {
                return Err(LoadError::Truncated);
            }
            words.push(parse_block(&bytes[cursor..cursor + len])?);
            cursor += len;
        }

        if cursor != bytes.len() {
            return Err(LoadError::TrailingGarbage);
        }
        Ok(CodeUnit { words })
    }

    /// Encode this unit to its byte representation
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&UNIT_MAGIC);
        out.push(UNIT_VERSION);
        out.extend_from_slice(&(self.words.len() as u16).to_le_bytes());
        for word in &self.words {
            let code = encode_block(word);
            out.extend_from_slice(&(code.len() as u16).to_le_bytes());
            out.extend_from_slice(&code);
        }
        out
    }
}

fn parse_block(code: &[u8]) -> Result<CodeBlock, LoadError> {
    let mut ops = Vec::new();
    let mut cursor = 0;
    while cursor < code.len() {
        let opcode = read_u8(code, &mut cursor)?;
        let op = match opcode {
            OP_LIT => Op::Lit(read_i32(code, &mut cursor)?),
            OP_CALL => Op::Call(read_u32(code, &mut cursor)?),
            OP_PRIM => Op::Prim(read_u8(code, &mut cursor)?),
            other => return Err(LoadError::InvalidOpcode(other)),
        };
        ops.push(op);
    }
    Ok(CodeBlock { ops })
}

fn encode_block(block: &CodeBlock) -> Vec<u8> {
    let mut out = Vec::new();
    for op in &block.ops {
        match op {
            Op::Lit(v) => {
                out.push(OP_LIT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Op::Call(t) => {
                out.push(OP_CALL);
                out.extend_from_slice(&t.to_le_bytes());
            }
            Op::Prim(p) => {
                out.push(OP_PRIM);
                out.push(*p);
            }
        }
    }
    out
}

#[inline]
fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8, LoadError> {
    if *cursor >= bytes.len() {
        return Err(LoadError::Truncated);
    }
    let value = bytes[*cursor];
    *cursor += 1;
    Ok(value)
}

#[inline]
fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16, LoadError> {
    if *cursor + 2 > bytes.len() {
        return Err(LoadError::Truncated);
    }
    let value = u16::from_le_bytes([bytes[*cursor], bytes[*cursor + 1]]);
    *cursor += 2;
    Ok(value)
}

#[inline]
fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, LoadError> {
    if *cursor + 4 > bytes.len() {
        return Err(LoadError::Truncated);
    }
    let value = u32::from_le_bytes([
        bytes[*cursor],
        bytes[*cursor + 1],
        bytes[*cursor + 2],
        bytes[*cursor + 3],
    ]);
    *cursor += 4;
    Ok(value)
}

#[inline]
fn read_i32(bytes: &[u8], cursor: &mut usize) -> Result<i32, LoadError> {
    Ok(read_u32(bytes, cursor)? as i32)
}
