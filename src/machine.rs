//! Reference VM
//!
//! A minimal tree-walking stack machine implementing the `Vm` trait. The
//! bridge treats the VM as an opaque collaborator; this implementation
//! exists so the crate is usable (and testable) end to end, and any other
//! conforming implementation can be substituted behind the same trait.
//!
//! The word set is deliberately small: integer arithmetic, a few stack
//! shufflers, character output, `EXECUTE`, the named-call word `SCALL`,
//! string literals, colon definitions and the control exits. Colon
//! definitions are compiled to a code unit, staged in shared memory and
//! installed through the host's load hook, the same pipeline any other
//! compiler targeting this VM uses.

use std::collections::HashMap;

use crate::PAD_OFFSET;
use crate::shared::SharedEnv;
use crate::status::Status;
use crate::unit::{CodeBlock, CodeUnit, Op};
use crate::vm::{Cell, Host, Vm, VmAccess, VmTrap};

/// Address of the terminal input buffer in shared memory
pub const TIB_ADDR: u32 = 0x100;

/// Size of the terminal input buffer
pub const TIB_SIZE: u32 = 0x400;

/// First address of the dictionary's data space
pub const DATA_BASE: Cell = 0x1000;

const MAX_DEPTH: usize = 128;

/// Primitive operations, referenced from code blocks by number
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prim {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Dup = 5,
    Drop = 6,
    Swap = 7,
    Over = 8,
    Dot = 9,
    Emit = 10,
    Cr = 11,
    Key = 12,
    Execute = 13,
    Scall = 14,
    Bye = 15,
    Quit = 16,
    Abort = 17,
}

impl Prim {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Prim::Add),
            1 => Some(Prim::Sub),
            2 => Some(Prim::Mul),
            3 => Some(Prim::Div),
            4 => Some(Prim::Mod),
            5 => Some(Prim::Dup),
            6 => Some(Prim::Drop),
            7 => Some(Prim::Swap),
            8 => Some(Prim::Over),
            9 => Some(Prim::Dot),
            10 => Some(Prim::Emit),
            11 => Some(Prim::Cr),
            12 => Some(Prim::Key),
            13 => Some(Prim::Execute),
            14 => Some(Prim::Scall),
            15 => Some(Prim::Bye),
            16 => Some(Prim::Quit),
            17 => Some(Prim::Abort),
            _ => None,
        }
    }
}

const BUILTINS: &[(&str, Prim)] = &[
    ("+", Prim::Add),
    ("-", Prim::Sub),
    ("*", Prim::Mul),
    ("/", Prim::Div),
    ("MOD", Prim::Mod),
    ("DUP", Prim::Dup),
    ("DROP", Prim::Drop),
    ("SWAP", Prim::Swap),
    ("OVER", Prim::Over),
    (".", Prim::Dot),
    ("EMIT", Prim::Emit),
    ("CR", Prim::Cr),
    ("KEY", Prim::Key),
    ("EXECUTE", Prim::Execute),
    ("SCALL", Prim::Scall),
    ("BYE", Prim::Bye),
    ("QUIT", Prim::Quit),
    ("ABORT", Prim::Abort),
];

struct ColonDef {
    name: String,
    ops: Vec<Op>,
}

/// Word-at-a-time scanner over one line of input
struct Scanner<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Scanner { bytes, cursor: 0 }
    }

    fn next_word(&mut self) -> Option<String> {
        while self.cursor < self.bytes.len() && self.bytes[self.cursor].is_ascii_whitespace() {
            self.cursor += 1;
        }
        if self.cursor >= self.bytes.len() {
            return None;
        }
        let start = self.cursor;
        while self.cursor < self.bytes.len() && !self.bytes[self.cursor].is_ascii_whitespace() {
            self.cursor += 1;
        }
        Some(String::from_utf8_lossy(&self.bytes[start..self.cursor]).into_owned())
    }

    /// Collect bytes up to `delimiter`, consuming it. One leading space is
    /// skipped, per the string-literal convention.
    fn until(&mut self, delimiter: u8) -> Vec<u8> {
        if self.cursor < self.bytes.len() && self.bytes[self.cursor] == b' ' {
            self.cursor += 1;
        }
        let start = self.cursor;
        while self.cursor < self.bytes.len() && self.bytes[self.cursor] != delimiter {
            self.cursor += 1;
        }
        let text = self.bytes[start..self.cursor].to_vec();
        if self.cursor < self.bytes.len() {
            self.cursor += 1;
        }
        text
    }
}

/// The reference stack machine
pub struct Machine {
    stack: Vec<Cell>,
    dict: HashMap<String, u32>,
    here: Cell,
    err: Cell,
    compiling: Option<ColonDef>,
    // write offset into the transient string region, reset per line
    pad_cursor: Cell,
}

impl Machine {
    /// Create a machine and seed the shared table with its builtin words
    pub fn boot(env: &mut SharedEnv) -> Self {
        let words: Vec<CodeBlock> = BUILTINS
            .iter()
            .map(|(_, prim)| CodeBlock::new(vec![Op::Prim(*prim as u8)]))
            .collect();
        let base = env.table.extend(words);

        let mut dict = HashMap::new();
        for (i, (name, _)) in BUILTINS.iter().enumerate() {
            dict.insert((*name).to_string(), base + i as u32);
        }

        Machine {
            stack: Vec::new(),
            dict,
            here: DATA_BASE,
            err: 0,
            compiling: None,
            pad_cursor: 0,
        }
    }

    fn trap(&mut self, status: Status, message: impl Into<String>) -> VmTrap {
        self.err = status.code();
        VmTrap::new(message)
    }

    fn undefined(&mut self, word: &str, host: &mut dyn Host) -> VmTrap {
        for byte in format!("undefined word: {word}\n").bytes() {
            host.emit(byte);
        }
        self.trap(Status::Abort, format!("undefined word: {word}"))
    }

    fn pop1(&mut self) -> Result<Cell, VmTrap> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.trap(Status::Unknown, "stack underflow")),
        }
    }

    fn binary(&mut self, f: impl Fn(Cell, Cell) -> Cell) -> Result<(), VmTrap> {
        let b = self.pop1()?;
        let a = self.pop1()?;
        self.stack.push(f(a, b));
        Ok(())
    }

    fn interpret_line(
        &mut self,
        line: &[u8],
        env: &mut SharedEnv,
        host: &mut dyn Host,
    ) -> Result<(), VmTrap> {
        let mut scanner = Scanner::new(line);
        self.pad_cursor = 0;
        while let Some(word) = scanner.next_word() {
            match word.as_str() {
                "\\" => break,
                "(" => {
                    scanner.until(b')');
                }
                ":" => {
                    if self.compiling.is_some() {
                        return Err(self.trap(Status::Unknown, "nested definition"));
                    }
                    let Some(name) = scanner.next_word() else {
                        return Err(self.trap(Status::Unknown, "missing name after ':'"));
                    };
                    self.compiling = Some(ColonDef {
                        name,
                        ops: Vec::new(),
                    });
                }
                ";" => self.finish_definition(env, host)?,
                "S\"" => {
                    let text = scanner.until(b'"');
                    self.string_literal(&text, env)?;
                }
                "'" => {
                    let Some(name) = scanner.next_word() else {
                        return Err(self.trap(Status::Unknown, "missing name after '''"));
                    };
                    let Some(token) = self.dict.get(&name).copied() else {
                        return Err(self.undefined(&name, host));
                    };
                    match &mut self.compiling {
                        Some(def) => def.ops.push(Op::Lit(token as Cell)),
                        None => self.stack.push(token as Cell),
                    }
                }
                _ => {
                    if let Some(token) = self.dict.get(&word).copied() {
                        match &mut self.compiling {
                            Some(def) => def.ops.push(Op::Call(token)),
                            None => self.exec_token(token, env, host, 0)?,
                        }
                    } else if let Ok(n) = word.parse::<Cell>() {
                        match &mut self.compiling {
                            Some(def) => def.ops.push(Op::Lit(n)),
                            None => self.stack.push(n),
                        }
                    } else {
                        return Err(self.undefined(&word, host));
                    }
                }
            }
        }
        Ok(())
    }

    /// Place a string literal and push (or compile pushes of) its pair.
    ///
    /// Compiled strings go into the dictionary's data space, where they
    /// outlive the line; interpreted strings go into the transient region
    /// past HERE, each literal after the previous one so a single line can
    /// stage several.
    fn string_literal(&mut self, text: &[u8], env: &mut SharedEnv) -> Result<(), VmTrap> {
        let addr = if self.compiling.is_some() {
            self.here
        } else {
            self.here + PAD_OFFSET + self.pad_cursor
        };
        if let Err(e) = env.memory.write(addr as u32, text) {
            return Err(self.trap(Status::Unknown, e.to_string()));
        }
        let len = text.len() as Cell;
        if let Some(def) = &mut self.compiling {
            def.ops.push(Op::Lit(addr));
            def.ops.push(Op::Lit(len));
            self.here += len;
        } else {
            self.stack.push(addr);
            self.stack.push(len);
            self.pad_cursor += len;
        }
        Ok(())
    }

    /// Close a colon definition: encode it as a code unit, stage the bytes
    /// in shared memory and install them through the loader.
    fn finish_definition(
        &mut self,
        env: &mut SharedEnv,
        host: &mut dyn Host,
    ) -> Result<(), VmTrap> {
        let Some(def) = self.compiling.take() else {
            return Err(self.trap(Status::Unknown, "';' outside a definition"));
        };
        let unit = CodeUnit::new(vec![CodeBlock::new(def.ops)]);
        let bytes = unit.encode();
        let staging = (self.here + PAD_OFFSET + self.pad_cursor) as u32;
        if let Err(e) = env.memory.write(staging, &bytes) {
            return Err(self.trap(Status::Unknown, e.to_string()));
        }

        let token = env.table.len() as u32;
        if let Err(e) = host.load(env, staging, bytes.len() as u32) {
            return Err(self.trap(Status::Unknown, format!("load failed: {e}")));
        }
        self.dict.insert(def.name, token);
        Ok(())
    }

    fn exec_token(
        &mut self,
        token: u32,
        env: &mut SharedEnv,
        host: &mut dyn Host,
        depth: usize,
    ) -> Result<(), VmTrap> {
        if depth > MAX_DEPTH {
            return Err(self.trap(Status::Unknown, "execution depth exceeded"));
        }
        let block = match env.table.get(token) {
            Some(block) => block.clone(),
            None => {
                return Err(self.trap(
                    Status::Unknown,
                    format!("invalid execution token {token}"),
                ));
            }
        };
        for op in block.ops {
            match op {
                Op::Lit(value) => self.stack.push(value),
                Op::Call(target) => self.exec_token(target, env, host, depth + 1)?,
                Op::Prim(prim) => self.exec_prim(prim, env, host, depth)?,
            }
        }
        Ok(())
    }

    fn exec_prim(
        &mut self,
        prim: u8,
        env: &mut SharedEnv,
        host: &mut dyn Host,
        depth: usize,
    ) -> Result<(), VmTrap> {
        let Some(prim) = Prim::from_u8(prim) else {
            return Err(self.trap(Status::Unknown, format!("invalid primitive {prim}")));
        };
        match prim {
            Prim::Add => self.binary(|a, b| a.wrapping_add(b))?,
            Prim::Sub => self.binary(|a, b| a.wrapping_sub(b))?,
            Prim::Mul => self.binary(|a, b| a.wrapping_mul(b))?,
            Prim::Div => {
                let b = self.pop1()?;
                let a = self.pop1()?;
                if b == 0 {
                    return Err(self.trap(Status::Unknown, "division by zero"));
                }
                self.stack.push(a.wrapping_div(b));
            }
            Prim::Mod => {
                let b = self.pop1()?;
                let a = self.pop1()?;
                if b == 0 {
                    return Err(self.trap(Status::Unknown, "division by zero"));
                }
                self.stack.push(a.wrapping_rem(b));
            }
            Prim::Dup => {
                let a = self.pop1()?;
                self.stack.push(a);
                self.stack.push(a);
            }
            Prim::Drop => {
                self.pop1()?;
            }
            Prim::Swap => {
                let b = self.pop1()?;
                let a = self.pop1()?;
                self.stack.push(b);
                self.stack.push(a);
            }
            Prim::Over => {
                let b = self.pop1()?;
                let a = self.pop1()?;
                self.stack.push(a);
                self.stack.push(b);
                self.stack.push(a);
            }
            Prim::Dot => {
                let value = self.pop1()?;
                for byte in format!("{value} ").bytes() {
                    host.emit(byte);
                }
            }
            Prim::Emit => {
                let value = self.pop1()?;
                let c = char::from_u32(value as u32).unwrap_or('\u{fffd}');
                let mut scratch = [0u8; 4];
                for byte in c.encode_utf8(&mut scratch).bytes() {
                    host.emit(byte);
                }
            }
            Prim::Cr => host.emit(b'\n'),
            Prim::Key => {
                let byte = host.key();
                self.stack.push(byte as Cell);
            }
            Prim::Execute => {
                let token = self.pop1()?;
                self.exec_token(token as u32, env, host, depth + 1)?;
            }
            Prim::Scall => host.call(self, env),
            Prim::Bye => return Err(self.trap(Status::Bye, "bye")),
            Prim::Quit => return Err(self.trap(Status::Quit, "quit")),
            Prim::Abort => return Err(self.trap(Status::Abort, "abort")),
        }
        Ok(())
    }
}

impl VmAccess for Machine {
    fn push(&mut self, value: Cell) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Option<Cell> {
        self.stack.pop()
    }

    fn here(&self) -> Cell {
        self.here
    }
}

impl Vm for Machine {
    fn run(
        &mut self,
        env: &mut SharedEnv,
        host: &mut dyn Host,
        silent: bool,
    ) -> Result<Cell, VmTrap> {
        loop {
            let line = {
                let dest = match env.memory.slice_mut(TIB_ADDR, TIB_SIZE) {
                    Ok(dest) => dest,
                    Err(e) => return Err(self.trap(Status::Unknown, e.to_string())),
                };
                let n = host.read(dest);
                if n == 0 {
                    self.err = Status::EndOfInput.code();
                    return Ok(self.err);
                }
                dest[..n].to_vec()
            };
            self.interpret_line(&line, env, host)?;
            if !silent && self.compiling.is_none() {
                for byte in b" ok\n" {
                    host.emit(*byte);
                }
            }
        }
    }

    fn error(&self) -> Cell {
        self.err
    }
}
