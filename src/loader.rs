//! Dynamic loader
//!
//! Installs a compiled code unit, already placed in shared memory by the
//! VM's compiler or by the embedder, into the shared dispatch table. The
//! VM's own compiler relies on this to inject new definitions into the
//! running instance without restarting it or duplicating its memory.
//!
//! Installation is all-or-nothing: the unit is parsed and its call targets
//! validated in full before the table is touched, so a corrupt or
//! incompatible unit can never leave the table partially extended.

use tracing::debug;

use crate::error::LoadError;
use crate::memory::Memory;
use crate::shared::SharedEnv;
use crate::unit::{CodeUnit, Op};

/// Loader behavior probed from the environment.
///
/// Probed from the capabilities of the memory implementation, not from a
/// version string, so the workaround stays local to the one place copies
/// matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderCaps {
    /// Copy code-unit byte ranges before parsing. Required when the memory's
    /// backing buffer can be remapped while the unit is being constructed.
    pub copy_code_ranges: bool,
}

impl LoaderCaps {
    /// Probe the capabilities required for `memory`
    pub fn detect(memory: &Memory) -> Self {
        LoaderCaps {
            copy_code_ranges: !memory.grows_in_place(),
        }
    }
}

/// Parse the byte range at `offset`/`length` in shared memory as a code
/// unit and append its words to the shared table.
///
/// Returns the execution token of the first installed word. Errors are
/// returned to the caller (never swallowed) and leave the table length
/// unchanged.
pub fn load(
    env: &mut SharedEnv,
    caps: &LoaderCaps,
    offset: u32,
    length: u32,
) -> Result<u32, LoadError> {
    let unit = if caps.copy_code_ranges {
        let range = env.memory.slice(offset, length)?;
        let mut data = Vec::with_capacity(length as usize);
        for &byte in range {
            data.push(byte);
        }
        CodeUnit::parse(&data)?
    } else {
        CodeUnit::parse(env.memory.slice(offset, length)?)?
    };

    // A unit may call existing table entries or its own words-to-be, but
    // nothing past the post-install table length.
    let limit = (env.table.len() + unit.words.len()) as u32;
    for word in &unit.words {
        for op in &word.ops {
            if let Op::Call(target) = op {
                if *target >= limit {
                    return Err(LoadError::InvalidCallTarget {
                        target: *target,
                        limit,
                    });
                }
            }
        }
    }

    let count = unit.words.len();
    let base = env.table.extend(unit.words);
    debug!(base, count, "installed code unit");
    Ok(base)
}
