//! Edit scripts: byte-level instructions that rebuild a target from a base.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One edit instruction, applied left to right against a cursor into the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    /// Skip one base byte.
    Delete,
    /// Emit one new byte.
    Insert(u8),
    /// Emit the next `n` base bytes unchanged.
    Copy(u32),
}

/// Errors raised when a script does not fit the base it is applied to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("copy of {count} bytes at offset {at} runs past base of {base_len} bytes")]
    CopyOutOfRange { at: usize, count: usize, base_len: usize },

    #[error("delete at offset {at} runs past base of {base_len} bytes")]
    DeleteOutOfRange { at: usize, base_len: usize },

    #[error("script left {remaining} base bytes unconsumed")]
    Unconsumed { remaining: usize },
}

/// Ordered sequence of [`EditOp`]s transforming a base into a target.
///
/// A valid script consumes the whole base exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditScript {
    ops: Vec<EditOp>,
}

impl EditScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<EditOp>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[EditOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: EditOp) {
        match op {
            EditOp::Copy(0) => {}
            EditOp::Copy(n) => self.push_copy(n as usize),
            other => self.ops.push(other),
        }
    }

    /// Append a copy run, merging with a preceding one.
    pub fn push_copy(&mut self, mut count: usize) {
        while count > 0 {
            if let Some(EditOp::Copy(prev)) = self.ops.last_mut() {
                let room = (u32::MAX - *prev) as usize;
                if room > 0 {
                    let step = room.min(count);
                    *prev += step as u32;
                    count -= step;
                    continue;
                }
            }
            let step = count.min(u32::MAX as usize);
            self.ops.push(EditOp::Copy(step as u32));
            count -= step;
        }
    }

    /// Number of inserted plus deleted bytes.
    pub fn edit_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| !matches!(op, EditOp::Copy(_)))
            .count()
    }

    /// Length of the target this script produces.
    pub fn target_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                EditOp::Delete => 0,
                EditOp::Insert(_) => 1,
                EditOp::Copy(n) => *n as usize,
            })
            .sum()
    }

    /// Rebuild the target from `base`.
    pub fn apply(&self, base: &[u8]) -> Result<Vec<u8>, ScriptError> {
        let mut out = Vec::with_capacity(self.target_len());
        let mut pos = 0usize;

        for op in &self.ops {
            match *op {
                EditOp::Delete => {
                    if pos >= base.len() {
                        return Err(ScriptError::DeleteOutOfRange {
                            at: pos,
                            base_len: base.len(),
                        });
                    }
                    pos += 1;
                }
                EditOp::Insert(byte) => out.push(byte),
                EditOp::Copy(n) => {
                    let n = n as usize;
                    let end = pos
                        .checked_add(n)
                        .filter(|end| *end <= base.len())
                        .ok_or(ScriptError::CopyOutOfRange {
                            at: pos,
                            count: n,
                            base_len: base.len(),
                        })?;
                    out.extend_from_slice(&base[pos..end]);
                    pos = end;
                }
            }
        }

        if pos != base.len() {
            return Err(ScriptError::Unconsumed {
                remaining: base.len() - pos,
            });
        }
        Ok(out)
    }
}
