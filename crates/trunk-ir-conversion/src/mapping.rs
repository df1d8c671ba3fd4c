//! Replacement chains for values.

use std::collections::HashMap;

use trunk_ir::{IrContext, TypeRef, ValueRef};

use crate::error::RewriteError;

/// Maps a value to its replacement. `None` marks a value erased without one.
///
/// Chains are followed transitively: if `a -> b` and `b -> c`, the current
/// replacement of `a` is `c`.
#[derive(Debug, Default)]
pub(crate) struct ValueMapping {
    map: HashMap<ValueRef, Option<ValueRef>>,
}

impl ValueMapping {
    /// Record `from -> to` and return the entry it overwrote, so the change
    /// can be undone with [`restore`](Self::restore).
    pub(crate) fn map(&mut self, from: ValueRef, to: Option<ValueRef>) -> Option<Option<ValueRef>> {
        self.map.insert(from, to)
    }

    pub(crate) fn restore(&mut self, from: ValueRef, previous: Option<Option<ValueRef>>) {
        match previous {
            Some(to) => self.map.insert(from, to),
            None => self.map.remove(&from),
        };
    }

    /// `value` followed by each replacement in turn.
    pub(crate) fn chain(&self, value: ValueRef) -> Result<Vec<ValueRef>, RewriteError> {
        let mut chain = vec![value];
        let mut current = value;
        loop {
            match self.map.get(&current) {
                None => return Ok(chain),
                Some(None) => return Err(RewriteError::Erased { value }),
                Some(&Some(next)) => {
                    if chain.len() > self.map.len() {
                        return Err(RewriteError::MappingCycle { value });
                    }
                    chain.push(next);
                    current = next;
                }
            }
        }
    }

    /// The end of `value`'s replacement chain.
    pub(crate) fn lookup(&self, value: ValueRef) -> Result<ValueRef, RewriteError> {
        let chain = self.chain(value)?;
        Ok(chain[chain.len() - 1])
    }

    /// The last value in `value`'s chain whose type is `ty`, or the end of
    /// the chain if none has it.
    pub(crate) fn lookup_with_type(
        &self,
        ctx: &IrContext,
        value: ValueRef,
        ty: TypeRef,
    ) -> Result<ValueRef, RewriteError> {
        let chain = self.chain(value)?;
        Ok(chain
            .iter()
            .rev()
            .copied()
            .find(|&v| ctx.value_ty(v) == ty)
            .unwrap_or(chain[chain.len() - 1]))
    }
}
