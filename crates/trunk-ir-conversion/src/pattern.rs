//! Conversion patterns.

use std::rc::Rc;

use trunk_ir::{OpName, OpRef, ValueRef};

use crate::rewriter::ConversionRewriter;
use crate::type_converter::TypeConverter;

/// A rewrite that turns one operation into legal IR.
///
/// # Arguments
///
/// - `op`: The operation to convert. It is never mutated directly; all
///   changes go through `rewriter` so they can be rolled back.
/// - `operands`: `op`'s operands after earlier replacements. If the pattern
///   has a type converter, their types are already converted.
/// - `rewriter`: Records mutations.
///
/// # Return Value
///
/// Return `true` after replacing, erasing, or updating `op` in place through
/// the rewriter. Return `false` if the pattern does not apply; anything it
/// recorded before that is discarded.
pub trait ConversionPattern {
    fn match_and_rewrite(
        &self,
        op: OpRef,
        operands: &[ValueRef],
        rewriter: &mut ConversionRewriter<'_>,
    ) -> bool;

    /// The only operation name this pattern applies to, or `None` for any.
    fn root(&self) -> Option<OpName> {
        None
    }

    /// Patterns with a higher benefit are tried first.
    fn benefit(&self) -> u16 {
        1
    }

    /// Converter for operand types. When present, the driver hands the
    /// pattern operands already cast to their converted types.
    fn type_converter(&self) -> Option<&Rc<TypeConverter>> {
        None
    }

    /// Whether this pattern may be applied to operations it created itself
    /// while it is still running. Patterns that do not say so are blocked
    /// from recursing.
    fn has_bounded_rewrite_recursion(&self) -> bool {
        false
    }

    /// Name used in logs and error reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Patterns collected before a conversion, in insertion order.
#[derive(Default)]
pub struct ConversionPatternSet {
    patterns: Vec<Box<dyn ConversionPattern>>,
}

impl ConversionPatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern, builder style.
    pub fn add(mut self, pattern: impl ConversionPattern + 'static) -> Self {
        self.push(pattern);
        self
    }

    /// Add a pattern in place.
    pub fn push(&mut self, pattern: impl ConversionPattern + 'static) {
        self.patterns.push(Box::new(pattern));
    }

    /// Number of patterns added so far.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Order the patterns for application: higher benefit first, ties in
    /// insertion order.
    pub fn freeze(mut self) -> FrozenPatternSet {
        self.patterns.sort_by_key(|p| std::cmp::Reverse(p.benefit()));
        FrozenPatternSet {
            patterns: self.patterns,
        }
    }
}

/// Immutable, ordered pattern set shared by conversion drivers.
pub struct FrozenPatternSet {
    patterns: Vec<Box<dyn ConversionPattern>>,
}

impl FrozenPatternSet {
    /// Patterns applicable to `name`, in application order, with a stable
    /// index identifying each.
    pub fn patterns_for(
        &self,
        name: OpName,
    ) -> impl Iterator<Item = (usize, &dyn ConversionPattern)> + '_ {
        self.patterns
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.root().is_none_or(|root| root == name))
            .map(|(i, p)| (i, &**p))
    }

    /// Number of patterns, whatever their root.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
