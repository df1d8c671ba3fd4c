//! Error types for dialect conversion.
//!
//! [`ConversionError`] is what a driver returns. [`RewriteError`] is the
//! recoverable failure a pattern sees from the rewriter; patterns normally
//! turn it into a match failure and let the driver try the next pattern.

use derive_more::{Display, Error, From};
use trunk_ir::{OpName, OpRef, RegionRef, TypeRef, ValueRef};

pub type ConversionResult<T> = Result<T, ConversionError>;

/// Why a conversion failed. The IR is unchanged when a driver returns this.
#[derive(Clone, Display, Debug, Error, PartialEq)]
#[display("{kind}")]
pub struct ConversionError {
    kind: Box<ConversionErrorKind>,
}

impl<E> From<E> for ConversionError
where
    ConversionErrorKind: From<E>,
{
    fn from(error: E) -> Self {
        ConversionError {
            kind: Box::new(ConversionErrorKind::from(error)),
        }
    }
}

impl ConversionError {
    pub fn kind(&self) -> &ConversionErrorKind {
        &self.kind
    }

    /// Whether this error reports a broken rewrite contract rather than an
    /// ordinary "could not legalize".
    pub fn is_consistency_violation(&self) -> bool {
        matches!(*self.kind, ConversionErrorKind::Consistency(_))
    }
}

#[derive(Clone, Display, Debug, From, PartialEq)]
pub enum ConversionErrorKind {
    /// Full conversion: `op` is still not legal once every pattern was tried.
    #[display("failed to legalize operation `{name}` ({op})")]
    FailedToLegalize { op: OpRef, name: OpName },

    /// Partial conversion: `op` is explicitly illegal and no pattern helped.
    #[display("failed to legalize operation `{name}` ({op}) that was explicitly marked illegal")]
    IllegalOperation { op: OpRef, name: OpName },

    #[display("{region} contains {count} unreachable block(s)")]
    UnreachableBlocks { region: RegionRef, count: usize },

    #[display("failed to materialize conversion for {value} from {actual} back to {expected}")]
    Materialization {
        value: ValueRef,
        actual: TypeRef,
        expected: TypeRef,
    },

    #[display("conversion invariant violated: {_0}")]
    #[from]
    Consistency(ConsistencyViolation),
}

/// A pattern or rewrite broke the conversion contract.
#[derive(Clone, Display, Debug, Error, PartialEq, Eq)]
pub enum ConsistencyViolation {
    #[display("pattern `{pattern}` succeeded on {op} without replacing or updating it")]
    RootNotRewritten { pattern: &'static str, op: OpRef },

    #[display("{value} was erased but still has {uses} live use(s)")]
    ErasedValueInUse { value: ValueRef, uses: usize },

    #[display("replacement chain of {value} forms a cycle")]
    MappingCycle { value: ValueRef },
}

/// A rewriter request that could not be served.
#[derive(Clone, Display, Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[display("{value} was erased without a replacement")]
    Erased { value: ValueRef },

    #[display("type {ty} of {value} has no conversion")]
    UnconvertibleType { value: ValueRef, ty: TypeRef },

    #[display("no materialization produced a value of type {ty} for {value}")]
    Materialization { value: ValueRef, ty: TypeRef },

    #[display("replacement chain of {value} forms a cycle")]
    MappingCycle { value: ValueRef },
}

/// Misconfiguration of a [`ConversionTarget`](crate::ConversionTarget).
#[derive(Clone, Display, Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[display("`{name}` must be legal or dynamically legal before it can be recursively legal")]
    NotLegal { name: OpName },
}
