//! Dialect conversion for TrunkIR.
//!
//! A conversion rewrites operations until every one of them is legal for a
//! [`ConversionTarget`], using a set of [`ConversionPattern`]s and an optional
//! [`TypeConverter`]. All mutations go through a [`ConversionRewriter`], which
//! logs each change so that a failed pattern (or a failed conversion as a
//! whole) is undone exactly, leaving the IR as it was before the attempt.
//!
//! Three drivers share that machinery:
//!
//! - [`apply_partial_conversion`] converts what it can and only fails on
//!   operations the target explicitly marks illegal.
//! - [`apply_full_conversion`] requires every operation to end up legal.
//! - [`apply_analysis_conversion`] reports which operations would convert and
//!   always rolls back.

pub mod conversion_target;
pub mod driver;
pub mod error;
mod mapping;
pub mod pattern;
pub mod rewriter;
pub mod signature_conversion;
pub mod type_converter;

pub use conversion_target::{
    ConversionTarget, IllegalOp, LegalOpDetails, LegalizationAction, Legality,
};
pub use driver::{apply_analysis_conversion, apply_full_conversion, apply_partial_conversion};
pub use error::{
    ConsistencyViolation, ConversionError, ConversionErrorKind, ConversionResult, RewriteError,
    TargetError,
};
pub use pattern::{ConversionPattern, ConversionPatternSet, FrozenPatternSet};
pub use rewriter::{ConversionRewriter, MatchFailure, OpModifier};
pub use signature_conversion::{
    FunctionSignatureConversion, FunctionType, InputMapping, SignatureConversion,
};
pub use type_converter::{
    AttributeConversionResult, ConversionCx, MaterializationKind, RuleOutcome, TypeConverter,
    TypeList, unrealized_cast,
};
