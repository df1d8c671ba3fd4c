//! TrunkIR: arena-based mutable IR.
//!
//! Operations, blocks, regions, and values live in an [`IrContext`] and are
//! addressed by small copyable indices. Every value keeps an explicit use
//! list, and destroyed entities are tombstoned rather than reused, so passes
//! can hold indices across mutations and check liveness afterwards.

pub mod builder;
pub mod context;
pub mod fingerprint;
pub mod location;
pub mod refs;
pub mod symbol;
pub mod types;
pub mod validation;
pub mod walk;

pub use builder::{InsertPoint, OpBuilder};
pub use context::{
    BlockArgData, BlockData, IrContext, IrMapping, OperationData, OperationDataBuilder, RegionData,
    Use, ValueData,
};
pub use fingerprint::Fingerprint;
pub use location::{Location, PathInterner, Span};
pub use refs::{BlockRef, OpRef, PathRef, RegionRef, TypeRef, ValueDef, ValueRef};
pub use symbol::{OpName, Symbol};
pub use types::{Attribute, AttributeKind, TypeData, TypeDataBuilder, TypeInterner, TypeKind};
pub use walk::WalkAction;

// Re-export smallvec for downstream crates and the `symbols!` macro users.
pub use smallvec;
