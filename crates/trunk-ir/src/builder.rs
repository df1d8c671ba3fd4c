//! Positioned operation construction.

use crate::context::{IrContext, OperationDataBuilder};
use crate::refs::{BlockRef, OpRef};
use crate::types::TypeInterner;

/// Where newly built operations are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpRef),
    After(OpRef),
    BlockStart(BlockRef),
    BlockEnd(BlockRef),
}

impl InsertPoint {
    /// Attach the detached `op` here and return the point that keeps later
    /// insertions after it.
    ///
    /// Returns `None` if the anchor operation is itself detached, in which
    /// case `op` stays detached.
    pub fn insert(self, ctx: &mut IrContext, op: OpRef) -> Option<InsertPoint> {
        match self {
            InsertPoint::Before(anchor) => {
                let (block, index) = ctx.op_position(anchor)?;
                ctx.insert_op_at(block, index, op);
                Some(self)
            }
            InsertPoint::After(anchor) => {
                let (block, index) = ctx.op_position(anchor)?;
                ctx.insert_op_at(block, index + 1, op);
                Some(InsertPoint::After(op))
            }
            InsertPoint::BlockStart(block) => {
                ctx.insert_op_at(block, 0, op);
                Some(InsertPoint::After(op))
            }
            InsertPoint::BlockEnd(block) => {
                ctx.push_op(block, op);
                Some(self)
            }
        }
    }
}

/// Builds operations at an insertion point and remembers what it built.
pub struct OpBuilder<'a> {
    ctx: &'a mut IrContext,
    insert_point: InsertPoint,
    created: Vec<OpRef>,
}

impl<'a> OpBuilder<'a> {
    pub fn new(ctx: &'a mut IrContext, insert_point: InsertPoint) -> Self {
        Self {
            ctx,
            insert_point,
            created: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &IrContext {
        self.ctx
    }

    pub fn types(&self) -> &TypeInterner {
        &self.ctx.types
    }

    pub fn insert_point(&self) -> InsertPoint {
        self.insert_point
    }

    pub fn set_insert_point(&mut self, insert_point: InsertPoint) {
        self.insert_point = insert_point;
    }

    /// Create an operation and place it at the insertion point.
    pub fn create(&mut self, builder: OperationDataBuilder) -> OpRef {
        let data = builder.build(self.ctx);
        let op = self.ctx.create_op(data);
        if let Some(next) = self.insert_point.insert(self.ctx, op) {
            self.insert_point = next;
        }
        self.created.push(op);
        op
    }

    /// Operations created so far, in creation order.
    pub fn created(&self) -> &[OpRef] {
        &self.created
    }

    pub fn into_created(self) -> Vec<OpRef> {
        self.created
    }
}
