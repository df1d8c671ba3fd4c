//! Shared fixtures for conversion tests.
#![allow(dead_code)]

use std::ops::ControlFlow;

use trunk_ir::validation::validate_use_chains;
use trunk_ir::walk::{self, WalkAction};
use trunk_ir::{
    BlockData, BlockRef, Fingerprint, IrContext, Location, OpName, OpRef, OperationDataBuilder,
    RegionData, RegionRef, Span, TypeDataBuilder, TypeRef, ValueRef,
};
use trunk_ir_conversion::{ConversionPattern, ConversionRewriter};

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// A `test.module` with a single-block body.
pub struct TestIr {
    pub ctx: IrContext,
    pub loc: Location,
    pub module: OpRef,
    pub body: BlockRef,
}

impl TestIr {
    pub fn new() -> Self {
        let mut ctx = IrContext::new();
        let loc = Location::new(ctx.paths.intern("file:///test.ir"), Span::default());
        let body = ctx.create_block(BlockData::new(loc, []));
        let region = ctx.create_region(RegionData::new(loc, [body]));
        let data = OperationDataBuilder::named(loc, OpName::new("test", "module"))
            .region(region)
            .build(&mut ctx);
        let module = ctx.create_op(data);
        Self {
            ctx,
            loc,
            module,
            body,
        }
    }

    pub fn ty(&self, dialect: &'static str, name: &'static str) -> TypeRef {
        self.ctx.types.intern(TypeDataBuilder::new(dialect, name).build())
    }

    pub fn body_region(&self) -> RegionRef {
        self.ctx.op(self.module).regions[0]
    }

    /// Append a block to `region`.
    pub fn block(&mut self, region: RegionRef, arg_types: &[TypeRef]) -> BlockRef {
        let block = self
            .ctx
            .create_block(BlockData::new(self.loc, arg_types.iter().copied()));
        self.ctx.push_block(region, block);
        block
    }

    /// Append `name(operands) -> results` to `block`.
    pub fn op(
        &mut self,
        block: BlockRef,
        name: OpName,
        operands: &[ValueRef],
        results: &[TypeRef],
    ) -> OpRef {
        self.push(
            block,
            OperationDataBuilder::named(self.loc, name)
                .operands(operands.iter().copied())
                .results(results.iter().copied()),
        )
    }

    pub fn push(&mut self, block: BlockRef, builder: OperationDataBuilder) -> OpRef {
        let data = builder.build(&mut self.ctx);
        let op = self.ctx.create_op(data);
        self.ctx.push_op(block, op);
        op
    }

    /// Append `name` with a single-block region, returning the op and the
    /// inner block.
    pub fn op_with_body(&mut self, block: BlockRef, name: OpName) -> (OpRef, BlockRef) {
        let inner = self.ctx.create_block(BlockData::new(self.loc, []));
        let region = self.ctx.create_region(RegionData::new(self.loc, [inner]));
        let op = self.push(block, OperationDataBuilder::named(self.loc, name).region(region));
        (op, inner)
    }

    pub fn result(&self, op: OpRef) -> ValueRef {
        self.ctx.op_result(op, 0)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.ctx, self.module)
    }

    /// Live operations named `name` anywhere under the module.
    pub fn ops_named(&self, name: OpName) -> Vec<OpRef> {
        let mut found = Vec::new();
        let _ = walk::walk_op::<()>(&self.ctx, self.module, &mut |op| {
            if self.ctx.op_name(op) == name {
                found.push(op);
            }
            ControlFlow::Continue(WalkAction::Advance)
        });
        found
    }

    pub fn assert_valid(&self) {
        assert_eq!(validate_use_chains(&self.ctx, self.module), Ok(()));
    }
}

/// Replaces one operation with a fresh operation of another name, keeping
/// operands and result types.
pub struct Rename {
    pub from: OpName,
    pub to: OpName,
    pub benefit: u16,
}

impl Rename {
    pub fn new(from: OpName, to: OpName) -> Self {
        Self { from, to, benefit: 1 }
    }
}

impl ConversionPattern for Rename {
    fn match_and_rewrite(
        &self,
        op: OpRef,
        operands: &[ValueRef],
        rewriter: &mut ConversionRewriter<'_>,
    ) -> bool {
        let loc = rewriter.ctx().op(op).location;
        let results = rewriter.ctx().op_result_types(op).to_vec();
        let new_op = rewriter.create_op(
            OperationDataBuilder::named(loc, self.to)
                .operands(operands.iter().copied())
                .results(results),
        );
        rewriter.replace_op_with(op, new_op);
        true
    }

    fn root(&self) -> Option<OpName> {
        Some(self.from)
    }

    fn benefit(&self) -> u16 {
        self.benefit
    }

    fn name(&self) -> &'static str {
        "Rename"
    }
}

type RewriteFn = dyn Fn(OpRef, &[ValueRef], &mut ConversionRewriter<'_>) -> bool;

/// A pattern defined by a closure.
pub struct FnPattern {
    pub root: OpName,
    pub benefit: u16,
    pub name: &'static str,
    pub rewrite: Box<RewriteFn>,
}

impl FnPattern {
    pub fn new(
        name: &'static str,
        root: OpName,
        rewrite: impl Fn(OpRef, &[ValueRef], &mut ConversionRewriter<'_>) -> bool + 'static,
    ) -> Self {
        Self {
            root,
            benefit: 1,
            name,
            rewrite: Box::new(rewrite),
        }
    }

    pub fn with_benefit(mut self, benefit: u16) -> Self {
        self.benefit = benefit;
        self
    }
}

impl ConversionPattern for FnPattern {
    fn match_and_rewrite(
        &self,
        op: OpRef,
        operands: &[ValueRef],
        rewriter: &mut ConversionRewriter<'_>,
    ) -> bool {
        (self.rewrite)(op, operands, rewriter)
    }

    fn root(&self) -> Option<OpName> {
        Some(self.root)
    }

    fn benefit(&self) -> u16 {
        self.benefit
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
