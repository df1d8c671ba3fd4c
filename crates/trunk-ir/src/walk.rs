//! Traversal over nested operations and region control flow.

use std::collections::HashSet;
use std::ops::ControlFlow;

use crate::context::IrContext;
use crate::refs::{BlockRef, OpRef, RegionRef};

/// Controls whether a walk descends into the current operation's regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Advance,
    Skip,
}

/// Pre-order walk of every operation in a region.
pub fn walk_region<B>(
    ctx: &IrContext,
    region: RegionRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    for &block in &ctx.region(region).blocks {
        walk_block(ctx, block, f)?;
    }
    ControlFlow::Continue(())
}

pub fn walk_block<B>(
    ctx: &IrContext,
    block: BlockRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    for &op in &ctx.block(block).ops {
        walk_op(ctx, op, f)?;
    }
    ControlFlow::Continue(())
}

/// Visit `op`, then its nested regions unless `f` answers [`WalkAction::Skip`].
pub fn walk_op<B>(
    ctx: &IrContext,
    op: OpRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    match f(op)? {
        WalkAction::Skip => return ControlFlow::Continue(()),
        WalkAction::Advance => {}
    }
    for &region in &ctx.op(op).regions {
        walk_region(ctx, region, f)?;
    }
    ControlFlow::Continue(())
}

/// Every operation strictly nested inside `op`, in pre-order.
pub fn nested_ops(ctx: &IrContext, op: OpRef) -> Vec<OpRef> {
    let mut out = Vec::new();
    for &region in &ctx.op(op).regions {
        let _ = walk_region::<()>(ctx, region, &mut |nested| {
            out.push(nested);
            ControlFlow::Continue(WalkAction::Advance)
        });
    }
    out
}

/// Blocks of `region` reachable from its entry block, in reverse post-order.
///
/// Successors are taken from each block's last operation.
pub fn reverse_post_order(ctx: &IrContext, region: RegionRef) -> Vec<BlockRef> {
    let Some(&entry) = ctx.region(region).blocks.first() else {
        return Vec::new();
    };

    let mut visited = HashSet::from([entry]);
    let mut post_order = Vec::new();
    // (block, index of the next successor to visit)
    let mut stack = vec![(entry, 0usize)];
    while let Some(&(block, next)) = stack.last() {
        if let Some(&succ) = ctx.block_successors(block).get(next) {
            let top = stack.len() - 1;
            stack[top].1 += 1;
            if ctx.block(succ).parent_region == Some(region) && visited.insert(succ) {
                stack.push((succ, 0));
            }
        } else {
            post_order.push(block);
            stack.pop();
        }
    }
    post_order.reverse();
    post_order
}

/// Blocks of `region` that cannot be reached from its entry, in region order.
pub fn unreachable_blocks(ctx: &IrContext, region: RegionRef) -> Vec<BlockRef> {
    let reachable: HashSet<BlockRef> = reverse_post_order(ctx, region).into_iter().collect();
    ctx.region(region)
        .blocks
        .iter()
        .copied()
        .filter(|b| !reachable.contains(b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BlockData, OperationDataBuilder, RegionData};
    use crate::location::{Location, Span};
    use crate::symbol::Symbol;

    fn test_ctx() -> (IrContext, Location) {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("file:///walk.ir");
        (ctx, Location::new(path, Span::new(0, 0)))
    }

    fn push(
        ctx: &mut IrContext,
        loc: Location,
        block: BlockRef,
        name: &'static str,
        succs: &[BlockRef],
    ) -> OpRef {
        let data = OperationDataBuilder::new(loc, Symbol::new("test"), Symbol::new(name))
            .successors(succs.iter().copied())
            .build(ctx);
        let op = ctx.create_op(data);
        ctx.push_op(block, op);
        op
    }

    /// entry -> {left, right} -> exit, plus an orphan block nobody branches to.
    fn diamond(ctx: &mut IrContext, loc: Location) -> (RegionRef, [BlockRef; 5]) {
        let blocks: [BlockRef; 5] =
            std::array::from_fn(|_| ctx.create_block(BlockData::new(loc, [])));
        let [entry, left, right, exit, orphan] = blocks;
        push(ctx, loc, entry, "cond_br", &[left, right]);
        push(ctx, loc, left, "br", &[exit]);
        push(ctx, loc, right, "br", &[exit]);
        push(ctx, loc, exit, "return", &[]);
        push(ctx, loc, orphan, "br", &[exit]);
        let region = ctx.create_region(RegionData::new(loc, [entry, orphan, left, right, exit]));
        (region, blocks)
    }

    #[test]
    fn rpo_visits_dominators_first() {
        let (mut ctx, loc) = test_ctx();
        let (region, [entry, left, right, exit, orphan]) = diamond(&mut ctx, loc);

        let rpo = reverse_post_order(&ctx, region);
        assert_eq!(rpo, vec![entry, right, left, exit]);
        assert!(!rpo.contains(&orphan));
        assert_eq!(unreachable_blocks(&ctx, region), vec![orphan]);
    }

    #[test]
    fn skip_prunes_nested_regions() {
        let (mut ctx, loc) = test_ctx();
        let inner = ctx.create_block(BlockData::new(loc, []));
        let nested = push(&mut ctx, loc, inner, "nested", &[]);
        let inner_region = ctx.create_region(RegionData::new(loc, [inner]));
        let outer_block = ctx.create_block(BlockData::new(loc, []));
        let data = OperationDataBuilder::new(loc, Symbol::new("test"), Symbol::new("wrap"))
            .region(inner_region)
            .build(&mut ctx);
        let wrap = ctx.create_op(data);
        ctx.push_op(outer_block, wrap);
        let after = push(&mut ctx, loc, outer_block, "after", &[]);
        let region = ctx.create_region(RegionData::new(loc, [outer_block]));

        let mut seen = Vec::new();
        let _ = walk_region::<()>(&ctx, region, &mut |op| {
            seen.push(op);
            ControlFlow::Continue(WalkAction::Skip)
        });
        assert_eq!(seen, vec![wrap, after]);
        assert_eq!(nested_ops(&ctx, wrap), vec![nested]);
    }

    #[test]
    fn break_stops_the_walk() {
        let (mut ctx, loc) = test_ctx();
        let block = ctx.create_block(BlockData::new(loc, []));
        let first = push(&mut ctx, loc, block, "a", &[]);
        push(&mut ctx, loc, block, "b", &[]);

        let result = walk_block::<OpRef>(&ctx, block, &mut |op| ControlFlow::Break(op));
        assert_eq!(result, ControlFlow::Break(first));
    }
}
