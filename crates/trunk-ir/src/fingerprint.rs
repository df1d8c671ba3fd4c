//! Deterministic structural dump of an operation tree.
//!
//! Two trees with equal fingerprints have the same operations in the same
//! nesting, the same operand wiring, types, attributes, successors, and use
//! counts. Entity indices appear verbatim, so a fingerprint also detects a
//! rewrite that rebuilt an equivalent graph out of fresh entities.

use std::fmt::{self, Write as _};

use crate::context::IrContext;
use crate::refs::{BlockRef, OpRef, RegionRef};

#[derive(Clone, PartialEq, Eq)]
pub struct Fingerprint(Vec<String>);

impl Fingerprint {
    pub fn of(ctx: &IrContext, root: OpRef) -> Self {
        let mut lines = Vec::new();
        print_op(ctx, root, 0, &mut lines);
        Fingerprint(lines)
    }

    pub fn lines(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.0 {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn print_op(ctx: &IrContext, op: OpRef, depth: usize, out: &mut Vec<String>) {
    let data = ctx.op(op);
    let mut line = format!("{:indent$}{op} = {}(", "", ctx.op_name(op), indent = depth * 2);
    for (i, v) in ctx.op_operands(op).iter().enumerate() {
        let sep = if i == 0 { "" } else { ", " };
        let _ = write!(line, "{sep}{v}");
    }
    line.push_str(") -> (");
    for (i, &v) in ctx.op_results(op).iter().enumerate() {
        let sep = if i == 0 { "" } else { ", " };
        let _ = write!(line, "{sep}{v}: {} [{} use(s)]", ctx.value_ty(v), ctx.uses(v).len());
    }
    line.push(')');
    if !data.attributes.is_empty() {
        let _ = write!(line, " {:?}", data.attributes);
    }
    if !data.successors.is_empty() {
        let _ = write!(line, " succ {:?}", data.successors.as_slice());
    }
    if !ctx.is_op_live(op) {
        line.push_str(" <destroyed>");
    }
    out.push(line);

    for &region in &data.regions {
        print_region(ctx, region, depth + 1, out);
    }
}

fn print_region(ctx: &IrContext, region: RegionRef, depth: usize, out: &mut Vec<String>) {
    out.push(format!("{:indent$}{region}", "", indent = depth * 2));
    for &block in &ctx.region(region).blocks {
        print_block(ctx, block, depth + 1, out);
    }
}

fn print_block(ctx: &IrContext, block: BlockRef, depth: usize, out: &mut Vec<String>) {
    let mut line = format!("{:indent$}{block}(", "", indent = depth * 2);
    for (i, &arg) in ctx.block_args(block).iter().enumerate() {
        let sep = if i == 0 { "" } else { ", " };
        let _ = write!(line, "{sep}{arg}: {} [{} use(s)]", ctx.value_ty(arg), ctx.uses(arg).len());
    }
    line.push_str("):");
    out.push(line);
    for &op in &ctx.block(block).ops {
        print_op(ctx, op, depth + 1, out);
    }
}
