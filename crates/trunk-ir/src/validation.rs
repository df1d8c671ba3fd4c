//! Use-chain consistency checks.
//!
//! The use lists stored in [`IrContext`] must mirror the operands of live
//! operations exactly, and no live operand may refer to a value whose
//! defining operation or block was destroyed. Rewrites that stage and roll
//! back mutations rely on both properties.

use std::ops::ControlFlow;

use derive_more::{Display, Error};

use crate::context::IrContext;
use crate::refs::{OpRef, ValueDef, ValueRef};
use crate::walk::{self, WalkAction};

#[derive(Clone, Debug, PartialEq, Eq, Display, Error)]
pub enum UseChainError {
    #[display("operand #{index} of {user} uses {value} but the use list has no entry for it")]
    MissingUse {
        user: OpRef,
        index: u32,
        value: ValueRef,
    },
    #[display("use list of {value} names operand #{index} of {user}, which does not refer to it")]
    StaleUse {
        user: OpRef,
        index: u32,
        value: ValueRef,
    },
    #[display("operand #{index} of {user} uses {value}, defined at destroyed {def}")]
    DeadDefinition {
        user: OpRef,
        index: u32,
        value: ValueRef,
        def: ValueDef,
    },
}

/// Check every operation nested in (and including) `root`.
pub fn validate_use_chains(ctx: &IrContext, root: OpRef) -> Result<(), Vec<UseChainError>> {
    let mut errors = Vec::new();
    let mut defined: Vec<ValueRef> = Vec::new();

    let _ = walk::walk_op::<()>(ctx, root, &mut |op| {
        for (idx, &value) in ctx.op_operands(op).iter().enumerate() {
            if !ctx.uses(value).iter().any(|u| u.user == op && u.operand_index == idx as u32) {
                errors.push(UseChainError::MissingUse {
                    user: op,
                    index: idx as u32,
                    value,
                });
            }
            let def = ctx.value_def(value);
            let live = match def {
                ValueDef::OpResult(owner, _) => ctx.is_op_live(owner),
                ValueDef::BlockArg(owner, _) => ctx.is_block_live(owner),
            };
            if !live {
                errors.push(UseChainError::DeadDefinition {
                    user: op,
                    index: idx as u32,
                    value,
                    def,
                });
            }
        }
        defined.extend_from_slice(ctx.op_results(op));
        for &region in &ctx.op(op).regions {
            for &block in &ctx.region(region).blocks {
                defined.extend_from_slice(ctx.block_args(block));
            }
        }
        ControlFlow::Continue(WalkAction::Advance)
    });

    for value in defined {
        for u in ctx.uses(value) {
            let points_back = ctx.is_op_live(u.user)
                && ctx.op_operands(u.user).get(u.operand_index as usize) == Some(&value);
            if !points_back {
                errors.push(UseChainError::StaleUse {
                    user: u.user,
                    index: u.operand_index,
                    value,
                });
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
