//! Driver behaviour: pattern application, legality, and rollback.

mod common;

use std::collections::HashSet;

use common::{FnPattern, Rename, TestIr, init_tracing};
use trunk_ir::{
    Attribute, InsertPoint, IrMapping, OpName, OpRef, OperationDataBuilder, Symbol, ValueRef,
};
use trunk_ir_conversion::{
    ConsistencyViolation, ConversionErrorKind, ConversionPatternSet, ConversionTarget,
    FrozenPatternSet, apply_full_conversion, apply_partial_conversion,
};

fn a_op() -> OpName {
    OpName::new("a", "op")
}

fn b_op() -> OpName {
    OpName::new("b", "op")
}

/// `%0 = test.def; %1 = a.op(%0); test.use(%1)`
fn single_a() -> (TestIr, OpRef, OpRef, OpRef) {
    let mut ir = TestIr::new();
    let i32_ty = ir.ty("core", "i32");
    let def = ir.op(ir.body, OpName::new("test", "def"), &[], &[i32_ty]);
    let a = ir.op(ir.body, a_op(), &[ir.result(def)], &[i32_ty]);
    let user = ir.op(ir.body, OpName::new("test", "use"), &[ir.result(a)], &[]);
    (ir, def, a, user)
}

/// `test` and `b` are legal; `a` is left unset.
fn target() -> ConversionTarget {
    let mut target = ConversionTarget::new();
    target.add_legal_dialect("test");
    target.add_legal_dialect("b");
    target
}

fn rename_a_to_b() -> FrozenPatternSet {
    ConversionPatternSet::new()
        .add(Rename::new(a_op(), b_op()))
        .freeze()
}

#[test]
fn full_conversion_rewrites_a_into_b() {
    init_tracing();
    let (mut ir, def, a, user) = single_a();
    let patterns = rename_a_to_b();

    apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &patterns).expect("converts");

    let bs = ir.ops_named(b_op());
    assert_eq!(bs.len(), 1);
    assert!(ir.ops_named(a_op()).is_empty());
    assert!(!ir.ctx.is_op_live(a));
    assert_eq!(ir.ctx.op_operands(bs[0]), &[ir.result(def)]);
    assert_eq!(ir.ctx.op_operands(user), &[ir.result(bs[0])]);
    assert_eq!(ir.ctx.block(ir.body).ops.as_slice(), &[def, bs[0], user]);
    ir.assert_valid();
}

#[test]
fn partial_conversion_rewrites_a_into_b() {
    let (mut ir, _, _, user) = single_a();
    let mut unconverted = HashSet::new();

    apply_partial_conversion(
        &mut ir.ctx,
        &[ir.module],
        &target(),
        &rename_a_to_b(),
        Some(&mut unconverted),
    )
    .expect("converts");

    assert!(unconverted.is_empty());
    let bs = ir.ops_named(b_op());
    assert_eq!(bs.len(), 1);
    assert_eq!(ir.ctx.op_operands(user), &[ir.result(bs[0])]);
    ir.assert_valid();
}

#[test]
fn unset_op_without_pattern_splits_partial_and_full() {
    let (mut ir, _, a, _) = single_a();
    let before = ir.fingerprint();
    let patterns = ConversionPatternSet::new().freeze();

    let mut unconverted = HashSet::new();
    apply_partial_conversion(
        &mut ir.ctx,
        &[ir.module],
        &target(),
        &patterns,
        Some(&mut unconverted),
    )
    .expect("partial conversion tolerates unset operations");
    assert_eq!(unconverted, HashSet::from([a]));
    assert_eq!(ir.fingerprint(), before);

    let err = apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &patterns).unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::FailedToLegalize { op: a, name: a_op() }
    );
    assert_eq!(ir.fingerprint(), before);
}

#[test]
fn explicitly_illegal_op_fails_partial_conversion() {
    let (mut ir, _, a, _) = single_a();
    let before = ir.fingerprint();
    let mut target = target();
    target.add_illegal_op("a", "op");

    let err = apply_partial_conversion(
        &mut ir.ctx,
        &[ir.module],
        &target,
        &ConversionPatternSet::new().freeze(),
        None,
    )
    .unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::IllegalOperation { op: a, name: a_op() }
    );
    assert_eq!(ir.fingerprint(), before);
}

#[test]
fn failed_full_conversion_undoes_earlier_successes() {
    let (mut ir, _, first, _) = single_a();
    let i32_ty = ir.ty("core", "i32");
    let stuck = ir.op(ir.body, OpName::new("c", "op"), &[ir.result(first)], &[i32_ty]);
    let before = ir.fingerprint();

    let err = apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &rename_a_to_b())
        .unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::FailedToLegalize {
            op: stuck,
            name: OpName::new("c", "op"),
        }
    );
    assert_eq!(ir.fingerprint(), before);
    ir.assert_valid();
}

#[test]
fn operation_rule_beats_dialect_rule() {
    let (mut ir, _, _, _) = single_a();
    let mut target = target();
    target.add_illegal_dialect("a");
    target.add_legal_op("a", "op");

    apply_full_conversion(
        &mut ir.ctx,
        &[ir.module],
        &target,
        &ConversionPatternSet::new().freeze(),
    )
    .expect("a.op is legal by its own rule");
}

#[test]
fn recursive_legality_covers_nested_operations() {
    let mut ir = TestIr::new();
    let i32_ty = ir.ty("core", "i32");
    let (wrap, inner) = ir.op_with_body(ir.body, OpName::new("r", "wrap"));
    ir.op(inner, a_op(), &[], &[i32_ty]);

    let mut target = target();
    target.add_illegal_dialect("a");
    target.add_legal_op("r", "wrap");
    target
        .mark_op_recursively_legal("r", "wrap")
        .expect("r.wrap is legal");
    let patterns = ConversionPatternSet::new().freeze();
    apply_full_conversion(&mut ir.ctx, &[ir.module], &target, &patterns)
        .expect("nested a.op is never queried");

    // A predicate can withdraw the grant per instance.
    target
        .mark_op_recursively_legal_if("r", "wrap", move |_, op| Some(op != wrap))
        .expect("r.wrap is legal");
    let err = apply_full_conversion(&mut ir.ctx, &[ir.module], &target, &patterns).unwrap_err();
    assert!(matches!(err.kind(), ConversionErrorKind::FailedToLegalize { .. }));
}

#[test]
fn recursive_legality_requires_a_legal_rule() {
    let mut target = ConversionTarget::new();
    target.add_illegal_op("r", "wrap");
    assert!(target.mark_op_recursively_legal("r", "wrap").is_err());
    assert!(target.mark_op_recursively_legal("r", "unknown").is_err());
}

#[test]
fn pattern_output_that_cannot_be_legalized_falls_back_to_the_next_pattern() {
    let (mut ir, _, _, user) = single_a();
    let patterns = ConversionPatternSet::new()
        .add(Rename::new(a_op(), b_op()))
        .add(Rename {
            benefit: 10,
            ..Rename::new(a_op(), OpName::new("c", "op"))
        })
        .freeze();

    apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &patterns).expect("converts");

    assert!(ir.ops_named(OpName::new("c", "op")).is_empty());
    let bs = ir.ops_named(b_op());
    assert_eq!(bs.len(), 1);
    assert_eq!(ir.ctx.op_operands(user), &[ir.result(bs[0])]);
    ir.assert_valid();
}

#[test]
fn pattern_is_not_reapplied_to_its_own_output() {
    let (mut ir, _, a, _) = single_a();
    let before = ir.fingerprint();
    // Rewrites a.op into another a.op forever unless recursion is cut off.
    let patterns = ConversionPatternSet::new()
        .add(Rename::new(a_op(), a_op()))
        .freeze();

    let mut unconverted = HashSet::new();
    apply_partial_conversion(
        &mut ir.ctx,
        &[ir.module],
        &target(),
        &patterns,
        Some(&mut unconverted),
    )
    .expect("partial conversion");
    assert_eq!(unconverted, HashSet::from([a]));
    assert_eq!(ir.fingerprint(), before);
}

#[test]
fn in_place_update_counts_as_rewriting_the_root() {
    let (mut ir, _, a, _) = single_a();
    let mut target = target();
    target.add_dynamically_legal_op("a", "op", |ctx, op| {
        Some(ctx.op(op).attributes.contains_key(&Symbol::new("done")))
    });
    let patterns = ConversionPatternSet::new()
        .add(FnPattern::new("MarkDone", a_op(), |op, _, rewriter| {
            rewriter.modify_op_in_place(op, |m| {
                m.set_attribute("done", Attribute::Bool(true));
            });
            true
        }))
        .freeze();

    apply_full_conversion(&mut ir.ctx, &[ir.module], &target, &patterns).expect("converts");
    assert!(ir.ctx.is_op_live(a));
    assert_eq!(
        ir.ctx.op(a).attributes.get(&Symbol::new("done")),
        Some(&Attribute::Bool(true))
    );
}

#[test]
fn succeeding_without_rewriting_the_root_is_a_violation() {
    let (mut ir, _, a, _) = single_a();
    let before = ir.fingerprint();
    let patterns = ConversionPatternSet::new()
        .add(FnPattern::new("Liar", a_op(), |op, operands, rewriter| {
            // Create something, but leave the root alone.
            let loc = rewriter.ctx().op(op).location;
            rewriter.create_op(
                OperationDataBuilder::named(loc, b_op()).operands(operands.iter().copied()),
            );
            true
        }))
        .freeze();

    let err = apply_partial_conversion(&mut ir.ctx, &[ir.module], &target(), &patterns, None)
        .unwrap_err();
    assert!(err.is_consistency_violation());
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::Consistency(ConsistencyViolation::RootNotRewritten {
            pattern: "Liar",
            op: a,
        })
    );
    assert_eq!(ir.fingerprint(), before);
}

#[test]
fn erasing_a_value_that_is_still_used_is_a_violation() {
    let (mut ir, _, a, _) = single_a();
    let before = ir.fingerprint();
    let patterns = ConversionPatternSet::new()
        .add(FnPattern::new("Eraser", a_op(), |op, _, rewriter| {
            rewriter.erase_op(op);
            true
        }))
        .freeze();

    let err = apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &patterns).unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::Consistency(ConsistencyViolation::ErasedValueInUse {
            value: ir.result(a),
            uses: 1,
        })
    );
    assert_eq!(ir.fingerprint(), before);
}

#[test]
fn erasing_dead_operations_succeeds() {
    let mut ir = TestIr::new();
    let i32_ty = ir.ty("core", "i32");
    let a = ir.op(ir.body, a_op(), &[], &[i32_ty]);
    let patterns = ConversionPatternSet::new()
        .add(FnPattern::new("Eraser", a_op(), |op, _, rewriter| {
            rewriter.erase_op(op);
            true
        }))
        .freeze();

    apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &patterns).expect("converts");
    assert!(!ir.ctx.is_op_live(a));
    assert!(ir.ctx.block(ir.body).ops.is_empty());
}

#[test]
fn unreachable_blocks_fail_full_but_not_partial_conversion() {
    let mut ir = TestIr::new();
    let i32_ty = ir.ty("core", "i32");
    let region = ir.body_region();
    let orphan = ir.block(region, &[]);
    ir.op(orphan, a_op(), &[], &[i32_ty]);
    let before = ir.fingerprint();

    let err = apply_full_conversion(&mut ir.ctx, &[ir.module], &target(), &rename_a_to_b())
        .unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::UnreachableBlocks { region, count: 1 }
    );
    assert_eq!(ir.fingerprint(), before);

    apply_partial_conversion(&mut ir.ctx, &[ir.module], &target(), &rename_a_to_b(), None)
        .expect("partial conversion visits unreachable blocks too");
    assert_eq!(ir.ops_named(b_op()).len(), 1);
    assert!(ir.ops_named(a_op()).is_empty());
}

#[test]
fn replacing_an_operation_skips_its_nested_operations() {
    let mut ir = TestIr::new();
    let i32_ty = ir.ty("core", "i32");
    let (outer, inner) = ir.op_with_body(ir.body, OpName::new("a", "wrap"));
    ir.op(inner, a_op(), &[], &[i32_ty]);

    let mut target = target();
    target.add_illegal_dialect("a");
    let patterns = ConversionPatternSet::new()
        .add(FnPattern::new("DropWrap", OpName::new("a", "wrap"), |op, _, rewriter| {
            rewriter.erase_op(op);
            true
        }))
        .freeze();

    apply_full_conversion(&mut ir.ctx, &[ir.module], &target, &patterns)
        .expect("nested a.op goes away with its parent");
    assert!(!ir.ctx.is_op_live(outer));
    assert!(ir.ops_named(a_op()).is_empty());
}

/// `%v = test.def; s.wrap(%v) { ^entry(%a): %x = test.inner(%a); test.use(%x) }`
fn wrapped_body() -> (TestIr, OpRef, ValueRef) {
    let mut ir = TestIr::new();
    let i32_ty = ir.ty("core", "i32");
    let def = ir.op(ir.body, OpName::new("test", "def"), &[], &[i32_ty]);
    let v = ir.result(def);
    let region = ir.ctx.create_region(trunk_ir::RegionData::new(ir.loc, []));
    let entry = ir.block(region, &[i32_ty]);
    let arg = ir.ctx.block_arg(entry, 0);
    let inner = ir.op(entry, OpName::new("test", "inner"), &[arg], &[i32_ty]);
    ir.op(entry, OpName::new("test", "use"), &[ir.result(inner)], &[]);
    let wrap = ir.push(
        ir.body,
        OperationDataBuilder::named(ir.loc, OpName::new("s", "wrap"))
            .operands([v])
            .region(region),
    );
    (ir, wrap, v)
}

/// Rebuilds `s.wrap` as `test.new` using every structural primitive, then
/// optionally leaves an illegal `a.bad` behind.
fn restructure(leave_illegal_op: bool) -> FrozenPatternSet {
    ConversionPatternSet::new()
        .add(FnPattern::new("Restructure", OpName::new("s", "wrap"), move |op, operands, rewriter| {
            let loc = rewriter.ctx().op(op).location;
            let body = rewriter.ctx().op(op).regions[0];
            let entry = rewriter.ctx().region(body).blocks[0];
            let i32_ty = rewriter.ctx().value_ty(operands[0]);

            let region = rewriter.create_region(loc);
            let clones = rewriter.clone_region_before(body, region, 0, &mut IrMapping::new());
            rewriter.create_op(
                OperationDataBuilder::named(loc, OpName::new("test", "new")).region(region),
            );
            let head = clones[0];
            let (first, second) = {
                let ops = &rewriter.ctx().block(head).ops;
                (ops[0], ops[1])
            };
            let tail = rewriter.split_block(head, second);
            rewriter.merge_blocks(tail, head, &[]);

            let spare = rewriter.create_block(region, 1, &[i32_ty]);
            let spare_arg = rewriter.ctx().block_arg(spare, 0);
            rewriter.set_insertion_point(InsertPoint::BlockEnd(spare));
            rewriter.create_op(
                OperationDataBuilder::named(loc, OpName::new("test", "use")).operands([spare_arg]),
            );
            rewriter.inline_block_before(spare, head, Some(first), &[operands[0]]);

            rewriter.inline_region_before(body, region, 1);
            rewriter.erase_block(entry);
            rewriter.erase_op(op);

            rewriter.set_insertion_point(InsertPoint::Before(op));
            if leave_illegal_op {
                rewriter.create_op(OperationDataBuilder::named(loc, OpName::new("a", "bad")));
            }
            true
        }))
        .freeze()
}

fn restructure_target() -> ConversionTarget {
    let mut target = target();
    target.add_illegal_dialect("s");
    target.add_illegal_op("a", "bad");
    target
}

#[test]
fn structural_rewrites_roll_back_when_the_pattern_fails() {
    init_tracing();
    let (mut ir, wrap, _) = wrapped_body();
    let before = ir.fingerprint();

    let err = apply_partial_conversion(
        &mut ir.ctx,
        &[ir.module],
        &restructure_target(),
        &restructure(true),
        None,
    )
    .unwrap_err();
    assert_eq!(
        err.kind(),
        &ConversionErrorKind::IllegalOperation {
            op: wrap,
            name: OpName::new("s", "wrap"),
        }
    );
    assert_eq!(ir.fingerprint(), before);
    assert!(ir.ctx.is_op_live(wrap));
    assert!(ir.ops_named(OpName::new("test", "new")).is_empty());
    assert_eq!(ir.ops_named(OpName::new("test", "inner")).len(), 1);
    ir.assert_valid();
}

#[test]
fn structural_rewrites_commit_with_consistent_use_chains() {
    let (mut ir, wrap, v) = wrapped_body();
    let entry = ir.ctx.region(ir.ctx.op(wrap).regions[0]).blocks[0];

    apply_partial_conversion(
        &mut ir.ctx,
        &[ir.module],
        &restructure_target(),
        &restructure(false),
        None,
    )
    .expect("every structural rewrite commits");
    ir.assert_valid();

    assert!(!ir.ctx.is_op_live(wrap));
    assert!(!ir.ctx.is_block_live(entry));
    assert!(ir.ops_named(OpName::new("a", "bad")).is_empty());
    let new_ops = ir.ops_named(OpName::new("test", "new"));
    assert_eq!(new_ops.len(), 1);

    let region = ir.ctx.op(new_ops[0]).regions[0];
    assert_eq!(ir.ctx.region(region).blocks.len(), 1);
    let head = ir.ctx.region(region).blocks[0];
    let names: Vec<_> = ir
        .ctx
        .block(head)
        .ops
        .iter()
        .map(|&op| ir.ctx.op_name(op))
        .collect();
    assert_eq!(
        names,
        [
            OpName::new("test", "use"),
            OpName::new("test", "inner"),
            OpName::new("test", "use"),
        ]
    );
    // The spare block's argument was replaced by the root's operand.
    let moved = ir.ctx.block(head).ops[0];
    assert_eq!(ir.ctx.op_operands(moved), &[v]);
    // The clone reads the cloned entry argument.
    let inner = ir.ctx.block(head).ops[1];
    assert_eq!(ir.ctx.op_operands(inner), &[ir.ctx.block_arg(head, 0)]);
}
