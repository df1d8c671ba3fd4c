//! Transactional rewriter for conversion patterns.
//!
//! Every mutation a pattern makes is applied to the IR right away (so later
//! patterns see it) and recorded in a log. A savepoint is just a log length;
//! rolling back undoes log entries newest first until the log is that long
//! again.
//!
//! Replacing or erasing an operation does not touch its uses. Instead the old
//! values are mapped to their replacements and the operation stays where it
//! is until the conversion commits, at which point uses are redirected and
//! replaced operations are destroyed. Until then, patterns read remapped
//! operands through the rewriter.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, trace};
use trunk_ir::walk;
use trunk_ir::{
    Attribute, BlockData, BlockRef, InsertPoint, IrContext, IrMapping, Location, OpBuilder,
    OpName, OpRef, OperationDataBuilder, RegionData, RegionRef, Symbol, TypeInterner, TypeRef,
    ValueDef, ValueRef,
};

use crate::error::{ConsistencyViolation, ConversionError, ConversionErrorKind, RewriteError};
use crate::mapping::ValueMapping;
use crate::signature_conversion::{InputMapping, SignatureConversion};
use crate::type_converter::{MaterializationKind, TypeConverter};

/// Why a pattern declined an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchFailure {
    pub op: OpRef,
    pub op_name: OpName,
    pub location: Location,
    pub reason: String,
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.op_name, self.op, self.reason)
    }
}

/// The parts of an operation that in-place modification may change.
struct OpSnapshot {
    operands: SmallVec<[ValueRef; 8]>,
    result_types: SmallVec<[TypeRef; 4]>,
    attributes: BTreeMap<Symbol, Attribute>,
    successors: SmallVec<[BlockRef; 4]>,
    location: Location,
}

impl OpSnapshot {
    fn capture(ctx: &IrContext, op: OpRef) -> Self {
        let data = ctx.op(op);
        Self {
            operands: ctx.op_operands(op).into(),
            result_types: ctx.op_result_types(op).into(),
            attributes: data.attributes.clone(),
            successors: data.successors.clone(),
            location: data.location,
        }
    }

    fn restore(self, ctx: &mut IrContext, op: OpRef) {
        ctx.set_operands(op, &self.operands);
        let results: SmallVec<[ValueRef; 4]> = ctx.op_results(op).into();
        for (value, ty) in results.into_iter().zip(self.result_types) {
            ctx.set_value_type(value, ty);
        }
        let data = ctx.op_mut(op);
        data.attributes = self.attributes;
        data.successors = self.successors;
        data.location = self.location;
    }
}

enum Mutation {
    CreateOp {
        op: OpRef,
        materialization: bool,
    },
    MoveOp {
        op: OpRef,
        from: Option<(BlockRef, usize)>,
    },
    ModifyOp {
        op: OpRef,
        snapshot: OpSnapshot,
        /// Requested by a pattern, as opposed to bookkeeping such as
        /// redirecting a branch to a converted block.
        root_update: bool,
    },
    ReplaceOp {
        op: OpRef,
    },
    CreateBlock {
        block: BlockRef,
    },
    CloneBlocks {
        blocks: Vec<BlockRef>,
    },
    MoveBlock {
        block: BlockRef,
        from: Option<(RegionRef, usize)>,
    },
    EraseBlock {
        block: BlockRef,
        from: (RegionRef, usize),
    },
    CreateRegion {
        region: RegionRef,
    },
    MapValue {
        from: ValueRef,
        previous: Option<Option<ValueRef>>,
        converter: Option<Rc<TypeConverter>>,
    },
    IgnoreOp {
        op: OpRef,
    },
}

/// A savepoint: the length of the rewrite log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RewriterState(usize);

/// Context of the pattern currently running.
#[derive(Default)]
pub(crate) struct PatternScope {
    root: Option<OpRef>,
    converter: Option<Rc<TypeConverter>>,
    insert_point: Option<InsertPoint>,
}

/// Rewriter handed to [`ConversionPattern`](crate::ConversionPattern)s.
pub struct ConversionRewriter<'a> {
    ctx: &'a mut IrContext,
    log: Vec<Mutation>,
    mapping: ValueMapping,
    replaced_ops: HashSet<OpRef>,
    erased_blocks: HashSet<BlockRef>,
    ignored_ops: HashSet<OpRef>,
    scope: PatternScope,
    failures: Option<Vec<MatchFailure>>,
}

/// In-place editor for one operation, see
/// [`ConversionRewriter::modify_op_in_place`].
pub struct OpModifier<'r> {
    ctx: &'r mut IrContext,
    op: OpRef,
}

impl OpModifier<'_> {
    pub fn ctx(&self) -> &IrContext {
        &*self.ctx
    }

    pub fn op(&self) -> OpRef {
        self.op
    }

    pub fn set_operand(&mut self, index: usize, value: ValueRef) {
        self.ctx.set_operand(self.op, index, value);
    }

    pub fn set_operands(&mut self, values: &[ValueRef]) {
        self.ctx.set_operands(self.op, values);
    }

    pub fn set_attribute(&mut self, key: impl Into<Symbol>, value: Attribute) -> Option<Attribute> {
        self.ctx.op_mut(self.op).attributes.insert(key.into(), value)
    }

    pub fn remove_attribute(&mut self, key: impl Into<Symbol>) -> Option<Attribute> {
        self.ctx.op_mut(self.op).attributes.remove(&key.into())
    }

    pub fn set_successor(&mut self, index: usize, block: BlockRef) {
        self.ctx.op_mut(self.op).successors[index] = block;
    }

    pub fn set_result_type(&mut self, index: u32, ty: TypeRef) {
        let value = self.ctx.op_result(self.op, index);
        self.ctx.set_value_type(value, ty);
    }

    pub fn set_location(&mut self, location: Location) {
        self.ctx.op_mut(self.op).location = location;
    }
}

fn value_location(ctx: &IrContext, value: ValueRef) -> Location {
    match ctx.value_def(value) {
        ValueDef::OpResult(op, _) => ctx.op(op).location,
        ValueDef::BlockArg(block, _) => ctx.block(block).location,
    }
}

impl<'a> ConversionRewriter<'a> {
    pub(crate) fn new(ctx: &'a mut IrContext) -> Self {
        Self {
            ctx,
            log: Vec::new(),
            mapping: ValueMapping::default(),
            replaced_ops: HashSet::new(),
            erased_blocks: HashSet::new(),
            ignored_ops: HashSet::new(),
            scope: PatternScope::default(),
            failures: None,
        }
    }

    pub fn ctx(&self) -> &IrContext {
        &*self.ctx
    }

    pub fn types(&self) -> &TypeInterner {
        &self.ctx.types
    }

    /// Type converter of the running pattern.
    pub fn type_converter(&self) -> Option<&Rc<TypeConverter>> {
        self.scope.converter.as_ref()
    }

    /// The operation the running pattern was invoked on.
    pub fn root(&self) -> Option<OpRef> {
        self.scope.root
    }

    /// Where [`create_op`](Self::create_op) places operations. Defaults to
    /// just before the root.
    pub fn insertion_point(&self) -> Option<InsertPoint> {
        self.scope.insert_point
    }

    /// Redirect later [`create_op`](Self::create_op) calls. Restored when
    /// the pattern returns.
    pub fn set_insertion_point(&mut self, insert_point: InsertPoint) {
        self.scope.insert_point = Some(insert_point);
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Build an operation and insert it at the insertion point. Undone on
    /// rollback.
    pub fn create_op(&mut self, builder: OperationDataBuilder) -> OpRef {
        let data = builder.build(self.ctx);
        let op = self.ctx.create_op(data);
        if let Some(insert_point) = self.scope.insert_point
            && let Some(next) = insert_point.insert(self.ctx, op)
        {
            self.scope.insert_point = Some(next);
        }
        trace!("create_op: {op} = {}", self.ctx.op_name(op));
        self.log.push(Mutation::CreateOp {
            op,
            materialization: false,
        });
        op
    }

    /// Create a block in `region` at `index`. It takes the region's location.
    pub fn create_block(
        &mut self,
        region: RegionRef,
        index: usize,
        arg_types: &[TypeRef],
    ) -> BlockRef {
        let location = self.ctx.region(region).location;
        let block = self
            .ctx
            .create_block(BlockData::new(location, arg_types.iter().copied()));
        self.ctx.insert_block(region, index, block);
        self.log.push(Mutation::CreateBlock { block });
        block
    }

    /// Create an empty region, to be handed to an operation built with
    /// [`create_op`](Self::create_op).
    pub fn create_region(&mut self, location: Location) -> RegionRef {
        let region = self.ctx.create_region(RegionData::new(location, []));
        self.log.push(Mutation::CreateRegion { region });
        region
    }

    /// Move `op` to `insert_point`.
    pub fn move_op(&mut self, op: OpRef, insert_point: InsertPoint) {
        let from = self.ctx.detach_op(op);
        insert_point.insert(self.ctx, op);
        self.log.push(Mutation::MoveOp { op, from });
    }

    // ========================================================================
    // Replacement
    // ========================================================================

    /// Replace `op` with `values`, one per result.
    ///
    /// # Panics
    ///
    /// Panics if the counts differ or if `op` was already replaced.
    pub fn replace_op(&mut self, op: OpRef, values: &[ValueRef]) {
        let count = self.ctx.op_results(op).len();
        assert_eq!(
            count,
            values.len(),
            "replace_op: {op} has {count} result(s) but {} replacement(s) were given",
            values.len(),
        );
        self.replace_results(op, values.iter().map(|&v| Some(v)));
    }

    /// Replace `op` with the results of `new_op`.
    pub fn replace_op_with(&mut self, op: OpRef, new_op: OpRef) {
        let values: SmallVec<[ValueRef; 4]> = self.ctx.op_results(new_op).into();
        self.replace_op(op, &values);
    }

    /// Erase `op`. Its results must be dead by the time the conversion
    /// finishes.
    pub fn erase_op(&mut self, op: OpRef) {
        self.replace_results(op, std::iter::repeat(None));
    }

    fn replace_results(&mut self, op: OpRef, replacements: impl Iterator<Item = Option<ValueRef>>) {
        assert!(
            !self.replaced_ops.contains(&op),
            "replace_op: {op} was already replaced"
        );
        let results: SmallVec<[ValueRef; 4]> = self.ctx.op_results(op).into();
        let converter = self.scope.converter.clone();
        for (result, replacement) in results.into_iter().zip(replacements) {
            self.map_value(result, replacement, converter.clone());
        }
        trace!("replace_op: {op} = {}", self.ctx.op_name(op));
        self.replaced_ops.insert(op);
        self.log.push(Mutation::ReplaceOp { op });
    }

    /// Erase `block` with every operation in it. Its arguments must be dead
    /// by the time the conversion finishes.
    pub fn erase_block(&mut self, block: BlockRef) {
        let ops: SmallVec<[OpRef; 8]> = self.ctx.block(block).ops.clone().into_iter().collect();
        for op in ops.into_iter().rev() {
            if !self.replaced_ops.contains(&op) {
                self.erase_op(op);
            }
        }
        let args: SmallVec<[ValueRef; 4]> = self.ctx.block_args(block).into();
        for arg in args {
            self.map_value(arg, None, None);
        }
        self.detach_erased_block(block);
    }

    fn detach_erased_block(&mut self, block: BlockRef) {
        let Some(from) = self.ctx.detach_block(block) else {
            panic!("erase_block: {block} is not in a region");
        };
        self.erased_blocks.insert(block);
        self.log.push(Mutation::EraseBlock { block, from });
    }

    /// Redirect the uses of `from` (or of whatever replaced it) to `to`.
    pub fn replace_uses_of_block_argument(
        &mut self,
        from: ValueRef,
        to: ValueRef,
    ) -> Result<(), RewriteError> {
        let current = self.mapping.lookup(from)?;
        let converter = self.scope.converter.clone();
        self.map_value(current, Some(to), converter);
        Ok(())
    }

    fn map_value(
        &mut self,
        from: ValueRef,
        to: Option<ValueRef>,
        converter: Option<Rc<TypeConverter>>,
    ) {
        let previous = self.mapping.map(from, to);
        self.log.push(Mutation::MapValue {
            from,
            previous,
            converter,
        });
    }

    // ========================================================================
    // In-place modification
    // ========================================================================

    /// Change `op` without replacing it. The change counts as rewriting the
    /// operation if it is the pattern's root.
    pub fn modify_op_in_place<R>(
        &mut self,
        op: OpRef,
        f: impl FnOnce(&mut OpModifier<'_>) -> R,
    ) -> R {
        self.modify_op(op, true, f)
    }

    fn modify_op<R>(
        &mut self,
        op: OpRef,
        root_update: bool,
        f: impl FnOnce(&mut OpModifier<'_>) -> R,
    ) -> R {
        let snapshot = OpSnapshot::capture(self.ctx, op);
        self.log.push(Mutation::ModifyOp {
            op,
            snapshot,
            root_update,
        });
        let mut modifier = OpModifier {
            ctx: &mut *self.ctx,
            op,
        };
        f(&mut modifier)
    }

    // ========================================================================
    // Block and region structure
    // ========================================================================

    /// Split `block` before `before`; `before` and everything after it moves
    /// to a new block placed right after `block`.
    pub fn split_block(&mut self, block: BlockRef, before: OpRef) -> BlockRef {
        let Some((region, index)) = self.ctx.block_position(block) else {
            panic!("split_block: {block} is not in a region");
        };
        let Some(pos) = self.ctx.block(block).ops.iter().position(|&o| o == before) else {
            panic!("split_block: {before} is not in {block}");
        };
        let location = self.ctx.block(block).location;
        let tail = self.ctx.create_block(BlockData::new(location, []));
        self.ctx.insert_block(region, index + 1, tail);
        self.log.push(Mutation::CreateBlock { block: tail });

        let moved: SmallVec<[OpRef; 8]> =
            self.ctx.block(block).ops[pos..].iter().copied().collect();
        for op in moved {
            self.move_op(op, InsertPoint::BlockEnd(tail));
        }
        tail
    }

    /// Move the operations of `source` into `dest` before `before` (or at the
    /// end), substituting `args` for `source`'s arguments, then erase
    /// `source`.
    pub fn inline_block_before(
        &mut self,
        source: BlockRef,
        dest: BlockRef,
        before: Option<OpRef>,
        args: &[ValueRef],
    ) {
        let source_args: SmallVec<[ValueRef; 4]> = self.ctx.block_args(source).into();
        assert_eq!(
            source_args.len(),
            args.len(),
            "inline_block_before: {source} takes {} argument(s) but {} were given",
            source_args.len(),
            args.len(),
        );
        let converter = self.scope.converter.clone();
        for (&old, &new) in source_args.iter().zip(args) {
            self.map_value(old, Some(new), converter.clone());
        }

        let insert_point = before.map_or(InsertPoint::BlockEnd(dest), InsertPoint::Before);
        let ops: SmallVec<[OpRef; 8]> = self.ctx.block(source).ops.iter().copied().collect();
        for op in ops {
            self.move_op(op, insert_point);
        }
        self.detach_erased_block(source);
    }

    /// Append `source`'s operations to `dest`.
    pub fn merge_blocks(&mut self, source: BlockRef, dest: BlockRef, args: &[ValueRef]) {
        self.inline_block_before(source, dest, None, args);
    }

    /// Move every block of `region` into `dest`, starting at `index`.
    pub fn inline_region_before(&mut self, region: RegionRef, dest: RegionRef, index: usize) {
        let blocks = self.ctx.region(region).blocks.clone();
        for (i, block) in blocks.into_iter().enumerate() {
            let from = self.ctx.detach_block(block);
            self.ctx.insert_block(dest, index + i, block);
            self.log.push(Mutation::MoveBlock { block, from });
        }
    }

    /// Clone every block of `region` into `dest`, starting at `index`.
    pub fn clone_region_before(
        &mut self,
        region: RegionRef,
        dest: RegionRef,
        index: usize,
        mapping: &mut IrMapping,
    ) -> Vec<BlockRef> {
        let blocks = self.ctx.clone_region_into(region, dest, index, mapping);
        self.log.push(Mutation::CloneBlocks {
            blocks: blocks.clone(),
        });
        blocks
    }

    // ========================================================================
    // Type conversion
    // ========================================================================

    /// Convert the entry block of `region` according to `conversion`.
    ///
    /// Returns the new entry block, or `None` if the region is empty.
    pub fn apply_signature_conversion(
        &mut self,
        region: RegionRef,
        conversion: &SignatureConversion,
        converter: Option<&Rc<TypeConverter>>,
    ) -> Result<Option<BlockRef>, RewriteError> {
        match self.ctx.region(region).blocks.first().copied() {
            Some(entry) => self.convert_block_signature(entry, conversion, converter).map(Some),
            None => Ok(None),
        }
    }

    /// Replace `block` with a new block whose arguments follow
    /// `conversion`, moving the operations over and redirecting branches.
    ///
    /// Old arguments map to their replacements; an argument split into
    /// several new ones is rebuilt with an argument materialization. If the
    /// conversion changes nothing, `block` is returned as is.
    pub fn convert_block_signature(
        &mut self,
        block: BlockRef,
        conversion: &SignatureConversion,
        converter: Option<&Rc<TypeConverter>>,
    ) -> Result<BlockRef, RewriteError> {
        let old_args: SmallVec<[ValueRef; 4]> = self.ctx.block_args(block).into();
        assert_eq!(
            conversion.num_original_inputs(),
            old_args.len(),
            "convert_block_signature: conversion expects {} argument(s) but {block} has {}",
            conversion.num_original_inputs(),
            old_args.len(),
        );
        if self.is_identity_conversion(&old_args, conversion) {
            return Ok(block);
        }
        let Some((region, index)) = self.ctx.block_position(block) else {
            panic!("convert_block_signature: {block} is not in a region");
        };

        let location = self.ctx.block(block).location;
        let new_block = self.ctx.create_block(BlockData::new(
            location,
            conversion.converted_types().iter().copied(),
        ));
        self.ctx.insert_block(region, index, new_block);
        self.log.push(Mutation::CreateBlock { block: new_block });
        trace!("convert_block_signature: {block} -> {new_block}");

        let ops: SmallVec<[OpRef; 8]> = self.ctx.block(block).ops.iter().copied().collect();
        for op in ops {
            self.move_op(op, InsertPoint::BlockEnd(new_block));
        }

        let new_args: SmallVec<[ValueRef; 4]> = self.ctx.block_args(new_block).into();
        for (i, &old) in old_args.iter().enumerate() {
            let replacement = match conversion.input_mapping(i) {
                Some(InputMapping::Replaced(value)) => Some(value),
                Some(InputMapping::Converted { start, size: 1 }) => Some(new_args[start]),
                Some(InputMapping::Converted { start, size }) => {
                    let inputs = &new_args[start..start + size];
                    Some(self.materialize_block_argument(old, new_block, inputs, converter)?)
                }
                None if self.ctx.has_uses(old) => {
                    Some(self.materialize_block_argument(old, new_block, &[], converter)?)
                }
                None => None,
            };
            self.map_value(old, replacement, converter.cloned());
        }

        // Redirect branches that target the old block.
        let region_blocks = self.ctx.region(region).blocks.clone();
        for pred in region_blocks {
            let ops: SmallVec<[OpRef; 8]> = self.ctx.block(pred).ops.iter().copied().collect();
            for op in ops {
                let successors = &self.ctx.op(op).successors;
                if !successors.contains(&block) {
                    continue;
                }
                let positions: SmallVec<[usize; 2]> = successors
                    .iter()
                    .enumerate()
                    .filter(|&(_, &s)| s == block)
                    .map(|(i, _)| i)
                    .collect();
                self.modify_op(op, false, |m| {
                    for i in positions {
                        m.set_successor(i, new_block);
                    }
                });
            }
        }

        self.detach_erased_block(block);
        Ok(new_block)
    }

    fn is_identity_conversion(
        &self,
        old_args: &[ValueRef],
        conversion: &SignatureConversion,
    ) -> bool {
        conversion.converted_types().len() == old_args.len()
            && old_args.iter().enumerate().all(|(i, &arg)| {
                conversion.input_mapping(i) == Some(InputMapping::Converted { start: i, size: 1 })
                    && conversion.converted_types()[i] == self.ctx.value_ty(arg)
            })
    }

    fn materialize_block_argument(
        &mut self,
        old: ValueRef,
        block: BlockRef,
        inputs: &[ValueRef],
        converter: Option<&Rc<TypeConverter>>,
    ) -> Result<ValueRef, RewriteError> {
        let ty = self.ctx.value_ty(old);
        let location = self.ctx.block(block).location;
        converter
            .cloned()
            .and_then(|converter| {
                self.materialize(
                    &converter,
                    MaterializationKind::Argument,
                    InsertPoint::BlockStart(block),
                    ty,
                    inputs,
                    location,
                )
            })
            .ok_or(RewriteError::Materialization { value: old, ty })
    }

    /// Convert the argument types of every block in `region`.
    ///
    /// The entry block follows `entry_conversion` if given; other blocks are
    /// converted with `converter`. Returns the (possibly new) entry block.
    pub fn convert_region_types(
        &mut self,
        region: RegionRef,
        converter: &Rc<TypeConverter>,
        entry_conversion: Option<&SignatureConversion>,
    ) -> Result<Option<BlockRef>, RewriteError> {
        let Some(entry) = self.ctx.region(region).blocks.first().copied() else {
            return Ok(None);
        };
        self.convert_non_entry_region_types(region, converter, None)?;
        let conversion = match entry_conversion {
            Some(conversion) => conversion.clone(),
            None => self.block_conversion(entry, converter)?,
        };
        self.convert_block_signature(entry, &conversion, Some(converter))
            .map(Some)
    }

    /// Convert the argument types of every block but the entry block.
    ///
    /// `block_conversions`, if given, holds one conversion per non-entry
    /// block in region order.
    pub fn convert_non_entry_region_types(
        &mut self,
        region: RegionRef,
        converter: &Rc<TypeConverter>,
        block_conversions: Option<&[SignatureConversion]>,
    ) -> Result<(), RewriteError> {
        let blocks: SmallVec<[BlockRef; 4]> =
            self.ctx.region(region).blocks.iter().skip(1).copied().collect();
        if let Some(conversions) = block_conversions {
            assert_eq!(
                conversions.len(),
                blocks.len(),
                "convert_non_entry_region_types: expected one conversion per non-entry block",
            );
        }
        for (i, block) in blocks.into_iter().enumerate() {
            let conversion = match block_conversions {
                Some(conversions) => conversions[i].clone(),
                None => self.block_conversion(block, converter)?,
            };
            self.convert_block_signature(block, &conversion, Some(converter))?;
        }
        Ok(())
    }

    fn block_conversion(
        &self,
        block: BlockRef,
        converter: &TypeConverter,
    ) -> Result<SignatureConversion, RewriteError> {
        let args = self.ctx.block_args(block);
        let mut conversion = SignatureConversion::new(args.len());
        for (i, &arg) in args.iter().enumerate() {
            let ty = self.ctx.value_ty(arg);
            if !converter.convert_signature_arg(&self.ctx.types, i, ty, &mut conversion) {
                return Err(RewriteError::UnconvertibleType { value: arg, ty });
            }
        }
        Ok(conversion)
    }

    // ========================================================================
    // Operand remapping
    // ========================================================================

    /// The current replacement of `value`.
    ///
    /// With a type converter in scope, the result has the converted type of
    /// `value`; a target materialization is inserted before the root if no
    /// value in the replacement chain has it.
    pub fn get_remapped_value(&mut self, value: ValueRef) -> Result<ValueRef, RewriteError> {
        let Some(converter) = self.scope.converter.clone() else {
            return self.mapping.lookup(value);
        };
        let original_ty = self.ctx.value_ty(value);
        let Some(legal_ty) = converter.convert_single_type(&self.ctx.types, original_ty) else {
            return Err(RewriteError::UnconvertibleType {
                value,
                ty: original_ty,
            });
        };
        let current = self.mapping.lookup_with_type(self.ctx, value, legal_ty)?;
        if self.ctx.value_ty(current) == legal_ty {
            return Ok(current);
        }

        let insert_point = match (self.scope.root, self.ctx.value_def(current)) {
            (Some(root), _) => InsertPoint::Before(root),
            (None, ValueDef::OpResult(op, _)) => InsertPoint::After(op),
            (None, ValueDef::BlockArg(block, _)) => InsertPoint::BlockStart(block),
        };
        let location = value_location(self.ctx, value);
        self.materialize(
            &converter,
            MaterializationKind::Target,
            insert_point,
            legal_ty,
            &[current],
            location,
        )
        .ok_or(RewriteError::Materialization { value, ty: legal_ty })
    }

    pub fn get_remapped_values(
        &mut self,
        values: &[ValueRef],
    ) -> Result<Vec<ValueRef>, RewriteError> {
        values.iter().map(|&v| self.get_remapped_value(v)).collect()
    }

    fn materialize(
        &mut self,
        converter: &TypeConverter,
        which: MaterializationKind,
        insert_point: InsertPoint,
        ty: TypeRef,
        inputs: &[ValueRef],
        location: Location,
    ) -> Option<ValueRef> {
        let mut builder = OpBuilder::new(self.ctx, insert_point);
        let value = converter.materialize(which, &mut builder, ty, inputs, location);
        for op in builder.into_created() {
            self.log.push(Mutation::CreateOp {
                op,
                materialization: true,
            });
        }
        trace!("materialize {which:?}: {ty} from {inputs:?} -> {value:?}");
        value
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Report why a pattern does not apply to `op`. Always returns `false`,
    /// so a pattern can `return rewriter.notify_match_failure(..)`.
    pub fn notify_match_failure(&mut self, op: OpRef, reason: impl fmt::Display) -> bool {
        let op_name = self.ctx.op_name(op);
        let reason = reason.to_string();
        debug!("match failure on {op_name} ({op}): {reason}");
        if let Some(failures) = &mut self.failures {
            failures.push(MatchFailure {
                op,
                op_name,
                location: self.ctx.op(op).location,
                reason,
            });
        }
        false
    }

    pub(crate) fn collect_match_failures(&mut self) {
        self.failures.get_or_insert_with(Vec::new);
    }

    pub(crate) fn take_match_failures(&mut self) -> Vec<MatchFailure> {
        self.failures.as_mut().map(std::mem::take).unwrap_or_default()
    }

    // ========================================================================
    // Driver interface
    // ========================================================================

    pub(crate) fn state(&self) -> RewriterState {
        RewriterState(self.log.len())
    }

    /// Undo every mutation recorded after `state`.
    pub(crate) fn reset_state(&mut self, state: RewriterState) {
        let undone = self.log.split_off(state.0);
        if !undone.is_empty() {
            trace!("rolling back {} mutation(s)", undone.len());
        }
        for mutation in undone.into_iter().rev() {
            self.undo(mutation);
        }
    }

    fn undo(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::CreateOp { op, .. } => {
                self.ctx.detach_op(op);
                // Blocks placed in the regions before the op existed are
                // moved back by their own log entries.
                let regions = self.ctx.op(op).regions.clone();
                for region in regions {
                    let blocks = self.ctx.region(region).blocks.clone();
                    for block in blocks {
                        self.ctx.detach_block(block);
                    }
                }
                self.ctx.destroy_op(op);
            }
            Mutation::MoveOp { op, from } => {
                self.ctx.detach_op(op);
                if let Some((block, index)) = from {
                    self.ctx.insert_op_at(block, index, op);
                }
            }
            Mutation::ModifyOp { op, snapshot, .. } => snapshot.restore(self.ctx, op),
            Mutation::ReplaceOp { op } => {
                self.replaced_ops.remove(&op);
            }
            Mutation::CreateBlock { block } => {
                self.ctx.detach_block(block);
                self.ctx.destroy_block(block);
            }
            Mutation::CloneBlocks { blocks } => {
                for &block in &blocks {
                    self.ctx.detach_block(block);
                }
                self.ctx.destroy_blocks(&blocks);
            }
            Mutation::MoveBlock { block, from } => {
                self.ctx.detach_block(block);
                if let Some((region, index)) = from {
                    self.ctx.insert_block(region, index, block);
                }
            }
            Mutation::EraseBlock {
                block,
                from: (region, index),
            } => {
                self.erased_blocks.remove(&block);
                self.ctx.insert_block(region, index, block);
            }
            Mutation::CreateRegion { region } => {
                if self.ctx.is_region_live(region) && self.ctx.region(region).parent_op.is_none() {
                    let blocks = self.ctx.region(region).blocks.clone();
                    for block in blocks {
                        self.ctx.detach_block(block);
                    }
                    self.ctx.destroy_region(region);
                }
            }
            Mutation::MapValue { from, previous, .. } => self.mapping.restore(from, previous),
            Mutation::IgnoreOp { op } => {
                self.ignored_ops.remove(&op);
            }
        }
    }

    /// Enter a pattern application rooted at `root`, returning the scope to
    /// restore afterwards.
    pub(crate) fn enter_pattern(
        &mut self,
        root: OpRef,
        converter: Option<Rc<TypeConverter>>,
    ) -> PatternScope {
        std::mem::replace(
            &mut self.scope,
            PatternScope {
                root: Some(root),
                converter,
                insert_point: Some(InsertPoint::Before(root)),
            },
        )
    }

    pub(crate) fn exit_pattern(&mut self, saved: PatternScope) {
        self.scope = saved;
    }

    /// Whether `op` needs no legalization: it was marked ignored, or it is
    /// scheduled for deletion because it or an enclosing operation was
    /// replaced or its block erased.
    pub(crate) fn is_op_ignored(&self, op: OpRef) -> bool {
        self.ignored_ops.contains(&op) || self.is_dead(op)
    }

    fn is_dead(&self, op: OpRef) -> bool {
        let mut current = Some(op);
        while let Some(op) = current {
            if self.replaced_ops.contains(&op) {
                return true;
            }
            let Some(block) = self.ctx.op(op).parent_block else {
                return false;
            };
            if self.erased_blocks.contains(&block) {
                return true;
            }
            current = self.ctx.block_parent_op(block);
        }
        false
    }

    pub(crate) fn mark_nested_ops_ignored(&mut self, op: OpRef) {
        for nested in walk::nested_ops(self.ctx, op) {
            if self.ignored_ops.insert(nested) {
                self.log.push(Mutation::IgnoreOp { op: nested });
            }
        }
    }

    /// Whether `root` was replaced or updated in place since `state`.
    pub(crate) fn root_rewritten(&self, state: RewriterState, root: OpRef) -> bool {
        self.log[state.0..].iter().any(|m| match m {
            Mutation::ReplaceOp { op } => *op == root,
            Mutation::ModifyOp {
                op,
                root_update: true,
                ..
            } => *op == root,
            _ => false,
        })
    }

    /// Operations a pattern updated in place since `state`, in first-update
    /// order.
    pub(crate) fn updated_ops(&self, state: RewriterState) -> Vec<OpRef> {
        let mut seen = HashSet::new();
        self.log[state.0..]
            .iter()
            .filter_map(|m| match m {
                Mutation::ModifyOp {
                    op,
                    root_update: true,
                    ..
                } => Some(*op),
                _ => None,
            })
            .filter(|op| seen.insert(*op))
            .collect()
    }

    /// Operations created since `state`, including everything in cloned
    /// blocks but not materializations.
    pub(crate) fn created_ops(&self, state: RewriterState) -> Vec<OpRef> {
        let mut ops = Vec::new();
        for mutation in &self.log[state.0..] {
            match mutation {
                Mutation::CreateOp {
                    op,
                    materialization: false,
                } => ops.push(*op),
                Mutation::CloneBlocks { blocks } => {
                    for &block in blocks {
                        for &op in &self.ctx.block(block).ops {
                            ops.push(op);
                            ops.extend(walk::nested_ops(self.ctx, op));
                        }
                    }
                }
                _ => {}
            }
        }
        ops
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Values replaced during the conversion, in first-replacement order,
    /// each with the type converter of its latest replacement.
    fn replaced_values(&self) -> Vec<(ValueRef, Option<Rc<TypeConverter>>)> {
        let mut order: Vec<(ValueRef, Option<Rc<TypeConverter>>)> = Vec::new();
        let mut index = std::collections::HashMap::new();
        for mutation in &self.log {
            if let Mutation::MapValue { from, converter, .. } = mutation {
                let slot = *index.entry(*from).or_insert_with(|| {
                    order.push((*from, None));
                    order.len() - 1
                });
                if converter.is_some() {
                    order[slot].1 = converter.clone();
                }
            }
        }
        order
    }

    /// Reconcile the remaining uses of replaced values before commit.
    ///
    /// A live user of a value whose replacement has a different type gets a
    /// source (or, for block arguments, argument) materialization back to
    /// the original type. A live user of an erased value is a contract
    /// violation.
    pub(crate) fn finalize(&mut self) -> Result<(), ConversionError> {
        for (from, converter) in self.replaced_values() {
            let live_uses = self
                .ctx
                .uses(from)
                .iter()
                .filter(|u| !self.is_dead(u.user))
                .count();
            if live_uses == 0 {
                continue;
            }
            let to = match self.mapping.lookup(from) {
                Ok(to) => to,
                Err(RewriteError::MappingCycle { .. }) => {
                    return Err(ConsistencyViolation::MappingCycle { value: from }.into());
                }
                Err(_) => {
                    return Err(ConsistencyViolation::ErasedValueInUse {
                        value: from,
                        uses: live_uses,
                    }
                    .into());
                }
            };
            let expected = self.ctx.value_ty(from);
            let actual = self.ctx.value_ty(to);
            if to == from || expected == actual {
                continue;
            }

            let which = match self.ctx.value_def(from) {
                ValueDef::BlockArg(..) => MaterializationKind::Argument,
                ValueDef::OpResult(..) => MaterializationKind::Source,
            };
            let insert_point = match self.ctx.value_def(to) {
                ValueDef::OpResult(op, _) => InsertPoint::After(op),
                ValueDef::BlockArg(block, _) => InsertPoint::BlockStart(block),
            };
            let location = value_location(self.ctx, from);
            let cast = converter.and_then(|converter| {
                self.materialize(&converter, which, insert_point, expected, &[to], location)
            });
            let Some(cast) = cast else {
                return Err(ConversionErrorKind::Materialization {
                    value: from,
                    actual,
                    expected,
                }
                .into());
            };
            self.map_value(from, Some(cast), None);
        }
        Ok(())
    }

    /// Make the recorded rewrites permanent: redirect uses to replacements,
    /// then destroy replaced operations and erased blocks.
    pub(crate) fn apply_rewrites(self) {
        let mut seen = HashSet::new();
        for mutation in &self.log {
            if let Mutation::MapValue { from, .. } = *mutation
                && seen.insert(from)
                && let Ok(to) = self.mapping.lookup(from)
            {
                self.ctx.replace_all_uses(from, to);
            }
        }

        let dead_ops: Vec<OpRef> = self
            .log
            .iter()
            .filter_map(|m| match m {
                Mutation::ReplaceOp { op } if self.replaced_ops.contains(op) => Some(*op),
                _ => None,
            })
            .collect();
        let erased_blocks: Vec<BlockRef> = self
            .log
            .iter()
            .filter_map(|m| match m {
                Mutation::EraseBlock { block, .. } if self.erased_blocks.contains(block) => {
                    Some(*block)
                }
                _ => None,
            })
            .collect();
        debug!(
            "committing conversion: {} mutation(s), {} replaced op(s), {} erased block(s)",
            self.log.len(),
            dead_ops.len(),
            erased_blocks.len()
        );

        for &op in &dead_ops {
            self.ctx.drop_all_references(op);
        }
        for &block in &erased_blocks {
            let ops: SmallVec<[OpRef; 8]> = self.ctx.block(block).ops.iter().copied().collect();
            for op in ops {
                self.ctx.drop_all_references(op);
            }
        }
        for op in dead_ops {
            if self.ctx.is_op_live(op) {
                self.ctx.detach_op(op);
                self.ctx.destroy_op(op);
            }
        }
        let erased_blocks: Vec<BlockRef> = erased_blocks
            .into_iter()
            .filter(|&b| self.ctx.is_block_live(b))
            .collect();
        self.ctx.destroy_blocks(&erased_blocks);
    }

    /// Undo everything.
    pub(crate) fn discard_rewrites(mut self) {
        self.reset_state(RewriterState(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunk_ir::validation::validate_use_chains;
    use trunk_ir::{Fingerprint, Span, TypeDataBuilder};

    use crate::type_converter::unrealized_cast;

    struct Fixture {
        ctx: IrContext,
        loc: Location,
        i32_ty: TypeRef,
        i64_ty: TypeRef,
        module: OpRef,
        body: BlockRef,
        def: OpRef,
        user: OpRef,
    }

    /// `test.module { %0 = test.def : i32; test.use %0 }`
    fn fixture() -> Fixture {
        let mut ctx = IrContext::new();
        let loc = Location::new(ctx.paths.intern("file:///rewriter.ir"), Span::default());
        let i32_ty = ctx.types.intern(TypeDataBuilder::new("core", "i32").build());
        let i64_ty = ctx.types.intern(TypeDataBuilder::new("core", "i64").build());

        let body = ctx.create_block(BlockData::new(loc, []));
        let data = OperationDataBuilder::named(loc, OpName::new("test", "def"))
            .result(i32_ty)
            .build(&mut ctx);
        let def = ctx.create_op(data);
        ctx.push_op(body, def);
        let value = ctx.op_result(def, 0);
        let data = OperationDataBuilder::named(loc, OpName::new("test", "use"))
            .operand(value)
            .build(&mut ctx);
        let user = ctx.create_op(data);
        ctx.push_op(body, user);

        let region = ctx.create_region(RegionData::new(loc, [body]));
        let data = OperationDataBuilder::named(loc, OpName::new("test", "module"))
            .region(region)
            .build(&mut ctx);
        let module = ctx.create_op(data);

        Fixture {
            ctx,
            loc,
            i32_ty,
            i64_ty,
            module,
            body,
            def,
            user,
        }
    }

    #[test]
    fn reset_state_undoes_everything_after_the_savepoint() {
        let mut f = fixture();
        let before = Fingerprint::of(&f.ctx, f.module);

        let mut rewriter = ConversionRewriter::new(&mut f.ctx);
        let state = rewriter.state();
        let _scope = rewriter.enter_pattern(f.def, None);
        let new_def = rewriter.create_op(
            OperationDataBuilder::named(f.loc, OpName::new("test", "def2")).result(f.i64_ty),
        );
        rewriter.replace_op_with(f.def, new_def);
        rewriter.modify_op_in_place(f.user, |m| {
            m.set_attribute("touched", Attribute::Bool(true));
        });
        let tail = rewriter.split_block(f.body, f.user);
        rewriter.move_op(f.def, InsertPoint::BlockEnd(tail));

        assert!(rewriter.root_rewritten(state, f.def));
        assert_eq!(rewriter.updated_ops(state), vec![f.user]);
        assert_eq!(rewriter.created_ops(state), vec![new_def]);
        assert!(rewriter.is_op_ignored(f.def));

        rewriter.reset_state(state);
        assert!(!rewriter.is_op_ignored(f.def));
        drop(rewriter);

        assert_eq!(Fingerprint::of(&f.ctx, f.module), before);
        assert!(!f.ctx.is_op_live(new_def));
        assert!(!f.ctx.is_block_live(tail));
        assert_eq!(validate_use_chains(&f.ctx, f.module), Ok(()));
    }

    #[test]
    fn replacement_is_deferred_until_commit() {
        let mut f = fixture();
        let old_value = f.ctx.op_result(f.def, 0);

        let mut rewriter = ConversionRewriter::new(&mut f.ctx);
        let _scope = rewriter.enter_pattern(f.def, None);
        let new_def = rewriter.create_op(
            OperationDataBuilder::named(f.loc, OpName::new("test", "def2")).result(f.i32_ty),
        );
        rewriter.replace_op_with(f.def, new_def);
        let new_value = rewriter.ctx().op_result(new_def, 0);

        // The user still reads the old value until the rewrites are applied.
        assert_eq!(rewriter.ctx().op_operands(f.user), &[old_value]);
        assert_eq!(rewriter.get_remapped_value(old_value), Ok(new_value));

        rewriter.finalize().expect("same types need no materialization");
        rewriter.apply_rewrites();

        assert!(!f.ctx.is_op_live(f.def));
        assert_eq!(f.ctx.op_operands(f.user), &[new_value]);
        assert_eq!(f.ctx.block(f.body).ops.as_slice(), &[new_def, f.user]);
        assert_eq!(validate_use_chains(&f.ctx, f.module), Ok(()));
    }

    #[test]
    fn remapping_with_a_converter_inserts_a_target_cast() {
        let mut f = fixture();
        let old_value = f.ctx.op_result(f.def, 0);
        let (i32_ty, i64_ty) = (f.i32_ty, f.i64_ty);

        let mut converter = TypeConverter::new();
        converter.add_conversion(|_, ty| Some(ty));
        converter.add_conversion(move |_, ty| (ty == i32_ty).then_some(i64_ty));
        converter.add_target_materialization(unrealized_cast);
        let converter = Rc::new(converter);

        let mut rewriter = ConversionRewriter::new(&mut f.ctx);
        let _scope = rewriter.enter_pattern(f.user, Some(converter));
        let remapped = rewriter
            .get_remapped_value(old_value)
            .expect("target materialization");

        let ctx = rewriter.ctx();
        assert_eq!(ctx.value_ty(remapped), i64_ty);
        let ValueDef::OpResult(cast, 0) = ctx.value_def(remapped) else {
            panic!("cast result expected");
        };
        assert_eq!(ctx.op_operands(cast), &[old_value]);
        assert_eq!(ctx.block(f.body).ops.as_slice(), &[f.def, cast, f.user]);
    }

    #[test]
    fn erased_value_with_live_user_is_a_violation() {
        let mut f = fixture();
        let old_value = f.ctx.op_result(f.def, 0);

        let mut rewriter = ConversionRewriter::new(&mut f.ctx);
        rewriter.erase_op(f.def);
        let err = rewriter.finalize().unwrap_err();
        assert_eq!(
            err.kind(),
            &ConversionErrorKind::Consistency(ConsistencyViolation::ErasedValueInUse {
                value: old_value,
                uses: 1,
            })
        );
        rewriter.discard_rewrites();
        assert!(f.ctx.is_op_live(f.def));
    }

    #[test]
    fn collected_match_failures_carry_the_operation() {
        let mut f = fixture();
        let mut rewriter = ConversionRewriter::new(&mut f.ctx);
        assert!(!rewriter.notify_match_failure(f.user, "not collected"));
        assert!(rewriter.take_match_failures().is_empty());

        rewriter.collect_match_failures();
        rewriter.notify_match_failure(f.user, format_args!("operand {} is wrong", 0));
        let failures = rewriter.take_match_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].op, f.user);
        assert_eq!(failures[0].reason, "operand 0 is wrong");
        assert_eq!(failures[0].to_string(), format!("test.use ({}): operand 0 is wrong", f.user));
    }
}
