//! IrContext: arena-based mutable IR storage.
//!
//! Operations, values, blocks, and regions live in `PrimaryMap`s owned by
//! [`IrContext`]. Operand and result lists use `EntityList + ListPool`.
//! Every value carries a use list that all mutation methods keep in sync.
//!
//! Entities are never removed from the arenas. Destroying one tombstones its
//! index, so a stale `OpRef` can always be checked with [`IrContext::is_op_live`]
//! instead of silently aliasing a newer entity.

use std::collections::{BTreeMap, HashMap};

use cranelift_entity::{EntityList, ListPool, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::location::{Location, PathInterner};
use crate::refs::*;
use crate::symbol::{OpName, Symbol};
use crate::types::{Attribute, TypeInterner};

// ============================================================================
// Use-chain
// ============================================================================

/// A single use of a value: which operation uses it, at which operand index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: OpRef,
    pub operand_index: u32,
}

// ============================================================================
// Entity data
// ============================================================================

pub struct OperationData {
    pub location: Location,
    pub dialect: Symbol,
    pub name: Symbol,
    pub operands: EntityList<ValueRef>,
    pub results: EntityList<TypeRef>,
    pub attributes: BTreeMap<Symbol, Attribute>,
    pub regions: SmallVec<[RegionRef; 4]>,
    pub successors: SmallVec<[BlockRef; 4]>,
    pub parent_block: Option<BlockRef>,
}

pub struct ValueData {
    pub def: ValueDef,
    pub ty: TypeRef,
}

#[derive(Clone, Debug)]
pub struct BlockArgData {
    pub ty: TypeRef,
    pub attrs: BTreeMap<Symbol, Attribute>,
}

impl BlockArgData {
    pub fn new(ty: TypeRef) -> Self {
        Self {
            ty,
            attrs: BTreeMap::new(),
        }
    }
}

pub struct BlockData {
    pub location: Location,
    pub args: Vec<BlockArgData>,
    pub ops: SmallVec<[OpRef; 4]>,
    pub parent_region: Option<RegionRef>,
}

impl BlockData {
    /// An empty, detached block with the given argument types.
    pub fn new(location: Location, arg_types: impl IntoIterator<Item = TypeRef>) -> Self {
        Self {
            location,
            args: arg_types.into_iter().map(BlockArgData::new).collect(),
            ops: SmallVec::new(),
            parent_region: None,
        }
    }
}

pub struct RegionData {
    pub location: Location,
    pub blocks: SmallVec<[BlockRef; 4]>,
    pub parent_op: Option<OpRef>,
}

impl RegionData {
    pub fn new(location: Location, blocks: impl IntoIterator<Item = BlockRef>) -> Self {
        Self {
            location,
            blocks: blocks.into_iter().collect(),
            parent_op: None,
        }
    }
}

/// Tombstones for destroyed entities.
#[derive(Default)]
struct Tombstones {
    ops: SecondaryMap<OpRef, bool>,
    blocks: SecondaryMap<BlockRef, bool>,
    regions: SecondaryMap<RegionRef, bool>,
}

// ============================================================================
// IrContext
// ============================================================================

pub struct IrContext {
    ops: PrimaryMap<OpRef, OperationData>,
    values: PrimaryMap<ValueRef, ValueData>,
    blocks: PrimaryMap<BlockRef, BlockData>,
    regions: PrimaryMap<RegionRef, RegionData>,

    uses: SecondaryMap<ValueRef, SmallVec<[Use; 2]>>,
    dead: Tombstones,

    pub types: TypeInterner,
    pub paths: PathInterner,

    value_pool: ListPool<ValueRef>,
    type_pool: ListPool<TypeRef>,

    result_values: SecondaryMap<OpRef, EntityList<ValueRef>>,
    block_arg_values: SecondaryMap<BlockRef, EntityList<ValueRef>>,
}

impl IrContext {
    pub fn new() -> Self {
        Self {
            ops: PrimaryMap::new(),
            values: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            regions: PrimaryMap::new(),
            uses: SecondaryMap::new(),
            dead: Tombstones::default(),
            types: TypeInterner::new(),
            paths: PathInterner::new(),
            value_pool: ListPool::new(),
            type_pool: ListPool::new(),
            result_values: SecondaryMap::new(),
            block_arg_values: SecondaryMap::new(),
        }
    }

    // ========================================================================
    // Operation
    // ========================================================================

    /// Create a detached operation and allocate its result values.
    ///
    /// # Panics
    ///
    /// Panics if `data.parent_block` is set, or if one of `data.regions`
    /// already belongs to another operation.
    pub fn create_op(&mut self, data: OperationData) -> OpRef {
        assert!(
            data.parent_block.is_none(),
            "create_op: operation must be created detached; attach it with push_op",
        );

        let operands: SmallVec<[ValueRef; 8]> = data.operands.as_slice(&self.value_pool).into();
        let result_types: SmallVec<[TypeRef; 4]> = data.results.as_slice(&self.type_pool).into();
        let regions = data.regions.clone();

        let op = self.ops.push(data);

        for r in regions {
            if let Some(owner) = self.regions[r].parent_op {
                panic!("create_op: region {r} already belongs to {owner}; cannot give it to {op}");
            }
            self.regions[r].parent_op = Some(op);
        }

        for (idx, &val) in operands.iter().enumerate() {
            self.add_use(val, op, idx as u32);
        }

        let mut results = EntityList::new();
        for (idx, &ty) in result_types.iter().enumerate() {
            let v = self.values.push(ValueData {
                def: ValueDef::OpResult(op, idx as u32),
                ty,
            });
            results.push(v, &mut self.value_pool);
        }
        self.result_values[op] = results;

        op
    }

    pub fn op(&self, op: OpRef) -> &OperationData {
        &self.ops[op]
    }

    /// Mutable access to operation data.
    ///
    /// Editing `operands` or `results` through this reference desyncs the
    /// use-chain; use [`set_operand`](Self::set_operand) and
    /// [`set_value_type`](Self::set_value_type) for those.
    pub fn op_mut(&mut self, op: OpRef) -> &mut OperationData {
        &mut self.ops[op]
    }

    pub fn op_name(&self, op: OpRef) -> OpName {
        let data = &self.ops[op];
        OpName {
            dialect: data.dialect,
            name: data.name,
        }
    }

    pub fn op_operands(&self, op: OpRef) -> &[ValueRef] {
        self.ops[op].operands.as_slice(&self.value_pool)
    }

    pub fn op_result_types(&self, op: OpRef) -> &[TypeRef] {
        self.ops[op].results.as_slice(&self.type_pool)
    }

    pub fn op_result(&self, op: OpRef, index: u32) -> ValueRef {
        self.result_values[op].as_slice(&self.value_pool)[index as usize]
    }

    pub fn op_results(&self, op: OpRef) -> &[ValueRef] {
        self.result_values[op].as_slice(&self.value_pool)
    }

    /// Replace the operand at `index`, moving the use between value chains.
    pub fn set_operand(&mut self, op: OpRef, index: usize, value: ValueRef) {
        let slot = &mut self.ops[op].operands.as_mut_slice(&mut self.value_pool)[index];
        let old = std::mem::replace(slot, value);
        if old != value {
            self.remove_use(old, op, index as u32);
            self.add_use(value, op, index as u32);
        }
    }

    /// Replace the whole operand list (its length may change).
    pub fn set_operands(&mut self, op: OpRef, values: &[ValueRef]) {
        let old: SmallVec<[ValueRef; 8]> = self.op_operands(op).into();
        for (idx, &v) in old.iter().enumerate() {
            self.remove_use(v, op, idx as u32);
        }
        let operands = &mut self.ops[op].operands;
        operands.clear(&mut self.value_pool);
        operands.extend(values.iter().copied(), &mut self.value_pool);
        for (idx, &v) in values.iter().enumerate() {
            self.add_use(v, op, idx as u32);
        }
    }

    /// The operation whose region contains `op`'s block, if any.
    pub fn parent_op(&self, op: OpRef) -> Option<OpRef> {
        self.ops[op]
            .parent_block
            .and_then(|b| self.block_parent_op(b))
    }

    /// Whether `ancestor` strictly encloses `op`.
    pub fn is_proper_ancestor(&self, ancestor: OpRef, op: OpRef) -> bool {
        let mut current = self.parent_op(op);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent_op(parent);
        }
        false
    }

    /// Block and index of `op`, or `None` if detached.
    pub fn op_position(&self, op: OpRef) -> Option<(BlockRef, usize)> {
        let block = self.ops[op].parent_block?;
        let index = self.blocks[block].ops.iter().position(|&o| o == op)?;
        Some((block, index))
    }

    pub fn is_op_live(&self, op: OpRef) -> bool {
        !self.dead.ops[op]
    }

    /// Remove every operand use held by `op` and by everything nested in it.
    pub fn drop_all_references(&mut self, op: OpRef) {
        let mut stack = vec![op];
        while let Some(op) = stack.pop() {
            let operands: SmallVec<[ValueRef; 8]> = self.op_operands(op).into();
            for (idx, &v) in operands.iter().enumerate() {
                self.remove_use(v, op, idx as u32);
            }
            self.ops[op].operands.clear(&mut self.value_pool);
            for &region in &self.ops[op].regions {
                for &block in &self.regions[region].blocks {
                    stack.extend(self.blocks[block].ops.iter().copied());
                }
            }
        }
    }

    /// Destroy a detached operation together with everything nested in it.
    ///
    /// # Panics
    ///
    /// Panics if the operation is still attached to a block, or if a value it
    /// defines is still used from outside the destroyed tree.
    pub fn destroy_op(&mut self, op: OpRef) {
        if let Some(block) = self.ops[op].parent_block {
            panic!("destroy_op: {op} is still attached to {block}; detach it first");
        }
        self.drop_all_references(op);
        self.release_op(op);
    }

    fn release_op(&mut self, op: OpRef) {
        let regions = self.ops[op].regions.clone();
        for region in regions {
            self.release_region(region);
        }
        for &v in self.result_values[op].as_slice(&self.value_pool) {
            assert!(
                self.uses[v].is_empty(),
                "destroy: result {v} of {op} still has {} use(s)",
                self.uses[v].len(),
            );
        }
        self.dead.ops[op] = true;
    }

    fn release_region(&mut self, region: RegionRef) {
        let blocks = self.regions[region].blocks.clone();
        for block in blocks {
            self.release_block(block);
        }
        self.dead.regions[region] = true;
    }

    fn release_block(&mut self, block: BlockRef) {
        let ops = self.blocks[block].ops.clone();
        for op in ops {
            self.release_op(op);
        }
        for &v in self.block_arg_values[block].as_slice(&self.value_pool) {
            assert!(
                self.uses[v].is_empty(),
                "destroy: argument {v} of {block} still has {} use(s)",
                self.uses[v].len(),
            );
        }
        self.dead.blocks[block] = true;
    }

    // ========================================================================
    // Value
    // ========================================================================

    pub fn value(&self, v: ValueRef) -> &ValueData {
        &self.values[v]
    }

    pub fn value_ty(&self, v: ValueRef) -> TypeRef {
        self.values[v].ty
    }

    pub fn value_def(&self, v: ValueRef) -> ValueDef {
        self.values[v].def
    }

    /// Change the type of a value in place, keeping the owning op's result
    /// list or block's argument list in agreement.
    pub fn set_value_type(&mut self, v: ValueRef, ty: TypeRef) {
        self.values[v].ty = ty;
        match self.values[v].def {
            ValueDef::OpResult(op, idx) => {
                self.ops[op].results.as_mut_slice(&mut self.type_pool)[idx as usize] = ty;
            }
            ValueDef::BlockArg(block, idx) => {
                self.blocks[block].args[idx as usize].ty = ty;
            }
        }
    }

    // ========================================================================
    // Block
    // ========================================================================

    pub fn create_block(&mut self, data: BlockData) -> BlockRef {
        let arg_types: SmallVec<[TypeRef; 4]> = data.args.iter().map(|a| a.ty).collect();
        let block = self.blocks.push(data);

        let mut args = EntityList::new();
        for (idx, ty) in arg_types.into_iter().enumerate() {
            let v = self.values.push(ValueData {
                def: ValueDef::BlockArg(block, idx as u32),
                ty,
            });
            args.push(v, &mut self.value_pool);
        }
        self.block_arg_values[block] = args;

        block
    }

    pub fn block(&self, b: BlockRef) -> &BlockData {
        &self.blocks[b]
    }

    pub fn block_mut(&mut self, b: BlockRef) -> &mut BlockData {
        &mut self.blocks[b]
    }

    pub fn block_arg(&self, b: BlockRef, index: u32) -> ValueRef {
        self.block_arg_values[b].as_slice(&self.value_pool)[index as usize]
    }

    pub fn block_args(&self, b: BlockRef) -> &[ValueRef] {
        self.block_arg_values[b].as_slice(&self.value_pool)
    }

    pub fn block_parent_op(&self, b: BlockRef) -> Option<OpRef> {
        self.blocks[b]
            .parent_region
            .and_then(|r| self.regions[r].parent_op)
    }

    /// Successor blocks named by the block's last operation.
    pub fn block_successors(&self, b: BlockRef) -> &[BlockRef] {
        match self.blocks[b].ops.last() {
            Some(&term) => &self.ops[term].successors,
            None => &[],
        }
    }

    /// Region and index of `block`, or `None` if detached.
    pub fn block_position(&self, block: BlockRef) -> Option<(RegionRef, usize)> {
        let region = self.blocks[block].parent_region?;
        let index = self.regions[region].blocks.iter().position(|&b| b == block)?;
        Some((region, index))
    }

    pub fn is_block_live(&self, block: BlockRef) -> bool {
        !self.dead.blocks[block]
    }

    /// # Panics
    ///
    /// Panics if the operation already belongs to a block.
    pub fn push_op(&mut self, block: BlockRef, op: OpRef) {
        let len = self.blocks[block].ops.len();
        self.insert_op_at(block, len, op);
    }

    /// # Panics
    ///
    /// Panics if the operation already belongs to a block, or if `before` is
    /// not in `block`.
    pub fn insert_op_before(&mut self, block: BlockRef, before: OpRef, op: OpRef) {
        let Some(pos) = self.blocks[block].ops.iter().position(|&o| o == before) else {
            panic!("insert_op_before: {before} is not in {block}");
        };
        self.insert_op_at(block, pos, op);
    }

    /// Insert a detached operation at `index` within `block`.
    pub fn insert_op_at(&mut self, block: BlockRef, index: usize, op: OpRef) {
        if let Some(owner) = self.ops[op].parent_block {
            panic!("insert_op: {op} already belongs to {owner}; detach it first");
        }
        self.blocks[block].ops.insert(index, op);
        self.ops[op].parent_block = Some(block);
    }

    /// Detach an operation from a block without destroying it.
    pub fn remove_op_from_block(&mut self, block: BlockRef, op: OpRef) {
        self.blocks[block].ops.retain(|o| *o != op);
        if self.ops[op].parent_block == Some(block) {
            self.ops[op].parent_block = None;
        }
    }

    /// Detach an operation from whatever block holds it, returning the old
    /// position.
    pub fn detach_op(&mut self, op: OpRef) -> Option<(BlockRef, usize)> {
        let (block, index) = self.op_position(op)?;
        self.blocks[block].ops.remove(index);
        self.ops[op].parent_block = None;
        Some((block, index))
    }

    /// Destroy a detached block and all operations in it.
    pub fn destroy_block(&mut self, block: BlockRef) {
        self.destroy_blocks(&[block]);
    }

    /// Destroy several detached blocks at once; values may flow between them.
    pub fn destroy_blocks(&mut self, blocks: &[BlockRef]) {
        for &block in blocks {
            if let Some(region) = self.blocks[block].parent_region {
                panic!("destroy_block: {block} is still attached to {region}; detach it first");
            }
        }
        for &block in blocks {
            let ops = self.blocks[block].ops.clone();
            for op in ops {
                self.drop_all_references(op);
            }
        }
        for &block in blocks {
            self.release_block(block);
        }
    }

    // ========================================================================
    // Region
    // ========================================================================

    /// # Panics
    ///
    /// Panics if any block in `data.blocks` already belongs to a region.
    pub fn create_region(&mut self, data: RegionData) -> RegionRef {
        let blocks = data.blocks.clone();
        let region = self.regions.push(data);
        for b in blocks {
            if let Some(owner) = self.blocks[b].parent_region {
                panic!("create_region: {b} already belongs to {owner}; cannot give it to {region}");
            }
            self.blocks[b].parent_region = Some(region);
        }
        region
    }

    pub fn region(&self, r: RegionRef) -> &RegionData {
        &self.regions[r]
    }

    pub fn region_mut(&mut self, r: RegionRef) -> &mut RegionData {
        &mut self.regions[r]
    }

    pub fn is_region_live(&self, r: RegionRef) -> bool {
        !self.dead.regions[r]
    }

    /// Insert a detached block into `region` at `index`.
    pub fn insert_block(&mut self, region: RegionRef, index: usize, block: BlockRef) {
        if let Some(owner) = self.blocks[block].parent_region {
            panic!("insert_block: {block} already belongs to {owner}; detach it first");
        }
        self.regions[region].blocks.insert(index, block);
        self.blocks[block].parent_region = Some(region);
    }

    pub fn push_block(&mut self, region: RegionRef, block: BlockRef) {
        let len = self.regions[region].blocks.len();
        self.insert_block(region, len, block);
    }

    /// Detach a block from its region, returning the old position.
    pub fn detach_block(&mut self, block: BlockRef) -> Option<(RegionRef, usize)> {
        let (region, index) = self.block_position(block)?;
        self.regions[region].blocks.remove(index);
        self.blocks[block].parent_region = None;
        Some((region, index))
    }

    /// Destroy a region that no operation owns, with all of its blocks.
    pub fn destroy_region(&mut self, region: RegionRef) {
        if let Some(owner) = self.regions[region].parent_op {
            panic!("destroy_region: {region} is still owned by {owner}");
        }
        let blocks = self.regions[region].blocks.clone();
        for &block in &blocks {
            let ops = self.blocks[block].ops.clone();
            for op in ops {
                self.drop_all_references(op);
            }
        }
        self.release_region(region);
    }

    // ========================================================================
    // Use-chain
    // ========================================================================

    pub fn uses(&self, v: ValueRef) -> &[Use] {
        &self.uses[v]
    }

    pub fn has_uses(&self, v: ValueRef) -> bool {
        !self.uses[v].is_empty()
    }

    fn add_use(&mut self, v: ValueRef, user: OpRef, operand_index: u32) {
        self.uses[v].push(Use {
            user,
            operand_index,
        });
    }

    fn remove_use(&mut self, v: ValueRef, user: OpRef, operand_index: u32) {
        self.uses[v].retain(|u| !(u.user == user && u.operand_index == operand_index));
    }

    /// Replace all uses of `old` with `new`.
    pub fn replace_all_uses(&mut self, old: ValueRef, new: ValueRef) {
        self.replace_uses_if(old, new, |_| true);
    }

    /// Replace the uses of `old` accepted by `filter` with `new`.
    pub fn replace_uses_if(&mut self, old: ValueRef, new: ValueRef, filter: impl Fn(Use) -> bool) {
        if old == new {
            return;
        }
        let (moved, kept): (SmallVec<[Use; 2]>, SmallVec<[Use; 2]>) =
            std::mem::take(&mut self.uses[old])
                .into_iter()
                .partition(|u| filter(*u));
        self.uses[old] = kept;
        for u in moved {
            let slice = self.ops[u.user].operands.as_mut_slice(&mut self.value_pool);
            debug_assert_eq!(slice[u.operand_index as usize], old);
            slice[u.operand_index as usize] = new;
            self.uses[new].push(u);
        }
    }

    // ========================================================================
    // Cloning
    // ========================================================================

    /// Clone `op` and everything nested in it into a new detached operation.
    ///
    /// Operands and successors are looked up in `mapping` (falling back to the
    /// original); the clone's results and blocks are recorded in it.
    pub fn clone_op(&mut self, op: OpRef, mapping: &mut IrMapping) -> OpRef {
        let data = &self.ops[op];
        let location = data.location;
        let mut builder = OperationDataBuilder::new(location, data.dialect, data.name)
            .attrs(data.attributes.clone())
            .successors(data.successors.iter().map(|&b| mapping.lookup_block(b)))
            .operands(
                data.operands
                    .as_slice(&self.value_pool)
                    .iter()
                    .map(|&v| mapping.lookup_value(v)),
            )
            .results(self.op_result_types(op).iter().copied());
        let regions = data.regions.clone();

        for region in regions {
            let region_loc = self.regions[region].location;
            let clone = self.create_region(RegionData::new(region_loc, []));
            self.clone_region_into(region, clone, 0, mapping);
            builder = builder.region(clone);
        }

        let data = builder.build(self);
        let new_op = self.create_op(data);
        let results: SmallVec<[ValueRef; 4]> = self.op_results(op).into();
        for (i, old) in results.into_iter().enumerate() {
            mapping.map_value(old, self.op_result(new_op, i as u32));
        }
        new_op
    }

    /// Clone the blocks of `src` into `dest` starting at `index`.
    ///
    /// Returns the new blocks in order.
    pub fn clone_region_into(
        &mut self,
        src: RegionRef,
        dest: RegionRef,
        index: usize,
        mapping: &mut IrMapping,
    ) -> Vec<BlockRef> {
        let src_blocks = self.regions[src].blocks.clone();

        // Blocks first, so successors and arguments resolve regardless of order.
        let mut new_blocks = Vec::with_capacity(src_blocks.len());
        for &block in &src_blocks {
            let data = BlockData {
                location: self.blocks[block].location,
                args: self.blocks[block].args.clone(),
                ops: SmallVec::new(),
                parent_region: None,
            };
            let clone = self.create_block(data);
            mapping.map_block(block, clone);
            let old_args: SmallVec<[ValueRef; 4]> = self.block_args(block).into();
            for (i, old) in old_args.into_iter().enumerate() {
                mapping.map_value(old, self.block_arg(clone, i as u32));
            }
            new_blocks.push(clone);
        }

        let mut cloned_ops = Vec::new();
        for (&block, &clone) in src_blocks.iter().zip(&new_blocks) {
            let ops = self.blocks[block].ops.clone();
            for op in ops {
                let new_op = self.clone_op(op, mapping);
                self.push_op(clone, new_op);
                cloned_ops.push(new_op);
            }
        }

        // Operands may refer to values defined in a later block.
        let mut stack = cloned_ops;
        while let Some(op) = stack.pop() {
            let operands: SmallVec<[ValueRef; 8]> = self.op_operands(op).into();
            for (i, v) in operands.into_iter().enumerate() {
                let mapped = mapping.lookup_value(v);
                if mapped != v {
                    self.set_operand(op, i, mapped);
                }
            }
            for &region in &self.ops[op].regions {
                for &block in &self.regions[region].blocks {
                    stack.extend(self.blocks[block].ops.iter().copied());
                }
            }
        }

        for (i, &block) in new_blocks.iter().enumerate() {
            self.insert_block(dest, index + i, block);
        }
        new_blocks
    }
}

impl Default for IrContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// IrMapping
// ============================================================================

/// Value and block correspondence built up while cloning.
#[derive(Debug, Default, Clone)]
pub struct IrMapping {
    values: HashMap<ValueRef, ValueRef>,
    blocks: HashMap<BlockRef, BlockRef>,
}

impl IrMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_value(&mut self, from: ValueRef, to: ValueRef) {
        self.values.insert(from, to);
    }

    pub fn map_block(&mut self, from: BlockRef, to: BlockRef) {
        self.blocks.insert(from, to);
    }

    /// Mapped value, or `v` itself when unmapped.
    pub fn lookup_value(&self, v: ValueRef) -> ValueRef {
        self.values.get(&v).copied().unwrap_or(v)
    }

    /// Mapped block, or `b` itself when unmapped.
    pub fn lookup_block(&self, b: BlockRef) -> BlockRef {
        self.blocks.get(&b).copied().unwrap_or(b)
    }

    pub fn contains_value(&self, v: ValueRef) -> bool {
        self.values.contains_key(&v)
    }
}

// ============================================================================
// OperationDataBuilder
// ============================================================================

/// Builder for [`OperationData`].
///
/// Collects operands and result types in `Vec`s and packs them into the
/// context's pools on [`build`](Self::build).
pub struct OperationDataBuilder {
    location: Location,
    dialect: Symbol,
    name: Symbol,
    operands: Vec<ValueRef>,
    results: Vec<TypeRef>,
    attributes: BTreeMap<Symbol, Attribute>,
    regions: SmallVec<[RegionRef; 4]>,
    successors: SmallVec<[BlockRef; 4]>,
}

impl OperationDataBuilder {
    pub fn new(location: Location, dialect: Symbol, name: Symbol) -> Self {
        Self {
            location,
            dialect,
            name,
            operands: Vec::new(),
            results: Vec::new(),
            attributes: BTreeMap::new(),
            regions: SmallVec::new(),
            successors: SmallVec::new(),
        }
    }

    pub fn named(location: Location, name: OpName) -> Self {
        Self::new(location, name.dialect, name.name)
    }

    pub fn operand(mut self, v: ValueRef) -> Self {
        self.operands.push(v);
        self
    }

    pub fn operands(mut self, vs: impl IntoIterator<Item = ValueRef>) -> Self {
        self.operands.extend(vs);
        self
    }

    pub fn result(mut self, ty: TypeRef) -> Self {
        self.results.push(ty);
        self
    }

    pub fn results(mut self, tys: impl IntoIterator<Item = TypeRef>) -> Self {
        self.results.extend(tys);
        self
    }

    pub fn attr(mut self, key: impl Into<Symbol>, val: Attribute) -> Self {
        self.attributes.insert(key.into(), val);
        self
    }

    pub fn attrs(mut self, attrs: impl IntoIterator<Item = (Symbol, Attribute)>) -> Self {
        self.attributes.extend(attrs);
        self
    }

    pub fn region(mut self, r: RegionRef) -> Self {
        self.regions.push(r);
        self
    }

    pub fn successor(mut self, b: BlockRef) -> Self {
        self.successors.push(b);
        self
    }

    pub fn successors(mut self, bs: impl IntoIterator<Item = BlockRef>) -> Self {
        self.successors.extend(bs);
        self
    }

    pub fn build(self, ctx: &mut IrContext) -> OperationData {
        let mut operands = EntityList::new();
        operands.extend(self.operands, &mut ctx.value_pool);
        let mut results = EntityList::new();
        results.extend(self.results, &mut ctx.type_pool);
        OperationData {
            location: self.location,
            dialect: self.dialect,
            name: self.name,
            operands,
            results,
            attributes: self.attributes,
            regions: self.regions,
            successors: self.successors,
            parent_block: None,
        }
    }
}
