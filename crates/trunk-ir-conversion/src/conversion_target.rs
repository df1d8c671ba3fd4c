//! Conversion target.
//!
//! Decides which operations are legal after conversion. Legality is resolved
//! from the most specific rule available: a rule for the operation name, then
//! a rule for its dialect, then the callback for unknown operations.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::rc::Rc;

use trunk_ir::walk::{self, WalkAction};
use trunk_ir::{IrContext, OpName, OpRef, RegionRef, Symbol};

use crate::error::TargetError;

/// What a rule says about the operations it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalizationAction {
    /// Always legal.
    Legal,
    /// Legality is decided per operation instance by a callback.
    Dynamic,
    /// Must be converted away.
    Illegal,
}

/// Extra facts about an operation found to be legal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegalOpDetails {
    /// Operations nested inside are legal too and need not be visited.
    pub is_recursively_legal: bool,
}

/// Result of a legality query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Legality {
    Legal(LegalOpDetails),
    /// The target explicitly rejects this operation.
    Illegal,
    /// Not known to be legal; the operation must be converted if possible.
    Unknown,
}

/// Per-instance legality callback. `None` defers to the callback registered
/// before it, then to the next less specific rule.
type DynamicLegalityFn = dyn Fn(&IrContext, OpRef) -> Option<bool>;

struct LegalizationInfo {
    action: LegalizationAction,
    is_recursively_legal: bool,
    legality: Option<Rc<DynamicLegalityFn>>,
}

impl LegalizationInfo {
    fn new(action: LegalizationAction) -> Self {
        Self {
            action,
            is_recursively_legal: false,
            legality: None,
        }
    }
}

/// Conversion target: which operations and dialects are legal.
///
/// Operations covered by no rule are neither legal nor illegal; the drivers
/// try to convert them and, in partial mode, leave them alone if they cannot.
#[derive(Default)]
pub struct ConversionTarget {
    /// Rules for specific operations.
    ops: HashMap<OpName, LegalizationInfo>,
    /// Per-instance predicates narrowing recursive legality.
    recursive_legality: HashMap<OpName, Rc<DynamicLegalityFn>>,
    /// Rules for entire dialects.
    dialects: HashMap<Symbol, LegalizationAction>,
    /// Callbacks for dialects marked `Dynamic`.
    dialect_legality: HashMap<Symbol, Rc<DynamicLegalityFn>>,
    /// Fallback for operations no other rule answers.
    unknown_legality: Option<Rc<DynamicLegalityFn>>,
}

/// Chain `f` in front of `previous`, so `previous` answers when `f` defers.
fn compose(
    previous: Option<Rc<DynamicLegalityFn>>,
    f: Rc<DynamicLegalityFn>,
) -> Rc<DynamicLegalityFn> {
    match previous {
        None => f,
        Some(previous) => Rc::new(move |ctx: &IrContext, op: OpRef| {
            f(ctx, op).or_else(|| previous(ctx, op))
        }),
    }
}

impl ConversionTarget {
    /// Create a target with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Operation rules
    // ========================================================================

    /// Set the action for operations named `name`, keeping any callbacks
    /// and recursive legality already registered for it.
    pub fn set_op_action(&mut self, name: OpName, action: LegalizationAction) {
        self.ops
            .entry(name)
            .and_modify(|info| info.action = action)
            .or_insert_with(|| LegalizationInfo::new(action));
    }

    /// Mark a specific operation as legal.
    pub fn add_legal_op(&mut self, dialect: &str, op: &str) {
        self.set_op_action(OpName::from_dynamic(dialect, op), LegalizationAction::Legal);
    }

    /// Mark a specific operation as illegal.
    pub fn add_illegal_op(&mut self, dialect: &str, op: &str) {
        self.set_op_action(OpName::from_dynamic(dialect, op), LegalizationAction::Illegal);
    }

    /// Decide legality of `dialect.op` per instance.
    ///
    /// Registering a second callback for the same operation consults the new
    /// one first and falls back to the old one when it answers `None`.
    pub fn add_dynamically_legal_op(
        &mut self,
        dialect: &str,
        op: &str,
        f: impl Fn(&IrContext, OpRef) -> Option<bool> + 'static,
    ) {
        let name = OpName::from_dynamic(dialect, op);
        self.set_op_action(name, LegalizationAction::Dynamic);
        if let Some(info) = self.ops.get_mut(&name) {
            info.legality = Some(compose(info.legality.take(), Rc::new(f)));
        }
    }

    /// Treat everything nested inside a legal `dialect.op` as legal too.
    pub fn mark_op_recursively_legal(
        &mut self,
        dialect: &str,
        op: &str,
    ) -> Result<(), TargetError> {
        let name = OpName::from_dynamic(dialect, op);
        self.set_recursively_legal(name)?;
        self.recursive_legality.remove(&name);
        Ok(())
    }

    /// Like [`mark_op_recursively_legal`](Self::mark_op_recursively_legal),
    /// but only for instances where `f` agrees. A `None` answer counts as
    /// agreement.
    pub fn mark_op_recursively_legal_if(
        &mut self,
        dialect: &str,
        op: &str,
        f: impl Fn(&IrContext, OpRef) -> Option<bool> + 'static,
    ) -> Result<(), TargetError> {
        let name = OpName::from_dynamic(dialect, op);
        self.set_recursively_legal(name)?;
        let previous = self.recursive_legality.remove(&name);
        self.recursive_legality.insert(name, compose(previous, Rc::new(f)));
        Ok(())
    }

    fn set_recursively_legal(&mut self, name: OpName) -> Result<(), TargetError> {
        match self.ops.get_mut(&name) {
            Some(info) if info.action != LegalizationAction::Illegal => {
                info.is_recursively_legal = true;
                Ok(())
            }
            _ => Err(TargetError::NotLegal { name }),
        }
    }

    // ========================================================================
    // Dialect rules
    // ========================================================================

    /// Set the action for every operation of the given dialects.
    pub fn set_dialect_action(&mut self, dialects: &[&str], action: LegalizationAction) {
        for &dialect in dialects {
            self.dialects.insert(Symbol::from_dynamic(dialect), action);
        }
    }

    /// Mark an entire dialect as legal.
    pub fn add_legal_dialect(&mut self, dialect: &str) {
        self.set_dialect_action(&[dialect], LegalizationAction::Legal);
    }

    /// Mark an entire dialect as illegal.
    pub fn add_illegal_dialect(&mut self, dialect: &str) {
        self.set_dialect_action(&[dialect], LegalizationAction::Illegal);
    }

    /// Decide legality of a dialect's operations per instance. Callbacks
    /// compose like those of [`add_dynamically_legal_op`](Self::add_dynamically_legal_op).
    pub fn add_dynamically_legal_dialect(
        &mut self,
        dialect: &str,
        f: impl Fn(&IrContext, OpRef) -> Option<bool> + 'static,
    ) {
        let dialect = Symbol::from_dynamic(dialect);
        self.dialects.insert(dialect, LegalizationAction::Dynamic);
        let previous = self.dialect_legality.remove(&dialect);
        self.dialect_legality.insert(dialect, compose(previous, Rc::new(f)));
    }

    /// Decide legality of operations that no operation or dialect rule
    /// covers.
    pub fn mark_unknown_op_dynamically_legal(
        &mut self,
        f: impl Fn(&IrContext, OpRef) -> Option<bool> + 'static,
    ) {
        self.unknown_legality = Some(compose(self.unknown_legality.take(), Rc::new(f)));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The action of the most specific rule covering operations named
    /// `name`, if any.
    pub fn op_action(&self, name: OpName) -> Option<LegalizationAction> {
        self.rules(name).next().map(|(action, _)| action)
    }

    /// Rules that apply to `name`, most specific first: the operation rule,
    /// the dialect rule, then the unknown-op callback.
    fn rules(
        &self,
        name: OpName,
    ) -> impl Iterator<Item = (LegalizationAction, Option<&Rc<DynamicLegalityFn>>)> {
        let op_rule = self
            .ops
            .get(&name)
            .map(|info| (info.action, info.legality.as_ref()));
        let dialect_rule = self
            .dialects
            .get(&name.dialect)
            .map(|&action| (action, self.dialect_legality.get(&name.dialect)));
        let unknown_rule = self
            .unknown_legality
            .as_ref()
            .map(|f| (LegalizationAction::Dynamic, Some(f)));
        op_rule.into_iter().chain(dialect_rule).chain(unknown_rule)
    }

    /// First definite answer along the rule chain. A dynamic rule answering
    /// `None` passes the question to the next rule.
    fn decide(&self, ctx: &IrContext, op: OpRef) -> Option<bool> {
        self.rules(ctx.op_name(op))
            .find_map(|(action, legality)| match action {
                LegalizationAction::Legal => Some(true),
                LegalizationAction::Illegal => Some(false),
                LegalizationAction::Dynamic => legality.and_then(|f| f(ctx, op)),
            })
    }

    /// `Some` if `op` is legal, with details about its nested operations.
    pub fn is_legal(&self, ctx: &IrContext, op: OpRef) -> Option<LegalOpDetails> {
        (self.decide(ctx, op) == Some(true)).then(|| self.details(ctx, op))
    }

    fn details(&self, ctx: &IrContext, op: OpRef) -> LegalOpDetails {
        let name = ctx.op_name(op);
        let is_recursively_legal = self
            .ops
            .get(&name)
            .is_some_and(|info| info.is_recursively_legal)
            && self
                .recursive_legality
                .get(&name)
                .is_none_or(|f| f(ctx, op).unwrap_or(true));
        LegalOpDetails {
            is_recursively_legal,
        }
    }

    /// Whether the target explicitly rejects `op`: an illegal rule, or a
    /// dynamic rule answering `Some(false)`, decides before any legal one.
    pub fn is_illegal(&self, ctx: &IrContext, op: OpRef) -> bool {
        self.decide(ctx, op) == Some(false)
    }

    /// Three-way legality of `op`.
    pub fn legality(&self, ctx: &IrContext, op: OpRef) -> Legality {
        match self.decide(ctx, op) {
            Some(true) => Legality::Legal(self.details(ctx, op)),
            Some(false) => Legality::Illegal,
            None => Legality::Unknown,
        }
    }

    /// Find operations in `region` that are not legal, skipping the insides
    /// of recursively legal operations.
    pub fn verify(&self, ctx: &IrContext, region: RegionRef) -> Vec<IllegalOp> {
        let mut illegal = Vec::new();
        let _ = walk::walk_region::<()>(ctx, region, &mut |op| match self.is_legal(ctx, op) {
            Some(details) if details.is_recursively_legal => {
                ControlFlow::Continue(WalkAction::Skip)
            }
            Some(_) => ControlFlow::Continue(WalkAction::Advance),
            None => {
                illegal.push(IllegalOp {
                    op,
                    name: ctx.op_name(op),
                });
                ControlFlow::Continue(WalkAction::Advance)
            }
        });
        illegal
    }
}

/// An operation that [`ConversionTarget::verify`] found not to be legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalOp {
    pub op: OpRef,
    /// Name of `op`, kept for reporting.
    pub name: OpName,
}

impl std::fmt::Display for IllegalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.op)
    }
}
