//! Legalization drivers.
//!
//! The drivers collect the operations under the given roots up front (parents
//! before their nested operations, blocks in reverse post-order) and legalize
//! them one at a time with a single [`ConversionRewriter`]. Operations created
//! or updated by a pattern are legalized right after it runs, inside the same
//! savepoint, so a pattern whose output cannot be made legal is undone along
//! with everything it triggered.

use std::collections::HashSet;

use smallvec::SmallVec;
use tracing::{debug, trace};
use trunk_ir::walk;
use trunk_ir::{IrContext, OpRef, ValueRef};

use crate::conversion_target::ConversionTarget;
use crate::error::{ConsistencyViolation, ConversionErrorKind, ConversionResult};
use crate::pattern::{ConversionPattern, FrozenPatternSet};
use crate::rewriter::{ConversionRewriter, MatchFailure, RewriterState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConversionMode {
    /// Convert what can be converted; fail only on explicitly illegal
    /// operations.
    Partial,
    /// Every operation must end up legal.
    Full,
    /// Find out what would convert, then roll everything back.
    Analysis,
}

/// Applies patterns to a single operation until it is legal.
struct OperationLegalizer<'t> {
    target: &'t ConversionTarget,
    patterns: &'t FrozenPatternSet,
    /// Patterns currently on the legalization stack, by index.
    active: HashSet<usize>,
    violation: Option<ConsistencyViolation>,
}

impl<'t> OperationLegalizer<'t> {
    fn new(target: &'t ConversionTarget, patterns: &'t FrozenPatternSet) -> Self {
        Self {
            target,
            patterns,
            active: HashSet::new(),
            violation: None,
        }
    }

    fn legalize(&mut self, rewriter: &mut ConversionRewriter<'_>, op: OpRef) -> bool {
        let name = rewriter.ctx().op_name(op);
        if let Some(details) = self.target.is_legal(rewriter.ctx(), op) {
            trace!("{name} ({op}) is legal");
            if details.is_recursively_legal {
                rewriter.mark_nested_ops_ignored(op);
            }
            return true;
        }
        if rewriter.is_op_ignored(op) {
            trace!("{name} ({op}) is ignored");
            return true;
        }
        debug!("legalizing {name} ({op})");
        self.legalize_with_pattern(rewriter, op)
    }

    fn legalize_with_pattern(&mut self, rewriter: &mut ConversionRewriter<'_>, op: OpRef) -> bool {
        let patterns = self.patterns;
        let name = rewriter.ctx().op_name(op);
        for (index, pattern) in patterns.patterns_for(name) {
            if self.active.contains(&index) {
                trace!("skipping {} on {op}: already being applied", pattern.name());
                continue;
            }

            let state = rewriter.state();
            let saved = rewriter.enter_pattern(op, pattern.type_converter().cloned());
            let operands: SmallVec<[ValueRef; 8]> = rewriter.ctx().op_operands(op).into();
            let legalized = match rewriter.get_remapped_values(&operands) {
                Ok(operands) => {
                    let recursive = pattern.has_bounded_rewrite_recursion();
                    if !recursive {
                        self.active.insert(index);
                    }
                    let legalized = pattern.match_and_rewrite(op, &operands, rewriter)
                        && self.legalize_pattern_result(rewriter, state, op, pattern);
                    if !recursive {
                        self.active.remove(&index);
                    }
                    legalized
                }
                Err(err) => rewriter.notify_match_failure(op, err),
            };
            rewriter.exit_pattern(saved);

            if legalized {
                debug!("{} legalized {name} ({op})", pattern.name());
                return true;
            }
            debug!("{} failed on {name} ({op}); rolling back", pattern.name());
            rewriter.reset_state(state);
            if self.violation.is_some() {
                return false;
            }
        }
        false
    }

    /// Check what a successful pattern left behind: the root must have been
    /// rewritten, and everything the pattern updated or created must be
    /// legal in turn.
    fn legalize_pattern_result(
        &mut self,
        rewriter: &mut ConversionRewriter<'_>,
        state: RewriterState,
        op: OpRef,
        pattern: &dyn ConversionPattern,
    ) -> bool {
        if !rewriter.root_rewritten(state, op) {
            self.violation = Some(ConsistencyViolation::RootNotRewritten {
                pattern: pattern.name(),
                op,
            });
            return false;
        }
        let updated = rewriter.updated_ops(state);
        if !updated.into_iter().all(|op| self.legalize(rewriter, op)) {
            return false;
        }
        let created = rewriter.created_ops(state);
        created.into_iter().all(|op| self.legalize(rewriter, op))
    }
}

struct OperationConverter<'c, 'f> {
    mode: ConversionMode,
    legalizer: OperationLegalizer<'c>,
    /// Unconverted operations (partial) or legalizable ones (analysis).
    tracked_ops: Option<&'c mut HashSet<OpRef>>,
    on_match_failure: Option<&'f mut dyn FnMut(&MatchFailure)>,
}

impl<'c, 'f> OperationConverter<'c, 'f> {
    fn new(
        mode: ConversionMode,
        target: &'c ConversionTarget,
        patterns: &'c FrozenPatternSet,
        tracked_ops: Option<&'c mut HashSet<OpRef>>,
    ) -> Self {
        Self {
            mode,
            legalizer: OperationLegalizer::new(target, patterns),
            tracked_ops,
            on_match_failure: None,
        }
    }

    fn run(mut self, ctx: &mut IrContext, roots: &[OpRef]) -> ConversionResult<()> {
        let to_convert = self.compute_conversion_set(ctx, roots)?;
        debug!("{:?} conversion of {} operation(s)", self.mode, to_convert.len());

        let mut rewriter = ConversionRewriter::new(ctx);
        if self.on_match_failure.is_some() {
            rewriter.collect_match_failures();
        }
        for op in to_convert {
            let result = self.convert(&mut rewriter, op);
            if let Some(callback) = self.on_match_failure.as_mut() {
                for failure in rewriter.take_match_failures() {
                    (**callback)(&failure);
                }
            }
            if let Err(err) = result {
                debug!("conversion failed: {err}");
                rewriter.discard_rewrites();
                return Err(err);
            }
        }

        if self.mode == ConversionMode::Analysis {
            rewriter.discard_rewrites();
            return Ok(());
        }
        if let Err(err) = rewriter.finalize() {
            debug!("conversion failed at commit: {err}");
            rewriter.discard_rewrites();
            return Err(err);
        }
        rewriter.apply_rewrites();
        Ok(())
    }

    fn convert(
        &mut self,
        rewriter: &mut ConversionRewriter<'_>,
        op: OpRef,
    ) -> ConversionResult<()> {
        let legalized = self.legalizer.legalize(rewriter, op);
        if let Some(violation) = self.legalizer.violation.take() {
            return Err(violation.into());
        }

        let name = rewriter.ctx().op_name(op);
        match (legalized, self.mode) {
            (false, ConversionMode::Full) => {
                return Err(ConversionErrorKind::FailedToLegalize { op, name }.into());
            }
            (false, ConversionMode::Partial) => {
                if self.legalizer.target.is_illegal(rewriter.ctx(), op) {
                    return Err(ConversionErrorKind::IllegalOperation { op, name }.into());
                }
                if let Some(unconverted) = self.tracked_ops.as_deref_mut() {
                    unconverted.insert(op);
                }
            }
            (true, ConversionMode::Analysis) => {
                if let Some(legalizable) = self.tracked_ops.as_deref_mut() {
                    legalizable.insert(op);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Operations to legalize, parents first. The insides of recursively
    /// legal operations are left out.
    fn compute_conversion_set(
        &self,
        ctx: &IrContext,
        roots: &[OpRef],
    ) -> ConversionResult<Vec<OpRef>> {
        let mut to_convert = Vec::new();
        for &root in roots {
            self.collect_op(ctx, root, &mut to_convert)?;
        }
        Ok(to_convert)
    }

    fn collect_op(&self, ctx: &IrContext, op: OpRef, out: &mut Vec<OpRef>) -> ConversionResult<()> {
        out.push(op);
        if self
            .legalizer
            .target
            .is_legal(ctx, op)
            .is_some_and(|details| details.is_recursively_legal)
        {
            return Ok(());
        }

        for &region in &ctx.op(op).regions {
            let mut blocks = walk::reverse_post_order(ctx, region);
            let unreachable = walk::unreachable_blocks(ctx, region);
            if !unreachable.is_empty() {
                if self.mode != ConversionMode::Partial {
                    return Err(ConversionErrorKind::UnreachableBlocks {
                        region,
                        count: unreachable.len(),
                    }
                    .into());
                }
                blocks.extend(unreachable);
            }
            for block in blocks {
                for &nested in &ctx.block(block).ops {
                    self.collect_op(ctx, nested, out)?;
                }
            }
        }
        Ok(())
    }
}

/// Convert what can be converted under `ops`.
///
/// Operations no pattern can legalize are left alone and, if `unconverted`
/// is given, recorded there. Fails, leaving the IR untouched, only if such an
/// operation is explicitly illegal for `target`; `unconverted` may then be
/// incomplete.
#[tracing::instrument(skip_all)]
pub fn apply_partial_conversion(
    ctx: &mut IrContext,
    ops: &[OpRef],
    target: &ConversionTarget,
    patterns: &FrozenPatternSet,
    unconverted: Option<&mut HashSet<OpRef>>,
) -> ConversionResult<()> {
    OperationConverter::new(ConversionMode::Partial, target, patterns, unconverted).run(ctx, ops)
}

/// Convert every operation under `ops` to a legal one, or fail and leave the
/// IR untouched.
///
/// Regions with blocks unreachable from their entry are rejected.
#[tracing::instrument(skip_all)]
pub fn apply_full_conversion(
    ctx: &mut IrContext,
    ops: &[OpRef],
    target: &ConversionTarget,
    patterns: &FrozenPatternSet,
) -> ConversionResult<()> {
    OperationConverter::new(ConversionMode::Full, target, patterns, None).run(ctx, ops)
}

/// Record in `legalizable` the operations under `ops` that a conversion would
/// make (or find) legal. The IR is never changed.
///
/// `on_match_failure`, if given, receives every match failure reported by a
/// pattern along the way.
#[tracing::instrument(skip_all)]
pub fn apply_analysis_conversion(
    ctx: &mut IrContext,
    ops: &[OpRef],
    target: &ConversionTarget,
    patterns: &FrozenPatternSet,
    legalizable: &mut HashSet<OpRef>,
    on_match_failure: Option<&mut dyn FnMut(&MatchFailure)>,
) -> ConversionResult<()> {
    let mut converter =
        OperationConverter::new(ConversionMode::Analysis, target, patterns, Some(legalizable));
    converter.on_match_failure = on_match_failure;
    converter.run(ctx, ops)
}
