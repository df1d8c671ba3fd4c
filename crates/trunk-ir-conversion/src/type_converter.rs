//! Type converter for dialect conversion.
//!
//! A [`TypeConverter`] holds an ordered list of conversion rules. Rules are
//! consulted most-recently-registered first; each one may decline, succeed
//! with zero or more result types, or abort the conversion outright. Results
//! (including failures) are cached until the next rule is registered.
//!
//! Materialization callbacks bridge the gap when a value's type disagrees
//! with what its users expect, by building cast-like operations.

use std::cell::RefCell;
use std::collections::HashMap;

use smallvec::{SmallVec, smallvec};
use tracing::trace;
use trunk_ir::{
    Attribute, AttributeKind, BlockRef, IrContext, Location, OpBuilder, OpName, OpRef,
    OperationDataBuilder, RegionRef, TypeInterner, TypeKind, TypeRef, ValueRef,
};

use crate::signature_conversion::{FunctionType, SignatureConversion};

/// Converted types of a single source type. Usually one element.
pub type TypeList = SmallVec<[TypeRef; 2]>;

/// What a multi-result conversion rule did with its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The rule does not handle this type; try the next one.
    NotApplicable,
    /// The type cannot be converted; stop without trying further rules.
    Failure,
    /// The rule pushed the converted types (possibly none).
    Success,
}

/// Outcome of a type-attribute conversion rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AttributeConversionResult {
    #[default]
    NotApplicable,
    /// `None` means the attribute should be dropped.
    Converted(Option<Attribute>),
    Abort,
}

/// Which of the three materialization lists a request goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterializationKind {
    /// Rebuild a block argument that a signature conversion replaced.
    Argument,
    /// Produce the original type from a converted value.
    Source,
    /// Produce a converted type from an original value.
    Target,
}

type ConversionFn = dyn Fn(&ConversionCx<'_>, TypeRef, &mut TypeList) -> RuleOutcome;

type MaterializationFn =
    dyn Fn(&mut OpBuilder<'_>, TypeRef, &[ValueRef], Location) -> Option<ValueRef>;

type TypeAttributeFn = dyn Fn(&TypeInterner, TypeRef, &Attribute) -> AttributeConversionResult;

struct ConversionRule {
    kind: Option<TypeKind>,
    convert: Box<ConversionFn>,
}

struct MaterializationRule {
    kind: Option<TypeKind>,
    materialize: Box<MaterializationFn>,
}

struct TypeAttributeRule {
    type_kind: Option<TypeKind>,
    attr_kind: Option<AttributeKind>,
    convert: Box<TypeAttributeFn>,
}

/// View of the converter handed to conversion rules, so a rule for a
/// composite type can convert its parameters.
pub struct ConversionCx<'a> {
    converter: &'a TypeConverter,
    types: &'a TypeInterner,
}

impl<'a> ConversionCx<'a> {
    pub fn types(&self) -> &'a TypeInterner {
        self.types
    }

    pub fn convert_type(&self, ty: TypeRef) -> Option<TypeList> {
        self.converter.convert_type(self.types, ty)
    }

    pub fn convert_single_type(&self, ty: TypeRef) -> Option<TypeRef> {
        self.converter.convert_single_type(self.types, ty)
    }

    /// Types currently being converted, outermost first. The type handed to
    /// the running rule is the last element.
    pub fn call_stack(&self) -> Vec<TypeRef> {
        self.converter.call_stack.borrow().clone()
    }

    /// Whether `ty` is already being converted further up the stack.
    pub fn is_recursive(&self, ty: TypeRef) -> bool {
        self.converter
            .call_stack
            .borrow()
            .iter()
            .filter(|&&t| t == ty)
            .count()
            > 1
    }

    pub fn convert_type_attribute(
        &self,
        ty: TypeRef,
        attr: &Attribute,
    ) -> AttributeConversionResult {
        self.converter.convert_type_attribute(self.types, ty, attr)
    }
}

/// Registry of type conversions and materializations.
///
/// Every list is consulted newest first. Conversion results are cached per
/// input type until the next rule is registered.
#[derive(Default)]
pub struct TypeConverter {
    /// Type conversion rules.
    conversions: Vec<ConversionRule>,
    argument_materializations: Vec<MaterializationRule>,
    source_materializations: Vec<MaterializationRule>,
    target_materializations: Vec<MaterializationRule>,
    type_attribute_conversions: Vec<TypeAttributeRule>,

    /// Results of 1-1 conversions, including failures.
    direct_cache: RefCell<HashMap<TypeRef, Option<TypeRef>>>,
    /// Results of conversions to any other number of types.
    multi_cache: RefCell<HashMap<TypeRef, TypeList>>,
    /// Types currently being converted, innermost last.
    call_stack: RefCell<Vec<TypeRef>>,
}

impl TypeConverter {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a 1-1 rule. Returning `None` declines the type.
    pub fn add_conversion(
        &mut self,
        f: impl Fn(&ConversionCx<'_>, TypeRef) -> Option<TypeRef> + 'static,
    ) {
        self.push_rule(None, single_result_rule(f));
    }

    /// Register a 1-1 rule that only sees types of `kind`.
    pub fn add_conversion_for(
        &mut self,
        kind: TypeKind,
        f: impl Fn(&ConversionCx<'_>, TypeRef) -> Option<TypeRef> + 'static,
    ) {
        self.push_rule(Some(kind), single_result_rule(f));
    }

    /// Register a rule that may produce any number of types.
    pub fn add_multi_conversion(
        &mut self,
        f: impl Fn(&ConversionCx<'_>, TypeRef, &mut TypeList) -> RuleOutcome + 'static,
    ) {
        self.push_rule(None, Box::new(f));
    }

    /// Register a multi-type rule that only sees types of `kind`.
    pub fn add_multi_conversion_for(
        &mut self,
        kind: TypeKind,
        f: impl Fn(&ConversionCx<'_>, TypeRef, &mut TypeList) -> RuleOutcome + 'static,
    ) {
        self.push_rule(Some(kind), Box::new(f));
    }

    fn push_rule(&mut self, kind: Option<TypeKind>, convert: Box<ConversionFn>) {
        self.conversions.push(ConversionRule { kind, convert });
        self.clear_caches();
    }

    /// Register a rule converting attributes attached to types.
    pub fn add_type_attribute_conversion(
        &mut self,
        f: impl Fn(&TypeInterner, TypeRef, &Attribute) -> AttributeConversionResult + 'static,
    ) {
        self.type_attribute_conversions.push(TypeAttributeRule {
            type_kind: None,
            attr_kind: None,
            convert: Box::new(f),
        });
        self.clear_caches();
    }

    /// Register a type-attribute rule restricted to one type kind and one
    /// attribute kind.
    pub fn add_type_attribute_conversion_for(
        &mut self,
        type_kind: TypeKind,
        attr_kind: AttributeKind,
        f: impl Fn(&TypeInterner, TypeRef, &Attribute) -> AttributeConversionResult + 'static,
    ) {
        self.type_attribute_conversions.push(TypeAttributeRule {
            type_kind: Some(type_kind),
            attr_kind: Some(attr_kind),
            convert: Box::new(f),
        });
        self.clear_caches();
    }

    /// Register a materialization that rebuilds a block argument of its
    /// original type from the converted arguments replacing it.
    pub fn add_argument_materialization(
        &mut self,
        f: impl Fn(&mut OpBuilder<'_>, TypeRef, &[ValueRef], Location) -> Option<ValueRef>
            + 'static,
    ) {
        self.argument_materializations.push(MaterializationRule {
            kind: None,
            materialize: Box::new(f),
        });
    }

    /// Register a materialization that casts a converted value back to its
    /// original type, for users that were not converted.
    pub fn add_source_materialization(
        &mut self,
        f: impl Fn(&mut OpBuilder<'_>, TypeRef, &[ValueRef], Location) -> Option<ValueRef>
            + 'static,
    ) {
        self.source_materializations.push(MaterializationRule {
            kind: None,
            materialize: Box::new(f),
        });
    }

    /// Register a materialization that casts a value to the converted type a
    /// pattern expects for its operands.
    pub fn add_target_materialization(
        &mut self,
        f: impl Fn(&mut OpBuilder<'_>, TypeRef, &[ValueRef], Location) -> Option<ValueRef>
            + 'static,
    ) {
        self.target_materializations.push(MaterializationRule {
            kind: None,
            materialize: Box::new(f),
        });
    }

    /// Register a materialization that is only asked for results of `kind`.
    pub fn add_materialization_for(
        &mut self,
        which: MaterializationKind,
        kind: TypeKind,
        f: impl Fn(&mut OpBuilder<'_>, TypeRef, &[ValueRef], Location) -> Option<ValueRef>
            + 'static,
    ) {
        let rule = MaterializationRule {
            kind: Some(kind),
            materialize: Box::new(f),
        };
        match which {
            MaterializationKind::Argument => self.argument_materializations.push(rule),
            MaterializationKind::Source => self.source_materializations.push(rule),
            MaterializationKind::Target => self.target_materializations.push(rule),
        }
    }

    fn clear_caches(&self) {
        self.direct_cache.borrow_mut().clear();
        self.multi_cache.borrow_mut().clear();
    }

    // ========================================================================
    // Conversion
    // ========================================================================

    /// Convert `ty` to zero or more types, or `None` if it cannot be
    /// converted.
    pub fn convert_type(&self, types: &TypeInterner, ty: TypeRef) -> Option<TypeList> {
        let cached = self.direct_cache.borrow().get(&ty).copied();
        if let Some(entry) = cached {
            return entry.map(|t| smallvec![t]);
        }
        let cached = self.multi_cache.borrow().get(&ty).cloned();
        if let Some(list) = cached {
            return Some(list);
        }

        self.call_stack.borrow_mut().push(ty);
        let result = self.run_rules(types, ty);
        self.call_stack.borrow_mut().pop();

        match &result {
            Some(list) if list.len() == 1 => {
                self.direct_cache.borrow_mut().insert(ty, Some(list[0]));
            }
            Some(list) => {
                self.multi_cache.borrow_mut().insert(ty, list.clone());
            }
            None => {
                self.direct_cache.borrow_mut().insert(ty, None);
            }
        }
        trace!("convert_type: {ty} -> {result:?}");
        result
    }

    fn run_rules(&self, types: &TypeInterner, ty: TypeRef) -> Option<TypeList> {
        let cx = ConversionCx {
            converter: self,
            types,
        };
        let kind = types.kind(ty);
        for rule in self.conversions.iter().rev() {
            if rule.kind.is_some_and(|k| k != kind) {
                continue;
            }
            let mut out = TypeList::new();
            match (rule.convert)(&cx, ty, &mut out) {
                RuleOutcome::NotApplicable => continue,
                RuleOutcome::Failure => return None,
                RuleOutcome::Success => return Some(out),
            }
        }
        None
    }

    /// Convert `ty` to exactly one type.
    pub fn convert_single_type(&self, types: &TypeInterner, ty: TypeRef) -> Option<TypeRef> {
        match self.convert_type(types, ty)?.as_slice() {
            &[single] => Some(single),
            _ => None,
        }
    }

    /// Convert each type and concatenate the results.
    pub fn convert_types(&self, types: &TypeInterner, tys: &[TypeRef]) -> Option<Vec<TypeRef>> {
        let mut out = Vec::with_capacity(tys.len());
        for &ty in tys {
            out.extend(self.convert_type(types, ty)?);
        }
        Some(out)
    }

    /// A type is legal when it converts to exactly itself.
    pub fn is_legal_type(&self, types: &TypeInterner, ty: TypeRef) -> bool {
        self.convert_single_type(types, ty) == Some(ty)
    }

    pub fn is_legal_types(&self, types: &TypeInterner, tys: &[TypeRef]) -> bool {
        tys.iter().all(|&ty| self.is_legal_type(types, ty))
    }

    /// Whether every operand and result of `op` has a legal type.
    pub fn is_legal_op(&self, ctx: &IrContext, op: OpRef) -> bool {
        ctx.op_operands(op)
            .iter()
            .all(|&v| self.is_legal_type(&ctx.types, ctx.value_ty(v)))
            && self.is_legal_types(&ctx.types, ctx.op_result_types(op))
    }

    /// Whether every block argument of `region` has a legal type.
    pub fn is_legal_region(&self, ctx: &IrContext, region: RegionRef) -> bool {
        ctx.region(region).blocks.iter().all(|&block| {
            ctx.block_args(block)
                .iter()
                .all(|&arg| self.is_legal_type(&ctx.types, ctx.value_ty(arg)))
        })
    }

    /// Whether the inputs and result of a function type are legal.
    ///
    /// Anything that is not a function type is judged as a plain type.
    pub fn is_signature_legal(&self, types: &TypeInterner, fn_ty: TypeRef) -> bool {
        match FunctionType::parse(types, fn_ty) {
            Some(sig) => {
                self.is_legal_types(types, &sig.inputs) && self.is_legal_type(types, sig.result)
            }
            None => self.is_legal_type(types, fn_ty),
        }
    }

    /// Convert input `input_no` of type `ty` into `result`. An empty
    /// conversion drops the input.
    #[must_use]
    pub fn convert_signature_arg(
        &self,
        types: &TypeInterner,
        input_no: usize,
        ty: TypeRef,
        result: &mut SignatureConversion,
    ) -> bool {
        let Some(converted) = self.convert_type(types, ty) else {
            return false;
        };
        if !converted.is_empty() {
            result.add_inputs(input_no, &converted);
        }
        true
    }

    /// Convert consecutive inputs starting at original index `input_offset`.
    #[must_use]
    pub fn convert_signature_args(
        &self,
        types: &TypeInterner,
        tys: &[TypeRef],
        result: &mut SignatureConversion,
        input_offset: usize,
    ) -> bool {
        tys.iter()
            .enumerate()
            .all(|(i, &ty)| self.convert_signature_arg(types, input_offset + i, ty, result))
    }

    /// Signature conversion for the arguments of `block`.
    pub fn convert_block_signature(
        &self,
        ctx: &IrContext,
        block: BlockRef,
    ) -> Option<SignatureConversion> {
        let arg_types: SmallVec<[TypeRef; 4]> = ctx
            .block_args(block)
            .iter()
            .map(|&arg| ctx.value_ty(arg))
            .collect();
        let mut conversion = SignatureConversion::new(arg_types.len());
        self.convert_signature_args(&ctx.types, &arg_types, &mut conversion, 0)
            .then_some(conversion)
    }

    /// Convert an attribute attached to type `ty`.
    pub fn convert_type_attribute(
        &self,
        types: &TypeInterner,
        ty: TypeRef,
        attr: &Attribute,
    ) -> AttributeConversionResult {
        let type_kind = types.kind(ty);
        let attr_kind = attr.kind();
        for rule in self.type_attribute_conversions.iter().rev() {
            if rule.type_kind.is_some_and(|k| k != type_kind)
                || rule.attr_kind.is_some_and(|k| k != attr_kind)
            {
                continue;
            }
            match (rule.convert)(types, ty, attr) {
                AttributeConversionResult::NotApplicable => continue,
                done => return done,
            }
        }
        AttributeConversionResult::NotApplicable
    }

    // ========================================================================
    // Materialization
    // ========================================================================

    /// Build a value of type `ty` from `inputs`, trying the most recently
    /// registered materialization of the requested kind first.
    pub fn materialize(
        &self,
        which: MaterializationKind,
        builder: &mut OpBuilder<'_>,
        ty: TypeRef,
        inputs: &[ValueRef],
        location: Location,
    ) -> Option<ValueRef> {
        let rules = match which {
            MaterializationKind::Argument => &self.argument_materializations,
            MaterializationKind::Source => &self.source_materializations,
            MaterializationKind::Target => &self.target_materializations,
        };
        let kind = builder.types().kind(ty);
        rules
            .iter()
            .rev()
            .filter(|rule| rule.kind.is_none_or(|k| k == kind))
            .find_map(|rule| (rule.materialize)(builder, ty, inputs, location))
    }

    /// Ask the argument materializations, most recently added first, for a
    /// value of type `ty` built from `inputs`.
    pub fn materialize_argument(
        &self,
        builder: &mut OpBuilder<'_>,
        ty: TypeRef,
        inputs: &[ValueRef],
        location: Location,
    ) -> Option<ValueRef> {
        self.materialize(MaterializationKind::Argument, builder, ty, inputs, location)
    }

    pub fn materialize_source(
        &self,
        builder: &mut OpBuilder<'_>,
        ty: TypeRef,
        inputs: &[ValueRef],
        location: Location,
    ) -> Option<ValueRef> {
        self.materialize(MaterializationKind::Source, builder, ty, inputs, location)
    }

    pub fn materialize_target(
        &self,
        builder: &mut OpBuilder<'_>,
        ty: TypeRef,
        inputs: &[ValueRef],
        location: Location,
    ) -> Option<ValueRef> {
        self.materialize(MaterializationKind::Target, builder, ty, inputs, location)
    }
}

fn single_result_rule(
    f: impl Fn(&ConversionCx<'_>, TypeRef) -> Option<TypeRef> + 'static,
) -> Box<ConversionFn> {
    Box::new(move |cx: &ConversionCx<'_>, ty: TypeRef, out: &mut TypeList| match f(cx, ty) {
        Some(converted) => {
            out.push(converted);
            RuleOutcome::Success
        }
        None => RuleOutcome::NotApplicable,
    })
}

pub(crate) fn unrealized_cast_name() -> OpName {
    OpName::new("builtin", "unrealized_conversion_cast")
}

/// Materialization that always succeeds by emitting
/// `builtin.unrealized_conversion_cast`.
///
/// Useful as a fallback: later passes are expected to fold these casts away.
pub fn unrealized_cast(
    builder: &mut OpBuilder<'_>,
    ty: TypeRef,
    inputs: &[ValueRef],
    location: Location,
) -> Option<ValueRef> {
    let op = builder.create(
        OperationDataBuilder::named(location, unrealized_cast_name())
            .operands(inputs.iter().copied())
            .result(ty),
    );
    Some(builder.ctx().op_result(op, 0))
}
