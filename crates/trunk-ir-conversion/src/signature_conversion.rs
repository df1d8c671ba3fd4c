//! Block and function signature conversion.
//!
//! A [`SignatureConversion`] records, for each original input of a block or
//! function, which slice of the converted input list replaces it (or which
//! existing value stands in for it). The rewriter applies it to a block; the
//! [`FunctionSignatureConversion`] pattern applies it to a function body and
//! its `func.fn` type.

use std::collections::BTreeMap;
use std::rc::Rc;

use trunk_ir::{Attribute, OpName, OpRef, Symbol, TypeDataBuilder, TypeInterner, TypeRef, ValueRef};

use crate::pattern::ConversionPattern;
use crate::rewriter::ConversionRewriter;
use crate::type_converter::TypeConverter;

trunk_ir::symbols! {
    ATTR_TYPE => "type",
}

/// Where an original input went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMapping {
    /// `size` consecutive converted inputs starting at `start`.
    Converted { start: usize, size: usize },
    /// An existing value replaces the input; no new input is created.
    Replaced(ValueRef),
}

/// How the inputs of a block or function map onto a converted input list.
///
/// Every original input is either converted to one or more new inputs,
/// replaced by an existing value, or left unmapped and dropped.
#[derive(Clone, Debug)]
pub struct SignatureConversion {
    mappings: Vec<Option<InputMapping>>,
    converted: Vec<TypeRef>,
}

impl SignatureConversion {
    pub fn new(num_original_inputs: usize) -> Self {
        Self {
            mappings: vec![None; num_original_inputs],
            converted: Vec::new(),
        }
    }

    pub fn num_original_inputs(&self) -> usize {
        self.mappings.len()
    }

    /// Replace original input `orig` with `types`, appended to the
    /// converted input list.
    ///
    /// # Panics
    ///
    /// Panics if `types` is empty or if `orig` was already remapped.
    pub fn add_inputs(&mut self, orig: usize, types: &[TypeRef]) {
        assert!(
            !types.is_empty(),
            "add_inputs: input #{orig} needs at least one type; leave it unmapped to drop it"
        );
        assert!(self.mappings[orig].is_none(), "add_inputs: input #{orig} is already remapped");
        self.mappings[orig] = Some(InputMapping::Converted {
            start: self.converted.len(),
            size: types.len(),
        });
        self.converted.extend_from_slice(types);
    }

    /// Append converted inputs that correspond to no original input.
    pub fn append_inputs(&mut self, types: &[TypeRef]) {
        self.converted.extend_from_slice(types);
    }

    /// Replace original input `orig` with an existing value.
    ///
    /// # Panics
    ///
    /// Panics if `orig` was already remapped.
    pub fn remap_input(&mut self, orig: usize, value: ValueRef) {
        assert!(self.mappings[orig].is_none(), "remap_input: input #{orig} is already remapped");
        self.mappings[orig] = Some(InputMapping::Replaced(value));
    }

    /// `None` if the input is dropped.
    pub fn input_mapping(&self, orig: usize) -> Option<InputMapping> {
        self.mappings[orig]
    }

    /// The converted input list, in order.
    pub fn converted_types(&self) -> &[TypeRef] {
        &self.converted
    }
}

/// Decoded `func.fn` type: `params[0]` is the result, `params[1..]` the
/// inputs. Other attributes (such as an effect row) pass through untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionType {
    pub inputs: Vec<TypeRef>,
    pub result: TypeRef,
    pub attrs: BTreeMap<Symbol, Attribute>,
}

impl FunctionType {
    /// `None` unless `ty` is a `func.fn` with at least a result parameter.
    pub fn parse(types: &TypeInterner, ty: TypeRef) -> Option<Self> {
        let data = types.get(ty);
        if data.dialect != "func" || data.name != "fn" {
            return None;
        }
        let (&result, inputs) = data.params.split_first()?;
        Some(Self {
            inputs: inputs.to_vec(),
            result,
            attrs: data.attrs.clone(),
        })
    }

    pub fn intern(&self, types: &TypeInterner) -> TypeRef {
        let mut builder = TypeDataBuilder::new("func", "fn")
            .param(self.result)
            .params(self.inputs.iter().copied());
        for (&key, value) in &self.attrs {
            builder = builder.attr(key, value.clone());
        }
        types.intern(builder.build())
    }
}

/// Converts the signature of a function-like operation.
///
/// The operation carries its `func.fn` type in a `type` attribute and its
/// body in region 0. Inputs and the result are converted with the pattern's
/// type converter; the body's blocks are rewritten to the converted types,
/// and the operation itself is updated in place.
pub struct FunctionSignatureConversion {
    op: OpName,
    converter: Rc<TypeConverter>,
}

impl FunctionSignatureConversion {
    pub fn new(op: OpName, converter: Rc<TypeConverter>) -> Self {
        Self { op, converter }
    }
}

impl ConversionPattern for FunctionSignatureConversion {
    fn match_and_rewrite(
        &self,
        op: OpRef,
        _operands: &[ValueRef],
        rewriter: &mut ConversionRewriter<'_>,
    ) -> bool {
        let Some(fn_ty) = rewriter
            .ctx()
            .op(op)
            .attributes
            .get(&ATTR_TYPE())
            .and_then(Attribute::as_type)
        else {
            return rewriter.notify_match_failure(op, "missing `type` attribute");
        };
        let Some(signature) = FunctionType::parse(rewriter.types(), fn_ty) else {
            return rewriter.notify_match_failure(op, "`type` attribute is not a function type");
        };

        let mut conversion = SignatureConversion::new(signature.inputs.len());
        if !self
            .converter
            .convert_signature_args(rewriter.types(), &signature.inputs, &mut conversion, 0)
        {
            return rewriter.notify_match_failure(op, "failed to convert function inputs");
        }
        let Some(result) = self.converter.convert_single_type(rewriter.types(), signature.result)
        else {
            return rewriter.notify_match_failure(op, "failed to convert function result");
        };

        let body = rewriter.ctx().op(op).regions.first().copied();
        if let Some(body) = body
            && !rewriter.ctx().region(body).blocks.is_empty()
            && let Err(err) =
                rewriter.convert_region_types(body, &self.converter, Some(&conversion))
        {
            return rewriter.notify_match_failure(op, err);
        }

        let new_ty = FunctionType {
            inputs: conversion.converted_types().to_vec(),
            result,
            attrs: signature.attrs,
        }
        .intern(rewriter.types());
        rewriter.modify_op_in_place(op, |op| {
            op.set_attribute(ATTR_TYPE(), Attribute::Type(new_ty))
        });
        true
    }

    fn root(&self) -> Option<OpName> {
        Some(self.op)
    }

    fn type_converter(&self) -> Option<&Rc<TypeConverter>> {
        Some(&self.converter)
    }

    fn name(&self) -> &'static str {
        "FunctionSignatureConversion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn function_type_round_trips_attributes() {
        let types = TypeInterner::new();
        let i32_ty = types.intern(TypeDataBuilder::new("core", "i32").build());
        let eff = types.intern(TypeDataBuilder::new("core", "effect").build());
        let fn_ty = types.intern(
            TypeDataBuilder::new("func", "fn")
                .param(i32_ty)
                .params([i32_ty, i32_ty])
                .attr("effect", Attribute::Type(eff))
                .build(),
        );

        let sig = FunctionType::parse(&types, fn_ty).expect("func.fn");
        assert_eq!(sig.inputs, vec![i32_ty, i32_ty]);
        assert_eq!(sig.result, i32_ty);
        assert_eq!(sig.intern(&types), fn_ty);
        assert_eq!(FunctionType::parse(&types, i32_ty), None);
    }

    #[test]
    #[should_panic(expected = "already remapped")]
    fn remapping_an_input_twice_panics() {
        let types = TypeInterner::new();
        let i32_ty = types.intern(TypeDataBuilder::new("core", "i32").build());
        let mut conversion = SignatureConversion::new(1);
        conversion.add_inputs(0, &[i32_ty]);
        conversion.add_inputs(0, &[i32_ty]);
    }

    proptest! {
        /// Converted slices tile the converted input list in input order,
        /// and appended inputs land after all of them.
        #[test]
        fn converted_slices_cover_the_input_list(
            widths in prop::collection::vec(0usize..4, 0..8),
            appended in 0usize..3,
        ) {
            let types = TypeInterner::new();
            let ty = types.intern(TypeDataBuilder::new("core", "i32").build());
            let mut conversion = SignatureConversion::new(widths.len());
            for (i, &width) in widths.iter().enumerate() {
                if width > 0 {
                    conversion.add_inputs(i, &vec![ty; width]);
                }
            }
            conversion.append_inputs(&vec![ty; appended]);

            let mut next = 0;
            for (i, &width) in widths.iter().enumerate() {
                match conversion.input_mapping(i) {
                    Some(InputMapping::Converted { start, size }) => {
                        prop_assert_eq!(start, next);
                        prop_assert_eq!(size, width);
                        next += size;
                    }
                    None => prop_assert_eq!(width, 0),
                    Some(InputMapping::Replaced(_)) => prop_assert!(false),
                }
            }
            prop_assert_eq!(conversion.converted_types().len(), next + appended);
        }
    }
}
