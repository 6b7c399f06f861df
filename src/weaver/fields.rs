//! Field access interception.
//!
//! Preparation runs sequentially, before any body is woven:
//! 1. every intercepted field gets a `get_<name>` / `set_<name>` accessor whose
//!    body loads (stores) the field around the field advices' code,
//! 2. optionally the field is promoted to a property (and renamed into a
//!    backing field) or loses its storage,
//! 3. every method touching the field receives an internal instead-of advice
//!    that rewrites the access into an accessor call.
//!
//! Address-taking accesses are rewritten only in the two shapes a compiler
//! emits for value-typed fields: `ldflda; initobj T` (a default assignment)
//! and `ldflda; call T::M` (an instance call on the field value). Any other
//! address escape is reported and left alone.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    assembly::{BlockId, MethodBody, OpCode},
    metadata::{
        diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
        model::{FieldDef, MethodFlags, MethodSignature, TypeSig},
        module::Module,
        token::Token,
    },
    weaver::{
        advice::{Advice, FieldAdvice, FieldAdviceOptions},
        config::WeaverConfig,
        context::{FieldAccessContext, WeavingContext},
        index::AdviceIndex,
        joinpoint::JoinPointKinds,
        tags::WeaveTags,
    },
    Error, Result,
};

/// A field advice registered on one field.
#[derive(Clone)]
pub(crate) struct FieldRegistration {
    pub field: Token,
    pub advice: Arc<dyn FieldAdvice>,
    pub options: FieldAdviceOptions,
    pub order: u64,
}

/// Accessors synthesized for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAccessors {
    /// The intercepted field
    pub field: Token,
    /// `get_<name>`, if reads are intercepted
    pub getter: Option<Token>,
    /// `set_<name>`, if writes are intercepted
    pub setter: Option<Token>,
    /// The property the field was promoted to
    pub property: Option<Token>,
    /// Whether the backing storage was dropped
    pub removed: bool,
}

const REWRITE_KINDS: JoinPointKinds = JoinPointKinds::INSTEAD_OF_GET_FIELD
    .union(JoinPointKinds::INSTEAD_OF_SET_FIELD)
    .union(JoinPointKinds::INSTEAD_OF_GET_FIELD_ADDRESS);

const FIELD_OPCODES: [OpCode; 6] = [
    OpCode::Ldfld,
    OpCode::Ldsfld,
    OpCode::Stfld,
    OpCode::Stsfld,
    OpCode::Ldflda,
    OpCode::Ldsflda,
];

/// Synthesizes accessors for every registered field and registers the access
/// rewrite in every method touching one.
///
/// # Errors
/// Returns metadata errors from accessor creation; advice failures inside
/// accessors are reported as diagnostics.
pub(crate) fn prepare_fields(
    module: &mut Module,
    registrations: &[FieldRegistration],
    index: &mut AdviceIndex,
    tags: &mut WeaveTags,
    diagnostics: &Diagnostics,
    config: &WeaverConfig,
) -> Result<Vec<FieldAccessors>> {
    let mut by_field: BTreeMap<Token, Vec<&FieldRegistration>> = BTreeMap::new();
    for registration in registrations {
        by_field.entry(registration.field).or_default().push(registration);
    }

    let mut prepared = Vec::with_capacity(by_field.len());
    for (field, mut group) in by_field {
        group.sort_by(|a, b| {
            b.advice
                .priority()
                .cmp(&a.advice.priority())
                .then_with(|| a.order.cmp(&b.order))
        });
        match prepare_field(module, field, &group, tags, diagnostics, config) {
            Ok(accessors) => prepared.push(accessors),
            Err(Error::FieldNotFound(token)) => diagnostics.push(
                Diagnostic::new(
                    DiagnosticSeverity::Error,
                    DiagnosticCategory::FieldAccess,
                    format!("field advice registered on unknown field {token}"),
                )
                .with_token(token),
            ),
            Err(error) => return Err(error),
        }
    }

    for accessors in &prepared {
        register_rewrites(module, accessors, index, tags, diagnostics);
    }
    Ok(prepared)
}

fn prepare_field(
    module: &mut Module,
    field: Token,
    group: &[&FieldRegistration],
    tags: &mut WeaveTags,
    diagnostics: &Diagnostics,
    config: &WeaverConfig,
) -> Result<FieldAccessors> {
    let def = module
        .metadata
        .field(field)
        .cloned()
        .ok_or(Error::FieldNotFound(field))?;

    let promote = group.iter().any(|r| r.options.promote_to_property);
    let removed = group.iter().any(|r| r.options.remove_backing_field);
    let need_get = promote || removed || group.iter().any(|r| r.advice.intercepts_get());
    let need_set = promote || removed || group.iter().any(|r| r.advice.intercepts_set());

    let mut flags = MethodFlags::SPECIAL_NAME | MethodFlags::COMPILER_GENERATED;
    if def.is_static() {
        flags |= MethodFlags::STATIC;
    }
    let signature = |params: Vec<TypeSig>, ret: TypeSig| {
        if def.is_static() {
            MethodSignature::new_static(params, ret)
        } else {
            MethodSignature::instance(params, ret)
        }
    };

    let getter = if need_get {
        let token = module.metadata.add_method(
            def.declaring_type,
            &format!("get_{}", def.name),
            signature(Vec::new(), def.field_type.clone()),
            flags,
        )?;
        tags.tag_accessor(token, field);
        Some(token)
    } else {
        None
    };
    let setter = if need_set {
        let token = module.metadata.add_method(
            def.declaring_type,
            &format!("set_{}", def.name),
            signature(vec![def.field_type.clone()], TypeSig::Void),
            flags,
        )?;
        tags.tag_accessor(token, field);
        Some(token)
    } else {
        None
    };

    let property = if promote {
        let property = module.metadata.add_property(
            def.declaring_type,
            &def.name,
            def.field_type.clone(),
            getter,
            setter,
        )?;
        module
            .metadata
            .rename_field(field, &config.backing_field_name(&def.name))?;
        Some(property)
    } else {
        None
    };
    if removed {
        module.metadata.remove_field(field)?;
    }

    let mut bodies = Vec::new();
    if let Some(getter) = getter {
        let body = build_getter(module, &def, getter, group, removed, diagnostics)?;
        bodies.push((getter, body));
    }
    if let Some(setter) = setter {
        let body = build_setter(module, &def, setter, group, removed, diagnostics)?;
        bodies.push((setter, body));
    }
    for (accessor, body) in bodies {
        module.set_body(accessor, body)?;
    }

    log::debug!(
        "field {} intercepted: getter {:?}, setter {:?}, promoted {promote}, removed {removed}",
        def.name,
        getter,
        setter
    );
    Ok(FieldAccessors {
        field,
        getter,
        setter,
        property,
        removed,
    })
}

fn build_getter(
    module: &Module,
    def: &FieldDef,
    getter: Token,
    group: &[&FieldRegistration],
    removed: bool,
    diagnostics: &Diagnostics,
) -> Result<MethodBody> {
    let model = &module.metadata;
    let accessor = model.method(getter).ok_or(Error::MethodNotFound(getter))?;
    let field = model.field(def.token).ok_or(Error::FieldNotFound(def.token))?;

    let mut body = MethodBody::new();
    let root = body.root();
    let value_local = body.define_local(def.field_type.clone())?;

    if !removed {
        let load = body.add_block(root)?;
        let seq = body.add_sequence(load)?;
        let mut writer = body.attach_writer(seq)?;
        if def.is_static() {
            writer.emit_field(OpCode::Ldsfld, def.token)?;
        } else {
            writer.emit_argument(OpCode::Ldarg, 0)?;
            writer.emit_field(OpCode::Ldfld, def.token)?;
        }
        writer.emit_local(OpCode::Stloc, value_local)?;
    }
    let advice_block = body.add_block(root)?;
    let tail = body.add_block(root)?;
    let exit = body.add_sequence(tail)?;
    {
        let mut writer = body.attach_writer(exit)?;
        writer.emit_local(OpCode::Ldloc, value_local)?;
        writer.emit(OpCode::Ret)?;
    }

    for registration in group.iter().filter(|r| r.advice.intercepts_get()) {
        let mut ctx = FieldAccessContext {
            body: &mut body,
            model,
            field,
            accessor,
            block: advice_block,
            value_local,
            store: None,
            exit,
        };
        if let Err(error) = registration.advice.weave_get(&mut ctx) {
            report_accessor_error(diagnostics, accessor.token, def.token, &error);
        }
    }
    Ok(body)
}

fn build_setter(
    module: &Module,
    def: &FieldDef,
    setter: Token,
    group: &[&FieldRegistration],
    removed: bool,
    diagnostics: &Diagnostics,
) -> Result<MethodBody> {
    let model = &module.metadata;
    let accessor = model.method(setter).ok_or(Error::MethodNotFound(setter))?;
    let field = model.field(def.token).ok_or(Error::FieldNotFound(def.token))?;

    let mut body = MethodBody::new();
    let root = body.root();
    let value_local = body.define_local(def.field_type.clone())?;
    let value_argument = if def.is_static() { 0 } else { 1 };

    let entry = body.add_block(root)?;
    let seq = body.add_sequence(entry)?;
    {
        let mut writer = body.attach_writer(seq)?;
        writer.emit_argument(OpCode::Ldarg, value_argument)?;
        writer.emit_local(OpCode::Stloc, value_local)?;
    }
    let advice_block = body.add_block(root)?;
    let store = if removed {
        None
    } else {
        let block = body.add_block(root)?;
        let seq = body.add_sequence(block)?;
        let mut writer = body.attach_writer(seq)?;
        if def.is_static() {
            writer.emit_local(OpCode::Ldloc, value_local)?;
            writer.emit_field(OpCode::Stsfld, def.token)?;
        } else {
            writer.emit_argument(OpCode::Ldarg, 0)?;
            writer.emit_local(OpCode::Ldloc, value_local)?;
            writer.emit_field(OpCode::Stfld, def.token)?;
        }
        Some(seq)
    };
    let tail = body.add_block(root)?;
    let exit = body.add_sequence(tail)?;
    body.attach_writer(exit)?.emit(OpCode::Ret)?;

    for registration in group.iter().filter(|r| r.advice.intercepts_set()) {
        let mut ctx = FieldAccessContext {
            body: &mut body,
            model,
            field,
            accessor,
            block: advice_block,
            value_local,
            store,
            exit,
        };
        if let Err(error) = registration.advice.weave_set(&mut ctx) {
            report_accessor_error(diagnostics, accessor.token, def.token, &error);
        }
    }
    Ok(body)
}

fn report_accessor_error(diagnostics: &Diagnostics, accessor: Token, field: Token, error: &Error) {
    diagnostics.push(
        Diagnostic::new(
            DiagnosticSeverity::Error,
            DiagnosticCategory::FieldAccess,
            format!("field advice failed: {error}"),
        )
        .with_method(accessor)
        .with_token(field),
    );
}

fn register_rewrites(
    module: &Module,
    accessors: &FieldAccessors,
    index: &mut AdviceIndex,
    tags: &WeaveTags,
    diagnostics: &Diagnostics,
) {
    let Some(def) = module.metadata.field(accessors.field) else {
        return;
    };
    let rewrite: Arc<dyn Advice> = Arc::new(FieldAccessRewrite {
        field: accessors.field,
        field_type: def.field_type.clone(),
        getter: accessors.getter,
        setter: accessors.setter,
        removed: accessors.removed,
    });

    for method in module.methods_with_bodies() {
        if tags.is_ignored(method) {
            continue;
        }
        let touches = module.body(method).is_some_and(|body| {
            body.instructions().any(|i| {
                FIELD_OPCODES.contains(&i.opcode) && i.token() == Some(accessors.field)
            })
        });
        if !touches {
            continue;
        }
        if let Err(error) = index.add(
            method,
            Arc::clone(&rewrite),
            REWRITE_KINDS,
            Some(accessors.field),
        ) {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticSeverity::Error,
                    DiagnosticCategory::Registration,
                    error.to_string(),
                )
                .with_method(method)
                .with_token(accessors.field),
            );
        }
    }
}

/// Instead-of advice turning an access of an intercepted field into an
/// accessor call.
struct FieldAccessRewrite {
    field: Token,
    field_type: TypeSig,
    getter: Option<Token>,
    setter: Option<Token>,
    removed: bool,
}

/// Shape of an address-taking access that can be rewritten.
enum AddressUse {
    DefaultAssign,
    ValueCall,
}

impl FieldAccessRewrite {
    fn address_use(&self, ctx: &WeavingContext<'_>) -> Option<AddressUse> {
        let next = ctx.next_instruction()?;
        match next.opcode {
            OpCode::Initobj if self.setter.is_some() => Some(AddressUse::DefaultAssign),
            OpCode::Call | OpCode::Callvirt if self.getter.is_some() => {
                let callee = next.token().and_then(|t| ctx.model().method(t))?;
                (!callee.is_static() && ctx.model().is_value_type(callee.declaring_type))
                    .then_some(AddressUse::ValueCall)
            }
            _ => None,
        }
    }

    fn severity(&self) -> DiagnosticSeverity {
        if self.removed {
            DiagnosticSeverity::Error
        } else {
            DiagnosticSeverity::Warning
        }
    }
}

impl Advice for FieldAccessRewrite {
    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn requires_weave(&self, ctx: &WeavingContext<'_>) -> bool {
        let Some(opcode) = ctx.join_point().instruction.as_ref().map(|i| i.opcode) else {
            return false;
        };
        let writes_instance = matches!(opcode, OpCode::Stfld | OpCode::Ldflda);
        if writes_instance && !ctx.is_this_initialized() {
            ctx.report(
                DiagnosticSeverity::Error,
                DiagnosticCategory::FieldAccess,
                "field written before the chained constructor call; access not intercepted",
            );
            return false;
        }

        match opcode {
            OpCode::Ldfld | OpCode::Ldsfld => self.getter.is_some(),
            OpCode::Stfld | OpCode::Stsfld => self.setter.is_some(),
            OpCode::Ldflda | OpCode::Ldsflda => {
                if self.address_use(ctx).is_some() {
                    return true;
                }
                ctx.report(
                    self.severity(),
                    DiagnosticCategory::FieldAccess,
                    "field address escapes; access not intercepted",
                );
                false
            }
            _ => false,
        }
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let opcode = ctx
            .join_point()
            .instruction
            .as_ref()
            .map(|i| i.opcode)
            .ok_or_else(|| consistency_error!("field rewrite without instruction"))?;
        let missing = || consistency_error!("no accessor for field {}", self.field);

        match opcode {
            OpCode::Ldfld | OpCode::Ldsfld => {
                let getter = self.getter.ok_or_else(missing)?;
                ctx.writer(block)?.emit_method(OpCode::Call, getter)?;
            }
            OpCode::Stfld | OpCode::Stsfld => {
                let setter = self.setter.ok_or_else(missing)?;
                ctx.writer(block)?.emit_method(OpCode::Call, setter)?;
            }
            OpCode::Ldflda | OpCode::Ldsflda => match self.address_use(ctx) {
                Some(AddressUse::DefaultAssign) => {
                    let setter = self.setter.ok_or_else(missing)?;
                    let value_type = ctx
                        .next_instruction()
                        .and_then(|i| i.token())
                        .ok_or_else(missing)?;
                    let temp = ctx.define_local(self.field_type.clone())?;
                    ctx.consume_next_instruction();
                    let mut writer = ctx.writer(block)?;
                    writer.emit_local(OpCode::Ldloca, temp)?;
                    writer.emit_type(OpCode::Initobj, value_type)?;
                    writer.emit_local(OpCode::Ldloc, temp)?;
                    writer.emit_method(OpCode::Call, setter)?;
                }
                Some(AddressUse::ValueCall) => {
                    let getter = self.getter.ok_or_else(missing)?;
                    let temp = ctx.define_local(self.field_type.clone())?;
                    let mut writer = ctx.writer(block)?;
                    writer.emit_method(OpCode::Call, getter)?;
                    writer.emit_local(OpCode::Stloc, temp)?;
                    writer.emit_local(OpCode::Ldloca, temp)?;
                }
                None => return Err(missing()),
            },
            _ => return Err(missing()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestModel;

    struct Doubling;

    impl FieldAdvice for Doubling {
        fn intercepts_get(&self) -> bool {
            true
        }

        fn intercepts_set(&self) -> bool {
            false
        }

        fn weave_get(&self, ctx: &mut FieldAccessContext<'_>) -> Result<()> {
            let local = ctx.value_local();
            let mut writer = ctx.writer()?;
            writer.emit_local(OpCode::Ldloc, local)?;
            writer.emit_i4(2)?;
            writer.emit(OpCode::Mul)?;
            writer.emit_local(OpCode::Stloc, local)?;
            Ok(())
        }
    }

    fn registration(field: Token, options: FieldAdviceOptions) -> FieldRegistration {
        FieldRegistration {
            field,
            advice: Arc::new(Doubling),
            options,
            order: 0,
        }
    }

    #[test]
    fn test_getter_synthesis() -> Result<()> {
        let test = TestModel::new();
        let mut module = test.module_with_field_reader()?;
        let mut index = AdviceIndex::new();
        let mut tags = WeaveTags::new();
        let diagnostics = Diagnostics::new();

        let prepared = prepare_fields(
            &mut module,
            &[registration(test.field, FieldAdviceOptions::default())],
            &mut index,
            &mut tags,
            &diagnostics,
            &WeaverConfig::default(),
        )?;
        assert_eq!(prepared.len(), 1);
        let getter = prepared[0].getter.ok_or(Error::MethodNotFound(test.method))?;
        assert!(prepared[0].setter.is_none());
        assert!(tags.is_ignored(getter));
        assert_eq!(module.metadata.method(getter).map(|m| m.name.as_str()), Some("get_value"));

        let body = module.body(getter).ok_or(Error::MethodNotFound(getter))?;
        let opcodes: Vec<OpCode> = body.instructions().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                OpCode::Ldarg,
                OpCode::Ldfld,
                OpCode::Stloc,
                OpCode::Ldloc,
                OpCode::LdcI4,
                OpCode::Mul,
                OpCode::Stloc,
                OpCode::Ldloc,
                OpCode::Ret
            ]
        );

        // The reader method got the rewrite advice, keyed by the field.
        let advices = index.method(test.method).ok_or(Error::MethodNotFound(test.method))?;
        assert!(advices.kinds().contains(JoinPointKinds::INSTEAD_OF_GET_FIELD));
        assert!(index.method(getter).is_none());
        Ok(())
    }

    #[test]
    fn test_promote_and_remove() -> Result<()> {
        let test = TestModel::new();
        let mut module = test.module_with_field_reader()?;
        let mut index = AdviceIndex::new();
        let mut tags = WeaveTags::new();
        let diagnostics = Diagnostics::new();
        let options = FieldAdviceOptions {
            promote_to_property: true,
            remove_backing_field: true,
        };

        let prepared = prepare_fields(
            &mut module,
            &[registration(test.field, options)],
            &mut index,
            &mut tags,
            &diagnostics,
            &WeaverConfig::default(),
        )?;
        let accessors = prepared[0];
        assert!(accessors.getter.is_some() && accessors.setter.is_some());
        assert!(accessors.removed);

        let property = accessors
            .property
            .and_then(|p| module.metadata.property(p))
            .ok_or(Error::FieldNotFound(test.field))?;
        assert_eq!(property.name, "value");
        let field = module.metadata.field(test.field).ok_or(Error::FieldNotFound(test.field))?;
        assert_eq!(field.name, "<value>k__BackingField");
        assert!(field.is_removed());

        // Without storage the getter only returns its local.
        let getter = accessors.getter.ok_or(Error::FieldNotFound(test.field))?;
        let body = module.body(getter).ok_or(Error::MethodNotFound(getter))?;
        assert!(!body.instructions().any(|i| i.opcode == OpCode::Ldfld));
        Ok(())
    }

    #[test]
    fn test_unknown_field_is_reported() -> Result<()> {
        let test = TestModel::new();
        let mut module = test.module_with_field_reader()?;
        let mut index = AdviceIndex::new();
        let mut tags = WeaveTags::new();
        let diagnostics = Diagnostics::new();

        let prepared = prepare_fields(
            &mut module,
            &[registration(Token(0x0400_0099), FieldAdviceOptions::default())],
            &mut index,
            &mut tags,
            &diagnostics,
            &WeaverConfig::default(),
        )?;
        assert!(prepared.is_empty());
        assert_eq!(diagnostics.error_count(), 1);
        Ok(())
    }
}
