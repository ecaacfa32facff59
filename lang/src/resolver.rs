use std::collections::{BTreeMap, BTreeSet};

use derive_more::derive::{From, Into};
use thiserror::Error;
use typed_index_collections::TiVec;

use crate::{
    ast::{self, BinaryOp, Ty, UnaryOp},
    bytecode::Value,
    interface::{InterfaceTable, MemberHandle, Signature},
    source::Location,
};

/// Most locals a script may declare; slots are u16 operands.
pub const MAX_LOCALS: usize = u16::MAX as usize + 1;

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotIndex(usize);

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LabelIndex(usize);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("at {location}, unresolved identifier {name}")]
    Unresolved { location: Location, name: String },
    #[error("at {location}, {name} is used before its declaration")]
    UsedBeforeDeclaration { location: Location, name: String },
    #[error("at {location}, duplicate declaration of {name}")]
    DuplicateDeclaration { location: Location, name: String },
    #[error("at {location}, {name} shadows a component")]
    ShadowsComponent { location: Location, name: String },
    #[error("at {location}, component {name} cannot be used as a value")]
    ComponentAsValue { location: Location, name: String },
    #[error("at {location}, duplicate label {name}")]
    DuplicateLabel { location: Location, name: String },
    #[error("at {location}, label {name} is never defined")]
    UndefinedLabel { location: Location, name: String },
    #[error("at {location}, unknown interface {name}")]
    UnknownInterface { location: Location, name: String },
    #[error("at {location}, {component} has no member {member}")]
    UnknownMember {
        location: Location,
        component: String,
        member: String,
    },
    #[error("at {location}, {component}.{member} is a field, not a method")]
    NotAMethod {
        location: Location,
        component: String,
        member: String,
    },
    #[error("at {location}, {component}.{member} is a method, not a field")]
    NotAField {
        location: Location,
        component: String,
        member: String,
    },
    #[error("at {location}, {component}.{member} takes {expected} args, found {found}")]
    ArityMismatch {
        location: Location,
        component: String,
        member: String,
        expected: usize,
        found: usize,
    },
    #[error("at {location}, {component}.{member} returns nothing and cannot be used as a value")]
    VoidCall {
        location: Location,
        component: String,
        member: String,
    },
    #[error("at {location}, {context} expects {expected}, found {found}")]
    TypeMismatch {
        location: Location,
        context: String,
        expected: Ty,
        found: Ty,
    },
    #[error("at {location}, cannot assign to constant {name}")]
    AssignToConst { location: Location, name: String },
    #[error("at {location}, script declares more than {} locals", MAX_LOCALS)]
    TooManyLocals { location: Location },
}

/// A script after symbol resolution: every name bound to a slot, constant
/// value, or interface member, and every expression type-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScript {
    pub declared_id: Option<u32>,
    /// Slot types, in declaration order.
    pub locals: TiVec<SlotIndex, Ty>,
    pub label_count: usize,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Marks the position jumps to this label land on.
    Label(LabelIndex),
    Assign {
        loc: Location,
        slot: SlotIndex,
        value: Expr,
    },
    SetField {
        loc: Location,
        member: MemberHandle,
        value: Expr,
    },
    /// A call in statement position; `discard` pops an unused result.
    Call {
        loc: Location,
        call: Call,
        discard: bool,
    },
    Goto {
        loc: Location,
        label: LabelIndex,
    },
    Branch {
        loc: Location,
        condition: Expr,
        label: LabelIndex,
    },
    Return {
        loc: Location,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub member: MemberHandle,
    pub args: Vec<Expr>,
    pub returns: Option<Ty>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Local { slot: SlotIndex, ty: Ty },
    Field { member: MemberHandle, ty: Ty },
    Call { call: Call, ty: Ty },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

impl Expr {
    pub fn ty(&self) -> Ty {
        match self {
            Expr::Const(v) => v.ty(),
            Expr::Local { ty, .. } => *ty,
            Expr::Field { ty, .. } => *ty,
            Expr::Call { ty, .. } => *ty,
            Expr::Unary { op: UnaryOp::Neg, .. } => Ty::Int,
            Expr::Unary { op: UnaryOp::Not, .. } => Ty::Bool,
            Expr::Binary { op, .. } => {
                if op.is_arithmetic() {
                    Ty::Int
                } else {
                    Ty::Bool
                }
            }
        }
    }
}

/// Resolves one parsed script against the frozen component table.
///
/// The pass keeps going after the first error so a file reports all of
/// its problems at once.
pub fn resolve(
    script: &ast::Script,
    table: &InterfaceTable,
    text: &str,
) -> Result<ResolvedScript, Vec<ResolveError>> {
    let mut resolver = Resolver {
        table,
        text,
        errors: vec![],
        consts: BTreeMap::new(),
        locals: BTreeMap::new(),
        local_types: TiVec::new(),
        labels: BTreeMap::new(),
        label_defined: TiVec::new(),
        label_first_use: TiVec::new(),
        declared_names: BTreeSet::new(),
    };
    resolver.pre_scan(script);
    let body = resolver.script(script);
    resolver.finish(script, body)
}

struct Resolver<'a> {
    table: &'a InterfaceTable,
    text: &'a str,
    errors: Vec<ResolveError>,
    consts: BTreeMap<String, Value>,
    locals: BTreeMap<String, SlotIndex>,
    local_types: TiVec<SlotIndex, Ty>,
    labels: BTreeMap<String, LabelIndex>,
    label_defined: TiVec<LabelIndex, bool>,
    label_first_use: TiVec<LabelIndex, Option<Location>>,
    declared_names: BTreeSet<String>,
}

impl Resolver<'_> {
    fn loc(&self, span: ast::Span) -> Location {
        span.location(self.text)
    }

    /// Collects declared names up front, only so that a use of a name
    /// declared further down gets a sharper diagnostic than "unresolved".
    fn pre_scan(&mut self, script: &ast::Script) {
        for item in &script.items {
            match item {
                ast::Item::Const(c) => {
                    self.declared_names.insert(c.name.name.clone());
                }
                ast::Item::Local(l) => {
                    self.declared_names.insert(l.name.name.clone());
                }
                _ => {}
            }
        }
    }

    fn script(&mut self, script: &ast::Script) -> Vec<Stmt> {
        let mut body = Vec::new();
        for item in &script.items {
            match item {
                ast::Item::Const(decl) => self.const_decl(decl),
                ast::Item::Local(decl) => self.local_decl(decl),
                ast::Item::Label(def) => {
                    if let Some(label) = self.label_def(def) {
                        body.push(Stmt::Label(label));
                    }
                }
                ast::Item::Stmt(stmt) => {
                    if let Some(stmt) = self.stmt(stmt) {
                        body.push(stmt);
                    }
                }
            }
        }
        body
    }

    fn finish(
        mut self,
        script: &ast::Script,
        body: Vec<Stmt>,
    ) -> Result<ResolvedScript, Vec<ResolveError>> {
        for (name, &idx) in &self.labels {
            if !self.label_defined[idx] {
                let location = self.label_first_use[idx].unwrap_or(Location { line: 1, col: 1 });
                self.errors.push(ResolveError::UndefinedLabel {
                    location,
                    name: name.clone(),
                });
            }
        }
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        Ok(ResolvedScript {
            declared_id: script.declared_id.map(|d| d.value),
            locals: self.local_types,
            label_count: self.labels.len(),
            body,
        })
    }

    fn const_decl(&mut self, decl: &ast::ConstDecl) {
        let name = &decl.name.name;
        let location = self.loc(decl.name.span);
        if self.table.contains(name) {
            self.errors.push(ResolveError::ShadowsComponent {
                location,
                name: name.clone(),
            });
            return;
        }
        if self.consts.contains_key(name) || self.locals.contains_key(name) {
            self.errors.push(ResolveError::DuplicateDeclaration {
                location,
                name: name.clone(),
            });
            return;
        }
        self.consts.insert(name.clone(), value_of(&decl.value.value));
    }

    fn local_decl(&mut self, decl: &ast::LocalDecl) {
        let name = &decl.name.name;
        let location = self.loc(decl.name.span);
        if self.table.contains(name) {
            self.errors.push(ResolveError::ShadowsComponent {
                location,
                name: name.clone(),
            });
            return;
        }
        // A local may shadow a constant, but not another local.
        if self.locals.contains_key(name) {
            self.errors.push(ResolveError::DuplicateDeclaration {
                location,
                name: name.clone(),
            });
            return;
        }
        if self.local_types.len() == MAX_LOCALS {
            self.errors.push(ResolveError::TooManyLocals { location });
            return;
        }
        let slot = self.local_types.push_and_get_key(decl.ty);
        self.locals.insert(name.clone(), slot);
    }

    fn label_def(&mut self, def: &ast::LabelDef) -> Option<LabelIndex> {
        let name = &def.name.name;
        let idx = match self.labels.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.label_defined.push_and_get_key(false);
                self.label_first_use.push(None);
                self.labels.insert(name.clone(), idx);
                idx
            }
        };
        if self.label_defined[idx] {
            self.errors.push(ResolveError::DuplicateLabel {
                location: self.loc(def.name.span),
                name: name.clone(),
            });
            return None;
        }
        self.label_defined[idx] = true;
        Some(idx)
    }

    /// Labels may be referenced before they are defined; undefined ones
    /// are reported at the end of the pass.
    fn label_ref(&mut self, ident: &ast::Ident) -> LabelIndex {
        if let Some(&idx) = self.labels.get(&ident.name) {
            return idx;
        }
        let idx = self.label_defined.push_and_get_key(false);
        self.label_first_use.push(Some(self.loc(ident.span)));
        self.labels.insert(ident.name.clone(), idx);
        idx
    }

    fn stmt(&mut self, stmt: &ast::Stmt) -> Option<Stmt> {
        match stmt {
            ast::Stmt::Assign(assign) => self.assign(assign),
            ast::Stmt::SetField(set) => self.set_field(set),
            ast::Stmt::Call(call_stmt) => {
                let loc = self.loc(call_stmt.span);
                let call = self.call(&call_stmt.call)?;
                Some(Stmt::Call {
                    loc,
                    discard: call.returns.is_some(),
                    call,
                })
            }
            ast::Stmt::Goto(goto) => {
                let loc = self.loc(goto.span);
                let label = self.label_ref(&goto.label);
                Some(Stmt::Goto { loc, label })
            }
            ast::Stmt::Branch(branch) => {
                let loc = self.loc(branch.span);
                let label = self.label_ref(&branch.label);
                let condition = self.expr(&branch.condition)?;
                if condition.ty() != Ty::Bool {
                    self.errors.push(ResolveError::TypeMismatch {
                        location: self.loc(branch.condition.span()),
                        context: "branch condition".to_string(),
                        expected: Ty::Bool,
                        found: condition.ty(),
                    });
                    return None;
                }
                Some(Stmt::Branch {
                    loc,
                    condition,
                    label,
                })
            }
            ast::Stmt::Return(ret) => Some(Stmt::Return {
                loc: self.loc(ret.span),
            }),
        }
    }

    fn assign(&mut self, assign: &ast::Assign) -> Option<Stmt> {
        let name = &assign.target.name;
        let slot = match self.locals.get(name) {
            Some(&slot) => slot,
            None => {
                let location = self.loc(assign.target.span);
                if self.consts.contains_key(name) {
                    self.errors.push(ResolveError::AssignToConst {
                        location,
                        name: name.clone(),
                    });
                } else {
                    self.unresolved(name, location);
                }
                // Still resolve the value so its errors surface too.
                let _ = self.expr(&assign.value);
                return None;
            }
        };
        let value = self.expr(&assign.value)?;
        let expected = self.local_types[slot];
        if value.ty() != expected {
            self.errors.push(ResolveError::TypeMismatch {
                location: self.loc(assign.value.span()),
                context: format!("assignment to {}", name),
                expected,
                found: value.ty(),
            });
            return None;
        }
        Some(Stmt::Assign {
            loc: self.loc(assign.span),
            slot,
            value,
        })
    }

    fn set_field(&mut self, set: &ast::SetField) -> Option<Stmt> {
        let field = self.field(&set.component, &set.member);
        let value = self.expr(&set.value);
        let ((member, ty), value) = (field?, value?);
        if value.ty() != ty {
            self.errors.push(ResolveError::TypeMismatch {
                location: self.loc(set.value.span()),
                context: format!("assignment to {}.{}", set.component.name, set.member.name),
                expected: ty,
                found: value.ty(),
            });
            return None;
        }
        Some(Stmt::SetField {
            loc: self.loc(set.span),
            member,
            value,
        })
    }

    fn expr(&mut self, expr: &ast::Expr) -> Option<Expr> {
        match expr {
            ast::Expr::Literal(lit) => Some(Expr::Const(value_of(&lit.value))),
            ast::Expr::Ident(ident) => self.ident(ident),
            ast::Expr::Field(get) => {
                let (member, ty) = self.field(&get.component, &get.member)?;
                Some(Expr::Field { member, ty })
            }
            ast::Expr::Call(call) => {
                let location = self.loc(call.span);
                let resolved = self.call(call)?;
                let Some(ty) = resolved.returns else {
                    self.errors.push(ResolveError::VoidCall {
                        location,
                        component: call.component.name.clone(),
                        member: call.member.name.clone(),
                    });
                    return None;
                };
                Some(Expr::Call { call: resolved, ty })
            }
            ast::Expr::Unary(unary) => {
                let operand = self.expr(&unary.operand)?;
                let expected = match unary.op {
                    UnaryOp::Neg => Ty::Int,
                    UnaryOp::Not => Ty::Bool,
                };
                if operand.ty() != expected {
                    self.errors.push(ResolveError::TypeMismatch {
                        location: self.loc(unary.operand.span()),
                        context: format!("operand of {}", unary.op),
                        expected,
                        found: operand.ty(),
                    });
                    return None;
                }
                Some(Expr::Unary {
                    op: unary.op,
                    operand: Box::new(operand),
                })
            }
            ast::Expr::Binary(binary) => self.binary(binary),
        }
    }

    fn ident(&mut self, ident: &ast::Ident) -> Option<Expr> {
        // Innermost scope first: locals shadow constants.
        if let Some(&slot) = self.locals.get(&ident.name) {
            return Some(Expr::Local {
                slot,
                ty: self.local_types[slot],
            });
        }
        if let Some(value) = self.consts.get(&ident.name) {
            return Some(Expr::Const(value.clone()));
        }
        let location = self.loc(ident.span);
        if self.table.contains(&ident.name) {
            self.errors.push(ResolveError::ComponentAsValue {
                location,
                name: ident.name.clone(),
            });
            return None;
        }
        self.unresolved(&ident.name, location);
        None
    }

    fn unresolved(&mut self, name: &str, location: Location) {
        let err = if self.declared_names.contains(name) {
            ResolveError::UsedBeforeDeclaration {
                location,
                name: name.to_string(),
            }
        } else {
            ResolveError::Unresolved {
                location,
                name: name.to_string(),
            }
        };
        self.errors.push(err);
    }

    fn field(&mut self, component: &ast::Ident, member: &ast::Ident) -> Option<(MemberHandle, Ty)> {
        let comp = match self.table.get(&component.name) {
            Some(comp) => comp,
            None => {
                self.errors.push(ResolveError::UnknownInterface {
                    location: self.loc(component.span),
                    name: component.name.clone(),
                });
                return None;
            }
        };
        let Some((pos, m)) = comp.member(&member.name) else {
            self.errors.push(ResolveError::UnknownMember {
                location: self.loc(member.span),
                component: component.name.clone(),
                member: member.name.clone(),
            });
            return None;
        };
        match &m.signature {
            Signature::Field { ty } => Some((comp.handle(pos), *ty)),
            Signature::Method { .. } => {
                self.errors.push(ResolveError::NotAField {
                    location: self.loc(member.span),
                    component: component.name.clone(),
                    member: member.name.clone(),
                });
                None
            }
        }
    }

    fn call(&mut self, call: &ast::Call) -> Option<Call> {
        // Resolve arguments first so their errors surface even when the
        // callee itself is unknown.
        let args: Vec<Option<Expr>> = call.args.iter().map(|a| self.expr(a)).collect();
        let comp = match self.table.get(&call.component.name) {
            Some(comp) => comp,
            None => {
                self.errors.push(ResolveError::UnknownInterface {
                    location: self.loc(call.component.span),
                    name: call.component.name.clone(),
                });
                return None;
            }
        };
        let Some((pos, member)) = comp.member(&call.member.name) else {
            self.errors.push(ResolveError::UnknownMember {
                location: self.loc(call.member.span),
                component: call.component.name.clone(),
                member: call.member.name.clone(),
            });
            return None;
        };
        let Signature::Method { args: expected, returns } = &member.signature else {
            self.errors.push(ResolveError::NotAMethod {
                location: self.loc(call.member.span),
                component: call.component.name.clone(),
                member: call.member.name.clone(),
            });
            return None;
        };
        if call.args.len() != expected.len() {
            self.errors.push(ResolveError::ArityMismatch {
                location: self.loc(call.span),
                component: call.component.name.clone(),
                member: call.member.name.clone(),
                expected: expected.len(),
                found: call.args.len(),
            });
            return None;
        }
        let handle = comp.handle(pos);
        let returns = *returns;
        let mut resolved = Vec::with_capacity(args.len());
        let mut ok = true;
        for (i, (arg, &want)) in args.into_iter().zip(expected).enumerate() {
            match arg {
                None => ok = false,
                Some(arg) if arg.ty() != want => {
                    self.errors.push(ResolveError::TypeMismatch {
                        location: self.loc(call.args[i].span()),
                        context: format!(
                            "argument {} of {}.{}",
                            i + 1,
                            call.component.name,
                            call.member.name
                        ),
                        expected: want,
                        found: arg.ty(),
                    });
                    ok = false;
                }
                Some(arg) => resolved.push(arg),
            }
        }
        if !ok {
            return None;
        }
        Some(Call {
            member: handle,
            args: resolved,
            returns,
        })
    }

    fn binary(&mut self, binary: &ast::Binary) -> Option<Expr> {
        let lhs = self.expr(&binary.lhs);
        let rhs = self.expr(&binary.rhs);
        let (lhs, rhs) = (lhs?, rhs?);
        let op = binary.op;
        if op.is_arithmetic() || op.is_ordering() {
            let mut ok = true;
            for (side, e, span) in [
                ("left", &lhs, binary.lhs.span()),
                ("right", &rhs, binary.rhs.span()),
            ] {
                if e.ty() != Ty::Int {
                    self.errors.push(ResolveError::TypeMismatch {
                        location: self.loc(span),
                        context: format!("{} operand of {}", side, op),
                        expected: Ty::Int,
                        found: e.ty(),
                    });
                    ok = false;
                }
            }
            if !ok {
                return None;
            }
        } else if lhs.ty() != rhs.ty() {
            self.errors.push(ResolveError::TypeMismatch {
                location: self.loc(binary.rhs.span()),
                context: format!("right operand of {}", op),
                expected: lhs.ty(),
                found: rhs.ty(),
            });
            return None;
        }
        Some(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }
}

fn value_of(lit: &ast::LiteralValue) -> Value {
    match lit {
        ast::LiteralValue::Int(v) => Value::Int(*v),
        ast::LiteralValue::Str(s) => Value::Str(s.clone()),
        ast::LiteralValue::Bool(b) => Value::Bool(*b),
    }
}
