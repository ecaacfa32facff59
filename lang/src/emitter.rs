use thiserror::Error;
use typed_index_collections::TiVec;

use crate::{
    ast::{BinaryOp, UnaryOp},
    bytecode::{ConstPool, Opcode, PoolOverflow},
    resolver::{Call, Expr, LabelIndex, ResolvedScript, Stmt},
    source::Location,
};

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("at {location}, jump distance {distance} exceeds the encodable range")]
    JumpOutOfRange { location: Location, distance: isize },
    #[error("at {location}, {source}")]
    PoolOverflow {
        location: Location,
        #[source]
        source: PoolOverflow,
    },
    #[error("code section exceeds {} bytes", u32::MAX)]
    CodeTooLarge,
}

/// Lowers one resolved script to bytecode.
///
/// Emission is deterministic: the same resolved script always yields the
/// same code bytes and pool, so artifacts are byte-stable across runs.
pub fn emit(script: &ResolvedScript) -> Result<(Vec<u8>, ConstPool), EmitError> {
    let mut emitter = Emitter {
        code: vec![],
        pool: ConstPool::default(),
        label_offsets: (0..script.label_count).map(|_| None).collect(),
        patches: vec![],
    };
    for stmt in &script.body {
        emitter.stmt(stmt)?;
    }
    // Execution always ends on an explicit RET.
    if !matches!(script.body.last(), Some(Stmt::Return { .. })) {
        emitter.op(Opcode::Ret);
    }
    emitter.patch()?;
    if emitter.code.len() > u32::MAX as usize {
        return Err(EmitError::CodeTooLarge);
    }
    Ok((emitter.code, emitter.pool))
}

struct Emitter {
    code: Vec<u8>,
    pool: ConstPool,
    label_offsets: TiVec<LabelIndex, Option<usize>>,
    patches: Vec<Patch>,
}

struct Patch {
    /// Offset of the two operand bytes to rewrite.
    at: usize,
    target: LabelIndex,
    loc: Location,
}

impl Emitter {
    fn op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    fn operand_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), EmitError> {
        match stmt {
            Stmt::Label(label) => {
                self.label_offsets[*label] = Some(self.code.len());
            }
            Stmt::Assign { loc, slot, value } => {
                self.expr(value, *loc)?;
                self.op(Opcode::Store);
                self.operand_u16(usize::from(*slot) as u16);
            }
            Stmt::SetField { loc, member, value } => {
                self.expr(value, *loc)?;
                self.op(Opcode::SetField);
                self.operand_u16(member.component);
                self.operand_u16(member.member);
            }
            Stmt::Call { loc, call, discard } => {
                self.call(call, *loc)?;
                if *discard {
                    self.op(Opcode::Pop);
                }
            }
            Stmt::Goto { loc, label } => self.jump(Opcode::Jump, *label, *loc),
            Stmt::Branch {
                loc,
                condition,
                label,
            } => {
                self.expr(condition, *loc)?;
                self.jump(Opcode::JumpIf, *label, *loc);
            }
            Stmt::Return { .. } => self.op(Opcode::Ret),
        }
        Ok(())
    }

    fn jump(&mut self, op: Opcode, target: LabelIndex, loc: Location) {
        self.op(op);
        self.patches.push(Patch {
            at: self.code.len(),
            target,
            loc,
        });
        self.operand_u16(0);
    }

    fn expr(&mut self, expr: &Expr, loc: Location) -> Result<(), EmitError> {
        match expr {
            Expr::Const(value) => {
                let idx = self
                    .pool
                    .intern(value.clone())
                    .map_err(|e| EmitError::PoolOverflow {
                        location: loc,
                        source: e,
                    })?;
                self.op(Opcode::Push);
                self.operand_u16(usize::from(idx) as u16);
            }
            Expr::Local { slot, .. } => {
                self.op(Opcode::Load);
                self.operand_u16(usize::from(*slot) as u16);
            }
            Expr::Field { member, .. } => {
                self.op(Opcode::GetField);
                self.operand_u16(member.component);
                self.operand_u16(member.member);
            }
            Expr::Call { call, .. } => self.call(call, loc)?,
            Expr::Unary { op, operand } => {
                self.expr(operand, loc)?;
                self.op(match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                });
            }
            Expr::Binary { op, lhs, rhs } => {
                self.expr(lhs, loc)?;
                self.expr(rhs, loc)?;
                self.op(binary_opcode(*op));
            }
        }
        Ok(())
    }

    fn call(&mut self, call: &Call, loc: Location) -> Result<(), EmitError> {
        for arg in &call.args {
            self.expr(arg, loc)?;
        }
        self.op(Opcode::Invoke);
        self.operand_u16(call.member.component);
        self.operand_u16(call.member.member);
        // Arity fits a byte; the interface loader enforces the cap.
        self.code.push(call.args.len() as u8);
        Ok(())
    }

    fn patch(&mut self) -> Result<(), EmitError> {
        for patch in &self.patches {
            let Some(target) = self.label_offsets[patch.target] else {
                unreachable!("unpatched label survived resolution");
            };
            // Distances are relative to the end of the jump instruction.
            let distance = target as isize - (patch.at + 2) as isize;
            let Ok(encoded) = i16::try_from(distance) else {
                return Err(EmitError::JumpOutOfRange {
                    location: patch.loc,
                    distance,
                });
            };
            self.code[patch.at..patch.at + 2].copy_from_slice(&encoded.to_le_bytes());
        }
        Ok(())
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::Value,
        interface::{InterfaceTable, MemberHandle},
        parser,
        resolver::{self, SlotIndex},
    };

    const COMPONENTS: &str = r#"
        [[component]]
        name = "ui"
        id = 4

        [[component.member]]
        name = "say"
        kind = "method"
        args = ["string"]

        [[component.member]]
        name = "prompt"
        kind = "method"
        args = ["string"]
        returns = "int"
    "#;

    fn compile(text: &str) -> (Vec<u8>, ConstPool) {
        let script = parser::parse(text).unwrap();
        let table = InterfaceTable::from_str(COMPONENTS).unwrap();
        let resolved = resolver::resolve(&script, &table, text).unwrap();
        emit(&resolved).unwrap()
    }

    #[test]
    fn greeting_compiles_to_push_invoke_ret() {
        let (code, pool) = compile("const greeting = \"hello\"\nui.say(greeting)");
        assert_eq!(
            code,
            vec![
                Opcode::Push as u8, 0, 0, // pool slot 0
                Opcode::Invoke as u8, 4, 0, 0, 0, 1, // ui.say, 1 arg
                Opcode::Ret as u8,
            ]
        );
        assert_eq!(pool.len(), 1);
        assert_eq!(
            pool.get(crate::bytecode::PoolIndex::from(0)),
            Some(&Value::Str("hello".to_string()))
        );
    }

    #[test]
    fn explicit_trailing_return_is_not_doubled() {
        let (code, _) = compile("return");
        assert_eq!(code, vec![Opcode::Ret as u8]);
    }

    #[test]
    fn empty_scripts_still_return() {
        let (code, _) = compile("");
        assert_eq!(code, vec![Opcode::Ret as u8]);
    }

    #[test]
    fn backward_jumps_encode_negative_distances() {
        let (code, _) = compile("top:\ngoto top");
        // Jump operand is relative to the end of the instruction.
        assert_eq!(
            code,
            vec![
                Opcode::Jump as u8,
                0xfd,
                0xff, // -3
                Opcode::Ret as u8,
            ]
        );
    }

    #[test]
    fn forward_jumps_are_backpatched() {
        let (code, _) = compile("goto end\nui.say(\"x\")\nend:");
        let distance = i16::from_le_bytes([code[1], code[2]]);
        // The label lands on the implicit RET, past PUSH (3) and INVOKE (6).
        assert_eq!(distance, 9);
        assert_eq!(code[3 + distance as usize], Opcode::Ret as u8);
    }

    #[test]
    fn branches_evaluate_then_jump() {
        let (code, _) = compile("top:\nif 1 < 2 goto top");
        assert_eq!(
            code,
            vec![
                Opcode::Push as u8, 0, 0,
                Opcode::Push as u8, 1, 0,
                Opcode::Lt as u8,
                Opcode::JumpIf as u8, 0xf6, 0xff, // -10, back to offset 0
                Opcode::Ret as u8,
            ]
        );
    }

    #[test]
    fn equal_constants_share_a_pool_slot() {
        let (_, pool) = compile("ui.say(\"a\")\nui.say(\"a\")\nui.say(\"b\")");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn pool_entries_follow_emission_order() {
        let (_, pool) = compile("ui.say(\"b\")\nui.say(\"a\")");
        let values: Vec<_> = pool.iter().cloned().collect();
        assert_eq!(
            values,
            vec![Value::Str("b".to_string()), Value::Str("a".to_string())]
        );
    }

    #[test]
    fn discarded_results_are_popped() {
        let (code, _) = compile("ui.prompt(\"q\")");
        assert_eq!(code[code.len() - 2], Opcode::Pop as u8);
        assert_eq!(code[code.len() - 1], Opcode::Ret as u8);
    }

    #[test]
    fn kept_results_are_not_popped() {
        let (code, _) = compile("local x: int\nx = ui.prompt(\"q\")");
        assert!(!code.contains(&(Opcode::Pop as u8)));
        // STORE x, then the implicit RET.
        assert_eq!(code[code.len() - 4], Opcode::Store as u8);
    }

    #[test]
    fn emission_is_repeatable() {
        let text = "local n: int\nn = 1\nloop:\nn = n * 2\nif n < 100 goto loop";
        let script = parser::parse(text).unwrap();
        let table = InterfaceTable::from_str(COMPONENTS).unwrap();
        let resolved = resolver::resolve(&script, &table, text).unwrap();
        let first = emit(&resolved).unwrap();
        let second = emit(&resolved).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(
            first.1.iter().collect::<Vec<_>>(),
            second.1.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn jumps_past_the_i16_range_are_rejected() {
        let loc = Location { line: 1, col: 1 };
        let call = Call {
            member: MemberHandle {
                component: 4,
                member: 0,
            },
            args: vec![Expr::Const(Value::Int(1))],
            returns: None,
        };
        let mut body = vec![Stmt::Goto {
            loc,
            label: LabelIndex::from(0),
        }];
        // Each call emits 9 bytes; 4000 of them put the label well past
        // what an i16 distance can express.
        for _ in 0..4000 {
            body.push(Stmt::Call {
                loc,
                call: call.clone(),
                discard: false,
            });
        }
        body.push(Stmt::Label(LabelIndex::from(0)));
        let script = ResolvedScript {
            declared_id: None,
            locals: TiVec::new(),
            label_count: 1,
            body,
        };
        assert!(matches!(
            emit(&script),
            Err(EmitError::JumpOutOfRange { distance, .. }) if distance > i16::MAX as isize
        ));
    }

    #[test]
    fn pool_exhaustion_surfaces_as_an_emit_error() {
        let loc = Location { line: 1, col: 1 };
        let body = (0..=ConstPool::CAPACITY as i64)
            .map(|i| Stmt::Assign {
                loc,
                slot: SlotIndex::from(0),
                value: Expr::Const(Value::Int(i)),
            })
            .collect();
        let script = ResolvedScript {
            declared_id: None,
            locals: std::iter::once(crate::ast::Ty::Int).collect(),
            label_count: 0,
            body,
        };
        assert!(matches!(
            emit(&script),
            Err(EmitError::PoolOverflow { .. })
        ));
    }
}
