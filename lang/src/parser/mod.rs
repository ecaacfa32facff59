use itertools::Itertools;
use pest::{
    Parser,
    error::{ErrorVariant, InputLocation, LineColLocation},
    iterators::Pair,
};
use pest_derive::Parser;
use thiserror::Error;

use crate::{ast, bytecode::MAX_SCRIPT_ID, source::Location};

#[derive(Parser)]
#[grammar = "parser/sable.pest"]
struct SableParser;

#[derive(Debug, Error)]
pub enum SyntaxError {
    #[error("at {location}, expected {expected}, found {found}")]
    Unexpected {
        location: Location,
        expected: String,
        found: String,
    },
    #[error("at {location}, integer literal {text:?} is out of range")]
    IntOutOfRange { location: Location, text: String },
    #[error("at {location}, script id {value} is out of range (max {})", MAX_SCRIPT_ID)]
    ScriptIdOutOfRange { location: Location, value: i64 },
    #[error("at {location}, invalid escape sequence \\{escape}")]
    BadEscape { location: Location, escape: char },
}

impl SyntaxError {
    fn from_pest(err: pest::error::Error<Rule>, text: &str) -> Self {
        let (line, col) = match err.line_col {
            LineColLocation::Pos(pos) => pos,
            LineColLocation::Span(start, _) => start,
        };
        let offset = match err.location {
            InputLocation::Pos(pos) => pos,
            InputLocation::Span((start, _)) => start,
        };
        let found = match text[offset.min(text.len())..].chars().next() {
            Some(ch) => format!("{:?}", ch),
            None => "end of input".to_string(),
        };
        let expected = match &err.variant {
            ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
                positives.iter().map(|r| rule_name(*r)).unique().join(" or ")
            }
            ErrorVariant::ParsingError { .. } => "valid input".to_string(),
            ErrorVariant::CustomError { message } => message.clone(),
        };
        SyntaxError::Unexpected {
            location: Location { line, col },
            expected,
            found,
        }
    }
}

fn rule_name(rule: Rule) -> &'static str {
    match rule {
        Rule::script => "script",
        Rule::id_directive => "`.id` directive",
        Rule::const_decl | Rule::kw_const => "`const` declaration",
        Rule::local_decl | Rule::kw_local => "`local` declaration",
        Rule::label_def => "label",
        Rule::goto_stmt | Rule::kw_goto => "`goto`",
        Rule::branch_stmt | Rule::kw_if => "`if`",
        Rule::return_stmt | Rule::kw_return => "`return`",
        Rule::set_field_stmt => "field assignment",
        Rule::call_stmt | Rule::call => "call",
        Rule::assign_stmt => "assignment",
        Rule::cmp | Rule::sum | Rule::product | Rule::unary => "expression",
        Rule::cmp_op | Rule::sum_op | Rule::product_op | Rule::unary_op => "operator",
        Rule::field_get => "field access",
        Rule::literal | Rule::int | Rule::bool | Rule::string => "literal",
        Rule::type_name => "type name",
        Rule::identifier => "identifier",
        Rule::EOI => "end of input",
        _ => "input",
    }
}

/// Parses one script's text into its syntax tree.
pub fn parse(text: &str) -> Result<ast::Script, SyntaxError> {
    let parsed = SableParser::parse(Rule::script, text)
        .map_err(|e| SyntaxError::from_pest(e, text))?
        .next()
        .unwrap();
    script(parsed)
}

fn location(p: &Pair<Rule>) -> Location {
    let (line, col) = p.as_span().start_pos().line_col();
    Location { line, col }
}

fn script(p: Pair<Rule>) -> Result<ast::Script, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::script);
    let mut result = ast::Script {
        declared_id: None,
        items: vec![],
    };
    for pair in p.into_inner() {
        match pair.as_rule() {
            Rule::id_directive => result.declared_id = Some(id_directive(pair)?),
            Rule::const_decl => result.items.push(ast::Item::Const(const_decl(pair)?)),
            Rule::local_decl => result.items.push(ast::Item::Local(local_decl(pair)?)),
            Rule::label_def => result.items.push(ast::Item::Label(label_def(pair))),
            Rule::goto_stmt
            | Rule::branch_stmt
            | Rule::return_stmt
            | Rule::set_field_stmt
            | Rule::call_stmt
            | Rule::assign_stmt => result.items.push(ast::Item::Stmt(stmt(pair)?)),
            Rule::EOI => {}
            _ => panic!("invalid script item: {:?}", pair.as_rule()),
        }
    }
    Ok(result)
}

fn id_directive(p: Pair<Rule>) -> Result<ast::DeclaredId, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::id_directive);
    let span = ast::Span::from(p.as_span());
    let int = p.into_inner().exactly_one().unwrap();
    let value = parse_int(&int)?;
    if !(0..=i64::from(MAX_SCRIPT_ID)).contains(&value) {
        return Err(SyntaxError::ScriptIdOutOfRange {
            location: location(&int),
            value,
        });
    }
    Ok(ast::DeclaredId {
        span,
        value: value as u32,
    })
}

fn const_decl(p: Pair<Rule>) -> Result<ast::ConstDecl, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::const_decl);
    let span = ast::Span::from(p.as_span());
    let (_, name, value) = p.into_inner().collect_tuple().unwrap();
    Ok(ast::ConstDecl {
        span,
        name: identifier(name),
        value: literal(value)?,
    })
}

fn local_decl(p: Pair<Rule>) -> Result<ast::LocalDecl, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::local_decl);
    let span = ast::Span::from(p.as_span());
    let (_, name, ty) = p.into_inner().collect_tuple().unwrap();
    Ok(ast::LocalDecl {
        span,
        name: identifier(name),
        ty: type_name(ty),
    })
}

fn label_def(p: Pair<Rule>) -> ast::LabelDef {
    assert_eq!(p.as_rule(), Rule::label_def);
    let span = ast::Span::from(p.as_span());
    let name = p.into_inner().exactly_one().unwrap();
    ast::LabelDef {
        span,
        name: identifier(name),
    }
}

fn stmt(p: Pair<Rule>) -> Result<ast::Stmt, SyntaxError> {
    let span = ast::Span::from(p.as_span());
    match p.as_rule() {
        Rule::goto_stmt => {
            let (_, label) = p.into_inner().collect_tuple().unwrap();
            Ok(ast::Stmt::Goto(ast::Goto {
                span,
                label: identifier(label),
            }))
        }
        Rule::branch_stmt => {
            let (_, condition, _, label) = p.into_inner().collect_tuple().unwrap();
            Ok(ast::Stmt::Branch(ast::Branch {
                span,
                condition: expr(condition)?,
                label: identifier(label),
            }))
        }
        Rule::return_stmt => Ok(ast::Stmt::Return(ast::Return { span })),
        Rule::set_field_stmt => {
            let (component, member, value) = p.into_inner().collect_tuple().unwrap();
            Ok(ast::Stmt::SetField(ast::SetField {
                span,
                component: identifier(component),
                member: identifier(member),
                value: expr(value)?,
            }))
        }
        Rule::call_stmt => {
            let inner = p.into_inner().exactly_one().unwrap();
            Ok(ast::Stmt::Call(ast::CallStmt {
                span,
                call: call(inner)?,
            }))
        }
        Rule::assign_stmt => {
            let (target, value) = p.into_inner().collect_tuple().unwrap();
            Ok(ast::Stmt::Assign(ast::Assign {
                span,
                target: identifier(target),
                value: expr(value)?,
            }))
        }
        _ => panic!("invalid statement: {:?}", p.as_rule()),
    }
}

fn expr(p: Pair<Rule>) -> Result<ast::Expr, SyntaxError> {
    match p.as_rule() {
        Rule::cmp => cmp(p),
        _ => panic!("invalid expression: {:?}", p.as_rule()),
    }
}

fn cmp(p: Pair<Rule>) -> Result<ast::Expr, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::cmp);
    let mut inner = p.into_inner();
    let lhs = sum(inner.next().unwrap())?;
    match inner.next() {
        None => Ok(lhs),
        Some(op) => {
            let rhs = sum(inner.next().unwrap())?;
            Ok(binary(cmp_op(op), lhs, rhs))
        }
    }
}

fn cmp_op(p: Pair<Rule>) -> ast::BinaryOp {
    assert_eq!(p.as_rule(), Rule::cmp_op);
    match p.as_str() {
        "==" => ast::BinaryOp::Eq,
        "!=" => ast::BinaryOp::Ne,
        "<=" => ast::BinaryOp::Le,
        ">=" => ast::BinaryOp::Ge,
        "<" => ast::BinaryOp::Lt,
        ">" => ast::BinaryOp::Gt,
        other => panic!("invalid comparison operator: {:?}", other),
    }
}

fn sum(p: Pair<Rule>) -> Result<ast::Expr, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::sum);
    let mut inner = p.into_inner();
    let mut lhs = product(inner.next().unwrap())?;
    while let Some(op) = inner.next() {
        let op = match op.as_str() {
            "+" => ast::BinaryOp::Add,
            "-" => ast::BinaryOp::Sub,
            other => panic!("invalid sum operator: {:?}", other),
        };
        let rhs = product(inner.next().unwrap())?;
        lhs = binary(op, lhs, rhs);
    }
    Ok(lhs)
}

fn product(p: Pair<Rule>) -> Result<ast::Expr, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::product);
    let mut inner = p.into_inner();
    let mut lhs = unary(inner.next().unwrap())?;
    while let Some(op) = inner.next() {
        let op = match op.as_str() {
            "*" => ast::BinaryOp::Mul,
            "/" => ast::BinaryOp::Div,
            other => panic!("invalid product operator: {:?}", other),
        };
        let rhs = unary(inner.next().unwrap())?;
        lhs = binary(op, lhs, rhs);
    }
    Ok(lhs)
}

fn binary(op: ast::BinaryOp, lhs: ast::Expr, rhs: ast::Expr) -> ast::Expr {
    let span = ast::Span {
        start: lhs.span().start,
        end: rhs.span().end,
    };
    ast::Expr::Binary(ast::Binary {
        span,
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn unary(p: Pair<Rule>) -> Result<ast::Expr, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::unary);
    let mut ops = vec![];
    let mut operand = None;
    for pair in p.into_inner() {
        match pair.as_rule() {
            Rule::unary_op => {
                let op = match pair.as_str() {
                    "-" => ast::UnaryOp::Neg,
                    "!" => ast::UnaryOp::Not,
                    other => panic!("invalid unary operator: {:?}", other),
                };
                ops.push((op, ast::Span::from(pair.as_span())));
            }
            _ => operand = Some(atom(pair)?),
        }
    }
    let mut result = operand.unwrap();
    for (op, op_span) in ops.into_iter().rev() {
        let span = ast::Span {
            start: op_span.start,
            end: result.span().end,
        };
        result = ast::Expr::Unary(ast::Unary {
            span,
            op,
            operand: Box::new(result),
        });
    }
    Ok(result)
}

fn atom(p: Pair<Rule>) -> Result<ast::Expr, SyntaxError> {
    match p.as_rule() {
        Rule::literal => Ok(ast::Expr::Literal(literal(p)?)),
        Rule::call => Ok(ast::Expr::Call(call(p)?)),
        Rule::field_get => {
            let span = ast::Span::from(p.as_span());
            let (component, member) = p.into_inner().collect_tuple().unwrap();
            Ok(ast::Expr::Field(ast::FieldGet {
                span,
                component: identifier(component),
                member: identifier(member),
            }))
        }
        Rule::cmp => cmp(p),
        Rule::identifier => Ok(ast::Expr::Ident(identifier(p))),
        _ => panic!("invalid atom: {:?}", p.as_rule()),
    }
}

fn call(p: Pair<Rule>) -> Result<ast::Call, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::call);
    let span = ast::Span::from(p.as_span());
    let mut inner = p.into_inner();
    let component = identifier(inner.next().unwrap());
    let member = identifier(inner.next().unwrap());
    let args = inner.map(expr).collect::<Result<Vec<_>, _>>()?;
    Ok(ast::Call {
        span,
        component,
        member,
        args,
    })
}

fn literal(p: Pair<Rule>) -> Result<ast::Literal, SyntaxError> {
    assert_eq!(p.as_rule(), Rule::literal);
    let inner = p.into_inner().exactly_one().unwrap();
    let span = ast::Span::from(inner.as_span());
    let value = match inner.as_rule() {
        Rule::int => ast::LiteralValue::Int(parse_int(&inner)?),
        Rule::bool => ast::LiteralValue::Bool(inner.as_str() == "true"),
        Rule::string => ast::LiteralValue::Str(unescape(&inner)?),
        _ => panic!("invalid literal: {:?}", inner.as_rule()),
    };
    Ok(ast::Literal { span, value })
}

fn parse_int(p: &Pair<Rule>) -> Result<i64, SyntaxError> {
    p.as_str().parse().map_err(|_| SyntaxError::IntOutOfRange {
        location: location(p),
        text: p.as_str().to_string(),
    })
}

fn unescape(p: &Pair<Rule>) -> Result<String, SyntaxError> {
    let raw = p.as_str();
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                return Err(SyntaxError::BadEscape {
                    location: location(p),
                    escape: other,
                });
            }
            None => panic!("dangling escape in string literal"),
        }
    }
    Ok(out)
}

fn identifier(p: Pair<Rule>) -> ast::Ident {
    assert_eq!(p.as_rule(), Rule::identifier);
    ast::Ident {
        span: ast::Span::from(p.as_span()),
        name: p.as_str().to_string(),
    }
}

fn type_name(p: Pair<Rule>) -> ast::Ty {
    assert_eq!(p.as_rule(), Rule::type_name);
    match p.as_str() {
        "int" => ast::Ty::Int,
        "string" => ast::Ty::Str,
        "bool" => ast::Ty::Bool,
        other => panic!("invalid type name: {:?}", other),
    }
}
