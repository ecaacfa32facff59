use std::{io, path::Path};

use itertools::Itertools;

use crate::{
    ast::Ty,
    interface::{Component, InterfaceTable, Member, Signature},
};

/// One generated source file: its file name and full contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub name: String,
    pub contents: String,
}

const HEADER: &str = "// Generated by `sablec bindings`. Do not edit.\n";

/// Renders typed binding stubs for every component in the table.
///
/// Output is a pure function of the table: components are visited in
/// name order and members in declaration order, so regenerating over an
/// unchanged table is byte-identical.
pub fn generate(table: &InterfaceTable) -> Vec<GeneratedFile> {
    let mut files = vec![mod_file(table)];
    for component in table.components() {
        files.push(component_file(component));
    }
    files
}

/// Writes the generated files under `out_dir`, creating it if needed.
pub fn write_all(table: &InterfaceTable, out_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    for file in generate(table) {
        std::fs::write(out_dir.join(&file.name), file.contents)?;
    }
    Ok(())
}

fn mod_file(table: &InterfaceTable) -> GeneratedFile {
    let mut out = String::from(HEADER);
    out.push('\n');
    for component in table.components() {
        out.push_str(&format!("pub mod {};\n", decl_name(&component.name)));
    }
    if !table.is_empty() {
        out.push('\n');
    }
    out.push_str(
        r#"/// Reference to a component member, as encoded in compiled scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef {
    pub component: u16,
    pub member: u16,
}

impl MemberRef {
    /// Packed `(component << 16) | member` form used by dispatch tables.
    pub const fn packed(self) -> u32 {
        (self.component as u32) << 16 | self.member as u32
    }
}
"#,
    );
    GeneratedFile {
        name: "mod.rs".to_string(),
        contents: out,
    }
}

fn component_file(component: &Component) -> GeneratedFile {
    let mut out = String::from(HEADER);
    out.push('\n');
    out.push_str("use super::MemberRef;\n\n");
    out.push_str(&format!(
        "/// Component `{}` (id {}).\n",
        component.name, component.id
    ));
    let type_name = struct_name(&component.name);
    out.push_str(&format!("pub struct {};\n\n", type_name));
    out.push_str(&format!("impl {} {{\n", type_name));
    out.push_str(&format!("    pub const ID: u16 = {};\n", component.id));
    if !component.members.is_empty() {
        out.push('\n');
        out.push_str("    // Member indices, in declaration order.\n");
        for (pos, member) in component.members.iter().enumerate() {
            out.push_str(&format!(
                "    pub const {}: u16 = {};\n",
                member_const_name(&member.name),
                pos
            ));
        }
    }
    for member in &component.members {
        out.push('\n');
        let index = format!("Self::{}", member_const_name(&member.name));
        match &member.signature {
            Signature::Method { args, returns } => {
                out.push_str(&format!("    /// `{}`\n", method_doc(member, args, returns)));
                let params = args
                    .iter()
                    .enumerate()
                    .map(|(i, ty)| format!("_arg{}: {}", i, rust_type(*ty)))
                    .join(", ");
                out.push_str(&format!(
                    "    pub fn {}({}) -> MemberRef {{\n",
                    member_fn_name(&member.name),
                    params
                ));
                out.push_str(&format!(
                    "        MemberRef {{ component: Self::ID, member: {} }}\n",
                    index
                ));
                out.push_str("    }\n");
            }
            Signature::Field { ty } => {
                out.push_str(&format!("    /// `{}: {}`\n", member.name, ty));
                out.push_str(&format!(
                    "    pub fn {}() -> MemberRef {{\n",
                    member_fn_name(&member.name)
                ));
                out.push_str(&format!(
                    "        MemberRef {{ component: Self::ID, member: {} }}\n",
                    index
                ));
                out.push_str("    }\n");
            }
        }
    }
    out.push_str("}\n");
    GeneratedFile {
        name: format!("{}.rs", file_stem(&component.name)),
        contents: out,
    }
}

fn method_doc(member: &Member, args: &[Ty], returns: &Option<Ty>) -> String {
    let args = args.iter().map(|t| t.to_string()).join(", ");
    match returns {
        Some(ty) => format!("{}({}) -> {}", member.name, args, ty),
        None => format!("{}({})", member.name, args),
    }
}

fn rust_type(ty: Ty) -> &'static str {
    match ty {
        Ty::Int => "i64",
        Ty::Str => "&str",
        Ty::Bool => "bool",
    }
}

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "unsafe", "use", "where", "while",
];

/// Lowercased, alphanumeric-only stem used as the generated file name.
fn file_stem(name: &str) -> String {
    sanitize(name).to_lowercase()
}

/// The name used in the `pub mod` declaration; raw when it would collide
/// with a Rust keyword.
fn decl_name(name: &str) -> String {
    let stem = file_stem(name);
    if RUST_KEYWORDS.contains(&stem.as_str()) {
        format!("r#{}", stem)
    } else {
        stem
    }
}

fn member_fn_name(name: &str) -> String {
    let sanitized = sanitize(name);
    if RUST_KEYWORDS.contains(&sanitized.as_str()) {
        format!("r#{}", sanitized)
    } else {
        sanitized
    }
}

/// Associated-constant name for a member index. `ID` is taken by the
/// component id.
fn member_const_name(name: &str) -> String {
    let upper = sanitize(name).to_uppercase();
    if upper == "ID" {
        "ID_MEMBER".to_string()
    } else {
        upper
    }
}

fn struct_name(name: &str) -> String {
    let stem = sanitize(name);
    let mut out = String::with_capacity(stem.len());
    let mut upper_next = true;
    for ch in stem.chars() {
        if ch == '_' {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    if out.is_empty() {
        out.push_str("Component");
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out == "Self" {
        out.push('_');
    }
    out
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if i == 0 && ch.is_ascii_digit() {
                out.push('_');
            }
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
