use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::ast::Ty;

/// Most arguments a method member may declare; call sites encode the
/// argument count as a single byte.
pub const MAX_MEMBER_ARGS: usize = u8::MAX as usize;

/// Most members one component may declare; member handles are u16.
pub const MAX_COMPONENT_MEMBERS: usize = u16::MAX as usize + 1;

/// Fully resolved reference to one member of one component.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemberHandle {
    pub component: u16,
    pub member: u16,
}

impl MemberHandle {
    /// Packed `(component << 16) | member` form used by runtime dispatch
    /// tables and the generated bindings.
    pub const fn packed(self) -> u32 {
        (self.component as u32) << 16 | self.member as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Method { args: Vec<Ty>, returns: Option<Ty> },
    Field { ty: Ty },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub id: u16,
    /// Members in declaration order; a member's position is its handle.
    pub members: Vec<Member>,
}

impl Component {
    pub fn member(&self, name: &str) -> Option<(u16, &Member)> {
        self.members
            .iter()
            .position(|m| m.name == name)
            .map(|i| (i as u16, &self.members[i]))
    }

    pub fn handle(&self, member: u16) -> MemberHandle {
        MemberHandle {
            component: self.id,
            member,
        }
    }
}

/// Immutable set of engine components scripts may call into.
///
/// Built once per run, before any script is resolved, and shared
/// read-only by every per-script compilation after that.
#[derive(Debug, Clone, Default)]
pub struct InterfaceTable {
    components: BTreeMap<String, Component>,
}

#[derive(Debug, Error)]
pub enum InterfaceLoadError {
    #[error("unable to read component file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse component file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("component {name} has id {id}, outside 0..={}", u16::MAX)]
    IdOutOfRange { name: String, id: i64 },
    #[error("components {first} and {second} share id {id}")]
    DuplicateId { id: u16, first: String, second: String },
    #[error("duplicate component {name}")]
    DuplicateName { name: String },
    #[error("component {component}: duplicate member {member}")]
    DuplicateMember { component: String, member: String },
    #[error("component {component}: field {member} takes no args")]
    FieldWithArgs { component: String, member: String },
    #[error("component {component}: field {member} declares no return")]
    FieldWithReturns { component: String, member: String },
    #[error("component {component}: field {member} is missing a type")]
    FieldWithoutType { component: String, member: String },
    #[error("component {component}: method {member} declares a field type")]
    MethodWithType { component: String, member: String },
    #[error("component {component}: method {member} takes {found} args (max {})", MAX_MEMBER_ARGS)]
    TooManyArgs {
        component: String,
        member: String,
        found: usize,
    },
    #[error("component {component} has {found} members (max {})", MAX_COMPONENT_MEMBERS)]
    TooManyMembers { component: String, found: usize },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawComponents {
    #[serde(default)]
    component: Vec<RawComponent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawComponent {
    name: String,
    id: i64,
    #[serde(default, rename = "member")]
    members: Vec<RawMember>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMember {
    name: String,
    kind: RawKind,
    args: Option<Vec<Ty>>,
    returns: Option<Ty>,
    #[serde(rename = "type")]
    ty: Option<Ty>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawKind {
    Method,
    Field,
}

impl InterfaceTable {
    pub fn load(path: &Path) -> Result<Self, InterfaceLoadError> {
        let text = std::fs::read_to_string(path).map_err(|e| InterfaceLoadError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, InterfaceLoadError> {
        let raw: RawComponents = toml::from_str(text)?;
        Self::build(raw)
    }

    fn build(raw: RawComponents) -> Result<Self, InterfaceLoadError> {
        let mut components = BTreeMap::new();
        let mut by_id: BTreeMap<u16, String> = BTreeMap::new();
        for raw_comp in raw.component {
            if !(0..=i64::from(u16::MAX)).contains(&raw_comp.id) {
                return Err(InterfaceLoadError::IdOutOfRange {
                    name: raw_comp.name,
                    id: raw_comp.id,
                });
            }
            let id = raw_comp.id as u16;
            if let Some(first) = by_id.get(&id) {
                return Err(InterfaceLoadError::DuplicateId {
                    id,
                    first: first.clone(),
                    second: raw_comp.name,
                });
            }

            if raw_comp.members.len() > MAX_COMPONENT_MEMBERS {
                return Err(InterfaceLoadError::TooManyMembers {
                    component: raw_comp.name,
                    found: raw_comp.members.len(),
                });
            }
            let mut members: Vec<Member> = Vec::with_capacity(raw_comp.members.len());
            for raw_member in raw_comp.members {
                if members.iter().any(|m| m.name == raw_member.name) {
                    return Err(InterfaceLoadError::DuplicateMember {
                        component: raw_comp.name,
                        member: raw_member.name,
                    });
                }
                let member = validate_member(&raw_comp.name, raw_member)?;
                members.push(member);
            }

            by_id.insert(id, raw_comp.name.clone());
            let component = Component {
                name: raw_comp.name.clone(),
                id,
                members,
            };
            if components.insert(raw_comp.name.clone(), component).is_some() {
                return Err(InterfaceLoadError::DuplicateName {
                    name: raw_comp.name,
                });
            }
        }
        Ok(Self { components })
    }

    pub fn get(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Components in name order.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

fn validate_member(component: &str, raw: RawMember) -> Result<Member, InterfaceLoadError> {
    let signature = match raw.kind {
        RawKind::Method => {
            if raw.ty.is_some() {
                return Err(InterfaceLoadError::MethodWithType {
                    component: component.to_string(),
                    member: raw.name,
                });
            }
            let args = raw.args.unwrap_or_default();
            if args.len() > MAX_MEMBER_ARGS {
                return Err(InterfaceLoadError::TooManyArgs {
                    component: component.to_string(),
                    member: raw.name,
                    found: args.len(),
                });
            }
            Signature::Method {
                args,
                returns: raw.returns,
            }
        }
        RawKind::Field => {
            if raw.args.is_some() {
                return Err(InterfaceLoadError::FieldWithArgs {
                    component: component.to_string(),
                    member: raw.name,
                });
            }
            if raw.returns.is_some() {
                return Err(InterfaceLoadError::FieldWithReturns {
                    component: component.to_string(),
                    member: raw.name,
                });
            }
            let Some(ty) = raw.ty else {
                return Err(InterfaceLoadError::FieldWithoutType {
                    component: component.to_string(),
                    member: raw.name,
                });
            };
            Signature::Field { ty }
        }
    };
    Ok(Member {
        name: raw.name,
        signature,
    })
}
