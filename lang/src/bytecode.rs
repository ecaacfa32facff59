use std::collections::HashMap;

use derive_more::derive::{From, Into};
use thiserror::Error;
use typed_index_collections::TiVec;

use crate::ast::Ty;

/// Magic bytes opening every compiled script artifact.
pub const ARTIFACT_MAGIC: [u8; 4] = *b"SBC1";

/// Format version stamped into artifact and index headers. Bump on any
/// change to the encoded layout.
pub const FORMAT_VERSION: u16 = 1;

/// Highest script id the toolchain will assign or accept.
///
/// The top bit stays clear so ids survive consumers that treat them as
/// signed 32-bit integers.
pub const MAX_SCRIPT_ID: u32 = 0x7fff_ffff;

macro_rules! opcodes {
    {
        $(($ident:ident, $byte:literal, $name:literal),)*
    } => {
        /// An instruction opcode, as encoded in artifact code sections.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $($ident = $byte,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[
                $(Opcode::$ident,)*
            ];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$ident => $name,)*
                }
            }

            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$ident),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    (Push, 0x01, "push"),
    (Load, 0x02, "load"),
    (Store, 0x03, "store"),

    (Add, 0x10, "add"),
    (Sub, 0x11, "sub"),
    (Mul, 0x12, "mul"),
    (Div, 0x13, "div"),
    (Neg, 0x14, "neg"),
    (Not, 0x18, "not"),

    (Eq, 0x20, "eq"),
    (Ne, 0x21, "ne"),
    (Lt, 0x22, "lt"),
    (Le, 0x23, "le"),
    (Gt, 0x24, "gt"),
    (Ge, 0x25, "ge"),

    (Jump, 0x30, "jump"),
    (JumpIf, 0x31, "jump_if"),

    (Invoke, 0x40, "invoke"),
    (GetField, 0x41, "get_field"),
    (SetField, 0x42, "set_field"),

    (Pop, 0x50, "pop"),
    (Ret, 0x51, "ret"),
}

/// A constant as stored in a script's constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn ty(&self) -> Ty {
        match self {
            Value::Int(_) => Ty::Int,
            Value::Str(_) => Ty::Str,
            Value::Bool(_) => Ty::Bool,
        }
    }
}

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolIndex(usize);

/// Constant pool with one entry per distinct value.
///
/// Interning order is emission order, so two compilations of the same
/// resolved script always produce the same pool.
#[derive(Debug, Default, Clone)]
pub struct ConstPool {
    values: TiVec<PoolIndex, Value>,
    lookup: HashMap<Value, PoolIndex>,
}

#[derive(Debug, Error)]
#[error("constant pool overflow ({} entries max)", ConstPool::CAPACITY)]
pub struct PoolOverflow;

impl ConstPool {
    /// Pool indexes are u16 operands, and so is the header's entry count.
    pub const CAPACITY: usize = u16::MAX as usize;

    pub fn intern(&mut self, value: Value) -> Result<PoolIndex, PoolOverflow> {
        if let Some(&idx) = self.lookup.get(&value) {
            return Ok(idx);
        }
        if self.values.len() == Self::CAPACITY {
            return Err(PoolOverflow);
        }
        let idx = self.values.push_and_get_key(value.clone());
        self.lookup.insert(value, idx);
        Ok(idx)
    }

    pub fn get(&self, idx: PoolIndex) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A fully compiled script, ready to be encoded into an artifact.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub id: u32,
    pub name: String,
    pub pool: ConstPool,
    pub code: Vec<u8>,
    /// Length in bytes of the source text this script was compiled from.
    pub source_len: usize,
}

impl CompiledScript {
    /// Fixed artifact header: magic, version, id, pool count, code length.
    pub const HEADER_LEN: usize = 16;

    pub fn artifact_file_name(&self) -> String {
        format!("{}.sbc", self.id)
    }

    /// Byte offset of the code section within the encoded artifact.
    pub fn code_offset(&self) -> usize {
        Self::HEADER_LEN + self.pool.iter().map(encoded_value_len).sum::<usize>()
    }

    /// Encodes the artifact: header, constant pool, then code, all
    /// little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code_offset() + self.code.len());
        out.extend_from_slice(&ARTIFACT_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.pool.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        for value in self.pool.iter() {
            encode_value(value, &mut out);
        }
        out.extend_from_slice(&self.code);
        out
    }
}

const TAG_INT: u8 = 0;
const TAG_STR: u8 = 1;
const TAG_BOOL: u8 = 2;

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
    }
}

fn encoded_value_len(value: &Value) -> usize {
    match value {
        Value::Int(_) => 1 + 8,
        Value::Str(s) => 1 + 4 + s.len(),
        Value::Bool(_) => 1 + 1,
    }
}

/// Decoded fields of an artifact header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub version: u16,
    pub id: u32,
    pub pool_count: u16,
    pub code_len: u32,
}

#[derive(Debug, Error)]
pub enum ArtifactDecodeError {
    #[error("artifact too short ({0} bytes)")]
    Truncated(usize),
    #[error("bad artifact magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u16),
}

impl ArtifactHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ArtifactDecodeError> {
        if bytes.len() < CompiledScript::HEADER_LEN {
            return Err(ArtifactDecodeError::Truncated(bytes.len()));
        }
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != ARTIFACT_MAGIC {
            return Err(ArtifactDecodeError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(ArtifactDecodeError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            id: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            pool_count: u16::from_le_bytes([bytes[10], bytes[11]]),
            code_len: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}
