//! Standard output script classification.

use exploder_consensus::ChainParams;
use exploder_primitives::address::encode_address;
use exploder_primitives::hash::hash160;
use exploder_primitives::hex::bytes_to_hex;

use crate::opcodes::{
    opcode_name, OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160, OP_PUSHDATA1, OP_PUSHDATA2,
    OP_PUSHDATA4, OP_RETURN,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptKind {
    PubKeyHash,
    PubKey,
    ScriptHash,
    NullData,
}

impl ScriptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PubKeyHash => "pubkeyhash",
            Self::PubKey => "pubkey",
            Self::ScriptHash => "scripthash",
            Self::NullData => "nulldata",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptInfo {
    pub kind: ScriptKind,
    pub asm: String,
    pub addresses: Vec<String>,
    pub req_sigs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Hex of the script that matched no known template.
    UnrecognizedScript(String),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::UnrecognizedScript(hex) => write!(f, "unrecognized output script {hex}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Classifies an output script by its leading and trailing opcodes and derives
/// the paying address. Scripts matching none of the templates are an error.
pub fn parse_script(script: &[u8], params: &ChainParams) -> Result<ScriptInfo, ScriptError> {
    let unrecognized = || ScriptError::UnrecognizedScript(bytes_to_hex(script));
    let asm = disassemble(script);

    if script.starts_with(&[OP_DUP, OP_HASH160]) {
        if script.len() < 5 || !script.ends_with(&[OP_EQUALVERIFY, OP_CHECKSIG]) {
            return Err(unrecognized());
        }
        let payload = &script[3..script.len() - 2];
        return Ok(ScriptInfo {
            kind: ScriptKind::PubKeyHash,
            asm,
            addresses: vec![encode_address(params.pubkey_hash_version, payload)],
            req_sigs: 1,
        });
    }

    // Any other OP_CHECKSIG suffix is a bare key, even behind OP_RETURN.
    if script.len() > 2 && script.last() == Some(&OP_CHECKSIG) {
        let key = &script[1..script.len() - 1];
        return Ok(ScriptInfo {
            kind: ScriptKind::PubKey,
            asm,
            addresses: vec![encode_address(params.pubkey_hash_version, &hash160(key))],
            req_sigs: 1,
        });
    }

    if let Some((&OP_RETURN, payload)) = script.split_first() {
        let asm = if payload.is_empty() {
            "OP_RETURN".to_string()
        } else {
            format!("OP_RETURN {}", bytes_to_hex(payload))
        };
        return Ok(ScriptInfo {
            kind: ScriptKind::NullData,
            asm,
            addresses: Vec::new(),
            req_sigs: 0,
        });
    }

    if script.first() == Some(&OP_HASH160) {
        if script.len() < 22 {
            return Err(unrecognized());
        }
        return Ok(ScriptInfo {
            kind: ScriptKind::ScriptHash,
            asm,
            addresses: vec![encode_address(params.script_hash_version, &script[2..22])],
            req_sigs: 1,
        });
    }

    Err(unrecognized())
}

/// Renders `script` with opcode names and pushed data as plain hex.
pub fn disassemble(script: &[u8]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let push_len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => read_len(script, &mut cursor, 1),
            OP_PUSHDATA2 => read_len(script, &mut cursor, 2),
            OP_PUSHDATA4 => read_len(script, &mut cursor, 4),
            _ => None,
        };
        let is_push = (0x01..=OP_PUSHDATA4).contains(&opcode);
        if is_push {
            match push_len {
                Some(len) if cursor + len <= script.len() => {
                    parts.push(bytes_to_hex(&script[cursor..cursor + len]));
                    cursor += len;
                }
                _ => {
                    parts.push("[error]".to_string());
                    break;
                }
            }
            continue;
        }
        parts.push(opcode_name(opcode).unwrap_or("OP_UNKNOWN").to_string());
    }
    parts.join(" ")
}

fn read_len(script: &[u8], cursor: &mut usize, width: usize) -> Option<usize> {
    let bytes = script.get(*cursor..*cursor + width)?;
    *cursor += width;
    let mut value = 0usize;
    for (shift, byte) in bytes.iter().enumerate() {
        value |= (*byte as usize) << (8 * shift);
    }
    Some(value)
}
