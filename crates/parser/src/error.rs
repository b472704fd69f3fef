use exploder_consensus::AmountError;
use exploder_pow::difficulty::CompactError;
use exploder_primitives::encoding::DecodeError;
use exploder_primitives::hex::HexError;
use exploder_script::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// The buffer ended inside a block.
    TruncatedBlock,
    /// Zero magic or an exhausted buffer: no further blocks in this file.
    EndOfData,
    Script(ScriptError),
    Decode(DecodeError),
    Amount(AmountError),
    InvalidField(String),
}

impl ParseError {
    pub(crate) fn field(name: &str, err: impl std::fmt::Display) -> Self {
        ParseError::InvalidField(format!("{name}: {err}"))
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::TruncatedBlock => write!(f, "block data ends before the block does"),
            ParseError::EndOfData => write!(f, "no more blocks"),
            ParseError::Script(err) => write!(f, "{err}"),
            ParseError::Decode(err) => write!(f, "{err}"),
            ParseError::Amount(err) => write!(f, "{err}"),
            ParseError::InvalidField(message) => write!(f, "invalid field {message}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ScriptError> for ParseError {
    fn from(err: ScriptError) -> Self {
        ParseError::Script(err)
    }
}

impl From<DecodeError> for ParseError {
    fn from(err: DecodeError) -> Self {
        ParseError::Decode(err)
    }
}

impl From<AmountError> for ParseError {
    fn from(err: AmountError) -> Self {
        ParseError::Amount(err)
    }
}

impl From<CompactError> for ParseError {
    fn from(err: CompactError) -> Self {
        ParseError::field("bits", err)
    }
}

impl From<HexError> for ParseError {
    fn from(err: HexError) -> Self {
        ParseError::field("hex", err)
    }
}
