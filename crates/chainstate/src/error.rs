use exploder_consensus::Hash256;
use exploder_primitives::address::AddressError;
use exploder_primitives::encoding::DecodeError;
use exploder_primitives::hex::hash256_to_hex;
use exploder_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    /// Parent of the block is not known.
    OrphanBlock(Hash256),
    DuplicateBlock(Hash256),
    /// Chain switch aborted; unflushed state was discarded.
    ReconvergeFailed(String),
    MissingBlock(Hash256),
    CorruptRecord(String),
    InvalidAddress(AddressError),
    Store(StoreError),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::OrphanBlock(parent) => {
                write!(f, "parent block {} is unknown", hash256_to_hex(parent))
            }
            ChainError::DuplicateBlock(hash) => {
                write!(f, "block {} already indexed", hash256_to_hex(hash))
            }
            ChainError::ReconvergeFailed(message) => write!(f, "reconverge failed: {message}"),
            ChainError::MissingBlock(hash) => {
                write!(f, "block {} missing from index", hash256_to_hex(hash))
            }
            ChainError::CorruptRecord(message) => write!(f, "corrupt record: {message}"),
            ChainError::InvalidAddress(err) => write!(f, "{err}"),
            ChainError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<AddressError> for ChainError {
    fn from(err: AddressError) -> Self {
        ChainError::InvalidAddress(err)
    }
}

pub(crate) fn corrupt(what: &'static str) -> impl Fn(DecodeError) -> ChainError {
    move |err| ChainError::CorruptRecord(format!("{what}: {err}"))
}
