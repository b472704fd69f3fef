//! Block and transaction model, built from block files or JSON-RPC responses.

pub mod blockfiles;
pub mod error;
pub mod model;
pub mod rpc;
pub mod stream;

pub use blockfiles::{is_block_file, list_block_files};
pub use error::ParseError;
pub use model::{Block, BlockHeader, ChainId, DatPosition, Transaction, Vin, Vout};
pub use rpc::{RpcBlock, RpcTransaction};
pub use stream::{parse_block_from_stream, parse_transaction};
