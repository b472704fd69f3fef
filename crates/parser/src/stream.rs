//! Block-file parsing.
//!
//! Each record is `magic (4) || size (u32 le) || header (80) || varint tx count || txs`.
//! Hashes are kept in wire order and displayed reversed, except the merkle
//! root, which is kept and displayed in the order it was read.

use exploder_consensus::ChainParams;
use exploder_primitives::block::BlockHeader as RawHeader;
use exploder_primitives::encoding::{DecodeError, Decoder};
use exploder_primitives::transaction::Transaction as RawTransaction;

use crate::error::ParseError;
use crate::model::{Block, BlockHeader, DatPosition, Transaction};

const MAGIC_LEN: usize = 4;

/// Parses the block at the decoder's position. On success the decoder sits
/// just past the last transaction.
pub fn parse_block_from_stream(
    decoder: &mut Decoder,
    file_index: u32,
    params: &ChainParams,
) -> Result<Block, ParseError> {
    if decoder.is_empty() {
        return Err(ParseError::EndOfData);
    }
    let start = decoder.position();
    let magic: [u8; MAGIC_LEN] = decoder.read_fixed().map_err(truncated)?;
    if magic == [0u8; MAGIC_LEN] {
        return Err(ParseError::EndOfData);
    }
    parse_block_body(decoder, file_index, start, params).map_err(|err| match err {
        ParseError::Decode(DecodeError::TruncatedInput) => ParseError::TruncatedBlock,
        other => other,
    })
}

fn parse_block_body(
    decoder: &mut Decoder,
    file_index: u32,
    start: usize,
    params: &ChainParams,
) -> Result<Block, ParseError> {
    let size = decoder.read_u32_le()?;
    let (raw_header, hash) = RawHeader::decode_with_hash(decoder)?;
    let header = BlockHeader::with_hash(hash, &raw_header, params)?;

    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    if count > decoder.remaining() {
        return Err(DecodeError::TruncatedInput.into());
    }
    let mut transactions = Vec::with_capacity(count);
    for idx in 0..count {
        transactions.push(parse_transaction(decoder, idx == 0, params)?);
    }

    let dat = DatPosition {
        index: file_index,
        start: start as u64,
        end: decoder.position() as u64,
    };
    Block::from_header(header, transactions, size, Some(dat))
}

/// Parses one transaction; the txid is the double SHA-256 of exactly the bytes
/// consumed.
pub fn parse_transaction(
    decoder: &mut Decoder,
    is_coinbase: bool,
    params: &ChainParams,
) -> Result<Transaction, ParseError> {
    let (raw, txid) = RawTransaction::decode_with_txid(decoder)?;
    Transaction::from_raw(&raw, txid, is_coinbase, params)
}

fn truncated(_: DecodeError) -> ParseError {
    ParseError::TruncatedBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use exploder_consensus::{chain_params, Network};
    use exploder_primitives::hex::{hash256_to_hex, hex_to_bytes};

    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

    fn record(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0xfb, 0xc0, 0xb6, 0xdb];
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn zero_magic_ends_the_file() {
        let params = chain_params(Network::Mainnet);
        let bytes = [0u8; 16];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            parse_block_from_stream(&mut decoder, 0, &params),
            Err(ParseError::EndOfData)
        );
        let mut empty = Decoder::new(&[]);
        assert_eq!(
            parse_block_from_stream(&mut empty, 0, &params),
            Err(ParseError::EndOfData)
        );
    }

    #[test]
    fn header_without_transactions() {
        let params = chain_params(Network::Mainnet);
        let mut body = hex_to_bytes(GENESIS_HEADER).unwrap();
        body.push(0x00);
        let bytes = record(&body);
        let mut decoder = Decoder::new(&bytes);
        let block = parse_block_from_stream(&mut decoder, 3, &params).unwrap();
        assert_eq!(
            hash256_to_hex(&block.hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(block.header.previousblockhash(), None);
        assert_eq!(block.size, 81);
        assert_eq!(
            block.dat,
            Some(DatPosition {
                index: 3,
                start: 0,
                end: bytes.len() as u64
            })
        );
        assert_eq!(block.total, 0);
    }

    #[test]
    fn cut_inside_header_is_truncated_block() {
        let params = chain_params(Network::Mainnet);
        let body = hex_to_bytes(GENESIS_HEADER).unwrap();
        let bytes = record(&body);
        for cut in [6, 8, 40, bytes.len()] {
            let mut decoder = Decoder::new(&bytes[..cut]);
            assert_eq!(
                parse_block_from_stream(&mut decoder, 0, &params),
                Err(ParseError::TruncatedBlock),
                "cut at {cut}"
            );
        }
    }
}
