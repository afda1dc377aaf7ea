//! Minimal Solidity ABI codec for the lending-pool contract
//!
//! Only the static layouts the contract actually emits are supported:
//! `uint256`, `bool`, `address`, `bytes32` and dynamic arrays of static
//! tuples. Token amounts are scaled to [`Decimal`] at decode time.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use super::{
    ChainEvent, EventKind, EventMeta, EventPayload, OnChainContribution, OnChainInstallment,
    OnChainLoan,
};
use crate::error::{ReconcileError, ReconcileResult};
use crate::finance::{BTC_DP, USDC_DP};

pub type Word = [u8; 32];

/// Chainlink-style price feeds report 8 decimals
pub const PRICE_DECIMALS: u32 = 8;

// keccak256 of the canonical signatures
pub const DEPOSIT_TOPIC: &str =
    "0x693c1828300d1cab0919b948d714897f817e305af51c026ad14233b6a8939adb";
pub const LOAN_CREATED_TOPIC: &str =
    "0x65410888fb30edd04f6acfb2f6cfd92aaf0ebb9b5303b6286d65d0b031b5b7f7";
pub const INSTALLMENT_PAID_TOPIC: &str =
    "0x3d05ac2057427ac2f84502e7efefebf5ae10d9529129c2979ce60fb97d460614";
pub const PAYOUT_TOPIC: &str =
    "0xdc376abd09229a842ac7d8bcadc9017651f1f1b8490750870cae0ecd4aedf674";
pub const LOAN_LIQUIDATED_TOPIC: &str =
    "0xcab88a55906c5830a49dddd8b31d115294a5e6c4210f25fe140530a39c51dc74";

/// `loans(bytes32)`
pub const LOANS_SELECTOR: [u8; 4] = [0xc4, 0xa9, 0x08, 0x15];
/// `getInstallmentSchedule(bytes32)`
pub const INSTALLMENT_SCHEDULE_SELECTOR: [u8; 4] = [0x6c, 0x19, 0x45, 0xae];
/// `getContributions(bytes32)`
pub const CONTRIBUTIONS_SELECTOR: [u8; 4] = [0x86, 0xa2, 0xe2, 0x74];
/// `getPrice()`
pub const GET_PRICE_SELECTOR: [u8; 4] = [0x98, 0xd5, 0xfd, 0xca];

const LOAN_WORDS: usize = 11;
const INSTALLMENT_WIDTH: usize = 4;
const CONTRIBUTION_WIDTH: usize = 5;

pub fn decode_hex(input: &str) -> ReconcileResult<Vec<u8>> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(stripped)
        .map_err(|e| ReconcileError::Decode(format!("invalid hex '{}': {}", input, e)))
}

/// Parses a JSON-RPC quantity (`0x1b4`)
pub fn parse_quantity(input: &str) -> ReconcileResult<u64> {
    let digits = input
        .strip_prefix("0x")
        .ok_or_else(|| ReconcileError::Decode(format!("quantity '{}' lacks 0x prefix", input)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| ReconcileError::Decode(format!("invalid quantity '{}': {}", input, e)))
}

pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

pub fn words(data: &[u8]) -> ReconcileResult<Vec<Word>> {
    if data.len() % 32 != 0 {
        return Err(ReconcileError::Decode(format!(
            "ABI data length {} is not a multiple of 32",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn word_from_hex(input: &str) -> ReconcileResult<Word> {
    let bytes = decode_hex(input)?;
    if bytes.len() != 32 {
        return Err(ReconcileError::Decode(format!(
            "expected a 32-byte word, got {} bytes",
            bytes.len()
        )));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&bytes);
    Ok(word)
}

pub fn as_u128(word: &Word) -> ReconcileResult<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ReconcileError::Arithmetic(
            "uint256 value does not fit in 128 bits".to_string(),
        ));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

pub fn as_u64(word: &Word) -> ReconcileResult<u64> {
    let value = as_u128(word)?;
    u64::try_from(value)
        .map_err(|_| ReconcileError::Arithmetic(format!("{} does not fit in u64", value)))
}

pub fn as_bool(word: &Word) -> ReconcileResult<bool> {
    match as_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ReconcileError::Decode(format!("invalid bool word {}", other))),
    }
}

/// Lowercase `0x` address from a left-padded word
pub fn as_address(word: &Word) -> ReconcileResult<String> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(ReconcileError::Decode(
            "address word has non-zero padding".to_string(),
        ));
    }
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

pub fn as_bytes32(word: &Word) -> String {
    format!("0x{}", hex::encode(word))
}

pub fn as_timestamp(word: &Word) -> ReconcileResult<DateTime<Utc>> {
    let secs = as_u64(word)?;
    let secs = i64::try_from(secs)
        .map_err(|_| ReconcileError::Arithmetic(format!("timestamp {} out of range", secs)))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ReconcileError::Decode(format!("invalid timestamp {}", secs)))
}

/// Scales integer base units into a decimal token amount
pub fn units_to_decimal(raw: u128, decimals: u32) -> ReconcileResult<Decimal> {
    let signed = i128::try_from(raw)
        .map_err(|_| ReconcileError::Arithmetic(format!("{} exceeds i128", raw)))?;
    Decimal::try_from_i128_with_scale(signed, decimals)
        .map(|d| d.normalize())
        .map_err(|e| ReconcileError::Arithmetic(format!("{} base units: {}", raw, e)))
}

pub fn as_units(word: &Word, decimals: u32) -> ReconcileResult<Decimal> {
    units_to_decimal(as_u128(word)?, decimals)
}

/// `0x` + selector + args, ready for `eth_call`
pub fn encode_call(selector: [u8; 4], args: &[Word]) -> String {
    let mut out = String::with_capacity(10 + args.len() * 64);
    out.push_str("0x");
    out.push_str(&hex::encode(selector));
    for arg in args {
        out.push_str(&hex::encode(arg));
    }
    out
}

/// Decodes a single returned `T[]` where `T` is a static tuple of
/// `tuple_width` words.
pub fn decode_tuple_array(data: &[u8], tuple_width: usize) -> ReconcileResult<Vec<Vec<Word>>> {
    let ws = words(data)?;
    let head = ws
        .first()
        .ok_or_else(|| ReconcileError::Decode("empty array return data".to_string()))?;

    let offset = as_u64(head)? as usize;
    if offset % 32 != 0 {
        return Err(ReconcileError::Decode(format!(
            "unaligned array offset {}",
            offset
        )));
    }
    let start = offset / 32;
    let len_word = ws
        .get(start)
        .ok_or_else(|| ReconcileError::Decode("array offset past end of data".to_string()))?;
    let len = as_u64(len_word)? as usize;
    let needed = len.checked_mul(tuple_width).ok_or_else(|| {
        ReconcileError::Decode(format!("array length {} overflows", len))
    })?;

    let body = &ws[start + 1..];
    if body.len() < needed {
        return Err(ReconcileError::Decode(format!(
            "array claims {} entries but data holds {} words",
            len,
            body.len()
        )));
    }

    Ok(body
        .chunks_exact(tuple_width)
        .take(len)
        .map(|chunk| chunk.to_vec())
        .collect())
}

fn topic_word(topics: &[String], index: usize, kind: EventKind) -> ReconcileResult<Word> {
    let raw = topics.get(index).ok_or_else(|| {
        ReconcileError::Decode(format!("{} log is missing topic {}", kind.name(), index))
    })?;
    word_from_hex(raw)
}

fn data_word(data: &[Word], index: usize, kind: EventKind) -> ReconcileResult<&Word> {
    data.get(index).ok_or_else(|| {
        ReconcileError::Decode(format!("{} log is missing data word {}", kind.name(), index))
    })
}

/// Decodes one raw log. Indexed params come from topics in declaration
/// order, the rest from data words.
pub fn decode_log(
    kind: EventKind,
    topics: &[String],
    data: &str,
    meta: EventMeta,
) -> ReconcileResult<ChainEvent> {
    let topic0 = topics
        .first()
        .ok_or_else(|| ReconcileError::Decode("log without topics".to_string()))?;
    if !topic0.eq_ignore_ascii_case(kind.topic()) {
        return Err(ReconcileError::Decode(format!(
            "topic {} is not a {} event",
            topic0,
            kind.name()
        )));
    }

    let data = words(&decode_hex(data)?)?;

    let payload = match kind {
        EventKind::Deposit => EventPayload::Deposit {
            lender: as_address(&topic_word(topics, 1, kind)?)?,
            amount: as_units(data_word(&data, 0, kind)?, USDC_DP)?,
            reinvest: as_bool(data_word(&data, 1, kind)?)?,
        },
        EventKind::LoanCreated => EventPayload::LoanCreated {
            loan_id: as_bytes32(&topic_word(topics, 1, kind)?),
            borrower: as_address(&topic_word(topics, 2, kind)?)?,
            amount: as_units(data_word(&data, 0, kind)?, USDC_DP)?,
            collateral: as_units(data_word(&data, 1, kind)?, BTC_DP)?,
        },
        EventKind::InstallmentPaid => EventPayload::InstallmentPaid {
            loan_id: as_bytes32(&topic_word(topics, 1, kind)?),
            index: as_u64(data_word(&data, 0, kind)?)?,
        },
        EventKind::Payout => EventPayload::Payout {
            loan_id: as_bytes32(&topic_word(topics, 1, kind)?),
            borrower: as_address(&topic_word(topics, 2, kind)?)?,
            amount: as_units(data_word(&data, 0, kind)?, USDC_DP)?,
            fully_repaid: as_bool(data_word(&data, 1, kind)?)?,
        },
        EventKind::LoanLiquidated => EventPayload::LoanLiquidated {
            loan_id: as_bytes32(&topic_word(topics, 1, kind)?),
            borrower: as_address(&topic_word(topics, 2, kind)?)?,
            btc_price: as_units(data_word(&data, 0, kind)?, PRICE_DECIMALS)?,
        },
    };

    Ok(ChainEvent { meta, payload })
}

pub fn decode_loan(data: &[u8]) -> ReconcileResult<OnChainLoan> {
    let w = words(data)?;
    if w.len() < LOAN_WORDS {
        return Err(ReconcileError::Decode(format!(
            "loans() returned {} words, expected {}",
            w.len(),
            LOAN_WORDS
        )));
    }

    let duration = as_u64(&w[5])?;
    Ok(OnChainLoan {
        borrower: as_address(&w[0])?,
        principal: as_units(&w[1], USDC_DP)?,
        borrower_deposit: as_units(&w[2], USDC_DP)?,
        collateral: as_units(&w[3], BTC_DP)?,
        interest_rate: as_units(&w[4], 0)?,
        duration: u32::try_from(duration)
            .map_err(|_| ReconcileError::Arithmetic(format!("duration {} too large", duration)))?,
        monthly_payment: as_units(&w[6], USDC_DP)?,
        start_time: as_timestamp(&w[7])?,
        btc_price_at_creation: as_units(&w[8], PRICE_DECIMALS)?,
        is_active: as_bool(&w[9])?,
        fully_repaid: as_bool(&w[10])?,
    })
}

pub fn decode_installments(data: &[u8]) -> ReconcileResult<Vec<OnChainInstallment>> {
    decode_tuple_array(data, INSTALLMENT_WIDTH)?
        .iter()
        .map(|t| {
            let due = as_u64(&t[2])?;
            Ok(OnChainInstallment {
                due_principal: as_units(&t[0], USDC_DP)?,
                due_interest: as_units(&t[1], USDC_DP)?,
                due_timestamp: if due == 0 { None } else { Some(as_timestamp(&t[2])?) },
                paid: as_bool(&t[3])?,
            })
        })
        .collect()
}

pub fn decode_contributions(data: &[u8]) -> ReconcileResult<Vec<OnChainContribution>> {
    decode_tuple_array(data, CONTRIBUTION_WIDTH)?
        .iter()
        .map(|t| {
            Ok(OnChainContribution {
                lender: as_address(&t[0])?,
                amount: as_units(&t[1], USDC_DP)?,
                receivable_interest: as_units(&t[2], USDC_DP)?,
                repaid_principal: as_units(&t[3], USDC_DP)?,
                repaid_interest: as_units(&t[4], USDC_DP)?,
            })
        })
        .collect()
}

pub fn decode_price(data: &[u8]) -> ReconcileResult<Decimal> {
    let w = words(data)?;
    let word = w
        .first()
        .ok_or_else(|| ReconcileError::Decode("getPrice() returned no data".to_string()))?;
    as_units(word, PRICE_DECIMALS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const LENDER: &str = "0x920d7263014303530e92ee98e4eb4599a0a8af0e";

    fn uint(value: u128) -> Word {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        word
    }

    fn address(addr: &str) -> Word {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&decode_hex(addr).unwrap());
        word
    }

    fn hex_words(ws: &[Word]) -> String {
        format!("0x{}", ws.iter().map(hex::encode).collect::<String>())
    }

    fn meta() -> EventMeta {
        EventMeta {
            tx_hash: "0xabc".to_string(),
            log_index: 3,
            block_number: 120,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_units_to_decimal() {
        assert_eq!(units_to_decimal(150_000_000, 8).unwrap(), dec!(1.5));
        assert_eq!(units_to_decimal(1_000_000, 6).unwrap(), dec!(1));
        assert_eq!(units_to_decimal(0, 6).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_oversized_word_rejected() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(matches!(as_u128(&word), Err(ReconcileError::Arithmetic(_))));
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert_eq!(to_quantity(436), "0x1b4");
        assert!(parse_quantity("1b4").is_err());
    }

    #[test]
    fn test_encode_call() {
        let call = encode_call(LOANS_SELECTOR, &[uint(1)]);
        assert!(call.starts_with("0xc4a90815"));
        assert_eq!(call.len(), 2 + 8 + 64);
        assert!(call.ends_with("01"));
    }

    #[test]
    fn test_decode_deposit_log() {
        let topics = vec![DEPOSIT_TOPIC.to_string(), as_bytes32(&address(LENDER))];
        let data = hex_words(&[uint(1_500_000_000), uint(1)]);

        let event = decode_log(EventKind::Deposit, &topics, &data, meta()).unwrap();
        assert_eq!(event.kind(), EventKind::Deposit);
        assert_eq!(
            event.payload,
            EventPayload::Deposit {
                lender: LENDER.to_string(),
                amount: dec!(1500),
                reinvest: true,
            }
        );
        assert_eq!(event.meta.event_key(), "0xabc:3");
    }

    #[test]
    fn test_decode_log_rejects_wrong_topic() {
        let topics = vec![PAYOUT_TOPIC.to_string(), as_bytes32(&address(LENDER))];
        let data = hex_words(&[uint(1), uint(0)]);
        assert!(decode_log(EventKind::Deposit, &topics, &data, meta()).is_err());
    }

    #[test]
    fn test_decode_contributions_array() {
        let data = [
            uint(32),
            uint(2),
            address(LENDER),
            uint(30_000_000_000),
            uint(3_000_000_000),
            uint(0),
            uint(0),
            address("0x00000000000000000000000000000000000000b2"),
            uint(20_000_000_000),
            uint(2_000_000_000),
            uint(1_000_000_000),
            uint(100_000_000),
        ]
        .concat();

        let contributions = decode_contributions(&data).unwrap();
        assert_eq!(contributions.len(), 2);
        assert_eq!(contributions[0].lender, LENDER);
        assert_eq!(contributions[0].amount, dec!(30000));
        assert_eq!(contributions[1].repaid_principal, dec!(1000));
        assert_eq!(contributions[1].repaid_interest, dec!(100));
    }

    #[test]
    fn test_truncated_array_rejected() {
        let data = [uint(32), uint(3), uint(1), uint(2)].concat();
        assert!(decode_tuple_array(&data, INSTALLMENT_WIDTH).is_err());
    }

    #[test]
    fn test_oversized_array_length_rejected() {
        let data = [uint(32), uint(u128::from(u64::MAX)), uint(1)].concat();
        let err = decode_tuple_array(&data, INSTALLMENT_WIDTH).unwrap_err();
        assert!(matches!(err, ReconcileError::Decode(_)));
    }

    #[test]
    fn test_decode_price() {
        let data = uint(9_812_345_000_000).to_vec();
        assert_eq!(decode_price(&data).unwrap(), dec!(98123.45));
    }
}
