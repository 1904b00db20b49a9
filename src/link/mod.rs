use log::{debug, warn};
use thiserror::Error;

use crate::utils::crc16_en13757;

pub mod threeof6;

pub const MODE_C_PREAMBLE: u8 = 0x54;
pub const BLOCK_A_PREAMBLE: u8 = 0xCD;
pub const BLOCK_B_PREAMBLE: u8 = 0x3D;
const MODE_C_PREFIX_LEN: usize = 2;

const BLOCK1A_SIZE: usize = 12; // Block 1 of format A, including its CRC
const BLOCK1B_SIZE: usize = 10;
const BLOCK2B_SIZE: usize = 118; // Maximum size of block 2, format B

/// Custom error types for the link layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("buffer too short for a frame")]
    TooShort,
    #[error("CRC mismatch in block {block}")]
    BadCrc { block: usize },
    #[error("illegal 3-of-6 codeword {codeword:#04x}")]
    Bad3of6 { codeword: u8 },
    #[error("unknown mode C block preamble {0:#04x}")]
    UnknownPreamble(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    T1,
    C1,
    S1,
    S1m,
    S2,
    T2,
    C2,
    MBus,
}

impl LinkMode {
    pub fn name(&self) -> &'static str {
        match self {
            LinkMode::T1 => "T1",
            LinkMode::C1 => "C1",
            LinkMode::S1 => "S1",
            LinkMode::S1m => "S1m",
            LinkMode::S2 => "S2",
            LinkMode::T2 => "T2",
            LinkMode::C2 => "C2",
            LinkMode::MBus => "MBUS",
        }
    }

    fn bit(&self) -> u16 {
        match self {
            LinkMode::MBus => 1 << 1,
            LinkMode::S1 => 1 << 2,
            LinkMode::S1m => 1 << 3,
            LinkMode::S2 => 1 << 4,
            LinkMode::T1 => 1 << 5,
            LinkMode::T2 => 1 << 6,
            LinkMode::C1 => 1 << 7,
            LinkMode::C2 => 1 << 8,
        }
    }
}

/// Bitset over link modes. `Any` is the all-ones set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkModeSet(u16);

impl LinkModeSet {
    pub fn none() -> Self {
        LinkModeSet(0)
    }

    pub fn any() -> Self {
        LinkModeSet(!0)
    }

    pub fn with(mut self, lm: LinkMode) -> Self {
        self.0 |= lm.bit();
        self
    }

    pub fn add(&mut self, lm: LinkMode) {
        self.0 |= lm.bit();
    }

    pub fn contains(&self, lm: LinkMode) -> bool {
        self.0 & lm.bit() != 0
    }

    pub fn supports(&self, other: LinkModeSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn has_all(&self, other: LinkModeSet) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    A,
    B,
}

/// A link-layer validated frame: CRCs stripped, byte 0 is len-1.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub link_mode: LinkMode,
    pub rssi_dbm: i8,
    pub format: FrameFormat,
}

impl Frame {
    pub fn as_hex(&self) -> String {
        crate::utils::bin2hex(&self.data)
    }

    /* rtl-wmbus compatible line, handy when feeding other tooling. */
    pub fn as_rtlwmbus(&self, timestamp: chrono::DateTime<chrono::Utc>) -> String {
        format!(
            "{};1;1;{};{};;;0x{}",
            self.link_mode.name(),
            timestamp.format("%Y-%m-%d %H:%M:%S.00Z"),
            self.rssi_dbm,
            self.as_hex().to_lowercase()
        )
    }
}

/* Number of on-wire bytes of a format A frame with length field l,
   before line coding: all blocks plus their CRC pairs. */
fn format_a_wire_bytes(l: u8) -> usize {
    let l = l as usize;
    let nr_blocks = if l < 26 { 2 } else { (l - 26) / 16 + 3 };
    l + 1 + 2 * nr_blocks
}

/// How many bytes the radio must collect for one candidate frame, derived
/// from the first three received bytes. None until enough bytes arrived or
/// when the length byte cannot be decoded.
pub fn expected_wire_size(head: &[u8]) -> Option<(usize, LinkMode)> {
    if head.len() < 3 {
        return None;
    }
    if head[0] == MODE_C_PREAMBLE {
        let l = head[2];
        return match head[1] {
            BLOCK_A_PREAMBLE => Some((MODE_C_PREFIX_LEN + format_a_wire_bytes(l), LinkMode::C1)),
            BLOCK_B_PREAMBLE => Some((MODE_C_PREFIX_LEN + 1 + l as usize, LinkMode::C1)),
            _ => None,
        };
    }
    /* Mode T: the first three encoded bytes hold the length byte. */
    let mut head3 = [head[0], head[1], head[2]];
    match threeof6::decode(&mut head3, 2) {
        Ok(_) => Some((threeof6::encoded_size(format_a_wire_bytes(head3[0])), LinkMode::T1)),
        Err(_) => None,
    }
}

/// Turn a raw radio buffer into a canonical frame. The buffer holds one
/// candidate frame, mode C frames still carry their two preamble bytes.
pub fn decode(mut data: Vec<u8>, rssi_dbm: i8) -> Result<Frame, LinkError> {
    if data.len() < 3 {
        return Err(LinkError::TooShort);
    }
    if data[0] == MODE_C_PREAMBLE {
        let format = match data[1] {
            BLOCK_A_PREAMBLE => FrameFormat::A,
            BLOCK_B_PREAMBLE => FrameFormat::B,
            other => return Err(LinkError::UnknownPreamble(other)),
        };
        data.drain(..MODE_C_PREFIX_LEN);
        debug!("received C1 {:?} frame ({} bytes with CRC)", format, data.len());
        let frame = match format {
            FrameFormat::A => trim_crcs_format_a(&data)?,
            FrameFormat::B => trim_crcs_format_b(&data)?,
        };
        return Ok(Frame { data: frame, link_mode: LinkMode::C1, rssi_dbm, format });
    }

    /* Mode T is 3-of-6 coded and always format A. */
    let mut head3 = [data[0], data[1], data[2]];
    threeof6::decode(&mut head3, 2)?;
    let plain_len = format_a_wire_bytes(head3[0]);
    let n = threeof6::decode(&mut data, plain_len)?;
    data.truncate(n);
    debug!("received T1 A frame ({} bytes with CRC)", data.len());
    let frame = trim_crcs_format_a(&data)?;
    Ok(Frame { data: frame, link_mode: LinkMode::T1, rssi_dbm, format: FrameFormat::A })
}

fn check_block_crc(block: &[u8], crc_hi: u8, crc_lo: u8, block_index: usize) -> Result<(), LinkError> {
    let calc = crc16_en13757(block);
    let read = ((crc_hi as u16) << 8) | crc_lo as u16;
    if calc != read {
        warn!(
            "CRC mismatch in block {}: calculated {:04X}, read {:04X}",
            block_index, calc, read
        );
        return Err(LinkError::BadCrc { block: block_index });
    }
    Ok(())
}

/*
  Format A. L counts neither the CRC fields nor L itself.

  Block 1: L C M(2) A(6) | CRC(2)
  Block 2: CI data, 16 bytes or the remainder | CRC(2)
  Block n: 16 bytes or the remainder | CRC(2)
*/
fn trim_crcs_format_a(data: &[u8]) -> Result<Vec<u8>, LinkError> {
    if data.len() < BLOCK1A_SIZE {
        return Err(LinkError::TooShort);
    }
    let l = data[0] as usize;
    if l < 9 {
        return Err(LinkError::TooShort);
    }
    let num_data_blocks = (l - 9 + 15) / 16;
    if l - 9 + num_data_blocks * 2 > data.len() - BLOCK1A_SIZE {
        return Err(LinkError::TooShort);
    }

    check_block_crc(&data[..BLOCK1A_SIZE - 2], data[BLOCK1A_SIZE - 2], data[BLOCK1A_SIZE - 1], 1)?;
    let mut frame = data[..BLOCK1A_SIZE - 2].to_vec();

    for n in 0..num_data_blocks {
        let start = BLOCK1A_SIZE + n * 18;
        let block_size = std::cmp::min(l - 9 - n * 16, 16);
        let block = &data[start..start + block_size];
        check_block_crc(block, data[start + block_size], data[start + block_size + 1], n + 2)?;
        frame.extend_from_slice(block);
    }

    Ok(frame)
}

/*
  Format B. L counts the CRC fields but not L itself. One CRC after at most
  126 payload bytes, a second one at the end of long telegrams.
*/
fn trim_crcs_format_b(data: &[u8]) -> Result<Vec<u8>, LinkError> {
    let l = data[0] as usize;
    if l < 12 || l + 1 > data.len() {
        return Err(LinkError::TooShort);
    }

    let block_size = std::cmp::min(l - 1, BLOCK1B_SIZE + BLOCK2B_SIZE - 2);
    check_block_crc(&data[..block_size], data[block_size], data[block_size + 1], 1)?;
    let mut frame = data[..block_size].to_vec();
    frame[0] -= 2;

    let block3_offset = BLOCK1B_SIZE + BLOCK2B_SIZE;
    if l > block3_offset + 2 {
        let block_size = l - block3_offset - 1;
        let block = &data[block3_offset..block3_offset + block_size];
        let end = block3_offset + block_size;
        check_block_crc(block, data[end], data[end + 1], 2)?;
        frame.extend_from_slice(block);
        frame[0] -= 2;
    }

    Ok(frame)
}

#[cfg(test)]
mod link_tests {
    use super::*;

    /* OMS Annex N.2.1, wM-Bus meter with security profile A, CRCs included. */
    pub const ANNEX_N_WITH_CRC: &str = "2E44931578563412330333637A2A0020255923C95AAA26D1B2E7493BC2AD013EC4A6F6D3529B520EDFF0EA6DEFC955B29D6D69EBF3EC8A";
    pub const ANNEX_N_NO_CRC: &str =
        "2E4493157856341233037A2A0020255923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3";

    #[test]
    fn format_a_crc_strip_produces_canonical_frame() {
        let data = hex::decode(ANNEX_N_WITH_CRC).unwrap();
        let frame = trim_crcs_format_a(&data).unwrap();
        assert_eq!(frame, hex::decode(ANNEX_N_NO_CRC).unwrap());
        assert_eq!(frame[0] as usize, frame.len() - 1);
    }

    #[test]
    fn format_a_bad_crc_is_dropped() {
        let mut data = hex::decode(ANNEX_N_WITH_CRC).unwrap();
        data[15] ^= 0x01;
        assert!(matches!(trim_crcs_format_a(&data), Err(LinkError::BadCrc { .. })));
    }

    #[test]
    fn mode_c_format_a_frame_decodes() {
        let mut data = vec![MODE_C_PREAMBLE, BLOCK_A_PREAMBLE];
        data.extend(hex::decode(ANNEX_N_WITH_CRC).unwrap());
        let frame = decode(data, -77).unwrap();
        assert_eq!(frame.link_mode, LinkMode::C1);
        assert_eq!(frame.format, FrameFormat::A);
        assert_eq!(frame.rssi_dbm, -77);
        assert_eq!(frame.data[0] as usize, frame.data.len() - 1);
    }

    #[test]
    fn mode_t_frame_decodes_through_line_coding() {
        let wire = threeof6::encode(&hex::decode(ANNEX_N_WITH_CRC).unwrap());
        let frame = decode(wire, -90).unwrap();
        assert_eq!(frame.link_mode, LinkMode::T1);
        assert_eq!(frame.data, hex::decode(ANNEX_N_NO_CRC).unwrap());
    }

    #[test]
    fn format_b_roundtrip_with_self_computed_crc() {
        /* Build a minimal format B frame: L counts CRC but not itself. */
        let body: Vec<u8> = vec![
            0x44, 0x93, 0x15, 0x78, 0x56, 0x34, 0x12, 0x33, 0x03, 0x78, 0x04, 0x13, 0xD2, 0x04,
            0x00, 0x00,
        ];
        let l = (body.len() + 2) as u8;
        let mut data = vec![l];
        data.extend_from_slice(&body);
        let crc = crc16_en13757(&data);
        data.push((crc >> 8) as u8);
        data.push((crc & 0xFF) as u8);

        let frame = trim_crcs_format_b(&data).unwrap();
        assert_eq!(frame[0] as usize, frame.len() - 1);
        assert_eq!(&frame[1..], &body[..]);
    }

    #[test]
    fn expected_wire_size_matches_annex_n() {
        let with_crc = hex::decode(ANNEX_N_WITH_CRC).unwrap();
        assert_eq!(with_crc.len(), 55);

        let mut c_mode = vec![MODE_C_PREAMBLE, BLOCK_A_PREAMBLE, 0x2E];
        c_mode.push(0x00);
        assert_eq!(expected_wire_size(&c_mode), Some((57, LinkMode::C1)));

        let t_wire = threeof6::encode(&with_crc);
        assert_eq!(t_wire.len(), 83); // ceil(1.5 * 55)
        assert_eq!(expected_wire_size(&t_wire[..3]), Some((83, LinkMode::T1)));
    }

    #[test]
    fn link_mode_set_operations() {
        let s = LinkModeSet::none().with(LinkMode::T1).with(LinkMode::C1);
        assert!(s.supports(LinkModeSet::none().with(LinkMode::T1)));
        assert!(!s.supports(LinkModeSet::none().with(LinkMode::S1)));
        assert!(s.has_all(LinkModeSet::none().with(LinkMode::C1)));
        assert!(!s.has_all(LinkModeSet::none().with(LinkMode::C1).with(LinkMode::S2)));
        assert!(LinkModeSet::any().contains(LinkMode::MBus));
    }
}
