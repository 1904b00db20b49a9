//! Telegram parsing: the DLL → ELL → NWL → AFL → TPL walk over a canonical
//! frame, including the security layer (AES-CTR, AES-CBC, CMAC, KDF) and
//! the analyzer explanation log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use thiserror::Error;

use crate::dvparser::{self, DVEntry};
use crate::utils::{bin2hex, crc16_en13757, manufacturer_flag, media_type, reverse_bcd};

pub mod crypto;

/// Custom error types for telegram parsing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected more data at offset {0}")]
    ShortFrame(usize),
    #[error("unsupported C field {0:#04x}")]
    UnsupportedCField(u8),
    #[error("key must be 32 hex characters or NOKEY")]
    BadKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    WmBus,
    MBus,
    Han,
}

impl Default for FrameType {
    fn default() -> Self {
        FrameType::WmBus
    }
}

/// Reception metadata travelling with the frame.
#[derive(Debug, Clone)]
pub struct AboutTelegram {
    pub device: String,
    pub rssi_dbm: i32,
    pub frame_type: FrameType,
    pub timestamp: DateTime<Utc>,
}

impl Default for AboutTelegram {
    fn default() -> Self {
        AboutTelegram {
            device: String::new(),
            rssi_dbm: 0,
            frame_type: FrameType::WmBus,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Keys configured for one meter. Absent keys mean "do not attempt
/// decryption/authentication".
#[derive(Debug, Clone, Default)]
pub struct MeterKeys {
    pub confidentiality_key: Option<[u8; 16]>,
    pub authentication_key: Option<[u8; 16]>,
}

impl MeterKeys {
    /// 32 hex characters, or NOKEY/empty for an unencrypted meter.
    pub fn from_hex(key: &str) -> Result<MeterKeys, ParseError> {
        if key.is_empty() || key.eq_ignore_ascii_case("NOKEY") {
            return Ok(MeterKeys::default());
        }
        let bytes = hex::decode(key).map_err(|_| ParseError::BadKey)?;
        let key: [u8; 16] = bytes.try_into().map_err(|_| ParseError::BadKey)?;
        Ok(MeterKeys { confidentiality_key: Some(key), authentication_key: None })
    }

    /// Attach a separate authentication key, same 32 hex character format.
    pub fn with_auth_key(mut self, key: &str) -> Result<MeterKeys, ParseError> {
        if key.is_empty() || key.eq_ignore_ascii_case("NOKEY") {
            return Ok(self);
        }
        let bytes = hex::decode(key).map_err(|_| ParseError::BadKey)?;
        self.authentication_key = Some(bytes.try_into().map_err(|_| ParseError::BadKey)?);
        Ok(self)
    }

    pub fn has_confidentiality_key(&self) -> bool {
        self.confidentiality_key.is_some()
    }
}

/// A normalized wM-Bus address: printable id plus mfct/version/type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub id: String,
    pub mfct: u16,
    pub version: u8,
    pub device_type: u8,
}

impl Address {
    /* Wire order mfct(2) id(4) version type, used by DLL and ELL. */
    pub fn decode_mfct_first(b: &[u8]) -> Address {
        Address {
            mfct: (b[1] as u16) << 8 | b[0] as u16,
            id: reverse_bcd(&bin2hex(&b[2..6])),
            version: b[6],
            device_type: b[7],
        }
    }

    /* Wire order id(4) mfct(2) version type, used by the long TPL header. */
    pub fn decode_id_first(b: &[u8]) -> Address {
        Address {
            id: reverse_bcd(&bin2hex(&b[0..4])),
            mfct: (b[5] as u16) << 8 | b[4] as u16,
            version: b[6],
            device_type: b[7],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindOfData {
    Protocol,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Understanding {
    None,
    Encrypted,
    Compressed,
    Partial,
    Full,
}

/// One annotated byte range for analyzer output.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub offset: usize,
    pub len: usize,
    pub text: String,
    pub kind: KindOfData,
    pub understanding: Understanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EllSecurityMode {
    #[default]
    NoSecurity,
    AesCtr,
    Reserved,
}

impl EllSecurityMode {
    fn from_bits(b: u8) -> EllSecurityMode {
        match b {
            0 => EllSecurityMode::NoSecurity,
            1 => EllSecurityMode::AesCtr,
            _ => EllSecurityMode::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TplSecurityMode {
    #[default]
    NoSecurity,
    MfctSpecific,
    AesCbcIv,
    AesCbcNoIv,
    Specific(u8),
    Reserved(u8),
}

impl TplSecurityMode {
    fn from_bits(b: u8) -> TplSecurityMode {
        match b {
            0 => TplSecurityMode::NoSecurity,
            1 => TplSecurityMode::MfctSpecific,
            5 => TplSecurityMode::AesCbcIv,
            7 => TplSecurityMode::AesCbcNoIv,
            13 | 15 => TplSecurityMode::Specific(b),
            16..=31 => TplSecurityMode::Specific(b),
            other => TplSecurityMode::Reserved(other),
        }
    }
}

/* MAC length from the AFL authentication type in the low MCL bits. */
fn afl_mac_len(auth_type: u8) -> Option<usize> {
    match auth_type {
        3 => Some(2),
        4 => Some(4),
        5 => Some(8),
        6 => Some(12),
        7 => Some(16),
        8 => Some(12), // AES-GMAC-128
        _ => None,
    }
}

pub mod ci {
    pub const TPL_LONG: u8 = 0x72;
    pub const TPL_NONE: u8 = 0x78;
    pub const TPL_COMPACT: u8 = 0x79;
    pub const TPL_SHORT: u8 = 0x7A;
    pub const NWL: u8 = 0x81;
    pub const ELL_I: u8 = 0x8C;
    pub const ELL_II: u8 = 0x8D;
    pub const ELL_III: u8 = 0x8E;
    pub const ELL_IV: u8 = 0x8F;
    pub const ELL_V: u8 = 0x86;
    pub const AFL: u8 = 0x90;

    pub fn is_ell(ci: u8) -> bool {
        matches!(ci, ELL_I | ELL_II | ELL_III | ELL_IV | ELL_V)
    }

    pub fn is_tpl(ci: u8) -> bool {
        matches!(ci, TPL_LONG | TPL_NONE | TPL_COMPACT | TPL_SHORT)
    }

    pub fn is_mfct_specific(ci: u8) -> bool {
        (0xA0..=0xB7).contains(&ci)
    }
}

/// Optional hook for proprietary security modes 16-31 (Diehl real data).
/// Returns true when it decrypted the frame suffix in place.
pub type SpecificDecryptHook = fn(t: &mut Telegram, pos: usize, keys: &MeterKeys) -> bool;

/// Everything parsed out of one telegram, layer by layer.
#[derive(Debug, Clone, Default)]
pub struct Telegram {
    pub about: AboutTelegram,
    pub addresses: Vec<Address>,
    pub decryption_failed: bool,
    pub handled: bool,
    pub is_simulated: bool,
    pub being_analyzed: bool,
    parser_warns: bool,

    // DLL
    pub dll_len: u8,
    pub dll_c: u8,
    pub dll_mfct_b: [u8; 2],
    pub dll_mfct: u16,
    pub dll_a: [u8; 6],
    pub dll_id_b: [u8; 4],
    pub dll_version: u8,
    pub dll_type: u8,

    // ELL, ci stays 0 when the layer is absent
    pub ell_ci: u8,
    pub ell_cc: u8,
    pub ell_acc: u8,
    pub ell_sn_b: [u8; 4],
    pub ell_sn: u32,
    pub ell_sn_session: u8,
    pub ell_sn_time: u32,
    pub ell_sn_sec: u8,
    pub ell_sec_mode: EllSecurityMode,
    pub ell_pl_crc: u16,
    pub ell_mfct: u16,
    pub ell_id_found: bool,
    pub ell_id_b: [u8; 4],
    pub ell_version: u8,
    pub ell_type: u8,

    // NWL
    pub nwl_ci: u8,

    // AFL
    pub afl_ci: u8,
    pub afl_len: u8,
    pub afl_fc: u16,
    pub afl_mcl: u8,
    pub afl_ki_found: bool,
    pub afl_ki: u16,
    pub afl_counter_found: bool,
    pub afl_counter_b: [u8; 4],
    pub afl_counter: u32,
    pub must_check_mac: bool,
    pub afl_mac_b: Vec<u8>,

    // TPL
    pub tpl_start: usize,
    pub tpl_ci: u8,
    pub tpl_acc: u8,
    pub tpl_sts: u8,
    pub tpl_sts_offset: usize,
    pub tpl_cfg: u16,
    pub tpl_sec_mode: TplSecurityMode,
    pub tpl_num_encr_blocks: u8,
    pub tpl_cfg_ext: u8,
    pub tpl_kdf_selection: u8,
    pub tpl_generated_key: Option<[u8; 16]>,
    pub tpl_generated_mac_key: Option<[u8; 16]>,
    pub tpl_id_found: bool,
    pub tpl_id_b: [u8; 4],
    pub tpl_a: [u8; 6],
    pub tpl_mfct_b: [u8; 2],
    pub tpl_mfct: u16,
    pub tpl_version: u8,
    pub tpl_type: u8,

    pub format_signature: u16,

    /// Frame content, decrypted in place where a layer rewrote its suffix.
    pub frame: Vec<u8>,
    pub header_size: usize,
    pub suffix_size: usize,
    pub mfct_0f_index: Option<usize>,
    pub force_mfct_index: Option<usize>,

    pub dv_entries: HashMap<String, DVEntry>,
    pub explanations: Vec<Explanation>,
}

impl Telegram {
    pub fn new(about: AboutTelegram) -> Telegram {
        Telegram { about, ..Default::default() }
    }

    /// Replayed or file-fed telegrams may arrive already decrypted and
    /// without keys; the security layer treats them leniently.
    pub fn mark_as_simulated(&mut self) {
        self.is_simulated = true;
    }

    /// Analyzer runs keep the explanation log but stay quiet in the log.
    pub fn mark_as_being_analyzed(&mut self) {
        self.being_analyzed = true;
    }

    /// Printable id of the innermost address (TPL if present, else DLL).
    pub fn id(&self) -> String {
        self.addresses.last().map(|a| a.id.clone()).unwrap_or_default()
    }

    pub fn media(&self) -> &'static str {
        if self.tpl_id_found {
            media_type(self.tpl_type)
        } else if self.ell_id_found {
            media_type(self.ell_type)
        } else {
            media_type(self.dll_type)
        }
    }

    /// The measurement records, after the header and without the suffix.
    pub fn extract_payload(&self) -> Vec<u8> {
        let end = self.frame.len().saturating_sub(self.suffix_size);
        if self.header_size >= end {
            return Vec::new();
        }
        self.frame[self.header_size..end].to_vec()
    }

    /// Data following the DIF 0x0F marker inside the record section.
    pub fn extract_mfct_data(&self) -> Vec<u8> {
        let payload = self.extract_payload();
        match self.mfct_0f_index {
            Some(idx) if idx < payload.len() => payload[idx..].to_vec(),
            _ => Vec::new(),
        }
    }

    pub fn note(
        &mut self,
        pos: &mut usize,
        len: usize,
        kind: KindOfData,
        understanding: Understanding,
        text: String,
    ) {
        self.explanations.push(Explanation { offset: *pos, len, text, kind, understanding });
        *pos += len;
    }

    fn remaining(&self, pos: usize) -> usize {
        self.frame.len().saturating_sub(pos)
    }

    fn expected_more(&mut self, pos: usize) -> bool {
        self.explanations.push(Explanation {
            offset: pos,
            len: 0,
            text: "expected more data".to_string(),
            kind: KindOfData::Protocol,
            understanding: Understanding::Partial,
        });
        debug!("(telegram) expected more data at offset {}", pos);
        false
    }

    /// Keyless parse of the layer headers, used to find the addresses before
    /// any meter (and its keys) has been selected.
    pub fn parse_header(&mut self, input_frame: &[u8]) -> Result<bool, ParseError> {
        self.parse_with(input_frame, &MeterKeys::default(), false, None)
    }

    /// Full parse including decryption and the record walk.
    pub fn parse(
        &mut self,
        input_frame: &[u8],
        keys: &MeterKeys,
        warn_on_failure: bool,
    ) -> Result<bool, ParseError> {
        self.parse_with(input_frame, keys, warn_on_failure, None)
    }

    pub fn parse_with(
        &mut self,
        input_frame: &[u8],
        keys: &MeterKeys,
        warn_on_failure: bool,
        specific_hook: Option<SpecificDecryptHook>,
    ) -> Result<bool, ParseError> {
        self.frame = input_frame.to_vec();
        self.parser_warns = warn_on_failure;
        self.decryption_failed = false;
        self.explanations.clear();
        self.suffix_size = 0;
        self.addresses.clear();

        let mut pos = 0usize;
        self.parse_dll(&mut pos)?;

        /* At worst only the DLL is parsed. That is still a telegram. */
        if !self.parse_ell(&mut pos, keys) {
            return Ok(true);
        }
        if self.decryption_failed {
            return Ok(true);
        }
        if !self.parse_nwl(&mut pos) {
            return Ok(true);
        }
        if !self.parse_afl(&mut pos) {
            return Ok(true);
        }
        let ok = self.parse_tpl(&mut pos, keys, specific_hook);
        Ok(ok)
    }

    fn parse_dll(&mut self, pos: &mut usize) -> Result<(), ParseError> {
        if self.remaining(*pos) < 10 {
            return Err(ParseError::ShortFrame(*pos));
        }
        self.dll_len = self.frame[0];
        if self.remaining(*pos) < self.dll_len as usize {
            return Err(ParseError::ShortFrame(*pos));
        }
        let text = format!("{:02x} length ({} bytes)", self.dll_len, self.dll_len);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.dll_c = self.frame[*pos];
        if self.parser_warns && self.dll_c != 0x44 && self.dll_c != 0x46 {
            return Err(ParseError::UnsupportedCField(self.dll_c));
        }
        let text = format!("{:02x} dll-c", self.dll_c);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        let a = Address::decode_mfct_first(&self.frame[*pos..*pos + 8]);
        self.dll_mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
        self.dll_mfct = a.mfct;
        let text = format!(
            "{:02x}{:02x} dll-mfct ({})",
            self.dll_mfct_b[0],
            self.dll_mfct_b[1],
            manufacturer_flag(self.dll_mfct)
        );
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

        self.dll_a.copy_from_slice(&self.frame[*pos..*pos + 6]);
        self.dll_id_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
        let text = format!("{} dll-id ({})", bin2hex(&self.dll_id_b), a.id);
        self.note(pos, 4, KindOfData::Protocol, Understanding::Full, text);

        self.dll_version = self.frame[*pos];
        self.dll_type = self.frame[*pos + 1];
        let text = format!("{:02x} dll-version", self.dll_version);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);
        let text = format!("{:02x} dll-type ({})", self.dll_type, media_type(self.dll_type));
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.addresses.push(a);
        Ok(())
    }

    /* Returns false when parsing must stop cleanly after this layer. */
    fn parse_ell(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.remaining(*pos) == 0 {
            return false;
        }
        let ci_field = self.frame[*pos];
        if !ci::is_ell(ci_field) {
            return true;
        }
        debug!("(telegram) parseELL @{} {}", pos, self.remaining(*pos));
        self.ell_ci = ci_field;
        let text = format!("{:02x} ell-ci-field", ci_field);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        if self.remaining(*pos) < 2 {
            return self.expected_more(*pos);
        }

        /* All ELLs start with cc, acc. */
        self.ell_cc = self.frame[*pos];
        let text = format!("{:02x} ell-cc", self.ell_cc);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);
        self.ell_acc = self.frame[*pos];
        let text = format!("{:02x} ell-acc", self.ell_acc);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        let (has_target_address, has_session_number) = match self.ell_ci {
            ci::ELL_I => (false, false),
            ci::ELL_II => (false, true),
            ci::ELL_III => (true, false),
            ci::ELL_IV => (true, true),
            _ => {
                /* ELL V, unknown content. Record the remainder and stop. */
                let len = self.remaining(*pos);
                let text = format!("{} ell-v content (not understood)", bin2hex(&self.frame[*pos..]));
                self.note(pos, len, KindOfData::Content, Understanding::None, text);
                return false;
            }
        };

        if has_target_address {
            if self.remaining(*pos) < 8 {
                return self.expected_more(*pos);
            }
            let a = Address::decode_mfct_first(&self.frame[*pos..*pos + 8]);
            self.ell_mfct = a.mfct;
            let text = format!(
                "{:02x}{:02x} ell-mfct ({})",
                self.frame[*pos],
                self.frame[*pos + 1],
                manufacturer_flag(self.ell_mfct)
            );
            self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

            self.ell_id_found = true;
            self.ell_id_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            let text = format!("{} ell-id", bin2hex(&self.ell_id_b));
            self.note(pos, 4, KindOfData::Protocol, Understanding::Full, text);

            self.ell_version = self.frame[*pos];
            let text = format!("{:02x} ell-version", self.ell_version);
            self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);
            self.ell_type = self.frame[*pos];
            let text = format!("{:02x} ell-type", self.ell_type);
            self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

            self.addresses.push(a);
        }

        if has_session_number {
            if self.remaining(*pos) < 4 {
                return self.expected_more(*pos);
            }
            self.ell_sn_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            self.ell_sn = u32::from_le_bytes(self.ell_sn_b);
            self.ell_sn_session = (self.ell_sn & 0x0F) as u8;
            self.ell_sn_time = (self.ell_sn >> 4) & 0x1FF_FFFF;
            self.ell_sn_sec = ((self.ell_sn >> 29) & 0x7) as u8;
            self.ell_sec_mode = EllSecurityMode::from_bits(self.ell_sn_sec);
            let text = format!("{} sn ({:?})", bin2hex(&self.ell_sn_b), self.ell_sec_mode);
            self.note(pos, 4, KindOfData::Protocol, Understanding::Full, text);

            if self.ell_sec_mode == EllSecurityMode::AesCtr {
                if let Some(key) = keys.confidentiality_key {
                    /* CTR always "succeeds", a wrong key produces garbage
                       that the payload crc will catch. */
                    let (mfct, a_field, cc, sn) =
                        (self.dll_mfct_b, self.dll_a, self.ell_cc, self.ell_sn_b);
                    crypto::decrypt_ell_aes_ctr(&mut self.frame[*pos..], &key, mfct, a_field, cc, sn);
                }
            }

            if self.remaining(*pos) < 2 {
                return self.expected_more(*pos);
            }
            self.ell_pl_crc = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
            let check = crc16_en13757(&self.frame[*pos + 2..]);
            let ok = self.ell_pl_crc == check;
            let text = format!(
                "{:02x}{:02x} payload crc (calculated {:02x}{:02x} {})",
                self.frame[*pos],
                self.frame[*pos + 1],
                check & 0xFF,
                check >> 8,
                if ok { "OK" } else { "ERROR" }
            );
            self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

            if !ok {
                /* Wrong key or no key, classify the rest as encrypted. */
                self.decryption_failed = true;
                let len = self.remaining(*pos);
                let text = format!("{} failed decryption. Wrong key?", bin2hex(&self.frame[*pos..]));
                self.note(pos, len, KindOfData::Content, Understanding::Encrypted, text);
                if self.parser_warns && !self.being_analyzed {
                    warn!(
                        "(telegram) decrypted payload crc failed check, wrong key? id: {} mfct: {}",
                        self.id(),
                        manufacturer_flag(self.dll_mfct)
                    );
                }
            }
        }

        true
    }

    fn parse_nwl(&mut self, pos: &mut usize) -> bool {
        if self.remaining(*pos) == 0 {
            return false;
        }
        let ci_field = self.frame[*pos];
        if ci_field != ci::NWL {
            return true;
        }
        self.nwl_ci = ci_field;
        let text = format!("{:02x} nwl-ci-field", ci_field);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);
        if self.remaining(*pos) < 1 {
            return self.expected_more(*pos);
        }
        let nwl = self.frame[*pos];
        let text = format!("{:02x} nwl", nwl);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);
        true
    }

    fn parse_afl(&mut self, pos: &mut usize) -> bool {
        if self.remaining(*pos) == 0 {
            return false;
        }
        let ci_field = self.frame[*pos];
        if ci_field != ci::AFL {
            return true;
        }
        debug!("(telegram) parseAFL @{} {}", pos, self.remaining(*pos));
        self.afl_ci = ci_field;
        let text = format!("{:02x} afl-ci-field", ci_field);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        if self.remaining(*pos) < 3 {
            return self.expected_more(*pos);
        }
        self.afl_len = self.frame[*pos];
        let text = format!("{:02x} afl-len ({})", self.afl_len, self.afl_len);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.afl_fc = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        let text = format!("{:02x}{:02x} afl-fc", self.frame[*pos], self.frame[*pos + 1]);
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

        let has_key_info = self.afl_fc & 0x0200 != 0;
        let has_mac = self.afl_fc & 0x0400 != 0;
        let has_counter = self.afl_fc & 0x0800 != 0;
        let has_control = self.afl_fc & 0x2000 != 0;

        if has_control {
            if self.remaining(*pos) < 1 {
                return self.expected_more(*pos);
            }
            self.afl_mcl = self.frame[*pos];
            let text = format!("{:02x} afl-mcl", self.afl_mcl);
            self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);
        }

        if has_key_info {
            if self.remaining(*pos) < 2 {
                return self.expected_more(*pos);
            }
            self.afl_ki = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
            self.afl_ki_found = true;
            let text = format!("{:02x}{:02x} afl-ki", self.frame[*pos], self.frame[*pos + 1]);
            self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);
        }

        if has_counter {
            if self.remaining(*pos) < 4 {
                return self.expected_more(*pos);
            }
            self.afl_counter_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            self.afl_counter = u32::from_le_bytes(self.afl_counter_b);
            self.afl_counter_found = true;
            let text = format!("{} afl-counter ({})", bin2hex(&self.afl_counter_b), self.afl_counter);
            self.note(pos, 4, KindOfData::Protocol, Understanding::Full, text);
        }

        if has_mac {
            let at = self.afl_mcl & 0x0F;
            let len = match afl_mac_len(at) {
                Some(len) => len,
                None => {
                    if self.parser_warns {
                        warn!("(telegram) bad length of mac (auth type {})", at);
                    }
                    return false;
                }
            };
            if self.remaining(*pos) < len {
                return self.expected_more(*pos);
            }
            self.afl_mac_b = self.frame[*pos..*pos + len].to_vec();
            let text = format!("{} afl-mac {} bytes", bin2hex(&self.afl_mac_b), len);
            self.note(pos, len, KindOfData::Protocol, Understanding::Full, text);
            self.must_check_mac = true;
        }

        true
    }

    fn parse_tpl_config(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.remaining(*pos) < 2 {
            return self.expected_more(*pos);
        }
        self.tpl_cfg = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        self.tpl_sec_mode = TplSecurityMode::from_bits(((self.tpl_cfg >> 8) & 0x1F) as u8);
        if matches!(self.tpl_sec_mode, TplSecurityMode::AesCbcIv | TplSecurityMode::AesCbcNoIv) {
            self.tpl_num_encr_blocks = ((self.tpl_cfg >> 4) & 0x0F) as u8;
        }
        let text = format!(
            "{:02x}{:02x} tpl-cfg {:04x} ({:?})",
            self.frame[*pos],
            self.frame[*pos + 1],
            self.tpl_cfg,
            self.tpl_sec_mode
        );
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

        if self.tpl_sec_mode != TplSecurityMode::AesCbcNoIv {
            return true;
        }

        /* Mode 7 appends a configuration extension whose KDFS bits select
           the key derivation. */
        if self.remaining(*pos) < 1 {
            return self.expected_more(*pos);
        }
        self.tpl_cfg_ext = self.frame[*pos];
        self.tpl_kdf_selection = (self.tpl_cfg_ext >> 4) & 0x3;
        let text = format!("{:02x} tpl-cfg-ext (KDFS={})", self.tpl_cfg_ext, self.tpl_kdf_selection);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        if self.tpl_kdf_selection == 1 {
            let key = match keys.confidentiality_key {
                Some(k) => k,
                None => {
                    if self.is_simulated {
                        debug!("(telegram) simulation without keys, not generating Kenc and Kmac");
                        return true;
                    }
                    debug!("(telegram) no key, thus cannot execute kdf");
                    return false;
                }
            };
            let id = if self.tpl_id_found { self.tpl_id_b } else { self.dll_id_b };
            let kenc =
                crypto::kdf_v1(&key, crypto::DerivationConstant::EncFromMeter, self.afl_counter_b, id);
            debug!("(telegram) ephemereal Kenc {}", bin2hex(&kenc));
            let kmac =
                crypto::kdf_v1(&key, crypto::DerivationConstant::MacFromMeter, self.afl_counter_b, id);
            debug!("(telegram) ephemereal Kmac {}", bin2hex(&kmac));
            self.tpl_generated_key = Some(kenc);
            self.tpl_generated_mac_key = Some(kmac);
        }

        true
    }

    fn parse_short_tpl(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.remaining(*pos) < 2 {
            return self.expected_more(*pos);
        }
        self.tpl_acc = self.frame[*pos];
        let text = format!("{:02x} tpl-acc-field", self.tpl_acc);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.tpl_sts = self.frame[*pos];
        self.tpl_sts_offset = *pos;
        let text = format!(
            "{:02x} tpl-sts-field ({})",
            self.tpl_sts,
            crate::utils::decode_tpl_status_standard_bits(self.tpl_sts)
        );
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.parse_tpl_config(pos, keys)
    }

    fn parse_long_tpl(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.remaining(*pos) < 8 {
            return self.expected_more(*pos);
        }
        let a = Address::decode_id_first(&self.frame[*pos..*pos + 8]);

        self.tpl_id_found = true;
        self.tpl_id_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
        self.tpl_a[..4].copy_from_slice(&self.frame[*pos..*pos + 4]);
        let text = format!("{} tpl-id ({})", bin2hex(&self.tpl_id_b), a.id);
        self.note(pos, 4, KindOfData::Protocol, Understanding::Full, text);

        self.tpl_mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
        self.tpl_mfct = a.mfct;
        let text = format!(
            "{:02x}{:02x} tpl-mfct ({})",
            self.tpl_mfct_b[0],
            self.tpl_mfct_b[1],
            manufacturer_flag(self.tpl_mfct)
        );
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

        self.tpl_version = self.frame[*pos];
        self.tpl_a[4] = self.frame[*pos];
        let text = format!("{:02x} tpl-version", self.tpl_version);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.tpl_type = self.frame[*pos];
        self.tpl_a[5] = self.frame[*pos];
        let text = format!("{:02x} tpl-type ({})", self.tpl_type, media_type(self.tpl_type));
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        self.addresses.push(a);

        self.parse_short_tpl(pos, keys)
    }

    /* The two verification bytes are already plaintext. Fine without keys,
       a policy violation with them. */
    fn already_decrypted_cbc(&mut self, pos: &mut usize, keys: &MeterKeys) -> Option<bool> {
        if self.remaining(*pos) < 2 || self.frame[*pos] != 0x2F || self.frame[*pos + 1] != 0x2F {
            return None;
        }
        let text = format!(
            "{:02x}{:02x} already decrypted check bytes",
            self.frame[*pos],
            self.frame[*pos + 1]
        );
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);
        if keys.has_confidentiality_key() {
            if self.parser_warns {
                warn!(
                    "(telegram) telegram should have been encrypted but was not! id: {} mfct: {}",
                    self.id(),
                    manufacturer_flag(self.dll_mfct)
                );
            }
            return Some(false);
        }
        Some(true)
    }

    fn mark_suffix_encrypted(&mut self, pos: &mut usize, info: &str) {
        let len = self.remaining(*pos);
        let text = format!("{} {}", bin2hex(&self.frame[*pos..]), info);
        self.note(pos, len, KindOfData::Content, Understanding::Encrypted, text);
    }

    /* Returns true when the suffix from pos onwards is now plaintext. */
    fn potentially_decrypt(
        &mut self,
        pos: &mut usize,
        keys: &MeterKeys,
        specific_hook: Option<SpecificDecryptHook>,
    ) -> bool {
        match self.tpl_sec_mode {
            TplSecurityMode::AesCbcIv => {
                if let Some(verdict) = self.already_decrypted_cbc(pos, keys) {
                    return verdict;
                }
                let key = match keys.confidentiality_key {
                    Some(k) => k,
                    None => {
                        self.mark_suffix_encrypted(pos, "encrypted");
                        if self.parser_warns && !self.being_analyzed {
                            warn!(
                                "(telegram) no key to decrypt payload! id: {} mfct: {}",
                                self.id(),
                                manufacturer_flag(self.dll_mfct)
                            );
                        }
                        return false;
                    }
                };
                let (mfct, a_field) = if self.tpl_id_found {
                    (self.tpl_mfct_b, self.tpl_a)
                } else {
                    (self.dll_mfct_b, self.dll_a)
                };
                let iv = crypto::mode5_iv(mfct, a_field, self.tpl_acc);
                if !self.decrypt_cbc_region(*pos, &key, &iv) {
                    self.mark_suffix_encrypted(pos, "encrypted");
                    return false;
                }
                self.check_decrypt_bytes(pos)
            }
            TplSecurityMode::AesCbcNoIv => {
                if let Some(verdict) = self.already_decrypted_cbc(pos, keys) {
                    return verdict;
                }
                let mac_key = match self.tpl_generated_mac_key {
                    Some(k) => k,
                    None => {
                        self.mark_suffix_encrypted(pos, "encrypted, no derived keys");
                        return false;
                    }
                };
                let message = self.frame[self.tpl_start..].to_vec();
                let mac_ok = crypto::check_mac(
                    &mac_key,
                    self.afl_mcl,
                    self.afl_counter_b,
                    &message,
                    &self.afl_mac_b,
                );
                if !mac_ok {
                    if self.parser_warns && !self.being_analyzed {
                        warn!(
                            "(telegram) mac check failed, wrong key? id: {} mfct: {}",
                            self.id(),
                            manufacturer_flag(self.dll_mfct)
                        );
                    }
                    self.mark_suffix_encrypted(pos, "encrypted mac failed");
                    return false;
                }
                let key = self.tpl_generated_key.expect("kenc generated with kmac");
                let iv = [0u8; 16];
                if !self.decrypt_cbc_region(*pos, &key, &iv) {
                    self.mark_suffix_encrypted(pos, "encrypted");
                    return false;
                }
                self.check_decrypt_bytes(pos)
            }
            TplSecurityMode::Specific(_) => {
                debug!("(telegram) non-standard security mode");
                if let Some(hook) = specific_hook {
                    if hook(self, *pos, keys) {
                        return true;
                    }
                }
                self.mark_suffix_encrypted(pos, "encrypted with specific mode");
                false
            }
            _ => {
                if keys.has_confidentiality_key() {
                    /* Plaintext arrived for a meter with a configured key.
                       Replay or spoofed header, reject. */
                    if self.parser_warns {
                        warn!(
                            "(telegram) telegram should have been encrypted but was not! id: {} mfct: {}",
                            self.id(),
                            manufacturer_flag(self.dll_mfct)
                        );
                    }
                    return false;
                }
                true
            }
        }
    }

    /* AES-CBC decrypt num_encr_blocks*16 bytes (or the whole multiple-of-16
       suffix when the config says zero blocks) in place. */
    fn decrypt_cbc_region(&mut self, pos: usize, key: &[u8; 16], iv: &[u8; 16]) -> bool {
        let suffix_len = self.frame.len().saturating_sub(pos);
        let mut num_bytes = if self.tpl_num_encr_blocks > 0 {
            self.tpl_num_encr_blocks as usize * 16
        } else {
            suffix_len
        };
        if num_bytes > suffix_len {
            warn!(
                "(telegram) aes-cbc decryption received less bytes than expected, got {} expected {}",
                suffix_len, num_bytes
            );
            num_bytes = suffix_len;
        }
        num_bytes -= num_bytes % 16;
        if num_bytes < 16 {
            return false;
        }
        crypto::decrypt_tpl_aes_cbc(&mut self.frame[pos..pos + num_bytes], key, iv)
    }

    /* Consume and verify the 2F 2F verification bytes after decryption. */
    fn check_decrypt_bytes(&mut self, pos: &mut usize) -> bool {
        if self.remaining(*pos) < 2 {
            return self.expected_more(*pos);
        }
        let (a, b) = (self.frame[*pos], self.frame[*pos + 1]);
        let ok = a == 0x2F && b == 0x2F;
        let text = format!(
            "{:02x}{:02x} decrypt check bytes ({})",
            a,
            b,
            if ok { "OK" } else { "ERROR should be 2f2f" }
        );
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);
        if !ok {
            self.mark_suffix_encrypted(pos, "failed decryption. Wrong key?");
            if self.parser_warns && !self.being_analyzed {
                warn!(
                    "(telegram) decrypted content failed check, wrong key? id: {} mfct: {}",
                    self.id(),
                    manufacturer_flag(self.dll_mfct)
                );
            }
        }
        ok
    }

    fn parse_tpl(
        &mut self,
        pos: &mut usize,
        keys: &MeterKeys,
        specific_hook: Option<SpecificDecryptHook>,
    ) -> bool {
        if self.remaining(*pos) == 0 {
            return false;
        }
        debug!("(telegram) parseTPL @{} {}", pos, self.remaining(*pos));
        let ci_field = self.frame[*pos];
        if !ci::is_tpl(ci_field) && !ci::is_mfct_specific(ci_field) {
            let text = format!("{:02x} unknown ci-field", ci_field);
            self.note(pos, 1, KindOfData::Protocol, Understanding::None, text);
            if self.parser_warns {
                warn!("(telegram) unknown tpl-ci-field {:02x}", ci_field);
            }
            return false;
        }
        self.tpl_ci = ci_field;
        self.tpl_start = *pos;
        let text = format!("{:02x} tpl-ci-field", ci_field);
        self.note(pos, 1, KindOfData::Protocol, Understanding::Full, text);

        match ci_field {
            ci::TPL_LONG => {
                if !self.parse_long_tpl(pos, keys) {
                    return false;
                }
                let decrypt_ok = self.potentially_decrypt(pos, keys, specific_hook);
                self.header_size = *pos;
                if decrypt_ok {
                    let len = self.remaining(*pos) - self.suffix_size;
                    dvparser::parse_dv(self, *pos, len, None);
                } else {
                    self.decryption_failed = true;
                }
                true
            }
            ci::TPL_SHORT => {
                if !self.parse_short_tpl(pos, keys) {
                    return false;
                }
                let decrypt_ok = self.potentially_decrypt(pos, keys, specific_hook);
                self.header_size = *pos;
                if decrypt_ok {
                    let len = self.remaining(*pos) - self.suffix_size;
                    dvparser::parse_dv(self, *pos, len, None);
                } else {
                    self.decryption_failed = true;
                }
                true
            }
            ci::TPL_NONE => {
                self.header_size = *pos;
                let len = self.remaining(*pos) - self.suffix_size;
                dvparser::parse_dv(self, *pos, len, None);
                true
            }
            ci::TPL_COMPACT => self.parse_tpl_compact(pos),
            _ => {
                /* A0..B7 manufacturer specific, record the remaining bytes. */
                self.header_size = *pos;
                let len = self.remaining(*pos) - self.suffix_size;
                let text = format!("{} mfct specific", bin2hex(&self.frame[*pos..*pos + len]));
                self.note(pos, len, KindOfData::Content, Understanding::None, text);
                true
            }
        }
    }

    fn parse_tpl_compact(&mut self, pos: &mut usize) -> bool {
        if self.remaining(*pos) < 4 {
            return self.expected_more(*pos);
        }
        self.format_signature = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        let text = format!(
            "{:02x}{:02x} format signature",
            self.frame[*pos],
            self.frame[*pos + 1]
        );
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

        let format_bytes = dvparser::lookup_format(self.format_signature)
            .or_else(|| dvparser::known_format_signature(self.format_signature));
        let format_bytes = match format_bytes {
            Some(f) => f,
            None => {
                /* Not seen a long frame yet. The next full telegram teaches
                   us this signature. */
                let len = self.remaining(*pos);
                let text = format!(
                    "{} compressed and signature unknown",
                    bin2hex(&self.frame[*pos..])
                );
                self.note(pos, len, KindOfData::Content, Understanding::Compressed, text);
                debug!(
                    "(telegram) ignoring compressed telegram, format signature {:04x} is yet unknown",
                    self.format_signature
                );
                return false;
            }
        };

        let text = format!("{:02x}{:02x} data crc", self.frame[*pos], self.frame[*pos + 1]);
        self.note(pos, 2, KindOfData::Protocol, Understanding::Full, text);

        self.header_size = *pos;
        let len = self.remaining(*pos) - self.suffix_size;
        dvparser::parse_dv(self, *pos, len, Some(&format_bytes));
        true
    }

    /// The drivers this telegram could decode with, for the unhandled hint.
    pub fn auto_detect_possible_drivers(&self) -> Vec<String> {
        crate::meters::detect_meter_drivers(self.dll_mfct, self.dll_type, self.dll_version)
    }

    /// Annotated hex listing of the parse for analyzer output.
    pub fn analyze(&self) -> String {
        let mut out = String::new();
        for e in &self.explanations {
            out.push_str(&format!("{:03} {:>3}: {}\n", e.offset, e.len, e.text));
        }
        out
    }
}

#[cfg(test)]
mod telegram_tests {
    use super::*;

    const ANNEX_N_NO_CRC: &str =
        "2E4493157856341233037A2A0020255923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3";
    const ANNEX_N_KEY: &str = "0102030405060708090A0B0C0D0E0F11";

    fn annex_n_keys() -> MeterKeys {
        MeterKeys::from_hex(ANNEX_N_KEY).unwrap()
    }

    #[test]
    fn dll_fields_parse() {
        let frame = hex::decode(ANNEX_N_NO_CRC).unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        assert!(t.parse_header(&frame).unwrap());
        assert_eq!(t.dll_len, 0x2E);
        assert_eq!(t.dll_c, 0x44);
        assert_eq!(t.dll_mfct, 0x1593);
        assert_eq!(t.addresses[0].id, "12345678");
        assert_eq!(t.dll_version, 0x33);
        assert_eq!(t.dll_type, 0x03);
        assert_eq!(t.media(), "gas");
    }

    #[test]
    fn mode5_telegram_decrypts_and_yields_records() {
        let frame = hex::decode(ANNEX_N_NO_CRC).unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let ok = t.parse(&frame, &annex_n_keys(), true).unwrap();
        assert!(ok);
        assert!(!t.decryption_failed);
        assert_eq!(t.tpl_sec_mode, TplSecurityMode::AesCbcIv);
        assert_eq!(t.tpl_num_encr_blocks, 2);
        assert_eq!(t.tpl_acc, 0x2A);

        /* OMS Annex N plaintext: volume 28504.27 m³ and a type F datetime. */
        let vol = &t.dv_entries["0C14"];
        assert_eq!(vol.extract_double(true, false), Some(28504.27));
        let dt = t.dv_entries["046D"].extract_date().unwrap();
        assert_eq!(dt.datetime_string(), "2008-05-31 23:50");
        assert_eq!(t.dv_entries["02FD17"].extract_long(), Some(0));
    }

    #[test]
    fn mode5_with_wrong_key_flags_decryption_failed() {
        let frame = hex::decode(ANNEX_N_NO_CRC).unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let keys = MeterKeys::from_hex("00000000000000000000000000000000").unwrap();
        let ok = t.parse(&frame, &keys, false).unwrap();
        assert!(ok);
        assert!(t.decryption_failed);
        assert!(t.dv_entries.is_empty());
        assert!(t
            .explanations
            .iter()
            .any(|e| e.understanding == Understanding::Encrypted));
    }

    #[test]
    fn mode5_without_key_stays_encrypted() {
        let frame = hex::decode(ANNEX_N_NO_CRC).unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let ok = t.parse(&frame, &MeterKeys::default(), false).unwrap();
        assert!(ok);
        assert!(t.decryption_failed);
    }

    #[test]
    fn plaintext_records_with_ci_78() {
        /* Simple water meter telegram without TPL header. */
        let frame = hex::decode("1444AE4C44552233680778041389E20100023B0000").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let ok = t.parse(&frame, &MeterKeys::default(), true).unwrap();
        assert!(ok);
        assert_eq!(t.addresses[0].id, "33225544");
        assert_eq!(t.dv_entries["0413"].extract_double(true, false), Some(123.529));
    }

    #[test]
    fn plaintext_with_configured_key_is_policy_violation() {
        let frame = hex::decode("1444AE4C4455223368077A55000000041389E20100").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let ok = t.parse(&frame, &annex_n_keys(), false).unwrap();
        assert!(ok);
        assert!(t.decryption_failed);
        assert!(t.dv_entries.is_empty());
    }

    #[test]
    fn compact_frame_with_unknown_signature_marks_compressed() {
        /* CI 0x79, signature nobody has cached. */
        let frame = hex::decode("1344AE4C44552233680779BEBA12341122334455").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        let ok = t.parse(&frame, &MeterKeys::default(), false).unwrap();
        assert!(!ok);
        assert!(t
            .explanations
            .iter()
            .any(|e| e.understanding == Understanding::Compressed));
        assert!(t.dv_entries.is_empty());
    }

    #[test]
    fn compact_frame_after_long_frame_decodes() {
        /* Teach the cache with a long frame, then decode its compact twin. */
        let long = hex::decode("1B44AE4C44552233680778 02FF20110004138AE2010044132A000000".replace(' ', "").as_str()).unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        assert!(t.parse(&long, &MeterKeys::default(), true).unwrap());

        let skeleton = hex::decode("02FF2004134413").unwrap();
        let signature = crc16_en13757(&skeleton);
        let mut compact = hex::decode("1844AE4C44552233680779").unwrap();
        compact.extend_from_slice(&signature.to_le_bytes());
        compact.extend_from_slice(&[0x00, 0x00]); // data crc, not validated
        compact.extend_from_slice(&hex::decode("110089E2010000000000").unwrap());

        let mut t2 = Telegram::new(AboutTelegram::default());
        let ok = t2.parse(&compact, &MeterKeys::default(), true).unwrap();
        assert!(ok);
        assert_eq!(t2.dv_entries["0413"].extract_double(true, false), Some(123.529));
    }

    /* ELL-II telegram with the payload (tpl-ci 0x78 plus records) behind
       a payload crc, everything CTR encrypted. */
    fn build_ell_ctr_telegram(key: &[u8; 16]) -> Vec<u8> {
        let mut plaintext = hex::decode("78041389E20100023B0000").unwrap();
        let crc = crc16_en13757(&plaintext);
        let mut payload = crc.to_le_bytes().to_vec();
        payload.append(&mut plaintext);

        let mut frame = hex::decode("0044AE4C445522336807").unwrap();
        frame.push(0x8D); // ELL II
        frame.push(0x70); // cc
        frame.push(0x01); // acc
        /* sn little endian, bits 29-31 of the 32 bit value select AES_CTR. */
        let sn = [0x11u8, 0x22, 0x33, 0x20];
        frame.extend_from_slice(&sn);

        let mut encrypted = payload;
        crypto::decrypt_ell_aes_ctr(
            &mut encrypted,
            key,
            [0xAE, 0x4C],
            [0x44, 0x55, 0x22, 0x33, 0x68, 0x07],
            0x70,
            sn,
        );
        frame.extend_from_slice(&encrypted);
        frame[0] = (frame.len() - 1) as u8;
        frame
    }

    #[test]
    fn ell_ctr_roundtrip_with_payload_crc() {
        let key: [u8; 16] = hex::decode(ANNEX_N_KEY).unwrap().try_into().unwrap();
        let frame = build_ell_ctr_telegram(&key);

        let mut t = Telegram::new(AboutTelegram::default());
        let keys = MeterKeys { confidentiality_key: Some(key), authentication_key: None };
        let ok = t.parse(&frame, &keys, true).unwrap();
        assert!(ok);
        assert!(!t.decryption_failed);
        assert_eq!(t.ell_sec_mode, EllSecurityMode::AesCtr);
        assert_eq!(t.dv_entries["0413"].extract_double(true, false), Some(123.529));
    }

    #[test]
    fn ell_ctr_with_wrong_key_fails_payload_crc() {
        let key: [u8; 16] = hex::decode(ANNEX_N_KEY).unwrap().try_into().unwrap();
        let frame = build_ell_ctr_telegram(&key);

        let wrong = MeterKeys::from_hex("000102030405060708090A0B0C0D0E0F").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        t.parse(&frame, &wrong, false).unwrap();
        assert!(t.decryption_failed);
    }

    #[test]
    fn simulated_mode7_telegram_without_keys_parses_plaintext() {
        /* Mode 7 with KDFS=1 but already decrypted content, the shape a
           replayed log line has. No keys configured. */
        let frame = hex::decode("1744AE4C4455223368077A5500100710 2F2F 041389E20100".replace(' ', "").as_str()).unwrap();

        let mut t = Telegram::new(AboutTelegram::default());
        t.mark_as_simulated();
        let ok = t.parse(&frame, &MeterKeys::default(), false).unwrap();
        assert!(ok);
        assert!(!t.decryption_failed);
        assert_eq!(t.tpl_sec_mode, TplSecurityMode::AesCbcNoIv);
        assert_eq!(t.dv_entries["0413"].extract_double(true, false), Some(123.529));

        /* The same telegram from a live radio stops at the kdf, no keys
           means no ephemeral Kenc/Kmac. */
        let mut t2 = Telegram::new(AboutTelegram::default());
        let ok = t2.parse(&frame, &MeterKeys::default(), false).unwrap();
        assert!(!ok);
        assert!(t2.dv_entries.is_empty());
    }

    #[test]
    fn truncated_frames_never_panic() {
        let full = hex::decode(ANNEX_N_NO_CRC).unwrap();
        for len in 0..full.len() {
            let mut t = Telegram::new(AboutTelegram::default());
            let _ = t.parse(&full[..len], &annex_n_keys(), false);
        }
    }

    #[test]
    fn explanations_are_monotonic_in_offset() {
        let frame = hex::decode(ANNEX_N_NO_CRC).unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        t.parse(&frame, &annex_n_keys(), true).unwrap();
        for pair in t.explanations.windows(2) {
            assert!(pair[0].offset <= pair[1].offset);
        }
    }

    #[test]
    fn key_parsing() {
        assert!(MeterKeys::from_hex("NOKEY").unwrap().confidentiality_key.is_none());
        assert!(MeterKeys::from_hex("").unwrap().confidentiality_key.is_none());
        assert!(MeterKeys::from_hex("0102").is_err());
        assert!(MeterKeys::from_hex(ANNEX_N_KEY).unwrap().has_confidentiality_key());
    }
}
