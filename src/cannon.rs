// Data structures and constants shared with the Cannon state format.

use base64::{engine::general_purpose, Engine as _};
use core::{
    fmt,
    fmt::{Display, Formatter},
};
use libflate::zlib::{Decoder, Encoder};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    io::{Read, Write},
    str::FromStr,
};

pub const PAGE_ADDRESS_SIZE: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_ADDRESS_SIZE;
pub const PAGE_ADDRESS_MASK: u64 = PAGE_SIZE - 1;

/// Number of tree levels above the page leaves. The tree covers 2^27 pages,
/// i.e. an effective 2^39-byte address space; address bits above that range
/// never reach the tree.
pub const PAGE_KEY_SIZE: u64 = 27;
pub const PAGE_KEY_MASK: u64 = (1 << PAGE_KEY_SIZE) - 1;

/// First address handed out by zero-address `mmap` on a fresh state.
pub const HEAP_START: u64 = 0x1000_0000_0000_0000;

/// Fixed program break reported by `brk`.
pub const PROGRAM_BREAK: u64 = 0x4000_0000;

pub const FD_STDIN: u64 = 0;
pub const FD_STDOUT: u64 = 1;
pub const FD_STDERR: u64 = 2;
pub const FD_HINT_READ: u64 = 3;
pub const FD_HINT_WRITE: u64 = 4;
pub const FD_PREIMAGE_READ: u64 = 5;
pub const FD_PREIMAGE_WRITE: u64 = 6;

// Linux n64 ABI syscall numbers.
pub const SYSCALL_READ: u64 = 5000;
pub const SYSCALL_WRITE: u64 = 5001;
pub const SYSCALL_MMAP: u64 = 5009;
pub const SYSCALL_BRK: u64 = 5012;
pub const SYSCALL_SCHED_YIELD: u64 = 5023;
pub const SYSCALL_NANOSLEEP: u64 = 5034;
pub const SYSCALL_CLONE: u64 = 5055;
pub const SYSCALL_EXIT: u64 = 5058;
pub const SYSCALL_FCNTL: u64 = 5070;
pub const SYSCALL_GETTID: u64 = 5178;
pub const SYSCALL_FUTEX: u64 = 5194;
pub const SYSCALL_EXIT_GROUP: u64 = 5205;

pub const FUTEX_WAIT_PRIVATE: u64 = 128;
pub const FUTEX_WAKE_PRIVATE: u64 = 129;

/// Sentinel for "no futex address" / "no pending wakeup" / "no timeout".
pub const FUTEX_EMPTY_ADDR: u64 = u64::MAX;
pub const FUTEX_NO_TIMEOUT: u64 = u64::MAX;

/// Number of steps a futex wait may block before it times out.
pub const FUTEX_TIMEOUT_STEPS: u64 = 10_000;

/// Number of steps a thread may run before the scheduler forces a context
/// switch.
pub const SCHED_QUANTUM: u64 = 10_000;

/// Syscall error return value (-1 as an unsigned word).
pub const SYS_ERROR_SIGNAL: u64 = u64::MAX;

pub const MIPS_EBADF: u64 = 9;
pub const MIPS_EAGAIN: u64 = 11;
pub const MIPS_EINVAL: u64 = 22;
pub const MIPS_ETIMEDOUT: u64 = 145;

// Child-process ends of the hint and preimage channels.
pub const HINT_CLIENT_READ_FD: i32 = 3;
pub const HINT_CLIENT_WRITE_FD: i32 = 4;
pub const PREIMAGE_CLIENT_READ_FD: i32 = 5;
pub const PREIMAGE_CLIENT_WRITE_FD: i32 = 6;

/// One populated page of the serialized memory image. Page bodies are stored
/// zlib-compressed and base64-encoded in the JSON snapshot.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Page {
    pub index: u64,
    #[serde(deserialize_with = "from_base64", serialize_with = "to_base64")]
    pub data: Vec<u8>,
}

fn from_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let s: String = Deserialize::deserialize(deserializer)?;
    let compressed = general_purpose::STANDARD
        .decode(s)
        .map_err(|e| D::Error::custom(format!("page is not valid base64: {e}")))?;
    let mut decoder = Decoder::new(&compressed[..])
        .map_err(|e| D::Error::custom(format!("page is not valid zlib: {e}")))?;
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| D::Error::custom(format!("page decompression failed: {e}")))?;
    if data.len() != PAGE_SIZE as usize {
        return Err(D::Error::custom(format!(
            "page has {} bytes, expected {}",
            data.len(),
            PAGE_SIZE
        )));
    }
    Ok(data)
}

fn to_base64<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::Error;
    let mut encoder =
        Encoder::new(Vec::new()).map_err(|e| S::Error::custom(format!("zlib encoder: {e}")))?;
    encoder
        .write_all(v)
        .map_err(|e| S::Error::custom(format!("page compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .into_result()
        .map_err(|e| S::Error::custom(format!("page compression failed: {e}")))?;
    serializer.serialize_str(&general_purpose::STANDARD.encode(compressed))
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePreimageKeyError(String);

/// A 32-byte preimage key, parsed from a `0x`-prefixed hexadecimal string of
/// exactly 64 digits (no auto-padding).
#[derive(Debug, PartialEq)]
pub struct PreimageKey(pub [u8; 32]);

impl FromStr for PreimageKey {
    type Err = ParsePreimageKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_value = s.strip_prefix("0x").unwrap_or(s);
        if hex_value.len() != 64 {
            return Err(ParsePreimageKeyError(format!(
                "{hex_value} is not 32-bytes long"
            )));
        }
        let bytes = hex::decode(hex_value)
            .map_err(|_| ParsePreimageKeyError(format!("could not hex decode {hex_value}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ParsePreimageKeyError(format!("{hex_value} is not 32 bytes")))?;
        Ok(PreimageKey(key))
    }
}

pub fn deserialize_preimage_key<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let s: String = Deserialize::deserialize(deserializer)?;
    PreimageKey::from_str(s.as_str())
        .map(|k| k.0)
        .map_err(|e| D::Error::custom(format!("parsing {s} as preimage key failed: {e:?}")))
}

pub fn serialize_preimage_key<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{}", hex::encode(v)))
}

/// When to perform a recurring action along the step counter.
#[derive(Clone, Debug, PartialEq)]
pub enum StepFrequency {
    Never,
    Always,
    Exactly(u64),
    Every(u64),
    Range(u64, Option<u64>),
}

impl StepFrequency {
    /// Whether the action should trigger at step `m`.
    pub fn should_trigger_at(&self, m: u64) -> bool {
        match self {
            StepFrequency::Never => false,
            StepFrequency::Always => true,
            StepFrequency::Exactly(n) => *n == m,
            StepFrequency::Every(n) => m % *n == 0,
            StepFrequency::Range(lo, hi_opt) => m >= *lo && hi_opt.map_or(true, |hi| m < hi),
        }
    }
}

impl FromStr for StepFrequency {
    type Err = String;

    // A frequency is either
    // - never/always
    // - =<n> (only at step n)
    // - %<n> (every step multiple of n)
    // - n..[m] (from n on, until m excluded if specified)
    fn from_str(s: &str) -> Result<StepFrequency, String> {
        use StepFrequency::*;

        if s == "never" {
            return Ok(Never);
        }
        if s == "always" {
            return Ok(Always);
        }
        let eq_re = Regex::new(r"^=([0-9]+)$").unwrap();
        let mod_re = Regex::new(r"^%([0-9]+)$").unwrap();
        let ival_re = Regex::new(r"^([0-9]+)\.\.([0-9]+)?$").unwrap();
        if let Some(c) = eq_re.captures(s) {
            Ok(Exactly(c[1].parse::<u64>().map_err(|e| e.to_string())?))
        } else if let Some(c) = mod_re.captures(s) {
            Ok(Every(c[1].parse::<u64>().map_err(|e| e.to_string())?))
        } else if let Some(c) = ival_re.captures(s) {
            let lo = c[1].parse::<u64>().map_err(|e| e.to_string())?;
            let hi = match c.get(2) {
                Some(m) => Some(m.as_str().parse::<u64>().map_err(|e| e.to_string())?),
                None => None,
            };
            Ok(Range(lo, hi))
        } else {
            Err(format!("unknown frequency format {}", s))
        }
    }
}

/// External program serving the preimage and hint channels over the client
/// file descriptors 3..=6.
#[derive(Debug, Clone)]
pub struct HostProgram {
    pub name: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VmConfiguration {
    pub input_state_file: String,
    pub output_state_file: String,
    pub metadata_file: Option<String>,
    pub proof_at: StepFrequency,
    pub stop_at: StepFrequency,
    pub snapshot_state_at: StepFrequency,
    pub info_at: StepFrequency,
    pub proof_fmt: String,
    pub snapshot_fmt: String,
    pub halt_address: Option<u64>,
    pub host: Option<HostProgram>,
}

impl Default for VmConfiguration {
    fn default() -> Self {
        VmConfiguration {
            input_state_file: "state.json".to_string(),
            output_state_file: "out.json".to_string(),
            metadata_file: None,
            proof_at: StepFrequency::Never,
            stop_at: StepFrequency::Never,
            snapshot_state_at: StepFrequency::Never,
            info_at: StepFrequency::Never,
            proof_fmt: "proof-%d.json".to_string(),
            snapshot_fmt: "state-%d.json".to_string(),
            halt_address: None,
            host: None,
        }
    }
}

/// Wall-clock anchor for instructions-per-second reporting.
#[derive(Debug, Clone)]
pub struct Start {
    pub time: std::time::Instant,
    pub step: usize,
}

impl Start {
    pub fn create(step: usize) -> Start {
        Start {
            time: std::time::Instant::now(),
            step,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub start: u64,
    pub size: usize,
}

/// Program metadata: the symbol table of the loaded ELF, used to label
/// program counters in the info log.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Meta {
    #[serde(deserialize_with = "filtered_ordered")]
    pub symbols: Vec<Symbol>, // ascending by start address
}

// Drop 0-size symbols and sort what remains by start address, so lookups can
// binary-search.
fn filtered_ordered<'de, D>(deserializer: D) -> Result<Vec<Symbol>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Vec<Symbol> = Deserialize::deserialize(deserializer)?;
    let mut filtered: Vec<Symbol> = v.into_iter().filter(|e| e.size != 0).collect();
    filtered.sort_by(|a, b| a.start.cmp(&b.start));
    Ok(filtered)
}

impl Meta {
    pub fn find_address_symbol(&self, address: u64) -> Option<String> {
        use std::cmp::Ordering;

        self.symbols
            .binary_search_by(|sym| {
                if address < sym.start {
                    Ordering::Greater
                } else if address >= sym.start + sym.size as u64 {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .ok()
            .map(|idx| self.symbols[idx].name.to_string())
    }
}

pub struct Preimage(Vec<u8>);

impl Preimage {
    pub fn create(v: Vec<u8>) -> Self {
        Preimage(v)
    }

    pub fn get(self) -> Vec<u8> {
        self.0
    }
}

pub struct Hint(Vec<u8>);

impl Hint {
    pub fn create(v: Vec<u8>) -> Self {
        Hint(v)
    }

    pub fn get(self) -> Vec<u8> {
        self.0
    }
}

impl Display for StepFrequency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StepFrequency::Never => write!(f, "never"),
            StepFrequency::Always => write!(f, "always"),
            StepFrequency::Exactly(n) => write!(f, "={n}"),
            StepFrequency::Every(n) => write!(f, "%{n}"),
            StepFrequency::Range(lo, None) => write!(f, "{lo}.."),
            StepFrequency::Range(lo, Some(hi)) => write!(f, "{lo}..{hi}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sf_parser() {
        use StepFrequency::*;
        assert_eq!(StepFrequency::from_str("never"), Ok(Never));
        assert_eq!(StepFrequency::from_str("always"), Ok(Always));
        assert_eq!(StepFrequency::from_str("=123"), Ok(Exactly(123)));
        assert_eq!(StepFrequency::from_str("%123"), Ok(Every(123)));
        assert_eq!(StepFrequency::from_str("1..3"), Ok(Range(1, Some(3))));
        assert_eq!(StepFrequency::from_str("1.."), Ok(Range(1, None)));
        assert!(StepFrequency::from_str("@123").is_err());
    }

    #[test]
    fn sf_triggers() {
        assert!(!StepFrequency::Never.should_trigger_at(0));
        assert!(StepFrequency::Always.should_trigger_at(7));
        assert!(StepFrequency::Exactly(7).should_trigger_at(7));
        assert!(!StepFrequency::Exactly(7).should_trigger_at(8));
        assert!(StepFrequency::Every(4).should_trigger_at(8));
        assert!(StepFrequency::Range(5, None).should_trigger_at(1000));
        assert!(!StepFrequency::Range(5, Some(10)).should_trigger_at(10));
    }

    #[test]
    fn test_parse_preimagekey() {
        assert_eq!(
            PreimageKey::from_str(
                "0x0000000000000000000000000000000000000000000000000000000000000001"
            ),
            Ok(PreimageKey({
                let mut k = [0u8; 32];
                k[31] = 1;
                k
            }))
        );
        assert!(PreimageKey::from_str("0x01").is_err());
    }

    #[test]
    fn test_page_roundtrip() {
        let page = Page {
            index: 16,
            data: (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect(),
        };
        let json = serde_json::to_string(&page).unwrap();
        let decoded: Page = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.index, page.index);
        assert_eq!(decoded.data, page.data);
    }

    const META_SAMPLE: &str = r#"{
  "symbols": [
    { "name": "go.go", "start": 0, "size": 0 },
    { "name": "internal/cpu.processOptions", "start": 69632, "size": 1872 },
    { "name": "runtime.text", "start": 69632, "size": 0 },
    { "name": "runtime/internal/atomic.(*Uint8).Load", "start": 71504, "size": 28 }
  ]}"#;

    #[test]
    fn test_find_address_symbol() {
        let meta: Meta = serde_json::from_str(META_SAMPLE).unwrap();
        // 0-size symbols are dropped by deserialization
        assert_eq!(meta.symbols.len(), 2);
        assert_eq!(
            meta.find_address_symbol(69632),
            Some("internal/cpu.processOptions".to_string())
        );
        assert_eq!(
            meta.find_address_symbol(69633),
            Some("internal/cpu.processOptions".to_string())
        );
        assert_eq!(meta.find_address_symbol(42), None);
    }
}
