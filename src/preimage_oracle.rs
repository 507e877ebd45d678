//! Preimage oracle interface used by the VM.
//!
//! The emulated program talks to the oracle through virtual file descriptors;
//! on the host side the oracle is either served in-process (tests) or by an
//! external host program spawned with the four channel pipes mapped onto its
//! file descriptors 3..=6.

use crate::{
    cannon::{
        Hint, HostProgram, Preimage, HINT_CLIENT_READ_FD, HINT_CLIENT_WRITE_FD,
        PREIMAGE_CLIENT_READ_FD, PREIMAGE_CLIENT_WRITE_FD,
    },
    error::VmError,
};
use command_fds::{CommandFdExt, FdMapping};
use log::debug;
use os_pipe::{PipeReader, PipeWriter};
use std::{
    io::{Read, Write},
    os::fd::AsRawFd,
    process::{Child, Command},
};

pub trait PreImageOracleT {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, VmError>;

    fn hint(&mut self, hint: Hint) -> Result<(), VmError>;
}

impl PreImageOracleT for Box<dyn PreImageOracleT> {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, VmError> {
        (**self).get_preimage(key)
    }

    fn hint(&mut self, hint: Hint) -> Result<(), VmError> {
        (**self).hint(hint)
    }
}

/// Oracle with no data. Hints are dropped; any preimage request fails.
pub struct NullPreImageOracle;

impl PreImageOracleT for NullPreImageOracle {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, VmError> {
        Err(VmError::OracleMissing { key })
    }

    fn hint(&mut self, _hint: Hint) -> Result<(), VmError> {
        Ok(())
    }
}

pub struct ReadWrite<R, W> {
    pub reader: R,
    pub writer: W,
}

pub struct RW(pub ReadWrite<PipeReader, PipeWriter>);

/// Oracle served by an external host program over two request/response
/// channels. Preimage requests are a 32-byte key answered by an 8-byte
/// big-endian length followed by the payload; hints are a 4-byte big-endian
/// length plus payload, acknowledged with a single byte.
pub struct PreImageOracle {
    pub cmd: Command,
    pub oracle_client: RW,
    pub hint_client: RW,
    // The child-side pipe ends must stay open until the host program has
    // been spawned and owns its copies.
    child_ends: Option<ChildEnds>,
}

struct ChildEnds {
    _hint_request_read: PipeReader,
    _hint_ack_write: PipeWriter,
    _key_read: PipeReader,
    _data_write: PipeWriter,
}

impl PreImageOracle {
    /// Set up the four pipes and the command, mapping the child-side ends on
    /// file descriptors 3..=6 of the host program.
    pub fn create(host_program: HostProgram) -> PreImageOracle {
        let mut cmd = Command::new(&host_program.name);
        cmd.args(&host_program.arguments);

        let (hint_request_read, hint_request_write) =
            os_pipe::pipe().expect("Could not create hint request pipe");
        let (hint_ack_read, hint_ack_write) =
            os_pipe::pipe().expect("Could not create hint ack pipe");
        let (key_read, key_write) = os_pipe::pipe().expect("Could not create preimage key pipe");
        let (data_read, data_write) = os_pipe::pipe().expect("Could not create preimage data pipe");

        // File descriptors 0, 1, 2 are the inherited stdin, stdout, stderr.
        // The host program reads requests on 3 and 5 and answers on 4 and 6.
        cmd.fd_mappings(vec![
            FdMapping {
                parent_fd: hint_request_read.as_raw_fd(),
                child_fd: HINT_CLIENT_READ_FD,
            },
            FdMapping {
                parent_fd: hint_ack_write.as_raw_fd(),
                child_fd: HINT_CLIENT_WRITE_FD,
            },
            FdMapping {
                parent_fd: key_read.as_raw_fd(),
                child_fd: PREIMAGE_CLIENT_READ_FD,
            },
            FdMapping {
                parent_fd: data_write.as_raw_fd(),
                child_fd: PREIMAGE_CLIENT_WRITE_FD,
            },
        ])
        .unwrap_or_else(|_| panic!("Could not map file descriptors to host program"));

        PreImageOracle {
            cmd,
            oracle_client: RW(ReadWrite {
                reader: data_read,
                writer: key_write,
            }),
            hint_client: RW(ReadWrite {
                reader: hint_ack_read,
                writer: hint_request_write,
            }),
            child_ends: Some(ChildEnds {
                _hint_request_read: hint_request_read,
                _hint_ack_write: hint_ack_write,
                _key_read: key_read,
                _data_write: data_write,
            }),
        }
    }

    pub fn start(&mut self) -> Child {
        // Spawning inherits the current process's stdin/stdout/stderr descriptors
        let child = self
            .cmd
            .spawn()
            .expect("Could not spawn pre-image oracle process");
        // the child owns duplicates of its pipe ends now
        self.child_ends.take();
        child
    }
}

impl PreImageOracleT for PreImageOracle {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, VmError> {
        let RW(ReadWrite { reader, writer }) = &mut self.oracle_client;
        writer.write_all(&key)?;
        writer.flush()?;
        let mut len_buf = [0u8; 8];
        reader.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf);
        let mut data = vec![0u8; len as usize];
        reader.read_exact(&mut data)?;
        debug!("fetched {len}-byte preimage for key 0x{}", hex::encode(key));
        Ok(Preimage::create(data))
    }

    fn hint(&mut self, hint: Hint) -> Result<(), VmError> {
        let RW(ReadWrite { reader, writer }) = &mut self.hint_client;
        let bytes = hint.get();
        writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        let mut ack = [0u8; 1];
        reader.read_exact(&mut ack)?;
        Ok(())
    }
}

/// Wraps an oracle with the length-prefixed stream view the `read` syscall
/// consumes, caching the last fetched preimage so a read loop over one key
/// fetches it only once. Also remembers what was read in the current step
/// for witness production.
pub struct TrackingPreimageOracle<PO: PreImageOracleT> {
    oracle: PO,

    /// Cached preimage data, including the 8-byte length prefix.
    last_preimage: Vec<u8>,
    /// Key of the cached preimage.
    last_preimage_key: [u8; 32],
    /// Offset last read from, or `None` if nothing was read this step.
    last_preimage_offset: Option<u64>,

    num_preimage_requests: usize,
    total_preimage_size: usize,
}

impl<PO: PreImageOracleT> TrackingPreimageOracle<PO> {
    pub fn new(oracle: PO) -> Self {
        TrackingPreimageOracle {
            oracle,
            last_preimage: Vec::new(),
            last_preimage_key: [0u8; 32],
            last_preimage_offset: None,
            num_preimage_requests: 0,
            total_preimage_size: 0,
        }
    }

    /// Forget the per-step read marker. Called at the start of every step.
    pub fn reset(&mut self) {
        self.last_preimage_offset = None;
    }

    /// Up to 32 bytes of the length-prefixed stream for `key`, starting at
    /// `offset`. The first 8 bytes of the stream are the big-endian payload
    /// length. The chunk is clamped to the end of the stream.
    pub fn read_preimage(&mut self, key: [u8; 32], offset: u64) -> Result<([u8; 32], u64), VmError> {
        if key != self.last_preimage_key {
            self.last_preimage_key = key;
            let data = self.oracle.get_preimage(key)?.get();
            self.num_preimage_requests += 1;
            self.total_preimage_size += data.len();
            let mut stream = Vec::with_capacity(8 + data.len());
            stream.extend_from_slice(&(data.len() as u64).to_be_bytes());
            stream.extend_from_slice(&data);
            self.last_preimage = stream;
        }
        self.last_preimage_offset = Some(offset);

        let mut dat = [0u8; 32];
        let offset = offset as usize;
        let available = self.last_preimage.len().saturating_sub(offset);
        let n = available.min(32);
        dat[..n].copy_from_slice(&self.last_preimage[offset..offset + n]);
        Ok((dat, n as u64))
    }

    pub fn hint(&mut self, hint: Hint) -> Result<(), VmError> {
        self.oracle.hint(hint)
    }

    /// What was read this step, for the step witness.
    pub fn last_preimage(&self) -> ([u8; 32], &[u8], Option<u64>) {
        (
            self.last_preimage_key,
            &self.last_preimage,
            self.last_preimage_offset,
        )
    }

    pub fn num_preimage_requests(&self) -> usize {
        self.num_preimage_requests
    }

    pub fn total_preimage_size(&self) -> usize {
        self.total_preimage_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapOracle(HashMap<[u8; 32], Vec<u8>>);

    impl PreImageOracleT for MapOracle {
        fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, VmError> {
            self.0
                .get(&key)
                .cloned()
                .map(Preimage::create)
                .ok_or(VmError::OracleMissing { key })
        }

        fn hint(&mut self, _hint: Hint) -> Result<(), VmError> {
            Ok(())
        }
    }

    fn oracle_with(key: [u8; 32], value: &[u8]) -> TrackingPreimageOracle<MapOracle> {
        let mut map = HashMap::new();
        map.insert(key, value.to_vec());
        TrackingPreimageOracle::new(MapOracle(map))
    }

    #[test]
    fn stream_is_length_prefixed() {
        let key = [1u8; 32];
        let mut oracle = oracle_with(key, b"hello world");
        let (dat, n) = oracle.read_preimage(key, 0).unwrap();
        assert_eq!(n, 8 + 11);
        assert_eq!(&dat[..8], &11u64.to_be_bytes());
        assert_eq!(&dat[8..19], b"hello world");
    }

    #[test]
    fn offset_walks_the_stream() {
        let key = [2u8; 32];
        let value: Vec<u8> = (0u8..100).collect();
        let mut oracle = oracle_with(key, &value);
        let (dat, n) = oracle.read_preimage(key, 8).unwrap();
        assert_eq!(n, 32);
        assert_eq!(&dat[..32], &value[0..32]);
        // clamped at the end of the stream
        let (dat, n) = oracle.read_preimage(key, 8 + 96).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&dat[..4], &value[96..]);
        assert_eq!(&dat[4..], &[0u8; 28]);
        // past the end
        let (_, n) = oracle.read_preimage(key, 8 + 100).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn preimage_is_fetched_once_per_key() {
        let key = [3u8; 32];
        let mut oracle = oracle_with(key, b"data");
        for offset in [0u64, 4, 8] {
            oracle.read_preimage(key, offset).unwrap();
        }
        assert_eq!(oracle.num_preimage_requests(), 1);
        assert_eq!(oracle.total_preimage_size(), 4);
    }

    #[test]
    fn missing_preimage_errors() {
        let mut oracle = TrackingPreimageOracle::new(MapOracle(HashMap::new()));
        assert!(matches!(
            oracle.read_preimage([9u8; 32], 0),
            Err(VmError::OracleMissing { .. })
        ));
    }

    #[test]
    fn reset_clears_read_marker() {
        let key = [4u8; 32];
        let mut oracle = oracle_with(key, b"xyz");
        oracle.read_preimage(key, 0).unwrap();
        assert!(oracle.last_preimage().2.is_some());
        oracle.reset();
        assert!(oracle.last_preimage().2.is_none());
        // the cached data survives the reset
        assert_eq!(oracle.last_preimage().1.len(), 8 + 3);
    }
}
