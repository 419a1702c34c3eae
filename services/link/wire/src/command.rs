//! Fixed command table: ids, timeout classes and length rules.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::WireError;

/// Remote filesystem commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Open a remote file
    Open = 0,
    /// Release a remote file handle
    Release = 1,
    /// Read one page
    Readpage = 2,
    /// Write one page
    Writepage = 3,
    /// Read a directory
    Iterate = 4,
    /// Remove a directory
    Rmdir = 5,
    /// Create a file
    Create = 6,
    /// Create a directory
    Mkdir = 7,
    /// Unlink a file
    Unlink = 8,
    /// Rename an entry
    Rename = 9,
    /// Change attributes
    Setattr = 10,
    /// Liveness echo
    ConnectEcho = 11,
    /// Filesystem statistics
    Statfs = 12,
    /// Rotate link keys
    ConnectRekey = 13,
    /// Drop pushed data
    DropPush = 14,
    /// Fetch attributes
    Getattr = 15,
    /// Flush a file
    Fsync = 16,
    /// Flush the filesystem
    Syncfs = 17,
    /// Read an extended attribute
    Getxattr = 18,
    /// Write an extended attribute
    Setxattr = 19,
    /// List extended attributes
    Listxattr = 20,
    /// Read several pages
    Readpages = 21,
    /// Open and read several pages
    ReadpagesOpen = 22,
    /// Lookup-and-open in one round trip
    AtomicOpen = 23,
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command::*;
        let cmd = match value {
            0 => Open,
            1 => Release,
            2 => Readpage,
            3 => Writepage,
            4 => Iterate,
            5 => Rmdir,
            6 => Create,
            7 => Mkdir,
            8 => Unlink,
            9 => Rename,
            10 => Setattr,
            11 => ConnectEcho,
            12 => Statfs,
            13 => ConnectRekey,
            14 => DropPush,
            15 => Getattr,
            16 => Fsync,
            17 => Syncfs,
            18 => Getxattr,
            19 => Setxattr,
            20 => Listxattr,
            21 => Readpages,
            22 => ReadpagesOpen,
            23 => AtomicOpen,
            _ => return Err(WireError::Command(value)),
        };
        Ok(cmd)
    }
}

/// Timeout class of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutClass {
    /// Default round trip
    Common,
    /// Thirty seconds
    Secs30,
    /// Ninety seconds
    Secs90,
    /// No response expected
    None,
}

impl TimeoutClass {
    /// Duration of this class, `None` for fire-and-forget commands
    pub fn duration(self, common: Duration) -> Option<Duration> {
        match self {
            TimeoutClass::Common => Some(common),
            TimeoutClass::Secs30 => Some(Duration::from_secs(30)),
            TimeoutClass::Secs90 => Some(Duration::from_secs(90)),
            TimeoutClass::None => None,
        }
    }
}

/// How a length rule bounds the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenJudge {
    /// Length must equal either bound
    Bin,
    /// Length must lie within the bounds
    Range,
}

/// Payload length rule for one direction of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthRule {
    /// Lower bound
    pub min: usize,
    /// Upper bound
    pub max: usize,
    /// Judgement kind
    pub judge: LenJudge,
}

impl LengthRule {
    const fn bin(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            judge: LenJudge::Bin,
        }
    }

    /// Whether `len` satisfies this rule
    pub fn accepts(&self, len: usize) -> bool {
        match self.judge {
            LenJudge::Bin => len == self.min || len == self.max,
            LenJudge::Range => (self.min..=self.max).contains(&len),
        }
    }
}

impl Command {
    /// Timeout class of this command
    pub fn timeout_class(self) -> TimeoutClass {
        use Command::*;
        match self {
            Release | ConnectRekey | DropPush => TimeoutClass::None,
            Iterate | Syncfs => TimeoutClass::Secs30,
            Fsync => TimeoutClass::Secs90,
            _ => TimeoutClass::Common,
        }
    }

    /// Length rule for requests (`response == false`) or responses
    pub fn length_rule(self, response: bool) -> Option<LengthRule> {
        match (self, response) {
            (Command::ConnectEcho, _) => Some(LengthRule::bin(EchoParam::SIZE, EchoParam::SIZE)),
            (Command::ConnectRekey, false) => Some(LengthRule::bin(4, 4)),
            (Command::Fsync, true) => Some(LengthRule::bin(0, 0)),
            _ => None,
        }
    }

    /// Check a payload length against this command's rule
    pub fn verify(self, response: bool, len: usize) -> Result<(), WireError> {
        match self.length_rule(response) {
            Some(rule) if !rule.accepts(len) => Err(WireError::Verify {
                command: self as u8,
                len,
            }),
            _ => Ok(()),
        }
    }
}

/// Echo request and response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoParam {
    /// Instance id of the sender
    pub iid: u64,
    /// Always 1
    pub length: u64,
}

impl EchoParam {
    /// Encoded size
    pub const SIZE: usize = 16;

    /// Create an echo body for `iid`
    pub fn new(iid: u64) -> Self {
        Self { iid, length: 1 }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.iid);
        buf.put_u64_le(self.length);
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE {
            return Err(WireError::Size(buf.len()));
        }
        Ok(Self {
            iid: buf.get_u64_le(),
            length: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(11).unwrap(), Command::ConnectEcho);
        assert_eq!(Command::try_from(23).unwrap(), Command::AtomicOpen);
        assert_eq!(Command::try_from(24), Err(WireError::Command(24)));
    }

    #[test]
    fn test_timeout_table() {
        let common = Duration::from_secs(4);
        assert_eq!(Command::Open.timeout_class().duration(common), Some(common));
        assert_eq!(
            Command::Iterate.timeout_class().duration(common),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            Command::Fsync.timeout_class().duration(common),
            Some(Duration::from_secs(90))
        );
        assert_eq!(Command::Release.timeout_class().duration(common), None);
        assert_eq!(Command::DropPush.timeout_class(), TimeoutClass::None);
    }

    #[test]
    fn test_echo_length_rule() {
        assert!(Command::ConnectEcho.verify(false, 16).is_ok());
        assert!(Command::ConnectEcho.verify(true, 16).is_ok());
        assert!(Command::ConnectEcho.verify(false, 15).is_err());
        assert!(Command::Open.verify(false, 4096).is_ok());
    }

    #[test]
    fn test_range_rule() {
        let rule = LengthRule {
            min: 8,
            max: 16,
            judge: LenJudge::Range,
        };
        assert!(rule.accepts(12));
        assert!(!rule.accepts(17));
        assert!(LengthRule::bin(0, 8).accepts(0));
        assert!(!LengthRule::bin(0, 8).accepts(4));
    }

    #[test]
    fn test_echo_param() {
        let param = EchoParam::new(42);
        let bytes = param.encode();
        assert_eq!(bytes.len(), EchoParam::SIZE);
        assert_eq!(EchoParam::decode(&bytes).unwrap(), param);
        assert!(EchoParam::decode(&bytes[..8]).is_err());
    }
}
