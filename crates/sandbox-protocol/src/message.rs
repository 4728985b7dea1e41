//! Request/response structs and their validation

use core::fmt;
use core::mem::size_of;

use thiserror::Error;

/// Capacity of the path buffer, terminator included
pub const PATH_CAPACITY: usize = 260;

/// Operation tags. 0 is deliberately unused.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Ping = 1,
    Open = 2,
    Unlink = 3,
    Access = 4,
    GetEmulatorImage = 5,
    Fork = 6,
    ShMem = 7,
}

impl Op {
    /// Operations whose `path` field is meaningful
    pub fn takes_path(self) -> bool {
        matches!(self, Op::Open | Op::Unlink | Op::Access)
    }
}

impl TryFrom<u32> for Op {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => Op::Ping,
            2 => Op::Open,
            3 => Op::Unlink,
            4 => Op::Access,
            5 => Op::GetEmulatorImage,
            6 => Op::Fork,
            7 => Op::ShMem,
            other => return Err(ProtocolError::UnknownOp(other)),
        })
    }
}

/// Framing errors. Any of these on the broker side ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is {got} bytes, expected {expected}")]
    WrongSize { expected: usize, got: usize },

    #[error("unknown operation tag {0}")]
    UnknownOp(u32),

    #[error("path is not NUL-terminated")]
    Unterminated,

    #[error("path does not fit in {} bytes", PATH_CAPACITY)]
    PathTooLong,

    #[error("path contains a NUL byte")]
    InteriorNul,

    #[error("response echoes op {got}, expected {expected}")]
    OpMismatch { expected: u32, got: u32 },
}

/// Child → broker message.
///
/// For `Open`, `flags[0]` holds the open flags and `flags[1]` the mode.
/// For `Access`, `flags[0]` holds the access mode.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub op: u32,
    pub flags: [u32; 3],
    pub path: [u8; PATH_CAPACITY],
}

impl Request {
    pub const SIZE: usize = size_of::<Request>();

    /// Request without a path
    pub const fn new(op: Op) -> Self {
        Self {
            op: op as u32,
            flags: [0; 3],
            path: [0; PATH_CAPACITY],
        }
    }

    /// Request carrying `path`, which must leave room for the terminator.
    pub fn with_path(op: Op, path: &[u8]) -> Result<Self, ProtocolError> {
        if path.len() >= PATH_CAPACITY {
            return Err(ProtocolError::PathTooLong);
        }
        if path.contains(&0) {
            return Err(ProtocolError::InteriorNul);
        }
        let mut req = Self::new(op);
        req.path[..path.len()].copy_from_slice(path);
        Ok(req)
    }

    pub fn with_flags(mut self, flags: [u32; 3]) -> Self {
        self.flags = flags;
        self
    }

    pub fn op(&self) -> Result<Op, ProtocolError> {
        Op::try_from(self.op)
    }

    /// Path bytes up to (not including) the terminator
    pub fn path_bytes(&self) -> Result<&[u8], ProtocolError> {
        let end = self
            .path
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Unterminated)?;
        Ok(&self.path[..end])
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) of u32 fields followed by a u8 array, no padding
        unsafe { core::slice::from_raw_parts((self as *const Self).cast::<u8>(), Self::SIZE) }
    }

    /// Decode and validate one received datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::SIZE {
            return Err(ProtocolError::WrongSize {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }
        let mut req = Self::new(Op::Ping);
        req.op = read_u32(buf, 0);
        for (i, flag) in req.flags.iter_mut().enumerate() {
            *flag = read_u32(buf, 4 + 4 * i);
        }
        req.path.copy_from_slice(&buf[16..]);
        req.op()?;
        req.path_bytes()?;
        Ok(req)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path_bytes().unwrap_or(&self.path[..]);
        f.debug_struct("Request")
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("path", &format_args!("\"{}\"", path.escape_ascii()))
            .finish()
    }
}

/// Broker → child message. `err` is 0 or a positive errno.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub op: u32,
    pub err: i32,
}

impl Response {
    pub const SIZE: usize = size_of::<Response>();

    pub const fn ok(op: u32) -> Self {
        Self { op, err: 0 }
    }

    pub const fn error(op: u32, errno: i32) -> Self {
        Self { op, err: errno }
    }

    pub fn is_ok(&self) -> bool {
        self.err == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: two 4-byte fields, no padding
        unsafe { core::slice::from_raw_parts((self as *const Self).cast::<u8>(), Self::SIZE) }
    }

    /// Decode a response and check that it answers `expected`.
    pub fn decode(buf: &[u8], expected: Op) -> Result<Self, ProtocolError> {
        if buf.len() != Self::SIZE {
            return Err(ProtocolError::WrongSize {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }
        let rsp = Self {
            op: read_u32(buf, 0),
            err: read_u32(buf, 4) as i32,
        };
        if rsp.op != expected as u32 {
            return Err(ProtocolError::OpMismatch {
                expected: expected as u32,
                got: rsp.op,
            });
        }
        Ok(rsp)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(Request::SIZE, 276);
        assert_eq!(Response::SIZE, 8);
    }

    #[test]
    fn op_tags_round_trip() {
        for tag in 1..=7u32 {
            assert_eq!(Op::try_from(tag).unwrap() as u32, tag);
        }
        assert_eq!(Op::try_from(0), Err(ProtocolError::UnknownOp(0)));
        assert_eq!(Op::try_from(8), Err(ProtocolError::UnknownOp(8)));
    }

    #[test]
    fn request_decode_preserves_fields() {
        let req = Request::with_path(Op::Open, b"/tmp/x")
            .unwrap()
            .with_flags([0o101, 0o644, 7]);
        let back = Request::decode(req.as_bytes()).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.path_bytes().unwrap(), b"/tmp/x");
        assert_eq!(back.op().unwrap(), Op::Open);
    }

    #[test]
    fn every_path_length_below_capacity_round_trips() {
        let long = [b'a'; PATH_CAPACITY];
        for len in 0..PATH_CAPACITY {
            let req = Request::with_path(Op::Access, &long[..len]).unwrap();
            let back = Request::decode(req.as_bytes()).unwrap();
            assert_eq!(back.as_bytes(), req.as_bytes());
            assert_eq!(back.path_bytes().unwrap().len(), len);
        }
    }

    #[test]
    fn full_path_buffer_without_terminator_is_rejected() {
        let mut req = Request::new(Op::Open);
        req.path = [b'a'; PATH_CAPACITY];
        assert_eq!(
            Request::decode(req.as_bytes()),
            Err(ProtocolError::Unterminated)
        );
        assert_eq!(
            Request::with_path(Op::Open, &[b'a'; PATH_CAPACITY]),
            Err(ProtocolError::PathTooLong)
        );
    }

    #[test]
    fn decode_rejects_bad_framing() {
        let req = Request::new(Op::Ping);
        let bytes = req.as_bytes();
        assert_eq!(
            Request::decode(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::WrongSize {
                expected: 276,
                got: 275
            })
        );

        let mut bogus = req;
        bogus.op = 42;
        assert_eq!(
            Request::decode(bogus.as_bytes()),
            Err(ProtocolError::UnknownOp(42))
        );
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert_eq!(
            Request::with_path(Op::Unlink, b"/a\0b"),
            Err(ProtocolError::InteriorNul)
        );
    }

    #[test]
    fn response_checks_echo() {
        let rsp = Response::error(Op::Open as u32, 13);
        let back = Response::decode(rsp.as_bytes(), Op::Open).unwrap();
        assert_eq!(back.err, 13);
        assert!(!back.is_ok());
        assert!(matches!(
            Response::decode(rsp.as_bytes(), Op::Access),
            Err(ProtocolError::OpMismatch { .. })
        ));
    }
}
