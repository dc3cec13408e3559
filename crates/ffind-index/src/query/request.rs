//! Binary request protocol.
//!
//! One request per connection, length-prefixed fields, multibyte
//! integers in network byte order:
//!
//! ```text
//! u32 name_pat_len ; name_pat bytes
//! u32 path_pat_len ; path_pat bytes
//! u32 content_pat_len ; content_pat bytes
//! u8  flags                 ; bit0 case-insensitive, bit1 regex, bit2 glob
//! u8  type_filter           ; 0 any, 1 files, 2 directories
//! u8  size_op  [i64 size_val when != 0]    ; 1 less, 2 equal, 3 greater
//! u8  mtime_op [i32 mtime_days when != 0]
//! u8  before_ctx
//! u8  after_ctx
//! ```
//!
//! Trailing single-byte fields may be absent (older clients); they
//! default to zero.

use std::io::{self, Read};

/// Upper bound on any single pattern field.
pub const MAX_PATTERN_BYTES: usize = 1024 * 1024;

const FLAG_CASE_INSENSITIVE: u8 = 1;
const FLAG_CONTENT_REGEX: u8 = 2;
const FLAG_CONTENT_GLOB: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    Equal,
    Greater,
}

impl CompareOp {
    fn from_wire(op: u8) -> Option<Self> {
        match op {
            1 => Some(Self::Less),
            2 => Some(Self::Equal),
            3 => Some(Self::Greater),
            _ => None,
        }
    }

    pub fn compare(self, left: i64, right: i64) -> bool {
        match self {
            Self::Less => left < right,
            Self::Equal => left == right,
            Self::Greater => left > right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeFilter {
    #[default]
    Any,
    Files,
    Directories,
}

impl TypeFilter {
    fn from_wire(value: u8) -> Self {
        match value {
            1 => Self::Files,
            2 => Self::Directories,
            _ => Self::Any,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub name_pat: String,
    pub path_pat: String,
    pub content_pat: String,
    pub case_insensitive: bool,
    pub content_regex: bool,
    pub content_glob: bool,
    pub type_filter: TypeFilter,
    pub size: Option<(CompareOp, i64)>,
    pub mtime: Option<(CompareOp, i32)>,
    pub before_ctx: u8,
    pub after_ctx: u8,
}

impl QueryRequest {
    pub fn has_content(&self) -> bool {
        !self.content_pat.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Name pattern too large")]
    NameTooLarge,
    #[error("Path pattern too large")]
    PathTooLarge,
    #[error("Content pattern too large")]
    ContentTooLarge,
    #[error("Invalid regex pattern")]
    InvalidRegex,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// The single error line owed to the client, when one is. Transport
    /// failures just close the connection.
    pub fn client_line(&self) -> Option<&'static str> {
        match self {
            Self::NameTooLarge => Some("Name pattern too large"),
            Self::PathTooLarge => Some("Path pattern too large"),
            Self::ContentTooLarge => Some("Content pattern too large"),
            Self::InvalidRegex => Some("Invalid regex pattern"),
            Self::Io(_) => None,
        }
    }
}

pub fn read_request<R: Read>(reader: &mut R) -> Result<QueryRequest, RequestError> {
    let name_pat = read_pattern(reader, RequestError::NameTooLarge)?;
    let path_pat = read_pattern(reader, RequestError::PathTooLarge)?;
    let content_pat = read_pattern(reader, RequestError::ContentTooLarge)?;

    let flags = read_u8_or_zero(reader)?;
    let type_filter = TypeFilter::from_wire(read_u8_or_zero(reader)?);

    // The value field is present whenever the op byte is nonzero, even
    // when the byte is not a recognized operator; it must be consumed
    // either way or every later field slips.
    let size_op = read_u8_or_zero(reader)?;
    let size = if size_op != 0 {
        let value = read_i64(reader)?;
        CompareOp::from_wire(size_op).map(|op| (op, value))
    } else {
        None
    };
    let mtime_op = read_u8_or_zero(reader)?;
    let mtime = if mtime_op != 0 {
        let days = read_i32(reader)?;
        CompareOp::from_wire(mtime_op).map(|op| (op, days))
    } else {
        None
    };

    let before_ctx = read_u8_or_zero(reader)?;
    let after_ctx = read_u8_or_zero(reader)?;

    Ok(QueryRequest {
        name_pat,
        path_pat,
        content_pat,
        case_insensitive: flags & FLAG_CASE_INSENSITIVE != 0,
        content_regex: flags & FLAG_CONTENT_REGEX != 0,
        content_glob: flags & FLAG_CONTENT_GLOB != 0,
        type_filter,
        size,
        mtime,
        before_ctx,
        after_ctx,
    })
}

fn read_pattern<R: Read>(
    reader: &mut R,
    oversize: RequestError,
) -> Result<String, RequestError> {
    let len = read_u32(reader)? as usize;
    if len > MAX_PATTERN_BYTES {
        return Err(oversize);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, RequestError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64, RequestError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, RequestError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Single-byte fields past the patterns default to zero when the
/// client sent a shorter request.
fn read_u8_or_zero<R: Read>(reader: &mut R) -> Result<u8, RequestError> {
    let mut buf = [0u8; 1];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(buf[0]),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Err(err) => Err(err.into()),
    }
}
