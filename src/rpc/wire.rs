//! Wire encoding.
//!
//! Frames are a single line of ASCII text: an RPC name, a space, then a
//! `:`-delimited list of fields, terminated by `\n`. Page contents are
//! carried as lower-case hex. Replies are one line: `OK` or `OK:<fields>`
//! on success, `NOT_OK:<reason>` on failure.

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};

/// A single outgoing or incoming request frame, already split into its
/// name and colon-delimited fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The RPC name, e.g. `"GET_RD_PAGE"`.
    pub name: String,
    /// The fields that followed the name, in order.
    pub fields: Vec<String>,
}

impl Frame {
    /// Builds a frame from a name and pre-formatted fields.
    #[must_use]
    pub fn new(name: &str, fields: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            fields,
        }
    }

    /// Serializes to the single-line wire form, without a trailing
    /// newline (the transport appends it).
    #[must_use]
    pub fn to_line(&self) -> String {
        if self.fields.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.fields.join(":"))
        }
    }

    /// Parses a single line (without its trailing newline) back into a
    /// frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RpcProtocol`] if the line is empty.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(2, ' ');
        let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            Error::RpcProtocol {
                name: "<unknown>",
                reason: "empty request line".to_owned(),
            }
        })?;
        let fields = parts
            .next()
            .map(|rest| rest.split(':').map(str::to_owned).collect())
            .unwrap_or_default();

        Ok(Self {
            name: name.to_owned(),
            fields,
        })
    }
}

/// A parsed reply line: either the success fields, or a failure reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK` or `OK:<fields>`.
    Ok(Vec<String>),
    /// `NOT_OK:<reason>`.
    NotOk(String),
}

impl Reply {
    /// Serializes to the single-line wire form, without a trailing
    /// newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Ok(fields) if fields.is_empty() => "OK".to_owned(),
            Self::Ok(fields) => format!("OK:{}", fields.join(":")),
            Self::NotOk(reason) => format!("NOT_OK:{reason}"),
        }
    }

    /// Parses a single line (without its trailing newline) back into a
    /// reply.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        line.strip_prefix("NOT_OK:").map_or_else(
            || {
                line.strip_prefix("OK:").map_or_else(
                    || Self::Ok(Vec::new()),
                    |rest| Self::Ok(rest.split(':').map(str::to_owned).collect()),
                )
            },
            |reason| Self::NotOk(reason.to_owned()),
        )
    }
}

/// Encodes a page's raw bytes as lower-case hex.
#[must_use]
pub fn encode_page(bytes: &[u8; PAGE_SIZE]) -> String {
    let mut out = String::with_capacity(PAGE_SIZE * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Decodes a lower-case hex page back into raw bytes.
///
/// # Errors
///
/// Returns [`Error::RpcProtocol`] if `s` is not exactly `PAGE_SIZE * 2`
/// valid hex characters.
pub fn decode_page(s: &str) -> Result<[u8; PAGE_SIZE]> {
    if s.len() != PAGE_SIZE * 2 {
        return Err(Error::RpcProtocol {
            name: "<page>",
            reason: format!("expected {} hex chars, got {}", PAGE_SIZE * 2, s.len()),
        });
    }

    let mut buf = [0_u8; PAGE_SIZE];
    for (i, byte) in buf.iter_mut().enumerate() {
        let hex = s.get(i * 2..i * 2 + 2).ok_or_else(|| Error::RpcProtocol {
            name: "<page>",
            reason: "truncated hex page".to_owned(),
        })?;
        *byte = u8::from_str_radix(hex, 16).map_err(|e| Error::RpcProtocol {
            name: "<page>",
            reason: format!("invalid hex byte {hex:?}: {e}"),
        })?;
    }

    Ok(buf)
}
