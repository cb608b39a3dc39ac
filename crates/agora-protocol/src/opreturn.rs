//! OP_RETURN script building and parsing for anchor payloads.
//!
//! Layout: `OP_RETURN <push: protocol tag> <push: JSON payload>`.
//! Pushes use the smallest encoding that fits: a single length byte up to 75,
//! OP_PUSHDATA1 up to 255, OP_PUSHDATA2 (little-endian u16) up to 65535.
//! Larger payloads are rejected; there is no OP_PUSHDATA4 support.

use serde_json::Value;

use crate::constants::MAX_PUSHDATA_LEN;
use crate::error::ProtocolError;

const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;

/// Length-prefix `data` with the smallest pushdata encoding that fits.
pub fn push_data(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = data.len();
    let mut out = Vec::with_capacity(len + 3);
    if len <= 75 {
        out.push(len as u8);
    } else if len <= 255 {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= MAX_PUSHDATA_LEN {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        return Err(ProtocolError::PushdataTooLarge { size: len, limit: MAX_PUSHDATA_LEN });
    }
    out.extend_from_slice(data);
    Ok(out)
}

/// Build the OP_RETURN locking script carrying a protocol tag and a JSON
/// payload.
pub fn build_op_return(tag: &str, payload: &Value) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_string(payload)
        .map_err(|e| ProtocolError::JsonEncode(e.to_string()))?;
    let mut script = vec![OP_RETURN];
    script.extend(push_data(tag.as_bytes())?);
    script.extend(push_data(json.as_bytes())?);
    Ok(script)
}

/// Read one pushdata item starting at `offset`. Returns the data and the
/// offset just past it.
fn read_push(script: &[u8], offset: usize) -> Result<(&[u8], usize), ProtocolError> {
    let truncated = || ProtocolError::TruncatedPushdata { offset };
    let op = *script.get(offset).ok_or_else(truncated)?;
    let (len, data_start) = match op {
        n if n <= 75 => (n as usize, offset + 1),
        OP_PUSHDATA1 => {
            let len = *script.get(offset + 1).ok_or_else(truncated)? as usize;
            (len, offset + 2)
        }
        OP_PUSHDATA2 => {
            let lo = *script.get(offset + 1).ok_or_else(truncated)? as usize;
            let hi = *script.get(offset + 2).ok_or_else(truncated)? as usize;
            (lo | (hi << 8), offset + 3)
        }
        _ => return Err(truncated()),
    };
    let end = data_start + len;
    if end > script.len() {
        return Err(truncated());
    }
    Ok((&script[data_start..end], end))
}

/// Parse an anchor payload back out of an OP_RETURN locking script.
///
/// Returns the tag and the decoded JSON payload. Scripts that are not
/// OP_RETURN, are truncated, or carry non-JSON data are rejected.
pub fn parse_op_return(script: &[u8]) -> Result<(String, Value), ProtocolError> {
    if script.first() != Some(&OP_RETURN) {
        return Err(ProtocolError::NotOpReturn);
    }
    let (tag, next) = read_push(script, 1)?;
    let (json_bytes, _) = read_push(script, next)?;
    let payload: Value = serde_json::from_slice(json_bytes)
        .map_err(|e| ProtocolError::JsonEncode(e.to_string()))?;
    Ok((String::from_utf8_lossy(tag).into_owned(), payload))
}
