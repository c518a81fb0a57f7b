//! Wire format of `Command` payloads on the replicated log.
//!
//! Layout: one format tag byte followed by a bincode (standard config) body.
//! The log is the durable source of truth, so `decode` is strict: anything it
//! cannot reproduce exactly is a `RavelError::Decode`.

use ravel_types::{Command, RavelError};

/// Current payload format tag.
pub const FORMAT_V1: u8 = 1;

/// Upper bound on a decoded body. Guards against corrupt length prefixes.
pub const MAX_COMMAND_BYTES: usize = 64 * 1024 * 1024;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_COMMAND_BYTES>()
}

pub fn encode(cmd: &Command) -> Result<Vec<u8>, RavelError> {
    let mut buf = vec![FORMAT_V1];
    let body = bincode::serde::encode_to_vec(cmd, config())
        .map_err(|e| RavelError::Storage(e.to_string()))?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Command, RavelError> {
    let (tag, body) = bytes
        .split_first()
        .ok_or_else(|| RavelError::Decode("empty payload".into()))?;
    if *tag != FORMAT_V1 {
        return Err(RavelError::Decode(format!("unknown format tag {tag}")));
    }
    let (cmd, read) = bincode::serde::decode_from_slice::<Command, _>(body, config())
        .map_err(|e| RavelError::Decode(e.to_string()))?;
    if read != body.len() {
        return Err(RavelError::Decode(format!(
            "{} trailing bytes after command",
            body.len() - read
        )));
    }
    Ok(cmd)
}
