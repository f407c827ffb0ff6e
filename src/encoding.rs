//! Binary data encoding. Everything gavel stores or puts on the wire (log
//! entries, RPC envelopes, commands, command outputs, metadata) is encoded
//! with bincode through this module, so the whole crate agrees on one set of
//! options.

use crate::error::Result;

use bincode::Options as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The bincode options used for all encoding. Notably uses variable-length
/// integers, which the top-level bincode::serialize/deserialize functions
/// don't -- always go through this module, never bincode directly.
fn options() -> &'static bincode::DefaultOptions {
    static OPTIONS: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    OPTIONS.get_or_init(bincode::DefaultOptions::new)
}

/// Returns true if the error means the peer closed the stream mid-read,
/// rather than sending something malformed.
fn stream_closed(err: &bincode::ErrorKind) -> bool {
    let bincode::ErrorKind::Io(err) = err else {
        return false;
    };
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
    )
}

/// Adds automatic encoding and decoding to a type. Implemented by log
/// entries, RPC envelopes, client requests, and auction commands/outputs;
/// the protocol is invariant under the encoding choice.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value to a byte vector.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(options().serialize(self)?)
    }

    /// Decodes the value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(options().deserialize(bytes)?)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        Ok(options().serialize_into(writer, self)?)
    }

    /// Decodes the value from a reader, or returns None if the reader is
    /// closed. Used to drain network connections one value at a time.
    fn maybe_decode_from<R: std::io::Read>(reader: R) -> Result<Option<Self>> {
        match options().deserialize_from(reader) {
            Ok(value) => Ok(Some(value)),
            Err(err) if stream_closed(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Encodes a value to a byte vector. For one-off payloads (e.g. metadata
/// tuples) that don't warrant a Value impl.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Decodes a value from a byte slice.
pub fn from_slice<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

/// Encodes a value into a writer.
pub fn to_writer<W: std::io::Write, T: Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(options().serialize_into(writer, value)?)
}

/// Decodes a value from a reader.
pub fn from_reader<R: std::io::Read, T: DeserializeOwned>(reader: R) -> Result<T> {
    Ok(options().deserialize_from(reader)?)
}
