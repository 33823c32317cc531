use crate::token::OfflineToken;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode: {0}")]
    EncodeError(String),

    #[error("Failed to decode: {0}")]
    DecodeError(String),

    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Invalid base64 string: {0}")]
    InvalidBase64(String),
}

/// Compact postcard encoding of any wire type
pub fn to_wire<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::EncodeError(e.to_string()))
}

pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::DecodeError(e.to_string()))
}

/// Codec for moving tokens between devices as bytes, hex or base64
pub struct TokenCodec;

impl TokenCodec {
    pub fn encode(token: &OfflineToken) -> Result<Vec<u8>, CodecError> {
        to_wire(token)
    }

    pub fn decode(bytes: &[u8]) -> Result<OfflineToken, CodecError> {
        from_wire(bytes)
    }

    pub fn encode_hex(token: &OfflineToken) -> Result<String, CodecError> {
        Ok(hex::encode(Self::encode(token)?))
    }

    pub fn decode_hex(hex_str: &str) -> Result<OfflineToken, CodecError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }

    /// URL-safe base64 without padding, for QR codes and deep links
    pub fn encode_base64(token: &OfflineToken) -> Result<String, CodecError> {
        Ok(URL_SAFE_NO_PAD.encode(Self::encode(token)?))
    }

    pub fn decode_base64(b64_str: &str) -> Result<OfflineToken, CodecError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(b64_str.trim())
            .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
        Self::decode(&bytes)
    }

    /// JSON form used by the sync wire protocol and for debugging
    pub fn to_json(token: &OfflineToken) -> Result<String, CodecError> {
        serde_json::to_string(token).map_err(|e| CodecError::EncodeError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<OfflineToken, CodecError> {
        serde_json::from_str(json).map_err(|e| CodecError::DecodeError(e.to_string()))
    }
}
