//! Value codec
//!
//! Engines persist values as a generic JSON tree. Callers hand in and get
//! back their own typed values; this module is the only place the two meet.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Convert a typed value into the generic tree
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Convert the generic tree into a typed value
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Decode raw JSON text into a typed value
pub fn decode_str<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// A value handed to `Store::each` visitors. Decoding is deferred until the
/// visitor asks for it, so visitors that only look at keys pay nothing.
#[derive(Debug, Clone, Copy)]
pub enum ValueDecoder<'a> {
    /// Already parsed tree (in-memory engines)
    Tree(&'a Value),
    /// Raw JSON text as stored on disk
    Json(&'a str),
}

impl ValueDecoder<'_> {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Tree(value) => Ok(T::deserialize(*value)?),
            Self::Json(json) => decode_str(json),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        match self {
            Self::Tree(value) => Ok((*value).clone()),
            Self::Json(json) => decode_str(json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cursor {
        offset: u64,
        source: String,
    }

    #[test]
    fn test_typed_value_through_tree() {
        let cursor = Cursor {
            offset: 4096,
            source: "/var/log/syslog".into(),
        };
        let tree = encode(&cursor).unwrap();
        assert_eq!(tree, json!({"offset": 4096, "source": "/var/log/syslog"}));
        assert_eq!(decode::<Cursor>(tree).unwrap(), cursor);
    }

    #[test]
    fn test_decoder_variants_agree() {
        let tree = json!({"offset": 7, "source": "a"});
        let text = tree.to_string();

        let from_tree: Cursor = ValueDecoder::Tree(&tree).decode().unwrap();
        let from_json: Cursor = ValueDecoder::Json(&text).decode().unwrap();
        assert_eq!(from_tree, from_json);
        assert_eq!(ValueDecoder::Json(&text).to_value().unwrap(), tree);
    }

    #[test]
    fn test_decode_type_mismatch() {
        let tree = json!({"offset": "not a number", "source": "a"});
        assert!(ValueDecoder::Tree(&tree).decode::<Cursor>().is_err());
    }
}
