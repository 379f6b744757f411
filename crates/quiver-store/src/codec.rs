//! Deterministic, schema-versioned entity encoding.
//!
//! One version byte followed by a canonical JSON body. Attribute maps
//! keep insertion order, so encode/decode round-trips byte-for-byte, and
//! unknown fields survive via the entities' flattened extras.

use quiver_types::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const CODEC_VERSION: u8 = 1;

pub fn encode<T: Serialize>(entity: &T) -> Result<Vec<u8>> {
    let mut out = vec![CODEC_VERSION];
    serde_json::to_writer(&mut out, entity)
        .map_err(|err| Error::Internal(format!("encode: {err}")))?;
    Ok(out)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&CODEC_VERSION, body)) => {
            serde_json::from_slice(body).map_err(|err| Error::Internal(format!("decode: {err}")))
        }
        Some((&version, _)) => {
            Err(Error::Internal(format!("unsupported codec version: {version}")))
        }
        None => Err(Error::Internal("empty record".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use quiver_types::{Connection, Doc, Ref};
    use serde_json::{Map, Value};

    use super::*;

    #[test]
    fn test_doc_round_trip_exact() {
        let mut attrs = Map::new();
        attrs.insert("name".to_string(), Value::from("Charlie"));
        attrs.insert("weight".to_string(), Value::from(25));
        let doc = Doc::new(Ref::new("dog", "charlie")).with_attributes(attrs);

        let bytes = encode(&doc).unwrap();
        assert_eq!(bytes[0], CODEC_VERSION);
        let decoded: Doc = decode(&bytes).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_connection_round_trip_exact() {
        let conn = Connection::new(
            Ref::new("owner", "e1"),
            Ref::new("dog", "charlie"),
            Ref::new("human", "alice"),
            true,
        );
        let bytes = encode(&conn).unwrap();
        let decoded: Connection = decode(&bytes).unwrap();
        assert_eq!(decoded, conn);
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let doc = Doc::new(Ref::new("dog", "charlie"));
        let mut bytes = encode(&doc).unwrap();
        bytes[0] = 99;
        assert!(decode::<Doc>(&bytes).is_err());
    }

    #[test]
    fn test_empty_record_rejected() {
        assert!(decode::<Doc>(&[]).is_err());
    }
}
