//! Defines helper methods for serializing and deserializing external
//! types.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serializer, de};

pub fn ser_bytes<S>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&BASE64.encode(bytes))
}

pub fn de_bytes<'de, D>(d: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    BASE64.decode(&string).map_err(de::Error::custom)
}

pub fn ser_opt_bytes<S>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match bytes {
        Some(bytes) => s.serialize_some(&BASE64.encode(bytes)),
        None => s.serialize_none(),
    }
}

pub fn de_opt_bytes<'de, D>(d: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let string: Option<String> = Option::deserialize(d)?;
    match string {
        Some(string) => BASE64.decode(&string).map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}
