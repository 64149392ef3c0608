//! Serialize and deserialize data into JSON format.

use crate::Error;

/// The object can be serialized and deserialized into JSON.
pub trait JsonSer: Sized {
    fn save(&self) -> json::JsonValue;

    fn load(obj: &json::JsonValue) -> Result<Self, Error>;
}

/// Extracts required values from a JSON object, converting them with `json::JsonValue` getters.
///
/// ```ignore
/// json_get!(obj -> chunk_size_cm (as_f64), max_retries (as_u32));
/// ```
macro_rules! json_get {
    ($obj:ident -> $($key:ident ($fun:ident)),+ $(,)?) => {
        $(
            let $key = $obj[stringify!($key)].$fun().ok_or_else(|| $crate::Error::JsonLoad(
                format!("Failed to parse '{}': missing or incorrect '{}'", $obj, stringify!($key))))?;
        )+
    };
}
pub(crate) use json_get;

/// Parses enum-like value from a JSON string field.
pub fn parse_str<T>(obj: &json::JsonValue, key: &str) -> Result<T, Error>
where T: std::str::FromStr<Err = String>,
{
    obj[key].as_str()
        .ok_or_else(|| Error::JsonLoad(format!("Failed to parse '{}': missing or incorrect '{}'", obj, key)))?
        .parse()
        .map_err(|e: String| Error::JsonLoad(format!("Failed to parse '{}': {}", key, e)))
}
