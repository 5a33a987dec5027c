//! `sourcekit-codec`: snapshot codec for aggregate state.
//!
//! Maps any `serde`-enabled aggregate body to a flat [`StateMap`]
//! (`field name → StateValue`) and back, without per-type mapping code and
//! without storing type names: the decoder recovers structure from the target
//! type.
//!
//! | Rust shape | Encoded as |
//! |---|---|
//! | integers, floats, `bool`, `String`, `char` | the primitive |
//! | `DateTime<_>`, `NaiveDate`, ... | ISO-8601 string (chrono's serde) |
//! | `chrono::Duration` via [`duration`] | ISO-8601 duration string |
//! | unit enum variant | its name |
//! | data-carrying variant | `{ variant: content }` |
//! | `Vec`, tuples, sets | list |
//! | maps with primitive keys | nested map, keys as strings |
//! | newtype struct (value object) | the inner value |
//! | struct | nested map |
//! | `()`, unit struct | empty list |
//! | `None` | `Null` |
//!
//! Absent keys and `Null` decode the same way: `None` for `Option` fields, the
//! default for `#[serde(default)]` fields, [`CodecError::MissingField`]
//! otherwise.

pub mod de;
pub mod duration;
pub mod error;
pub mod ser;
pub mod value;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use de::{StateDeserializer, StateMapDeserializer};
pub use duration::IsoDuration;
pub use error::CodecError;
pub use ser::StateSerializer;
pub use value::{StateMap, StateValue};

/// Encode any serializable value into a [`StateValue`].
pub fn to_value<T>(value: &T) -> Result<StateValue, CodecError>
where
    T: ?Sized + Serialize,
{
    value.serialize(StateSerializer)
}

/// Decode a [`StateValue`] into `T`.
pub fn from_value<T>(value: &StateValue) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    T::deserialize(StateDeserializer::new(value))
}

/// Encode an aggregate body into its snapshot state map.
///
/// The value must encode to a map (a struct or a map type).
pub fn encode<T>(value: &T) -> Result<StateMap, CodecError>
where
    T: ?Sized + Serialize,
{
    match to_value(value)? {
        StateValue::Map(map) => Ok(map),
        other => Err(CodecError::NotAMap {
            found: other.kind(),
        }),
    }
}

/// Decode a snapshot state map into an aggregate body.
pub fn decode<T>(state: &StateMap) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    T::deserialize(StateMapDeserializer::new(state))
}
