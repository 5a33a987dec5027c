//! `serde::Serializer` producing [`StateValue`] trees.

use serde::ser::{self, Impossible, Serialize};

use crate::error::CodecError;
use crate::value::{StateMap, StateValue};

/// Encodes any `Serialize` value into a [`StateValue`].
///
/// Newtype structs are unwrapped, unit variants become their name, structs and
/// maps become nested maps, every kind of sequence becomes a list. Unit values
/// are empty lists so a struct field holding one never reads as absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateSerializer;

impl ser::Serializer for StateSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    type SerializeSeq = SeqSerializer;
    type SerializeTuple = SeqSerializer;
    type SerializeTupleStruct = SeqSerializer;
    type SerializeTupleVariant = TupleVariantSerializer;
    type SerializeMap = MapSerializer;
    type SerializeStruct = StructSerializer;
    type SerializeStructVariant = StructVariantSerializer;

    fn serialize_bool(self, v: bool) -> Result<StateValue, CodecError> {
        Ok(StateValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<StateValue, CodecError> {
        if let Ok(v) = i64::try_from(v) {
            Ok(StateValue::Int(v))
        } else if let Ok(v) = u64::try_from(v) {
            Ok(StateValue::UInt(v))
        } else {
            Err(CodecError::NumberOutOfRange {
                path: String::new(),
                value: v.to_string(),
            })
        }
    }

    fn serialize_u8(self, v: u8) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(i64::from(v)))
    }

    fn serialize_u16(self, v: u16) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(i64::from(v)))
    }

    fn serialize_u32(self, v: u32) -> Result<StateValue, CodecError> {
        Ok(StateValue::Int(i64::from(v)))
    }

    fn serialize_u64(self, v: u64) -> Result<StateValue, CodecError> {
        Ok(StateValue::from(v))
    }

    fn serialize_u128(self, v: u128) -> Result<StateValue, CodecError> {
        match u64::try_from(v) {
            Ok(v) => Ok(StateValue::from(v)),
            Err(_) => Err(CodecError::NumberOutOfRange {
                path: String::new(),
                value: v.to_string(),
            }),
        }
    }

    fn serialize_f32(self, v: f32) -> Result<StateValue, CodecError> {
        Ok(StateValue::Float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> Result<StateValue, CodecError> {
        Ok(StateValue::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<StateValue, CodecError> {
        Ok(StateValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<StateValue, CodecError> {
        Ok(StateValue::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<StateValue, CodecError> {
        Ok(StateValue::List(
            v.iter().map(|b| StateValue::Int(i64::from(*b))).collect(),
        ))
    }

    fn serialize_none(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::Null)
    }

    fn serialize_some<T>(self, value: &T) -> Result<StateValue, CodecError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    /// `()` is the empty tuple. `Null` is reserved for "no value".
    fn serialize_unit(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::List(Vec::new()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<StateValue, CodecError> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<StateValue, CodecError> {
        Ok(StateValue::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<StateValue, CodecError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<StateValue, CodecError>
    where
        T: ?Sized + Serialize,
    {
        let inner = value
            .serialize(StateSerializer)
            .map_err(|e| e.at_field(variant))?;
        Ok(single_entry(variant, inner))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqSerializer, CodecError> {
        Ok(SeqSerializer {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqSerializer, CodecError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqSerializer, CodecError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<TupleVariantSerializer, CodecError> {
        Ok(TupleVariantSerializer {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapSerializer, CodecError> {
        Ok(MapSerializer {
            map: StateMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<StructSerializer, CodecError> {
        Ok(StructSerializer {
            map: StateMap::new(),
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<StructVariantSerializer, CodecError> {
        Ok(StructVariantSerializer {
            variant,
            map: StateMap::new(),
        })
    }
}

fn single_entry(key: &str, value: StateValue) -> StateValue {
    let mut map = StateMap::new();
    map.insert(key.to_string(), value);
    StateValue::Map(map)
}

pub struct SeqSerializer {
    items: Vec<StateValue>,
}

impl SeqSerializer {
    fn push<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        let index = self.items.len();
        let encoded = value
            .serialize(StateSerializer)
            .map_err(|e| e.at_index(index))?;
        self.items.push(encoded);
        Ok(())
    }
}

impl ser::SerializeSeq for SeqSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        self.push(value)
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::List(self.items))
    }
}

impl ser::SerializeTuple for SeqSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        self.push(value)
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::List(self.items))
    }
}

impl ser::SerializeTupleStruct for SeqSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        self.push(value)
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::List(self.items))
    }
}

pub struct TupleVariantSerializer {
    variant: &'static str,
    items: Vec<StateValue>,
}

impl ser::SerializeTupleVariant for TupleVariantSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        let index = self.items.len();
        let encoded = value
            .serialize(StateSerializer)
            .map_err(|e| e.at_index(index).at_field(self.variant))?;
        self.items.push(encoded);
        Ok(())
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(single_entry(self.variant, StateValue::List(self.items)))
    }
}

pub struct MapSerializer {
    map: StateMap,
    next_key: Option<String>,
}

impl ser::SerializeMap for MapSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        self.next_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| CodecError::invalid_key("value serialized before its key"))?;
        let encoded = value
            .serialize(StateSerializer)
            .map_err(|e| e.at_field(&key))?;
        self.map.insert(key, encoded);
        Ok(())
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::Map(self.map))
    }
}

pub struct StructSerializer {
    map: StateMap,
}

impl ser::SerializeStruct for StructSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        let encoded = value
            .serialize(StateSerializer)
            .map_err(|e| e.at_field(key))?;
        self.map.insert(key.to_string(), encoded);
        Ok(())
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(StateValue::Map(self.map))
    }
}

pub struct StructVariantSerializer {
    variant: &'static str,
    map: StateMap,
}

impl ser::SerializeStructVariant for StructVariantSerializer {
    type Ok = StateValue;
    type Error = CodecError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), CodecError>
    where
        T: ?Sized + Serialize,
    {
        let encoded = value
            .serialize(StateSerializer)
            .map_err(|e| e.at_field(key).at_field(self.variant))?;
        self.map.insert(key.to_string(), encoded);
        Ok(())
    }

    fn end(self) -> Result<StateValue, CodecError> {
        Ok(single_entry(self.variant, StateValue::Map(self.map)))
    }
}

/// Renders primitive map keys as strings.
struct MapKeySerializer;

fn unsupported_key(kind: &str) -> CodecError {
    CodecError::invalid_key(format!("{kind} cannot be used as a map key"))
}

impl ser::Serializer for MapKeySerializer {
    type Ok = String;
    type Error = CodecError;

    type SerializeSeq = Impossible<String, CodecError>;
    type SerializeTuple = Impossible<String, CodecError>;
    type SerializeTupleStruct = Impossible<String, CodecError>;
    type SerializeTupleVariant = Impossible<String, CodecError>;
    type SerializeMap = Impossible<String, CodecError>;
    type SerializeStruct = Impossible<String, CodecError>;
    type SerializeStructVariant = Impossible<String, CodecError>;

    fn serialize_bool(self, v: bool) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_i128(self, v: i128) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_u128(self, v: u128) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, _v: f32) -> Result<String, CodecError> {
        Err(unsupported_key("a float"))
    }

    fn serialize_f64(self, _v: f64) -> Result<String, CodecError> {
        Err(unsupported_key("a float"))
    }

    fn serialize_char(self, v: char) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, CodecError> {
        Err(unsupported_key("a byte array"))
    }

    fn serialize_none(self) -> Result<String, CodecError> {
        Err(unsupported_key("None"))
    }

    fn serialize_some<T>(self, value: &T) -> Result<String, CodecError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<String, CodecError> {
        Err(unsupported_key("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<String, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<String, CodecError> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, CodecError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _value: &T,
    ) -> Result<String, CodecError>
    where
        T: ?Sized + Serialize,
    {
        Err(unsupported_key(variant))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Err(unsupported_key("a sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Err(unsupported_key("a tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Err(unsupported_key(variant))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Err(unsupported_key("a map"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Err(unsupported_key(name))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Err(unsupported_key(variant))
    }
}
