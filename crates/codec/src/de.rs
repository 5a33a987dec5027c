//! `serde::Deserializer` reading [`StateValue`] trees back into typed values.
//!
//! The target type drives the decode: structs pull their declared fields out of
//! a map, enums resolve variants by name, numbers widen into floats. A map
//! entry holding `Null` inside a struct is treated exactly like an absent key.

use std::collections::btree_map;

use serde::de::value::BorrowedStrDeserializer;
use serde::de::{
    self, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess, VariantAccess,
    Visitor,
};
use serde::forward_to_deserialize_any;

use crate::error::CodecError;
use crate::value::{StateMap, StateValue};

/// Deserializer over a borrowed [`StateValue`].
#[derive(Debug, Clone, Copy)]
pub struct StateDeserializer<'de> {
    value: &'de StateValue,
}

impl<'de> StateDeserializer<'de> {
    pub fn new(value: &'de StateValue) -> Self {
        Self { value }
    }

    /// The value itself, or `MissingField` when it is the null marker.
    fn present(&self) -> Result<&'de StateValue, CodecError> {
        match self.value {
            StateValue::Null => Err(CodecError::missing()),
            value => Ok(value),
        }
    }

    fn mismatch(&self, expected: &str) -> CodecError {
        CodecError::type_mismatch(expected, self.value.kind())
    }
}

impl<'de> de::Deserializer<'de> for StateDeserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.value {
            StateValue::Null => visitor.visit_unit(),
            StateValue::Bool(v) => visitor.visit_bool(*v),
            StateValue::Int(v) => visitor.visit_i64(*v),
            StateValue::UInt(v) => visitor.visit_u64(*v),
            StateValue::Float(v) => visitor.visit_f64(*v),
            StateValue::String(v) => visitor.visit_borrowed_str(v),
            StateValue::List(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            StateValue::Map(map) => visitor.visit_map(MapDeserializer::new(map, false)),
        }
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::Bool(v) => visitor.visit_bool(*v),
            _ => Err(self.mismatch("bool")),
        }
    }

    fn deserialize_i8<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_i16<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_i32<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_i64<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_i128<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_u8<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_u16<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_u32<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_u64<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_u128<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_f32<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_f64<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_number(visitor)
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::String(v) => visitor.visit_borrowed_str(v),
            _ => Err(self.mismatch("string")),
        }
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::List(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            StateValue::String(v) => visitor.visit_borrowed_bytes(v.as_bytes()),
            _ => Err(self.mismatch("byte list")),
        }
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.value {
            StateValue::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.value {
            StateValue::Null => visitor.visit_unit(),
            StateValue::List(items) if items.is_empty() => visitor.visit_unit(),
            _ => Err(self.mismatch("empty list")),
        }
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::List(items) => visitor.visit_seq(SeqDeserializer::new(items)),
            _ => Err(self.mismatch("list")),
        }
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::Map(map) => visitor.visit_map(MapDeserializer::new(map, false)),
            _ => Err(self.mismatch("map")),
        }
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::Map(map) => visitor.visit_map(MapDeserializer::new(map, true)),
            _ => Err(self.mismatch("map")),
        }
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::String(variant) => visitor.visit_enum(EnumDeserializer {
                variant,
                content: None,
            }),
            StateValue::Map(map) if map.len() == 1 => {
                let (variant, content) = map
                    .iter()
                    .next()
                    .ok_or_else(|| self.mismatch("single-entry map"))?;
                visitor
                    .visit_enum(EnumDeserializer {
                        variant,
                        content: Some(content),
                    })
                    .map_err(|e| e.at_field(variant))
            }
            _ => Err(self.mismatch("variant name or single-entry map")),
        }
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }
}

impl<'de> StateDeserializer<'de> {
    /// Numbers pass through untouched; the visitor decides whether to widen
    /// (integer into float) or range-check (integer into narrower integer).
    fn deserialize_number<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.present()? {
            StateValue::Int(v) => visitor.visit_i64(*v),
            StateValue::UInt(v) => visitor.visit_u64(*v),
            StateValue::Float(v) => visitor.visit_f64(*v),
            _ => Err(self.mismatch("number")),
        }
    }
}

impl<'de> IntoDeserializer<'de, CodecError> for &'de StateValue {
    type Deserializer = StateDeserializer<'de>;

    fn into_deserializer(self) -> StateDeserializer<'de> {
        StateDeserializer::new(self)
    }
}

/// Deserializer over a borrowed [`StateMap`] at the root of a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StateMapDeserializer<'de> {
    map: &'de StateMap,
}

impl<'de> StateMapDeserializer<'de> {
    pub fn new(map: &'de StateMap) -> Self {
        Self { map }
    }
}

impl<'de> de::Deserializer<'de> for StateMapDeserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_map(MapDeserializer::new(self.map, false))
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_map(MapDeserializer::new(self.map, true))
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map enum
        identifier ignored_any
    }
}

struct SeqDeserializer<'de> {
    iter: std::slice::Iter<'de, StateValue>,
    index: usize,
}

impl<'de> SeqDeserializer<'de> {
    fn new(items: &'de [StateValue]) -> Self {
        Self {
            iter: items.iter(),
            index: 0,
        }
    }
}

impl<'de> SeqAccess<'de> for SeqDeserializer<'de> {
    type Error = CodecError;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, CodecError>
    where
        T: DeserializeSeed<'de>,
    {
        let Some(value) = self.iter.next() else {
            return Ok(None);
        };
        let index = self.index;
        self.index += 1;
        seed.deserialize(StateDeserializer::new(value))
            .map(Some)
            .map_err(|e| e.at_index(index))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

/// Walks map entries; with `skip_nulls` set, null entries look absent so
/// struct fields fall back to `None` / `#[serde(default)]` / `MissingField`.
struct MapDeserializer<'de> {
    iter: btree_map::Iter<'de, String, StateValue>,
    pending: Option<(&'de str, &'de StateValue)>,
    skip_nulls: bool,
}

impl<'de> MapDeserializer<'de> {
    fn new(map: &'de StateMap, skip_nulls: bool) -> Self {
        Self {
            iter: map.iter(),
            pending: None,
            skip_nulls,
        }
    }
}

impl<'de> MapAccess<'de> for MapDeserializer<'de> {
    type Error = CodecError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, CodecError>
    where
        K: DeserializeSeed<'de>,
    {
        for (key, value) in self.iter.by_ref() {
            if self.skip_nulls && value.is_null() {
                continue;
            }
            self.pending = Some((key, value));
            return seed
                .deserialize(MapKeyDeserializer { key })
                .map(Some)
                .map_err(|e| e.at_field(key));
        }
        Ok(None)
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, CodecError>
    where
        V: DeserializeSeed<'de>,
    {
        let (key, value) = self
            .pending
            .take()
            .ok_or_else(|| CodecError::invalid_key("value requested before its key"))?;
        seed.deserialize(StateDeserializer::new(value))
            .map_err(|e| e.at_field(key))
    }
}

struct EnumDeserializer<'de> {
    variant: &'de str,
    content: Option<&'de StateValue>,
}

impl<'de> EnumAccess<'de> for EnumDeserializer<'de> {
    type Error = CodecError;
    type Variant = VariantDeserializer<'de>;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, VariantDeserializer<'de>), CodecError>
    where
        V: DeserializeSeed<'de>,
    {
        let variant =
            seed.deserialize(BorrowedStrDeserializer::<CodecError>::new(self.variant))?;
        Ok((
            variant,
            VariantDeserializer {
                content: self.content,
            },
        ))
    }
}

struct VariantDeserializer<'de> {
    content: Option<&'de StateValue>,
}

impl<'de> VariantAccess<'de> for VariantDeserializer<'de> {
    type Error = CodecError;

    fn unit_variant(self) -> Result<(), CodecError> {
        match self.content {
            None | Some(StateValue::Null) => Ok(()),
            Some(other) => Err(CodecError::type_mismatch("unit variant", other.kind())),
        }
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value, CodecError>
    where
        T: DeserializeSeed<'de>,
    {
        match self.content {
            Some(value) => seed.deserialize(StateDeserializer::new(value)),
            None => Err(CodecError::type_mismatch("newtype variant", "variant name")),
        }
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.content {
            Some(StateValue::List(items)) => visitor.visit_seq(SeqDeserializer::new(items)),
            Some(other) => Err(CodecError::type_mismatch("tuple variant", other.kind())),
            None => Err(CodecError::type_mismatch("tuple variant", "variant name")),
        }
    }

    fn struct_variant<V>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        match self.content {
            Some(StateValue::Map(map)) => visitor.visit_map(MapDeserializer::new(map, true)),
            Some(other) => Err(CodecError::type_mismatch("struct variant", other.kind())),
            None => Err(CodecError::type_mismatch("struct variant", "variant name")),
        }
    }
}

/// Map keys are stored as strings; parse them back into whatever key type the
/// target map declares.
struct MapKeyDeserializer<'de> {
    key: &'de str,
}

macro_rules! deserialize_parsed_key {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, CodecError>
            where
                V: Visitor<'de>,
            {
                let parsed = self.key.parse::<$ty>().map_err(|e| {
                    CodecError::invalid_key(format!(
                        "`{}` is not a valid {}: {e}",
                        self.key,
                        stringify!($ty)
                    ))
                })?;
                visitor.$visit(parsed)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for MapKeyDeserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_borrowed_str(self.key)
    }

    deserialize_parsed_key! {
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError>
    where
        V: Visitor<'de>,
    {
        visitor.visit_enum(BorrowedStrDeserializer::<CodecError>::new(self.key))
    }

    forward_to_deserialize_any! {
        f32 f64 char str string bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct identifier ignored_any
    }
}
