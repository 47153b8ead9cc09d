//! Best-effort structural clone of payloads crossing into the relay.
//!
//! [`sanitize`] first serializes the whole value. If that fails it walks the
//! value with a lossy serializer that drops each map entry, struct field or
//! sequence element that cannot be represented, and keeps everything else.

use serde::ser::{self, Serialize, Serializer as _};
use serde_json::value::Serializer as ValueSerializer;
use serde_json::{Error, Map, Value};
use tracing::debug;

/// Converts `value` into JSON, dropping whatever does not serialize. Never fails.
pub fn sanitize<T: Serialize + ?Sized>(value: &T) -> Value {
	match serde_json::to_value(value) {
		Ok(json) => json,
		Err(err) => {
			debug!(target = "tabguard.client", error = %err, "whole-value clone failed, cloning field by field");
			value.serialize(Lossy).unwrap_or(Value::Null)
		}
	}
}

struct Lossy;

fn lossy<T: Serialize + ?Sized>(value: &T) -> Option<Value> {
	match value.serialize(Lossy) {
		Ok(json) => Some(json),
		Err(err) => {
			debug!(target = "tabguard.client", error = %err, "dropped unclonable member");
			None
		}
	}
}

fn map_key<T: Serialize + ?Sized>(key: &T) -> Option<String> {
	match key.serialize(ValueSerializer) {
		Ok(Value::String(s)) => Some(s),
		Ok(Value::Number(n)) => Some(n.to_string()),
		Ok(Value::Bool(b)) => Some(b.to_string()),
		_ => {
			debug!(target = "tabguard.client", "dropped map entry with non-string key");
			None
		}
	}
}

fn tagged(variant: Option<&'static str>, value: Value) -> Value {
	match variant {
		Some(name) => {
			let mut map = Map::new();
			map.insert(name.to_string(), value);
			Value::Object(map)
		}
		None => value,
	}
}

impl ser::Serializer for Lossy {
	type Ok = Value;
	type Error = Error;
	type SerializeSeq = LossySeq;
	type SerializeTuple = LossySeq;
	type SerializeTupleStruct = LossySeq;
	type SerializeTupleVariant = LossySeq;
	type SerializeMap = LossyMap;
	type SerializeStruct = LossyMap;
	type SerializeStructVariant = LossyMap;

	fn serialize_bool(self, v: bool) -> Result<Value, Error> {
		ValueSerializer.serialize_bool(v)
	}

	fn serialize_i8(self, v: i8) -> Result<Value, Error> {
		ValueSerializer.serialize_i8(v)
	}

	fn serialize_i16(self, v: i16) -> Result<Value, Error> {
		ValueSerializer.serialize_i16(v)
	}

	fn serialize_i32(self, v: i32) -> Result<Value, Error> {
		ValueSerializer.serialize_i32(v)
	}

	fn serialize_i64(self, v: i64) -> Result<Value, Error> {
		ValueSerializer.serialize_i64(v)
	}

	fn serialize_i128(self, v: i128) -> Result<Value, Error> {
		ValueSerializer.serialize_i128(v)
	}

	fn serialize_u8(self, v: u8) -> Result<Value, Error> {
		ValueSerializer.serialize_u8(v)
	}

	fn serialize_u16(self, v: u16) -> Result<Value, Error> {
		ValueSerializer.serialize_u16(v)
	}

	fn serialize_u32(self, v: u32) -> Result<Value, Error> {
		ValueSerializer.serialize_u32(v)
	}

	fn serialize_u64(self, v: u64) -> Result<Value, Error> {
		ValueSerializer.serialize_u64(v)
	}

	fn serialize_u128(self, v: u128) -> Result<Value, Error> {
		ValueSerializer.serialize_u128(v)
	}

	fn serialize_f32(self, v: f32) -> Result<Value, Error> {
		ValueSerializer.serialize_f32(v)
	}

	fn serialize_f64(self, v: f64) -> Result<Value, Error> {
		ValueSerializer.serialize_f64(v)
	}

	fn serialize_char(self, v: char) -> Result<Value, Error> {
		ValueSerializer.serialize_char(v)
	}

	fn serialize_str(self, v: &str) -> Result<Value, Error> {
		ValueSerializer.serialize_str(v)
	}

	fn serialize_bytes(self, v: &[u8]) -> Result<Value, Error> {
		ValueSerializer.serialize_bytes(v)
	}

	fn serialize_none(self) -> Result<Value, Error> {
		Ok(Value::Null)
	}

	fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, Error> {
		value.serialize(self)
	}

	fn serialize_unit(self) -> Result<Value, Error> {
		Ok(Value::Null)
	}

	fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, Error> {
		Ok(Value::Null)
	}

	fn serialize_unit_variant(self, _name: &'static str, _index: u32, variant: &'static str) -> Result<Value, Error> {
		Ok(Value::String(variant.to_string()))
	}

	fn serialize_newtype_struct<T: Serialize + ?Sized>(self, _name: &'static str, value: &T) -> Result<Value, Error> {
		value.serialize(self)
	}

	fn serialize_newtype_variant<T: Serialize + ?Sized>(self, _name: &'static str, _index: u32, variant: &'static str, value: &T) -> Result<Value, Error> {
		let inner = value.serialize(self)?;
		Ok(tagged(Some(variant), inner))
	}

	fn serialize_seq(self, len: Option<usize>) -> Result<LossySeq, Error> {
		Ok(LossySeq::new(len.unwrap_or(0), None))
	}

	fn serialize_tuple(self, len: usize) -> Result<LossySeq, Error> {
		Ok(LossySeq::new(len, None))
	}

	fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<LossySeq, Error> {
		Ok(LossySeq::new(len, None))
	}

	fn serialize_tuple_variant(self, _name: &'static str, _index: u32, variant: &'static str, len: usize) -> Result<LossySeq, Error> {
		Ok(LossySeq::new(len, Some(variant)))
	}

	fn serialize_map(self, _len: Option<usize>) -> Result<LossyMap, Error> {
		Ok(LossyMap::new(None))
	}

	fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<LossyMap, Error> {
		Ok(LossyMap::new(None))
	}

	fn serialize_struct_variant(self, _name: &'static str, _index: u32, variant: &'static str, _len: usize) -> Result<LossyMap, Error> {
		Ok(LossyMap::new(Some(variant)))
	}
}

struct LossySeq {
	items: Vec<Value>,
	variant: Option<&'static str>,
}

impl LossySeq {
	fn new(capacity: usize, variant: Option<&'static str>) -> Self {
		Self {
			items: Vec::with_capacity(capacity),
			variant,
		}
	}

	fn push<T: Serialize + ?Sized>(&mut self, value: &T) {
		if let Some(json) = lossy(value) {
			self.items.push(json);
		}
	}

	fn finish(self) -> Value {
		tagged(self.variant, Value::Array(self.items))
	}
}

impl ser::SerializeSeq for LossySeq {
	type Ok = Value;
	type Error = Error;

	fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.push(value);
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}

impl ser::SerializeTuple for LossySeq {
	type Ok = Value;
	type Error = Error;

	fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.push(value);
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}

impl ser::SerializeTupleStruct for LossySeq {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.push(value);
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}

impl ser::SerializeTupleVariant for LossySeq {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		self.push(value);
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}

struct LossyMap {
	map: Map<String, Value>,
	pending: Option<String>,
	variant: Option<&'static str>,
}

impl LossyMap {
	fn new(variant: Option<&'static str>) -> Self {
		Self {
			map: Map::new(),
			pending: None,
			variant,
		}
	}

	fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) {
		if let Some(json) = lossy(value) {
			self.map.insert(key, json);
		}
	}

	fn finish(self) -> Value {
		tagged(self.variant, Value::Object(self.map))
	}
}

impl ser::SerializeMap for LossyMap {
	type Ok = Value;
	type Error = Error;

	fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Error> {
		self.pending = map_key(key);
		Ok(())
	}

	fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
		if let Some(key) = self.pending.take() {
			self.insert(key, value);
		}
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}

impl ser::SerializeStruct for LossyMap {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), Error> {
		self.insert(key.to_string(), value);
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}

impl ser::SerializeStructVariant for LossyMap {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<(), Error> {
		self.insert(key.to_string(), value);
		Ok(())
	}

	fn end(self) -> Result<Value, Error> {
		Ok(self.finish())
	}
}
