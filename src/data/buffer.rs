/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Self-describing records for streams whose layout is only known at run
//! time.
//!
//! A [`GenericBuffer`] is a resizable byte array; a [`DataDescription`] is
//! the ordered field list that gives those bytes meaning. Offsets follow the
//! natural-alignment rule an x86-64 compiler would use for a plain struct:
//! every field sits on a multiple of its own size, a field that would
//! straddle a boundary of the largest type's size advances to the next such
//! boundary, and the total is a whole multiple of the largest type's size.
//! Once computed, offsets never change.
//!
//! This pairing lets a component publish records whose shape it read from
//! the tree moments earlier, which is handy when the upstream producer
//! does not exist yet and a stand-in has to feed real consumers.

use crate::error::{Error, Result};
use serde_yaml::Value;

/// Primitive field types. Names parse both in the short form (`int8`,
/// `double`) and the C-flavoured spellings configuration files tend to
/// carry (`int8_t`, `unsigned short`, `Time_t`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Bool,
    Float,
    Double,
    /// Nanoseconds since the epoch, 8 bytes.
    Time,
}

impl FieldType {
    pub fn parse(name: &str) -> Option<FieldType> {
        match name {
            "int8" | "int8_t" | "char" => Some(FieldType::Int8),
            "uint8" | "uint8_t" | "unsigned char" => Some(FieldType::Uint8),
            "int16" | "int16_t" | "short" => Some(FieldType::Int16),
            "uint16" | "uint16_t" | "unsigned short" => Some(FieldType::Uint16),
            "int32" | "int32_t" | "int" => Some(FieldType::Int32),
            "uint32" | "uint32_t" | "unsigned int" => Some(FieldType::Uint32),
            "int64" | "int64_t" | "long" => Some(FieldType::Int64),
            "uint64" | "uint64_t" | "unsigned long" => Some(FieldType::Uint64),
            "bool" => Some(FieldType::Bool),
            "float" => Some(FieldType::Float),
            "double" => Some(FieldType::Double),
            "time" | "Time_t" => Some(FieldType::Time),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            FieldType::Int8 | FieldType::Uint8 | FieldType::Bool => 1,
            FieldType::Int16 | FieldType::Uint16 => 2,
            FieldType::Int32 | FieldType::Uint32 | FieldType::Float => 4,
            FieldType::Int64 | FieldType::Uint64 | FieldType::Double | FieldType::Time => 8,
        }
    }
}

/// One field of a described record.
#[derive(Clone, Debug)]
pub struct DataField {
    pub name: String,
    pub ftype: FieldType,
    /// Offset into the buffer, valid after [`DataDescription::size`].
    pub offset: usize,
    pub elements: usize,
    /// Skip this field when logging.
    pub skip: bool,
}

/// The ordered field list describing one record layout.
#[derive(Clone, Debug, Default)]
pub struct DataDescription {
    /// Publication cadence in seconds, for sources that pace themselves.
    pub interval: f64,
    fields: Vec<DataField>,
}

impl DataDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a description from a tree node: either a sequence of field
    /// entries, or a mapping with the entries keyed `"0"`, `"1"`, … in
    /// order.
    pub fn from_node(node: &Value) -> Result<Self> {
        let mut description = DataDescription::new();
        match node {
            Value::Sequence(entries) => {
                for entry in entries {
                    description.add_field_node(entry)?;
                }
            }
            Value::Mapping(map) => {
                for index in 0..map.len() {
                    let key = Value::String(index.to_string());
                    let entry = map.get(&key).ok_or_else(|| {
                        Error::Config(format!("field list has no entry '{index}'"))
                    })?;
                    description.add_field_node(entry)?;
                }
            }
            _ => {
                return Err(Error::Config(
                    "a field list must be a sequence or an indexed mapping".into(),
                ))
            }
        }
        Ok(description)
    }

    fn add_field_node(&mut self, entry: &Value) -> Result<()> {
        let parts: Vec<String> = serde_yaml::from_value(entry.clone())
            .map_err(|_| Error::Config("a field entry must be a list of strings".into()))?;
        self.add_field(&parts)
    }

    /// Appends a `[name, type, elements, flag…]` descriptor.
    pub fn add_field<S: AsRef<str>>(&mut self, parts: &[S]) -> Result<()> {
        if parts.len() < 3 {
            return Err(Error::Config(
                "a field needs at least [name, type, elements]".into(),
            ));
        }
        let name = parts[0].as_ref().to_string();
        let type_name = parts[1].as_ref();
        let ftype = FieldType::parse(type_name)
            .ok_or_else(|| Error::Config(format!("unknown field type '{type_name}'")))?;
        let elements: usize = parts[2]
            .as_ref()
            .parse()
            .map_err(|_| Error::Config(format!("bad element count for field '{name}'")))?;
        let skip = parts.get(3).map(|f| f.as_ref() == "nolog").unwrap_or(false);
        self.fields.push(DataField {
            name,
            ftype,
            offset: 0,
            elements,
            skip,
        });
        Ok(())
    }

    pub fn fields(&self) -> &[DataField] {
        &self.fields
    }

    /// Finds a field by name, valid after [`size`](DataDescription::size).
    pub fn field(&self, name: &str) -> Option<&DataField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Computes every field offset and the total buffer length.
    ///
    /// Walks the fields in insertion order, placing each at the next offset
    /// aligned to its own size; the total is rounded up to a whole multiple
    /// of the largest field type's size. A single-field record is exactly
    /// that field's size.
    pub fn size(&mut self) -> usize {
        let Some(largest) = self.fields.iter().map(|f| f.ftype.size()).max() else {
            return 0;
        };
        let mut offset = 0usize;
        for field in &mut self.fields {
            let s = field.ftype.size();
            offset = offset.div_ceil(s) * s;
            field.offset = offset;
            offset += s * field.elements.max(1);
        }
        offset.div_ceil(largest) * largest
    }
}

/// A resizable byte array whose *contents*, not the object, travel over a
/// transport. Shape it with a [`DataDescription`] and the typed accessors.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GenericBuffer {
    bytes: Vec<u8>,
}

impl GenericBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        GenericBuffer {
            bytes: bytes.to_vec(),
        }
    }

    pub fn resize(&mut self, len: usize) {
        self.bytes.resize(len, 0);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Primitive values that can live in a [`GenericBuffer`], little-endian.
pub trait BufferValue: Sized {
    const WIDTH: usize;
    fn store(&self, raw: &mut [u8]);
    fn load(raw: &[u8]) -> Self;
}

macro_rules! primitive_buffer_value {
    ($($t:ty),* $(,)?) => {$(
        impl BufferValue for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn store(&self, raw: &mut [u8]) {
                raw.copy_from_slice(&self.to_le_bytes());
            }

            fn load(raw: &[u8]) -> Self {
                <$t>::from_le_bytes(raw.try_into().expect("caller checked the width"))
            }
        }
    )*};
}

primitive_buffer_value!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

impl BufferValue for bool {
    const WIDTH: usize = 1;

    fn store(&self, raw: &mut [u8]) {
        raw[0] = *self as u8;
    }

    fn load(raw: &[u8]) -> Self {
        raw[0] != 0
    }
}

/// Reads one value at a byte offset, bounds-checked.
pub fn read_value<T: BufferValue>(buffer: &GenericBuffer, offset: usize) -> Result<T> {
    let end = offset
        .checked_add(T::WIDTH)
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| {
            Error::Lookup(format!(
                "read of {} bytes at offset {offset} overruns a {}-byte buffer",
                T::WIDTH,
                buffer.len()
            ))
        })?;
    Ok(T::load(&buffer.data()[offset..end]))
}

/// Writes one value at a byte offset, bounds-checked.
pub fn write_value<T: BufferValue>(
    buffer: &mut GenericBuffer,
    offset: usize,
    value: T,
) -> Result<()> {
    let end = offset
        .checked_add(T::WIDTH)
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| {
            Error::Lookup(format!(
                "write of {} bytes at offset {offset} overruns a {}-byte buffer",
                T::WIDTH,
                buffer.len()
            ))
        })?;
    value.store(&mut buffer.data_mut()[offset..end]);
    Ok(())
}
