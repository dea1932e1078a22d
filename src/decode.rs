//! Parses the byte grammar of the configured protocol version back into
//! a [Value] tree.

use std::cell::RefCell;
use std::convert::TryInto as _;
use std::rc::Rc;

use crate::error::ProtocolError;
use crate::grammar::{v1, v2, ClassDef, Version, STRING_INLINE_LIMIT};
use crate::reference::DecodeRefs;
use crate::registry::TypeRegistry;
use crate::value::{List, Map, Object, Value};

/// Decode one value tree with a fresh reference table.
///
/// Fails when the input is truncated, a tag is unknown to `version`, a
/// back-reference points at a slot that has not been assigned yet, or
/// bytes remain after the value is complete. Back-references are
/// resolved away: the returned tree never contains a wire-level ref.
pub fn decode_value(
    bytes: &[u8],
    version: Version,
    registry: &TypeRegistry,
) -> Result<Value, ProtocolError> {
    let mut decoder = Decoder::new(bytes, version, registry);
    let value = decoder.read_value()?;
    decoder.expect_end()?;
    Ok(value)
}

/// Cursor over an encoded frame owning the per-operation decode state.
///
/// Every read advances the cursor by exactly the grammar-defined width
/// of the tag just consumed; there is no lookahead beyond one tag byte.
pub(crate) struct Decoder<'a> {
    version: Version,
    registry: &'a TypeRegistry,
    input: &'a [u8],
    pos: usize,
    refs: DecodeRefs,
    classes: Vec<ClassDef>,
    type_names: Vec<String>,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8], version: Version, registry: &'a TypeRegistry) -> Self {
        Self {
            version,
            registry,
            input,
            pos: 0,
            refs: DecodeRefs::new(),
            classes: Vec::new(),
            type_names: Vec::new(),
        }
    }

    pub fn expect_end(&self) -> Result<(), ProtocolError> {
        let count = self.input.len() - self.pos;
        if count > 0 {
            return Err(ProtocolError::TrailingBytes { count });
        }
        Ok(())
    }

    pub fn expect_u8(&mut self, expected: u8, what: &'static str) -> Result<(), ProtocolError> {
        let tag = self.read_u8()?;
        if tag != expected {
            return Err(ProtocolError::UnexpectedTag {
                expected: what,
                tag,
            });
        }
        Ok(())
    }

    pub fn expect_version_marker(&mut self, expected: [u8; 2]) -> Result<(), ProtocolError> {
        let data = self.take(2)?;
        let actual = [data[0], data[1]];
        if actual != expected {
            return Err(ProtocolError::VersionMismatch { expected, actual });
        }
        Ok(())
    }

    pub fn read_value(&mut self) -> Result<Value, ProtocolError> {
        let tag = self.read_u8()?;
        self.read_tagged(tag)
    }

    pub fn read_tagged(&mut self, tag: u8) -> Result<Value, ProtocolError> {
        match self.version {
            Version::Hessian1 => self.read_tagged_v1(tag),
            Version::Hessian2 => self.read_tagged_v2(tag),
        }
    }

    /// Bare name as used by version 1 method names and `t` entries.
    pub fn read_v1_name(&mut self) -> Result<String, ProtocolError> {
        let count = self.read_u16()? as usize;
        self.read_utf8(count)
    }

    /// Bare string in value syntax, outside the reference table.
    pub fn read_raw_string(&mut self) -> Result<String, ProtocolError> {
        match self.version {
            Version::Hessian1 => {
                let tag = self.read_u8()?;
                match tag {
                    v1::STRING_CHUNK | v1::STRING_FINAL => {
                        self.read_string_chunks(tag, v1::STRING_CHUNK, v1::STRING_FINAL)
                    }
                    tag => Err(ProtocolError::UnexpectedTag {
                        expected: "string",
                        tag,
                    }),
                }
            }
            Version::Hessian2 => self.read_string_raw_v2(),
        }
    }

    /// Bare integer in value syntax.
    pub fn read_raw_int(&mut self) -> Result<i32, ProtocolError> {
        match self.version {
            Version::Hessian1 => {
                self.expect_u8(v1::INT, "integer")?;
                self.read_i32()
            }
            Version::Hessian2 => self.read_int_v2(),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn peek_u8(&self) -> Result<u8, ProtocolError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(ProtocolError::Truncated { needed: 1 })
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.input.len() - self.pos;
        if remaining < count {
            return Err(ProtocolError::Truncated {
                needed: count - remaining,
            });
        }
        let data = &self.input[self.pos..self.pos + count];
        self.pos += count;
        Ok(data)
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        // take() returned exactly the requested width
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_bits(u64::from_be_bytes(
            self.take(8)?.try_into().unwrap(),
        )))
    }

    /// Read exactly `count` code points of UTF-8.
    fn read_utf8(&mut self, count: usize) -> Result<String, ProtocolError> {
        let mut out = String::new();
        self.read_utf8_into(&mut out, count)?;
        Ok(out)
    }

    fn read_utf8_into(&mut self, out: &mut String, count: usize) -> Result<(), ProtocolError> {
        for _ in 0..count {
            let first = self.read_u8()?;
            let width = match first {
                0x00..=0x7f => 0,
                0xc0..=0xdf => 1,
                0xe0..=0xef => 2,
                0xf0..=0xf7 => 3,
                _ => return Err(ProtocolError::InvalidUtf8),
            };
            let mut bytes = [first, 0, 0, 0];
            bytes[1..1 + width].copy_from_slice(self.take(width)?);
            let decoded = std::str::from_utf8(&bytes[..1 + width])
                .map_err(|_| ProtocolError::InvalidUtf8)?;
            out.push_str(decoded);
        }
        Ok(())
    }

    /// Strings above the inline limit enter the reference table, in
    /// step with the encode side.
    fn intern_string(&mut self, s: String) -> Value {
        let tracked = s.chars().count() > STRING_INLINE_LIMIT;
        let value = Value::String(Rc::new(s));
        if tracked {
            self.refs.push(value.clone());
        }
        value
    }

    fn intern_binary(&mut self, data: Vec<u8>) -> Value {
        let value = Value::Binary(Rc::new(data));
        self.refs.push(value.clone());
        value
    }

    fn read_string_chunks(
        &mut self,
        first_tag: u8,
        chunk_tag: u8,
        final_tag: u8,
    ) -> Result<String, ProtocolError> {
        let mut out = String::new();
        let mut tag = first_tag;
        loop {
            let count = self.read_u16()? as usize;
            self.read_utf8_into(&mut out, count)?;
            if tag == final_tag {
                return Ok(out);
            }
            tag = self.read_u8()?;
            if tag != chunk_tag && tag != final_tag {
                return Err(ProtocolError::UnexpectedTag {
                    expected: "string chunk",
                    tag,
                });
            }
        }
    }

    fn read_binary_chunks(
        &mut self,
        first_tag: u8,
        chunk_tag: u8,
        final_tag: u8,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        let mut tag = first_tag;
        loop {
            let count = self.read_u16()? as usize;
            out.extend_from_slice(self.take(count)?);
            if tag == final_tag {
                return Ok(out);
            }
            tag = self.read_u8()?;
            if tag != chunk_tag && tag != final_tag {
                return Err(ProtocolError::UnexpectedTag {
                    expected: "binary chunk",
                    tag,
                });
            }
        }
    }

    fn read_ref(&mut self, index: usize) -> Result<Value, ProtocolError> {
        self.refs
            .get(index)
            .ok_or(ProtocolError::DanglingRef { index })
    }

    fn read_tagged_v1(&mut self, tag: u8) -> Result<Value, ProtocolError> {
        match tag {
            v1::NULL => Ok(Value::Null),
            v1::TRUE => Ok(Value::Bool(true)),
            v1::FALSE => Ok(Value::Bool(false)),
            v1::INT => Ok(Value::Int(self.read_i32()?)),
            v1::LONG => Ok(Value::Long(self.read_i64()?)),
            v1::DOUBLE => Ok(Value::Double(self.read_f64()?)),
            v1::DATE => Ok(Value::Date(self.read_i64()?)),
            v1::STRING_CHUNK | v1::STRING_FINAL => {
                let s = self.read_string_chunks(tag, v1::STRING_CHUNK, v1::STRING_FINAL)?;
                Ok(self.intern_string(s))
            }
            v1::BINARY_CHUNK | v1::BINARY_FINAL => {
                let data = self.read_binary_chunks(tag, v1::BINARY_CHUNK, v1::BINARY_FINAL)?;
                Ok(self.intern_binary(data))
            }
            v1::LIST => self.read_list_v1(),
            v1::MAP => self.read_map_v1(),
            v1::REF => {
                let index = self.read_u32()? as usize;
                self.read_ref(index)
            }
            tag => Err(ProtocolError::UnknownTag {
                tag,
                version: self.version,
            }),
        }
    }

    fn read_list_v1(&mut self) -> Result<Value, ProtocolError> {
        let handle = Rc::new(RefCell::new(List::default()));
        self.refs.push(Value::List(Rc::clone(&handle)));
        let mut tag = self.read_u8()?;
        if tag == v1::TYPE {
            let name = self.read_v1_name()?;
            if !name.is_empty() {
                handle.borrow_mut().type_name = Some(name);
            }
            tag = self.read_u8()?;
        }
        if tag == v1::LENGTH {
            // advisory only, elements run to the terminator
            let _declared = self.read_i32()?;
            tag = self.read_u8()?;
        }
        while tag != v1::END {
            let element = self.read_tagged_v1(tag)?;
            handle.borrow_mut().elements.push(element);
            tag = self.read_u8()?;
        }
        Ok(Value::List(handle))
    }

    /// A typed map whose wire type is registered is an object in
    /// transit; an unregistered one stays a map carrying the type name.
    fn read_map_v1(&mut self) -> Result<Value, ProtocolError> {
        let mut tag = self.read_u8()?;
        let mut type_name = None;
        if tag == v1::TYPE {
            let name = self.read_v1_name()?;
            if !name.is_empty() {
                type_name = Some(name);
            }
            tag = self.read_u8()?;
        }
        let registry = self.registry;
        let local_name = type_name
            .as_deref()
            .and_then(|name| registry.by_wire_name(name))
            .map(|def| def.local_name.clone());
        if let Some(local_name) = local_name {
            let handle = Rc::new(RefCell::new(Object {
                type_name: local_name,
                fields: Vec::new(),
            }));
            self.refs.push(Value::Object(Rc::clone(&handle)));
            while tag != v1::END {
                let key = self.read_tagged_v1(tag)?;
                let name = match key {
                    Value::String(s) => (*s).clone(),
                    _ => return Err(ProtocolError::FieldNameNotString),
                };
                let value = self.read_value()?;
                handle.borrow_mut().fields.push((name, value));
                tag = self.read_u8()?;
            }
            Ok(Value::Object(handle))
        } else {
            let handle = Rc::new(RefCell::new(Map {
                type_name,
                entries: Vec::new(),
            }));
            self.refs.push(Value::Map(Rc::clone(&handle)));
            while tag != v1::END {
                let key = self.read_tagged_v1(tag)?;
                let value = self.read_value()?;
                handle.borrow_mut().entries.push((key, value));
                tag = self.read_u8()?;
            }
            Ok(Value::Map(handle))
        }
    }

    fn read_tagged_v2(&mut self, tag: u8) -> Result<Value, ProtocolError> {
        match tag {
            v2::NULL => Ok(Value::Null),
            v2::TRUE => Ok(Value::Bool(true)),
            v2::FALSE => Ok(Value::Bool(false)),

            0x80..=0xbf => Ok(Value::Int(i32::from(tag) - i32::from(v2::INT_DIRECT_BASE))),
            0xc0..=0xcf => {
                let b0 = i32::from(self.read_u8()?);
                Ok(Value::Int(
                    ((i32::from(tag) - i32::from(v2::INT_SHORT_BASE)) << 8) + b0,
                ))
            }
            0xd0..=0xd7 => {
                let b1 = i32::from(self.read_u8()?);
                let b0 = i32::from(self.read_u8()?);
                Ok(Value::Int(
                    ((i32::from(tag) - i32::from(v2::INT_MEDIUM_BASE)) << 16) + (b1 << 8) + b0,
                ))
            }
            v2::INT => Ok(Value::Int(self.read_i32()?)),

            0xd8..=0xef => Ok(Value::Long(
                i64::from(tag) - i64::from(v2::LONG_DIRECT_BASE),
            )),
            0xf0..=0xff => {
                let b0 = i64::from(self.read_u8()?);
                Ok(Value::Long(
                    ((i64::from(tag) - i64::from(v2::LONG_SHORT_BASE)) << 8) + b0,
                ))
            }
            0x38..=0x3f => {
                let b1 = i64::from(self.read_u8()?);
                let b0 = i64::from(self.read_u8()?);
                Ok(Value::Long(
                    ((i64::from(tag) - i64::from(v2::LONG_MEDIUM_BASE)) << 16) + (b1 << 8) + b0,
                ))
            }
            v2::LONG_AS_INT => Ok(Value::Long(i64::from(self.read_i32()?))),
            v2::LONG => Ok(Value::Long(self.read_i64()?)),

            v2::DOUBLE_ZERO => Ok(Value::Double(0.0)),
            v2::DOUBLE_ONE => Ok(Value::Double(1.0)),
            v2::DOUBLE_BYTE => Ok(Value::Double(f64::from(self.read_u8()? as i8))),
            v2::DOUBLE_SHORT => Ok(Value::Double(f64::from(self.read_i16()?))),
            v2::DOUBLE_FLOAT => Ok(Value::Double(f64::from(self.read_f32()?))),
            v2::DOUBLE => Ok(Value::Double(self.read_f64()?)),

            v2::DATE_MILLIS => Ok(Value::Date(self.read_i64()?)),
            v2::DATE_MINUTES => Ok(Value::Date(i64::from(self.read_i32()?) * 60_000)),

            0x00..=0x1f => {
                let s = self.read_utf8(usize::from(tag))?;
                Ok(self.intern_string(s))
            }
            0x30..=0x33 => {
                let count = ((usize::from(tag) - 0x30) << 8) + usize::from(self.read_u8()?);
                let s = self.read_utf8(count)?;
                Ok(self.intern_string(s))
            }
            v2::STRING_CHUNK | v2::STRING_FINAL => {
                let s = self.read_string_chunks(tag, v2::STRING_CHUNK, v2::STRING_FINAL)?;
                Ok(self.intern_string(s))
            }

            0x20..=0x2f => {
                let data = self.take(usize::from(tag) - 0x20)?.to_vec();
                Ok(self.intern_binary(data))
            }
            0x34..=0x37 => {
                let count = ((usize::from(tag) - 0x34) << 8) + usize::from(self.read_u8()?);
                let data = self.take(count)?.to_vec();
                Ok(self.intern_binary(data))
            }
            v2::BINARY_CHUNK | v2::BINARY_FINAL => {
                let data = self.read_binary_chunks(tag, v2::BINARY_CHUNK, v2::BINARY_FINAL)?;
                Ok(self.intern_binary(data))
            }

            v2::LIST_VARIABLE_TYPED => {
                let type_name = self.read_type_v2()?;
                self.read_list_body_v2(Some(type_name), None)
            }
            v2::LIST_FIXED_TYPED => {
                let type_name = self.read_type_v2()?;
                let len = self.read_int_v2()?;
                self.read_list_body_v2(Some(type_name), Some(len))
            }
            v2::LIST_VARIABLE => self.read_list_body_v2(None, None),
            v2::LIST_FIXED => {
                let len = self.read_int_v2()?;
                self.read_list_body_v2(None, Some(len))
            }
            0x70..=0x77 => {
                let len = i32::from(tag) - i32::from(v2::LIST_SHORT_TYPED_BASE);
                let type_name = self.read_type_v2()?;
                self.read_list_body_v2(Some(type_name), Some(len))
            }
            0x78..=0x7f => {
                let len = i32::from(tag) - i32::from(v2::LIST_SHORT_BASE);
                self.read_list_body_v2(None, Some(len))
            }

            v2::MAP_TYPED => {
                let type_name = self.read_type_v2()?;
                self.read_map_body_v2(Some(type_name))
            }
            v2::MAP => self.read_map_body_v2(None),

            v2::CLASS_DEF => {
                self.read_class_def_v2()?;
                self.read_value()
            }
            v2::OBJECT => {
                let index = self.read_int_v2()?;
                if index < 0 {
                    return Err(ProtocolError::InvalidLength {
                        length: i64::from(index),
                    });
                }
                self.read_object_v2(index as usize)
            }
            0x60..=0x6f => {
                self.read_object_v2(usize::from(tag) - usize::from(v2::OBJECT_SHORT_BASE))
            }

            v2::REF => {
                let index = self.read_int_v2()?;
                if index < 0 {
                    return Err(ProtocolError::InvalidLength {
                        length: i64::from(index),
                    });
                }
                self.read_ref(index as usize)
            }

            tag => Err(ProtocolError::UnknownTag {
                tag,
                version: self.version,
            }),
        }
    }

    fn read_int_v2(&mut self) -> Result<i32, ProtocolError> {
        let tag = self.read_u8()?;
        match self.read_tagged_v2(tag)? {
            Value::Int(v) => Ok(v),
            _ => Err(ProtocolError::UnexpectedTag {
                expected: "integer",
                tag,
            }),
        }
    }

    fn read_string_raw_v2(&mut self) -> Result<String, ProtocolError> {
        let tag = self.read_u8()?;
        match tag {
            0x00..=0x1f => self.read_utf8(usize::from(tag)),
            0x30..=0x33 => {
                let count = ((usize::from(tag) - 0x30) << 8) + usize::from(self.read_u8()?);
                self.read_utf8(count)
            }
            v2::STRING_CHUNK | v2::STRING_FINAL => {
                self.read_string_chunks(tag, v2::STRING_CHUNK, v2::STRING_FINAL)
            }
            tag => Err(ProtocolError::UnexpectedTag {
                expected: "string",
                tag,
            }),
        }
    }

    /// Type name of a list or map: a bare string on first use, an index
    /// into the type name table afterwards.
    fn read_type_v2(&mut self) -> Result<String, ProtocolError> {
        let tag = self.peek_u8()?;
        match tag {
            0x80..=0xd7 | v2::INT => {
                let index = self.read_int_v2()?;
                if index < 0 {
                    return Err(ProtocolError::InvalidLength {
                        length: i64::from(index),
                    });
                }
                self.type_names
                    .get(index as usize)
                    .cloned()
                    .ok_or(ProtocolError::UnknownTypeRef {
                        index: index as usize,
                    })
            }
            _ => {
                let name = self.read_string_raw_v2()?;
                self.type_names.push(name.clone());
                Ok(name)
            }
        }
    }

    fn read_class_def_v2(&mut self) -> Result<(), ProtocolError> {
        let name = self.read_string_raw_v2()?;
        let count = self.read_int_v2()?;
        if count < 0 {
            return Err(ProtocolError::InvalidLength {
                length: i64::from(count),
            });
        }
        let mut fields = Vec::new();
        for _ in 0..count {
            fields.push(self.read_string_raw_v2()?);
        }
        self.classes.push(ClassDef { name, fields });
        Ok(())
    }

    fn read_object_v2(&mut self, class_index: usize) -> Result<Value, ProtocolError> {
        let def = self
            .classes
            .get(class_index)
            .cloned()
            .ok_or(ProtocolError::UnknownClassDef { index: class_index })?;
        let registry = self.registry;
        // unknown wire names fall back to a generic object
        let type_name = registry
            .by_wire_name(&def.name)
            .map(|known| known.local_name.clone())
            .unwrap_or_else(|| def.name.clone());
        let handle = Rc::new(RefCell::new(Object {
            type_name,
            fields: Vec::new(),
        }));
        self.refs.push(Value::Object(Rc::clone(&handle)));
        for field in def.fields {
            let value = self.read_value()?;
            handle.borrow_mut().fields.push((field, value));
        }
        Ok(Value::Object(handle))
    }

    fn read_list_body_v2(
        &mut self,
        type_name: Option<String>,
        len: Option<i32>,
    ) -> Result<Value, ProtocolError> {
        if let Some(len) = len {
            if len < 0 {
                return Err(ProtocolError::InvalidLength {
                    length: i64::from(len),
                });
            }
        }
        let handle = Rc::new(RefCell::new(List {
            type_name,
            elements: Vec::new(),
        }));
        self.refs.push(Value::List(Rc::clone(&handle)));
        match len {
            Some(len) => {
                for _ in 0..len {
                    let element = self.read_value()?;
                    handle.borrow_mut().elements.push(element);
                }
            }
            None => loop {
                let tag = self.read_u8()?;
                if tag == v2::TERMINATOR {
                    break;
                }
                let element = self.read_tagged_v2(tag)?;
                handle.borrow_mut().elements.push(element);
            },
        }
        Ok(Value::List(handle))
    }

    fn read_map_body_v2(&mut self, type_name: Option<String>) -> Result<Value, ProtocolError> {
        let handle = Rc::new(RefCell::new(Map {
            type_name,
            entries: Vec::new(),
        }));
        self.refs.push(Value::Map(Rc::clone(&handle)));
        loop {
            let tag = self.read_u8()?;
            if tag == v2::TERMINATOR {
                break;
            }
            let key = self.read_tagged_v2(tag)?;
            let value = self.read_value()?;
            handle.borrow_mut().entries.push((key, value));
        }
        Ok(Value::Map(handle))
    }
}
