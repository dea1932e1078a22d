//! Serializes a [Value] tree into the byte grammar of the configured
//! protocol version.

use bytes::BufMut as _;

use crate::grammar::{v1, v2, ClassDef, Version, CHUNK_LIMIT, STRING_INLINE_LIMIT};
use crate::reference::{EncodeRefs, Slot};
use crate::registry::TypeRegistry;
use crate::value::{Handle, List, Map, Object, Value};

/// Encode one value tree with a fresh reference table.
///
/// Deterministic and side-effect free: repeated calls with independent
/// trees never influence each other.
pub fn encode_value(value: &Value, version: Version, registry: &TypeRegistry) -> Vec<u8> {
    let mut encoder = Encoder::new(version, registry);
    encoder.write_value(value);
    encoder.finish()
}

/// Byte writer owning the per-operation encode state: the reference
/// table and, for version 2, the class definition and type name tables.
pub(crate) struct Encoder<'a> {
    version: Version,
    registry: &'a TypeRegistry,
    buf: bytes::BytesMut,
    refs: EncodeRefs,
    classes: Vec<ClassDef>,
    type_names: Vec<String>,
}

impl<'a> Encoder<'a> {
    pub fn new(version: Version, registry: &'a TypeRegistry) -> Self {
        Self {
            version,
            registry,
            buf: bytes::BytesMut::new(),
            refs: EncodeRefs::new(),
            classes: Vec::new(),
            type_names: Vec::new(),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.put_u8(byte);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Length-prefixed bare name as used by version 1 method names and
    /// `t` type entries. Not a value: it never touches the reference
    /// table.
    pub fn write_v1_name(&mut self, name: &str) {
        self.buf.put_u16(name.chars().count() as u16);
        self.buf.put_slice(name.as_bytes());
    }

    /// Bare string in value syntax, outside the reference table. Used
    /// for frame elements like the version 2 method name.
    pub fn write_raw_string(&mut self, value: &str) {
        match self.version {
            Version::Hessian1 => self.write_string_v1(value),
            Version::Hessian2 => self.write_string_v2(value),
        }
    }

    /// Bare integer in value syntax. Used for the version 2 argument
    /// count.
    pub fn write_raw_int(&mut self, value: i32) {
        match self.version {
            Version::Hessian1 => {
                self.buf.put_u8(v1::INT);
                self.buf.put_i32(value);
            }
            Version::Hessian2 => self.write_int_v2(value),
        }
    }

    pub fn write_value(&mut self, value: &Value) {
        if self.emit_ref_if_seen(value) {
            return;
        }
        match self.version {
            Version::Hessian1 => self.write_value_v1(value),
            Version::Hessian2 => self.write_value_v2(value),
        }
    }

    /// Consult the reference table for composites. Returns true when a
    /// back-reference was emitted in place of the value.
    fn emit_ref_if_seen(&mut self, value: &Value) -> bool {
        let tracked = match value {
            Value::String(s) => s.chars().count() > STRING_INLINE_LIMIT,
            Value::Binary(_) | Value::List(_) | Value::Map(_) | Value::Object(_) => true,
            _ => false,
        };
        if !tracked {
            return false;
        }
        let identity = match value.identity() {
            Some(identity) => identity,
            None => return false,
        };
        match self.refs.visit(identity) {
            Slot::Seen(index) => {
                self.write_ref(index);
                true
            }
            Slot::Assigned(_) => false,
        }
    }

    fn write_ref(&mut self, index: usize) {
        match self.version {
            Version::Hessian1 => {
                self.buf.put_u8(v1::REF);
                self.buf.put_u32(index as u32);
            }
            Version::Hessian2 => {
                self.buf.put_u8(v2::REF);
                self.write_int_v2(index as i32);
            }
        }
    }

    fn write_value_v1(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.put_u8(v1::NULL),
            Value::Bool(true) => self.buf.put_u8(v1::TRUE),
            Value::Bool(false) => self.buf.put_u8(v1::FALSE),
            Value::Int(v) => {
                self.buf.put_u8(v1::INT);
                self.buf.put_i32(*v);
            }
            Value::Long(v) => {
                self.buf.put_u8(v1::LONG);
                self.buf.put_i64(*v);
            }
            Value::Double(v) => {
                self.buf.put_u8(v1::DOUBLE);
                self.buf.put_f64(*v);
            }
            Value::Date(ms) => {
                self.buf.put_u8(v1::DATE);
                self.buf.put_i64(*ms);
            }
            Value::String(s) => self.write_string_v1(s),
            Value::Binary(data) => {
                self.write_chunked(data, v1::BINARY_CHUNK, v1::BINARY_FINAL)
            }
            Value::List(list) => self.write_list_v1(list),
            Value::Map(map) => {
                let map = map.borrow();
                self.write_map_v1(map.type_name.as_deref().unwrap_or(""), &map.entries);
            }
            Value::Object(object) => self.write_object_v1(object),
        }
    }

    fn write_string_v1(&mut self, s: &str) {
        self.write_string_chunks(s, v1::STRING_CHUNK, v1::STRING_FINAL);
    }

    fn write_list_v1(&mut self, list: &Handle<List>) {
        let list = list.borrow();
        self.buf.put_u8(v1::LIST);
        if let Some(name) = &list.type_name {
            self.buf.put_u8(v1::TYPE);
            self.write_v1_name(name);
        }
        for element in &list.elements {
            self.write_value(element);
        }
        self.buf.put_u8(v1::END);
    }

    fn write_map_v1(&mut self, type_name: &str, entries: &[(Value, Value)]) {
        self.buf.put_u8(v1::MAP);
        self.buf.put_u8(v1::TYPE);
        self.write_v1_name(type_name);
        for (key, value) in entries {
            self.write_value(key);
            self.write_value(value);
        }
        self.buf.put_u8(v1::END);
    }

    /// In this generation objects travel as typed maps with string
    /// keys; the registry only translates the type name.
    fn write_object_v1(&mut self, object: &Handle<Object>) {
        let object = object.borrow();
        let registry = self.registry;
        let wire_name = registry
            .by_local_name(&object.type_name)
            .map(|def| def.wire_name.clone())
            .unwrap_or_else(|| object.type_name.clone());
        self.buf.put_u8(v1::MAP);
        self.buf.put_u8(v1::TYPE);
        self.write_v1_name(&wire_name);
        for (name, value) in &object.fields {
            self.write_value(&Value::string(name.as_str()));
            self.write_value(value);
        }
        self.buf.put_u8(v1::END);
    }

    fn write_value_v2(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.put_u8(v2::NULL),
            Value::Bool(true) => self.buf.put_u8(v2::TRUE),
            Value::Bool(false) => self.buf.put_u8(v2::FALSE),
            Value::Int(v) => self.write_int_v2(*v),
            Value::Long(v) => self.write_long_v2(*v),
            Value::Double(v) => self.write_double_v2(*v),
            Value::Date(ms) => self.write_date_v2(*ms),
            Value::String(s) => self.write_string_v2(s),
            Value::Binary(data) => self.write_binary_v2(data),
            Value::List(list) => self.write_list_v2(list),
            Value::Map(map) => self.write_map_v2(map),
            Value::Object(object) => self.write_object_v2(object),
        }
    }

    fn write_int_v2(&mut self, v: i32) {
        if (-16..=47).contains(&v) {
            self.buf.put_u8((v + i32::from(v2::INT_DIRECT_BASE)) as u8);
        } else if (-2048..=2047).contains(&v) {
            self.buf.put_u8(((v >> 8) + i32::from(v2::INT_SHORT_BASE)) as u8);
            self.buf.put_u8(v as u8);
        } else if (-262_144..=262_143).contains(&v) {
            self.buf.put_u8(((v >> 16) + i32::from(v2::INT_MEDIUM_BASE)) as u8);
            self.buf.put_u8((v >> 8) as u8);
            self.buf.put_u8(v as u8);
        } else {
            self.buf.put_u8(v2::INT);
            self.buf.put_i32(v);
        }
    }

    fn write_long_v2(&mut self, v: i64) {
        if (-8..=15).contains(&v) {
            self.buf.put_u8((v + i64::from(v2::LONG_DIRECT_BASE)) as u8);
        } else if (-2048..=2047).contains(&v) {
            self.buf.put_u8(((v >> 8) + i64::from(v2::LONG_SHORT_BASE)) as u8);
            self.buf.put_u8(v as u8);
        } else if (-262_144..=262_143).contains(&v) {
            self.buf.put_u8(((v >> 16) + i64::from(v2::LONG_MEDIUM_BASE)) as u8);
            self.buf.put_u8((v >> 8) as u8);
            self.buf.put_u8(v as u8);
        } else if i64::from(v as i32) == v {
            self.buf.put_u8(v2::LONG_AS_INT);
            self.buf.put_i32(v as i32);
        } else {
            self.buf.put_u8(v2::LONG);
            self.buf.put_i64(v);
        }
    }

    fn write_double_v2(&mut self, v: f64) {
        let integral = v.fract() == 0.0 && v.to_bits() != (-0.0f64).to_bits();
        if v.to_bits() == 0.0f64.to_bits() {
            self.buf.put_u8(v2::DOUBLE_ZERO);
        } else if v.to_bits() == 1.0f64.to_bits() {
            self.buf.put_u8(v2::DOUBLE_ONE);
        } else if integral && (-128.0..=127.0).contains(&v) {
            self.buf.put_u8(v2::DOUBLE_BYTE);
            self.buf.put_i8(v as i8);
        } else if integral && (-32768.0..=32767.0).contains(&v) {
            self.buf.put_u8(v2::DOUBLE_SHORT);
            self.buf.put_i16(v as i16);
        } else if f64::from(v as f32) == v {
            self.buf.put_u8(v2::DOUBLE_FLOAT);
            self.buf.put_f32(v as f32);
        } else {
            self.buf.put_u8(v2::DOUBLE);
            self.buf.put_f64(v);
        }
    }

    fn write_date_v2(&mut self, ms: i64) {
        let minutes = ms / 60_000;
        if ms % 60_000 == 0 && i64::from(minutes as i32) == minutes {
            self.buf.put_u8(v2::DATE_MINUTES);
            self.buf.put_i32(minutes as i32);
        } else {
            self.buf.put_u8(v2::DATE_MILLIS);
            self.buf.put_i64(ms);
        }
    }

    fn write_string_v2(&mut self, s: &str) {
        let count = s.chars().count();
        if count <= STRING_INLINE_LIMIT {
            self.buf.put_u8(count as u8);
            self.buf.put_slice(s.as_bytes());
        } else if count <= 1023 {
            self.buf.put_u8(v2::STRING_MEDIUM_BASE + (count >> 8) as u8);
            self.buf.put_u8(count as u8);
            self.buf.put_slice(s.as_bytes());
        } else {
            self.write_string_chunks(s, v2::STRING_CHUNK, v2::STRING_FINAL);
        }
    }

    fn write_binary_v2(&mut self, data: &[u8]) {
        let len = data.len();
        if len <= 15 {
            self.buf.put_u8(v2::BINARY_SHORT_BASE + len as u8);
            self.buf.put_slice(data);
        } else if len <= 1023 {
            self.buf.put_u8(v2::BINARY_MEDIUM_BASE + (len >> 8) as u8);
            self.buf.put_u8(len as u8);
            self.buf.put_slice(data);
        } else {
            self.write_chunked(data, v2::BINARY_CHUNK, v2::BINARY_FINAL);
        }
    }

    fn write_list_v2(&mut self, list: &Handle<List>) {
        let list = list.borrow();
        let len = list.elements.len();
        match &list.type_name {
            Some(name) => {
                if len <= 7 {
                    self.buf.put_u8(v2::LIST_SHORT_TYPED_BASE + len as u8);
                } else {
                    self.buf.put_u8(v2::LIST_FIXED_TYPED);
                }
                let name = name.clone();
                self.write_type(&name);
                if len > 7 {
                    self.write_int_v2(len as i32);
                }
            }
            None => {
                if len <= 7 {
                    self.buf.put_u8(v2::LIST_SHORT_BASE + len as u8);
                } else {
                    self.buf.put_u8(v2::LIST_FIXED);
                    self.write_int_v2(len as i32);
                }
            }
        }
        for element in &list.elements {
            self.write_value(element);
        }
    }

    fn write_map_v2(&mut self, map: &Handle<Map>) {
        let map = map.borrow();
        match &map.type_name {
            Some(name) => {
                self.buf.put_u8(v2::MAP_TYPED);
                let name = name.clone();
                self.write_type(&name);
            }
            None => self.buf.put_u8(v2::MAP),
        }
        for (key, value) in &map.entries {
            self.write_value(key);
            self.write_value(value);
        }
        self.buf.put_u8(v2::TERMINATOR);
    }

    fn write_object_v2(&mut self, object: &Handle<Object>) {
        let object = object.borrow();
        let registry = self.registry;
        let def = registry.by_local_name(&object.type_name);
        let wire_name = def
            .map(|def| def.wire_name.clone())
            .unwrap_or_else(|| object.type_name.clone());
        let class_index = match self.classes.iter().position(|class| class.name == wire_name) {
            Some(index) => index,
            None => {
                // The first instance fixes the field set for this
                // class unless the registry pins one.
                let fields: Vec<String> = match def {
                    Some(def) if !def.fields.is_empty() => def.fields.clone(),
                    _ => object.fields.iter().map(|(name, _)| name.clone()).collect(),
                };
                self.buf.put_u8(v2::CLASS_DEF);
                self.write_string_v2(&wire_name);
                self.write_int_v2(fields.len() as i32);
                for field in &fields {
                    self.write_string_v2(field);
                }
                self.classes.push(ClassDef {
                    name: wire_name,
                    fields,
                });
                self.classes.len() - 1
            }
        };
        if class_index < 16 {
            self.buf.put_u8(v2::OBJECT_SHORT_BASE + class_index as u8);
        } else {
            self.buf.put_u8(v2::OBJECT);
            self.write_int_v2(class_index as i32);
        }
        let fields = self.classes[class_index].fields.clone();
        for field in &fields {
            match object.fields.iter().find(|(name, _)| name == field) {
                Some((_, value)) => self.write_value(value),
                None => self.buf.put_u8(v2::NULL),
            }
        }
    }

    /// Type name of a version 2 list or map: a bare string on first
    /// use, an index into the type name table afterwards.
    fn write_type(&mut self, name: &str) {
        if let Some(index) = self.type_names.iter().position(|known| known == name) {
            self.write_int_v2(index as i32);
        } else {
            self.type_names.push(name.to_string());
            self.write_string_v2(name);
        }
    }

    fn write_string_chunks(&mut self, s: &str, chunk_tag: u8, final_tag: u8) {
        let mut rest = s;
        let mut count = rest.chars().count();
        while count > CHUNK_LIMIT {
            // count > CHUNK_LIMIT guarantees the boundary char exists
            let split = rest
                .char_indices()
                .nth(CHUNK_LIMIT)
                .map(|(at, _)| at)
                .unwrap_or_else(|| rest.len());
            self.buf.put_u8(chunk_tag);
            self.buf.put_u16(CHUNK_LIMIT as u16);
            self.buf.put_slice(&rest.as_bytes()[..split]);
            rest = &rest[split..];
            count -= CHUNK_LIMIT;
        }
        self.buf.put_u8(final_tag);
        self.buf.put_u16(count as u16);
        self.buf.put_slice(rest.as_bytes());
    }

    fn write_chunked(&mut self, data: &[u8], chunk_tag: u8, final_tag: u8) {
        let mut rest = data;
        while rest.len() > CHUNK_LIMIT {
            self.buf.put_u8(chunk_tag);
            self.buf.put_u16(CHUNK_LIMIT as u16);
            self.buf.put_slice(&rest[..CHUNK_LIMIT]);
            rest = &rest[CHUNK_LIMIT..];
        }
        self.buf.put_u8(final_tag);
        self.buf.put_u16(rest.len() as u16);
        self.buf.put_slice(rest);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::grammar::Version::{Hessian1, Hessian2};

    fn encode(value: &Value, version: Version) -> Vec<u8> {
        encode_value(value, version, &TypeRegistry::empty())
    }

    #[test]
    fn compact_int_forms() {
        assert_eq!(encode(&Value::Int(0), Hessian2), vec![0x90]);
        assert_eq!(encode(&Value::Int(-16), Hessian2), vec![0x80]);
        assert_eq!(encode(&Value::Int(47), Hessian2), vec![0xbf]);
        assert_eq!(encode(&Value::Int(48), Hessian2), vec![0xc8, 0x30]);
        assert_eq!(encode(&Value::Int(-2048), Hessian2), vec![0xc0, 0x00]);
        assert_eq!(encode(&Value::Int(2047), Hessian2), vec![0xcf, 0xff]);
        assert_eq!(
            encode(&Value::Int(262_143), Hessian2),
            vec![0xd7, 0xff, 0xff]
        );
        assert_eq!(
            encode(&Value::Int(262_144), Hessian2),
            vec![b'I', 0x00, 0x04, 0x00, 0x00]
        );
    }

    #[test]
    fn compact_long_forms() {
        assert_eq!(encode(&Value::Long(0), Hessian2), vec![0xe0]);
        assert_eq!(encode(&Value::Long(-8), Hessian2), vec![0xd8]);
        assert_eq!(encode(&Value::Long(15), Hessian2), vec![0xef]);
        assert_eq!(encode(&Value::Long(300), Hessian2), vec![0xf9, 0x2c]);
        assert_eq!(
            encode(&Value::Long(2048), Hessian2),
            vec![0x3c, 0x08, 0x00]
        );
        assert_eq!(
            encode(&Value::Long(0x7fff_ffff), Hessian2),
            vec![0x59, 0x7f, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            encode(&Value::Long(0x8000_0000), Hessian2),
            vec![b'L', 0, 0, 0, 0, 0x80, 0, 0, 0]
        );
    }

    #[test]
    fn compact_double_forms() {
        assert_eq!(encode(&Value::Double(0.0), Hessian2), vec![0x5b]);
        assert_eq!(encode(&Value::Double(1.0), Hessian2), vec![0x5c]);
        assert_eq!(encode(&Value::Double(2.0), Hessian2), vec![0x5d, 0x02]);
        assert_eq!(encode(&Value::Double(-1.0), Hessian2), vec![0x5d, 0xff]);
        assert_eq!(
            encode(&Value::Double(300.0), Hessian2),
            vec![0x5e, 0x01, 0x2c]
        );
        assert_eq!(
            encode(&Value::Double(12.25), Hessian2),
            vec![0x5f, 0x41, 0x44, 0x00, 0x00]
        );
    }

    #[test]
    fn short_and_medium_strings() {
        assert_eq!(encode(&Value::string(""), Hessian2), vec![0x00]);
        assert_eq!(
            encode(&Value::string("hello"), Hessian2),
            vec![0x05, b'h', b'e', b'l', b'l', b'o']
        );
        let medium = "a".repeat(256);
        let bytes = encode(&Value::string(medium.as_str()), Hessian2);
        assert_eq!(&bytes[..2], &[0x31, 0x00]);
        assert_eq!(bytes.len(), 2 + 256);
    }

    #[test]
    fn classic_scalar_tags() {
        assert_eq!(encode(&Value::Null, Hessian1), vec![b'N']);
        assert_eq!(encode(&Value::Bool(true), Hessian1), vec![b'T']);
        assert_eq!(encode(&Value::Int(5), Hessian1), vec![b'I', 0, 0, 0, 5]);
        assert_eq!(
            encode(&Value::string("hi"), Hessian1),
            vec![b'S', 0x00, 0x02, b'h', b'i']
        );
        assert_eq!(
            encode(&Value::Date(0), Hessian1),
            vec![b'd', 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn shared_map_emits_single_encoding_and_ref() {
        let map = Value::map(vec![]);
        let list = Value::list(vec![map.clone(), map]);

        let bytes = encode(&list, Hessian1);
        assert_eq!(
            bytes,
            vec![b'V', b'M', b't', 0, 0, b'z', b'R', 0, 0, 0, 1, b'z']
        );

        // a fresh encoder starts from an empty table
        let bytes = encode(&list, Hessian2);
        assert_eq!(bytes, vec![0x7a, b'H', b'Z', 0x51, 0x91]);
    }

    #[test]
    fn self_referential_list_encodes_as_ref() {
        let list = Value::list(vec![]);
        if let Value::List(handle) = &list {
            handle.borrow_mut().elements.push(list.clone());
        }
        assert_eq!(
            encode(&list, Hessian1),
            vec![b'V', b'R', 0, 0, 0, 0, b'z']
        );
    }

    #[test]
    fn distinct_equal_maps_are_both_emitted() {
        let list = Value::list(vec![Value::map(vec![]), Value::map(vec![])]);
        assert_eq!(encode(&list, Hessian2), vec![0x7a, b'H', b'Z', b'H', b'Z']);
    }

    #[test]
    fn minute_resolution_dates_use_the_compact_form() {
        assert_eq!(
            encode(&Value::Date(120_000), Hessian2),
            vec![0x4b, 0, 0, 0, 2]
        );
        assert_eq!(
            encode(&Value::Date(120_001), Hessian2),
            vec![0x4a, 0, 0, 0, 0, 0, 0x01, 0xd4, 0xc1]
        );
    }

    #[test]
    fn object_emits_class_def_once() {
        let point = |x: i32, y: i32| {
            Value::object(
                "com.example.Point",
                vec![("x".to_string(), Value::Int(x)), ("y".to_string(), Value::Int(y))],
            )
        };
        let list = Value::list(vec![point(1, 2), point(3, 4)]);
        let bytes = encode(&list, Hessian2);
        let defs = bytes.iter().filter(|byte| **byte == b'C').count();
        assert_eq!(defs, 1);
        // second instance reuses class 0 through the short form
        assert_eq!(bytes.iter().filter(|byte| **byte == 0x60).count(), 2);
    }

    #[test]
    fn repeated_list_type_uses_type_table() {
        let a = Value::typed_list("[int", vec![Value::Int(1); 8]);
        let b = Value::typed_list("[int", vec![Value::Int(2); 8]);
        let bytes = encode(&Value::list(vec![a, b]), Hessian2);
        // "[int" appears once as a string, the second list refers to
        // type table slot 0
        let name_count = bytes
            .windows(4)
            .filter(|window| **window == b"[int"[..])
            .count();
        assert_eq!(name_count, 1);
    }
}
