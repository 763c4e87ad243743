use crate::value::{Value, ValueType};
use crate::PROTO_REV_3;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read};

pub type WireResult<T> = Result<T, WireError>;

/// Errors surfaced by the codec. A `BadMessage` means the peer sent a frame
/// this revision cannot accept; the connection owning the stream is expected
/// to go dead in response. Neither variant unwinds.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WireError {
    BadMessage(&'static str),
    Io(io::ErrorKind),
}

impl From<io::Error> for WireError {
    #[inline]
    fn from(err: io::Error) -> Self {
        WireError::Io(err.kind())
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::BadMessage(msg) => write!(f, "bad message: {}", msg),
            WireError::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}

// Value type bytes on the wire. Distinct from the ValueType bitmask.
const WIRE_BOOLEAN: u8 = 0x00;
const WIRE_DOUBLE: u8 = 0x01;
const WIRE_STRING: u8 = 0x02;
const WIRE_RAW: u8 = 0x03;
const WIRE_BOOLEAN_ARRAY: u8 = 0x10;
const WIRE_DOUBLE_ARRAY: u8 = 0x11;
const WIRE_STRING_ARRAY: u8 = 0x12;
const WIRE_RPC: u8 = 0x20;

/// Encodes messages for a single protocol revision into an in-memory buffer.
/// The writer thread reuses one encoder per batch: `reset`, write, send.
pub struct WireEncoder {
    proto_rev: u16,
    data: Vec<u8>,
}

impl WireEncoder {
    #[inline]
    pub fn new(proto_rev: u16) -> WireEncoder {
        WireEncoder {
            proto_rev,
            data: Vec::with_capacity(1024),
        }
    }

    #[inline]
    pub fn proto_rev(&self) -> u16 {
        self.proto_rev
    }

    #[inline]
    pub fn set_proto_rev(&mut self, proto_rev: u16) {
        self.proto_rev = proto_rev;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.data.clear();
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Rolls the buffer back to an earlier length, discarding the partial
    /// bytes of a message that turned out to be unencodable.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    #[inline]
    pub fn write_u16(&mut self, v: u16) {
        self.data.write_u16::<BigEndian>(v).expect("vec write");
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.data.write_u32::<BigEndian>(v).expect("vec write");
    }

    #[inline]
    pub fn write_double(&mut self, v: f64) {
        self.data.write_f64::<BigEndian>(v).expect("vec write");
    }

    pub fn write_uleb128(&mut self, mut v: u64) {
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            self.data.push(byte);
            if v == 0 {
                break;
            }
        }
    }

    /// Writes a length-prefixed byte string. At revision 2.0 the prefix is a
    /// 16-bit length and the payload is truncated at 64 KiB; at 3.0 the
    /// prefix is ULEB128 and the payload is unbounded.
    pub fn write_string(&mut self, s: &[u8]) {
        if self.proto_rev < PROTO_REV_3 {
            let len = s.len().min(0xffff);
            self.write_u16(len as u16);
            self.data.extend_from_slice(&s[..len]);
        } else {
            self.write_uleb128(s.len() as u64);
            self.data.extend_from_slice(s);
        }
    }

    /// Writes the wire tag for a value type. Raw and rpc do not exist at 2.0.
    pub fn write_type(&mut self, vtype: ValueType) -> WireResult<()> {
        let byte = match vtype {
            ValueType::Boolean => WIRE_BOOLEAN,
            ValueType::Double => WIRE_DOUBLE,
            ValueType::Str => WIRE_STRING,
            ValueType::Raw => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::BadMessage("raw type not supported in protocol < 3.0"));
                }
                WIRE_RAW
            }
            ValueType::BooleanArray => WIRE_BOOLEAN_ARRAY,
            ValueType::DoubleArray => WIRE_DOUBLE_ARRAY,
            ValueType::StringArray => WIRE_STRING_ARRAY,
            ValueType::Rpc => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::BadMessage("rpc type not supported in protocol < 3.0"));
                }
                WIRE_RPC
            }
        };

        self.write_u8(byte);
        Ok(())
    }

    /// Writes a value payload without its type tag. Array counts are a
    /// single byte at 2.0 (arrays truncated at 255 elements) and ULEB128 at
    /// 3.0.
    pub fn write_value_payload(&mut self, value: &Value) -> WireResult<()> {
        match value {
            Value::Boolean(v) => self.write_u8(*v as u8),
            Value::Double(v) => self.write_double(*v),
            Value::Str(v) => self.write_string(v.as_bytes()),
            Value::Raw(v) => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::BadMessage("raw values not supported in protocol < 3.0"));
                }
                self.write_string(v);
            }
            Value::Rpc(v) => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::BadMessage("rpc values not supported in protocol < 3.0"));
                }
                self.write_string(v);
            }
            Value::BooleanArray(v) => {
                let len = self.write_array_len(v.len());
                for elem in &v[..len] {
                    self.write_u8(*elem as u8);
                }
            }
            Value::DoubleArray(v) => {
                let len = self.write_array_len(v.len());
                for elem in &v[..len] {
                    self.write_double(*elem);
                }
            }
            Value::StringArray(v) => {
                let len = self.write_array_len(v.len());
                for elem in &v[..len] {
                    self.write_string(elem.as_bytes());
                }
            }
        }

        Ok(())
    }

    /// Writes a value with its type tag in front of the payload.
    #[inline]
    pub fn write_value(&mut self, value: &Value) -> WireResult<()> {
        self.write_type(value.value_type())?;
        self.write_value_payload(value)
    }

    fn write_array_len(&mut self, len: usize) -> usize {
        if self.proto_rev < PROTO_REV_3 {
            let len = len.min(0xff);
            self.write_u8(len as u8);
            len
        } else {
            self.write_uleb128(len as u64);
            len
        }
    }
}

/// Decodes framed messages from a blocking byte stream for a single
/// protocol revision.
pub struct WireDecoder<R> {
    stream: R,
    proto_rev: u16,
}

impl<R: Read> WireDecoder<R> {
    #[inline]
    pub fn new(stream: R, proto_rev: u16) -> WireDecoder<R> {
        WireDecoder { stream, proto_rev }
    }

    #[inline]
    pub fn proto_rev(&self) -> u16 {
        self.proto_rev
    }

    #[inline]
    pub fn set_proto_rev(&mut self, proto_rev: u16) {
        self.proto_rev = proto_rev;
    }

    #[inline]
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.stream.read_u8()?)
    }

    #[inline]
    pub fn read_u16(&mut self) -> WireResult<u16> {
        Ok(self.stream.read_u16::<BigEndian>()?)
    }

    #[inline]
    pub fn read_u32(&mut self) -> WireResult<u32> {
        Ok(self.stream.read_u32::<BigEndian>()?)
    }

    #[inline]
    pub fn read_double(&mut self) -> WireResult<f64> {
        Ok(self.stream.read_f64::<BigEndian>()?)
    }

    pub fn read_uleb128(&mut self) -> WireResult<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;

        loop {
            if shift >= 64 {
                return Err(WireError::BadMessage("uleb128 length out of range"));
            }

            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;

            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Reads exactly `len` bytes. Allocation grows with the bytes actually
    /// received, so a hostile length prefix cannot reserve memory up front.
    pub fn read_bytes(&mut self, len: usize) -> WireResult<Vec<u8>> {
        let mut buf = Vec::new();
        let read = (&mut self.stream).take(len as u64).read_to_end(&mut buf)?;

        if read != len {
            return Err(WireError::Io(io::ErrorKind::UnexpectedEof));
        }

        Ok(buf)
    }

    fn read_len(&mut self) -> WireResult<usize> {
        if self.proto_rev < PROTO_REV_3 {
            Ok(self.read_u16()? as usize)
        } else {
            Ok(self.read_uleb128()? as usize)
        }
    }

    pub fn read_string_bytes(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> WireResult<String> {
        let raw = self.read_string_bytes()?;
        String::from_utf8(raw).map_err(|_| WireError::BadMessage("invalid utf-8 in string"))
    }

    pub fn read_type(&mut self) -> WireResult<ValueType> {
        match self.read_u8()? {
            WIRE_BOOLEAN => Ok(ValueType::Boolean),
            WIRE_DOUBLE => Ok(ValueType::Double),
            WIRE_STRING => Ok(ValueType::Str),
            WIRE_RAW => Ok(ValueType::Raw),
            WIRE_BOOLEAN_ARRAY => Ok(ValueType::BooleanArray),
            WIRE_DOUBLE_ARRAY => Ok(ValueType::DoubleArray),
            WIRE_STRING_ARRAY => Ok(ValueType::StringArray),
            WIRE_RPC => Ok(ValueType::Rpc),
            _ => Err(WireError::BadMessage("unrecognized value type")),
        }
    }

    fn read_array_len(&mut self) -> WireResult<usize> {
        if self.proto_rev < PROTO_REV_3 {
            Ok(self.read_u8()? as usize)
        } else {
            Ok(self.read_uleb128()? as usize)
        }
    }

    /// Reads a value payload of a known type.
    pub fn read_value(&mut self, vtype: ValueType) -> WireResult<Value> {
        match vtype {
            ValueType::Boolean => Ok(Value::Boolean(self.read_u8()? != 0)),
            ValueType::Double => Ok(Value::Double(self.read_double()?)),
            ValueType::Str => Ok(Value::Str(self.read_string()?)),
            ValueType::Raw => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::BadMessage("received raw value in protocol < 3.0"));
                }
                Ok(Value::Raw(self.read_string_bytes()?))
            }
            ValueType::Rpc => {
                if self.proto_rev < PROTO_REV_3 {
                    return Err(WireError::BadMessage("received rpc value in protocol < 3.0"));
                }
                Ok(Value::Rpc(self.read_string_bytes()?))
            }
            ValueType::BooleanArray => {
                let len = self.read_array_len()?;
                let mut v = Vec::with_capacity(len.min(0xff));
                for _ in 0..len {
                    v.push(self.read_u8()? != 0);
                }
                Ok(Value::BooleanArray(v))
            }
            ValueType::DoubleArray => {
                let len = self.read_array_len()?;
                let mut v = Vec::with_capacity(len.min(0xff));
                for _ in 0..len {
                    v.push(self.read_double()?);
                }
                Ok(Value::DoubleArray(v))
            }
            ValueType::StringArray => {
                let len = self.read_array_len()?;
                let mut v = Vec::with_capacity(len.min(0xff));
                for _ in 0..len {
                    v.push(self.read_string()?);
                }
                Ok(Value::StringArray(v))
            }
        }
    }

    /// Reads a value tagged with its own type byte.
    #[inline]
    pub fn read_tagged_value(&mut self) -> WireResult<Value> {
        let vtype = self.read_type()?;
        self.read_value(vtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTO_REV_2;
    use std::io::Cursor;

    fn decode(data: &[u8], proto_rev: u16) -> WireDecoder<Cursor<&[u8]>> {
        WireDecoder::new(Cursor::new(data), proto_rev)
    }

    #[test]
    fn test_uleb128_roundtrip() {
        for &v in &[0u64, 1, 127, 128, 300, 16383, 16384, u32::max_value() as u64] {
            let mut enc = WireEncoder::new(PROTO_REV_3);
            enc.write_uleb128(v);

            let mut dec = WireDecoder::new(Cursor::new(enc.data().to_vec()), PROTO_REV_3);
            assert_eq!(dec.read_uleb128().unwrap(), v);
        }
    }

    #[test]
    fn test_uleb128_single_bytes() {
        let mut enc = WireEncoder::new(PROTO_REV_3);
        enc.write_uleb128(300);
        assert_eq!(enc.data(), &[0xac, 0x02]);
    }

    #[test]
    fn test_uleb128_overlong_rejected() {
        // Eleven continuation bytes cannot fit in 64 bits.
        let data = [0xffu8; 11];
        let mut dec = decode(&data, PROTO_REV_3);

        assert_eq!(
            dec.read_uleb128().unwrap_err(),
            WireError::BadMessage("uleb128 length out of range")
        );
    }

    #[test]
    fn test_double_encoding_v3() {
        let mut enc = WireEncoder::new(PROTO_REV_3);
        enc.write_value(&Value::Double(0.5)).unwrap();

        assert_eq!(
            enc.data(),
            &[0x01, 0x3f, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );

        let mut dec = decode(&[0x3f, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], PROTO_REV_3);
        assert_eq!(dec.read_value(ValueType::Double).unwrap(), Value::Double(0.5));
    }

    #[test]
    fn test_value_roundtrip_v3() {
        let values = vec![
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Double(-1234.5678),
            Value::Str("hello\0world".to_owned()),
            Value::Str(String::new()),
            Value::Raw(vec![0, 1, 2, 255]),
            Value::Rpc(vec![9, 8, 7]),
            Value::BooleanArray(vec![true, false, true]),
            Value::DoubleArray(vec![0.0, -0.5, 1e300]),
            Value::StringArray(vec!["a".to_owned(), String::new(), "c,d".to_owned()]),
        ];

        for value in values {
            let mut enc = WireEncoder::new(PROTO_REV_3);
            enc.write_value(&value).unwrap();

            let mut dec = WireDecoder::new(Cursor::new(enc.data().to_vec()), PROTO_REV_3);
            assert_eq!(dec.read_tagged_value().unwrap(), value);
        }
    }

    #[test]
    fn test_value_roundtrip_v2() {
        let values = vec![
            Value::Boolean(true),
            Value::Double(0.25),
            Value::Str("plain".to_owned()),
            Value::BooleanArray(vec![false, true]),
            Value::DoubleArray(vec![7.5]),
            Value::StringArray(vec!["x".to_owned(), "y".to_owned()]),
        ];

        for value in values {
            let mut enc = WireEncoder::new(PROTO_REV_2);
            enc.write_value(&value).unwrap();

            let mut dec = WireDecoder::new(Cursor::new(enc.data().to_vec()), PROTO_REV_2);
            assert_eq!(dec.read_tagged_value().unwrap(), value);
        }
    }

    #[test]
    fn test_raw_rejected_at_v2() {
        let mut enc = WireEncoder::new(PROTO_REV_2);
        assert!(enc.write_value(&Value::Raw(vec![1])).is_err());
        assert!(enc.write_type(ValueType::Rpc).is_err());

        let mut dec = decode(&[0x00], PROTO_REV_2);
        assert!(dec.read_value(ValueType::Raw).is_err());
    }

    #[test]
    fn test_boolean_array_truncated_at_v2() {
        let big = Value::BooleanArray(vec![true; 300]);

        let mut enc = WireEncoder::new(PROTO_REV_2);
        enc.write_value_payload(&big).unwrap();

        assert_eq!(enc.len(), 1 + 255);
        assert_eq!(enc.data()[0], 0xff);

        let mut dec = WireDecoder::new(Cursor::new(enc.data().to_vec()), PROTO_REV_2);
        match dec.read_value(ValueType::BooleanArray).unwrap() {
            Value::BooleanArray(v) => assert_eq!(v.len(), 255),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_large_array_allowed_at_v3() {
        let big = Value::BooleanArray(vec![false; 300]);

        let mut enc = WireEncoder::new(PROTO_REV_3);
        enc.write_value_payload(&big).unwrap();

        // 2-byte uleb128 count followed by every element
        assert_eq!(enc.len(), 2 + 300);

        let mut dec = WireDecoder::new(Cursor::new(enc.data().to_vec()), PROTO_REV_3);
        assert_eq!(dec.read_value(ValueType::BooleanArray).unwrap(), big);
    }

    #[test]
    fn test_string_truncated_at_v2() {
        let long = "x".repeat(0x1_0002);

        let mut enc = WireEncoder::new(PROTO_REV_2);
        enc.write_string(long.as_bytes());

        assert_eq!(enc.len(), 2 + 0xffff);
        assert_eq!(&enc.data()[..2], &[0xff, 0xff]);
    }

    #[test]
    fn test_string_invalid_utf8() {
        // uleb128 length 2, then a stray continuation byte
        let mut dec = decode(&[0x02, 0xc3, 0x28], PROTO_REV_3);

        assert_eq!(
            dec.read_string().unwrap_err(),
            WireError::BadMessage("invalid utf-8 in string")
        );
    }

    #[test]
    fn test_unexpected_eof() {
        let mut dec = decode(&[0x05, b'a', b'b'], PROTO_REV_3);

        assert_eq!(
            dec.read_string().unwrap_err(),
            WireError::Io(io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn test_unknown_type_byte() {
        let mut dec = decode(&[0x7f], PROTO_REV_3);

        assert_eq!(
            dec.read_type().unwrap_err(),
            WireError::BadMessage("unrecognized value type")
        );
    }
}
