//! HPACK header compression (component C2, RFC 7541).
//!
//! The teacher's `hpack.rs` sketched the shape of this module (a
//! `TableEntry`/`Table` pair backing an `Encoder` and a `Decoder`, each
//! owning an independent dynamic table, checked for round-trip fidelity
//! against the external `hpack` crate in its tests) but left `encode`,
//! `encode_integer` and `decode` unimplemented. This module fills those
//! bodies in for real: the prefixed-integer codec, the string literal
//! codec (plain or Huffman-coded, see `huffman.rs`), and the dynamic
//! table eviction policy described in spec §3/§4.2.

use crate::h2::huffman;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::OnceLock;

pub type HeaderField = (Bytes, Bytes);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input ended before a complete representation was read")]
    UnexpectedEnd,
    #[error("prefixed integer overflowed")]
    IntegerOverflow,
    #[error("header field index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("dynamic table size update to {0} exceeds the negotiated maximum {1}")]
    TableSizeExceedsMaximum(usize, usize),
    #[error("Huffman-coded string contained an invalid code")]
    InvalidHuffmanCode,
}

#[derive(Debug, Clone)]
struct TableEntry {
    size: usize,
    name: Bytes,
    value: Bytes,
}

impl TableEntry {
    fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ $(,)? ) => {
        [ $( (&$name[..], &$value[..]) ),+ ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [(&[u8], &[u8]); 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b"",
];

#[derive(Debug, Clone)]
struct Table {
    max_size: usize,
    current_size: usize,
    entries: std::collections::VecDeque<TableEntry>,
}

impl Table {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            entries: std::collections::VecDeque::new(),
        }
    }

    /// 1-indexed lookup across the static table (1..=61) then the
    /// dynamic table (62.., newest first).
    fn get(&self, index: usize) -> Option<(Bytes, Bytes)> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Some((Bytes::from_static(name), Bytes::from_static(value)));
        }
        self.entries
            .get(index - STATIC_TABLE.len() - 1)
            .map(|e| (e.name.clone(), e.value.clone()))
    }

    fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name && *v == value {
                return Some((i + 1, true));
            }
        }
        for (i, e) in self.entries.iter().enumerate() {
            if e.name.as_ref() == name && e.value.as_ref() == value {
                return Some((i + STATIC_TABLE.len() + 1, true));
            }
        }
        self.find_name_only(name)
    }

    fn find_name_only(&self, name: &[u8]) -> Option<(usize, bool)> {
        for (i, (n, _)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                return Some((i + 1, false));
            }
        }
        for (i, e) in self.entries.iter().enumerate() {
            if e.name.as_ref() == name {
                return Some((i + STATIC_TABLE.len() + 1, false));
            }
        }
        None
    }

    fn push(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        self.current_size += entry.size;
        self.entries.push_front(entry);
        self.evict();
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            match self.entries.pop_back() {
                Some(popped) => self.current_size -= popped.size,
                None => break,
            }
        }
    }
}

// ---- prefixed-integer codec (RFC 7541 §5.1) ---------------------------

/// Encodes `value` using an `n`-bit prefix, appending to `out`. The
/// caller is responsible for OR-ing the representation's leading flag
/// bits into the first byte before this call writes the prefix bits.
fn encode_integer(out: &mut BytesMut, n: u8, flag_bits: u8, mut value: u64) {
    let max_prefix = (1u64 << n) - 1;
    if value < max_prefix {
        out.extend_from_slice(&[flag_bits | value as u8]);
        return;
    }
    out.extend_from_slice(&[flag_bits | max_prefix as u8]);
    value -= max_prefix;
    while value >= 128 {
        out.extend_from_slice(&[(value % 128) as u8 + 128]);
        value /= 128;
    }
    out.extend_from_slice(&[value as u8]);
}

/// Decodes an `n`-bit-prefixed integer starting at `buf[0]`. Returns
/// `(value, bytes consumed)`.
fn decode_integer(buf: &[u8], n: u8) -> Result<(u64, usize), DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::UnexpectedEnd);
    }
    let max_prefix = (1u64 << n) - 1;
    let prefix = (buf[0] as u64) & max_prefix;
    if prefix < max_prefix {
        return Ok((prefix, 1));
    }
    let mut value = max_prefix;
    let mut m = 0u32;
    let mut i = 1;
    loop {
        let byte = *buf.get(i).ok_or(DecodeError::UnexpectedEnd)?;
        value = value
            .checked_add(((byte & 0x7f) as u64).checked_shl(m).ok_or(DecodeError::IntegerOverflow)?)
            .ok_or(DecodeError::IntegerOverflow)?;
        i += 1;
        if byte & 0x80 == 0 {
            break;
        }
        m += 7;
        if m > 63 {
            return Err(DecodeError::IntegerOverflow);
        }
    }
    Ok((value, i))
}

// ---- string literal codec (RFC 7541 §5.2) -----------------------------

fn encode_string(out: &mut BytesMut, s: &[u8]) {
    // Always plain (non-Huffman) — legal per spec.md: "Huffman coding of
    // string literals is optional". The H-bit is the top bit of the
    // length prefix, left clear here.
    encode_integer(out, 7, 0x00, s.len() as u64);
    out.extend_from_slice(s);
}

fn decode_string(buf: &[u8]) -> Result<(Bytes, usize), DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::UnexpectedEnd);
    }
    let huffman_flag = buf[0] & 0x80 != 0;
    let (len, prefix_len) = decode_integer(buf, 7)?;
    let len = len as usize;
    let start = prefix_len;
    let end = start.checked_add(len).ok_or(DecodeError::IntegerOverflow)?;
    let raw = buf.get(start..end).ok_or(DecodeError::UnexpectedEnd)?;
    let value = if huffman_flag {
        Bytes::from(huffman_decode(raw)?)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((value, end))
}

type HuffmanMap = HashMap<(u8, u32), u16>;

fn huffman_decode_map() -> &'static HuffmanMap {
    static MAP: OnceLock<HuffmanMap> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = HashMap::with_capacity(huffman::TABLE.len());
        for (symbol, (code, len)) in huffman::TABLE.iter().enumerate() {
            map.insert((*len, *code), symbol as u16);
        }
        map
    })
}

fn huffman_decode(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let map = huffman_decode_map();
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut code: u32 = 0;
    let mut len: u8 = 0;
    for &byte in data {
        for bit_index in (0..8).rev() {
            let bit = (byte >> bit_index) & 1;
            code = (code << 1) | u32::from(bit);
            len += 1;
            if let Some(&symbol) = map.get(&(len, code)) {
                if symbol == 256 {
                    return Err(DecodeError::InvalidHuffmanCode);
                }
                out.push(symbol as u8);
                code = 0;
                len = 0;
            }
            if len > 30 {
                return Err(DecodeError::InvalidHuffmanCode);
            }
        }
    }
    // Remaining bits must be the EOS prefix (all ones); anything else is
    // an encoding error, but a short stray run of 1-bits is valid padding.
    if len > 0 {
        let padding_mask = (1u32 << len) - 1;
        if code & padding_mask != padding_mask {
            return Err(DecodeError::InvalidHuffmanCode);
        }
    }
    Ok(out)
}

// ---- Encoder / Decoder -------------------------------------------------

#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
}

impl Encoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
        }
    }

    pub fn set_max_dynamic_table_size(&mut self, size: usize) {
        self.table.resize(size);
    }

    /// Encodes a sequence of header fields, consulting and updating this
    /// encoder's dynamic table as it goes (spec §4.2 encoding rule).
    pub fn encode<K, V>(&mut self, headers: impl IntoIterator<Item = (K, V)>) -> Bytes
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut out = BytesMut::new();
        for (name, value) in headers {
            self.encode_one(&mut out, name.as_ref(), value.as_ref());
        }
        out.freeze()
    }

    fn encode_one(&mut self, out: &mut BytesMut, name: &[u8], value: &[u8]) {
        match self.table.find(name, value) {
            Some((index, true)) => {
                // Indexed Header Field, §6.1.
                encode_integer(out, 7, 0x80, index as u64);
            }
            Some((name_index, false)) => {
                self.encode_literal(out, Some(name_index), name, value);
            }
            None => {
                self.encode_literal(out, None, name, value);
            }
        }
    }

    fn encode_literal(
        &mut self,
        out: &mut BytesMut,
        name_index: Option<usize>,
        name: &[u8],
        value: &[u8],
    ) {
        let entry_size = name.len() + value.len() + 32;
        let fits = entry_size <= self.table.max_size;
        let flag_bits = if fits { 0x40 } else { 0x00 };
        let prefix_bits = if fits { 6 } else { 4 };
        match name_index {
            Some(index) => encode_integer(out, prefix_bits, flag_bits, index as u64),
            None => {
                encode_integer(out, prefix_bits, flag_bits, 0);
                encode_string(out, name);
            }
        }
        encode_string(out, value);
        if fits {
            self.table.push(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(4096)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    max_allowed_size: usize,
}

impl Decoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            max_allowed_size: dynamic_table_size,
        }
    }

    /// The negotiated ceiling a peer's dynamic-table-size-update may not
    /// exceed (our SETTINGS_HEADER_TABLE_SIZE).
    pub fn set_max_allowed_size(&mut self, size: usize) {
        self.max_allowed_size = size;
        if self.table.max_size > size {
            self.table.resize(size);
        }
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<HeaderField>, DecodeError> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            pos += self.decode_one(&data[pos..], &mut out)?;
        }
        Ok(out)
    }

    fn decode_one(&mut self, buf: &[u8], out: &mut Vec<HeaderField>) -> Result<usize, DecodeError> {
        let first = *buf.first().ok_or(DecodeError::UnexpectedEnd)?;
        if first & 0x80 != 0 {
            // Indexed Header Field, §6.1.
            let (index, consumed) = decode_integer(buf, 7)?;
            let (name, value) = self
                .table
                .get(index as usize)
                .ok_or(DecodeError::IndexOutOfRange(index as usize))?;
            out.push((name, value));
            return Ok(consumed);
        }
        if first & 0x40 != 0 {
            return self.decode_literal(buf, 6, true, out);
        }
        if first & 0x20 != 0 {
            // Dynamic Table Size Update, §6.3.
            let (size, consumed) = decode_integer(buf, 5)?;
            let size = size as usize;
            if size > self.max_allowed_size {
                return Err(DecodeError::TableSizeExceedsMaximum(size, self.max_allowed_size));
            }
            self.table.resize(size);
            return Ok(consumed);
        }
        // 0x10 (never indexed) and 0x00 (without indexing) decode the same.
        self.decode_literal(buf, 4, false, out)
    }

    fn decode_literal(
        &mut self,
        buf: &[u8],
        prefix_bits: u8,
        incremental: bool,
        out: &mut Vec<HeaderField>,
    ) -> Result<usize, DecodeError> {
        let (name_index, mut consumed) = decode_integer(buf, prefix_bits)?;
        let name = if name_index == 0 {
            let (name, used) = decode_string(&buf[consumed..])?;
            consumed += used;
            name
        } else {
            self.table
                .get(name_index as usize)
                .ok_or(DecodeError::IndexOutOfRange(name_index as usize))?
                .0
        };
        let (value, used) = decode_string(&buf[consumed..])?;
        consumed += used;
        if incremental {
            self.table.push(name.clone(), value.clone());
        }
        out.push((name, value));
        Ok(consumed)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip_single_byte() {
        // RFC 7541 Appendix C.1.1: 10 encoded with a 5-bit prefix.
        let mut out = BytesMut::new();
        encode_integer(&mut out, 5, 0, 10);
        assert_eq!(&out[..], &[0b00001010]);
        assert_eq!(decode_integer(&out, 5).unwrap(), (10, 1));
    }

    #[test]
    fn integer_round_trip_multi_byte() {
        // RFC 7541 Appendix C.1.2: 1337 with a 5-bit prefix.
        let mut out = BytesMut::new();
        encode_integer(&mut out, 5, 0, 1337);
        assert_eq!(&out[..], &[0b00011111, 0b10011010, 0b00001010]);
        assert_eq!(decode_integer(&out, 5).unwrap(), (1337, 3));
    }

    #[test]
    fn header_round_trip_basic() {
        let mut enc = Encoder::default();
        let mut dec = Decoder::default();
        let headers = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
            (Bytes::from_static(b"x-custom"), Bytes::from_static(b"value")),
        ];
        let encoded = enc.encode(headers.clone());
        let decoded = dec.decode(&encoded).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn repeated_headers_shrink_with_dynamic_table_reuse() {
        let mut enc = Encoder::default();
        let first = enc.encode(vec![
            (b":authority".to_vec(), b"api.example.com".to_vec()),
            (b":path".to_vec(), b"/a".to_vec()),
        ]);
        let second = enc.encode(vec![
            (b":authority".to_vec(), b"api.example.com".to_vec()),
            (b":path".to_vec(), b"/b".to_vec()),
        ]);
        assert!(second.len() <= first.len());

        let mut dec = Decoder::default();
        assert_eq!(
            dec.decode(&first).unwrap(),
            vec![
                (Bytes::from_static(b":authority"), Bytes::from("api.example.com")),
                (Bytes::from_static(b":path"), Bytes::from("/a")),
            ]
        );
        assert_eq!(
            dec.decode(&second).unwrap(),
            vec![
                (Bytes::from_static(b":authority"), Bytes::from("api.example.com")),
                (Bytes::from_static(b":path"), Bytes::from("/b")),
            ]
        );
    }

    #[test]
    fn huffman_decode_round_trips_plain_ascii() {
        // Build a Huffman-coded literal by hand-encoding "www.example.com"
        // with our own table, then decode it with `decode_string`.
        let word = b"www.example.com";
        let mut bitbuf: u64 = 0;
        let mut bitlen: u32 = 0;
        let mut bytes = Vec::new();
        for &b in word {
            let (code, len) = huffman::TABLE[b as usize];
            bitbuf = (bitbuf << len) | u64::from(code);
            bitlen += u32::from(len);
            while bitlen >= 8 {
                bitlen -= 8;
                bytes.push((bitbuf >> bitlen) as u8);
            }
        }
        if bitlen > 0 {
            let pad = 8 - bitlen;
            bytes.push(((bitbuf << pad) | ((1 << pad) - 1)) as u8);
        }
        let mut framed = BytesMut::new();
        encode_integer(&mut framed, 7, 0x80, bytes.len() as u64);
        framed.extend_from_slice(&bytes);
        let (decoded, consumed) = decode_string(&framed).unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(&decoded[..], &word[..]);
    }

    #[test]
    fn index_out_of_range_errors() {
        let mut dec = Decoder::default();
        let mut out = BytesMut::new();
        encode_integer(&mut out, 7, 0x80, 9999);
        assert_eq!(
            dec.decode(&out),
            Err(DecodeError::IndexOutOfRange(9999))
        );
    }

    #[test]
    fn dynamic_table_size_update_beyond_maximum_errors() {
        let mut dec = Decoder::with_size(100);
        dec.set_max_allowed_size(100);
        let mut out = BytesMut::new();
        encode_integer(&mut out, 5, 0x20, 200);
        assert_eq!(
            dec.decode(&out),
            Err(DecodeError::TableSizeExceedsMaximum(200, 100))
        );
    }
}
