//! FastCGI record codec.
//!
//! Implements the responder subset of the FastCGI wire protocol: the 8-byte
//! record header, BEGIN_REQUEST / END_REQUEST bodies, the PARAMS
//! name-value encoding with 1- and 4-byte length forms, and STDOUT
//! chunking. All multi-byte integers are big-endian.
//!
//! The codec is pure: it parses from and appends to byte buffers and never
//! touches sockets. The connection engine drives it.

/// Record header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Protocol version accepted on input and written on output.
pub const VERSION_1: u8 = 1;

/// Maximum content bytes per record.
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

/// Maximum encodable name/value length (4-byte form, high bit reserved).
pub const MAX_NAME_VALUE_LEN: usize = 0x7FFF_FFFF;

/// Record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Starts a request (management of the request id begins here).
    BeginRequest = 1,
    /// Aborts an in-flight request.
    AbortRequest = 2,
    /// Ends a request (emitted by the gateway).
    EndRequest = 3,
    /// Name-value parameter stream.
    Params = 4,
    /// Request body stream.
    Stdin = 5,
    /// Response body stream (emitted by the gateway).
    Stdout = 6,
}

impl RecordType {
    /// Parses a wire type byte. Unknown types return `None` and are
    /// skipped by the engine.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::BeginRequest),
            2 => Some(Self::AbortRequest),
            3 => Some(Self::EndRequest),
            4 => Some(Self::Params),
            5 => Some(Self::Stdin),
            6 => Some(Self::Stdout),
            _ => None,
        }
    }
}

/// END_REQUEST protocol status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request completed normally.
    RequestComplete = 0,
    /// Connection cannot multiplex (unused by this engine).
    CantMultiplex = 1,
    /// Resource limits prevented completion.
    Overloaded = 2,
    /// Role not implemented (unused by this engine).
    UnknownRole = 3,
}

/// BEGIN_REQUEST roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Standard request/response.
    Responder = 1,
    /// Authorizer.
    Authorizer = 2,
    /// Filter.
    Filter = 3,
}

impl Role {
    /// Parses a wire role. Unknown roles are still accepted by the engine;
    /// the handler decides semantics.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Responder),
            2 => Some(Self::Authorizer),
            3 => Some(Self::Filter),
            _ => None,
        }
    }
}

/// BEGIN_REQUEST flag bit: keep the connection open after the response.
pub const FLAG_KEEP_CONN: u8 = 1;

/// A parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Protocol version byte.
    pub version: u8,
    /// Raw record type byte.
    pub rtype: u8,
    /// Request id the record belongs to.
    pub request_id: u16,
    /// Content byte count.
    pub content_length: u16,
    /// Padding byte count after the content.
    pub padding_length: u8,
}

impl RecordHeader {
    /// Parses a header from the front of `buf`; `None` if fewer than
    /// [`HEADER_LEN`] bytes are available.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            version: buf[0],
            rtype: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Total wire length of the record: header + content + padding.
    #[must_use]
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }

    /// Encodes a header with version 1 and zero padding.
    #[must_use]
    pub fn encode(rtype: RecordType, request_id: u16, content_length: u16) -> [u8; HEADER_LEN] {
        let id = request_id.to_be_bytes();
        let len = content_length.to_be_bytes();
        [VERSION_1, rtype as u8, id[0], id[1], len[0], len[1], 0, 0]
    }
}

/// A parsed BEGIN_REQUEST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    /// Requested role (raw; see [`Role::from_u16`]).
    pub role: u16,
    /// Flag byte; only [`FLAG_KEEP_CONN`] is honored.
    pub flags: u8,
}

impl BeginRequestBody {
    /// Body size on the wire.
    pub const LEN: usize = 8;

    /// Parses the body; `None` when `content` is shorter than
    /// [`Self::LEN`].
    #[must_use]
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() < Self::LEN {
            return None;
        }
        Some(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    /// True when the peer asked to keep the connection open.
    #[must_use]
    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }

    /// Encodes the body (role, flags, five reserved zero bytes).
    #[must_use]
    pub fn encode(role: u16, flags: u8) -> [u8; Self::LEN] {
        let r = role.to_be_bytes();
        [r[0], r[1], flags, 0, 0, 0, 0, 0]
    }
}

/// Iterator over the name-value pairs of one PARAMS record's content.
///
/// Truncation within the record is not an error: iteration simply stops at
/// the record boundary, and decoding resumes at the start of the next
/// PARAMS record.
#[derive(Debug)]
pub struct ParamsIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ParamsIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let name_len = decode_name_value_length(self.buf, &mut self.pos)?;
        let value_len = decode_name_value_length(self.buf, &mut self.pos)?;
        let end = self.pos.checked_add(name_len)?.checked_add(value_len)?;
        if end > self.buf.len() {
            // Truncated pair; stop at the record boundary.
            self.pos = self.buf.len();
            return None;
        }
        let name = &self.buf[self.pos..self.pos + name_len];
        let value = &self.buf[self.pos + name_len..end];
        self.pos = end;
        Some((name, value))
    }
}

/// Iterates the name-value pairs encoded in a PARAMS record's content.
#[must_use]
pub fn params_pairs(content: &[u8]) -> ParamsIter<'_> {
    ParamsIter { buf: content, pos: 0 }
}

/// Decodes one name-value length at `*pos`: a single byte below 128, or a
/// 4-byte big-endian value with the high bit set on the first byte (masked
/// out). Returns `None` on truncation, leaving the cursor at the end.
pub fn decode_name_value_length(buf: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *buf.get(*pos)?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Some(first as usize);
    }
    if buf.len() - *pos < 4 {
        *pos = buf.len();
        return None;
    }
    let value = ((first as usize & 0x7F) << 24)
        | ((buf[*pos + 1] as usize) << 16)
        | ((buf[*pos + 2] as usize) << 8)
        | buf[*pos + 3] as usize;
    *pos += 4;
    Some(value)
}

/// Encodes one name-value length in the shortest legal form.
pub fn encode_name_value_length(out: &mut Vec<u8>, len: usize) {
    debug_assert!(len <= MAX_NAME_VALUE_LEN);
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Encodes one name-value pair.
pub fn encode_name_value(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_name_value_length(out, name.len());
    encode_name_value_length(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

/// Appends a single record (header + content, zero padding). The content
/// must fit one record.
pub fn append_record(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    out.extend_from_slice(&RecordHeader::encode(rtype, request_id, content.len() as u16));
    out.extend_from_slice(content);
}

/// Appends PARAMS records carrying the given pairs, splitting into
/// multiple records at pair boundaries, followed by the empty
/// end-of-PARAMS record.
pub fn append_params<'a>(
    out: &mut Vec<u8>,
    request_id: u16,
    pairs: impl IntoIterator<Item = (&'a [u8], &'a [u8])>,
) {
    let mut record = Vec::new();
    for (name, value) in pairs {
        let mut encoded = Vec::with_capacity(8 + name.len() + value.len());
        encode_name_value(&mut encoded, name, value);
        if !record.is_empty() && record.len() + encoded.len() > MAX_CONTENT_LEN {
            append_record(out, RecordType::Params, request_id, &record);
            record.clear();
        }
        record.extend_from_slice(&encoded);
    }
    if !record.is_empty() {
        append_record(out, RecordType::Params, request_id, &record);
    }
    append_record(out, RecordType::Params, request_id, &[]);
}

/// Appends the payload as STDOUT records chunked at [`MAX_CONTENT_LEN`],
/// terminated by the empty end-of-stream record.
pub fn append_stdout(out: &mut Vec<u8>, request_id: u16, payload: &[u8]) {
    for chunk in payload.chunks(MAX_CONTENT_LEN) {
        append_record(out, RecordType::Stdout, request_id, chunk);
    }
    append_record(out, RecordType::Stdout, request_id, &[]);
}

/// Appends an END_REQUEST record.
pub fn append_end_request(
    out: &mut Vec<u8>,
    request_id: u16,
    app_status: u32,
    protocol_status: ProtocolStatus,
) {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = protocol_status as u8;
    append_record(out, RecordType::EndRequest, request_id, &body);
}

/// Appends STDIN records for a body, chunked, with the empty terminator.
/// Used by clients and tests; the gateway itself only reads STDIN.
pub fn append_stdin(out: &mut Vec<u8>, request_id: u16, payload: &[u8]) {
    for chunk in payload.chunks(MAX_CONTENT_LEN) {
        append_record(out, RecordType::Stdin, request_id, chunk);
    }
    append_record(out, RecordType::Stdin, request_id, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_roundtrip() {
        let encoded = RecordHeader::encode(RecordType::BeginRequest, 0x0102, 0x0304);
        let header = RecordHeader::parse(&encoded).expect("full header");
        assert_eq!(header.version, VERSION_1);
        assert_eq!(header.rtype, RecordType::BeginRequest as u8);
        assert_eq!(header.request_id, 0x0102);
        assert_eq!(header.content_length, 0x0304);
        assert_eq!(header.padding_length, 0);
        assert_eq!(header.total_len(), HEADER_LEN + 0x0304);
    }

    #[test]
    fn header_parse_short_buffer() {
        assert!(RecordHeader::parse(&[1, 4, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn header_counts_padding() {
        let mut raw = RecordHeader::encode(RecordType::Params, 1, 10).to_vec();
        raw[6] = 3;
        let header = RecordHeader::parse(&raw).expect("full header");
        assert_eq!(header.total_len(), HEADER_LEN + 10 + 3);
    }

    #[test]
    fn begin_request_body() {
        let raw = BeginRequestBody::encode(Role::Responder as u16, FLAG_KEEP_CONN);
        let body = BeginRequestBody::parse(&raw).expect("full body");
        assert_eq!(body.role, 1);
        assert!(body.keep_conn());
        assert!(BeginRequestBody::parse(&raw[..7]).is_none());
    }

    #[test]
    fn length_one_byte_form_up_to_127() {
        let mut out = Vec::new();
        encode_name_value_length(&mut out, 127);
        assert_eq!(out, vec![127]);
        let mut pos = 0;
        assert_eq!(decode_name_value_length(&out, &mut pos), Some(127));
    }

    #[test]
    fn length_four_byte_form_from_128() {
        let mut out = Vec::new();
        encode_name_value_length(&mut out, 128);
        assert_eq!(out, vec![0x80, 0x00, 0x00, 0x80]);
        let mut pos = 0;
        assert_eq!(decode_name_value_length(&out, &mut pos), Some(128));
    }

    #[test]
    fn length_maximum() {
        let mut out = Vec::new();
        encode_name_value_length(&mut out, MAX_NAME_VALUE_LEN);
        assert_eq!(out, vec![0xFF, 0xFF, 0xFF, 0xFF]);
        let mut pos = 0;
        assert_eq!(
            decode_name_value_length(&out, &mut pos),
            Some(MAX_NAME_VALUE_LEN)
        );
    }

    #[test]
    fn length_truncated_long_form() {
        let mut pos = 0;
        assert_eq!(decode_name_value_length(&[0x80, 0x00], &mut pos), None);
        assert_eq!(pos, 2);
    }

    #[test]
    fn params_iter_basic() {
        let mut content = Vec::new();
        encode_name_value(&mut content, b"NAME", b"value");
        encode_name_value(&mut content, b"EMPTY", b"");
        let pairs: Vec<_> = params_pairs(&content).collect();
        assert_eq!(pairs, vec![(&b"NAME"[..], &b"value"[..]), (&b"EMPTY"[..], &b""[..])]);
    }

    #[test]
    fn params_iter_stops_at_truncated_pair() {
        let mut content = Vec::new();
        encode_name_value(&mut content, b"A", b"1");
        encode_name_value(&mut content, b"LOST", b"pair");
        content.truncate(content.len() - 2);
        let pairs: Vec<_> = params_pairs(&content).collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, b"A");
    }

    #[test]
    fn stdout_record_boundaries_for_large_payload() {
        let payload = vec![0x5A; 1024 * 1024];
        let mut out = Vec::new();
        append_stdout(&mut out, 9, &payload);

        let mut offset = 0;
        let mut lengths = Vec::new();
        let mut reassembled = Vec::new();
        loop {
            let header = RecordHeader::parse(&out[offset..]).expect("header");
            assert_eq!(header.rtype, RecordType::Stdout as u8);
            assert_eq!(header.request_id, 9);
            let content =
                &out[offset + HEADER_LEN..offset + HEADER_LEN + header.content_length as usize];
            reassembled.extend_from_slice(content);
            lengths.push(header.content_length as usize);
            offset += header.total_len();
            if header.content_length == 0 {
                break;
            }
        }
        assert_eq!(offset, out.len());
        assert_eq!(reassembled, payload);
        // Full records at the 65535 cap, a short final record, then the
        // zero-length terminator.
        let full = payload.len() / MAX_CONTENT_LEN;
        assert_eq!(lengths[..full], vec![MAX_CONTENT_LEN; full][..]);
        assert_eq!(*lengths.last().expect("terminator"), 0);
    }

    #[test]
    fn end_request_layout() {
        let mut out = Vec::new();
        append_end_request(&mut out, 2, 0x01020304, ProtocolStatus::Overloaded);
        let header = RecordHeader::parse(&out).expect("header");
        assert_eq!(header.rtype, RecordType::EndRequest as u8);
        assert_eq!(header.content_length, 8);
        let body = &out[HEADER_LEN..];
        assert_eq!(&body[..4], &[1, 2, 3, 4]);
        assert_eq!(body[4], ProtocolStatus::Overloaded as u8);
        assert_eq!(&body[5..8], &[0, 0, 0]);
    }

    #[test]
    fn unknown_record_type_is_none() {
        assert!(RecordType::from_u8(7).is_none());
        assert!(RecordType::from_u8(11).is_none());
        assert!(RecordType::from_u8(0).is_none());
    }

    fn decode_all_params(stream: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut offset = 0;
        let mut pairs = Vec::new();
        loop {
            let header = RecordHeader::parse(&stream[offset..]).expect("header");
            assert_eq!(header.rtype, RecordType::Params as u8);
            let content =
                &stream[offset + HEADER_LEN..offset + HEADER_LEN + header.content_length as usize];
            for (name, value) in params_pairs(content) {
                pairs.push((name.to_vec(), value.to_vec()));
            }
            offset += header.total_len();
            if header.content_length == 0 {
                break;
            }
        }
        pairs
    }

    proptest! {
        #[test]
        fn prop_stdout_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..200_000)) {
            let mut out = Vec::new();
            append_stdout(&mut out, 1, &payload);

            let mut offset = 0;
            let mut reassembled = Vec::new();
            loop {
                let header = RecordHeader::parse(&out[offset..]).expect("header");
                let content = &out[offset + HEADER_LEN..offset + HEADER_LEN + header.content_length as usize];
                reassembled.extend_from_slice(content);
                offset += header.total_len();
                if header.content_length == 0 {
                    break;
                }
            }
            prop_assert_eq!(reassembled, payload);
        }

        #[test]
        fn prop_params_roundtrip(
            entries in proptest::collection::btree_map(
                proptest::collection::vec(any::<u8>(), 1..200),
                proptest::collection::vec(any::<u8>(), 0..300),
                0..32,
            )
        ) {
            let mut out = Vec::new();
            append_params(&mut out, 1, entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
            let decoded = decode_all_params(&out);
            prop_assert_eq!(decoded.len(), entries.len());
            for (name, value) in decoded {
                prop_assert_eq!(entries.get(&name), Some(&value));
            }
        }

        #[test]
        fn prop_length_roundtrip(len in 0usize..=MAX_NAME_VALUE_LEN) {
            let mut out = Vec::new();
            encode_name_value_length(&mut out, len);
            prop_assert_eq!(out.len(), if len < 128 { 1 } else { 4 });
            let mut pos = 0;
            prop_assert_eq!(decode_name_value_length(&out, &mut pos), Some(len));
            prop_assert_eq!(pos, out.len());
        }
    }
}
