use std::convert::TryFrom;

/// PKCS#11-style attribute type tag.
pub type AttributeType = u64;

/// Attribute types whose value is itself an encoded sequence of
/// attributes.
pub const ATTR_WRAP_TEMPLATE: AttributeType = 0x0000_0211;
pub const ATTR_UNWRAP_TEMPLATE: AttributeType = 0x0000_0212;
pub const ATTR_DERIVE_TEMPLATE: AttributeType = 0x0000_0213;

/// Byte size of an encoded attribute header (type + length, both u64 LE).
const HEADER_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    AttributeValueInvalid,
    EncryptedDataInvalid,
    FunctionFailed,
    NotFound,
    OutOfMemory,
}
pub type Result<T> = std::result::Result<T, Error>;

pub fn is_array_type(attr_type: AttributeType) -> bool {
    matches!(
        attr_type,
        ATTR_WRAP_TEMPLATE | ATTR_UNWRAP_TEMPLATE | ATTR_DERIVE_TEMPLATE
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Bytes(Vec<u8>),
    Array(Vec<Attribute>),
}

/// An owned (type, length, value) attribute record. The length is implied:
/// it is always the byte size of the canonically encoded value, so the
/// two cannot drift apart. Nested arrays are materialized as owned
/// sub-records rather than offsets into a shared buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    attr_type: AttributeType,
    value: AttrValue,
}

impl Attribute {
    pub fn attr_type(&self) -> AttributeType {
        self.attr_type
    }

    pub fn value(&self) -> &AttrValue {
        &self.value
    }

    /// Byte size of the canonically encoded value.
    pub fn len(&self) -> usize {
        match &self.value {
            AttrValue::Bytes(b) => b.len(),
            AttrValue::Array(attrs) => attrs.iter().map(|a| HEADER_LEN + a.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value as flat bytes: the byte payload for plain records, the
    /// canonical encoding of the element sequence for array records.
    pub fn value_bytes(&self) -> Vec<u8> {
        match &self.value {
            AttrValue::Bytes(b) => b.clone(),
            AttrValue::Array(attrs) => {
                let mut out = Vec::new();
                for a in attrs {
                    a.encode(&mut out);
                }
                out
            }
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attr_type.to_le_bytes());
        out.extend_from_slice(&(self.len() as u64).to_le_bytes());
        match &self.value {
            AttrValue::Bytes(b) => out.extend_from_slice(b),
            AttrValue::Array(attrs) => {
                for a in attrs {
                    a.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Build an attribute record by deep-copying `bytes`. For array types the
/// bytes must be a canonically encoded sequence of nested records, which
/// is decoded (recursively) into owned sub-records; a malformed encoding
/// is `AttributeValueInvalid`.
pub fn build(attr_type: AttributeType, bytes: &[u8]) -> Result<Attribute> {
    let value = if is_array_type(attr_type) {
        AttrValue::Array(decode_list(bytes)?)
    } else {
        let mut copy = Vec::new();
        copy.try_reserve_exact(bytes.len())
            .map_err(|_| Error::OutOfMemory)?;
        copy.extend_from_slice(bytes);
        AttrValue::Bytes(copy)
    };
    Ok(Attribute { attr_type, value })
}

/// Decode a canonical encoding into a sequence of attribute records.
pub fn decode_list(mut buf: &[u8]) -> Result<Vec<Attribute>> {
    let mut attrs = Vec::new();
    while !buf.is_empty() {
        let (attr, rest) = decode_one(buf)?;
        attrs.push(attr);
        buf = rest;
    }
    Ok(attrs)
}

fn decode_one(buf: &[u8]) -> Result<(Attribute, &[u8])> {
    if buf.len() < HEADER_LEN {
        return Err(Error::AttributeValueInvalid);
    }
    let attr_type = u64::from_le_bytes(
        <[u8; 8]>::try_from(&buf[0..8]).map_err(|_| Error::AttributeValueInvalid)?,
    );
    let len = u64::from_le_bytes(
        <[u8; 8]>::try_from(&buf[8..16]).map_err(|_| Error::AttributeValueInvalid)?,
    ) as usize;
    let rest = &buf[HEADER_LEN..];
    if rest.len() < len {
        return Err(Error::AttributeValueInvalid);
    }
    let (value_bytes, rest) = rest.split_at(len);
    let attr = build(attr_type, value_bytes)?;
    // `build` recomputes the length from the decoded value; a record whose
    // declared length disagrees with its content cannot survive this.
    Ok((attr, rest))
}

/// Find the boolean attribute of type `attr_type`. The first record of the
/// requested type wins; its encoded length must be exactly one byte.
pub fn find_boolean(attrs: &[Attribute], attr_type: AttributeType) -> Result<bool> {
    for attr in attrs {
        if attr.attr_type != attr_type {
            continue;
        }
        return match &attr.value {
            AttrValue::Bytes(b) if b.len() == 1 => Ok(b[0] != 0),
            _ => Err(Error::AttributeValueInvalid),
        };
    }
    Err(Error::NotFound)
}

/// Append classic block-cipher padding to `buf[data_len..]`: `pad_len`
/// bytes each holding `pad_len`, where `pad_len` is `block_size -
/// (data_len % block_size)`. A `data_len` that is already block-aligned
/// gets a full extra block, so stripping is always unambiguous. Returns
/// the padded length. `buf.len()` is the total capacity.
pub fn add_padding(buf: &mut [u8], block_size: usize, data_len: usize) -> Result<usize> {
    if block_size == 0 || block_size > u8::MAX as usize {
        return Err(Error::FunctionFailed);
    }
    let pad_len = block_size - (data_len % block_size);
    let total = data_len + pad_len;
    if total > buf.len() {
        warn!("capacity too small to add padding");
        return Err(Error::FunctionFailed);
    }
    for b in &mut buf[data_len..total] {
        *b = pad_len as u8;
    }
    Ok(total)
}

/// Read back the data length of a padded buffer. The last byte claims the
/// pad count; a count larger than the buffer means corrupted or forged
/// ciphertext.
pub fn strip_padding(buf: &[u8]) -> Result<usize> {
    let total = buf.len();
    if total == 0 {
        return Err(Error::EncryptedDataInvalid);
    }
    let pad_len = buf[total - 1] as usize;
    if pad_len > total {
        return Err(Error::EncryptedDataInvalid);
    }
    Ok(total - pad_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTR_LABEL: AttributeType = 0x0000_0003;
    const ATTR_TOKEN: AttributeType = 0x0000_0001;

    #[test]
    fn build_copies_bytes_exactly() {
        let attr = build(ATTR_LABEL, b"my key").unwrap();
        assert_eq!(attr.attr_type(), ATTR_LABEL);
        assert_eq!(attr.len(), 6);
        assert_eq!(attr.value_bytes(), b"my key");
    }

    #[test]
    fn build_empty_value() {
        let attr = build(ATTR_LABEL, b"").unwrap();
        assert_eq!(attr.len(), 0);
        assert!(attr.is_empty());
    }

    #[test]
    fn nested_array_roundtrip() {
        let a = build(ATTR_TOKEN, &[1]).unwrap();
        let b = build(ATTR_LABEL, b"inner").unwrap();
        let c = build(0x0000_0102, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        let mut encoded = Vec::new();
        a.encode(&mut encoded);
        b.encode(&mut encoded);
        c.encode(&mut encoded);

        let tpl = build(ATTR_WRAP_TEMPLATE, &encoded).unwrap();
        assert_eq!(tpl.len(), encoded.len());
        match tpl.value() {
            AttrValue::Array(attrs) => {
                assert_eq!(attrs.len(), 3);
                assert_eq!(attrs[0], a);
                assert_eq!(attrs[1], b);
                assert_eq!(attrs[2], c);
            }
            _ => panic!("expected array value"),
        }
        // The canonical re-encoding matches the input.
        assert_eq!(tpl.value_bytes(), encoded);
    }

    #[test]
    fn truncated_array_is_invalid() {
        let a = build(ATTR_TOKEN, &[1]).unwrap();
        let encoded = a.to_bytes();
        assert_eq!(
            build(ATTR_WRAP_TEMPLATE, &encoded[..encoded.len() - 1]).unwrap_err(),
            Error::AttributeValueInvalid
        );
    }

    #[test]
    fn find_boolean_first_match_wins() {
        let attrs = vec![
            build(ATTR_LABEL, b"x").unwrap(),
            build(ATTR_TOKEN, &[1]).unwrap(),
            build(ATTR_TOKEN, &[0]).unwrap(),
        ];
        assert_eq!(find_boolean(&attrs, ATTR_TOKEN).unwrap(), true);
    }

    #[test]
    fn find_boolean_length_mismatch() {
        let attrs = vec![build(ATTR_TOKEN, &[1, 0]).unwrap()];
        assert_eq!(
            find_boolean(&attrs, ATTR_TOKEN).unwrap_err(),
            Error::AttributeValueInvalid
        );
    }

    #[test]
    fn find_boolean_not_found() {
        let attrs = vec![build(ATTR_LABEL, b"x").unwrap()];
        assert_eq!(find_boolean(&attrs, ATTR_TOKEN).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn padding_roundtrip_all_lengths() {
        for &block_size in &[8usize, 16] {
            for data_len in 0..block_size {
                let mut buf = vec![0xaa; data_len + block_size];
                let padded = add_padding(&mut buf, block_size, data_len).unwrap();
                assert_eq!(padded % block_size, 0);
                assert_eq!(strip_padding(&buf[..padded]).unwrap(), data_len);
            }
        }
    }

    #[test]
    fn aligned_data_gets_full_extra_block() {
        let mut buf = vec![0u8; 32];
        let padded = add_padding(&mut buf, 16, 16).unwrap();
        assert_eq!(padded, 32);
        assert!(buf[16..32].iter().all(|&b| b == 16));
        assert_eq!(strip_padding(&buf[..padded]).unwrap(), 16);
    }

    #[test]
    fn padding_capacity_overflow() {
        let mut buf = vec![0u8; 10];
        assert_eq!(
            add_padding(&mut buf, 8, 5).unwrap_err(),
            Error::FunctionFailed
        );
    }

    #[test]
    fn strip_detects_forged_pad_count() {
        let mut buf = vec![0u8; 16];
        let padded = add_padding(&mut buf, 8, 4).unwrap();
        buf[padded - 1] = (padded + 1) as u8;
        assert_eq!(
            strip_padding(&buf[..padded]).unwrap_err(),
            Error::EncryptedDataInvalid
        );
    }

    #[test]
    fn strip_empty_buffer_is_invalid() {
        assert_eq!(strip_padding(&[]).unwrap_err(), Error::EncryptedDataInvalid);
    }
}
