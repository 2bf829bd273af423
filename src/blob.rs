//! Parsing of the identity activation blob issued by the provisioning service.
//!
//! The blob is a sequence of big-endian, 16-bit length-prefixed TPM2B fields:
//!
//! ```text
//! TPM2B_ID_OBJECT         credential
//! TPM2B_ENCRYPTED_SECRET  encrypted secret
//! TPM2B_PRIVATE           duplicated identity key
//! TPM2B_ENCRYPTED_SECRET  encrypted wrap key seed
//! TPM2B_PUBLIC            identity key public area
//! UINT16 + bytes          encrypted payload
//! ```

use tracing::{debug, trace};

use crate::error::{HsmError, Result};

/// A forward-only reader that never reads past the end of its buffer.
#[derive(Debug, Clone)]
pub struct BlobCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BlobCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Advances by `len` bytes, failing if fewer than `len` remain.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            debug!(
                offset = self.offset,
                wanted = len,
                remaining = self.remaining(),
                "activation blob truncated"
            );
            return Err(HsmError::InvalidParameter("activation blob is truncated"));
        }
        let field = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(field)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a TPM2B structure and returns its body without the size prefix.
    pub fn read_sized(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }
}

/// The fields of an identity activation blob, borrowed from the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationBlob<'a> {
    pub credential: &'a [u8],
    pub encrypted_secret: &'a [u8],
    pub duplicate_private: &'a [u8],
    pub wrap_key_seed: &'a [u8],
    /// Body of the TPM2B_PUBLIC field, i.e. a marshaled TPMT_PUBLIC.
    pub public_area: &'a [u8],
    pub encrypted_payload: &'a [u8],
}

impl<'a> ActivationBlob<'a> {
    /// Splits `blob` into its fields in wire order.
    ///
    /// Every declared length is checked against the bytes left in the buffer.
    pub fn parse(blob: &'a [u8]) -> Result<Self> {
        if blob.is_empty() {
            return Err(HsmError::InvalidParameter("activation blob is empty"));
        }
        let mut cursor = BlobCursor::new(blob);

        let parsed = Self {
            credential: cursor.read_sized()?,
            encrypted_secret: cursor.read_sized()?,
            duplicate_private: cursor.read_sized()?,
            wrap_key_seed: cursor.read_sized()?,
            public_area: cursor.read_sized()?,
            encrypted_payload: cursor.read_sized()?,
        };

        if cursor.remaining() > 0 {
            debug!(
                trailing = cursor.remaining(),
                "ignoring trailing bytes after activation blob"
            );
        }
        trace!(
            credential = parsed.credential.len(),
            encrypted_secret = parsed.encrypted_secret.len(),
            duplicate_private = parsed.duplicate_private.len(),
            wrap_key_seed = parsed.wrap_key_seed.len(),
            public_area = parsed.public_area.len(),
            encrypted_payload = parsed.encrypted_payload.len(),
            "parsed activation blob"
        );
        Ok(parsed)
    }

    /// Serializes the fields back into wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let fields = [
            self.credential,
            self.encrypted_secret,
            self.duplicate_private,
            self.wrap_key_seed,
            self.public_area,
            self.encrypted_payload,
        ];
        let mut out = Vec::with_capacity(fields.iter().map(|f| f.len() + 2).sum());
        for field in fields {
            let len = u16::try_from(field.len()).map_err(|_| {
                HsmError::InvalidParameter("activation blob field exceeds 64 KiB")
            })?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(field);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) fn sample_blob() -> Vec<u8> {
    ActivationBlob {
        credential: b"credential-wrap-key",
        encrypted_secret: b"encrypted-secret",
        duplicate_private: b"duplicated identity key",
        wrap_key_seed: b"wrap-seed",
        public_area: b"public-area",
        encrypted_payload: b"payload",
    }
    .encode()
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields_in_order() {
        let blob = sample_blob();
        let parsed = ActivationBlob::parse(&blob).unwrap();

        assert_eq!(parsed.credential, b"credential-wrap-key");
        assert_eq!(parsed.encrypted_secret, b"encrypted-secret");
        assert_eq!(parsed.duplicate_private, b"duplicated identity key");
        assert_eq!(parsed.wrap_key_seed, b"wrap-seed");
        assert_eq!(parsed.public_area, b"public-area");
        assert_eq!(parsed.encrypted_payload, b"payload");
        assert_eq!(parsed.encode().unwrap(), blob);
    }

    #[test]
    fn test_every_truncation_fails() {
        let blob = sample_blob();
        for len in 0..blob.len() {
            assert!(
                matches!(
                    ActivationBlob::parse(&blob[..len]),
                    Err(HsmError::InvalidParameter(_))
                ),
                "blob truncated to {len} bytes parsed"
            );
        }
    }

    #[test]
    fn test_declared_length_beyond_buffer_fails() {
        // credential claims 0xFFFF bytes but only four follow
        let blob = [0xFF, 0xFF, 1, 2, 3, 4];
        assert!(ActivationBlob::parse(&blob).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut blob = sample_blob();
        blob.extend_from_slice(&[0xde, 0xad]);
        let parsed = ActivationBlob::parse(&blob).unwrap();
        assert_eq!(parsed.encrypted_payload, b"payload");
    }

    #[test]
    fn test_cursor_reads() {
        let data = [0x00, 0x02, 0xAB, 0xCD, 0x01];
        let mut cursor = BlobCursor::new(&data);
        assert_eq!(cursor.read_sized().unwrap(), &[0xAB, 0xCD]);
        assert_eq!(cursor.offset(), 4);
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.read_u16().is_err());
        // a failed read does not advance
        assert_eq!(cursor.take(1).unwrap(), &[0x01]);
        assert_eq!(cursor.remaining(), 0);
    }
}
