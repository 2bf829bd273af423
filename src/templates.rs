//! Public-area templates and persistent slots shared by the hardware and simulated backends.

use std::convert::TryFrom;

use tracing::trace;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::structures::{
    Digest, Public, PublicBuilder, PublicKeyRsa, PublicRsaParametersBuilder, RsaExponent,
    SymmetricCipherParameters, SymmetricDefinitionObject,
};
use tss_esapi::traits::Marshall;

use crate::error::{HsmError, Result};

/// Persistent handle of the Storage Root Key.
pub const SRK_HANDLE: u32 = 0x8100_0001;
/// Persistent handle of the Endorsement Key.
pub const EK_HANDLE: u32 = 0x8101_0001;
/// Persistent handle of the activated identity key.
pub const IDENTITY_KEY_HANDLE: u32 = 0x8100_0100;

/// Key size in bytes of the AES-128 wrap key.
pub const WRAP_KEY_SIZE: usize = 16;

/// Size of the scratch buffer a marshaled TPM2B_PUBLIC must fit in.
pub const PUBLIC_AREA_BUFFER_SIZE: usize = 1024;

// PolicySecret(TPM_RH_ENDORSEMENT), the default EK authorization policy.
const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xb3, 0xf8, 0x1a, 0x90, 0xcc, 0x8d, 0x46, 0xa5, 0xd7, 0x24,
    0xfd, 0x52, 0xd7, 0x6e, 0x06, 0x52, 0x0b, 0x64, 0xf2, 0xa1, 0xda, 0x1b, 0x33, 0x14, 0x69, 0xaa,
];

const RSA_2048_MODULUS_SIZE: usize = 256;

/// The standard RSA-2048 Endorsement Key template.
pub fn endorsement_key_template() -> Result<Public> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_admin_with_policy(true) // authorized through PolicySecret, not userWithAuth
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    let rsa_params = PublicRsaParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        RsaKeyBits::Rsa2048,
        RsaExponent::default(),
    )
    .build()?;

    let public = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_auth_policy(Digest::try_from(EK_AUTH_POLICY.to_vec())?)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::try_from(vec![0u8; RSA_2048_MODULUS_SIZE])?)
        .build()?;

    trace!(?public, "built endorsement key template");
    Ok(public)
}

/// RSA-2048 restricted decryption key used as the Storage Root Key.
pub fn storage_root_key_template() -> Result<Public> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    let rsa_params = PublicRsaParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        RsaKeyBits::Rsa2048,
        RsaExponent::default(),
    )
    .build()?;

    let public = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?;

    trace!(?public, "built storage root key template");
    Ok(public)
}

/// AES-128-CFB object holding the recovered identity wrap key as a child of the SRK.
///
/// sensitiveDataOrigin stays clear: the TPM takes the key bytes we hand it.
pub fn wrap_key_template() -> Result<Public> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_sign_encrypt(true)
        .with_decrypt(true)
        .build()?;

    let public = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::SymCipher)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
            SymmetricDefinitionObject::AES_128_CFB,
        ))
        .with_symmetric_cipher_unique_identifier(Digest::default())
        .build()?;

    Ok(public)
}

/// Marshals `public` as a TPM2B_PUBLIC (16-bit size followed by the TPMT_PUBLIC).
///
/// Fails instead of truncating when the result would not fit the scratch buffer.
pub fn marshal_public(public: &Public) -> Result<Vec<u8>> {
    let body = public.marshall()?;
    let size = body.len() + 2;
    if size > PUBLIC_AREA_BUFFER_SIZE {
        return Err(HsmError::PublicAreaTooLarge {
            size,
            limit: PUBLIC_AREA_BUFFER_SIZE,
        });
    }
    let len = u16::try_from(body.len()).map_err(|_| HsmError::PublicAreaTooLarge {
        size,
        limit: PUBLIC_AREA_BUFFER_SIZE,
    })?;

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
