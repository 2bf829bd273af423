use std::convert::TryFrom;

use tracing::{debug, error, info, instrument, trace, warn};
use tss_esapi::constants::{CapabilityType, SessionType};
use tss_esapi::handles::{
    AuthHandle, KeyHandle, ObjectHandle, PersistentTpmHandle, SessionHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    CapabilityData, Data, EncryptedSecret, IdObject, MaxBuffer, Private, Public, SensitiveData,
    SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::{Context, TctiNameConf};
use zeroize::Zeroizing;

use crate::blob::ActivationBlob;
use crate::error::{HsmError, Result};
use crate::select::{DeviceState, IdentityHsm};
use crate::signing;
use crate::templates::{
    EK_HANDLE, IDENTITY_KEY_HANDLE, SRK_HANDLE, WRAP_KEY_SIZE, endorsement_key_template,
    marshal_public, storage_root_key_template, wrap_key_template,
};

/// The identity wrap key, held by the TPM as an AES object under the SRK.
///
/// Both halves are marshaled so the store layer can persist them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedWrapKey {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

/// A TPM 2.0 device with a provisioned EK and SRK.
///
/// Every operation mutates the underlying ESAPI context, so callers must
/// serialize access to a device.
pub struct TpmDevice {
    ctx: Context,
    ek: KeyHandle,
    srk: KeyHandle,
    ek_public: Public,
    srk_public: Public,
    identity: Option<KeyHandle>,
    sealed_wrap_key: Option<SealedWrapKey>,
}

impl TpmDevice {
    /// Opens the TPM and makes sure the EK and SRK are persisted at their slots.
    ///
    /// Keys already present at a slot are reused.
    #[instrument(level = "debug", skip(tcti))]
    pub fn create(tcti: TctiNameConf) -> Result<Self> {
        let mut ctx = Context::new(tcti).map_err(|e| {
            error!(error = %e, "Failed to open TPM context");
            e
        })?;

        let (ek, ek_public) = provision_persistent(
            &mut ctx,
            Hierarchy::Endorsement,
            EK_HANDLE,
            endorsement_key_template()?,
        )?;
        let (srk, srk_public) = provision_persistent(
            &mut ctx,
            Hierarchy::Owner,
            SRK_HANDLE,
            storage_root_key_template()?,
        )?;
        let identity = lookup_persistent(&mut ctx, IDENTITY_KEY_HANDLE)?.map(KeyHandle::from);

        info!(
            identity_present = identity.is_some(),
            "TPM endorsement and storage root keys provisioned"
        );
        Ok(Self {
            ctx,
            ek,
            srk,
            ek_public,
            srk_public,
            identity,
            sealed_wrap_key: None,
        })
    }

    /// Returns the wrap key sealed by the most recent activation, if any.
    pub fn sealed_wrap_key(&self) -> Option<&SealedWrapKey> {
        self.sealed_wrap_key.as_ref()
    }

    /// Releases the TPM session. Persistent keys stay in the TPM.
    pub fn destroy(self) {
        debug!("Closing TPM device");
        drop(self);
    }

    fn start_endorsement_policy_session(&mut self) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(HsmError::MalformedResponse(
                "TPM did not return a policy session",
            ))?;

        let authorized = PolicySession::try_from(session).and_then(|policy_session| {
            self.ctx.execute_with_nullauth_session(|ctx| {
                ctx.policy_secret(
                    policy_session,
                    AuthHandle::Endorsement,
                    Default::default(),
                    Default::default(),
                    Default::default(),
                    None,
                )
            })
        });

        match authorized {
            Ok(_) => Ok(session),
            Err(e) => {
                error!(error = %e, "PolicySecret against the endorsement hierarchy failed");
                self.flush_session(session);
                Err(e.into())
            }
        }
    }

    fn flush_session(&mut self, session: AuthSession) {
        if let Err(e) = self
            .ctx
            .flush_context(ObjectHandle::from(SessionHandle::from(session)))
        {
            warn!(error = %e, "Failed to flush policy session");
        }
    }

    /// ActivateCredential against SRK/EK, recovering the inner wrap key.
    fn activate_credential(
        &mut self,
        credential: IdObject,
        secret: EncryptedSecret,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (srk, ek) = (self.srk, self.ek);
        let session = self.start_endorsement_policy_session()?;
        let recovered = self.ctx.execute_with_sessions(
            (Some(AuthSession::Password), Some(session), None),
            |ctx| ctx.activate_credential(srk, ek, credential, secret),
        );
        self.flush_session(session);

        let wrap_key = recovered.map_err(|e| {
            error!(error = %e, "ActivateCredential failed");
            e
        })?;
        Ok(Zeroizing::new(wrap_key.value().to_vec()))
    }

    /// Re-injects the wrap key as an AES-128 child of the SRK.
    fn seal_wrap_key(&mut self, wrap_key: &[u8]) -> Result<SealedWrapKey> {
        if wrap_key.len() != WRAP_KEY_SIZE {
            error!(len = wrap_key.len(), "Recovered wrap key has the wrong size");
            return Err(HsmError::InvalidParameter("wrap key must be 16 bytes"));
        }
        let srk = self.srk;
        let template = wrap_key_template()?;
        let sensitive = SensitiveData::try_from(wrap_key.to_vec())?;
        let created = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(srk, template, None, Some(sensitive), None, None)
        })?;

        let (public, private) =
            export_key_material_blobs(&created.out_public, &created.out_private)?;
        trace!(
            public_len = public.len(),
            private_len = private.len(),
            "sealed identity wrap key under SRK"
        );
        Ok(SealedWrapKey { public, private })
    }

    /// Persists a loaded transient key as the identity key and flushes the transient
    /// handle, whether or not the replacement succeeded.
    fn install_identity_key(&mut self, transient: KeyHandle) -> Result<()> {
        let installed = self.replace_identity_key(transient);
        flush(&mut self.ctx, transient.into());
        self.identity = Some(installed?);
        Ok(())
    }

    /// Moves a loaded transient key into the identity slot.
    ///
    /// Whatever occupies the slot is evicted first. An empty slot is not an error.
    /// The current identity handle is only dropped once its eviction succeeded.
    fn replace_identity_key(&mut self, transient: KeyHandle) -> Result<KeyHandle> {
        let existing = match self.identity {
            Some(handle) => Some(ObjectHandle::from(handle)),
            None => lookup_persistent(&mut self.ctx, IDENTITY_KEY_HANDLE)?,
        };

        match existing {
            Some(old) => {
                evict_persistent(&mut self.ctx, old, IDENTITY_KEY_HANDLE)?;
                self.identity = None;
                debug!("Evicted previous identity key");
            }
            None => debug!("No identity key to evict"),
        }

        let persistent = persist(&mut self.ctx, transient.into(), IDENTITY_KEY_HANDLE)?;
        Ok(persistent.into())
    }
}

impl IdentityHsm for TpmDevice {
    #[instrument(level = "debug", skip(self, blob), fields(blob_len = blob.len()))]
    fn activate_identity_key(&mut self, blob: &[u8]) -> Result<()> {
        let fields = ActivationBlob::parse(blob)?;
        let credential = IdObject::try_from(fields.credential.to_vec())?;
        let secret = EncryptedSecret::try_from(fields.encrypted_secret.to_vec())?;
        let duplicate = Private::try_from(fields.duplicate_private.to_vec())?;
        let seed = EncryptedSecret::try_from(fields.wrap_key_seed.to_vec())?;
        let public = Public::unmarshall(fields.public_area)?;

        let wrap_key = self.activate_credential(credential, secret)?;

        let srk = self.srk;
        let encryption_key = Data::try_from(wrap_key.to_vec())?;
        let import_public = public.clone();
        let imported = self
            .ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.import(
                    srk.into(),
                    Some(encryption_key),
                    import_public,
                    duplicate,
                    seed,
                    SymmetricDefinitionObject::AES_128_CFB,
                )
            })
            .map_err(|e| {
                error!(error = %e, "Import of the identity key failed");
                e
            })?;

        self.sealed_wrap_key = Some(self.seal_wrap_key(&wrap_key)?);

        let transient = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(srk, imported, public))?;
        self.install_identity_key(transient)?;
        info!("Identity key activated and persisted");
        Ok(())
    }

    fn endorsement_key(&self) -> Result<Vec<u8>> {
        marshal_public(&self.ek_public)
    }

    fn storage_root_key(&self) -> Result<Vec<u8>> {
        marshal_public(&self.srk_public)
    }

    fn sign_with_identity(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(HsmError::InvalidParameter("data to sign must not be empty"));
        }
        let identity = self.identity.ok_or(HsmError::NotProvisioned("identity key"))?;
        let buffer = MaxBuffer::try_from(data.to_vec())
            .map_err(|_| HsmError::InvalidParameter("data exceeds the TPM HMAC buffer"))?;

        let digest = self
            .ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.hmac(identity.into(), buffer, HashingAlgorithm::Sha256)
            })
            .map_err(|e| {
                error!(error = %e, "TPM HMAC with the identity key failed");
                e
            })?;

        if digest.value().is_empty() {
            return Err(HsmError::MalformedResponse("TPM returned an empty digest"));
        }
        Ok(digest.value().to_vec())
    }

    fn derive_and_sign_with_identity(&mut self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(HsmError::InvalidParameter("data to sign must not be empty"));
        }
        let derived = Zeroizing::new(self.sign_with_identity(identity)?);
        signing::sign(&derived, data)
    }

    fn state(&self) -> DeviceState {
        match self.identity {
            Some(_) => DeviceState::IdentityReady,
            None => DeviceState::Provisioned,
        }
    }
}

/// Export the key material into marshalled blobs (Vec<u8>).
pub fn export_key_material_blobs(
    public: &Public,
    private: &Private,
) -> Result<(Vec<u8>, Vec<u8>), tss_esapi::Error> {
    let pub_blob = public.marshall()?;
    let priv_blob = private.value().to_vec();
    Ok((pub_blob, priv_blob))
}

/// Reuses the object persisted at `slot`, or creates a primary from `template`
/// under `hierarchy` and persists it there.
fn provision_persistent(
    ctx: &mut Context,
    hierarchy: Hierarchy,
    slot: u32,
    template: Public,
) -> Result<(KeyHandle, Public)> {
    if let Some(existing) = lookup_persistent(ctx, slot)? {
        let handle = KeyHandle::from(existing);
        let (public, _name, _qualified_name) = ctx.read_public(handle)?;
        debug!(slot = format_args!("{slot:#010x}"), "Reusing persisted key");
        return Ok((handle, public));
    }

    let created = ctx.execute_with_nullauth_session(|ctx| {
        ctx.create_primary(hierarchy, template, None, None, None, None)
    })?;
    let persisted = persist(ctx, created.key_handle.into(), slot);
    flush(ctx, created.key_handle.into());

    let handle = persisted?;
    info!(slot = format_args!("{slot:#010x}"), "Created and persisted primary key");
    Ok((handle.into(), created.out_public))
}

/// Looks for an object at a persistent slot. `None` means the slot is empty.
fn lookup_persistent(ctx: &mut Context, slot: u32) -> Result<Option<ObjectHandle>> {
    let (data, _more) = ctx.get_capability(CapabilityType::Handles, slot, 1)?;
    let present = match data {
        CapabilityData::Handles(handles) => handles
            .into_inner()
            .into_iter()
            .any(|handle| u32::from(handle) == slot),
        other => {
            error!("Unexpected capability data type: {:?}", other);
            return Err(HsmError::MalformedResponse(
                "expected a handle list from GetCapability",
            ));
        }
    };
    if !present {
        return Ok(None);
    }

    let handle = ctx.tr_from_tpm_public(TpmHandle::Persistent(PersistentTpmHandle::new(slot)?))?;
    Ok(Some(handle))
}

fn persist(ctx: &mut Context, transient: ObjectHandle, slot: u32) -> Result<ObjectHandle> {
    let persistent = PersistentTpmHandle::new(slot)?;
    let handle = ctx.execute_with_nullauth_session(|ctx| {
        ctx.evict_control(Provision::Owner, transient, Persistent::from(persistent))
    })?;
    Ok(handle)
}

fn evict_persistent(ctx: &mut Context, handle: ObjectHandle, slot: u32) -> Result<()> {
    let persistent = PersistentTpmHandle::new(slot)?;
    ctx.execute_with_nullauth_session(|ctx| {
        ctx.evict_control(Provision::Owner, handle, Persistent::from(persistent))
    })?;
    Ok(())
}

fn flush(ctx: &mut Context, handle: ObjectHandle) {
    if let Err(e) = ctx.flush_context(handle) {
        warn!(error = %e, "Failed to flush transient handle");
    }
}
