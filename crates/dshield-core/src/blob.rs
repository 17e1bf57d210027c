//! The DPAPI-NG blob: a CMS `EnvelopedData` with a single KEK recipient
//! whose key identifier addresses a GKDI seed-tree leaf, plus Microsoft's
//! protection descriptor nested under the recipient's `other` attribute.

use cms::content_info::{CmsVersion, ContentInfo};
use cms::enveloped_data::{
    EncryptedContentInfo, EnvelopedData, KekIdentifier, KekRecipientInfo, RecipientInfo,
};
use der::asn1::{Any, ObjectIdentifier, OctetString, SetOfVec};
use der::{Decode, Encode, Reader, Sequence, SliceReader};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::Attribute;

use crate::error::{Error, Result};
use crate::key_id::KeyIdentifier;
use crate::sd;

/// id-envelopedData.
pub const OID_ENVELOPED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.3");
/// id-data, the inner content type of the encrypted content.
pub const OID_PKCS7_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// Microsoft Software, the `kekid.other` attribute id.
pub const OID_MICROSOFT_SOFTWARE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.74.1");
/// The NCrypt protection descriptor content type under Microsoft Software.
pub const OID_PROTECTION_DESCRIPTOR: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.74.1.1");

/// One `(type, value)` pair inside the protection descriptor.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct DescriptorAttribute {
    kind: String,
    value: String,
}

/// The `NCryptProtectionDescriptor` structure carried as `kekid.other`.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct NcryptProtectionDescriptor {
    content_type: ObjectIdentifier,
    descriptors: Vec<Vec<DescriptorAttribute>>,
}

/// A parsed protection descriptor string. Only the `SID` type exists here;
/// everything else NCrypt supports is out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionDescriptor {
    /// The SID authorised to unprotect.
    pub sid: String,
}

impl ProtectionDescriptor {
    /// Accepts a raw SID or the `SID=<sid>` descriptor form.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let (kind, value) = match descriptor.split_once('=') {
            Some((kind, value)) => (kind.trim(), value.trim()),
            None => ("SID", descriptor.trim()),
        };
        if !kind.eq_ignore_ascii_case("SID") {
            return Err(Error::unsupported("protection descriptor type", kind));
        }
        Ok(Self {
            sid: value.to_string(),
        })
    }
}

/// The unpacked DPAPI-NG blob.
///
/// The key identifier and target security descriptor locate and authorise
/// the KEK; the KEK unwraps the CEK; the CEK decrypts the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpapiNgBlob {
    pub key_identifier: KeyIdentifier,
    /// Target descriptor rebuilt from the embedded protection SID.
    pub security_descriptor: Vec<u8>,
    pub enc_cek: Vec<u8>,
    pub enc_cek_algorithm: ObjectIdentifier,
    pub enc_cek_parameters: Option<Vec<u8>>,
    pub enc_content: Vec<u8>,
    pub enc_content_algorithm: ObjectIdentifier,
    pub enc_content_parameters: Option<Vec<u8>>,
}

impl DpapiNgBlob {
    /// Serialise the blob.
    ///
    /// `blob_in_envelope` selects where the ciphertext goes: inside the
    /// `EncryptedContentInfo` (`NCryptProtectSecret` form) or appended raw
    /// after the DER document (LAPS form). The protection SID is recovered
    /// from the embedded security descriptor.
    pub fn pack(&self, blob_in_envelope: bool) -> Result<Vec<u8>> {
        let sid = sd::protected_sid(&self.security_descriptor)?;
        let descriptor = NcryptProtectionDescriptor {
            content_type: OID_PROTECTION_DESCRIPTOR,
            descriptors: vec![vec![DescriptorAttribute {
                kind: "SID".to_string(),
                value: sid,
            }]],
        };

        let recipient = RecipientInfo::Kekri(KekRecipientInfo {
            version: CmsVersion::V4,
            kek_id: KekIdentifier {
                kek_identifier: OctetString::new(self.key_identifier.pack())?,
                date: None,
                other: Some(Attribute {
                    oid: OID_MICROSOFT_SOFTWARE,
                    values: SetOfVec::try_from(vec![Any::encode_from(&descriptor)?])?,
                }),
            },
            key_enc_alg: AlgorithmIdentifierOwned {
                oid: self.enc_cek_algorithm,
                parameters: match &self.enc_cek_parameters {
                    Some(params) => Some(Any::from_der(params)?),
                    None => None,
                },
            },
            encrypted_key: OctetString::new(self.enc_cek.clone())?,
        });

        let enveloped = EnvelopedData {
            version: CmsVersion::V2,
            originator_info: None,
            recip_infos: SetOfVec::try_from(vec![recipient])?.into(),
            encrypted_content: EncryptedContentInfo {
                content_type: OID_PKCS7_DATA,
                content_enc_alg: AlgorithmIdentifierOwned {
                    oid: self.enc_content_algorithm,
                    parameters: match &self.enc_content_parameters {
                        Some(params) => Some(Any::from_der(params)?),
                        None => None,
                    },
                },
                encrypted_content: blob_in_envelope
                    .then(|| OctetString::new(self.enc_content.clone()))
                    .transpose()?,
            },
            unprotected_attrs: None,
        };

        let content_info = ContentInfo {
            content_type: OID_ENVELOPED_DATA,
            content: Any::encode_from(&enveloped)?,
        };

        let mut out = content_info.to_der()?;
        if !blob_in_envelope {
            out.extend_from_slice(&self.enc_content);
        }
        Ok(out)
    }

    /// Parse a blob, accepting both ciphertext placements.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(data).map_err(Error::from)?;
        let content_info = ContentInfo::decode(&mut reader)?;
        let consumed = u32::from(reader.position()) as usize;
        let trailing = &data[consumed..];

        if content_info.content_type != OID_ENVELOPED_DATA {
            return Err(Error::unsupported(
                "blob content type",
                content_info.content_type.to_string(),
            ));
        }
        let enveloped = EnvelopedData::from_der(&content_info.content.to_der()?)?;
        if enveloped.version != CmsVersion::V2 {
            return Err(Error::invalid("EnvelopedData version", 0));
        }
        if enveloped.recip_infos.0.len() != 1 {
            return Err(Error::invalid("recipient count", 0));
        }
        let kek_info = match enveloped.recip_infos.0.iter().next() {
            Some(RecipientInfo::Kekri(kekri)) => kekri,
            _ => return Err(Error::invalid("recipient type", 0)),
        };
        if kek_info.version != CmsVersion::V4 {
            return Err(Error::invalid("KEKRecipientInfo version", 0));
        }

        let key_identifier = KeyIdentifier::unpack(kek_info.kek_id.kek_identifier.as_bytes())?;

        let other = kek_info
            .kek_id
            .other
            .as_ref()
            .ok_or(Error::invalid("kekid.other", 0))?;
        if other.oid != OID_MICROSOFT_SOFTWARE {
            return Err(Error::invalid("kekid.other attribute id", 0));
        }
        let key_attr = other
            .values
            .iter()
            .next()
            .ok_or(Error::invalid("kekid.other attribute", 0))?;
        let descriptor = NcryptProtectionDescriptor::from_der(&key_attr.to_der()?)?;
        if descriptor.content_type != OID_PROTECTION_DESCRIPTOR {
            return Err(Error::invalid("protection descriptor content type", 0));
        }
        let attribute = descriptor
            .descriptors
            .first()
            .and_then(|group| group.first())
            .ok_or(Error::invalid("protection descriptor", 0))?;
        if attribute.kind != "SID" {
            return Err(Error::unsupported(
                "protection descriptor type",
                &*attribute.kind,
            ));
        }

        // The cache and GetKey both key off the target descriptor this SID
        // expands to, so it is rebuilt once here.
        let security_descriptor = sd::build_target_descriptor(&attribute.value)?;

        // Some producers leave the PKCS#7 payload empty and append the
        // ciphertext after the document instead.
        let enc_content = match &enveloped.encrypted_content.encrypted_content {
            Some(content) if !content.as_bytes().is_empty() => content.as_bytes().to_vec(),
            _ => trailing.to_vec(),
        };

        Ok(Self {
            key_identifier,
            security_descriptor,
            enc_cek: kek_info.encrypted_key.as_bytes().to_vec(),
            enc_cek_algorithm: kek_info.key_enc_alg.oid,
            enc_cek_parameters: match &kek_info.key_enc_alg.parameters {
                Some(params) => Some(params.to_der()?),
                None => None,
            },
            enc_content,
            enc_content_algorithm: enveloped.encrypted_content.content_enc_alg.oid,
            enc_content_parameters: match &enveloped.encrypted_content.content_enc_alg.parameters {
                Some(params) => Some(params.to_der()?),
                None => None,
            },
        })
    }
}
