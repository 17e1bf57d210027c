//! Structural rejection cases for the blob codec, built with raw CMS
//! assembly so each violation is exactly one field away from valid.

use cms::content_info::{CmsVersion, ContentInfo};
use cms::enveloped_data::{
    EncryptedContentInfo, EnvelopedData, KekIdentifier, KekRecipientInfo, RecipientInfo,
};
use der::asn1::{Any, ObjectIdentifier, OctetString, SetOfVec};
use der::Encode;
use uuid::Uuid;
use x509_cert::attr::Attribute;

use dshield_core::blob::{OID_ENVELOPED_DATA, OID_MICROSOFT_SOFTWARE, OID_PKCS7_DATA};
use dshield_core::crypto::{OID_AES256_GCM, OID_AES256_WRAP};
use dshield_core::{DpapiNgBlob, Error, KeyIdentifier};

fn packed_key_identifier() -> Vec<u8> {
    KeyIdentifier {
        version: 1,
        flags: 0,
        l0: 1,
        l1: 2,
        l2: 3,
        root_key_id: Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10),
        key_info: vec![0xaa; 32],
        domain_name: "shield.test".to_string(),
        forest_name: "shield.test".to_string(),
    }
    .pack()
}

fn recipient(enc_key: &[u8], key_attr_id: ObjectIdentifier) -> RecipientInfo {
    RecipientInfo::Kekri(KekRecipientInfo {
        version: CmsVersion::V4,
        kek_id: KekIdentifier {
            kek_identifier: OctetString::new(packed_key_identifier()).unwrap(),
            date: None,
            other: Some(Attribute {
                oid: key_attr_id,
                values: SetOfVec::new(),
            }),
        },
        key_enc_alg: spki::AlgorithmIdentifierOwned {
            oid: OID_AES256_WRAP,
            parameters: None,
        },
        encrypted_key: OctetString::new(enc_key.to_vec()).unwrap(),
    })
}

fn pack_enveloped(version: CmsVersion, recipients: Vec<RecipientInfo>) -> Vec<u8> {
    let enveloped = EnvelopedData {
        version,
        originator_info: None,
        recip_infos: SetOfVec::try_from(recipients).unwrap().into(),
        encrypted_content: EncryptedContentInfo {
            content_type: OID_PKCS7_DATA,
            content_enc_alg: spki::AlgorithmIdentifierOwned {
                oid: OID_AES256_GCM,
                parameters: None,
            },
            encrypted_content: Some(OctetString::new(vec![0xdd; 16]).unwrap()),
        },
        unprotected_attrs: None,
    };
    ContentInfo {
        content_type: OID_ENVELOPED_DATA,
        content: Any::encode_from(&enveloped).unwrap(),
    }
    .to_der()
    .unwrap()
}

#[test]
fn two_recipients_are_rejected() {
    let data = pack_enveloped(
        CmsVersion::V2,
        vec![
            recipient(&[0xc1; 40], OID_MICROSOFT_SOFTWARE),
            recipient(&[0xc2; 40], OID_MICROSOFT_SOFTWARE),
        ],
    );
    assert!(matches!(
        DpapiNgBlob::unpack(&data),
        Err(Error::InvalidFormat { .. })
    ));
}

#[test]
fn wrong_cms_version_is_rejected() {
    let data = pack_enveloped(
        CmsVersion::V0,
        vec![recipient(&[0xc1; 40], OID_MICROSOFT_SOFTWARE)],
    );
    assert!(matches!(
        DpapiNgBlob::unpack(&data),
        Err(Error::InvalidFormat { .. })
    ));
}

#[test]
fn unknown_key_attr_oid_is_rejected() {
    let data = pack_enveloped(
        CmsVersion::V2,
        vec![recipient(
            &[0xc1; 40],
            ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.10.1"),
        )],
    );
    assert!(matches!(
        DpapiNgBlob::unpack(&data),
        Err(Error::InvalidFormat { .. })
    ));
}

#[test]
fn garbage_input_is_rejected() {
    assert!(DpapiNgBlob::unpack(&[0u8; 7]).is_err());
    assert!(DpapiNgBlob::unpack(b"not a der document at all").is_err());
    assert!(DpapiNgBlob::unpack(&[]).is_err());
}
