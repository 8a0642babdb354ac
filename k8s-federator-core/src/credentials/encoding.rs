//! DER building blocks for client certificate requests.
//!
//! rcgen keys a distinguished name by attribute type, so a subject carrying
//! several `O` entries (one per group) has to be written out by hand.

use rcgen::{KeyPair, PublicKeyData, SigningKey, PKCS_ECDSA_P256_SHA256};
use yasna::{models::ObjectIdentifier, DERWriter, Tag};

const COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const ORGANIZATION_NAME: &[u64] = &[2, 5, 4, 10];
const ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];

const PEM_LINE_WIDTH: usize = 64;

/// Keys are always P-256, matching [`write_signature_algorithm`].
pub fn generate_key_pair() -> Result<KeyPair, rcgen::Error> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
}

fn write_attribute(writer: DERWriter, oid: &[u64], value: &str) {
    writer.write_set(|writer| {
        writer.next().write_sequence(|writer| {
            writer.next().write_oid(&ObjectIdentifier::from_slice(oid));
            writer.next().write_utf8_string(value);
        })
    })
}

/// X.509 `Name` with the common name first and one RDN per organization.
pub fn encode_subject(common_name: &str, organizations: &[String]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            write_attribute(writer.next(), COMMON_NAME, common_name);
            for organization in organizations {
                write_attribute(writer.next(), ORGANIZATION_NAME, organization);
            }
        })
    })
}

pub fn write_signature_algorithm(writer: DERWriter) {
    writer.write_sequence(|writer| {
        writer
            .next()
            .write_oid(&ObjectIdentifier::from_slice(ECDSA_WITH_SHA256));
    })
}

/// Wraps `body` into the `{ body, algorithm, signature }` envelope shared by
/// certificates and certification requests.
pub fn sign_document(body: &[u8], key: &KeyPair) -> Result<Vec<u8>, rcgen::Error> {
    let signature = key.sign(body)?;

    Ok(yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_der(body);
            write_signature_algorithm(writer.next());
            writer
                .next()
                .write_bitvec_bytes(&signature, signature.len() * 8);
        })
    }))
}

/// DER PKCS#10 request for `subject`, signed with `key`.
pub fn encode_certification_request(
    subject: &[u8],
    key: &KeyPair,
) -> Result<Vec<u8>, rcgen::Error> {
    let info = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_u8(0);
            writer.next().write_der(subject);
            writer.next().write_der(&key.subject_public_key_info());
            writer
                .next()
                .write_tagged_implicit(Tag::context(0), |writer| writer.write_set(|_| {}));
        })
    });

    sign_document(&info, key)
}

pub fn to_pem(label: &str, der: &[u8]) -> String {
    let encoded = data_encoding::BASE64.encode(der);
    let mut pem = format!("-----BEGIN {label}-----\n");
    for line in encoded.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));

    pem
}
