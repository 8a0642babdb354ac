use chrono::{DateTime, TimeZone, Utc};
use x509_parser::pem::parse_x509_pem;

use super::CredentialsError;

/// Group whose members the cluster signer never issues certificates for.
pub const CLUSTER_ADMIN_GROUP: &str = "system:masters";

const SECONDS_PER_DAY: i64 = 86400;

/// The parts of a client certificate the renewal logic looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub common_name: Option<String>,
    pub organizations: Vec<String>,
    pub not_after: DateTime<Utc>,
    /// DER encoded SubjectPublicKeyInfo
    pub public_key: Vec<u8>,
}

impl ClientCertificate {
    pub fn from_pem(pem: &[u8]) -> Result<Self, CredentialsError> {
        let (_, pem) = parse_x509_pem(pem)
            .map_err(|err| CredentialsError::InvalidCertificate(err.to_string()))?;
        let certificate = pem
            .parse_x509()
            .map_err(|err| CredentialsError::InvalidCertificate(err.to_string()))?;

        let subject = certificate.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned);
        let organizations = subject
            .iter_organization()
            .filter_map(|organization| organization.as_str().ok())
            .map(str::to_owned)
            .collect();
        let not_after = Utc
            .timestamp_opt(certificate.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| {
                CredentialsError::InvalidCertificate("expiry date is out of range".to_owned())
            })?;

        Ok(Self {
            common_name,
            organizations,
            not_after,
            public_key: certificate.public_key().raw.to_vec(),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }

    /// Whole days left until expiry are at most `days`.
    pub fn expires_within_days(&self, now: DateTime<Utc>, days: i64) -> bool {
        (self.not_after - now).num_seconds() / SECONDS_PER_DAY <= days
    }

    pub fn is_cluster_admin(&self) -> bool {
        self.organizations
            .iter()
            .any(|organization| organization == CLUSTER_ADMIN_GROUP)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::kubernetes::memory::TestCertificateAuthority;

    fn certificate(organizations: &[&str], days: i64) -> ClientCertificate {
        let ca = TestCertificateAuthority::new().unwrap();
        let (pem, _) = ca
            .issue_client_certificate("admin", organizations, Duration::days(days))
            .unwrap();

        ClientCertificate::from_pem(pem.as_bytes()).unwrap()
    }

    #[test]
    fn parses_subject() {
        let parsed = certificate(&["system:masters", "ops"], 30);

        assert_eq!(parsed.common_name.as_deref(), Some("admin"));
        assert_eq!(parsed.organizations, vec!["system:masters", "ops"]);
        assert!(parsed.is_cluster_admin());
        assert!(!parsed.public_key.is_empty());
    }

    #[test]
    fn expiry_threshold_is_inclusive() {
        let parsed = certificate(&[], 30);
        let seven_days_before = parsed.not_after - Duration::days(7);

        assert!(parsed.expires_within_days(seven_days_before, 7));
        assert!(parsed.expires_within_days(seven_days_before - Duration::hours(23), 7));
        assert!(!parsed.expires_within_days(seven_days_before - Duration::days(1), 7));
        assert!(!parsed.is_expired(seven_days_before));
        assert!(parsed.is_expired(parsed.not_after));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            ClientCertificate::from_pem(b"not a certificate"),
            Err(CredentialsError::InvalidCertificate(_))
        ));
    }
}
