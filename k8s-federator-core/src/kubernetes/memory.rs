//! In-memory object store emulating the API server behaviour the protocols
//! rely on: resource versions, finalizer-gated deletion, service account
//! token population and an external CSR signer.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::{certificates::v1::CertificateSigningRequest, core::v1::Namespace};
use kube::core::ErrorResponse;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, DnValue, IsCa, KeyPair,
    PublicKeyData,
};
use serde_json::{json, Value};
use x509_parser::{
    certification_request::X509CertificationRequest, pem::parse_x509_pem, prelude::FromDer,
};
use yasna::{tags::TAG_UTCTIME, DERWriter, Tag};

use crate::{
    credentials::{
        encoding::{
            encode_subject, generate_key_pair, sign_document, to_pem, write_signature_algorithm,
        },
        kubeconfig::KubeconfigDocument,
        CredentialsError,
    },
    resources::{
        annotations::SERVICE_ACCOUNT_NAME_ANNOTATION,
        federation::secret::{CA_CERT_KEY, SERVICE_ACCOUNT_TOKEN_TYPE, TOKEN_KEY},
    },
    KUBE_SYSTEM_NAMESPACE,
};

use super::{ClusterConnector, ObjectStore, StoreError, StoreResource};

const DEFAULT_SERVER_VERSION: &str = "v1.24.0";
const DEFAULT_NAMESPACE: &str = "default";

/// What the emulated signer does with an approved CSR.
pub enum SignerDecision {
    /// PEM certificate to publish in `status.certificate`
    Issue(Vec<u8>),
    /// adds a `Failed` condition with the given message
    Fail(String),
    /// leaves the CSR pending forever
    Ignore,
}

pub type CsrSigner = Arc<dyn Fn(&CertificateSigningRequest) -> SignerDecision + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    fn new<K: StoreResource>(namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind_of::<K>(),
            namespace: scoped_namespace::<K>(namespace),
            name: name.to_owned(),
        }
    }
}

fn kind_of<K: StoreResource>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn scoped_namespace<K: StoreResource>(namespace: Option<&str>) -> Option<String> {
    K::NAMESPACED.then(|| namespace.unwrap_or(DEFAULT_NAMESPACE).to_owned())
}

fn injected_error(message: &str) -> StoreError {
    StoreError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: message.to_owned(),
        reason: "InternalError".to_owned(),
        code: 500,
    }))
}

pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    revision: AtomicU64,
    server_version: String,
    ca_bundle: Vec<u8>,
    signer: Mutex<Option<CsrSigner>>,
    failing_kinds: Mutex<BTreeSet<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            server_version: DEFAULT_SERVER_VERSION.to_owned(),
            ca_bundle: b"member-ca".to_vec(),
            signer: Mutex::new(None),
            failing_kinds: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_server_version(self, version: &str) -> Self {
        Self {
            server_version: version.to_owned(),
            ..self
        }
    }

    pub fn with_ca_bundle(self, ca_bundle: &[u8]) -> Self {
        Self {
            ca_bundle: ca_bundle.to_vec(),
            ..self
        }
    }

    /// Seeds the `kube-system` namespace with a fixed UID.
    pub fn with_kube_system(self, uid: &str) -> Self {
        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(KUBE_SYSTEM_NAMESPACE.to_owned());
        namespace.metadata.uid = Some(uid.to_owned());
        self.insert(&namespace);

        self
    }

    pub fn set_signer(&self, signer: CsrSigner) {
        *lock(&self.signer) = Some(signer);
    }

    /// Makes every request touching `K` fail with an internal error.
    pub fn fail_requests_for<K: StoreResource>(&self) {
        lock(&self.failing_kinds).insert(kind_of::<K>());
    }

    /// Stores `resource` as-is, bypassing every admission rule.
    pub fn insert<K: StoreResource>(&self, resource: &K) {
        let name = resource.meta().name.clone().unwrap_or_default();
        let key = ObjectKey::new::<K>(resource.meta().namespace.as_deref(), &name);
        let mut value = match serde_json::to_value(resource) {
            Ok(value) => value,
            Err(_) => return,
        };
        value["metadata"]["resourceVersion"] = json!(self.next_revision());

        lock(&self.objects).insert(key, value);
    }

    pub fn contains<K: StoreResource>(&self, namespace: Option<&str>, name: &str) -> bool {
        lock(&self.objects).contains_key(&ObjectKey::new::<K>(namespace, name))
    }

    pub fn count<K: StoreResource>(&self) -> usize {
        let kind = kind_of::<K>();

        lock(&self.objects)
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_failure<K: StoreResource>(&self) -> Result<(), StoreError> {
        if lock(&self.failing_kinds).contains(&kind_of::<K>()) {
            return Err(injected_error("injected failure"));
        }

        Ok(())
    }

    fn decode<K: StoreResource>(value: &Value) -> Result<K, StoreError> {
        serde_json::from_value(value.clone()).map_err(StoreError::Serialization)
    }

    fn check_version<K: StoreResource>(
        existing: &Value,
        incoming: &Value,
        name: &str,
    ) -> Result<(), StoreError> {
        let incoming_version = &incoming["metadata"]["resourceVersion"];
        if incoming_version.is_string()
            && incoming_version != &existing["metadata"]["resourceVersion"]
        {
            return Err(StoreError::conflict::<K>(name));
        }

        Ok(())
    }

    fn populate_token(&self, value: &mut Value) {
        if value["type"] != SERVICE_ACCOUNT_TOKEN_TYPE {
            return;
        }

        let account = value["metadata"]["annotations"][SERVICE_ACCOUNT_NAME_ANNOTATION]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let token = format!("token-{account}");

        value["data"] = json!({
            TOKEN_KEY: data_encoding::BASE64.encode(token.as_bytes()),
            CA_CERT_KEY: data_encoding::BASE64.encode(&self.ca_bundle),
        });
    }

    fn sign(&self, value: &mut Value) -> Result<(), StoreError> {
        let signer = match lock(&self.signer).clone() {
            Some(signer) => signer,
            None => return Ok(()),
        };
        let csr: CertificateSigningRequest = Self::decode(value)?;

        match signer(&csr) {
            SignerDecision::Issue(certificate) => {
                value["status"]["certificate"] = json!(data_encoding::BASE64.encode(&certificate));
            }
            SignerDecision::Fail(message) => {
                let mut conditions = value["status"]["conditions"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                conditions.push(json!({
                    "type": "Failed",
                    "status": "True",
                    "reason": "SignerFailed",
                    "message": message,
                }));
                value["status"]["conditions"] = Value::Array(conditions);
            }
            SignerDecision::Ignore => (),
        }

        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_approved(value: &Value) -> bool {
    value["status"]["conditions"]
        .as_array()
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition["type"] == "Approved" && condition["status"] == "True")
        })
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .map_or(false, |finalizers| !finalizers.is_empty())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<K, StoreError> {
        self.check_failure::<K>()?;

        let objects = lock(&self.objects);
        let value = objects
            .get(&ObjectKey::new::<K>(namespace, name))
            .ok_or_else(|| StoreError::not_found::<K>(name))?;

        Self::decode(value)
    }

    async fn list<K: StoreResource>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.check_failure::<K>()?;

        let kind = kind_of::<K>();
        let namespace = namespace.filter(|_| K::NAMESPACED);

        lock(&self.objects)
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace.as_deref() == Some(ns)))
            .map(|(_, value)| Self::decode(value))
            .collect()
    }

    async fn create<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        self.check_failure::<K>()?;

        let revision = self.next_revision();
        let name = match (&resource.meta().name, &resource.meta().generate_name) {
            (Some(name), _) => name.to_owned(),
            (None, Some(prefix)) => format!("{prefix}{revision}"),
            (None, None) => {
                return Err(StoreError::InvalidConfig(format!(
                    "{} is missing a name!",
                    K::kind(&())
                )))
            }
        };
        let namespace = scoped_namespace::<K>(resource.meta().namespace.as_deref());
        let key = ObjectKey::new::<K>(namespace.as_deref(), &name);

        let mut value = serde_json::to_value(resource).map_err(StoreError::Serialization)?;
        let metadata = &mut value["metadata"];
        metadata["name"] = json!(name);
        if let Some(namespace) = &namespace {
            metadata["namespace"] = json!(namespace);
        }
        if !metadata["uid"].is_string() {
            metadata["uid"] = json!(format!("uid-{revision}"));
        }
        metadata["resourceVersion"] = json!(revision);
        metadata["creationTimestamp"] = json!(Utc::now().to_rfc3339());
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.remove("deletionTimestamp");
            metadata.remove("generateName");
        }
        self.populate_token(&mut value);

        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(StoreError::already_exists::<K>(&name));
        }
        objects.insert(key, value.clone());

        Self::decode(&value)
    }

    async fn update<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        self.check_failure::<K>()?;

        let name = resource.meta().name.clone().unwrap_or_default();
        let key = ObjectKey::new::<K>(resource.meta().namespace.as_deref(), &name);
        let mut incoming = serde_json::to_value(resource).map_err(StoreError::Serialization)?;

        let mut objects = lock(&self.objects);
        let existing = objects
            .get(&key)
            .ok_or_else(|| StoreError::not_found::<K>(&name))?;
        Self::check_version::<K>(existing, &incoming, &name)?;

        for field in ["uid", "creationTimestamp", "deletionTimestamp", "namespace"] {
            let preserved = existing["metadata"][field].clone();
            incoming["metadata"][field] = preserved;
        }
        incoming["metadata"]["resourceVersion"] = json!(self.next_revision());
        match existing.get("status") {
            Some(status) => incoming["status"] = status.clone(),
            None => {
                if let Some(object) = incoming.as_object_mut() {
                    object.remove("status");
                }
            }
        }
        strip_nulls(&mut incoming["metadata"]);

        if incoming["metadata"]["deletionTimestamp"].is_string() && !has_finalizers(&incoming) {
            objects.remove(&key);
        } else {
            objects.insert(key, incoming.clone());
        }

        Self::decode(&incoming)
    }

    async fn update_status<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        self.check_failure::<K>()?;

        let name = resource.meta().name.clone().unwrap_or_default();
        let key = ObjectKey::new::<K>(resource.meta().namespace.as_deref(), &name);
        let incoming = serde_json::to_value(resource).map_err(StoreError::Serialization)?;

        let mut objects = lock(&self.objects);
        let existing = objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found::<K>(&name))?;
        Self::check_version::<K>(existing, &incoming, &name)?;

        existing["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        existing["metadata"]["resourceVersion"] = json!(self.next_revision());

        Self::decode(existing)
    }

    async fn approve_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, StoreError> {
        self.check_failure::<CertificateSigningRequest>()?;

        let name = csr.metadata.name.clone().unwrap_or_default();
        let key = ObjectKey::new::<CertificateSigningRequest>(None, &name);
        let incoming = serde_json::to_value(csr).map_err(StoreError::Serialization)?;

        let mut value = {
            let objects = lock(&self.objects);
            let existing = objects
                .get(&key)
                .ok_or_else(|| StoreError::not_found::<CertificateSigningRequest>(&name))?;
            Self::check_version::<CertificateSigningRequest>(existing, &incoming, &name)?;

            existing.clone()
        };

        value["status"]["conditions"] = incoming["status"]["conditions"].clone();
        value["metadata"]["resourceVersion"] = json!(self.next_revision());
        if is_approved(&value) {
            self.sign(&mut value)?;
        }

        lock(&self.objects).insert(key, value.clone());

        Self::decode(&value)
    }

    async fn delete<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        self.check_failure::<K>()?;

        let key = ObjectKey::new::<K>(namespace, name);
        let mut objects = lock(&self.objects);
        let existing = objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found::<K>(name))?;

        if has_finalizers(existing) {
            if !existing["metadata"]["deletionTimestamp"].is_string() {
                existing["metadata"]["deletionTimestamp"] = json!(Utc::now().to_rfc3339());
                existing["metadata"]["resourceVersion"] = json!(self.next_revision());
            }
        } else {
            objects.remove(&key);
        }

        Ok(())
    }

    async fn server_version(&self) -> Result<String, StoreError> {
        Ok(self.server_version.to_owned())
    }
}

fn strip_nulls(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        object.retain(|_, field| !field.is_null());
    }
}

/// Routes kubeconfig documents to in-memory stores by API server URL.
#[derive(Default)]
pub struct MemoryConnector {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: &str, store: Arc<MemoryStore>) {
        lock(&self.stores).insert(server.to_owned(), store);
    }
}

#[async_trait]
impl ClusterConnector for MemoryConnector {
    type Store = Arc<MemoryStore>;

    async fn connect(
        &self,
        kubeconfig: &[u8],
        endpoint_override: Option<&str>,
    ) -> Result<Arc<MemoryStore>, StoreError> {
        let server = match endpoint_override {
            Some(endpoint) => endpoint.to_owned(),
            None => KubeconfigDocument::from_bytes(kubeconfig)
                .map_err(|err| StoreError::InvalidConfig(err.to_string()))?
                .current_server()
                .ok_or_else(|| StoreError::InvalidConfig("kubeconfig has no server".to_owned()))?
                .to_owned(),
        };

        lock(&self.stores)
            .get(&server)
            .cloned()
            .ok_or_else(|| injected_error(&format!("'{server}' is unreachable")))
    }
}

/// Throwaway CA standing in for the cluster signer.
///
/// Issued certificates copy the request subject verbatim, so every group
/// survives signing just like with the real signer.
pub struct TestCertificateAuthority {
    certificate: Certificate,
    key: KeyPair,
    subject: Vec<u8>,
    serial: AtomicU64,
}

const CA_COMMON_NAME: &str = "test-ca";
/// Backdating keeps freshly issued certificates valid across clock skew.
const BACKDATE_MINUTES: i64 = 5;

fn write_utc_time(writer: DERWriter, time: DateTime<Utc>) {
    let formatted = time.format("%y%m%d%H%M%SZ").to_string();
    writer.write_tagged_implicit(TAG_UTCTIME, |writer| writer.write_bytes(formatted.as_bytes()));
}

fn invalid(err: impl ToString) -> CredentialsError {
    CredentialsError::InvalidCertificate(err.to_string())
}

impl TestCertificateAuthority {
    pub fn new() -> Result<Self, rcgen::Error> {
        let key = generate_key_pair()?;
        let mut params = CertificateParams::default();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(CA_COMMON_NAME.to_owned()),
        );
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let certificate = params.self_signed(&key)?;

        Ok(Self {
            certificate,
            key,
            subject: encode_subject(CA_COMMON_NAME, &[]),
            serial: AtomicU64::new(1),
        })
    }

    pub fn ca_pem(&self) -> String {
        self.certificate.pem()
    }

    fn issue(
        &self,
        subject: &[u8],
        public_key_info: &[u8],
        validity: Duration,
    ) -> Result<String, rcgen::Error> {
        let now = Utc::now();
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let tbs = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_tagged(Tag::context(0), |writer| writer.write_u8(2));
                writer.next().write_u64(serial);
                write_signature_algorithm(writer.next());
                writer.next().write_der(&self.subject);
                writer.next().write_sequence(|writer| {
                    write_utc_time(writer.next(), now - Duration::minutes(BACKDATE_MINUTES));
                    write_utc_time(writer.next(), now + validity);
                });
                writer.next().write_der(subject);
                writer.next().write_der(public_key_info);
            })
        });

        Ok(to_pem("CERTIFICATE", &sign_document(&tbs, &self.key)?))
    }

    /// Signs a PEM encoded PKCS#10 request, expiring `validity` from now.
    pub fn sign_request(
        &self,
        request_pem: &[u8],
        validity: Duration,
    ) -> Result<String, CredentialsError> {
        let (_, pem) = parse_x509_pem(request_pem).map_err(invalid)?;
        let (_, request) = X509CertificationRequest::from_der(&pem.contents).map_err(invalid)?;
        let info = &request.certification_request_info;

        Ok(self.issue(info.subject.as_raw(), info.subject_pki.raw, validity)?)
    }

    /// Returns a PEM certificate and PEM private key for `common_name`.
    pub fn issue_client_certificate(
        &self,
        common_name: &str,
        organizations: &[&str],
        validity: Duration,
    ) -> Result<(String, String), rcgen::Error> {
        let key = generate_key_pair()?;
        let organizations: Vec<String> = organizations
            .iter()
            .map(|organization| (*organization).to_owned())
            .collect();
        let subject = encode_subject(common_name, &organizations);
        let certificate = self.issue(&subject, &key.subject_public_key_info(), validity)?;

        Ok((certificate, key.serialize_pem()))
    }

    /// Signer issuing certificates valid for `validity`.
    pub fn signer(self: Arc<Self>, validity: Duration) -> CsrSigner {
        Arc::new(move |csr: &CertificateSigningRequest| {
            match self.sign_request(&csr.spec.request.0, validity) {
                Ok(certificate) => SignerDecision::Issue(certificate.into_bytes()),
                Err(err) => SignerDecision::Fail(err.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;

    use super::*;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("cm")).await.unwrap();

        store.update(&created).await.unwrap();
        let result = store.update(&created).await;

        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn duplicate_creates_are_rejected() {
        let store = MemoryStore::new();
        store.create(&config_map("cm")).await.unwrap();

        let result = store.create(&config_map("cm")).await;

        assert!(result.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn finalizers_hold_back_deletion() {
        let store = MemoryStore::new();
        let mut cm = config_map("cm");
        cm.metadata.finalizers = Some(vec!["hold".to_owned()]);
        store.create(&cm).await.unwrap();

        store.delete::<ConfigMap>(Some("default"), "cm").await.unwrap();
        let mut deleting: ConfigMap = store.get(Some("default"), "cm").await.unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        deleting.metadata.finalizers = Some(vec![]);
        store.update(&deleting).await.unwrap();

        assert!(!store.contains::<ConfigMap>(Some("default"), "cm"));
    }
}
