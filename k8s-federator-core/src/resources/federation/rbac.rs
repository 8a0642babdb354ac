use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};

use super::FederationMembership;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const HEALTH_CHECK_PATH: &str = "/healthz";

fn all_strings() -> Option<Vec<String>> {
    Some(vec!["*".to_owned()])
}

fn full_access_rule() -> PolicyRule {
    PolicyRule {
        api_groups: all_strings(),
        resources: all_strings(),
        verbs: vec!["*".to_owned()],
        ..Default::default()
    }
}

impl FederationMembership {
    pub fn generate_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.generate_namespaced_metadata(self.service_account_name()),
            ..Default::default()
        }
    }

    fn generate_subjects(&self) -> Option<Vec<Subject>> {
        Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: self.service_account_name(),
            namespace: Some(self.namespace.to_owned()),
            ..Default::default()
        }])
    }

    fn generate_role_ref(kind: &str, name: String) -> RoleRef {
        RoleRef {
            api_group: RBAC_API_GROUP.to_owned(),
            kind: kind.to_owned(),
            name,
        }
    }

    /// All verbs on all resources, plus GET on every non-resource URL.
    pub fn generate_cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.generate_cluster_metadata(self.role_name()),
            rules: Some(vec![
                full_access_rule(),
                PolicyRule {
                    non_resource_urls: all_strings(),
                    verbs: vec!["get".to_owned()],
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    pub fn generate_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.generate_cluster_metadata(self.role_name()),
            role_ref: Self::generate_role_ref("ClusterRole", self.role_name()),
            subjects: self.generate_subjects(),
        }
    }

    pub fn generate_role(&self) -> Role {
        Role {
            metadata: self.generate_namespaced_metadata(self.role_name()),
            rules: Some(vec![full_access_rule()]),
        }
    }

    pub fn generate_role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: self.generate_namespaced_metadata(self.role_name()),
            role_ref: Self::generate_role_ref("Role", self.role_name()),
            subjects: self.generate_subjects(),
        }
    }

    /// Health checks and node listing only, for namespace scoped members.
    pub fn generate_health_check_cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.generate_cluster_metadata(self.health_check_role_name()),
            rules: Some(vec![
                PolicyRule {
                    non_resource_urls: Some(vec![HEALTH_CHECK_PATH.to_owned()]),
                    verbs: vec!["get".to_owned()],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["".to_owned()]),
                    resources: Some(vec!["nodes".to_owned()]),
                    verbs: vec!["list".to_owned()],
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    pub fn generate_health_check_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.generate_cluster_metadata(self.health_check_role_name()),
            role_ref: Self::generate_role_ref("ClusterRole", self.health_check_role_name()),
            subjects: self.generate_subjects(),
        }
    }
}
