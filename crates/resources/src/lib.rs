//! Bastion resources: closed set of kinds, their spec schemas and the kind registry.
//!
//! Every kind is listed once in the `kinds!` table below. The table generates the
//! tagged [`Spec`] enum, the [`TypedSpec`] impls that tie a Rust type to its
//! namespace and stable type string, and [`ALL_KINDS`] for bootstrap registration.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bastion_core::{Kind, Metadata, Namespace, ResourceId, StateError, StateResult};
use serde::Serialize;

pub mod block;
pub mod config;
pub mod etcd;
pub mod k8s;
pub mod network;
pub mod runtime;
pub mod secrets;
pub mod time;

/// Well-known namespaces.
pub mod ns {
    use bastion_core::Namespace;

    pub const CONFIG: Namespace = "config";
    pub const SECRETS: Namespace = "secrets";
    pub const NETWORK: Namespace = "network";
    pub const ETCD: Namespace = "etcd";
    pub const K8S: Namespace = "k8s";
    pub const RUNTIME: Namespace = "runtime";
    pub const TIME: Namespace = "time";
    pub const BLOCK: Namespace = "block";
}

/// Ties a spec type to its kind. Implemented only through the `kinds!` table.
pub trait TypedSpec: Clone + Default + PartialEq + Send + Sync + 'static {
    const NAMESPACE: Namespace;
    const KIND: Kind;
    const NAME: &'static str;

    fn into_spec(self) -> Spec;
    fn from_spec(spec: &Spec) -> Option<&Self>;
    fn from_spec_mut(spec: &mut Spec) -> Option<&mut Self>;
    fn take_spec(spec: Spec) -> Option<Self>;

    fn resource_id(id: impl Into<String>) -> ResourceId { ResourceId::new(Self::NAMESPACE, Self::KIND, id) }
}

/// Registration record for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindInfo {
    pub name: &'static str,
    pub namespace: Namespace,
    pub kind: Kind,
}

macro_rules! kinds {
    ($( $variant:ident($ty:ty) => $ns:expr, $kind:literal; )*) => {
        /// Tagged spec body, one variant per registered kind.
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(tag = "kind", content = "spec")]
        pub enum Spec {
            $( $variant($ty), )*
        }

        impl Spec {
            pub fn kind(&self) -> Kind {
                match self {
                    $( Spec::$variant(_) => Kind($kind), )*
                }
            }
        }

        $(
            impl TypedSpec for $ty {
                const NAMESPACE: Namespace = $ns;
                const KIND: Kind = Kind($kind);
                const NAME: &'static str = stringify!($variant);

                fn into_spec(self) -> Spec { Spec::$variant(self) }

                #[allow(unreachable_patterns)]
                fn from_spec(spec: &Spec) -> Option<&Self> {
                    match spec { Spec::$variant(s) => Some(s), _ => None }
                }

                #[allow(unreachable_patterns)]
                fn from_spec_mut(spec: &mut Spec) -> Option<&mut Self> {
                    match spec { Spec::$variant(s) => Some(s), _ => None }
                }

                #[allow(unreachable_patterns)]
                fn take_spec(spec: Spec) -> Option<Self> {
                    match spec { Spec::$variant(s) => Some(s), _ => None }
                }
            }
        )*

        /// Every kind known to this build, in declaration order.
        pub const ALL_KINDS: &[KindInfo] = &[
            $( KindInfo { name: stringify!($variant), namespace: $ns, kind: Kind($kind) }, )*
        ];
    };
}

kinds! {
    MachineConfig(config::MachineConfigSpec) => ns::CONFIG, "MachineConfigs.config.bastion.dev";
    MachineType(config::MachineTypeSpec) => ns::CONFIG, "MachineTypes.config.bastion.dev";
    OsRoot(secrets::OsRootSpec) => ns::SECRETS, "OSRootSecrets.secrets.bastion.dev";
    KubernetesRoot(secrets::KubernetesRootSpec) => ns::SECRETS, "KubernetesRootSecrets.secrets.bastion.dev";
    EtcdRoot(secrets::EtcdRootSpec) => ns::SECRETS, "EtcdRootSecrets.secrets.bastion.dev";
    MaintenanceRoot(secrets::MaintenanceRootSpec) => ns::SECRETS, "MaintenanceRootSecrets.secrets.bastion.dev";
    CertSan(secrets::CertSanSpec) => ns::SECRETS, "CertSANs.secrets.bastion.dev";
    ApiCerts(secrets::ApiCertsSpec) => ns::SECRETS, "ApiCertificates.secrets.bastion.dev";
    TrustdCerts(secrets::TrustdCertsSpec) => ns::SECRETS, "TrustdCertificates.secrets.bastion.dev";
    MaintenanceServiceCerts(secrets::MaintenanceServiceCertsSpec) => ns::SECRETS, "MaintenanceServiceCertificates.secrets.bastion.dev";
    KubernetesDynamicCerts(secrets::KubernetesDynamicCertsSpec) => ns::SECRETS, "KubernetesDynamicCertificates.secrets.bastion.dev";
    EtcdCerts(secrets::EtcdCertsSpec) => ns::SECRETS, "EtcdCertificates.secrets.bastion.dev";
    EncryptionSalt(secrets::EncryptionSaltSpec) => ns::SECRETS, "EncryptionSalts.secrets.bastion.dev";
    TrustedRoots(secrets::TrustedRootsSpec) => ns::SECRETS, "TrustedRoots.secrets.bastion.dev";
    EtcdSpec(etcd::EtcdSpec) => ns::ETCD, "EtcdSpecs.etcd.bastion.dev";
    Endpoint(k8s::EndpointSpec) => ns::K8S, "Endpoints.kubernetes.bastion.dev";
    LinkStatus(network::LinkStatusSpec) => ns::NETWORK, "LinkStatuses.net.bastion.dev";
    NodeAddress(network::NodeAddressSpec) => ns::NETWORK, "NodeAddresses.net.bastion.dev";
    HostnameStatus(network::HostnameStatusSpec) => ns::NETWORK, "HostnameStatuses.net.bastion.dev";
    NetworkStatus(network::NetworkStatusSpec) => ns::NETWORK, "NetworkStatuses.net.bastion.dev";
    ProbeSpec(network::ProbeSpec) => ns::NETWORK, "ProbeSpecs.net.bastion.dev";
    ProbeStatus(network::ProbeStatusSpec) => ns::NETWORK, "ProbeStatuses.net.bastion.dev";
    TimeServerStatus(network::TimeServerStatusSpec) => ns::NETWORK, "TimeServerStatuses.net.bastion.dev";
    TimeStatus(time::TimeStatusSpec) => ns::TIME, "TimeStatuses.time.bastion.dev";
    DevicesStatus(runtime::DevicesStatusSpec) => ns::RUNTIME, "DevicesStatuses.runtime.bastion.dev";
    VolumeMountRequest(block::VolumeMountRequestSpec) => ns::BLOCK, "VolumeMountRequests.block.bastion.dev";
    VolumeMountStatus(block::VolumeMountStatusSpec) => ns::BLOCK, "VolumeMountStatuses.block.bastion.dev";
}

/// Untyped resource as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub metadata: Metadata,
    pub spec: Spec,
}

impl Resource {
    pub fn new<T: TypedSpec>(id: impl Into<String>, spec: T) -> Self {
        Self { metadata: Metadata::new(T::NAMESPACE, T::KIND, id), spec: spec.into_spec() }
    }

    pub fn pointer(&self) -> ResourceId { self.metadata.pointer() }
    pub fn kind(&self) -> Kind { self.metadata.kind }
    pub fn version(&self) -> bastion_core::Version { self.metadata.version }

    /// Metadata kind and spec variant must agree.
    pub fn check_kind(&self) -> StateResult<()> {
        let actual = self.spec.kind();
        if actual != self.metadata.kind {
            return Err(StateError::TypeMismatch { id: self.pointer(), expected: self.metadata.kind, actual });
        }
        Ok(())
    }
}

/// Resource with a statically known spec type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedResource<T> {
    pub metadata: Metadata,
    pub spec: T,
}

impl<T: TypedSpec> TypedResource<T> {
    pub fn new(id: impl Into<String>, spec: T) -> Self {
        Self { metadata: Metadata::new(T::NAMESPACE, T::KIND, id), spec }
    }

    pub fn pointer(&self) -> ResourceId { self.metadata.pointer() }

    pub fn into_resource(self) -> Resource { Resource { metadata: self.metadata, spec: self.spec.into_spec() } }

    pub fn from_resource(r: Resource) -> StateResult<Self> {
        let actual = r.spec.kind();
        if actual != T::KIND || r.metadata.kind != T::KIND {
            return Err(StateError::TypeMismatch { id: r.metadata.pointer(), expected: T::KIND, actual });
        }
        let Resource { metadata, spec } = r;
        let id = metadata.pointer();
        match T::take_spec(spec) {
            Some(spec) => Ok(Self { metadata, spec }),
            None => Err(StateError::TypeMismatch { id, expected: T::KIND, actual }),
        }
    }
}

/// Kinds accepted by a store instance. Built explicitly at bootstrap.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    kinds: BTreeMap<Kind, KindInfo>,
}

impl ResourceRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry with every kind of this build.
    pub fn with_all() -> Self {
        let mut reg = Self::new();
        for info in ALL_KINDS {
            reg.kinds.insert(info.kind, *info);
        }
        reg
    }

    pub fn register<T: TypedSpec>(&mut self) -> &mut Self {
        self.kinds.insert(T::KIND, KindInfo { name: T::NAME, namespace: T::NAMESPACE, kind: T::KIND });
        self
    }

    pub fn contains(&self, kind: Kind) -> bool { self.kinds.contains_key(&kind) }
    pub fn get(&self, kind: Kind) -> Option<&KindInfo> { self.kinds.get(&kind) }
    pub fn len(&self) -> usize { self.kinds.len() }
    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &KindInfo> { self.kinds.values() }

    /// Lookup by stable type string or short name, case-insensitive.
    pub fn find(&self, name: &str) -> Option<&KindInfo> {
        self.kinds
            .values()
            .find(|i| i.kind.as_str().eq_ignore_ascii_case(name) || i.name.eq_ignore_ascii_case(name))
    }
}

pub mod prelude {
    pub use super::{Resource, ResourceRegistry, Spec, TypedResource, TypedSpec};
}
