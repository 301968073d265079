use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as base64;
use rand::Rng;

const UID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of the random part of an instance name.
pub const UID_LEN: usize = 6;

/// Draw a fresh instance uid: six characters, uniform over `[a-z0-9]`.
///
/// Nothing checks the uid against resources that already exist. 36^6 names
/// make a collision unlikely for one runner pool, not impossible.
pub fn generate_uid() -> String {
    let mut rng = rand::thread_rng();
    (0..UID_LEN)
        .map(|_| UID_ALPHABET[rng.gen_range(0..UID_ALPHABET.len())] as char)
        .collect()
}

/// Everything a provider needs to create one runner instance.
///
/// Built fresh for every `queued` event and never persisted: the instance
/// name is the only handle that survives, and it comes back to us as the
/// job's `runner_name` once the runner has picked the job up.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub uid: String,
    /// `{prefix}-{uid}`, the base for every resource name in the set.
    pub name: String,
    /// Bootstrap script, base64-encoded.
    pub user_data: String,
    pub ssh_public_key: String,
}

impl InstanceSpec {
    pub fn with_uid(
        uid: impl Into<String>,
        prefix: &str,
        bootstrap: &[u8],
        ssh_public_key: impl Into<String>,
    ) -> Self {
        let uid = uid.into();
        Self {
            name: format!("{prefix}-{uid}"),
            uid,
            user_data: base64.encode(bootstrap),
            ssh_public_key: ssh_public_key.into(),
        }
    }
}

/// The kinds of cloud resource that make up one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Instance,
    OsDisk,
    NetworkInterface,
    SecurityGroup,
    VirtualNetwork,
    PublicIp,
}

impl ResourceKind {
    /// Every dependent kind, in creation-plan order of the full layout.
    pub const DEPENDENTS: [ResourceKind; 5] = [
        ResourceKind::OsDisk,
        ResourceKind::NetworkInterface,
        ResourceKind::SecurityGroup,
        ResourceKind::VirtualNetwork,
        ResourceKind::PublicIp,
    ];

    /// Name suffix appended to the instance name. Creation and deletion
    /// must agree on these or dependents leak.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Instance => "",
            Self::OsDisk => "-osdisk",
            Self::NetworkInterface => "-nic",
            Self::SecurityGroup => "-nsg",
            Self::VirtualNetwork => "-vnet",
            Self::PublicIp => "-ip",
        }
    }

    /// Deletion wave. A resource may only be deleted once nothing in an
    /// earlier wave references it any more.
    pub fn reclaim_wave(self) -> usize {
        match self {
            Self::Instance => 0,
            Self::OsDisk | Self::NetworkInterface => 1,
            Self::SecurityGroup | Self::VirtualNetwork | Self::PublicIp => 2,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance => write!(f, "instance"),
            Self::OsDisk => write!(f, "os disk"),
            Self::NetworkInterface => write!(f, "network interface"),
            Self::SecurityGroup => write!(f, "security group"),
            Self::VirtualNetwork => write!(f, "virtual network"),
            Self::PublicIp => write!(f, "public ip"),
        }
    }
}

/// A single cloud resource, addressed by kind and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn derive(instance: &str, kind: ResourceKind) -> Self {
        Self {
            kind,
            name: format!("{instance}{}", kind.suffix()),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// All resources backing one instance. The provider tracks each member
/// independently (no cascade delete), so reclamation walks this set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
    members: Vec<ResourceId>,
}

impl ResourceSet {
    pub fn new(instance: &str, dependents: &[ResourceKind]) -> Self {
        let members = std::iter::once(ResourceKind::Instance)
            .chain(
                dependents
                    .iter()
                    .copied()
                    .filter(|k| *k != ResourceKind::Instance),
            )
            .map(|kind| ResourceId::derive(instance, kind))
            .collect();
        Self { members }
    }

    pub fn instance(&self) -> &ResourceId {
        &self.members[0]
    }

    pub fn members(&self) -> &[ResourceId] {
        &self.members
    }

    pub fn dependents(&self) -> &[ResourceId] {
        &self.members[1..]
    }

    /// Dependents grouped by deletion wave, earliest first.
    pub fn reclaim_waves(&self) -> Vec<Vec<&ResourceId>> {
        let mut waves: BTreeMap<usize, Vec<&ResourceId>> = BTreeMap::new();
        for id in self.dependents() {
            waves.entry(id.kind.reclaim_wave()).or_default().push(id);
        }
        waves.into_values().collect()
    }
}

/// Lifecycle of a single runner instance.
///
/// `Absent → Provisioning → Running → Reclaiming → Absent`, with `Failed`
/// reachable from both transitional phases. Nothing retries out of
/// `Failed`; a redelivered webhook starts the transition again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstancePhase {
    #[default]
    Absent,
    Provisioning,
    Running,
    Reclaiming,
    Failed,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Running => write!(f, "Running"),
            Self::Reclaiming => write!(f, "Reclaiming"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
