use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseEnumError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }
    };
}

uuid_newtype!(ChatId);
uuid_newtype!(MessageId);
uuid_newtype!(AttachmentId);
uuid_newtype!(CommitId);

uuid_newtype!(
    /// Identity of a single worker task for lease ownership.
    ///
    /// Each polling loop creates a fresh one, so a restarted worker never
    /// mistakes a crashed predecessor's leases for its own.
    WorkerId
);

/// Opaque group identifier as assigned by the group key-agreement protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a published key package (joining material).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialRef(pub Vec<u8>);

impl MaterialRef {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Protocol-level message identifier, distinct from the local [`MessageId`].
///
/// Receipts reference this id because the recipient only ever sees the
/// protocol id, never our local row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolMessageId(pub Vec<u8>);

impl ProtocolMessageId {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Position of a member in the group's leaf tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeafIndex(pub u32);

/// A user identity qualified by its origin federation domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedUserId {
    pub user_id: Uuid,
    pub domain: String,
}

impl QualifiedUserId {
    pub fn new(user_id: Uuid, domain: impl Into<String>) -> Self {
        Self {
            user_id,
            domain: domain.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "delivered" => Ok(ReceiptStatus::Delivered),
            "read" => Ok(ReceiptStatus::Read),
            _ => Err(ParseEnumError::new("ReceiptStatus", s)),
        }
    }
}

/// Stage of a group membership record.
///
/// Staged records belong to a not-yet-accepted commit; at most one merged
/// record exists per leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStage {
    StagedAdd,
    StagedUpdate,
    StagedRemoval,
    Merged,
}

impl MembershipStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStage::StagedAdd => "staged_add",
            MembershipStage::StagedUpdate => "staged_update",
            MembershipStage::StagedRemoval => "staged_removal",
            MembershipStage::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "staged_add" => Ok(MembershipStage::StagedAdd),
            "staged_update" => Ok(MembershipStage::StagedUpdate),
            "staged_removal" => Ok(MembershipStage::StagedRemoval),
            "merged" => Ok(MembershipStage::Merged),
            _ => Err(ParseEnumError::new("MembershipStage", s)),
        }
    }

    pub fn is_staged(&self) -> bool {
        !matches!(self, MembershipStage::Merged)
    }
}

/// Kind of a periodic maintenance task. One live queue row per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    KeyMaterialSweep,
    LeaseSweep,
    MembershipPurge,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::KeyMaterialSweep,
        TaskKind::LeaseSweep,
        TaskKind::MembershipPurge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::KeyMaterialSweep => "key_material_sweep",
            TaskKind::LeaseSweep => "lease_sweep",
            TaskKind::MembershipPurge => "membership_purge",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "key_material_sweep" => Ok(TaskKind::KeyMaterialSweep),
            "lease_sweep" => Ok(TaskKind::LeaseSweep),
            "membership_purge" => Ok(TaskKind::MembershipPurge),
            _ => Err(ParseEnumError::new("TaskKind", s)),
        }
    }

    pub fn default_interval(&self) -> chrono::Duration {
        match self {
            TaskKind::KeyMaterialSweep => chrono::Duration::hours(12),
            TaskKind::LeaseSweep => chrono::Duration::minutes(5),
            TaskKind::MembershipPurge => chrono::Duration::hours(24),
        }
    }
}
