use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a poll as reported by the API. The store only ever holds
/// DRAFT or ACTIVE; ENDED is derived from `end_time` at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PollStatus {
    Draft,
    Active,
    Ended,
}

impl PollStatus {
    pub fn effective(stored: PollStatus, end_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        match stored {
            PollStatus::Active | PollStatus::Ended if now >= end_time => PollStatus::Ended,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Draft => "DRAFT",
            PollStatus::Active => "ACTIVE",
            PollStatus::Ended => "ENDED",
        }
    }
}

impl std::str::FromStr for PollStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(PollStatus::Draft),
            "ACTIVE" => Ok(PollStatus::Active),
            "ENDED" => Ok(PollStatus::Ended),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PollOption {
    pub id: u8,
    pub label: String,
}

/// Uniform success envelope. List endpoints additionally carry pagination.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PagedResponse<T> {
    pub success: bool,
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, Serialize, utoipa::ToSchema)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreatePollRequest {
    pub title: String,
    pub description: String,
    pub options: Vec<PollOption>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdatePollRequest {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    /// Ledger addresses to project into commitments server-side.
    #[serde(default)]
    pub eligible_addresses: Vec<String>,
    /// Pre-computed commitments (decimal or 0x-hex field elements).
    #[serde(default)]
    pub eligible_commitments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateGroupResponse {
    pub group_id: String,
    pub tx_hash: String,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PollResponse {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<PollOption>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: PollStatus,
    pub group_id: String,
    pub creator_address: String,
    pub activation_tx_hash: Option<String>,
    pub creation_tx_hash: Option<String>,
    pub vote_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListPollsParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
    pub creator: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct OptionResult {
    pub id: u8,
    pub label: String,
    pub votes: i64,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ResultsResponse {
    pub poll: PollResponse,
    pub results: Vec<OptionResult>,
    pub total_votes: i64,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct GroupMembersResponse {
    pub poll_id: String,
    pub group_id: String,
    pub commitments: Vec<String>,
    /// On-chain tree snapshot, present when the poll's group is bound and
    /// the registry is reachable.
    pub merkle_root: Option<String>,
    pub merkle_depth: Option<u64>,
    pub merkle_size: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct NonceResponse {
    pub nonce: String,
    pub signed_nonce: String,
}

/// Canonical login message fields. The server renders these into the
/// EIP-191 text that the wallet signed; unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct LoginMessage {
    pub domain: String,
    pub address: String,
    pub nonce: String,
    pub chain_id: u64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct VerifyRequest {
    pub message: LoginMessage,
    pub signature: String,
    pub signed_nonce: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct VerifyResponse {
    pub token: String,
    pub address: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MeResponse {
    pub address: String,
    pub chain_id: u64,
}
