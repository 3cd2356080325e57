use crate::error::{AppError, AppResult, ChainError};
use async_trait::async_trait;
use ethers::contract::{abigen, ContractError, EthLogDecode};
use ethers::core::types::{Filter, Log, H160, H256, U256};
use ethers::middleware::{Middleware, SignerMiddleware};
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use tokio::time::Duration;

abigen!(
    MembershipRegistry,
    r#"[
        function createGroup(uint256 merkleTreeDuration) returns (uint256)
        function addMembers(uint256 groupId, uint256[] identityCommitments)
        function getMerkleTreeRoot(uint256 groupId) view returns (uint256)
        function getMerkleTreeDepth(uint256 groupId) view returns (uint256)
        function getMerkleTreeSize(uint256 groupId) view returns (uint256)
        event GroupCreated(uint256 indexed groupId)
    ]"#
);

/// Seconds a group's old Merkle roots stay valid on-chain.
const DEFAULT_MERKLE_TREE_DURATION: u64 = 3600;

type RegistryClient = MembershipRegistry<SignerMiddleware<Provider<Http>, LocalWallet>>;

/// Snapshot of a group's on-chain Merkle tree, served to clients that
/// generate proofs against it.
#[derive(Debug, Clone, Copy)]
pub struct TreeInfo {
    pub root: U256,
    pub depth: u64,
    pub size: u64,
}

/// Membership-registry access, signed by the service key where it writes.
/// Split into a trait so API handlers can be exercised against a
/// recording double.
#[async_trait]
pub trait MembershipOps: Send + Sync {
    async fn create_group(&self) -> AppResult<U256>;
    async fn add_members(&self, group_id: U256, commitments: &[U256]) -> AppResult<H256>;
    async fn tree_info(&self, group_id: U256) -> AppResult<TreeInfo>;
}

/// Read-only chain surface the tail polls. Kept narrow so tests can feed
/// synthetic logs.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_number(&self) -> AppResult<u64>;
    async fn logs(&self, from_block: u64, to_block: u64, topic0: H256) -> AppResult<Vec<Log>>;
}

#[derive(Clone)]
pub struct ChainGateway {
    provider: Arc<Provider<Http>>,
    voting_address: H160,
    registry: RegistryClient,
    rpc_timeout: Duration,
}

impl ChainGateway {
    pub async fn new(
        rpc_url: &str,
        signing_key: &str,
        voting_address: H160,
        membership_address: H160,
        rpc_timeout: Duration,
    ) -> AppResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ChainError::Rpc(format!("rpc provider error: {e}")))?;
        let provider = Arc::new(provider);

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| ChainError::Rpc(format!("chain id error: {e}")))?;

        let wallet = signing_key
            .parse::<LocalWallet>()
            .map_err(|e| AppError::Validation(format!("invalid signing key: {e}")))?
            .with_chain_id(chain_id.as_u64());

        let client = Arc::new(SignerMiddleware::new((*provider).clone(), wallet));
        let registry = MembershipRegistry::new(membership_address, client);
        Ok(Self {
            provider,
            voting_address,
            registry,
            rpc_timeout,
        })
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> AppResult<T>
    where
        F: std::future::Future<Output = Result<T, ethers::providers::ProviderError>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Err(_) => Err(ChainError::Rpc(format!("{what} timed out")).into()),
            Ok(Err(e)) => Err(ChainError::Rpc(format!("{what} failed: {e}")).into()),
            Ok(Ok(value)) => Ok(value),
        }
    }
}

#[async_trait]
impl MembershipOps for ChainGateway {
    async fn create_group(&self) -> AppResult<U256> {
        let call = self
            .registry
            .create_group(U256::from(DEFAULT_MERKLE_TREE_DURATION));
        let pending = call
            .send()
            .await
            .map_err(|e| classify_contract_error(&e))?;
        let receipt = pending
            .await
            .map_err(|e| ChainError::Rpc(format!("createGroup pending failed: {e}")))?
            .ok_or_else(|| ChainError::Rpc("createGroup tx dropped".into()))?;

        let group_id = receipt
            .logs
            .iter()
            .find_map(|log| GroupCreatedFilter::decode_log(&log.clone().into()).ok())
            .map(|ev| ev.group_id)
            .ok_or_else(|| ChainError::Revert("GroupCreated event not found".into()))?;
        Ok(group_id)
    }

    async fn add_members(&self, group_id: U256, commitments: &[U256]) -> AppResult<H256> {
        let call = self.registry.add_members(group_id, commitments.to_vec());
        let pending = call
            .send()
            .await
            .map_err(|e| classify_contract_error(&e))?;
        let receipt = pending
            .await
            .map_err(|e| ChainError::Rpc(format!("addMembers pending failed: {e}")))?
            .ok_or_else(|| ChainError::Rpc("addMembers tx dropped".into()))?;
        if receipt.status != Some(1.into()) {
            return Err(ChainError::Revert("addMembers reverted".into()).into());
        }
        Ok(receipt.transaction_hash)
    }

    async fn tree_info(&self, group_id: U256) -> AppResult<TreeInfo> {
        let root = self
            .registry
            .get_merkle_tree_root(group_id)
            .call()
            .await
            .map_err(|e| classify_contract_error(&e))?;
        let depth = self
            .registry
            .get_merkle_tree_depth(group_id)
            .call()
            .await
            .map_err(|e| classify_contract_error(&e))?;
        let size = self
            .registry
            .get_merkle_tree_size(group_id)
            .call()
            .await
            .map_err(|e| classify_contract_error(&e))?;
        Ok(TreeInfo {
            root,
            depth: depth.as_u64(),
            size: size.as_u64(),
        })
    }
}

#[async_trait]
impl ChainReader for ChainGateway {
    async fn block_number(&self) -> AppResult<u64> {
        let number = self
            .bounded("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(number.as_u64())
    }

    async fn logs(&self, from_block: u64, to_block: u64, topic0: H256) -> AppResult<Vec<Log>> {
        let filter = Filter::new()
            .address(self.voting_address)
            .topic0(topic0)
            .from_block(from_block)
            .to_block(to_block);
        self.bounded("eth_getLogs", self.provider.get_logs(&filter))
            .await
    }
}

/// Maps a contract call failure onto the error taxonomy by inspecting the
/// revert reason (string reverts and Semaphore-style custom error names)
/// and the provider message.
fn classify_contract_error<M: Middleware>(err: &ContractError<M>) -> ChainError {
    if let Some(reason) = err.decode_revert::<String>() {
        return classify_revert(&reason);
    }
    let text = err.to_string();
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("insufficient funds") {
        return ChainError::OutOfFunds;
    }
    if err.is_revert() {
        return classify_revert(&text);
    }
    ChainError::Rpc(text)
}

fn classify_revert(reason: &str) -> ChainError {
    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("admin") {
        ChainError::AdminMismatch
    } else if lowered.contains("alreadyexists") || lowered.contains("already a member") {
        ChainError::DuplicateMember
    } else if lowered.contains("doesnotexist") || lowered.contains("group does not exist") {
        ChainError::UnknownGroup
    } else if lowered.contains("insufficient funds") {
        ChainError::OutOfFunds
    } else {
        ChainError::Revert(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_reasons_map_onto_the_taxonomy() {
        assert!(matches!(
            classify_revert("Semaphore__CallerIsNotTheGroupAdmin"),
            ChainError::AdminMismatch
        ));
        assert!(matches!(
            classify_revert("LeanIMT__LeafAlreadyExists"),
            ChainError::DuplicateMember
        ));
        assert!(matches!(
            classify_revert("Semaphore__GroupDoesNotExist"),
            ChainError::UnknownGroup
        ));
        assert!(matches!(
            classify_revert("insufficient funds for gas * price + value"),
            ChainError::OutOfFunds
        ));
        assert!(matches!(
            classify_revert("some other reason"),
            ChainError::Revert(_)
        ));
    }
}
