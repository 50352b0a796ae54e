//! Compiled contract definitions and deployed method tracking.

use alloy_json_abi::{Function, JsonAbi, StateMutability};
use alloy_primitives::{Address, Bytes};
use std::sync::Arc;

/// The kind of a compiled source unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContractKind {
    Contract,
    Library,
    Interface,
}

/// A contract produced by the compilation front-end.
#[derive(Clone, Debug)]
pub struct ContractDefinition {
    pub name: String,
    pub abi: JsonAbi,
    pub init_bytecode: Bytes,
    pub runtime_bytecode: Bytes,
    pub kind: ContractKind,
}

/// The set of compiled contracts known to a fuzzing campaign. Read-only
/// once the campaign starts.
#[derive(Clone, Debug, Default)]
pub struct ContractDefinitions {
    definitions: Vec<Arc<ContractDefinition>>,
}

impl ContractDefinitions {
    pub fn new(definitions: impl IntoIterator<Item = ContractDefinition>) -> Self {
        Self { definitions: definitions.into_iter().map(Arc::new).collect() }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ContractDefinition>> {
        self.definitions.iter()
    }

    /// Matches observed deployment bytecode against the known definitions.
    ///
    /// Runtime bytecode is compared exactly first; failing that, a
    /// definition whose init bytecode prefixes the observed init bytecode
    /// matches, since constructor arguments are appended to init code.
    pub fn match_bytecode(
        &self,
        init_bytecode: &[u8],
        runtime_bytecode: &[u8],
    ) -> Option<Arc<ContractDefinition>> {
        if !runtime_bytecode.is_empty() {
            if let Some(definition) = self
                .definitions
                .iter()
                .find(|definition| definition.runtime_bytecode.as_ref() == runtime_bytecode)
            {
                return Some(definition.clone());
            }
        }
        self.definitions
            .iter()
            .find(|definition| {
                !definition.init_bytecode.is_empty()
                    && init_bytecode.starts_with(&definition.init_bytecode)
            })
            .cloned()
    }
}

/// A callable method of a contract deployed on a worker's chain.
#[derive(Clone, Debug)]
pub struct DeployedContractMethod {
    pub contract: Arc<ContractDefinition>,
    pub address: Address,
    pub method: Function,
}

impl DeployedContractMethod {
    /// Whether calling the method may change chain state.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self.method.state_mutability,
            StateMutability::NonPayable | StateMutability::Payable
        )
    }

    /// Whether the method accepts a value transfer.
    pub fn is_payable(&self) -> bool {
        self.method.state_mutability == StateMutability::Payable
    }
}
