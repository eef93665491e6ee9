//! Error taxonomy for the coordination core (spec §7).
//!
//! Each externally visible failure domain gets its own enum; session-level
//! errors carry enough context (phase, counterparty) for user-visible
//! reporting without the caller having to reconstruct it.

use thiserror::Error;

use crate::registry::Phase;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed PoDLE proof")]
    Malformed,
    #[error("PoDLE commitment does not match revealed P2")]
    CommitmentMismatch,
    #[error("PoDLE proof failed verification")]
    ProofInvalid,
    #[error("NaCl box decryption failed")]
    DecryptFailed,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("bond proof failed verification: {0}")]
    BondInvalid(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("message exceeds size bound: {0}")]
    OversizeMessage(String),
    #[error("message arrived out of phase: expected {expected:?}, got message for {got:?}")]
    OutOfPhase { expected: Phase, got: Phase },
    #[error("channel consistency violated for session with {nick}")]
    ChannelInconsistent { nick: String },
    #[error("wrong number of arguments for command {command}: expected {expected}, got {got}")]
    WrongArgCount {
        command: String,
        expected: usize,
        got: usize,
    },
    #[error("unknown envelope type code {0}")]
    UnknownType(u32),
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("utxo {0} is unknown to the oracle")]
    UnknownUtxo(String),
    #[error("utxo {0} has insufficient confirmations: {have}, need {need}")]
    InsufficientConfirmations {
        outpoint: String,
        have: u32,
        need: u32,
    },
    #[error("utxo {0} value mismatch: declared {declared}, actual {actual}")]
    ValueMismatch {
        outpoint: String,
        declared: u64,
        actual: u64,
    },
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("transaction failed to parse")]
    Unparseable,
    #[error("maker utxo {0} missing from transaction inputs")]
    MissingInput(String),
    #[error("maker utxo {0} appears more than once in transaction inputs")]
    DuplicateInput(String),
    #[error("cj output missing or value too low: wanted >= {wanted}, found {found:?}")]
    CjOutputInvalid { wanted: u64, found: Option<u64> },
    #[error("cj address appears {0} times, expected exactly 1")]
    CjOutputMultiplicity(usize),
    #[error("change output invalid: expected >= {expected}, found {found:?}")]
    ChangeOutputInvalid { expected: u64, found: Option<u64> },
    #[error("change address appears {0} times, expected at most 1")]
    ChangeOutputMultiplicity(usize),
    #[error("no profit for maker: real_cjfee {real_cjfee} <= txfee_share {txfee_share}")]
    NoProfit { real_cjfee: u64, txfee_share: u64 },
}

/// Phase-tagged failure reported to the operator / UI, per spec §7.
#[derive(Debug, Error)]
#[error("[{phase:?}] {counterparty:?}: {kind}")]
pub struct SessionFailure {
    pub phase: Phase,
    pub counterparty: Option<String>,
    pub kind: String,
}

impl SessionFailure {
    pub fn new(phase: Phase, counterparty: Option<String>, kind: impl ToString) -> Self {
        SessionFailure {
            phase,
            counterparty,
            kind: kind.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TakerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error("insufficient counterparties: needed {needed}, only {available} available")]
    InsufficientCounterparties { needed: usize, available: usize },
    #[error("session timed out in phase {0:?}")]
    Timeout(Phase),
    #[error("CoinJoin output {0} sat is below dust threshold")]
    CjOutputIsDust(u64),
    #[error("configuration invalid: {0}")]
    Config(String),
    #[error("wallet unavailable: {0}")]
    WalletUnavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session failed: {0}")]
    Session(#[from] SessionFailure),
}

#[derive(Debug, Error)]
pub enum MakerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error("commitment already blacklisted")]
    CommitmentBlacklisted,
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("refused to sign P2WSH input (fidelity-bond protection)")]
    RefuseSignP2wsh,
    #[error("session timed out in phase {0:?}")]
    Timeout(Phase),
    #[error("configuration invalid: {0}")]
    Config(String),
    #[error("session failed: {0}")]
    Session(#[from] SessionFailure),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}
