//! Escrow record and its status machine.

use crate::{Currency, EscrowId, ExchangeCode, LedgerAddress, Money, PartyId, Satoshis, TxRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Escrow status representing the custody lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Waiting for the requester to fund the escrow address.
    Pending,
    /// Funds observed at the escrow address, awaiting the agent's code.
    Funded,
    /// Funds released to the agent.
    Completed,
    /// Fund movement failed or its outcome is unknown; needs manual review.
    Disputed,
    /// Funds returned to the requester after expiry.
    Refunded,
    /// Expired before any funds arrived.
    Expired,
}

impl EscrowStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [EscrowStatus; 6] = [
        EscrowStatus::Pending,
        EscrowStatus::Funded,
        EscrowStatus::Completed,
        EscrowStatus::Disputed,
        EscrowStatus::Refunded,
        EscrowStatus::Expired,
    ];

    /// Check if this is a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Completed
                | EscrowStatus::Disputed
                | EscrowStatus::Refunded
                | EscrowStatus::Expired
        )
    }

    /// Check if the record is still live.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[EscrowStatus] {
        match self {
            EscrowStatus::Pending => &[EscrowStatus::Funded, EscrowStatus::Expired],
            EscrowStatus::Funded => &[
                EscrowStatus::Completed,
                EscrowStatus::Refunded,
                EscrowStatus::Disputed,
            ],
            EscrowStatus::Completed => &[],
            EscrowStatus::Disputed => &[],
            EscrowStatus::Refunded => &[],
            EscrowStatus::Expired => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable lowercase name, used for storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Funded => "funded",
            EscrowStatus::Completed => "completed",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Expired => "expired",
        }
    }

    /// Inverse of [`EscrowStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fund movement a settling claim guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlingKind {
    /// Paying the committed amount out to the agent.
    Release,
    /// Returning the committed amount to the requester.
    Refund,
}

impl SettlingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlingKind::Release => "release",
            SettlingKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "release" => Some(SettlingKind::Release),
            "refund" => Some(SettlingKind::Refund),
            _ => None,
        }
    }
}

/// Marker written before any ledger transfer out of the escrow address.
///
/// While a claim is present no other worker may start a fund movement for the
/// record. Claims only exist on funded records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlingClaim {
    pub kind: SettlingKind,
    pub claimed_at: DateTime<Utc>,
}

/// A custodial escrow between a requester and an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Unique escrow identifier.
    pub id: EscrowId,
    /// Party funding the escrow.
    pub requester_id: PartyId,
    /// Agent who receives the funds on code presentation.
    pub agent_id: PartyId,
    /// Committed bitcoin amount. Never changes after creation.
    pub bitcoin_amount: Satoshis,
    /// Local cash amount (committed amount minus fee), fixed at creation.
    pub local_amount: Money,
    /// Single-use address the requester funds.
    pub escrow_address: LedgerAddress,
    /// One-time release code.
    pub exchange_code: ExchangeCode,
    /// Current status.
    pub status: EscrowStatus,
    /// Write counter, bumped on every persisted mutation.
    pub revision: u64,
    /// In-flight fund movement, if any.
    pub settling: Option<SettlingClaim>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the record was closed by refund, expiry or dispute.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Ledger reference of the release or refund transfer.
    pub settlement_ref: Option<TxRef>,
    /// Why the record needs manual review.
    pub dispute_reason: Option<String>,
}

impl EscrowRecord {
    /// Create a new pending escrow.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requester_id: PartyId,
        agent_id: PartyId,
        bitcoin_amount: Satoshis,
        local_amount: Money,
        escrow_address: LedgerAddress,
        exchange_code: ExchangeCode,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: EscrowId::new(),
            requester_id,
            agent_id,
            bitcoin_amount,
            local_amount,
            escrow_address,
            exchange_code,
            status: EscrowStatus::Pending,
            revision: 0,
            settling: None,
            created_at,
            expires_at: created_at + ttl,
            funded_at: None,
            completed_at: None,
            resolved_at: None,
            settlement_ref: None,
            dispute_reason: None,
        }
    }

    /// Currency of the local cash leg.
    pub fn currency(&self) -> &Currency {
        &self.local_amount.currency
    }

    /// Whether `now` is past the expiry time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether a fund movement is in flight.
    pub fn is_settling(&self) -> bool {
        self.settling.is_some()
    }

    /// Transition to a new status, stamping the matching timestamp.
    ///
    /// Terminal transitions clear any settling claim.
    pub fn transition_to(
        &mut self,
        new_status: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;

        match new_status {
            EscrowStatus::Funded => self.funded_at = Some(at),
            EscrowStatus::Completed => self.completed_at = Some(at),
            EscrowStatus::Refunded | EscrowStatus::Expired | EscrowStatus::Disputed => {
                self.resolved_at = Some(at)
            }
            EscrowStatus::Pending => {}
        }

        if new_status.is_terminal() {
            self.settling = None;
        }

        Ok(())
    }

    /// Claim the record for a fund movement.
    pub fn claim(&mut self, kind: SettlingKind, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != EscrowStatus::Funded || self.settling.is_some() {
            return Err(InvalidTransition {
                from: self.status,
                to: EscrowStatus::Funded,
            });
        }
        self.settling = Some(SettlingClaim {
            kind,
            claimed_at: at,
        });
        Ok(())
    }

    /// Move a funded record to disputed with a reason.
    pub fn dispute(
        &mut self,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition_to(EscrowStatus::Disputed, at)?;
        self.dispute_reason = Some(reason.into());
        Ok(())
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: EscrowStatus,
    pub to: EscrowStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid state transition from {} to {}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}
