// Token validator - proves a token is well-formed, unexpired, unspent and
// owned by whom the caller expects, using only cached issuer keys.

use crate::identity::{IssuerKeyId, OwnerCommitment, SharedKeyRegistry, Signer};
use crate::ledger::{StoreError, TokenLedgerStore};
use crate::token::{OfflineToken, TokenStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why a check failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationReason {
    SignatureInvalid,
    UnknownIssuerKey(IssuerKeyId),
    BrokenDivisionChain(String),
    Expired { expires_at: u64, now: u64 },
    NotActive(TokenStatus),
    OwnerMismatch,
    ZeroAmount,
    LedgerMismatch,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReason::SignatureInvalid => write!(f, "signature invalid"),
            ValidationReason::UnknownIssuerKey(id) => write!(f, "unknown issuer key {}", id),
            ValidationReason::BrokenDivisionChain(detail) => {
                write!(f, "broken division chain: {}", detail)
            }
            ValidationReason::Expired { expires_at, now } => {
                write!(f, "expired at {} (now {})", expires_at, now)
            }
            ValidationReason::NotActive(status) => write!(f, "token is {}", status),
            ValidationReason::OwnerMismatch => write!(f, "owner does not match"),
            ValidationReason::ZeroAmount => write!(f, "zero amount"),
            ValidationReason::LedgerMismatch => {
                write!(f, "token differs from the ledger's record of the same id")
            }
        }
    }
}

/// Outcome of each independent check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationChecks {
    pub signature_valid: bool,
    pub not_expired: bool,
    pub not_spent: bool,
    /// True when no owner was expected
    pub ownership_valid: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub checks: ValidationChecks,
    pub reasons: Vec<ValidationReason>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn has_reason(&self, predicate: impl Fn(&ValidationReason) -> bool) -> bool {
        self.reasons.iter().any(predicate)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            return f.write_str("valid");
        }
        let reasons: Vec<String> = self.reasons.iter().map(|r| r.to_string()).collect();
        f.write_str(&reasons.join(", "))
    }
}

/// Stateless validator over a shared issuer key registry
#[derive(Clone, Debug)]
pub struct Validator {
    keys: SharedKeyRegistry,
}

impl Validator {
    pub fn new(keys: SharedKeyRegistry) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &SharedKeyRegistry {
        &self.keys
    }

    /// Validate a token using the status it carries
    pub fn validate(
        &self,
        token: &OfflineToken,
        expected_owner: Option<&OwnerCommitment>,
        now_millis: u64,
    ) -> ValidationReport {
        self.validate_with_status(token, token.status(), expected_owner, now_millis)
    }

    /// Validate a token against a status taken from some ledger view.
    /// All four checks always run; none short-circuits another.
    pub fn validate_with_status(
        &self,
        token: &OfflineToken,
        status: TokenStatus,
        expected_owner: Option<&OwnerCommitment>,
        now_millis: u64,
    ) -> ValidationReport {
        let mut reasons = Vec::new();

        let signature_valid = match self.verify_lineage(token) {
            Ok(()) => true,
            Err(reason) => {
                reasons.push(reason);
                false
            }
        };

        if token.amount().is_zero() {
            reasons.push(ValidationReason::ZeroAmount);
        }

        let not_expired = !token.is_expired_at(now_millis);
        if !not_expired {
            reasons.push(ValidationReason::Expired {
                expires_at: token.expires_at(),
                now: now_millis,
            });
        }

        let not_spent = status == TokenStatus::Active;
        if !not_spent {
            reasons.push(ValidationReason::NotActive(status));
        }

        let ownership_valid = match expected_owner {
            Some(owner) => token.owner_commitment() == owner,
            None => true,
        };
        if !ownership_valid {
            reasons.push(ValidationReason::OwnerMismatch);
        }

        let report = ValidationReport {
            valid: reasons.is_empty(),
            checks: ValidationChecks {
                signature_valid,
                not_expired,
                not_spent,
                ownership_valid,
            },
            reasons,
        };
        debug!(token_id = %token.id(), valid = report.valid, "validated token");
        report
    }

    /// Validate against a ledger view: the store's status wins over the
    /// status the presented token carries.
    pub async fn validate_in_store(
        &self,
        store: &dyn TokenLedgerStore,
        token: &OfflineToken,
        expected_owner: Option<&OwnerCommitment>,
        now_millis: u64,
    ) -> Result<ValidationReport, StoreError> {
        let record = store.get(token.id()).await?;
        let status = record
            .as_ref()
            .map(|r| r.token.status())
            .unwrap_or_else(|| token.status());

        let mut report = self.validate_with_status(token, status, expected_owner, now_millis);
        if let Some(record) = record {
            if record.token.signing_bytes() != token.signing_bytes()
                || record.token.signature() != token.signature()
            {
                report.reasons.push(ValidationReason::LedgerMismatch);
                report.checks.signature_valid = false;
                report.valid = false;
            }
        }
        Ok(report)
    }

    /// Verify the token signature and, for division children, every proof
    /// back to the issuer-signed root.
    pub fn verify_lineage(&self, token: &OfflineToken) -> Result<(), ValidationReason> {
        let root = token.root_attestation();
        let issuer_key = self
            .keys
            .lookup(&root.issuer_key_id)
            .ok_or_else(|| ValidationReason::UnknownIssuerKey(root.issuer_key_id.clone()))?;
        if !Signer::verify(&issuer_key, &root.signing_bytes(), &root.signature) {
            return Err(ValidationReason::SignatureInvalid);
        }

        if token.is_root() {
            if !token.division_proofs().is_empty() || token.root().is_some() {
                return Err(broken("root token carries division history"));
            }
            return Ok(());
        }

        let proofs = token.division_proofs();
        let last = proofs
            .last()
            .ok_or_else(|| broken("child token has no division proofs"))?;

        if token.issuer_key_id() != &root.issuer_key_id || token.expires_at() != root.expires_at {
            return Err(broken("child does not inherit issuer and expiry from root"));
        }

        let mut parent_id = root.token_id;
        let mut parent_owner = root.owner_commitment;
        let mut parent_amount = root.amount;
        for (depth, proof) in proofs.iter().enumerate() {
            if proof.parent_id != parent_id {
                return Err(broken(&format!("proof {} does not follow its parent", depth)));
            }
            if OwnerCommitment::from_public_key(&proof.holder_key) != parent_owner {
                return Err(broken(&format!("proof {} not signed by the parent owner", depth)));
            }
            if proof.amount.is_zero() || proof.amount > parent_amount {
                return Err(broken(&format!("proof {} amount exceeds parent", depth)));
            }
            if !Signer::verify(&proof.holder_key, &proof.signing_bytes(), &proof.signature) {
                return Err(ValidationReason::SignatureInvalid);
            }
            parent_id = proof.child_id;
            parent_owner = proof.owner_commitment;
            parent_amount = proof.amount;
        }

        if last.child_id != *token.id()
            || last.amount != token.amount()
            || last.owner_commitment != *token.owner_commitment()
            || token.parent_token_id() != Some(&last.parent_id)
        {
            return Err(broken("last proof does not describe this token"));
        }

        if !Signer::verify(&last.holder_key, &token.signing_bytes(), token.signature()) {
            return Err(ValidationReason::SignatureInvalid);
        }
        Ok(())
    }
}

fn broken(detail: &str) -> ValidationReason {
    ValidationReason::BrokenDivisionChain(detail.to_string())
}
