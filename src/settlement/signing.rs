//! Settlement instruction signing
//!
//! The instruction body (everything except digest, signature and signer) is
//! serialized to JSON in field declaration order, hashed with SHA-256 and the
//! digest is signed with the engine's ed25519 key.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Amount, ChainId, SettlementInstruction, SettlementQuote, TokenRef};

/// Unsigned instruction body; the signed payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionBody {
    pub deal_id: Uuid,
    pub principal: Amount,
    pub accrued_yield: Amount,
    pub yield_split_percent: u8,
    pub depositor_amount: Amount,
    pub counterparty_amount: Amount,
    pub payout_chain_id: ChainId,
    pub payout_token: TokenRef,
    pub payout_quote: Option<SettlementQuote>,
    pub finalized_at: DateTime<Utc>,
}

impl From<&SettlementInstruction> for InstructionBody {
    fn from(instruction: &SettlementInstruction) -> Self {
        Self {
            deal_id: instruction.deal_id,
            principal: instruction.principal,
            accrued_yield: instruction.accrued_yield,
            yield_split_percent: instruction.yield_split_percent,
            depositor_amount: instruction.depositor_amount,
            counterparty_amount: instruction.counterparty_amount,
            payout_chain_id: instruction.payout_chain_id,
            payout_token: instruction.payout_token.clone(),
            payout_quote: instruction.payout_quote.clone(),
            finalized_at: instruction.finalized_at,
        }
    }
}

impl InstructionBody {
    /// SHA-256 over the canonical JSON encoding
    pub fn digest(&self) -> AppResult<[u8; 32]> {
        let encoded = serde_json::to_vec(self)
            .map_err(|e| AppError::Internal(format!("Failed to encode instruction: {}", e)))?;
        Ok(Sha256::digest(&encoded).into())
    }
}

/// Signs and verifies settlement instructions
pub struct InstructionSigner {
    signing_key: SigningKey,
}

impl InstructionSigner {
    /// Build from a 32-byte ed25519 seed, hex encoded (optional 0x prefix)
    ///
    /// SECURITY: the seed is never logged.
    pub fn from_seed_hex(seed_hex: &str) -> AppResult<Self> {
        let trimmed = seed_hex.trim();
        let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(stripped)
            .map_err(|_| AppError::Config("signing key must be hex encoded".to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AppError::Config("signing key must be 32 bytes".to_string()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    pub fn sign(&self, body: InstructionBody) -> AppResult<SettlementInstruction> {
        let digest = body.digest()?;
        let signature = self.signing_key.sign(&digest);

        Ok(SettlementInstruction {
            deal_id: body.deal_id,
            principal: body.principal,
            accrued_yield: body.accrued_yield,
            yield_split_percent: body.yield_split_percent,
            depositor_amount: body.depositor_amount,
            counterparty_amount: body.counterparty_amount,
            payout_chain_id: body.payout_chain_id,
            payout_token: body.payout_token,
            payout_quote: body.payout_quote,
            finalized_at: body.finalized_at,
            digest: hex::encode(digest),
            signature: hex::encode(signature.to_bytes()),
            signer: self.public_key_hex(),
        })
    }

    /// Recompute the digest and check it was signed by this engine's key
    pub fn verify(&self, instruction: &SettlementInstruction) -> AppResult<()> {
        if !instruction.signer.eq_ignore_ascii_case(&self.public_key_hex()) {
            return Err(SettlementError::InvalidSignature.into());
        }

        let digest = InstructionBody::from(instruction).digest()?;
        if hex::encode(digest) != instruction.digest.to_ascii_lowercase() {
            return Err(SettlementError::InvalidSignature.into());
        }

        let signature_bytes: [u8; 64] = hex::decode(&instruction.signature)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(SettlementError::InvalidSignature)?;

        self.verifying_key()
            .verify(&digest, &Signature::from_bytes(&signature_bytes))
            .map_err(|_| SettlementError::InvalidSignature)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    fn body() -> InstructionBody {
        InstructionBody {
            deal_id: Uuid::new_v4(),
            principal: Amount(1_000_000),
            accrued_yield: Amount(109),
            yield_split_percent: 50,
            depositor_amount: Amount(55),
            counterparty_amount: Amount(1_000_054),
            payout_chain_id: ChainId(1),
            payout_token: TokenRef::new("USDC").unwrap(),
            payout_quote: None,
            finalized_at: Utc::now(),
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = InstructionSigner::from_seed_hex(SEED).unwrap();
        let instruction = signer.sign(body()).unwrap();

        assert_eq!(instruction.signer, signer.public_key_hex());
        assert_eq!(instruction.digest.len(), 64);
        assert!(signer.verify(&instruction).is_ok());
    }

    #[test]
    fn test_tampered_amount_fails() {
        let signer = InstructionSigner::from_seed_hex(SEED).unwrap();
        let mut instruction = signer.sign(body()).unwrap();
        instruction.counterparty_amount = Amount(1_000_100);

        let err = signer.verify(&instruction).unwrap_err();
        assert!(matches!(err, AppError::Settlement(SettlementError::InvalidSignature)));
    }

    #[test]
    fn test_other_key_fails() {
        let signer = InstructionSigner::from_seed_hex(SEED).unwrap();
        let other = InstructionSigner::from_seed_hex(&"11".repeat(32)).unwrap();
        let instruction = other.sign(body()).unwrap();

        assert!(signer.verify(&instruction).is_err());
    }

    #[test]
    fn test_bad_seed_is_config_error() {
        assert!(matches!(InstructionSigner::from_seed_hex("zz"), Err(AppError::Config(_))));
        assert!(matches!(InstructionSigner::from_seed_hex("abcd"), Err(AppError::Config(_))));
        assert!(InstructionSigner::from_seed_hex(&format!("0x{}", SEED)).is_ok());
    }
}
