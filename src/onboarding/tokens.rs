//! Correlation ID Issuer: step-scoped tokens for outbound activation requests.
//!
//! Wire form: `{STEP}.{hex(business_ref)}.{nonce}`, e.g.
//! `PRE.4341462d31.6f1c...`. The step and business reference come back out
//! of the token without a store lookup; the nonce makes every issue unique.
//! The token is URL-path safe so it can sit in `/callback/{target}/{corr}`.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::store::CorrelationStore;
use super::types::{
    ActivationStep, CorrelationToken, RecordStatus, TokenRecord, MAX_BUSINESS_REF_LEN,
};
use crate::error::{OnboardingError, OnboardingResult};

const SEPARATOR: char = '.';

/// A token decoded from its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub step: ActivationStep,
    pub business_ref: String,
    pub nonce: Uuid,
    pub raw: String,
}

/// Encode a token for `step` and `business_ref`.
pub fn encode_token(step: ActivationStep, business_ref: &str, nonce: Uuid) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        step.token_prefix(),
        hex::encode(business_ref.as_bytes()),
        nonce.simple(),
        sep = SEPARATOR
    )
}

/// Decode a wire token. Never touches the store.
pub fn parse_token(raw: &str) -> OnboardingResult<ParsedToken> {
    let parts: Vec<&str> = raw.split(SEPARATOR).collect();
    let [prefix, encoded_ref, nonce] = parts.as_slice() else {
        return Err(OnboardingError::malformed_token(
            raw,
            "expected three dot-separated segments",
        ));
    };

    let step = ActivationStep::from_token_prefix(prefix)
        .ok_or_else(|| OnboardingError::malformed_token(raw, format!("unknown step '{}'", prefix)))?;

    let ref_bytes = hex::decode(encoded_ref)
        .map_err(|e| OnboardingError::malformed_token(raw, format!("bad reference encoding: {}", e)))?;
    if ref_bytes.is_empty() || ref_bytes.len() > MAX_BUSINESS_REF_LEN {
        return Err(OnboardingError::malformed_token(
            raw,
            "business reference length out of range",
        ));
    }
    let business_ref = String::from_utf8(ref_bytes)
        .map_err(|_| OnboardingError::malformed_token(raw, "business reference is not UTF-8"))?;

    let nonce = Uuid::parse_str(nonce)
        .map_err(|e| OnboardingError::malformed_token(raw, format!("bad nonce: {}", e)))?;

    Ok(ParsedToken {
        step,
        business_ref,
        nonce,
        raw: raw.to_string(),
    })
}

/// Issues and validates correlation tokens against the correlation store.
///
/// `issue` and `consume` mutate the store; callers hold the business
/// reference's key lock around them.
#[derive(Clone)]
pub struct CorrelationIdIssuer {
    store: Arc<dyn CorrelationStore>,
}

impl CorrelationIdIssuer {
    pub fn new(store: Arc<dyn CorrelationStore>) -> Self {
        Self { store }
    }

    /// Issue a fresh token, superseding any outstanding one for the pair.
    pub async fn issue(
        &self,
        step: ActivationStep,
        business_ref: &str,
    ) -> OnboardingResult<CorrelationToken> {
        let token = CorrelationToken {
            step,
            business_ref: business_ref.to_string(),
            issued_at: Utc::now(),
            token: encode_token(step, business_ref, Uuid::new_v4()),
        };

        if let Some(superseded) = self.store.put_token(&token).await? {
            tracing::info!(
                business_ref = business_ref,
                step = %step,
                superseded = %superseded,
                "Correlation token superseded"
            );
        }

        tracing::debug!(
            business_ref = business_ref,
            step = %step,
            token = %token.token,
            "Correlation token issued"
        );
        Ok(token)
    }

    /// Check `parsed` against the outstanding token for its pair.
    ///
    /// A pair that never had a token issued is malformed; a superseded or
    /// already-consumed token is stale.
    pub async fn validate(&self, parsed: &ParsedToken) -> OnboardingResult<TokenRecord> {
        let current = self
            .store
            .load_token(&parsed.business_ref, parsed.step)
            .await?
            .ok_or_else(|| {
                OnboardingError::malformed_token(
                    &parsed.raw,
                    format!("no token was ever issued for {}", parsed.step),
                )
            })?;

        if current.token.token != parsed.raw || !current.is_outstanding() {
            return Err(OnboardingError::StaleToken {
                business_ref: parsed.business_ref.clone(),
                step: parsed.step,
            });
        }
        Ok(current)
    }

    /// Mark the token consumed so a redelivered callback becomes stale.
    pub async fn consume(&self, parsed: &ParsedToken) -> OnboardingResult<bool> {
        Ok(self
            .store
            .consume_token(&parsed.business_ref, parsed.step, &parsed.raw)
            .await?)
    }

    /// Consume the token and move the record to `status` together, so a lost
    /// status write leaves the token outstanding for the sender's retry.
    pub async fn settle(&self, parsed: &ParsedToken, status: RecordStatus) -> OnboardingResult<bool> {
        Ok(self
            .store
            .settle_token(&parsed.business_ref, parsed.step, &parsed.raw, status)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::memory::MemoryCorrelationStore;
    use proptest::prelude::*;

    #[test]
    fn test_longest_ingestible_ref_round_trips_through_token() {
        let business_ref = "9".repeat(MAX_BUSINESS_REF_LEN);
        let raw = encode_token(ActivationStep::Tv, &business_ref, Uuid::new_v4());
        assert_eq!(parse_token(&raw).unwrap().business_ref, business_ref);

        let longer = "9".repeat(MAX_BUSINESS_REF_LEN + 1);
        let raw = encode_token(ActivationStep::Tv, &longer, Uuid::new_v4());
        assert!(parse_token(&raw).is_err());
    }

    #[test]
    fn test_parse_recovers_step_and_ref() {
        let nonce = Uuid::new_v4();
        let raw = encode_token(ActivationStep::PreActivation, "CAF-1", nonce);
        assert!(raw.starts_with("PRE."));

        let parsed = parse_token(&raw).unwrap();
        assert_eq!(parsed.step, ActivationStep::PreActivation);
        assert_eq!(parsed.business_ref, "CAF-1");
        assert_eq!(parsed.nonce, nonce);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for raw in [
            "",
            "PRE",
            "PRE.4341462d31",
            "XYZ.4341462d31.6f1c0c3e2b9d4c4e9a8b7f6e5d4c3b2a",
            "PRE.zz.6f1c0c3e2b9d4c4e9a8b7f6e5d4c3b2a",
            "PRE..6f1c0c3e2b9d4c4e9a8b7f6e5d4c3b2a",
            "PRE.4341462d31.not-a-uuid",
            "PRE-CAF-1-1700000000",
        ] {
            let err = parse_token(raw).unwrap_err();
            assert!(
                matches!(err, OnboardingError::MalformedToken { .. }),
                "{raw} should be malformed"
            );
        }
    }

    #[tokio::test]
    async fn test_reissue_invalidates_prior_token() {
        let store = Arc::new(MemoryCorrelationStore::new());
        let issuer = CorrelationIdIssuer::new(store);

        let first = issuer
            .issue(ActivationStep::PreActivation, "X")
            .await
            .unwrap();
        let second = issuer
            .issue(ActivationStep::PreActivation, "X")
            .await
            .unwrap();
        assert_ne!(first.token, second.token);

        let stale = issuer
            .validate(&parse_token(&first.token).unwrap())
            .await
            .unwrap_err();
        assert!(stale.is_duplicate());

        let current = issuer
            .validate(&parse_token(&second.token).unwrap())
            .await
            .unwrap();
        assert_eq!(current.token, second);
    }

    #[tokio::test]
    async fn test_never_issued_pair_is_malformed() {
        let store = Arc::new(MemoryCorrelationStore::new());
        let issuer = CorrelationIdIssuer::new(store);
        issuer.issue(ActivationStep::Tv, "X").await.unwrap();

        let foreign = encode_token(ActivationStep::Commissioning, "X", Uuid::new_v4());
        let err = issuer
            .validate(&parse_token(&foreign).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardingError::MalformedToken { .. }));
    }

    #[tokio::test]
    async fn test_consumed_token_becomes_stale() {
        let store = Arc::new(MemoryCorrelationStore::new());
        let issuer = CorrelationIdIssuer::new(store);
        let token = issuer.issue(ActivationStep::Tv, "X").await.unwrap();
        let parsed = parse_token(&token.token).unwrap();

        assert!(issuer.consume(&parsed).await.unwrap());
        assert!(issuer.validate(&parsed).await.unwrap_err().is_duplicate());
    }

    proptest! {
        #[test]
        fn prop_tokens_unique_and_self_describing(
            business_ref in "[A-Za-z0-9._/ -]{1,64}",
            step_idx in 0usize..4,
        ) {
            let step = ActivationStep::ALL[step_idx];
            let a = encode_token(step, &business_ref, Uuid::new_v4());
            let b = encode_token(step, &business_ref, Uuid::new_v4());
            prop_assert_ne!(&a, &b);
            prop_assert!(!a.contains('/'));

            let parsed = parse_token(&a).unwrap();
            prop_assert_eq!(parsed.step, step);
            prop_assert_eq!(parsed.business_ref, business_ref);
        }
    }
}
