//! Payment gate for service requests.
//!
//! Validation rules run in order; the first failure wins. Only structurally
//! sound claims that clear the price floor reach the wallet, which first
//! verifies the payment (pure) and then settles it (broadcast + book). A
//! settlement failure after successful verification still rejects the
//! request; nothing is booked.

use crate::wallet::{AcceptPaymentArgs, PaymentClaim, WalletHandle, WalletProvider};

/// Result handed back to the router and into queue/log entries.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub accepted: bool,
    pub txid: Option<String>,
    pub satoshis: u64,
    pub wallet_accepted: bool,
    pub error: Option<String>,
}

impl PaymentOutcome {
    fn rejected(claim: Option<&PaymentClaim>, error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            txid: claim.and_then(|c| c.txid.clone()),
            satoshis: claim.and_then(|c| c.satoshis).unwrap_or(0),
            wallet_accepted: false,
            error: Some(error.into()),
        }
    }
}

async fn destroy_quietly(handle: Box<dyn WalletHandle>) {
    if let Err(e) = handle.destroy().await {
        tracing::warn!(error = %e, "wallet handle release failed");
    }
}

/// Validate a payment claim against a price floor and settle it through the
/// wallet. The wallet handle is acquired and released within this call.
pub async fn verify_and_accept(
    provider: &dyn WalletProvider,
    claim: Option<&PaymentClaim>,
    min_sats: u64,
    sender_key: &str,
    service_id: &str,
) -> PaymentOutcome {
    // Rule 1: a claim must be present.
    let Some(claim) = claim else {
        return PaymentOutcome::rejected(None, "no payment");
    };

    // Rule 2: a sender-side build error invalidates the claim outright.
    if let Some(error) = &claim.error {
        return PaymentOutcome::rejected(Some(claim), error.clone());
    }

    // Rule 3: proof-of-funds data must be present.
    let (Some(beef), Some(satoshis)) = (&claim.beef, claim.satoshis) else {
        return PaymentOutcome::rejected(Some(claim), "missing beef or satoshis");
    };

    // Rule 4: price floor.
    if satoshis < min_sats {
        return PaymentOutcome::rejected(
            Some(claim),
            format!("insufficient payment: {satoshis} < {min_sats}"),
        );
    }

    let handle = match provider.load().await {
        Ok(handle) => handle,
        Err(e) => return PaymentOutcome::rejected(Some(claim), e.to_string()),
    };

    // Pure verification before anything is booked.
    match handle.verify_payment(beef).await {
        Ok(v) if !v.valid => {
            destroy_quietly(handle).await;
            return PaymentOutcome::rejected(
                Some(claim),
                format!("verification failed: {}", v.errors.join(", ")),
            );
        }
        Err(e) => {
            destroy_quietly(handle).await;
            return PaymentOutcome::rejected(Some(claim), e.to_string());
        }
        Ok(_) => {}
    }

    // Settlement: broadcast and book.
    let accept = handle
        .accept_payment(AcceptPaymentArgs {
            beef: beef.clone(),
            derivation_prefix: claim.derivation_prefix.clone(),
            derivation_suffix: claim.derivation_suffix.clone(),
            sender_identity_key: claim
                .sender_identity_key
                .clone()
                .or_else(|| Some(sender_key.to_owned())),
            description: format!("Payment for {service_id}"),
        })
        .await;
    destroy_quietly(handle).await;

    match accept {
        Ok(true) => PaymentOutcome {
            accepted: true,
            txid: claim.txid.clone(),
            satoshis,
            wallet_accepted: true,
            error: None,
        },
        Ok(false) => PaymentOutcome::rejected(Some(claim), "wallet rejected payment"),
        Err(e) => PaymentOutcome::rejected(Some(claim), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{BuiltPayment, CreatePaymentArgs, PaymentVerification, WalletError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Behavior {
        verify_valid: bool,
        accept: bool,
        accepts_called: AtomicU32,
    }

    struct StubWallet(Arc<Behavior>);
    struct StubHandle(Arc<Behavior>);

    #[async_trait]
    impl WalletProvider for StubWallet {
        async fn load(&self) -> Result<Box<dyn WalletHandle>, WalletError> {
            Ok(Box::new(StubHandle(self.0.clone())))
        }
    }

    #[async_trait]
    impl WalletHandle for StubHandle {
        async fn identity_key(&self) -> Result<String, WalletError> {
            Ok("02aa".into())
        }
        async fn balance(&self) -> Result<u64, WalletError> {
            Ok(0)
        }
        async fn verify_payment(&self, _beef: &str) -> Result<PaymentVerification, WalletError> {
            Ok(PaymentVerification {
                valid: self.0.verify_valid,
                errors: if self.0.verify_valid { vec![] } else { vec!["bad proof".into()] },
            })
        }
        async fn accept_payment(&self, _args: AcceptPaymentArgs) -> Result<bool, WalletError> {
            self.0.accepts_called.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.accept)
        }
        async fn create_payment(
            &self,
            _args: CreatePaymentArgs,
        ) -> Result<BuiltPayment, WalletError> {
            Err(WalletError::Call("unused".into()))
        }
        async fn destroy(self: Box<Self>) -> Result<(), WalletError> {
            Ok(())
        }
    }

    fn claim(sats: u64) -> PaymentClaim {
        PaymentClaim {
            beef: Some("AAAA".into()),
            txid: Some("feed".into()),
            satoshis: Some(sats),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn absent_claim_is_rejected_first() {
        let wallet = StubWallet(Arc::new(Behavior::default()));
        let out = verify_and_accept(&wallet, None, 10, "02bb", "echo").await;
        assert!(!out.accepted);
        assert_eq!(out.error.as_deref(), Some("no payment"));
    }

    #[tokio::test]
    async fn sender_error_short_circuits() {
        let wallet = StubWallet(Arc::new(Behavior::default()));
        let c = PaymentClaim { error: Some("build failed".into()), ..Default::default() };
        let out = verify_and_accept(&wallet, Some(&c), 10, "02bb", "echo").await;
        assert_eq!(out.error.as_deref(), Some("build failed"));
    }

    #[tokio::test]
    async fn underpayment_never_reaches_wallet() {
        let behavior = Arc::new(Behavior { verify_valid: true, accept: true, ..Default::default() });
        let wallet = StubWallet(behavior.clone());
        let out = verify_and_accept(&wallet, Some(&claim(9)), 10, "02bb", "echo").await;
        assert!(!out.accepted);
        assert_eq!(out.error.as_deref(), Some("insufficient payment: 9 < 10"));
        assert_eq!(behavior.accepts_called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn verification_failure_blocks_settlement() {
        let behavior = Arc::new(Behavior { verify_valid: false, accept: true, ..Default::default() });
        let wallet = StubWallet(behavior.clone());
        let out = verify_and_accept(&wallet, Some(&claim(15)), 10, "02bb", "echo").await;
        assert!(!out.accepted);
        assert!(out.error.unwrap().contains("bad proof"));
        assert_eq!(behavior.accepts_called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settlement_refusal_rejects_despite_valid_proof() {
        let behavior = Arc::new(Behavior { verify_valid: true, accept: false, ..Default::default() });
        let wallet = StubWallet(behavior);
        let out = verify_and_accept(&wallet, Some(&claim(15)), 10, "02bb", "echo").await;
        assert!(!out.accepted);
        assert!(!out.wallet_accepted);
        assert_eq!(out.error.as_deref(), Some("wallet rejected payment"));
    }

    #[tokio::test]
    async fn sufficient_payment_is_accepted() {
        let behavior = Arc::new(Behavior { verify_valid: true, accept: true, ..Default::default() });
        let wallet = StubWallet(behavior);
        let out = verify_and_accept(&wallet, Some(&claim(15)), 10, "02bb", "echo").await;
        assert!(out.accepted);
        assert!(out.wallet_accepted);
        assert_eq!(out.txid.as_deref(), Some("feed"));
        assert_eq!(out.satoshis, 15);
    }
}
