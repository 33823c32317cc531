// Payment exchange over a peer link
//
//   payer                      payee
//     | ---- Offer ------------> |   accept_payment
//     | <--- Acceptance -------- |   (or Rejection)
//   finalize_payment

use crate::identity::WalletAddress;
use crate::token::Amount;
use crate::transaction::Transaction;
use crate::transport::{PeerEnvelope, PeerTransport};
use crate::wallet::{PaymentAcceptance, Wallet, WalletError};
use tracing::{debug, warn};

impl Wallet {
    /// Pay `amount` to the peer on `link` and finalize once it countersigns.
    /// If the answer never arrives the offer stays open, its tokens
    /// reserved, since the payee may already hold a signed copy.
    pub async fn pay_peer(
        &mut self,
        link: &dyn PeerTransport,
        receiver: &WalletAddress,
        amount: Amount,
    ) -> Result<Transaction, WalletError> {
        let offer = self.prepare_payment(receiver, amount).await?;
        let id = *offer.transaction_id();

        if let Err(err) = link.send_envelope(&PeerEnvelope::Offer(offer)).await {
            warn!(tx_id = %id, error = %err, "offer not delivered");
            self.cancel_payment(&id)?;
            return Err(err.into());
        }

        match link.receive_envelope().await? {
            PeerEnvelope::Acceptance(acceptance) if acceptance.transaction_id == id => {
                self.finalize_payment(&acceptance).await
            }
            PeerEnvelope::Rejection {
                transaction_id,
                reason,
            } if transaction_id == id => {
                self.cancel_payment(&id)?;
                Err(WalletError::Refused {
                    transaction_id,
                    reason,
                })
            }
            other => Err(WalletError::UnexpectedEnvelope(other.kind())),
        }
    }

    /// Wait for one offer on `link`, check it, and answer with an
    /// acceptance or a rejection
    pub async fn accept_peer(&mut self, link: &dyn PeerTransport) -> Result<PaymentAcceptance, WalletError> {
        let offer = match link.receive_envelope().await? {
            PeerEnvelope::Offer(offer) => offer,
            other => return Err(WalletError::UnexpectedEnvelope(other.kind())),
        };
        let id = *offer.transaction_id();

        match self.accept_payment(&offer).await {
            Ok(acceptance) => {
                link.send_envelope(&PeerEnvelope::Acceptance(acceptance.clone()))
                    .await?;
                debug!(tx_id = %id, "acceptance delivered");
                Ok(acceptance)
            }
            Err(err) => {
                let rejection = PeerEnvelope::Rejection {
                    transaction_id: id,
                    reason: err.to_string(),
                };
                if let Err(send_err) = link.send_envelope(&rejection).await {
                    warn!(tx_id = %id, error = %send_err, "rejection not delivered");
                }
                Err(err)
            }
        }
    }

    /// Take custody of a bundle of tokens sent over `link`; returns how
    /// many were new or already held
    pub async fn receive_bundle(&mut self, link: &dyn PeerTransport) -> Result<usize, WalletError> {
        let tokens = match link.receive_envelope().await? {
            PeerEnvelope::TokenBundle(tokens) => tokens,
            other => return Err(WalletError::UnexpectedEnvelope(other.kind())),
        };
        let count = tokens.len();
        for token in tokens {
            self.receive_token(token).await?;
        }
        Ok(count)
    }
}
