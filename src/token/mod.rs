// Token module - offline token model, amounts, canonical signing bytes,
// issuance, validation and division

mod amount;
pub mod canonical;
mod codec;
mod divider;
mod issuer;
mod model;
mod validator;

pub use amount::{Amount, AmountError, AMOUNT_SCALE};
pub use codec::{from_wire, to_wire, CodecError, TokenCodec};
pub use divider::{build_children, DivisionError, DivisionResult, Divider};
pub use issuer::{IssueError, Issuer, MintOutcome};
pub(crate) use model::TokenDraft;
pub use model::{
    ChildRole, DivisionProof, DivisionRequestId, OfflineToken, RootAttestation, TokenId,
    TokenIdError, TokenStatus,
};
pub use validator::{ValidationChecks, ValidationReason, ValidationReport, Validator};
