//! Agent channel authentication: token issuance/verification and the call gate.

mod authorizer;
mod token;

pub use authorizer::{AuthorizedService, ChannelAuthorizer, TOKEN_METADATA_KEY};
pub use token::{AgentClaims, TokenManager, TokenVerifier};
