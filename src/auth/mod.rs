mod claims;
mod error;
pub mod openid;
pub mod schema;
pub mod session_store;
pub(crate) mod user;

pub use claims::{ClassCode, Gender, PerUnit};
pub use error::{AuthError, ErrorBody, ErrorResponse};
pub use openid::{AssertionMode, CallbackParams, DirectVerifier, OpenidVerifier};
pub use session_store::{
    LoginState, MemorySessionStore, SessionError, SessionStore, SharedSessionStore,
};
pub use user::{AuthRecord, RoleChoices, UserRecord, account_id_from_identity, parse_auth_info};
