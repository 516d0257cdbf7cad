//! Per-request context handed to handlers

use crate::session::{Session, SessionCodec, SessionError};
use crate::store::{DocumentStore, StoreError, User};
use hearth_common::SiteConfig;
use hyper::header::HeaderMap;
use serde_json::{json, Value};

/// Session key holding the signed-in user's id
pub const USER_KEY: &str = "user";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("user lookup: {0}")]
    Store(#[from] StoreError),
}

/// Everything a handler knows about the visitor. Owned by one request.
#[derive(Debug)]
pub struct RequestContext {
    pub session: Session,
    pub user: Option<User>,
    pub site: SiteConfig,
}

impl RequestContext {
    /// Decode the session and resolve the user it names.
    ///
    /// A session naming a user that no longer exists is treated as signed
    /// out; a store failure is an error.
    pub async fn build(
        headers: &HeaderMap,
        codec: &SessionCodec,
        store: &dyn DocumentStore,
        site: SiteConfig,
    ) -> Result<Self, ContextError> {
        let session = codec.decode(headers)?;
        let user = match session.get_str(USER_KEY) {
            Some(id) if !session.is_fresh() => User::find_by_id(store, id).await?,
            _ => None,
        };
        Ok(Self {
            session,
            user,
            site,
        })
    }

    /// Context for responses produced when the real one could not be built.
    pub fn fallback(site: SiteConfig) -> Self {
        Self {
            session: Session::new(),
            user: None,
            site,
        }
    }

    /// Template-facing view, exposed to templates as `ctx`.
    pub fn to_value(&self) -> Value {
        json!({
            "site": self.site,
            "user": self.user,
            "can_write_posts": self.user.as_ref().is_some_and(User::can_write_posts),
        })
    }
}
