use std::sync::Arc;

use crate::config::ServerConfig;
use crate::index::ContentIndex;
use crate::sessions::SessionStore;
use crate::users::CredentialStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub index: Arc<ContentIndex>,
    pub sessions: Arc<SessionStore>,
    pub users: Arc<CredentialStore>,
}
