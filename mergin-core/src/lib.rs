mod auth;
mod client;
mod version;

pub use auth::{AuthError, AuthGate, Credentials, UserSession};
pub use client::{
    MerginClient, MerginError, PingResponse, ProjectListEntry, ProjectListFilter,
    UPLOAD_CHUNK_SIZE, UserInfo, parse_version_label,
};
pub use version::{API_VERSION_MAJOR, API_VERSION_MINOR, ApiVersionStatus, check_api_version};
