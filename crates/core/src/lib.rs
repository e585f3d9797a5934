pub mod access;
pub mod compat;
pub mod error;
pub mod event;
pub mod followed_slice;
pub mod integrity;
pub mod permissions;
pub mod query;
pub mod stream;
pub mod system_streams;
pub mod types;
pub mod user;
pub mod versioning;
pub mod webhook;

pub use access::{
    Access, AccessType, FeatureSetting, Permission, PermissionLevel, FEATURE_SELF_REVOKE,
};
pub use compat::{BackwardCompat, DISABLE_COMPAT_HEADER};
pub use error::{ApiError, ErrorId};
pub use event::{Attachment, Event, EventDeletion};
pub use followed_slice::{FollowedSlice, ProfileScope};
pub use integrity::{attachment_digest, event_digest};
pub use permissions::{inherit_features, verify_subset, PermissionView};
pub use query::{
    compile, parse, parse_query_param, CompiledConjunct, CompiledQuery, ItemState, RawConjunct,
};
pub use stream::{Stream, StreamTree};
pub use system_streams::{
    tag_from_stream_id, tag_stream_id, SystemStreamDef, SystemStreamsModel, TAG_PREFIX, TAG_ROOT,
};
pub use types::{
    unix_now, AccessId, EventId, StreamId, Token, Tracking, UserId, Username, CUSTOMER_PREFIX,
    LOCAL_STORE, PRIVATE_PREFIX,
};
pub use user::{Session, User};
pub use versioning::{
    head_tombstone, minimized_history_entry, DeletionMode, VersioningSettings,
};
pub use webhook::{Webhook, WebhookRun, WebhookState};
