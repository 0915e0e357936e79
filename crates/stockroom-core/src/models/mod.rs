//! Data models for Stockroom

mod change;
mod operation;
mod record;
mod table;
mod user;

pub use change::{ChangeKind, DocumentChange, RemoteDocument, RemoteUpdate};
pub use operation::{Operation, OperationKind, OperationStatus, Priority};
pub use record::{
    document_str, outbound_fields, Document, EntityRecord, SyncStatus, CURRENT_SCHEMA_VERSION,
    FIELD_CREATED_AT, FIELD_ID, FIELD_OWNER_ID, FIELD_REMOTE_ID, FIELD_SCHEMA_VERSION,
    FIELD_SYNC_STATUS, FIELD_UPDATED_AT, LOCAL_ONLY_FIELDS,
};
pub use table::Table;
pub use user::CurrentUser;
