mod client;

pub use client::{
    ApiErrorClass, CheckedOutUser, CheckinRequest, DownloadLink, PdmError, ServerFileMetadata,
    SyncNewRequest, VaultClient,
};
