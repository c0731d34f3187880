pub mod telegram;

pub use telegram::{StorageClient, UploadOutcome};
