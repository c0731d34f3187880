pub mod pics;
pub mod pool;

pub use pics::{fetch_upload_groups, mark_pic_deleted, save_blobs, FilterStats};
pub use pool::create_pool;
