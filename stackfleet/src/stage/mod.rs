//! Staging buckets and project asset synchronisation.

mod bucket;
mod checksum;
mod sync;

pub use bucket::{
    delete_keys, generate_bucket_name, generate_regional_bucket_name, StagingBucket, BUCKET_NAME_PREFIX,
    DELETE_BATCH_SIZE, RUN_ID_TAG,
};
pub use checksum::{content_md5, etag_of_bytes, etag_of_file, PART_SIZE};
pub use sync::{
    local_files, stage_project, AssetStager, LocalFile, SyncOptions, SyncReport, CONFIG_FILE_NAME,
    OUTPUTS_DIR,
};
