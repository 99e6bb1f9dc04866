mod checksum;
mod tree;

pub use checksum::{sha256_hex, sha256_file_hex, verify_sha256_file};
pub use tree::tree_digest_hex;
