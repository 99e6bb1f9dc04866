mod archive;
mod config;
mod package;
mod update;
mod version;

pub use archive::{is_remote_reference, ArchiveType};
pub use config::{HostConfig, UpgradeDefaults, CONFIG_FILE_NAME};
pub use package::{parse_package_header, validate_package_id, PackageHeader, PackageKind};
pub use update::UpdateEntry;
pub use version::{parse_runtime_version, runtime_meets_requirement};
