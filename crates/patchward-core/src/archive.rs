#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    TarGz,
    Directory,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::Directory => "dir",
        }
    }

    pub fn cache_extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::Directory => "d",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "zip" => Some(Self::Zip),
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "dir" | "directory" => Some(Self::Directory),
            _ => None,
        }
    }

    /// Infers the archive type from the file name of a path or URL. Directories
    /// cannot be recognized from the name alone and yield `None`.
    pub fn infer_from_reference(reference: &str) -> Option<Self> {
        let lower = reference.trim().to_ascii_lowercase();
        let without_fragment = lower.split('#').next().unwrap_or(&lower);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);

        if without_query.ends_with(".zip") {
            return Some(Self::Zip);
        }
        if without_query.ends_with(".tar.gz") || without_query.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        None
    }
}

pub fn is_remote_reference(reference: &str) -> bool {
    let lower = reference.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
