//! Pipeline stage names

use std::fmt;

/// Ordered stages a build task moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Fetch,
    Extract,
    Build,
    Package,
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Build => "build",
            Stage::Package => "package",
            Stage::Upload => "upload",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
