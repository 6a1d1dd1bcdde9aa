use sha2::{Digest, Sha256};

/// Incrementally hashes a sequence of string parts into a stable identifier.
///
/// Each part is written as UTF-8 followed by a NUL byte so that `["ab", "c"]`
/// and `["a", "bc"]` hash differently.
#[derive(Default)]
pub struct UniqueIdBuilder {
    hasher: Sha256,
}

impl UniqueIdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, value: &str) -> Self {
        self.hasher.update(value.as_bytes());
        self.hasher.update([0u8]);
        self
    }

    pub fn compute(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Identifier of a test assembly, derived from its path and optional config file.
pub fn for_assembly(assembly_path: &str, config_file_path: Option<&str>) -> String {
    UniqueIdBuilder::new()
        .add(assembly_path)
        .add(config_file_path.unwrap_or_default())
        .compute()
}
