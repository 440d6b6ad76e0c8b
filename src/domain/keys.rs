//! Stable identifiers for repositories, jobs and changed files.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies an on-disk repository by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryKey {
    pub owner: String,
    pub name: String,
}

impl RepositoryKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Path of the working copy relative to the repositories root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.owner).join(&self.name)
    }

    /// Check that owner and name are each one plain path component.
    ///
    /// Anything else would place the working copy outside its own directory.
    pub fn validate(&self) -> Result<(), String> {
        for (label, part) in [("owner", &self.owner), ("name", &self.name)] {
            if !is_plain_component(part) {
                return Err(format!("invalid repository {} {:?} in {}", label, part, self));
            }
        }
        Ok(())
    }
}

fn is_plain_component(part: &str) -> bool {
    if part.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(part).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositoryKey {
    type Err = String;

    /// Parse `owner/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, name) = s
            .split_once('/')
            .ok_or_else(|| format!("expected owner/name, got {:?}", s))?;
        let key = Self::new(owner, name);
        key.validate()?;
        Ok(key)
    }
}

/// Identifies one pull request; a newer job with the same key supersedes an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub owner: String,
    pub name: String,
    pub number: u64,
}

impl JobKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            number,
        }
    }

    pub fn repository(&self) -> RepositoryKey {
        RepositoryKey::new(&self.owner, &self.name)
    }

    /// Path of the job's scratch directory relative to the work dir.
    pub fn relative_path(&self) -> PathBuf {
        self.repository().relative_path().join(self.number.to_string())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.name, self.number)
    }
}

/// Short content-independent identifier for a changed file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

const FILE_ID_LEN: usize = 16;

impl FileId {
    pub fn for_path(path: &str) -> Self {
        let digest = Sha256::digest(path.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(FILE_ID_LEN);
        Self(id)
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
