//! Volume declaration translation

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Bind mounts and the container paths they expose
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSet {
    /// Declarations exactly as written, handed to the engine as bind mounts
    pub binds: Vec<String>,
    /// Container-side mount paths
    pub exposed: BTreeSet<String>,
}

impl VolumeSet {
    /// Translate `HOSTPATH:CONTAINERPATH[:MODE]` declarations
    pub fn parse(tokens: &[String]) -> Result<Self> {
        let exposed = tokens
            .iter()
            .map(|token| container_path(token).map(str::to_string))
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            binds: tokens.to_vec(),
            exposed,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
    }
}

fn container_path(token: &str) -> Result<&str> {
    match token.split(':').nth(1) {
        Some(path) if !path.is_empty() => Ok(path),
        _ => Err(Error::InvalidSpec(format!(
            "volume '{}' must look like HOSTPATH:CONTAINERPATH[:MODE]",
            token
        ))),
    }
}
