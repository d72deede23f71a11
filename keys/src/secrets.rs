// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use snafu::Snafu;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum SecretError {
    #[snafu(display("secret {} not found", name))]
    NotFound { name: String },

    #[snafu(display("secret store unavailable: {}", msg))]
    Unavailable { msg: String },
}

/// Backing store for private key material. Absence and unavailability are
/// distinct: a missing secret is a stable answer, an unavailable store is
/// not, and the KeyManager treats only the former as cacheable-by-caller.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, SecretError>;
    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError>;
}

#[derive(Clone)]
pub struct MemorySecretStore {
    secrets: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self {
            secrets: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, SecretError> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound { name: name.into() })
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        self.secrets
            .write()
            .await
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }
}

/// Persistent file backed store. Each secret is a single file inside `dir`,
/// named by the hex encoding of the secret name, written atomically via a
/// temporary file and rename.
#[derive(Clone, Debug)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", hex::encode(name)))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, SecretError> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound { name: name.into() })
            }
            Err(err) => Err(SecretError::Unavailable {
                msg: err.to_string(),
            }),
        }
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        let path = self.path(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|err| SecretError::Unavailable {
                msg: err.to_string(),
            })
    }
}
