// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Keyed cryptographic material for the ONIX services.
//!
//! [`manager::KeyManager`] resolves four classes of key material through a
//! shared TTL cache: the local signing and encryption private keys (backed
//! by a [`secrets::SecretStore`]) and a peer's signing and encryption public
//! keys (backed by a registry lookup). [`encryption`] implements the
//! peer-exchange envelope used by the onboarding challenge.

pub mod cache;
pub mod encryption;
pub mod manager;
pub mod provision;
pub mod secrets;

pub use cache::{Cache, MemoryCache};
pub use encryption::{ChallengeService, CryptoError, EncryptionService};
pub use manager::{KeyError, KeyManager, LookupError, RegistryLookup};
pub use provision::{ensure_service_keys, ServiceKeys};
pub use secrets::{FileSecretStore, MemorySecretStore, SecretError, SecretStore};
