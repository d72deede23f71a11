// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Shared building blocks of the ONIX services: the subscriber data model,
//! the Beckn envelope slice the gateway inspects, the domain event taxonomy,
//! tide server plumbing, and the Beckn signature scheme.

pub mod auth;
pub mod context;
pub mod events;
pub mod model;
pub mod server;
pub mod signature;
