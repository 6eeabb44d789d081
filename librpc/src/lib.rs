/*
 * This file is part of librpc.
 *
 * librpc is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! A bidirectional, symmetric RPC runtime: either end of a connection can
//! issue calls and receive them, and either end can emit events the other
//! has subscribed to.
//!
//! The pieces, bottom-up:
//!
//! - [`value`] — the tagged value tree every payload is built from.
//! - [`idl`] — an optional schema layer that validates a value tree
//!   against declared structs, unions, enums and typedefs.
//! - [`codec`] — turns a value tree into bytes and back (`yaml`, `native`).
//! - [`frame`] — wraps a value tree in a `{namespace, name, id, args}`
//!   envelope and moves file descriptors out of band.
//! - [`transport`] — carries frame bytes (and descriptors) between peers
//!   (`loopback`, `unix`).
//! - [`mux`] — the `Connection`: call multiplexing, dispatch, subscriptions.
//! - [`events`] — the per-connection event bus fed by the multiplexer.

pub mod codec;
pub mod error;
pub mod events;
pub mod frame;
pub mod idl;
pub mod mux;
pub mod transport;
pub mod value;

pub use error::{RpcError, RpcErrorKind, RpcResult};
pub use mux::Connection;
pub use value::Value;
