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

//! Small utilities shared by the `librpc` engine and the `librpcd` daemon
//! binary. Kept dependency-light on purpose.

pub mod util;

use std::error::Error;

/// A generic result, used by callers that don't need a specific error type.
pub type TResult<T> = Result<T, Box<dyn Error>>;

/// Default size of a per-connection read buffer.
pub const BUF_CAP: usize = 8 * 1024;

/// Crate version, surfaced in the daemon's startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Project URL, surfaced in the daemon's startup banner.
pub const URL: &str = "https://github.com/librpc/librpc";
