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

//! `librpcd`: a thin daemon that binds one `librpc::Connection` to a
//! configured transport URI, registers the standard `Discoverable` and
//! `Observable` methods (spec.md §6), and runs until `ctrl_c`.

mod config;
mod registry;

use config::ConfigAction;
use libsky::util::terminal;
use libsky::{URL, VERSION};
use librpc::idl::{loader, TypeSystem};
use librpc::Connection;
use registry::DaemonHandler;
use std::env;
use std::process;
use std::sync::Arc;
use tokio::signal;

const USAGE: &str = "\
librpcd — a librpc daemon

USAGE:
    librpcd [--config <file>] [--uri <uri>] [--codec <name>] [--schema <path>] [--log <filter>]

FLAGS:
    -h, --help       print this message
    -v, --version    print the version and exit
";

fn main() {
    let action = match config::resolve(env::args()) {
        Ok(a) => a,
        Err(e) => {
            let _ = terminal::write_error(format!("librpcd: {e}\n"));
            process::exit(1);
        }
    };
    let cfg = match action {
        ConfigAction::Help => {
            print!("{USAGE}");
            return;
        }
        ConfigAction::Version => {
            println!("librpcd {VERSION}");
            return;
        }
        ConfigAction::Run(cfg) => cfg,
    };

    env_logger::Builder::new()
        .parse_filters(&env::var("RPC_LOG").unwrap_or_else(|_| cfg.log_filter.clone()))
        .init();

    let _ = terminal::write_info(format!("librpcd {VERSION} | {URL}\n"));
    log::info!("binding to {}", cfg.uri);

    let type_system = match &cfg.schema {
        Some(path) => match load_schema(path) {
            Ok(ts) => Some(ts),
            Err(e) => {
                log::error!("failed to load schema {path}: {e}");
                process::exit(1);
            }
        },
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("librpcd")
        .enable_all()
        .build()
        .expect("failed to start the Tokio runtime");

    runtime.block_on(async move {
        let conn = match Connection::connect(&cfg.uri, &cfg.codec).await {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to connect {}: {e}", cfg.uri);
                process::exit(1);
            }
        };
        conn.set_server_handler(Arc::new(DaemonHandler::new(type_system)));
        log::info!("accepting calls on {}", cfg.uri);
        signal::ctrl_c().await.expect("failed to listen for ctrl_c");
        log::info!("shutting down");
        conn.shutdown().await;
    });

    let _ = terminal::write_info("Goodbye :)\n");
}

fn load_schema(path: &str) -> Result<Arc<TypeSystem>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let ts = TypeSystem::new();
    let realm = loader::load_schema(&ts, &raw).map_err(|e| e.to_string())?;
    log::info!("loaded schema realm `{realm}` from {path}");
    Ok(ts)
}
