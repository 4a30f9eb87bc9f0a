// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use egg::config::Config;

fn main() {
    // The reserved argv[1] routes into the mount wrapper before clap sees
    // the supervisor grammar; the wrapper runs inside the namespaces the
    // parent created and must stay free of any async runtime.
    #[cfg(target_os = "linux")]
    if std::env::args().nth(1).as_deref() == Some(egg::sandbox::WRAPPER_ARG) {
        let args = egg::sandbox::wrapper::WrapperArgs::parse_from(std::env::args().skip(1));
        std::process::exit(egg::sandbox::wrapper::run(args));
    }

    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
    egg::session::run::init_tracing(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: starting runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(egg::session::run::run(config)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
