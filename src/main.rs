mod auth;
mod config;
mod connection;
mod events;
mod logging;
mod registry;
mod router;
mod runtime;
mod server;
mod services;
mod shutdown;
mod wire;
mod workers;

use std::process;

use config::AppConfig;
use events::{CONNECTION_CLOSED_EVENT, CONNECTION_ESTABLISHED_EVENT};
use rmpv::Value;
use server::Server;
use services::{Permission, ServiceDefinition};
use shutdown::ShutdownHooks;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let server = Server::new(app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });

    // Connection lifecycle observers; embedding applications hang their
    // own bookkeeping off these events.
    let emitter = server.emitter();
    emitter.on(CONNECTION_ESTABLISHED_EVENT, |event| {
        println!("client connected: {:?}", event.payload);
        Ok(())
    });
    emitter.on(CONNECTION_CLOSED_EVENT, |event| {
        println!("client disconnected: {:?}", event.payload);
        Ok(())
    });

    server.register_service(
        ServiceDefinition::new("Sys")
            .permission(Permission::Open)
            .method("ping", |_ctx| Ok(Value::from("pong")))
            .method("version", |_ctx| Ok(Value::from(env!("CARGO_PKG_VERSION")))),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    server
        .logger()
        .info(Some("main"), "Shutdown hooks installed for SIGINT/SIGTERM");

    if let Err(error) = server.run(&shutdown_hooks) {
        eprintln!("server error: {error}");
        process::exit(2);
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::discover(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: svclink is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;110m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                        ████   ███             █████
                       ░░███  ░░░             ░░███
  █████  █████ █████  ██████  ███  ████████   ░███ █████
 ███░░  ░░███ ░░███  ███░░███░███ ░░███░░███  ░███░░███
░░█████  ░███  ░███ ░███ ░░░ ░███  ░███ ░███  ░██████░
 ░░░░███ ░░███ ███  ░███  ███░███  ░███ ░███  ░███░░███
 ██████   ░░█████   ░░██████ █████ ████ █████ ████ █████
░░░░░░     ░░░░░     ░░░░░░ ░░░░░ ░░░░ ░░░░░ ░░░░ ░░░░░ "#;
    const APP_DESCRIPTION: &str =
        "Persistent-connection RPC and event broadcast runtime over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("SVCLINK_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
