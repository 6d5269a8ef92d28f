//! Echo server over a local Unix socket endpoint.

use clap::{Arg, Command};
use enthalpy::logging;
use entropy::{create_local_server, ConnectionManager};
use std::sync::Arc;

fn main() {
    let matches = Command::new("local_server")
        .about("Runs a local IPC echo server.")
        .arg(
            Arg::new("ENDPOINT")
                .help("Socket path to listen on")
                .default_value("/tmp/entropy_demo.sock"),
        )
        .get_matches();

    let endpoint = matches.get_one::<String>("ENDPOINT").unwrap();

    let log = logging::init();
    let manager = Arc::new(ConnectionManager::new(64, &log));

    let server = create_local_server(manager.clone(), endpoint.clone()).expect("Error creating server");
    server.listen().expect("Error binding endpoint");
    logging::info!(log, "echo server listening"; "endpoint" => endpoint);

    let mut connections = Vec::new();

    loop {
        let handle = match server.accept() {
            Ok(handle) => handle,
            Err(err) => {
                logging::info!(log, "accept loop stopping"; "reason" => %err);
                break;
            }
        };

        logging::info!(log, "client connected"; "slot" => handle.index());

        let echo_mgr = manager.clone();
        let echo_log = log.new(logging::o!());
        manager
            .set_message_callback(
                &handle,
                Arc::new(move |payload: &[u8]| {
                    let mut reply = b"Echo: ".to_vec();
                    reply.extend_from_slice(payload);
                    if let Err(err) = echo_mgr.send(&handle, &reply) {
                        logging::warn!(echo_log, "echo send failed"; "error" => %err);
                    }
                }),
            )
            .expect("Error installing echo callback");

        connections.push(handle);
    }
}
