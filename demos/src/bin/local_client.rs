//! Sends one message to the local echo server and prints the reply.

use clap::{Arg, Command};
use enthalpy::logging;
use entropy::ConnectionManager;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let matches = Command::new("local_client")
        .about("Connects to the local echo server and sends one message.")
        .arg(
            Arg::new("ENDPOINT")
                .help("Socket path to connect to")
                .default_value("/tmp/entropy_demo.sock"),
        )
        .arg(
            Arg::new("MESSAGE")
                .help("Message to send")
                .default_value("ping"),
        )
        .get_matches();

    let endpoint = matches.get_one::<String>("ENDPOINT").unwrap();
    let message = matches.get_one::<String>("MESSAGE").unwrap();

    let log = logging::init();
    let manager = Arc::new(ConnectionManager::new(4, &log));

    let handle = manager.open_local_connection(endpoint.clone());
    if !handle.valid() {
        logging::error!(log, "no connection slot available");
        std::process::exit(1);
    }

    let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>();
    manager
        .set_message_callback(
            &handle,
            Arc::new(move |payload: &[u8]| {
                let _ = reply_tx.send(payload.to_vec());
            }),
        )
        .expect("Error installing message callback");

    manager.connect(&handle).expect("Error connecting");
    manager.send(&handle, message.as_bytes()).expect("Error sending");

    match reply_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(reply) => {
            logging::info!(log, "reply received"; "reply" => String::from_utf8_lossy(&reply).into_owned());
        }
        Err(_) => {
            logging::error!(log, "no reply within timeout");
        }
    }

    let stats = manager.get_stats(&handle).expect("Error reading stats");
    logging::info!(log, "connection stats";
                   "bytes_sent" => stats.bytes_sent,
                   "bytes_received" => stats.bytes_received,
                   "messages_sent" => stats.messages_sent,
                   "messages_received" => stats.messages_received);

    manager.close_connection(&handle).expect("Error closing connection");
}
