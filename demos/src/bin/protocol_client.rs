//! Protocol client: connects to the protocol server, completes the
//! handshake, prints advertised schemas, and sends a little entity and
//! property traffic.

use clap::{Arg, Command};
use enthalpy::{logging, time};
use entropy::property::{PropertyType, Vec3};
use entropy::{compute_property_hash, ConnectionManager, PropertyMetadata, PropertyValue, SessionManager};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let matches = Command::new("protocol_client")
        .about("Connects a protocol session to a local server.")
        .arg(
            Arg::new("ENDPOINT")
                .help("Socket path to connect to")
                .default_value("/tmp/entropy_protocol.sock"),
        )
        .arg(
            Arg::new("CLIENT_ID")
                .help("Client identifier announced in the handshake")
                .default_value("demo-client-001"),
        )
        .get_matches();

    let endpoint = matches.get_one::<String>("ENDPOINT").unwrap();
    let client_id = matches.get_one::<String>("CLIENT_ID").unwrap();

    let log = logging::init();
    let conn_mgr = Arc::new(ConnectionManager::new(4, &log));
    let sessions = SessionManager::new(conn_mgr.clone(), 4, None, &log);

    let conn = conn_mgr.open_local_connection(endpoint.clone());
    if !conn.valid() {
        logging::error!(log, "no connection slot available");
        std::process::exit(1);
    }

    let session = sessions.create_session(&conn).expect("Error creating session");

    let schema_log = log.new(logging::o!());
    sessions
        .set_schema_advertisement_callback(
            &session,
            Arc::new(move |schema: &entropy::ComponentSchema| {
                logging::info!(schema_log, "schema advertised";
                               "app_id" => &schema.app_id,
                               "component" => &schema.component_name,
                               "version" => schema.schema_version,
                               "type_hash" => %schema.type_hash,
                               "properties" => schema.properties.len());
            }),
        )
        .expect("Error installing schema callback");

    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    sessions
        .set_handshake_callback(
            &session,
            Arc::new(move |_: &str, _: &str| {
                let _ = ready_tx.send(());
            }),
        )
        .expect("Error installing handshake callback");

    conn_mgr.connect(&conn).expect("Error connecting");
    sessions
        .perform_handshake(&session, "DemoClient", client_id)
        .expect("Error starting handshake");

    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Handshake did not complete");
    logging::info!(log, "session ready"; "client_id" => client_id);

    // A small burst of protocol traffic: one entity, one registered
    // property, one update, one batch.
    let entity_id = 12345;
    sessions
        .send_entity_created(&session, entity_id, "com.entropy.example", "ExampleNode", 0)
        .expect("Error sending entity");

    let position = compute_property_hash(entity_id, "Transform", "position");
    sessions
        .send_property_registered(
            &session,
            position,
            PropertyMetadata::new(
                position,
                entity_id,
                "Transform",
                "position",
                PropertyType::Vec3,
                time::timestamp_millis(),
            ),
        )
        .expect("Error registering property");

    sessions
        .send_property_changed(&session, position, PropertyValue::Vec3(Vec3::new(1.0, 2.0, 3.0)))
        .expect("Error sending property update");

    sessions
        .send_property_batch(
            &session,
            vec![(position, PropertyValue::Vec3(Vec3::new(4.0, 5.0, 6.0)))],
        )
        .expect("Error sending batch");

    // Give the server a moment to drain before tearing down.
    std::thread::sleep(Duration::from_millis(500));

    sessions.close_session(&session).expect("Error closing session");
    conn_mgr.close_connection(&conn).expect("Error closing connection");
}
