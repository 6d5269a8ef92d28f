//! Protocol server: publishes a component schema and serves sessions over a
//! local socket, logging entity and property traffic from clients.

use clap::{Arg, Command};
use enthalpy::logging;
use entropy::property::PropertyType;
use entropy::schema::PropertyDefinition;
use entropy::{
    create_local_server, ComponentSchema, ComponentSchemaRegistry, ConnectionManager, SessionManager,
};
use std::sync::Arc;

fn main() {
    let matches = Command::new("protocol_server")
        .about("Runs a schema-publishing protocol server.")
        .arg(
            Arg::new("ENDPOINT")
                .help("Socket path to listen on")
                .default_value("/tmp/entropy_protocol.sock"),
        )
        .get_matches();

    let endpoint = matches.get_one::<String>("ENDPOINT").unwrap();

    let log = logging::init();
    let conn_mgr = Arc::new(ConnectionManager::new(64, &log));
    let registry = Arc::new(ComponentSchemaRegistry::new(&log));
    let sessions = Arc::new(SessionManager::new(conn_mgr.clone(), 64, Some(registry.clone()), &log));

    // Publish the Transform schema before any client connects; peers get it
    // advertised the moment their handshake completes.
    let schema = ComponentSchema::create(
        "com.entropy.example",
        "Transform",
        1,
        vec![
            PropertyDefinition::new("position", PropertyType::Vec3, 0, 12),
            PropertyDefinition::new("rotation", PropertyType::Quat, 12, 16),
            PropertyDefinition::new("scale", PropertyType::Vec3, 28, 12),
        ],
        40,
        false,
    )
    .expect("Error building schema");

    registry.register_schema(schema.clone()).expect("Error registering schema");
    registry.publish_schema(schema.type_hash).expect("Error publishing schema");

    let server = create_local_server(conn_mgr.clone(), endpoint.clone()).expect("Error creating server");
    server.listen().expect("Error binding endpoint");
    logging::info!(log, "protocol server listening"; "endpoint" => endpoint);

    loop {
        let conn = match server.accept() {
            Ok(conn) => conn,
            Err(err) => {
                logging::info!(log, "accept loop stopping"; "reason" => %err);
                break;
            }
        };

        let session = match sessions.create_session(&conn) {
            Ok(session) => session,
            Err(err) => {
                logging::warn!(log, "session creation failed"; "error" => %err);
                continue;
            }
        };

        let hs_log = log.new(logging::o!());
        sessions
            .set_handshake_callback(
                &session,
                Arc::new(move |client_type: &str, client_id: &str| {
                    logging::info!(hs_log, "client session ready";
                                   "client_type" => client_type,
                                   "client_id" => client_id);
                }),
            )
            .expect("Error installing handshake callback");

        let entity_log = log.new(logging::o!());
        sessions
            .set_entity_created_callback(
                &session,
                Arc::new(move |entity_id, app_id: &str, type_name: &str, parent_id| {
                    logging::info!(entity_log, "entity created";
                                   "entity_id" => entity_id,
                                   "app_id" => app_id,
                                   "type_name" => type_name,
                                   "parent_id" => parent_id);
                }),
            )
            .expect("Error installing entity callback");

        let prop_log = log.new(logging::o!());
        sessions
            .set_property_changed_callback(
                &session,
                Arc::new(move |hash, value: &entropy::PropertyValue| {
                    logging::info!(prop_log, "property changed";
                                   "hash" => %hash,
                                   "value" => ?value);
                }),
            )
            .expect("Error installing property callback");

        let err_log = log.new(logging::o!());
        sessions
            .set_error_callback(
                &session,
                Arc::new(move |kind, message: &str| {
                    logging::warn!(err_log, "session error";
                                   "kind" => kind.as_str(),
                                   "message" => message);
                }),
            )
            .expect("Error installing error callback");
    }
}
