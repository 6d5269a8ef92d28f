//! The tagged message set carried inside transport frames.
//!
//! Tags are stable ordinals within the codec; adding or repurposing a tag
//! requires a protocol version bump.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::{ComponentTypeHash, PropertyHash};
use crate::property::{EntityId, PropertyMetadata, PropertyValue};
use crate::proto::wire::{WireReader, WireWriter};
use crate::schema::ComponentSchema;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageTag {
    HandshakeInit = 0,
    HandshakeResponse = 1,
    EntityCreated = 2,
    EntityDestroyed = 3,
    EntityParentChanged = 4,
    PropertyRegistered = 5,
    PropertyChanged = 6,
    PropertyBatch = 7,
    SchemaAdvertisement = 8,
    SchemaUnpublished = 9,
    Error = 10,
}

impl MessageTag {
    pub fn from_u8(raw: u8) -> Option<MessageTag> {
        Some(match raw {
            0 => MessageTag::HandshakeInit,
            1 => MessageTag::HandshakeResponse,
            2 => MessageTag::EntityCreated,
            3 => MessageTag::EntityDestroyed,
            4 => MessageTag::EntityParentChanged,
            5 => MessageTag::PropertyRegistered,
            6 => MessageTag::PropertyChanged,
            7 => MessageTag::PropertyBatch,
            8 => MessageTag::SchemaAdvertisement,
            9 => MessageTag::SchemaUnpublished,
            10 => MessageTag::Error,
            _ => return None,
        })
    }
}

/// A property batch as decoded off the wire. When decoding fails partway,
/// the successfully-parsed prefix is preserved and the failure travels in
/// `decode_error` so receivers can deliver the prefix and then surface the
/// error.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyBatch {
    pub timestamp: u64,
    pub entries: Vec<(PropertyHash, PropertyValue)>,
    pub decode_error: Option<Error>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    HandshakeInit {
        protocol_version: u32,
        client_type: String,
        client_id: String,
        capabilities: u32,
    },
    HandshakeResponse {
        protocol_version: u32,
        capabilities: u32,
    },
    EntityCreated {
        entity_id: EntityId,
        app_id: String,
        type_name: String,
        parent_id: EntityId,
    },
    EntityDestroyed {
        entity_id: EntityId,
    },
    EntityParentChanged {
        entity_id: EntityId,
        new_parent_id: EntityId,
    },
    PropertyRegistered {
        hash: PropertyHash,
        metadata: PropertyMetadata,
    },
    PropertyChanged {
        hash: PropertyHash,
        value: PropertyValue,
    },
    PropertyBatch(PropertyBatch),
    SchemaAdvertisement {
        schema: ComponentSchema,
    },
    SchemaUnpublished {
        type_hash: ComponentTypeHash,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::HandshakeInit { .. } => MessageTag::HandshakeInit,
            Message::HandshakeResponse { .. } => MessageTag::HandshakeResponse,
            Message::EntityCreated { .. } => MessageTag::EntityCreated,
            Message::EntityDestroyed { .. } => MessageTag::EntityDestroyed,
            Message::EntityParentChanged { .. } => MessageTag::EntityParentChanged,
            Message::PropertyRegistered { .. } => MessageTag::PropertyRegistered,
            Message::PropertyChanged { .. } => MessageTag::PropertyChanged,
            Message::PropertyBatch(_) => MessageTag::PropertyBatch,
            Message::SchemaAdvertisement { .. } => MessageTag::SchemaAdvertisement,
            Message::SchemaUnpublished { .. } => MessageTag::SchemaUnpublished,
            Message::Error { .. } => MessageTag::Error,
        }
    }

    pub fn encode(&self) -> NetResult<Vec<u8>> {
        let mut writer = WireWriter::with_capacity(64);
        writer.u8(self.tag() as u8);

        match self {
            Message::HandshakeInit {
                protocol_version,
                client_type,
                client_id,
                capabilities,
            } => {
                writer.u32(*protocol_version);
                writer.string(client_type)?;
                writer.string(client_id)?;
                writer.u32(*capabilities);
            }
            Message::HandshakeResponse {
                protocol_version,
                capabilities,
            } => {
                writer.u32(*protocol_version);
                writer.u32(*capabilities);
            }
            Message::EntityCreated {
                entity_id,
                app_id,
                type_name,
                parent_id,
            } => {
                writer.u64(*entity_id);
                writer.string(app_id)?;
                writer.string(type_name)?;
                writer.u64(*parent_id);
            }
            Message::EntityDestroyed { entity_id } => {
                writer.u64(*entity_id);
            }
            Message::EntityParentChanged {
                entity_id,
                new_parent_id,
            } => {
                writer.u64(*entity_id);
                writer.u64(*new_parent_id);
            }
            Message::PropertyRegistered { hash, metadata } => {
                writer.hash(*hash);
                writer.metadata(metadata)?;
            }
            Message::PropertyChanged { hash, value } => {
                writer.hash(*hash);
                writer.value(value)?;
            }
            Message::PropertyBatch(batch) => {
                if batch.entries.len() > u32::MAX as usize {
                    return Err(Error::invalid_message("Batch too large for wire"));
                }
                writer.u64(batch.timestamp);
                writer.u32(batch.entries.len() as u32);
                for (hash, value) in &batch.entries {
                    writer.hash(*hash);
                    writer.value(value)?;
                }
            }
            Message::SchemaAdvertisement { schema } => {
                writer.schema(schema)?;
            }
            Message::SchemaUnpublished { type_hash } => {
                writer.hash(*type_hash);
            }
            Message::Error { kind, message } => {
                writer.u16(kind.code());
                writer.string(message)?;
            }
        }

        Ok(writer.into_vec())
    }

    /// Decodes one message from a frame payload.
    ///
    /// An unrecognized tag is reported as `InvalidMessage` with the tag in
    /// the text, so the dispatcher can log-and-drop it. Property batches
    /// never fail on a bad entry; the prefix is returned with the failure
    /// attached.
    pub fn decode(payload: &[u8]) -> NetResult<Message> {
        let mut reader = WireReader::new(payload);
        let raw = reader.u8()?;
        let tag = MessageTag::from_u8(raw)
            .ok_or_else(|| Error::invalid_message(format!("Unknown message tag {}", raw)))?;

        Ok(match tag {
            MessageTag::HandshakeInit => Message::HandshakeInit {
                protocol_version: reader.u32()?,
                client_type: reader.string()?,
                client_id: reader.string()?,
                capabilities: reader.u32()?,
            },
            MessageTag::HandshakeResponse => Message::HandshakeResponse {
                protocol_version: reader.u32()?,
                capabilities: reader.u32()?,
            },
            MessageTag::EntityCreated => Message::EntityCreated {
                entity_id: reader.u64()?,
                app_id: reader.string()?,
                type_name: reader.string()?,
                parent_id: reader.u64()?,
            },
            MessageTag::EntityDestroyed => Message::EntityDestroyed {
                entity_id: reader.u64()?,
            },
            MessageTag::EntityParentChanged => Message::EntityParentChanged {
                entity_id: reader.u64()?,
                new_parent_id: reader.u64()?,
            },
            MessageTag::PropertyRegistered => Message::PropertyRegistered {
                hash: reader.hash()?,
                metadata: reader.metadata()?,
            },
            MessageTag::PropertyChanged => Message::PropertyChanged {
                hash: reader.hash()?,
                value: reader.value()?,
            },
            MessageTag::PropertyBatch => {
                let timestamp = reader.u64()?;
                let count = reader.u32()? as usize;
                let mut entries = Vec::new();
                let mut decode_error = None;

                for index in 0..count {
                    let entry = reader.hash().and_then(|hash| Ok((hash, reader.value()?)));
                    match entry {
                        Ok(entry) => entries.push(entry),
                        Err(err) => {
                            decode_error = Some(Error::new(
                                err.kind(),
                                format!("Batch entry {} of {}: {}", index, count, err.message),
                            ));
                            break;
                        }
                    }
                }

                Message::PropertyBatch(PropertyBatch {
                    timestamp,
                    entries,
                    decode_error,
                })
            }
            MessageTag::SchemaAdvertisement => Message::SchemaAdvertisement {
                schema: reader.schema()?,
            },
            MessageTag::SchemaUnpublished => Message::SchemaUnpublished {
                type_hash: reader.hash()?,
            },
            MessageTag::Error => {
                let code = reader.u16()?;
                let kind = ErrorKind::from_code(code)
                    .ok_or_else(|| Error::invalid_message(format!("Unknown error code {}", code)))?;
                Message::Error {
                    kind,
                    message: reader.string()?,
                }
            }
        })
    }
}
