use crate::value::{Value, ValueType};
use crate::wire::{WireDecoder, WireEncoder, WireError, WireResult};
use crate::{PROTO_REV_3, UNASSIGNED_ID};
use std::io::Read;
use std::sync::Arc;

const K_KEEP_ALIVE: u8 = 0x00;
const K_CLIENT_HELLO: u8 = 0x01;
const K_PROTO_UNSUP: u8 = 0x02;
const K_SERVER_HELLO_DONE: u8 = 0x03;
const K_SERVER_HELLO: u8 = 0x04;
const K_CLIENT_HELLO_DONE: u8 = 0x05;
const K_ENTRY_ASSIGN: u8 = 0x10;
const K_ENTRY_UPDATE: u8 = 0x11;
const K_FLAGS_UPDATE: u8 = 0x12;
const K_ENTRY_DELETE: u8 = 0x13;
const K_CLEAR_ENTRIES: u8 = 0x14;
const K_EXECUTE_RPC: u8 = 0x20;
const K_RPC_RESPONSE: u8 = 0x21;

const CLEAR_ALL_MAGIC: u32 = 0xd06c_b27a;

/// In-memory union of the protocol messages. This is the unit moved between
/// the reader threads, storage, and the writer threads.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    ClientHello { proto_rev: u16, identity: String },
    ProtoUnsup { proto_rev: u16 },
    ServerHelloDone,
    ServerHello { flags: u8, identity: String },
    ClientHelloDone,
    EntryAssign {
        name: String,
        id: u16,
        seq_num: u16,
        value: Arc<Value>,
        flags: u32,
    },
    EntryUpdate {
        id: u16,
        seq_num: u16,
        value: Arc<Value>,
    },
    FlagsUpdate { id: u16, flags: u32 },
    EntryDelete { id: u16 },
    ClearEntries,
    ExecuteRpc { id: u16, uid: u16, params: Vec<u8> },
    RpcResponse { id: u16, uid: u16, result: Vec<u8> },
}

impl Message {
    /// The entry id this message targets, when it targets one.
    #[inline]
    pub fn entry_id(&self) -> Option<u16> {
        match self {
            Message::EntryAssign { id, .. }
            | Message::EntryUpdate { id, .. }
            | Message::FlagsUpdate { id, .. }
            | Message::EntryDelete { id } => Some(*id),
            _ => None,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::ClientHello { .. } => "client-hello",
            Message::ProtoUnsup { .. } => "proto-unsup",
            Message::ServerHelloDone => "server-hello-done",
            Message::ServerHello { .. } => "server-hello",
            Message::ClientHelloDone => "client-hello-done",
            Message::EntryAssign { .. } => "entry-assign",
            Message::EntryUpdate { .. } => "entry-update",
            Message::FlagsUpdate { .. } => "flags-update",
            Message::EntryDelete { .. } => "entry-delete",
            Message::ClearEntries => "clear-entries",
            Message::ExecuteRpc { .. } => "execute-rpc",
            Message::RpcResponse { .. } => "rpc-response",
        }
    }

    /// Encodes the message at the encoder's protocol revision. Messages that
    /// do not exist at 2.0 are silently skipped when the negotiated revision
    /// is 2.0; the entry state they carry is reconciled on the next assign.
    pub fn write(&self, encoder: &mut WireEncoder) -> WireResult<()> {
        let v3 = encoder.proto_rev() >= PROTO_REV_3;

        match self {
            Message::KeepAlive => encoder.write_u8(K_KEEP_ALIVE),
            Message::ClientHello { proto_rev, identity } => {
                encoder.write_u8(K_CLIENT_HELLO);
                encoder.write_u16(*proto_rev);
                // The identity is only part of the message from 3.0 on; the
                // requested revision decides, not the encoder's.
                if *proto_rev >= PROTO_REV_3 {
                    encoder.write_string(identity.as_bytes());
                }
            }
            Message::ProtoUnsup { proto_rev } => {
                encoder.write_u8(K_PROTO_UNSUP);
                encoder.write_u16(*proto_rev);
            }
            Message::ServerHelloDone => encoder.write_u8(K_SERVER_HELLO_DONE),
            Message::ServerHello { flags, identity } => {
                if v3 {
                    encoder.write_u8(K_SERVER_HELLO);
                    encoder.write_u8(*flags);
                    encoder.write_string(identity.as_bytes());
                }
            }
            Message::ClientHelloDone => {
                if v3 {
                    encoder.write_u8(K_CLIENT_HELLO_DONE);
                }
            }
            Message::EntryAssign {
                name,
                id,
                seq_num,
                value,
                flags,
            } => {
                encoder.write_u8(K_ENTRY_ASSIGN);
                encoder.write_string(name.as_bytes());
                encoder.write_type(value.value_type())?;
                encoder.write_u16(*id);
                encoder.write_u16(*seq_num);
                if v3 {
                    encoder.write_u8(*flags as u8);
                }
                encoder.write_value_payload(value)?;
            }
            Message::EntryUpdate { id, seq_num, value } => {
                encoder.write_u8(K_ENTRY_UPDATE);
                encoder.write_u16(*id);
                encoder.write_u16(*seq_num);
                if v3 {
                    encoder.write_type(value.value_type())?;
                }
                encoder.write_value_payload(value)?;
            }
            Message::FlagsUpdate { id, flags } => {
                if v3 {
                    encoder.write_u8(K_FLAGS_UPDATE);
                    encoder.write_u16(*id);
                    encoder.write_u8(*flags as u8);
                }
            }
            Message::EntryDelete { id } => {
                if v3 {
                    encoder.write_u8(K_ENTRY_DELETE);
                    encoder.write_u16(*id);
                }
            }
            Message::ClearEntries => {
                if v3 {
                    encoder.write_u8(K_CLEAR_ENTRIES);
                    encoder.write_u32(CLEAR_ALL_MAGIC);
                }
            }
            Message::ExecuteRpc { id, uid, params } => {
                if v3 {
                    encoder.write_u8(K_EXECUTE_RPC);
                    encoder.write_u16(*id);
                    encoder.write_u16(*uid);
                    encoder.write_string(params);
                }
            }
            Message::RpcResponse { id, uid, result } => {
                if v3 {
                    encoder.write_u8(K_RPC_RESPONSE);
                    encoder.write_u16(*id);
                    encoder.write_u16(*uid);
                    encoder.write_string(result);
                }
            }
        }

        Ok(())
    }

    /// Decodes one framed message. At 2.0 an entry-update does not carry the
    /// value's type, so the receiver's knowledge of the entry is consulted
    /// through `get_entry_type`.
    pub fn read<R: Read>(
        decoder: &mut WireDecoder<R>,
        get_entry_type: &dyn Fn(u16) -> Option<ValueType>,
    ) -> WireResult<Message> {
        let v3 = decoder.proto_rev() >= PROTO_REV_3;
        let msg_type = decoder.read_u8()?;

        match msg_type {
            K_KEEP_ALIVE => Ok(Message::KeepAlive),
            K_CLIENT_HELLO => {
                let proto_rev = decoder.read_u16()?;
                // Intentionally gated on the requested revision, not the
                // decoder's: a 3.0 client announces itself to a server that
                // has not negotiated yet.
                let identity = if proto_rev >= PROTO_REV_3 {
                    decoder.read_string()?
                } else {
                    String::new()
                };
                Ok(Message::ClientHello { proto_rev, identity })
            }
            K_PROTO_UNSUP => Ok(Message::ProtoUnsup {
                proto_rev: decoder.read_u16()?,
            }),
            K_SERVER_HELLO_DONE => Ok(Message::ServerHelloDone),
            K_SERVER_HELLO => {
                if !v3 {
                    return Err(WireError::BadMessage("received SERVER_HELLO in protocol < 3.0"));
                }
                let flags = decoder.read_u8()?;
                let identity = decoder.read_string()?;
                Ok(Message::ServerHello { flags, identity })
            }
            K_CLIENT_HELLO_DONE => {
                if !v3 {
                    return Err(WireError::BadMessage(
                        "received CLIENT_HELLO_DONE in protocol < 3.0",
                    ));
                }
                Ok(Message::ClientHelloDone)
            }
            K_ENTRY_ASSIGN => {
                let name = decoder.read_string()?;
                let vtype = decoder.read_type()?;
                let id = decoder.read_u16()?;
                let seq_num = decoder.read_u16()?;
                let flags = if v3 { u32::from(decoder.read_u8()?) } else { 0 };
                let value = decoder.read_value(vtype)?;
                Ok(Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value: Arc::new(value),
                    flags,
                })
            }
            K_ENTRY_UPDATE => {
                let id = decoder.read_u16()?;
                let seq_num = decoder.read_u16()?;
                let vtype = if v3 {
                    decoder.read_type()?
                } else {
                    get_entry_type(id)
                        .ok_or(WireError::BadMessage("update to entry of unknown type"))?
                };
                let value = decoder.read_value(vtype)?;
                Ok(Message::EntryUpdate {
                    id,
                    seq_num,
                    value: Arc::new(value),
                })
            }
            K_FLAGS_UPDATE => {
                if !v3 {
                    return Err(WireError::BadMessage(
                        "received FLAGS_UPDATE in protocol < 3.0",
                    ));
                }
                let id = decoder.read_u16()?;
                let flags = u32::from(decoder.read_u8()?);
                Ok(Message::FlagsUpdate { id, flags })
            }
            K_ENTRY_DELETE => {
                if !v3 {
                    return Err(WireError::BadMessage(
                        "received ENTRY_DELETE in protocol < 3.0",
                    ));
                }
                Ok(Message::EntryDelete {
                    id: decoder.read_u16()?,
                })
            }
            K_CLEAR_ENTRIES => {
                if !v3 {
                    return Err(WireError::BadMessage(
                        "received CLEAR_ENTRIES in protocol < 3.0",
                    ));
                }
                if decoder.read_u32()? != CLEAR_ALL_MAGIC {
                    return Err(WireError::BadMessage(
                        "received incorrect CLEAR_ENTRIES magic value",
                    ));
                }
                Ok(Message::ClearEntries)
            }
            K_EXECUTE_RPC => {
                if !v3 {
                    return Err(WireError::BadMessage("received EXECUTE_RPC in protocol < 3.0"));
                }
                let id = decoder.read_u16()?;
                let uid = decoder.read_u16()?;
                let params = decoder.read_string_bytes()?;
                Ok(Message::ExecuteRpc { id, uid, params })
            }
            K_RPC_RESPONSE => {
                if !v3 {
                    return Err(WireError::BadMessage("received RPC_RESPONSE in protocol < 3.0"));
                }
                let id = decoder.read_u16()?;
                let uid = decoder.read_u16()?;
                let result = decoder.read_string_bytes()?;
                Ok(Message::RpcResponse { id, uid, result })
            }
            _ => Err(WireError::BadMessage("unrecognized message type")),
        }
    }

    #[inline]
    pub fn entry_assign(
        name: impl Into<String>,
        id: u16,
        seq_num: u16,
        value: Arc<Value>,
        flags: u32,
    ) -> Message {
        Message::EntryAssign {
            name: name.into(),
            id,
            seq_num,
            value,
            flags,
        }
    }

    #[inline]
    pub fn entry_update(id: u16, seq_num: u16, value: Arc<Value>) -> Message {
        Message::EntryUpdate { id, seq_num, value }
    }

    /// An assignment request: the client does not yet know the network id.
    #[inline]
    pub fn entry_assign_request(name: impl Into<String>, seq_num: u16, value: Arc<Value>, flags: u32) -> Message {
        Message::entry_assign(name, UNASSIGNED_ID, seq_num, value, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PROTO_REV_2, PROTO_REV_3};
    use std::io::Cursor;

    fn no_types(_: u16) -> Option<ValueType> {
        None
    }

    fn roundtrip(msg: &Message, proto_rev: u16) -> Message {
        let mut enc = WireEncoder::new(proto_rev);
        msg.write(&mut enc).unwrap();

        let mut dec = WireDecoder::new(Cursor::new(enc.data().to_vec()), proto_rev);
        Message::read(&mut dec, &no_types).unwrap()
    }

    #[test]
    fn test_roundtrip_v3() {
        let msgs = vec![
            Message::KeepAlive,
            Message::ClientHello {
                proto_rev: PROTO_REV_3,
                identity: "robot".to_owned(),
            },
            Message::ProtoUnsup { proto_rev: PROTO_REV_3 },
            Message::ServerHelloDone,
            Message::ServerHello {
                flags: 1,
                identity: "server".to_owned(),
            },
            Message::ClientHelloDone,
            Message::entry_assign("/a/b", 3, 7, Arc::new(Value::Double(0.5)), 1),
            Message::entry_update(3, 8, Arc::new(Value::Str("v".to_owned()))),
            Message::FlagsUpdate { id: 3, flags: 1 },
            Message::EntryDelete { id: 9 },
            Message::ClearEntries,
            Message::ExecuteRpc {
                id: 4,
                uid: 11,
                params: vec![1, 2, 3],
            },
            Message::RpcResponse {
                id: 4,
                uid: 11,
                result: vec![4, 5],
            },
        ];

        for msg in msgs {
            assert_eq!(roundtrip(&msg, PROTO_REV_3), msg);
        }
    }

    #[test]
    fn test_roundtrip_v2() {
        let msgs = vec![
            Message::KeepAlive,
            Message::ProtoUnsup { proto_rev: PROTO_REV_2 },
            Message::ServerHelloDone,
            Message::entry_assign("/x", 1, 2, Arc::new(Value::Boolean(true)), 0),
        ];

        for msg in msgs {
            assert_eq!(roundtrip(&msg, PROTO_REV_2), msg);
        }
    }

    #[test]
    fn test_client_hello_v2_has_no_identity() {
        let msg = Message::ClientHello {
            proto_rev: PROTO_REV_2,
            identity: String::new(),
        };

        let mut enc = WireEncoder::new(PROTO_REV_2);
        msg.write(&mut enc).unwrap();

        assert_eq!(enc.data(), &[0x01, 0x02, 0x00]);
        assert_eq!(roundtrip(&msg, PROTO_REV_2), msg);
    }

    #[test]
    fn test_clear_entries_magic() {
        let mut enc = WireEncoder::new(PROTO_REV_3);
        Message::ClearEntries.write(&mut enc).unwrap();

        assert_eq!(enc.data(), &[0x14, 0xd0, 0x6c, 0xb2, 0x7a]);

        let mut dec = WireDecoder::new(
            Cursor::new(vec![0x14, 0xd0, 0x6c, 0xb2, 0x7b]),
            PROTO_REV_3,
        );
        assert_eq!(
            Message::read(&mut dec, &no_types).unwrap_err(),
            WireError::BadMessage("received incorrect CLEAR_ENTRIES magic value")
        );
    }

    #[test]
    fn test_v3_only_messages_rejected_at_v2() {
        for data in &[
            vec![0x12u8, 0x00, 0x01, 0x00],
            vec![0x13u8, 0x00, 0x01],
            vec![0x14u8, 0xd0, 0x6c, 0xb2, 0x7a],
            vec![0x04u8, 0x00, 0x00, 0x00],
            vec![0x05u8],
            vec![0x20u8, 0x00, 0x01, 0x00, 0x02, 0x01],
        ] {
            let mut dec = WireDecoder::new(Cursor::new(data.clone()), PROTO_REV_2);
            match Message::read(&mut dec, &no_types) {
                Err(WireError::BadMessage(_)) => {}
                other => panic!("expected bad message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_v3_only_messages_skipped_on_v2_write() {
        let mut enc = WireEncoder::new(PROTO_REV_2);

        Message::FlagsUpdate { id: 1, flags: 1 }.write(&mut enc).unwrap();
        Message::EntryDelete { id: 1 }.write(&mut enc).unwrap();
        Message::ClearEntries.write(&mut enc).unwrap();

        assert_eq!(enc.len(), 0);
    }

    #[test]
    fn test_update_v2_uses_entry_type_lookup() {
        let msg = Message::entry_update(5, 2, Arc::new(Value::Double(2.5)));

        let mut enc = WireEncoder::new(PROTO_REV_2);
        msg.write(&mut enc).unwrap();

        let data = enc.data().to_vec();

        // With the entry known the payload decodes by the stored type.
        let lookup = |id: u16| {
            if id == 5 {
                Some(ValueType::Double)
            } else {
                None
            }
        };
        let mut dec = WireDecoder::new(Cursor::new(data.clone()), PROTO_REV_2);
        assert_eq!(Message::read(&mut dec, &lookup).unwrap(), msg);

        // Without it the message is undecodable.
        let mut dec = WireDecoder::new(Cursor::new(data), PROTO_REV_2);
        assert_eq!(
            Message::read(&mut dec, &no_types).unwrap_err(),
            WireError::BadMessage("update to entry of unknown type")
        );
    }

    #[test]
    fn test_unknown_message_type() {
        let mut dec = WireDecoder::new(Cursor::new(vec![0x6fu8]), PROTO_REV_3);
        assert_eq!(
            Message::read(&mut dec, &no_types).unwrap_err(),
            WireError::BadMessage("unrecognized message type")
        );
    }

    #[test]
    fn test_server_assign_wire_layout_v3() {
        // name "/x", type double, id 3, seq 0, flags 0, payload 1.0
        let msg = Message::entry_assign("/x", 3, 0, Arc::new(Value::Double(1.0)), 0);

        let mut enc = WireEncoder::new(PROTO_REV_3);
        msg.write(&mut enc).unwrap();

        assert_eq!(
            enc.data(),
            &[
                0x10, // entry-assign
                0x02, b'/', b'x', // uleb128 length + name
                0x01, // double type
                0x00, 0x03, // id
                0x00, 0x00, // seq num
                0x00, // flags
                0x3f, 0xf0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 1.0
            ]
        );
    }
}
