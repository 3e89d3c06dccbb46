/*!
 * @file wire_protocol.rs
 * @brief MongoDB wire protocol framing (A1): OP_MSG decode/encode
 *
 * Narrowed from the base server's version, which hardcoded the legacy
 * OP_REPLY opcode (2004) and flattened `parse_op_msg` straight through
 * `bson::from_slice` with no section framing at all. This reads the real
 * OP_MSG shape (flagBits, then one or more sections: kind 0 a single BSON
 * document, kind 1 a named document sequence) and always replies with
 * OP_MSG (2013), the only opcode a modern MongoDB client expects back.
 * Per-command response shapes now live in [`crate::dispatcher`] — this
 * module only frames bytes.
 */

use bson::{Bson, Document};

use crate::error::{RelayError, Result};

pub const OP_MSG: u32 = 2013;

#[derive(Debug, Clone)]
pub struct MongoMessage {
    pub message_length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: u32,
    pub payload: Vec<u8>,
}

pub struct WireProtocolHandler;

impl Default for WireProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WireProtocolHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_message(&self, buffer: &[u8]) -> Result<MongoMessage> {
        if buffer.len() < 16 {
            return Err(RelayError::WireProtocol("message shorter than the 16-byte header".to_string()));
        }

        let message_length = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        let request_id = u32::from_le_bytes(buffer[4..8].try_into().unwrap());
        let response_to = u32::from_le_bytes(buffer[8..12].try_into().unwrap());
        let op_code = u32::from_le_bytes(buffer[12..16].try_into().unwrap());
        let payload = buffer[16..].to_vec();

        Ok(MongoMessage {
            message_length,
            request_id,
            response_to,
            op_code,
            payload,
        })
    }

    /// Merge an OP_MSG payload's sections into one command document. A
    /// kind-1 section's documents land as a `Bson::Array` under its
    /// identifier (`"documents"`, `"updates"`, `"deletes"`), matching how
    /// a bulk-write command's document sequence is addressed by name.
    pub fn parse_op_msg(&self, payload: &[u8]) -> Result<Document> {
        if payload.len() < 4 {
            return Err(RelayError::WireProtocol("OP_MSG payload shorter than flagBits".to_string()));
        }

        let mut offset = 4usize;
        let mut command = Document::new();
        while offset < payload.len() {
            let kind = payload[offset];
            offset += 1;
            match kind {
                0 => {
                    let (doc, consumed) = read_bson_document(&payload[offset..])?;
                    offset += consumed;
                    for (key, value) in doc {
                        command.insert(key, value);
                    }
                }
                1 => {
                    if offset + 4 > payload.len() {
                        return Err(RelayError::WireProtocol("truncated document sequence section".to_string()));
                    }
                    let size = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
                    let section_end = offset + size;
                    offset += 4;

                    let name_end = payload[offset..]
                        .iter()
                        .position(|&b| b == 0)
                        .map(|p| offset + p)
                        .ok_or_else(|| RelayError::WireProtocol("unterminated sequence identifier".to_string()))?;
                    let identifier = String::from_utf8_lossy(&payload[offset..name_end]).to_string();
                    offset = name_end + 1;

                    let mut docs = Vec::new();
                    while offset < section_end {
                        let (doc, consumed) = read_bson_document(&payload[offset..])?;
                        offset += consumed;
                        docs.push(Bson::Document(doc));
                    }
                    command.insert(identifier, Bson::Array(docs));
                }
                other => {
                    return Err(RelayError::WireProtocol(format!("unsupported OP_MSG section kind {other}")));
                }
            }
        }
        Ok(command)
    }

    /// Frame `response` as an OP_MSG reply: flagBits = 0, a single kind-0
    /// section carrying the whole document.
    pub fn generate_response(&self, request_id: u32, response_to: u32, response: &Document) -> Result<Vec<u8>> {
        let bson_bytes = bson::to_vec(response).map_err(RelayError::from)?;
        let mut body = Vec::with_capacity(5 + bson_bytes.len());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&bson_bytes);

        let message_length = 16 + body.len() as u32;
        let mut buffer = Vec::with_capacity(message_length as usize);
        buffer.extend_from_slice(&message_length.to_le_bytes());
        buffer.extend_from_slice(&request_id.to_le_bytes());
        buffer.extend_from_slice(&response_to.to_le_bytes());
        buffer.extend_from_slice(&OP_MSG.to_le_bytes());
        buffer.extend_from_slice(&body);
        Ok(buffer)
    }
}

fn read_bson_document(bytes: &[u8]) -> Result<(Document, usize)> {
    if bytes.len() < 4 {
        return Err(RelayError::WireProtocol("truncated BSON document".to_string()));
    }
    let size = i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if size < 4 || bytes.len() < size {
        return Err(RelayError::WireProtocol("BSON document length exceeds buffer".to_string()));
    }
    let doc = bson::from_slice::<Document>(&bytes[..size]).map_err(RelayError::from)?;
    Ok((doc, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_document(doc: &Document) -> Vec<u8> {
        bson::to_vec(doc).unwrap()
    }

    #[test]
    fn round_trips_a_kind_zero_section() {
        let handler = WireProtocolHandler::new();
        let command = bson::doc! { "ping": 1i32 };
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&encode_document(&command));

        let parsed = handler.parse_op_msg(&payload).unwrap();
        assert_eq!(parsed.get_i32("ping").unwrap(), 1);
    }

    #[test]
    fn merges_a_kind_one_document_sequence() {
        let handler = WireProtocolHandler::new();
        let command = bson::doc! { "insert": "widgets" };
        let doc_bytes = encode_document(&bson::doc! { "a": 1i32 });

        let mut section = Vec::new();
        section.extend_from_slice(b"documents\0");
        section.extend_from_slice(&doc_bytes);
        let size = (4 + section.len()) as u32;

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&encode_document(&command));
        payload.push(1);
        payload.extend_from_slice(&size.to_le_bytes());
        payload.extend_from_slice(&section);

        let parsed = handler.parse_op_msg(&payload).unwrap();
        assert_eq!(parsed.get_str("insert").unwrap(), "widgets");
        assert_eq!(parsed.get_array("documents").unwrap().len(), 1);
    }

    #[test]
    fn generate_response_frames_an_op_msg_reply() {
        let handler = WireProtocolHandler::new();
        let bytes = handler.generate_response(7, 3, &bson::doc! { "ok": 1.0 }).unwrap();
        let message_length = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let op_code = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(message_length as usize, bytes.len());
        assert_eq!(op_code, OP_MSG);
    }
}
