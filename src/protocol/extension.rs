use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::CLIENT_NAME;

/// Extension names advertised through the handshake `m` dictionary
pub const MERKLE_EXTENSION_NAME: &str = "merkle";
pub const ELASTIC_EXTENSION_NAME: &str = "elastic";

pub const MERKLE_EXTENSION_ID: u8 = 2;
pub const ELASTIC_EXTENSION_ID: u8 = 3;

/// BEP 10 handshake dictionary. Only the `m` mapping is interpreted
/// here; every other field stays an opaque bencode value for the
/// coordinator's extension handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionHandshake {
    #[serde(rename = "m")]
    pub dict: HashMap<String, u8>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_bencode::value::Value>,
}

impl ExtensionHandshake {
    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Bytes {
        serde_bencode::to_bytes(self).unwrap().into()
    }

    /// Handshake advertising the given extensions plus the standard
    /// client fields.
    pub fn advertising(
        extensions: impl IntoIterator<Item = (String, u8)>,
        request_queue_size: usize,
    ) -> Self {
        let mut dict = HashMap::new();
        for (name, id) in extensions {
            dict.insert(name, id);
        }
        let mut fields = HashMap::new();
        fields.insert(
            "v".to_string(),
            serde_bencode::value::Value::Bytes(CLIENT_NAME.as_bytes().to_vec()),
        );
        fields.insert(
            "reqq".to_string(),
            serde_bencode::value::Value::Int(request_queue_size as i64),
        );
        Self { dict, fields }
    }

    /// Extensions this handshake enables. The `m` dictionary is
    /// additive; a non-zero id turns the extension on.
    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.dict
            .iter()
            .filter(|(_, id)| **id != 0)
            .map(|(name, _)| name.as_str())
    }

    /// Extensions this handshake disables (id 0)
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.dict
            .iter()
            .filter(|(_, id)| **id == 0)
            .map(|(name, _)| name.as_str())
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.dict.get(name).copied().filter(|id| *id != 0)
    }

    /// Client name and version (as a utf-8 string).
    /// More reliable than decoding the peer id.
    pub fn client_name(&self) -> Option<&str> {
        let serde_bencode::value::Value::Bytes(bytes) = self.fields.get("v")? else {
            return None;
        };
        std::str::from_utf8(bytes).ok()
    }

    /// The maximum number of outstanding request messages the remote
    /// supports without dropping any.
    pub fn request_queue_size(&self) -> Option<i64> {
        let serde_bencode::value::Value::Int(size) = self.fields.get("reqq")? else {
            return None;
        };
        Some(*size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extension_handshake() {
        let data = b"d1:md11:LT_metadatai1e6:qT_PEXi2ee1:pi6881e1:v13:\xc2\xb5Torreet 1.2e";
        let handshake = ExtensionHandshake::from_bytes(data).unwrap();
        assert_eq!(*handshake.dict.get("LT_metadata").unwrap(), 1);
        assert_eq!(*handshake.dict.get("qT_PEX").unwrap(), 2);
        assert_eq!(handshake.extension_id("qT_PEX"), Some(2));
        assert_eq!(handshake.extension_id("nope"), None);
        let back = serde_bencode::to_string(&handshake).unwrap();
        assert_eq!(std::str::from_utf8(data).unwrap(), back);
    }

    #[test]
    fn added_and_removed_split() {
        let data = b"d1:md7:elastici3e6:merklei0eee";
        let handshake = ExtensionHandshake::from_bytes(data).unwrap();
        let added: Vec<&str> = handshake.added().collect();
        let removed: Vec<&str> = handshake.removed().collect();
        assert_eq!(added, ["elastic"]);
        assert_eq!(removed, ["merkle"]);
        assert_eq!(handshake.extension_id("merkle"), None);
    }

    #[test]
    fn advertised_fields() {
        let handshake = ExtensionHandshake::advertising(
            [(ELASTIC_EXTENSION_NAME.to_string(), ELASTIC_EXTENSION_ID)],
            16,
        );
        assert_eq!(
            handshake.extension_id(ELASTIC_EXTENSION_NAME),
            Some(ELASTIC_EXTENSION_ID)
        );
        assert_eq!(handshake.request_queue_size(), Some(16));
        assert_eq!(handshake.client_name(), Some(crate::CLIENT_NAME));
        let round = ExtensionHandshake::from_bytes(&handshake.as_bytes()).unwrap();
        assert_eq!(round, handshake);
    }
}
