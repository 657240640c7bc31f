//! Relay wire protocol: the JSON envelopes exchanged with the signaling
//! relay and the RTC primitives sealed inside them.
//!
//! The relay routes envelopes by `targetClientId` and acknowledges each
//! outbound request by `requestId`; it never sees primitive contents, only
//! the hex `encryptedPayload`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::sealbox::{EncryptedPayload, EncryptionKey};

/// Relay-assigned identifier of a remote peer on the shared connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteClientId(String);

impl RemoteClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Correlates one outbound request with the relay's acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sdp(String);

impl Sdp {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self(sdp.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// The three kinds of negotiation payload that cross the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtcPrimitive {
    Offer(Sdp),
    Answer(Sdp),
    IceCandidate(IceCandidate),
}

impl RtcPrimitive {
    pub fn method(&self) -> Method {
        match self {
            RtcPrimitive::Offer(_) => Method::Offer,
            RtcPrimitive::Answer(_) => Method::Answer,
            RtcPrimitive::IceCandidate(_) => Method::IceCandidate,
        }
    }
}

/// A primitive tagged with the peer it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifiedPrimitive {
    pub remote_client_id: RemoteClientId,
    pub primitive: RtcPrimitive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifiedOffer {
    pub remote_client_id: RemoteClientId,
    pub sdp: Sdp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifiedAnswer {
    pub remote_client_id: RemoteClientId,
    pub sdp: Sdp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifiedIceCandidate {
    pub remote_client_id: RemoteClientId,
    pub candidate: IceCandidate,
}

/// Connection lifecycle of a remote client, as reported by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteClientState {
    Connected(RemoteClientId),
    Disconnected(RemoteClientId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Offer => "offer",
            Method::Answer => "answer",
            Method::IceCandidate => "iceCandidate",
        };
        f.write_str(name)
    }
}

/// Outbound relay envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub request_id: RequestId,
    pub method: Method,
    pub target_client_id: RemoteClientId,
    pub encrypted_payload: EncryptedPayload,
}

/// Inbound relay messages, discriminated by the `info` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "info", rename_all = "camelCase")]
pub enum RelayMessage {
    /// A sealed primitive forwarded from another client.
    #[serde(rename_all = "camelCase")]
    RemoteData {
        request_id: RequestId,
        remote_client_id: RemoteClientId,
        data: ClientRequest,
    },
    /// Positive acknowledgement of an outbound request.
    #[serde(rename_all = "camelCase")]
    Confirmation { request_id: RequestId },
    /// The target client is not connected to the relay.
    #[serde(rename_all = "camelCase")]
    MissingRemoteClientError { request_id: RequestId },
    /// The relay could not parse or validate the request.
    #[serde(rename_all = "camelCase")]
    ValidationError { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    RemoteClientJustConnected { remote_client_id: RemoteClientId },
    #[serde(rename_all = "camelCase")]
    RemoteClientIsAlreadyConnected { remote_client_id: RemoteClientId },
    #[serde(rename_all = "camelCase")]
    RemoteClientDisconnected { remote_client_id: RemoteClientId },
}

#[derive(Serialize, Deserialize)]
struct SdpPayload {
    sdp: Sdp,
}

/// Seals a primitive into a ready-to-send relay envelope with a fresh
/// request id.
pub fn pack_primitive(
    key: &EncryptionKey,
    target: &RemoteClientId,
    primitive: &RtcPrimitive,
) -> Result<ClientRequest, ProtocolError> {
    let plaintext = match primitive {
        RtcPrimitive::Offer(sdp) | RtcPrimitive::Answer(sdp) => {
            serde_json::to_vec(&SdpPayload { sdp: sdp.clone() })?
        }
        RtcPrimitive::IceCandidate(candidate) => serde_json::to_vec(candidate)?,
    };
    Ok(ClientRequest {
        request_id: RequestId::fresh(),
        method: primitive.method(),
        target_client_id: target.clone(),
        encrypted_payload: key.seal(&plaintext)?,
    })
}

/// Opens a forwarded envelope back into an identified primitive. The sender
/// identity comes from the relay wrapper, not from the sealed payload.
pub fn extract_primitive(
    key: &EncryptionKey,
    remote_client_id: RemoteClientId,
    data: &ClientRequest,
) -> Result<IdentifiedPrimitive, ProtocolError> {
    let plaintext = key.open(&data.encrypted_payload)?;
    let primitive = match data.method {
        Method::Offer => {
            let payload: SdpPayload = serde_json::from_slice(&plaintext)
                .map_err(|_| ProtocolError::PayloadMismatch("offer"))?;
            RtcPrimitive::Offer(payload.sdp)
        }
        Method::Answer => {
            let payload: SdpPayload = serde_json::from_slice(&plaintext)
                .map_err(|_| ProtocolError::PayloadMismatch("answer"))?;
            RtcPrimitive::Answer(payload.sdp)
        }
        Method::IceCandidate => {
            let candidate: IceCandidate = serde_json::from_slice(&plaintext)
                .map_err(|_| ProtocolError::PayloadMismatch("iceCandidate"))?;
            RtcPrimitive::IceCandidate(candidate)
        }
    };
    Ok(IdentifiedPrimitive {
        remote_client_id,
        primitive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([3u8; 32])
    }

    #[test]
    fn client_request_wire_shape() {
        let request = pack_primitive(
            &key(),
            &RemoteClientId::from("browser-1"),
            &RtcPrimitive::Offer(Sdp::new("v=0")),
        )
        .unwrap();
        let value: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "offer");
        assert_eq!(value["targetClientId"], "browser-1");
        assert!(value["requestId"].is_string());
        assert!(
            value["encryptedPayload"]
                .as_str()
                .unwrap()
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        );
    }

    #[test]
    fn pack_extract_round_trip_all_methods() {
        let remote = RemoteClientId::from("peer");
        let primitives = [
            RtcPrimitive::Offer(Sdp::new("v=0 offer")),
            RtcPrimitive::Answer(Sdp::new("v=0 answer")),
            RtcPrimitive::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        ];
        for primitive in primitives {
            let request = pack_primitive(&key(), &remote, &primitive).unwrap();
            let identified = extract_primitive(&key(), remote.clone(), &request).unwrap();
            assert_eq!(identified.remote_client_id, remote);
            assert_eq!(identified.primitive, primitive);
        }
    }

    #[test]
    fn relay_message_discriminators() {
        let confirmation: RelayMessage = serde_json::from_str(
            r#"{"info":"confirmation","requestId":"6ba7b810-9dad-11d1-80b4-00c04fd430c8"}"#,
        )
        .unwrap();
        assert!(matches!(confirmation, RelayMessage::Confirmation { .. }));

        let missing: RelayMessage = serde_json::from_str(
            r#"{"info":"missingRemoteClientError","requestId":"6ba7b810-9dad-11d1-80b4-00c04fd430c8"}"#,
        )
        .unwrap();
        assert!(matches!(
            missing,
            RelayMessage::MissingRemoteClientError { .. }
        ));

        let connected: RelayMessage = serde_json::from_str(
            r#"{"info":"remoteClientJustConnected","remoteClientId":"abc"}"#,
        )
        .unwrap();
        assert_eq!(
            connected,
            RelayMessage::RemoteClientJustConnected {
                remote_client_id: RemoteClientId::from("abc")
            }
        );
    }

    #[test]
    fn remote_data_unwraps_forwarded_request() {
        let request = pack_primitive(
            &key(),
            &RemoteClientId::from("me"),
            &RtcPrimitive::Answer(Sdp::new("v=0 answer")),
        )
        .unwrap();
        let wrapped = serde_json::json!({
            "info": "remoteData",
            "requestId": RequestId::fresh(),
            "remoteClientId": "peer-2",
            "data": request,
        });
        let message: RelayMessage = serde_json::from_value(wrapped).unwrap();
        let RelayMessage::RemoteData {
            remote_client_id,
            data,
            ..
        } = message
        else {
            panic!("expected remoteData");
        };
        assert_eq!(remote_client_id, RemoteClientId::from("peer-2"));
        let identified = extract_primitive(&key(), remote_client_id, &data).unwrap();
        assert_eq!(
            identified.primitive,
            RtcPrimitive::Answer(Sdp::new("v=0 answer"))
        );
    }

    #[test]
    fn ice_candidate_field_casing() {
        let candidate = IceCandidate {
            candidate: "candidate:0".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(1),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 1);
    }

    #[test]
    fn wrong_key_payload_is_rejected() {
        let request = pack_primitive(
            &key(),
            &RemoteClientId::from("peer"),
            &RtcPrimitive::Offer(Sdp::new("v=0")),
        )
        .unwrap();
        let other = EncryptionKey::from_bytes([4u8; 32]);
        let result = extract_primitive(&other, RemoteClientId::from("peer"), &request);
        assert!(matches!(result, Err(ProtocolError::Seal(_))));
    }
}
