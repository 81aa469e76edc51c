//! Wire format of the opaque envelopes handed to the transport.
//!
//! Layout (integers little-endian):
//!
//! ```text
//! version      u8   (= 1)
//! kind         u8   (1 = PreKeyMessage, 2 = NormalMessage)
//! sender       u16 length || utf-8 user id || u32 device id
//! [prekey]     identity key (32) || ephemeral key (32) || u32 signed prekey id
//!              || u8 flag || [u32 one-time prekey id]     (PreKeyMessage only)
//! header       ratchet key (32) || u32 previous counter || u32 counter
//! nonce        12 bytes
//! tag          16 bytes
//! ciphertext   remainder
//! ```

use crate::address::DeviceAddress;
use crate::double_ratchet::{Header, RatchetMessage};
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::primitives::{SealedBox, NONCE_SIZE, TAG_SIZE};
use crate::x3dh::InitialMessage;

pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Carries an X3DH initial message ahead of the ratchet message
    PreKeyMessage = 1,
    NormalMessage = 2,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EnvelopeKind::PreKeyMessage),
            2 => Ok(EnvelopeKind::NormalMessage),
            _ => Err(Error::InvalidEnvelope),
        }
    }
}

/// One encrypted message as exchanged between devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: DeviceAddress,
    /// Present until the sender has heard back from the recipient
    pub prekey: Option<InitialMessage>,
    pub message: RatchetMessage,
}

impl Envelope {
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        if self.prekey.is_some() {
            EnvelopeKind::PreKeyMessage
        } else {
            EnvelopeKind::NormalMessage
        }
    }

    /// Serialize envelope for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let user = self.sender.user_id.as_bytes();
        let user_len = u16::try_from(user.len()).map_err(|_| Error::SerializationError)?;

        let sealed = &self.message.sealed;
        let mut out = Vec::with_capacity(
            2 + 2 + user.len() + 4 + 73 + Header::SIZE + SealedBox::OVERHEAD + sealed.ciphertext.len(),
        );
        out.push(WIRE_VERSION);
        out.push(self.kind() as u8);

        out.extend_from_slice(&user_len.to_le_bytes());
        out.extend_from_slice(user);
        out.extend_from_slice(&self.sender.device_id.to_le_bytes());

        if let Some(prekey) = &self.prekey {
            out.extend_from_slice(prekey.identity_key.as_bytes());
            out.extend_from_slice(prekey.ephemeral_key.as_bytes());
            out.extend_from_slice(&prekey.signed_prekey_id.to_le_bytes());
            match prekey.one_time_prekey_id {
                Some(id) => {
                    out.push(1);
                    out.extend_from_slice(&id.to_le_bytes());
                }
                None => out.push(0),
            }
        }

        out.extend_from_slice(&self.message.header.to_bytes());
        out.extend_from_slice(&sealed.nonce);
        out.extend_from_slice(&sealed.tag);
        out.extend_from_slice(&sealed.ciphertext);
        Ok(out)
    }

    /// Parse an envelope. Any malformed input is `InvalidEnvelope`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        if reader.u8()? != WIRE_VERSION {
            return Err(Error::InvalidEnvelope);
        }
        let kind = EnvelopeKind::try_from(reader.u8()?)?;

        let user_len = usize::from(reader.u16()?);
        let user_id = std::str::from_utf8(reader.take(user_len)?)
            .map_err(|_| Error::InvalidEnvelope)?
            .to_owned();
        let sender = DeviceAddress::new(user_id, reader.u32()?);

        let prekey = match kind {
            EnvelopeKind::NormalMessage => None,
            EnvelopeKind::PreKeyMessage => Some(InitialMessage {
                identity_key: reader.public_key()?,
                ephemeral_key: reader.public_key()?,
                signed_prekey_id: reader.u32()?,
                one_time_prekey_id: match reader.u8()? {
                    0 => None,
                    1 => Some(reader.u32()?),
                    _ => return Err(Error::InvalidEnvelope),
                },
            }),
        };

        let header = Header::from_bytes(reader.take(Header::SIZE)?)?;
        let nonce = reader.array::<NONCE_SIZE>()?;
        let tag = reader.array::<TAG_SIZE>()?;
        let ciphertext = reader.rest().to_vec();

        Ok(Self {
            sender,
            prekey,
            message: RatchetMessage {
                header,
                sealed: SealedBox {
                    nonce,
                    ciphertext,
                    tag,
                },
            },
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(Error::InvalidEnvelope);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| Error::InvalidEnvelope)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn public_key(&mut self) -> Result<PublicKey> {
        Ok(PublicKey::from_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use rand_core::OsRng;

    fn sample(prekey: Option<InitialMessage>) -> Envelope {
        Envelope {
            sender: DeviceAddress::new("alice", 7),
            prekey,
            message: RatchetMessage {
                header: Header {
                    ratchet_key: KeyPair::generate(&mut OsRng).public_key(),
                    counter: 3,
                    previous_counter: 9,
                },
                sealed: SealedBox {
                    nonce: [1; NONCE_SIZE],
                    ciphertext: b"ciphertext".to_vec(),
                    tag: [2; TAG_SIZE],
                },
            },
        }
    }

    fn initial(one_time_prekey_id: Option<u32>) -> InitialMessage {
        InitialMessage {
            identity_key: KeyPair::generate(&mut OsRng).public_key(),
            ephemeral_key: KeyPair::generate(&mut OsRng).public_key(),
            signed_prekey_id: 4,
            one_time_prekey_id,
        }
    }

    #[test]
    fn test_normal_message_roundtrip() {
        let envelope = sample(None);
        assert_eq!(envelope.kind(), EnvelopeKind::NormalMessage);
        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_prekey_message_roundtrip() {
        for otpk in [Some(42), None] {
            let envelope = sample(Some(initial(otpk)));
            assert_eq!(envelope.kind(), EnvelopeKind::PreKeyMessage);
            let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
            assert_eq!(parsed, envelope);
        }
    }

    #[test]
    fn test_empty_ciphertext_allowed() {
        let mut envelope = sample(None);
        envelope.message.sealed.ciphertext.clear();
        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert!(parsed.message.sealed.ciphertext.is_empty());
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = sample(Some(initial(Some(1)))).to_bytes().unwrap();
        let minimum = bytes.len() - b"ciphertext".len();
        for len in 0..minimum {
            assert_eq!(
                Envelope::from_bytes(&bytes[..len]).unwrap_err(),
                Error::InvalidEnvelope
            );
        }
    }

    #[test]
    fn test_bad_version_kind_and_flag() {
        let bytes = sample(Some(initial(None))).to_bytes().unwrap();

        let mut version = bytes.clone();
        version[0] = 9;
        assert_eq!(Envelope::from_bytes(&version).unwrap_err(), Error::InvalidEnvelope);

        let mut kind = bytes.clone();
        kind[1] = 0;
        assert_eq!(Envelope::from_bytes(&kind).unwrap_err(), Error::InvalidEnvelope);

        // version, kind, u16 len, "alice", u32 device, 64 key bytes, u32 spk id
        let flag_at = 2 + 2 + 5 + 4 + 64 + 4;
        let mut flag = bytes;
        flag[flag_at] = 7;
        assert_eq!(Envelope::from_bytes(&flag).unwrap_err(), Error::InvalidEnvelope);
    }

    #[test]
    fn test_invalid_utf8_sender() {
        let mut bytes = sample(None).to_bytes().unwrap();
        bytes[4] = 0xFF;
        assert_eq!(Envelope::from_bytes(&bytes).unwrap_err(), Error::InvalidEnvelope);
    }
}
