// LN channel library implementing lightning network channel state machine
// and feature negotiation for the Lightning network protocol (LNP)
//
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::io;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde_with::{As, DisplayFromStr};

use amplify::hex::{self, FromHex};
use amplify::{DumbDefault, Slice32, Wrapper};
use bitcoin::hashes::Hash;
use bitcoin::Txid;
use lightning_encoding::{LightningDecode, LightningEncode};
use secp256k1::PublicKey;
use strict_encoding::{StrictDecode, StrictEncode};

/// Total length of the payment Sphinx package hop data
pub const PAYMENT_SPHINX_LEN: usize = 1300;

/// Lightning network channel id: 256-bit number representing funding txid
/// with the funding output number XORed into its last two bytes
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate", transparent)
)]
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From,
    StrictEncode,
    StrictDecode,
    LightningEncode,
    LightningDecode,
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex, UpperHex)]
pub struct ChannelId(
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    Slice32,
);

impl FromHex for ChannelId {
    fn from_byte_iter<I>(iter: I) -> Result<Self, hex::Error>
    where
        I: Iterator<Item = Result<u8, hex::Error>>
            + ExactSizeIterator
            + DoubleEndedIterator,
    {
        Ok(Self(Slice32::from_byte_iter(iter)?))
    }
}

impl ChannelId {
    /// Composes the channel id out of the funding transaction outpoint
    /// according to BOLT-2: the funding txid with the big-endian funding
    /// output index XORed into the last two bytes.
    pub fn with(funding_txid: Txid, funding_output_index: u16) -> ChannelId {
        let mut slice = funding_txid.into_inner();
        let vout = funding_output_index.to_be_bytes();
        slice[30] ^= vout[0];
        slice[31] ^= vout[1];
        ChannelId::from_inner(Slice32::from_inner(slice))
    }

    /// With some lightning messages (like error) channel id consisting of all
    /// zeros has a special meaning of "applicable to all opened channels".
    /// This function allows to detect this kind of [`ChannelId`]
    pub fn is_wildcard(&self) -> bool {
        self.to_inner().to_inner() == [0u8; 32]
    }
}

/// Lightning network temporary channel Id
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate", transparent)
)]
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    From,
    StrictEncode,
    StrictDecode,
    LightningEncode,
    LightningDecode,
)]
#[display(LowerHex)]
#[wrapper(FromStr, LowerHex, UpperHex)]
pub struct TempChannelId(
    #[cfg_attr(feature = "serde", serde(with = "As::<DisplayFromStr>"))]
    Slice32,
);

impl From<TempChannelId> for ChannelId {
    fn from(temp: TempChannelId) -> Self {
        Self(temp.into_inner())
    }
}

impl From<ChannelId> for TempChannelId {
    fn from(id: ChannelId) -> Self {
        Self(id.into_inner())
    }
}

impl FromHex for TempChannelId {
    fn from_byte_iter<I>(iter: I) -> Result<Self, hex::Error>
    where
        I: Iterator<Item = Result<u8, hex::Error>>
            + ExactSizeIterator
            + DoubleEndedIterator,
    {
        Ok(Self(Slice32::from_byte_iter(iter)?))
    }
}

impl TempChannelId {
    pub fn random() -> Self {
        TempChannelId::from_inner(Slice32::random())
    }
}

impl DumbDefault for TempChannelId {
    fn dumb_default() -> Self {
        Self(Default::default())
    }
}

/// Lightning network short channel Id as per BOLT-7
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    Getters,
)]
#[display("{block_height}x{tx_index}x{output_index}")]
pub struct ShortChannelId {
    #[getter(as_copy)]
    block_height: u32,
    #[getter(as_copy)]
    tx_index: u32,
    #[getter(as_copy)]
    output_index: u16,
}

impl ShortChannelId {
    /// Constructs short channel id out of its components. Returns `None` if
    /// block height or transaction index does not fit into 24 bits.
    pub fn new(
        block_height: u32,
        tx_index: u32,
        output_index: u16,
    ) -> Option<Self> {
        if block_height >= 1 << 24 || tx_index >= 1 << 24 {
            return None;
        }
        Some(Self {
            block_height,
            tx_index,
            output_index,
        })
    }
}

/// Errors parsing [`ShortChannelId`] from a string representation
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error,
)]
#[display(doc_comments)]
pub enum ShortChannelIdParseError {
    /// wrong block height data
    WrongBlockHeight,
    /// wrong transaction index number
    WrongTxIndex,
    /// wrong output index number
    WrongOutputIndex,
    /// too many short channel id components; expected three (block height,
    /// tx index and output index)
    ExcessiveComponents,
}

impl FromStr for ShortChannelId {
    type Err = ShortChannelIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.split('x');
        match (split.next(), split.next(), split.next(), split.next()) {
            (Some(block_height), Some(tx_index), Some(output_index), None) => {
                Ok(ShortChannelId {
                    block_height: block_height.parse().map_err(|_| {
                        ShortChannelIdParseError::WrongBlockHeight
                    })?,
                    tx_index: tx_index
                        .parse()
                        .map_err(|_| ShortChannelIdParseError::WrongTxIndex)?,
                    output_index: output_index.parse().map_err(|_| {
                        ShortChannelIdParseError::WrongOutputIndex
                    })?,
                })
            }
            _ => Err(ShortChannelIdParseError::ExcessiveComponents),
        }
    }
}

impl StrictEncode for ShortChannelId {
    fn strict_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, strict_encoding::Error> {
        let mut len = 0;

        let block_height: [u8; 3] = [
            (self.block_height >> 16 & 0xFF) as u8,
            (self.block_height >> 8 & 0xFF) as u8,
            (self.block_height & 0xFF) as u8,
        ];
        len += e.write(&block_height[..])?;

        let tx_index: [u8; 3] = [
            (self.tx_index >> 16 & 0xFF) as u8,
            (self.tx_index >> 8 & 0xFF) as u8,
            (self.tx_index & 0xFF) as u8,
        ];
        len += e.write(&tx_index[..])?;

        len += e.write(&self.output_index.to_be_bytes()[..])?;

        Ok(len)
    }
}

impl StrictDecode for ShortChannelId {
    fn strict_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, strict_encoding::Error> {
        let mut block_height_bytes = [0u8; 3];
        d.read_exact(&mut block_height_bytes[..])?;
        let block_height = ((block_height_bytes[0] as u32) << 16)
            + ((block_height_bytes[1] as u32) << 8)
            + (block_height_bytes[2] as u32);

        let mut tx_index_bytes = [0u8; 3];
        d.read_exact(&mut tx_index_bytes[..])?;
        let tx_index = ((tx_index_bytes[0] as u32) << 16)
            + ((tx_index_bytes[1] as u32) << 8)
            + (tx_index_bytes[2] as u32);

        let mut output_index = [0u8; 2];
        d.read_exact(&mut output_index[..])?;
        let output_index = u16::from_be_bytes(output_index);

        Ok(Self {
            block_height,
            tx_index,
            output_index,
        })
    }
}

impl lightning_encoding::Strategy for ShortChannelId {
    type Strategy = lightning_encoding::strategies::AsStrict;
}

/// Obfuscated Sphinx routing package with per-hop payment instructions.
///
/// The channel machine treats the package as opaque data: onion construction
/// and peeling belongs to the payment layer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct OnionPacket {
    /// Sphinx protocol version; the only defined version is 0
    pub version: u8,

    /// Ephemeral session public key
    pub public_key: PublicKey,

    /// Obfuscated per-hop data, [`PAYMENT_SPHINX_LEN`] bytes
    pub hop_data: Vec<u8>,

    /// HMAC committing to the payment hash of the enclosing HTLC
    pub hmac: Slice32,
}

impl DumbDefault for OnionPacket {
    fn dumb_default() -> Self {
        OnionPacket {
            version: 0,
            public_key: dumb_pubkey!(),
            hop_data: vec![0u8; PAYMENT_SPHINX_LEN],
            hmac: Slice32::default(),
        }
    }
}

impl OnionPacket {
    fn encode<E: io::Write>(&self, mut e: E) -> Result<usize, io::Error> {
        let mut len = e.write(&[self.version])?;
        len += e.write(&self.public_key.serialize())?;
        len += e.write(&self.hop_data)?;
        len += e.write(self.hmac.as_inner())?;
        Ok(len)
    }

    fn decode<D: io::Read>(mut d: D) -> Result<Self, io::Error> {
        let mut version = [0u8; 1];
        d.read_exact(&mut version)?;
        let mut key_buf = [0u8; 33];
        d.read_exact(&mut key_buf)?;
        let public_key = PublicKey::from_slice(&key_buf)
            .map_err(|_| io::ErrorKind::InvalidData)?;
        let mut hop_data = vec![0u8; PAYMENT_SPHINX_LEN];
        d.read_exact(&mut hop_data)?;
        let mut hmac = [0u8; 32];
        d.read_exact(&mut hmac)?;
        Ok(OnionPacket {
            version: version[0],
            public_key,
            hop_data,
            hmac: Slice32::from_inner(hmac),
        })
    }
}

impl LightningEncode for OnionPacket {
    #[inline]
    fn lightning_encode<E: io::Write>(
        &self,
        e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        self.encode(e).map_err(lightning_encoding::Error::from)
    }
}

impl LightningDecode for OnionPacket {
    #[inline]
    fn lightning_decode<D: io::Read>(
        d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        Self::decode(d).map_err(lightning_encoding::Error::from)
    }
}

impl StrictEncode for OnionPacket {
    #[inline]
    fn strict_encode<E: io::Write>(
        &self,
        e: E,
    ) -> Result<usize, strict_encoding::Error> {
        self.encode(e).map_err(strict_encoding::Error::from)
    }
}

impl StrictDecode for OnionPacket {
    #[inline]
    fn strict_decode<D: io::Read>(
        d: D,
    ) -> Result<Self, strict_encoding::Error> {
        Self::decode(d).map_err(strict_encoding::Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_id_from_outpoint() {
        let txid = Txid::from_slice(&[0x11u8; 32]).unwrap();

        let channel_id = ChannelId::with(txid, 0);
        assert_eq!(&channel_id.as_inner()[..], &[0x11u8; 32][..]);

        let channel_id = ChannelId::with(txid, 0x0304);
        let mut expected = [0x11u8; 32];
        expected[30] ^= 0x03;
        expected[31] ^= 0x04;
        assert_eq!(&channel_id.as_inner()[..], &expected[..]);
    }

    #[test]
    fn channel_id_wildcard() {
        let zero = ChannelId::default();
        assert!(zero.is_wildcard());
        let txid = Txid::from_slice(&[0x42u8; 32]).unwrap();
        assert!(!ChannelId::with(txid, 1).is_wildcard());
    }

    #[test]
    fn short_channel_id_str_round_trip() {
        let scid = ShortChannelId::new(600_000, 1024, 1).unwrap();
        assert_eq!(scid.to_string(), "600000x1024x1");
        assert_eq!(ShortChannelId::from_str("600000x1024x1"), Ok(scid));
        assert_eq!(ShortChannelId::new(1 << 24, 0, 0), None);
    }

    #[test]
    fn onion_packet_encoding_round_trip() {
        let onion = OnionPacket::dumb_default();
        let data = onion.lightning_serialize().unwrap();
        assert_eq!(data.len(), 1 + 33 + PAYMENT_SPHINX_LEN + 32);
        let decoded = OnionPacket::lightning_deserialize(&data).unwrap();
        assert_eq!(decoded, onion);
    }
}
