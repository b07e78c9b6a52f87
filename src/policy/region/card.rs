use crate::util::Address;

/// Default log2 of the card size in bytes.
pub const LOG_BYTES_IN_CARD: u8 = 9;
/// Default card size in bytes.
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;
/// Mask covering the in-card bits of an address.
pub const CARD_MASK: usize = BYTES_IN_CARD - 1;

const_assert!(BYTES_IN_CARD.is_power_of_two());
const_assert!(BYTES_IN_CARD <= super::region::BYTES_IN_REGION);

/// The state of a card, stored as one byte in the card table.
///
/// The byte values are emission-time configuration (`BarrierConfig` carries
/// them), not hard-coded into generated code.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum_macros::IntoStaticStr)]
pub enum CardState {
    /// The card covers young-generation memory. Young cards are never
    /// enqueued for refinement; the post-write barrier exits when it sees
    /// this value.
    Young = 0,
    /// The card has not been written to since the collector last scanned it.
    Clean = 1,
    /// The card has been written to and awaits refinement.
    Dirty = 2,
}

impl CardState {
    /// Decode a card byte. Any byte outside the enumerated set indicates
    /// card-table corruption.
    pub fn from_byte(byte: u8) -> CardState {
        match byte {
            0 => CardState::Young,
            1 => CardState::Clean,
            2 => CardState::Dirty,
            _ => panic!("invalid card state byte: {}", byte),
        }
    }
}

/// A card: a fixed-size, power-of-two aligned sub-region of the heap,
/// byte-tracked for "has this area been written to since the last scan".
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd)]
pub struct Card(Address);

impl Card {
    /// Align `address` down to the containing card boundary.
    pub fn align(address: Address) -> Address {
        address.align_down(BYTES_IN_CARD)
    }

    /// The card containing `address`.
    pub fn of(address: Address) -> Self {
        Self(Self::align(address))
    }

    /// The first address covered by this card.
    pub fn start(&self) -> Address {
        self.0
    }
}
