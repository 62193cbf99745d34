//! Binary state frame.
//!
//! Layout (little-endian):
//!
//! ```text
//! u8   tag (STATE_FRAME_TAG)
//! f32  map size
//! f32  agent radius
//! u16  entity count
//!      per entity: f32 x, f32 y, f32 angle, f32 mass, u16 foods, u8 flags
//! u16  collectible count
//!      per collectible: f32 x, f32 y
//! ```
//!
//! Flag byte: bit 0 alive, bit 1 externally controlled, bits 4-7 skin tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::Skin;

/// Leading byte of every state frame.
pub const STATE_FRAME_TAG: u8 = 0x01;
pub const HEADER_LEN: usize = 1 + 4 + 4 + 2;
pub const ENTITY_RECORD_LEN: usize = 4 * 4 + 2 + 1;
pub const FOOD_RECORD_LEN: usize = 4 * 2;

const FLAG_ALIVE: u8 = 0b0000_0001;
const FLAG_REMOTE: u8 = 0b0000_0010;
const TAG_SHIFT: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected message tag {0:#04x}")]
    UnexpectedTag(u8),
    #[error("frame truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("{kind} count {count} does not fit in u16")]
    CountOverflow { kind: &'static str, count: usize },
}

/// Per-entity flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityFlags {
    pub alive: bool,
    pub remote: bool,
    /// Raw 4-bit tag, 0 when the entity has no skin
    pub tag: u8,
}

impl EntityFlags {
    pub fn new(alive: bool, remote: bool, skin: Option<Skin>) -> Self {
        Self {
            alive,
            remote,
            tag: skin.map(|s| s as u8).unwrap_or(0),
        }
    }

    pub fn skin(&self) -> Option<Skin> {
        Skin::from_nibble(self.tag)
    }

    pub fn to_byte(self) -> u8 {
        let mut b = (self.tag & 0x0f) << TAG_SHIFT;
        if self.alive {
            b |= FLAG_ALIVE;
        }
        if self.remote {
            b |= FLAG_REMOTE;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            alive: b & FLAG_ALIVE != 0,
            remote: b & FLAG_REMOTE != 0,
            tag: b >> TAG_SHIFT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityRecord {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub mass: f32,
    pub foods: u16,
    pub flags: EntityFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FoodRecord {
    pub x: f32,
    pub y: f32,
}

/// Decoded (or to-be-encoded) snapshot of the arena.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateFrame {
    pub map_size: f32,
    pub agent_radius: f32,
    pub entities: Vec<EntityRecord>,
    pub foods: Vec<FoodRecord>,
}

fn count_u16(kind: &'static str, count: usize) -> Result<u16, CodecError> {
    u16::try_from(count).map_err(|_| CodecError::CountOverflow { kind, count })
}

/// Write the frame header. The caller must then write exactly
/// `entity_count` records with [`put_entity`] followed by [`put_foods`].
pub fn put_header(
    buf: &mut BytesMut,
    map_size: f32,
    agent_radius: f32,
    entity_count: usize,
) -> Result<(), CodecError> {
    let count = count_u16("entity", entity_count)?;
    buf.reserve(HEADER_LEN + entity_count * ENTITY_RECORD_LEN + 2);
    buf.put_u8(STATE_FRAME_TAG);
    buf.put_f32_le(map_size);
    buf.put_f32_le(agent_radius);
    buf.put_u16_le(count);
    Ok(())
}

pub fn put_entity(buf: &mut BytesMut, e: &EntityRecord) {
    buf.put_f32_le(e.x);
    buf.put_f32_le(e.y);
    buf.put_f32_le(e.angle);
    buf.put_f32_le(e.mass);
    buf.put_u16_le(e.foods);
    buf.put_u8(e.flags.to_byte());
}

pub fn put_foods<I>(buf: &mut BytesMut, foods: I) -> Result<(), CodecError>
where
    I: ExactSizeIterator<Item = FoodRecord>,
{
    let count = count_u16("collectible", foods.len())?;
    buf.reserve(2 + foods.len() * FOOD_RECORD_LEN);
    buf.put_u16_le(count);
    for f in foods {
        buf.put_f32_le(f.x);
        buf.put_f32_le(f.y);
    }
    Ok(())
}

/// True if the payload claims to be a state frame.
pub fn is_state_frame(payload: &[u8]) -> bool {
    payload.first() == Some(&STATE_FRAME_TAG)
}

fn need(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

impl StateFrame {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        // Check both counts before writing anything
        count_u16("collectible", self.foods.len())?;
        put_header(buf, self.map_size, self.agent_radius, self.entities.len())?;
        for e in &self.entities {
            put_entity(buf, e);
        }
        put_foods(buf, self.foods.iter().copied())
    }

    /// Decode a state frame. Frames with any other leading tag are rejected
    /// with [`CodecError::UnexpectedTag`] so that receivers can skip them.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut buf = payload;
        need(buf, HEADER_LEN)?;
        let tag = buf.get_u8();
        if tag != STATE_FRAME_TAG {
            return Err(CodecError::UnexpectedTag(tag));
        }
        let map_size = buf.get_f32_le();
        let agent_radius = buf.get_f32_le();
        let entity_count = buf.get_u16_le() as usize;

        need(buf, entity_count * ENTITY_RECORD_LEN + 2)?;
        let mut entities = Vec::with_capacity(entity_count);
        for _ in 0..entity_count {
            entities.push(EntityRecord {
                x: buf.get_f32_le(),
                y: buf.get_f32_le(),
                angle: buf.get_f32_le(),
                mass: buf.get_f32_le(),
                foods: buf.get_u16_le(),
                flags: EntityFlags::from_byte(buf.get_u8()),
            });
        }

        let food_count = buf.get_u16_le() as usize;
        need(buf, food_count * FOOD_RECORD_LEN)?;
        let mut foods = Vec::with_capacity(food_count);
        for _ in 0..food_count {
            foods.push(FoodRecord {
                x: buf.get_f32_le(),
                y: buf.get_f32_le(),
            });
        }

        Ok(Self {
            map_size,
            agent_radius,
            entities,
            foods,
        })
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.entities.len() * ENTITY_RECORD_LEN + 2 + self.foods.len() * FOOD_RECORD_LEN
    }
}
