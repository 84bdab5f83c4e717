use std::fmt;

use model::{CHUNK_PIXELS, CHUNK_SIZE, ChunkKey, PALETTE_RESERVED_RAW, PaletteRef, Pixel};
use serde::{Deserialize, Serialize};

pub mod trace;

/// One pixel as it travels the wire: raw palette byte, validated on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePixel {
    pub x: i32,
    pub y: i32,
    pub color: u8,
}

impl WirePixel {
    pub fn from_pixel(pixel: Pixel) -> Self {
        Self {
            x: pixel.x,
            y: pixel.y,
            color: pixel.color.raw(),
        }
    }
}

/// Batch of pixels painted by another session, delivered by the network
/// channel for ingestion into the local log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePixelBatch {
    pub pixels: Vec<WirePixel>,
}

/// Locally produced pixels queued for broadcast. Undo/redo restoration
/// writes use the same shape as ordinary paints; the wire cannot tell them
/// apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundWrite {
    pub pixels: Vec<WirePixel>,
}

impl OutboundWrite {
    pub fn from_pixels(pixels: &[Pixel]) -> Self {
        Self {
            pixels: pixels.iter().copied().map(WirePixel::from_pixel).collect(),
        }
    }
}

/// Request for the committed pixels of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFetchRequest {
    pub origin_x: i32,
    pub origin_y: i32,
}

impl ChunkFetchRequest {
    pub fn from_key(key: ChunkKey) -> Self {
        Self {
            origin_x: key.origin_x(),
            origin_y: key.origin_y(),
        }
    }

    pub fn key(self) -> ChunkKey {
        ChunkKey::from_origin(self.origin_x, self.origin_y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayloadError {
    BodyLengthMismatch { expected: usize, actual: usize },
    InvalidColorReference { raw: u8 },
    Json(String),
}

impl fmt::Display for ChunkPayloadError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkPayloadError::BodyLengthMismatch { expected, actual } => {
                write!(
                    formatter,
                    "dense chunk body holds {actual} bytes, expected {expected}"
                )
            }
            ChunkPayloadError::InvalidColorReference { raw } => {
                write!(formatter, "invalid palette color reference {raw:#04x}")
            }
            ChunkPayloadError::Json(message) => {
                write!(formatter, "sparse chunk payload is not valid JSON: {message}")
            }
        }
    }
}

impl std::error::Error for ChunkPayloadError {}

/// Validate raw wire pixels into model pixels.
pub fn decode_wire_pixels(pixels: &[WirePixel]) -> Result<Vec<Pixel>, ChunkPayloadError> {
    pixels
        .iter()
        .map(|wire| {
            let color = PaletteRef::new(wire.color)
                .ok_or(ChunkPayloadError::InvalidColorReference { raw: wire.color })?;
            Ok(Pixel::new(wire.x, wire.y, color))
        })
        .collect()
}

/// Sparse chunk payload: a JSON array of wire pixels with absolute
/// coordinates.
pub fn decode_sparse_payload(body: &[u8]) -> Result<Vec<Pixel>, ChunkPayloadError> {
    let wire: Vec<WirePixel> = serde_json::from_slice(body)
        .map_err(|error| ChunkPayloadError::Json(error.to_string()))?;
    decode_wire_pixels(&wire)
}

/// Dense chunk payload: one byte per local offset in row-major order, with
/// the reserved byte marking coordinates the server never committed.
pub fn decode_dense_payload(key: ChunkKey, body: &[u8]) -> Result<Vec<Pixel>, ChunkPayloadError> {
    if body.len() != CHUNK_PIXELS {
        return Err(ChunkPayloadError::BodyLengthMismatch {
            expected: CHUNK_PIXELS,
            actual: body.len(),
        });
    }
    let mut pixels = Vec::new();
    for (local_index, &raw) in body.iter().enumerate() {
        if raw == PALETTE_RESERVED_RAW {
            continue;
        }
        let color = PaletteRef::new(raw)
            .ok_or(ChunkPayloadError::InvalidColorReference { raw })?;
        let local_x = (local_index as u32 % CHUNK_SIZE) as i32;
        let local_y = (local_index as u32 / CHUNK_SIZE) as i32;
        pixels.push(Pixel::new(
            key.origin_x() + local_x,
            key.origin_y() + local_y,
            color,
        ));
    }
    Ok(pixels)
}

/// Inverse of `decode_dense_payload`; pixels outside the chunk are ignored.
pub fn encode_dense_payload(key: ChunkKey, pixels: &[Pixel]) -> Vec<u8> {
    let mut body = vec![PALETTE_RESERVED_RAW; CHUNK_PIXELS];
    for pixel in pixels {
        if let Some(local_index) = key.local_index(pixel.x, pixel.y) {
            body[local_index] = pixel.color.raw();
        }
    }
    body
}
